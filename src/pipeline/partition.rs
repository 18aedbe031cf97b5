//! Partitioning and output routing.
//!
//! A [`PartitionScheme`] decides which copy of a partitioned node receives a
//! row. Hash and range routing are pure functions of (scheme, key values), so
//! a key always lands on the same copy within a run, which is what stateful
//! per-key nodes rely on when they run in parallel.
//!
//! # Hashing
//!
//! A key consisting of a single integer field is routed by remainder
//! (`key.rem_euclid(partitions)`). Every other key is hashed with 64-bit
//! FNV-1a over the canonical byte form of its values ([`Value::key_bytes`])
//! and reduced modulo the partition count. FNV has no per-process seed, so
//! the mapping is also stable across hosts of a cluster.
//!
//! [`OutputRouter`] is owned by one producing copy and turns a row into the
//! set of output queues that must receive it, combining partitioning with
//! the node's [`Distribution`] for unpartitioned targets.

use crate::error::{EngineError, Result};
use crate::pipeline::id::NodeId;
use crate::pipeline::queue::RowQueue;
use crate::row::{Row, Value};
use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::hash::Hasher;
use std::sync::Arc;

/// How a scheme maps rows to partitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PartitionMethod {
    /// Remainder of a stable hash of the key fields.
    Hash { keys: Vec<String> },
    /// Explicit ascending bounds: partition `i` takes keys below `bounds[i]`,
    /// the last partition takes everything else.
    Range { key: String, bounds: Vec<Value> },
    /// Keyless even spreading.
    RoundRobin,
    /// Every partition receives every row.
    Mirror,
}

/// Named set of partitions plus a routing method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionScheme {
    pub id: String,
    pub partition_ids: Vec<String>,
    pub method: PartitionMethod,
}

impl PartitionScheme {
    pub fn new(id: impl Into<String>, partitions: usize, method: PartitionMethod) -> Self {
        let id = id.into();
        let partition_ids = (0..partitions).map(|i| format!("P{}", i)).collect();
        Self {
            id,
            partition_ids,
            method,
        }
    }

    pub fn partition_count(&self) -> usize {
        self.partition_ids.len()
    }

    /// Check the scheme is usable on its own.
    pub fn validate(&self) -> Result<()> {
        if self.partition_ids.is_empty() {
            return Err(EngineError::InvalidGraph(format!(
                "partition scheme '{}' has no partitions",
                self.id
            )));
        }
        match &self.method {
            PartitionMethod::Hash { keys } if keys.is_empty() => {
                Err(EngineError::InvalidGraph(format!(
                    "hash partition scheme '{}' needs at least one key field",
                    self.id
                )))
            }
            PartitionMethod::Range { bounds, .. } => {
                if bounds.len() + 1 != self.partition_count() {
                    return Err(EngineError::InvalidGraph(format!(
                        "range partition scheme '{}' needs {} bounds, has {}",
                        self.id,
                        self.partition_count() - 1,
                        bounds.len()
                    )));
                }
                let ascending = bounds
                    .windows(2)
                    .all(|w| w[0].compare(&w[1]) == Some(Ordering::Less));
                if !ascending {
                    return Err(EngineError::InvalidGraph(format!(
                        "range partition scheme '{}' bounds must be strictly ascending",
                        self.id
                    )));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Key field names this scheme reads.
    pub fn key_fields(&self) -> Vec<&str> {
        match &self.method {
            PartitionMethod::Hash { keys } => keys.iter().map(String::as_str).collect(),
            PartitionMethod::Range { key, .. } => vec![key.as_str()],
            PartitionMethod::RoundRobin | PartitionMethod::Mirror => Vec::new(),
        }
    }

    /// Whether routing depends only on the row.
    pub fn is_keyed(&self) -> bool {
        matches!(
            self.method,
            PartitionMethod::Hash { .. } | PartitionMethod::Range { .. }
        )
    }

    /// Partition for `row` under a keyed method.
    ///
    /// Round-robin and mirror are not functions of the row; they are handled
    /// by [`OutputRouter`] and rejected here.
    pub fn partition_for(&self, row: &Row) -> Result<usize> {
        let indexes = self
            .key_fields()
            .into_iter()
            .map(|name| row.schema().require(name))
            .collect::<Result<Vec<_>>>()?;
        self.partition_with(&indexes, row)
    }

    fn partition_with(&self, key_indexes: &[usize], row: &Row) -> Result<usize> {
        let partitions = self.partition_count();
        match &self.method {
            PartitionMethod::Hash { .. } => {
                if let [single] = key_indexes {
                    if let Some(Value::Integer(v)) = row.get(*single) {
                        return Ok(v.rem_euclid(partitions as i64) as usize);
                    }
                }
                let mut bytes = Vec::with_capacity(32);
                for &i in key_indexes {
                    row.get(i)
                        .ok_or_else(|| EngineError::Partition(format!("no key at index {}", i)))?
                        .key_bytes(&mut bytes);
                }
                let mut hasher = FnvHasher::default();
                hasher.write(&bytes);
                Ok((hasher.finish() % partitions as u64) as usize)
            }
            PartitionMethod::Range { bounds, .. } => {
                let key = key_indexes
                    .first()
                    .and_then(|&i| row.get(i))
                    .ok_or_else(|| EngineError::Partition("range key missing".into()))?;
                for (i, bound) in bounds.iter().enumerate() {
                    match key.compare(bound) {
                        Some(Ordering::Less) => return Ok(i),
                        Some(_) => {}
                        None => {
                            return Err(EngineError::Partition(format!(
                                "key {:?} is not comparable with range bound {:?}",
                                key, bound
                            )))
                        }
                    }
                }
                Ok(partitions - 1)
            }
            PartitionMethod::RoundRobin | PartitionMethod::Mirror => Err(EngineError::Partition(
                format!("scheme '{}' does not route by key", self.id),
            )),
        }
    }
}

/// How an unpartitioned node spreads rows over several outputs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distribution {
    /// Each row goes to exactly one output queue, cycling through them.
    #[default]
    RoundRobin,
    /// Each row goes to every target node (one copy per target).
    CopyToAll,
}

/// Which queues of a group receive a row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    One(usize),
    All,
}

enum GroupMode {
    /// Target is unpartitioned: follow the source's distribution.
    Unpartitioned,
    /// Target is partitioned: route by its scheme.
    Partitioned {
        scheme: Arc<PartitionScheme>,
        key_indexes: Option<Vec<usize>>,
    },
}

/// Output queues towards one target node, indexed by target copy (or by
/// partition, which is the same thing for partitioned targets).
pub struct OutputGroup {
    target: NodeId,
    target_name: String,
    queues: Vec<Arc<RowQueue>>,
    mode: GroupMode,
    next: usize,
}

impl OutputGroup {
    pub fn new(target: NodeId, target_name: impl Into<String>, queues: Vec<Arc<RowQueue>>) -> Self {
        Self {
            target,
            target_name: target_name.into(),
            queues,
            mode: GroupMode::Unpartitioned,
            next: 0,
        }
    }

    /// Route by `scheme` instead of the source distribution.
    ///
    /// A group with a single queue (an aligned partition-to-partition edge)
    /// never needs the scheme.
    pub fn partitioned(mut self, scheme: Arc<PartitionScheme>) -> Self {
        if self.queues.len() > 1 {
            self.mode = GroupMode::Partitioned {
                scheme,
                key_indexes: None,
            };
        }
        self
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    pub fn queues(&self) -> &[Arc<RowQueue>] {
        &self.queues
    }

    fn next_round_robin(&mut self) -> usize {
        let index = self.next;
        self.next = (self.next + 1) % self.queues.len();
        index
    }

    /// Target within this group for `row`.
    pub fn route(&mut self, row: &Row) -> Result<Target> {
        if self.queues.len() == 1 {
            return Ok(Target::One(0));
        }
        let GroupMode::Partitioned {
            scheme,
            key_indexes,
        } = &mut self.mode
        else {
            return Ok(Target::One(self.next_round_robin()));
        };
        match scheme.method {
            PartitionMethod::Mirror => Ok(Target::All),
            PartitionMethod::RoundRobin => Ok(Target::One(self.next_round_robin())),
            _ => {
                if key_indexes.is_none() {
                    let resolved = scheme
                        .key_fields()
                        .into_iter()
                        .map(|name| row.schema().require(name))
                        .collect::<Result<Vec<_>>>()?;
                    *key_indexes = Some(resolved);
                }
                let indexes = key_indexes.as_deref().unwrap_or_default();
                let partition = scheme.partition_with(indexes, row)?;
                if partition >= self.queues.len() {
                    return Err(EngineError::Partition(format!(
                        "partition {} out of range for '{}' with {} copies",
                        partition,
                        self.target_name,
                        self.queues.len()
                    )));
                }
                Ok(Target::One(partition))
            }
        }
    }

    fn is_partitioned(&self) -> bool {
        matches!(self.mode, GroupMode::Partitioned { .. })
    }
}

/// Per-copy router over every output group of a node copy.
///
/// Round-robin counters live here, one set per producing copy, so parallel
/// producers never contend on a shared counter.
pub struct OutputRouter {
    groups: Vec<OutputGroup>,
    distribution: Distribution,
    /// Cursor over (group, queue) pairs for round-robin distribution.
    cursor: usize,
}

/// Queue selections for one row: `(group index, queue index)`.
pub type Deliveries = Vec<(usize, usize)>;

impl OutputRouter {
    pub fn new(groups: Vec<OutputGroup>, distribution: Distribution) -> Self {
        Self {
            groups,
            distribution,
            cursor: 0,
        }
    }

    pub fn groups(&self) -> &[OutputGroup] {
        &self.groups
    }

    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(|g| g.queues.is_empty())
    }

    /// Every output queue this copy owns.
    pub fn all_queues(&self) -> impl Iterator<Item = &Arc<RowQueue>> {
        self.groups.iter().flat_map(|g| g.queues.iter())
    }

    pub fn queue(&self, group: usize, index: usize) -> Option<&Arc<RowQueue>> {
        self.groups.get(group).and_then(|g| g.queues.get(index))
    }

    pub fn group_for(&self, target: NodeId) -> Option<usize> {
        self.groups.iter().position(|g| g.target == target)
    }

    /// Decide the queues that receive `row`.
    ///
    /// Partitioned targets always receive the row in their partition.
    /// Unpartitioned targets follow the distribution: round-robin picks a
    /// single queue across all of them, copy-to-all picks one queue per
    /// target node.
    pub fn route(&mut self, row: &Row) -> Result<Deliveries> {
        let mut out = Vec::new();
        let mut unpartitioned = 0usize;
        for (gi, group) in self.groups.iter_mut().enumerate() {
            if group.queues.is_empty() {
                continue;
            }
            if group.is_partitioned() {
                push_target(&mut out, gi, group.route(row)?, group.queues.len());
            } else {
                unpartitioned += group.queues.len();
                if self.distribution == Distribution::CopyToAll {
                    push_target(&mut out, gi, group.route(row)?, group.queues.len());
                }
            }
        }

        if self.distribution == Distribution::RoundRobin && unpartitioned > 0 {
            let mut slot = self.cursor % unpartitioned;
            self.cursor = (self.cursor + 1) % unpartitioned;
            for (gi, group) in self.groups.iter().enumerate() {
                if group.is_partitioned() {
                    continue;
                }
                if slot < group.queues.len() {
                    out.push((gi, slot));
                    break;
                }
                slot -= group.queues.len();
            }
        }
        Ok(out)
    }

    /// Decide the queue within one target's group (used by `write_to`).
    pub fn route_to(&mut self, group: usize, row: &Row) -> Result<Deliveries> {
        let g = self
            .groups
            .get_mut(group)
            .ok_or_else(|| EngineError::Partition(format!("no output group {}", group)))?;
        let mut out = Vec::new();
        let len = g.queues.len();
        push_target(&mut out, group, g.route(row)?, len);
        Ok(out)
    }
}

fn push_target(out: &mut Deliveries, group: usize, target: Target, len: usize) {
    match target {
        Target::One(i) => out.push((group, i)),
        Target::All => out.extend((0..len).map(|i| (group, i))),
    }
}
