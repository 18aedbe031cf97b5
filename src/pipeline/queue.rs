//! Bounded row sets.
//!
//! A [`RowQueue`] connects exactly one producer copy to exactly one consumer
//! copy. It is the only object two copy threads share, so it carries its own
//! lock; queues never lock each other, which keeps backpressure local to the
//! branches actually connected to a slow consumer.
//!
//! Two terminal signals exist:
//! - **done** (`close`): the producer finished normally. Buffered rows are
//!   still delivered, then `get` returns `None`.
//! - **aborted** (`abort`): the run is being torn down. Parked producers wake
//!   up with [`EngineError::QueueClosed`] instead of blocking forever.
//!
//! A consumer reading several queues hands each of them the same
//! [`ReadySignal`] and sleeps on that instead of on any single queue.

use crate::error::{EngineError, Result};
use crate::row::{Row, Schema};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// Change counter shared by the input queues of one consumer copy.
///
/// Bumped whenever one of them gains a row, a schema or a terminal signal.
#[derive(Default)]
pub struct ReadySignal {
    generation: Mutex<u64>,
    changed: Condvar,
}

impl ReadySignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    pub fn notify(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        drop(generation);
        self.changed.notify_all();
    }

    /// Wait until the counter moves past `seen`, at most `timeout`.
    ///
    /// Returns whether it moved.
    pub fn wait_past(&self, seen: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut generation = self.generation.lock();
        while *generation == seen {
            if self.changed.wait_until(&mut generation, deadline).timed_out() {
                return *generation != seen;
            }
        }
        true
    }
}

/// Outcome of a bounded wait on a queue
#[derive(Debug)]
pub enum Poll {
    /// A row was taken.
    Row(Row),
    /// Nothing arrived within the wait; the producer may still send.
    Empty,
    /// All rows were drained and the producer is done.
    Done,
}

struct QueueState {
    rows: VecDeque<Row>,
    schema: Option<Arc<Schema>>,
    done: bool,
    aborted: bool,
}

/// Bounded single-producer/single-consumer channel of rows
pub struct RowQueue {
    name: String,
    capacity: usize,
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
    ready: OnceLock<Arc<ReadySignal>>,
}

impl RowQueue {
    /// Create a queue. A zero capacity is treated as one.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: name.into(),
            capacity,
            state: Mutex::new(QueueState {
                rows: VecDeque::with_capacity(capacity.min(4096)),
                schema: None,
                done: false,
                aborted: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            ready: OnceLock::new(),
        }
    }

    /// Also bump `signal` on every change a consumer cares about. Only the
    /// first signal registered is kept.
    pub fn watch(&self, signal: Arc<ReadySignal>) {
        let _ = self.ready.set(signal);
    }

    fn wake_consumer(&self) {
        self.not_empty.notify_all();
        if let Some(ready) = self.ready.get() {
            ready.notify();
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Rows currently buffered.
    pub fn size(&self) -> usize {
        self.state.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Whether the producer signalled end-of-stream.
    pub fn is_done(&self) -> bool {
        self.state.lock().done
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    /// Schema fixed on this queue, if any row or schema has been put yet.
    pub fn schema(&self) -> Option<Arc<Schema>> {
        self.state.lock().schema.clone()
    }

    /// Fix the queue schema ahead of the first row.
    ///
    /// Setting an equal schema twice is allowed; a different one is a
    /// contract violation.
    pub fn set_schema(&self, schema: Arc<Schema>) -> Result<()> {
        let mut state = self.state.lock();
        self.check_schema(&mut state, &schema)?;
        drop(state);
        self.wake_consumer();
        Ok(())
    }

    /// Block until the producer has fixed the schema.
    ///
    /// Returns `None` if the queue is closed or aborted before that happens.
    pub fn wait_schema(&self) -> Option<Arc<Schema>> {
        let mut state = self.state.lock();
        loop {
            if let Some(schema) = &state.schema {
                return Some(schema.clone());
            }
            if state.done || state.aborted {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Block until there is room, then append `row`.
    pub fn put(&self, row: Row) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            if state.aborted || state.done {
                return Err(self.closed());
            }
            if state.rows.len() < self.capacity {
                break;
            }
            self.not_full.wait(&mut state);
        }
        self.push(state, row)
    }

    /// Append `row` without blocking. A full queue hands the row back.
    pub fn try_put(&self, row: Row) -> Result<Option<Row>> {
        let state = self.state.lock();
        if state.aborted || state.done {
            return Err(self.closed());
        }
        if state.rows.len() >= self.capacity {
            return Ok(Some(row));
        }
        self.push(state, row).map(|_| None)
    }

    /// Block until a row is available; `None` once drained and done.
    pub fn get(&self) -> Option<Row> {
        let mut state = self.state.lock();
        loop {
            if let Some(row) = state.rows.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(row);
            }
            if state.done || state.aborted {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Like [`RowQueue::get`] but gives up after `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Poll {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(row) = state.rows.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Poll::Row(row);
            }
            if state.done || state.aborted {
                return Poll::Done;
            }
            if self.not_empty.wait_until(&mut state, deadline).timed_out() {
                return match state.rows.pop_front() {
                    Some(row) => {
                        drop(state);
                        self.not_full.notify_one();
                        Poll::Row(row)
                    }
                    None if state.done || state.aborted => Poll::Done,
                    None => Poll::Empty,
                };
            }
        }
    }

    /// Producer end-of-stream. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.done {
            return;
        }
        state.done = true;
        drop(state);
        tracing::trace!(queue = %self.name, "queue closed");
        self.wake_consumer();
        self.not_full.notify_all();
    }

    /// Error-stop: refuse further puts and wake every waiter. Idempotent.
    pub fn abort(&self) {
        let mut state = self.state.lock();
        if state.aborted {
            return;
        }
        state.aborted = true;
        drop(state);
        tracing::trace!(queue = %self.name, "queue aborted");
        self.wake_consumer();
        self.not_full.notify_all();
    }

    fn push(&self, mut state: MutexGuard<'_, QueueState>, row: Row) -> Result<()> {
        self.check_schema(&mut state, row.schema())?;
        state.rows.push_back(row);
        drop(state);
        self.not_empty.notify_one();
        if let Some(ready) = self.ready.get() {
            ready.notify();
        }
        Ok(())
    }

    fn check_schema(&self, state: &mut QueueState, schema: &Arc<Schema>) -> Result<()> {
        match &state.schema {
            Some(current) if Arc::ptr_eq(current, schema) => Ok(()),
            Some(current) => match current.diff(schema) {
                None => Ok(()),
                Some(diff) => Err(EngineError::SchemaMismatch {
                    queue: self.name.clone(),
                    message: diff,
                }),
            },
            None => {
                state.schema = Some(schema.clone());
                Ok(())
            }
        }
    }

    fn closed(&self) -> EngineError {
        EngineError::QueueClosed {
            queue: self.name.clone(),
        }
    }
}

impl fmt::Debug for RowQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RowQueue")
            .field("name", &self.name)
            .field("size", &state.rows.len())
            .field("capacity", &self.capacity)
            .field("done", &state.done)
            .field("aborted", &state.aborted)
            .finish()
    }
}

impl fmt::Display for RowQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{FieldMeta, Value, ValueType};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn schema() -> Arc<Schema> {
        Schema::shared(vec![FieldMeta::new("n", ValueType::Integer)])
    }

    fn row(schema: &Arc<Schema>, n: i64) -> Row {
        Row::new(schema.clone(), vec![Value::Integer(n)]).unwrap()
    }

    #[test]
    fn test_put_blocks_when_full_until_get() {
        let s = schema();
        let queue = Arc::new(RowQueue::new("a.0 - b.0", 2));
        queue.put(row(&s, 1)).unwrap();
        queue.put(row(&s, 2)).unwrap();

        let unblocked = Arc::new(AtomicBool::new(false));
        let producer = {
            let queue = queue.clone();
            let unblocked = unblocked.clone();
            let s = s.clone();
            thread::spawn(move || {
                queue.put(row(&s, 3)).unwrap();
                unblocked.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!unblocked.load(Ordering::SeqCst), "third put must block");
        assert_eq!(queue.size(), 2);

        assert_eq!(queue.get().unwrap().values()[0], Value::Integer(1));
        producer.join().unwrap();
        assert!(unblocked.load(Ordering::SeqCst));
        assert_eq!(queue.size(), 2);
    }

    #[test]
    fn test_close_drains_buffer_first() {
        let s = schema();
        let queue = RowQueue::new("q", 10);
        for n in 0..3 {
            queue.put(row(&s, n)).unwrap();
        }
        queue.close();
        let drained: Vec<_> = std::iter::from_fn(|| queue.get()).collect();
        assert_eq!(drained.len(), 3);
        assert!(queue.get().is_none());
    }

    #[test]
    fn test_put_after_close_fails() {
        let s = schema();
        let queue = RowQueue::new("q", 10);
        queue.close();
        queue.close();
        assert!(matches!(
            queue.put(row(&s, 1)),
            Err(EngineError::QueueClosed { .. })
        ));
    }

    #[test]
    fn test_abort_wakes_blocked_producer() {
        let s = schema();
        let queue = Arc::new(RowQueue::new("q", 1));
        queue.put(row(&s, 1)).unwrap();

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.put(row(&s, 2)))
        };
        thread::sleep(Duration::from_millis(20));
        queue.abort();
        let result = producer.join().unwrap();
        assert!(matches!(result, Err(EngineError::QueueClosed { .. })));
    }

    #[test]
    fn test_close_wakes_blocked_consumer() {
        let queue = Arc::new(RowQueue::new("q", 4));
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.get())
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert!(consumer.join().unwrap().is_none());
    }

    #[test]
    fn test_schema_mismatch_rejected() {
        let s = schema();
        let other = Schema::shared(vec![FieldMeta::new("n", ValueType::String)]);
        let queue = RowQueue::new("q", 4);
        queue.put(row(&s, 1)).unwrap();

        let bad = Row::new(other, vec![Value::from("x")]).unwrap();
        assert!(matches!(
            queue.put(bad),
            Err(EngineError::SchemaMismatch { .. })
        ));

        // structurally equal schema instances are accepted
        let twin = Arc::new((*s).clone());
        queue.put(row(&twin, 2)).unwrap();
    }

    #[test]
    fn test_try_put_returns_row_when_full() {
        let s = schema();
        let queue = RowQueue::new("q", 1);
        assert!(queue.try_put(row(&s, 1)).unwrap().is_none());
        let back = queue.try_put(row(&s, 2)).unwrap();
        assert_eq!(back.unwrap().values()[0], Value::Integer(2));
    }

    #[test]
    fn test_wait_schema() {
        let queue = Arc::new(RowQueue::new("q", 4));
        let waiter = {
            let queue = queue.clone();
            thread::spawn(move || queue.wait_schema())
        };
        queue.set_schema(schema()).unwrap();
        assert_eq!(waiter.join().unwrap().map(|s| s.len()), Some(1));

        let aborted = Arc::new(RowQueue::new("r", 4));
        let waiter = {
            let aborted = aborted.clone();
            thread::spawn(move || aborted.wait_schema())
        };
        aborted.abort();
        assert!(waiter.join().unwrap().is_none());
    }

    #[test]
    fn test_get_timeout() {
        let s = schema();
        let queue = RowQueue::new("q", 1);
        assert!(matches!(
            queue.get_timeout(Duration::from_millis(5)),
            Poll::Empty
        ));
        queue.put(row(&s, 1)).unwrap();
        assert!(matches!(
            queue.get_timeout(Duration::from_millis(5)),
            Poll::Row(_)
        ));
        queue.close();
        assert!(matches!(
            queue.get_timeout(Duration::from_millis(5)),
            Poll::Done
        ));
    }

    #[test]
    fn test_ready_signal_wakes_on_any_watched_queue() {
        let s = schema();
        let signal = Arc::new(ReadySignal::new());
        let left = Arc::new(RowQueue::new("left", 4));
        let right = Arc::new(RowQueue::new("right", 4));
        left.watch(signal.clone());
        right.watch(signal.clone());

        let seen = signal.generation();
        assert!(!signal.wait_past(seen, Duration::from_millis(5)));

        let waiter = {
            let signal = signal.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let moved = signal.wait_past(seen, Duration::from_secs(5));
                (moved, started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(20));
        right.put(row(&s, 1)).unwrap();
        let (moved, waited) = waiter.join().unwrap();
        assert!(moved);
        assert!(waited < Duration::from_secs(1));

        let seen = signal.generation();
        left.close();
        assert!(signal.wait_past(seen, Duration::ZERO));
    }

    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn test_fifo_for_any_capacity(
            values in prop::collection::vec(any::<i64>(), 0..300),
            capacity in 1usize..16,
            consumer_pause in 0u64..3,
        ) {
            let s = schema();
            let queue = Arc::new(RowQueue::new("fifo", capacity));
            let producer = {
                let queue = queue.clone();
                let values = values.clone();
                thread::spawn(move || {
                    for v in values {
                        queue.put(row(&s, v)).unwrap();
                    }
                    queue.close();
                })
            };

            let mut received = Vec::new();
            while let Some(r) = queue.get() {
                if consumer_pause > 0 && received.len() % 50 == 0 {
                    thread::sleep(Duration::from_micros(consumer_pause * 100));
                }
                received.push(r.values()[0].as_i64().unwrap());
            }
            producer.join().unwrap();
            prop_assert_eq!(received, values);
        }
    }
}
