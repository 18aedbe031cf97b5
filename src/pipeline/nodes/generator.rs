//! GeneratorNode: source of synthetic rows.
//!
//! Settings:
//!
//! | key          | default            | meaning                                      |
//! |--------------|--------------------|----------------------------------------------|
//! | `rows`       | 10                 | rows emitted per copy                        |
//! | `fields`     | `["id:integer"]`   | `name:type` list; types match `ValueType`    |
//! | `start`      | 0                  | counter value of the first row               |
//! | `cycle`      | 0                  | when > 0, the counter wraps after this many  |
//! | `null_every` | 0                  | when > 0, every n-th row is null past field 0|
//! | `delay_ms`   | 0                  | pause before each row                        |
//!
//! Every field of row `i` is derived from the counter `k` (`start + i`,
//! wrapped by `cycle`), so two generators with the same settings produce the
//! same rows.

use crate::error::{EngineError, Result};
use crate::pipeline::node::{Flow, InitContext, NodeImpl, RowIo};
use crate::row::{Decimal, FieldMeta, Row, Schema, Value, ValueType};
use chrono::DateTime;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
pub struct GeneratorNode {
    schema: Option<Arc<Schema>>,
    rows: u64,
    emitted: u64,
    start: i64,
    cycle: u64,
    null_every: u64,
    delay: Duration,
}

impl GeneratorNode {
    fn counter(&self) -> i64 {
        let i = if self.cycle > 0 {
            self.emitted % self.cycle
        } else {
            self.emitted
        };
        self.start.wrapping_add(i as i64)
    }

    fn next_row(&self, schema: &Arc<Schema>) -> Result<Row> {
        let k = self.counter();
        let nulls = self.null_every > 0 && (self.emitted + 1) % self.null_every == 0;
        let values = schema
            .fields()
            .iter()
            .enumerate()
            .map(|(i, field)| {
                if nulls && i > 0 {
                    Ok(Value::Null)
                } else {
                    value_for(field.value_type, k)
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Row::new(schema.clone(), values)
    }
}

/// Deterministic value of type `ty` for counter `k`.
pub fn value_for(ty: ValueType, k: i64) -> Result<Value> {
    Ok(match ty {
        ValueType::Integer => Value::Integer(k),
        ValueType::String => Value::String(format!("row-{}", k)),
        ValueType::Number => Value::Number(k as f64 * 0.5),
        ValueType::Decimal => Value::Decimal(Decimal::new(k as i128 * 100 + 25, 2)),
        ValueType::Boolean => Value::Boolean(k % 2 == 0),
        ValueType::Date => {
            let date = DateTime::from_timestamp(1_600_000_000 + k, 0)
                .ok_or_else(|| EngineError::Row(format!("no date for counter {}", k)))?;
            Value::Date(date)
        }
        ValueType::Binary => Value::Binary(k.to_be_bytes().to_vec()),
    })
}

/// Parse a `name:type` field spec.
fn parse_field(spec: &str) -> Option<FieldMeta> {
    let (name, ty) = spec.split_once(':')?;
    let ty = ValueType::all()
        .iter()
        .copied()
        .find(|t| t.name().eq_ignore_ascii_case(ty.trim()))?;
    let field = FieldMeta::new(name.trim(), ty);
    Some(match ty {
        ValueType::Decimal => field.with_precision(2),
        _ => field,
    })
}

impl NodeImpl for GeneratorNode {
    fn init(&mut self, ctx: &InitContext<'_>) -> Result<Option<Arc<Schema>>> {
        let config = ctx.config;
        self.rows = config.count_or("rows", 10)?;
        self.start = config.int("start").unwrap_or(0);
        self.cycle = config.count_or("cycle", 0)?;
        self.null_every = config.count_or("null_every", 0)?;
        self.delay = Duration::from_millis(config.count_or("delay_ms", 0)?);

        let fields = match config.get("fields").and_then(|v| v.as_list()) {
            None => vec![FieldMeta::new("id", ValueType::Integer)],
            Some(list) => list
                .iter()
                .map(|v| {
                    v.as_str()
                        .and_then(parse_field)
                        .ok_or_else(|| ctx.error(format!("bad field spec {:?}", v)))
                })
                .collect::<Result<Vec<_>>>()?,
        };
        if fields.is_empty() {
            return Err(ctx.error("generator needs at least one field"));
        }

        let schema = Schema::shared(fields);
        self.schema = Some(schema.clone());
        Ok(Some(schema))
    }

    fn process_one(&mut self, io: &mut RowIo) -> Result<Flow> {
        if self.emitted >= self.rows {
            return Ok(Flow::Done);
        }
        let schema = self
            .schema
            .clone()
            .ok_or_else(|| EngineError::Row("generator used before init".into()))?;
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let row = self.next_row(&schema)?;
        io.write(row)?;
        self.emitted += 1;
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_field() {
        let field = parse_field("amount:decimal").unwrap();
        assert_eq!(field.name, "amount");
        assert_eq!(field.value_type, ValueType::Decimal);
        assert_eq!(field.precision, 2);
        assert_eq!(parse_field("id: Integer").unwrap().value_type, ValueType::Integer);
        assert!(parse_field("id").is_none());
        assert!(parse_field("id:blob").is_none());
    }

    #[test]
    fn test_values_fit_their_type() {
        for &ty in ValueType::all() {
            assert!(value_for(ty, 7).unwrap().fits(ty), "{ty}");
        }
        assert_eq!(value_for(ValueType::String, 3).unwrap(), Value::from("row-3"));
    }

    #[test]
    fn test_counter_and_nulls() {
        let schema = Schema::shared(vec![
            FieldMeta::new("id", ValueType::Integer),
            FieldMeta::new("name", ValueType::String),
        ]);
        let mut node = GeneratorNode {
            start: 10,
            cycle: 3,
            null_every: 2,
            ..Default::default()
        };
        let mut ids = Vec::new();
        for _ in 0..4 {
            let row = node.next_row(&schema).unwrap();
            ids.push(row.get(0).and_then(Value::as_i64).unwrap());
            assert_eq!(row.get(1).unwrap().is_null(), (node.emitted + 1) % 2 == 0);
            node.emitted += 1;
        }
        assert_eq!(ids, vec![10, 11, 12, 10]);
    }
}
