//! Rows and their schemas.
//!
//! A [`Row`] is a fixed-length slice of [`Value`]s laid out according to a
//! shared [`Schema`]. Rows are validated once at construction; after that the
//! engine only moves them between queues and never inspects their contents,
//! except to extract partition keys.
//!
//! Rows are immutable. A node that wants a modified copy goes through
//! [`Row::to_values`] or [`Row::project`] and builds a new row.

pub mod schema;
pub mod value;

pub use schema::{FieldMeta, Schema};
pub use value::{Decimal, Value, ValueType};

use crate::error::{EngineError, Result};
use std::fmt;
use std::sync::Arc;

/// One record flowing through the pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    schema: Arc<Schema>,
    values: Box<[Value]>,
}

impl Row {
    /// Build a row, checking arity and value types against `schema`.
    pub fn new(schema: Arc<Schema>, values: Vec<Value>) -> Result<Self> {
        if values.len() != schema.len() {
            return Err(EngineError::Row(format!(
                "row has {} values but schema [{}] has {} fields",
                values.len(),
                schema,
                schema.len()
            )));
        }
        for (value, field) in values.iter().zip(schema.fields()) {
            if !value.fits(field.value_type) {
                return Err(EngineError::Row(format!(
                    "field '{}' is declared {} but holds {:?}",
                    field.name, field.value_type, value
                )));
            }
        }
        Ok(Self {
            schema,
            values: values.into_boxed_slice(),
        })
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.schema.index_of(name).and_then(|i| self.values.get(i))
    }

    /// Owned copy of the values, for building a modified row.
    pub fn to_values(&self) -> Vec<Value> {
        self.values.to_vec()
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values.into_vec()
    }

    /// Re-attach the values to `schema` (which must be structurally equal).
    ///
    /// Used when rows cross a process boundary and arrive with a freshly
    /// decoded schema instance.
    pub fn rebind(self, schema: Arc<Schema>) -> Result<Self> {
        if let Some(diff) = self.schema.diff(&schema) {
            return Err(EngineError::Row(format!("cannot rebind row: {}", diff)));
        }
        Ok(Self {
            schema,
            values: self.values,
        })
    }

    /// A new row holding only the fields at `indexes`, in that order.
    pub fn project(&self, schema: Arc<Schema>, indexes: &[usize]) -> Result<Self> {
        let values = indexes
            .iter()
            .map(|&i| {
                self.values
                    .get(i)
                    .cloned()
                    .ok_or_else(|| EngineError::Row(format!("no field at index {}", i)))
            })
            .collect::<Result<Vec<_>>>()?;
        Row::new(schema, values)
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, (field, value)) in self.schema.fields().iter().zip(self.values.iter()).enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", field.name, value)?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Arc<Schema> {
        Schema::shared(vec![
            FieldMeta::new("id", ValueType::Integer),
            FieldMeta::new("name", ValueType::String),
        ])
    }

    #[test]
    fn test_new_validates_arity() {
        let err = Row::new(schema(), vec![Value::Integer(1)]).unwrap_err();
        assert!(err.to_string().contains("1 values"));
    }

    #[test]
    fn test_new_validates_types() {
        let err = Row::new(schema(), vec![Value::from("x"), Value::from("y")]).unwrap_err();
        assert!(err.to_string().contains("'id'"));
    }

    #[test]
    fn test_nulls_accepted() {
        let row = Row::new(schema(), vec![Value::Null, Value::Null]).unwrap();
        assert!(row.get(0).unwrap().is_null());
    }

    #[test]
    fn test_get_by_name_and_display() {
        let row = Row::new(schema(), vec![Value::Integer(7), Value::from("seven")]).unwrap();
        assert_eq!(row.get_by_name("name"), Some(&Value::from("seven")));
        assert_eq!(row.to_string(), "[id=7, name=seven]");
    }

    #[test]
    fn test_project() {
        let row = Row::new(schema(), vec![Value::Integer(7), Value::from("seven")]).unwrap();
        let out = Schema::shared(vec![FieldMeta::new("name", ValueType::String)]);
        let projected = row.project(out, &[1]).unwrap();
        assert_eq!(projected.values(), &[Value::from("seven")]);
    }

    #[test]
    fn test_rebind_requires_equal_schema() {
        let row = Row::new(schema(), vec![Value::Integer(1), Value::Null]).unwrap();
        let copy = Arc::new((*schema()).clone());
        let rebound = row.clone().rebind(copy.clone()).unwrap();
        assert!(Arc::ptr_eq(rebound.schema(), &copy));

        let other = Schema::shared(vec![FieldMeta::new("id", ValueType::Integer)]);
        assert!(row.rebind(other).is_err());
    }
}
