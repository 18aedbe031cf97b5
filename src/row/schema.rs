//! Row layout descriptors.

use crate::error::{EngineError, Result};
use crate::row::value::ValueType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Descriptor for one position of a row
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldMeta {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    /// Maximum length, -1 when unspecified.
    #[serde(default = "unspecified")]
    pub length: i32,
    /// Precision (digits after the point), -1 when unspecified.
    #[serde(default = "unspecified")]
    pub precision: i32,
}

fn unspecified() -> i32 {
    -1
}

impl FieldMeta {
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
            length: -1,
            precision: -1,
        }
    }

    pub fn with_length(mut self, length: i32) -> Self {
        self.length = length;
        self
    }

    pub fn with_precision(mut self, precision: i32) -> Self {
        self.precision = precision;
        self
    }
}

impl fmt::Display for FieldMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.value_type)?;
        match (self.length, self.precision) {
            (l, p) if l >= 0 && p >= 0 => write!(f, "({}, {})", l, p),
            (l, _) if l >= 0 => write!(f, "({})", l),
            _ => Ok(()),
        }
    }
}

/// Ordered list of field descriptors shared by every row on a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    fields: Vec<FieldMeta>,
}

impl Schema {
    pub fn new(fields: Vec<FieldMeta>) -> Self {
        Self { fields }
    }

    /// Convenience for the common case of building a shared schema.
    pub fn shared(fields: Vec<FieldMeta>) -> Arc<Self> {
        Arc::new(Self::new(fields))
    }

    pub fn fields(&self) -> &[FieldMeta] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, index: usize) -> Option<&FieldMeta> {
        self.fields.get(index)
    }

    /// Position of the field called `name`.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Like [`Schema::index_of`] but reports a missing field as an error.
    pub fn require(&self, name: &str) -> Result<usize> {
        self.index_of(name)
            .ok_or_else(|| EngineError::Row(format!("field '{}' not found in [{}]", name, self)))
    }

    /// A new schema with `field` appended.
    pub fn with_field(&self, field: FieldMeta) -> Self {
        let mut fields = self.fields.clone();
        fields.push(field);
        Self { fields }
    }

    /// Describe the first difference between two schemas, if any.
    pub fn diff(&self, other: &Schema) -> Option<String> {
        if self.fields.len() != other.fields.len() {
            return Some(format!(
                "expected {} fields, got {}",
                self.fields.len(),
                other.fields.len()
            ));
        }
        self.fields
            .iter()
            .zip(other.fields.iter())
            .enumerate()
            .find(|(_, (a, b))| a != b)
            .map(|(i, (a, b))| format!("field #{}: expected [{}], got [{}]", i, a, b))
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", field)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new(vec![
            FieldMeta::new("id", ValueType::Integer),
            FieldMeta::new("name", ValueType::String).with_length(32),
        ])
    }

    #[test]
    fn test_index_of() {
        let s = schema();
        assert_eq!(s.index_of("name"), Some(1));
        assert_eq!(s.index_of("missing"), None);
        assert!(s.require("missing").is_err());
    }

    #[test]
    fn test_diff_reports_first_difference() {
        let a = schema();
        let b = Schema::new(vec![
            FieldMeta::new("id", ValueType::Integer),
            FieldMeta::new("name", ValueType::Binary),
        ]);
        let diff = a.diff(&b).unwrap();
        assert!(diff.contains("field #1"));
        assert!(a.diff(&schema()).is_none());
        assert!(a.diff(&Schema::default()).unwrap().contains("expected 2 fields"));
    }

    #[test]
    fn test_display() {
        assert_eq!(schema().to_string(), "id Integer, name String(32)");
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_string(&schema()).unwrap();
        let back: Schema = serde_json::from_str(&json).unwrap();
        assert_eq!(back, schema());
        assert!(json.starts_with('['));
    }
}
