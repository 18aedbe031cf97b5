//! Typed field values.
//!
//! A [`Value`] is a late-bound wrapper for one position of a row. Its runtime
//! variant must agree with the [`ValueType`] declared by the schema, except
//! for [`Value::Null`] which is valid anywhere.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Declared type of a schema field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    String,
    Integer,
    Number,
    Decimal,
    Boolean,
    Date,
    Binary,
}

impl ValueType {
    /// Wire tag for this type. Zero is reserved for null values.
    pub fn tag(self) -> u8 {
        match self {
            ValueType::String => 1,
            ValueType::Integer => 2,
            ValueType::Number => 3,
            ValueType::Decimal => 4,
            ValueType::Boolean => 5,
            ValueType::Date => 6,
            ValueType::Binary => 7,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => ValueType::String,
            2 => ValueType::Integer,
            3 => ValueType::Number,
            4 => ValueType::Decimal,
            5 => ValueType::Boolean,
            6 => ValueType::Date,
            7 => ValueType::Binary,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            ValueType::String => "String",
            ValueType::Integer => "Integer",
            ValueType::Number => "Number",
            ValueType::Decimal => "Decimal",
            ValueType::Boolean => "Boolean",
            ValueType::Date => "Date",
            ValueType::Binary => "Binary",
        }
    }

    pub fn all() -> &'static [ValueType] {
        &[
            ValueType::String,
            ValueType::Integer,
            ValueType::Number,
            ValueType::Decimal,
            ValueType::Boolean,
            ValueType::Date,
            ValueType::Binary,
        ]
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fixed-point decimal: `unscaled * 10^-scale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Decimal {
    pub unscaled: i128,
    pub scale: u8,
}

impl Decimal {
    pub fn new(unscaled: i128, scale: u8) -> Self {
        Self { unscaled, scale }
    }

    /// Rescale both operands to the larger scale and compare.
    fn cmp_value(&self, other: &Decimal) -> Option<Ordering> {
        let scale = self.scale.max(other.scale);
        let a = self
            .unscaled
            .checked_mul(10i128.checked_pow((scale - self.scale) as u32)?)?;
        let b = other
            .unscaled
            .checked_mul(10i128.checked_pow((scale - other.scale) as u32)?)?;
        Some(a.cmp(&b))
    }

    pub fn to_f64(&self) -> f64 {
        self.unscaled as f64 / 10f64.powi(self.scale as i32)
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.unscaled);
        }
        let sign = if self.unscaled < 0 { "-" } else { "" };
        let digits = self.unscaled.unsigned_abs().to_string();
        let scale = self.scale as usize;
        let padded = if digits.len() <= scale {
            format!("{}{}", "0".repeat(scale - digits.len() + 1), digits)
        } else {
            digits
        };
        let (int_part, frac_part) = padded.split_at(padded.len() - scale);
        write!(f, "{}{}.{}", sign, int_part, frac_part)
    }
}

/// One field value of a row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    String(String),
    Integer(i64),
    Number(f64),
    Decimal(Decimal),
    Boolean(bool),
    Date(DateTime<Utc>),
    Binary(Vec<u8>),
}

impl Value {
    /// Runtime type, `None` for null.
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            Value::Null => None,
            Value::String(_) => Some(ValueType::String),
            Value::Integer(_) => Some(ValueType::Integer),
            Value::Number(_) => Some(ValueType::Number),
            Value::Decimal(_) => Some(ValueType::Decimal),
            Value::Boolean(_) => Some(ValueType::Boolean),
            Value::Date(_) => Some(ValueType::Date),
            Value::Binary(_) => Some(ValueType::Binary),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Whether this value may occupy a field declared as `ty`.
    pub fn fits(&self, ty: ValueType) -> bool {
        self.value_type().map_or(true, |t| t == ty)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(v) => Some(*v),
            Value::Integer(v) => Some(*v as f64),
            Value::Decimal(d) => Some(d.to_f64()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    /// Order two values of compatible types. Nulls sort first; numeric
    /// variants compare across each other. Incompatible types yield `None`.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Null, _) => Some(Ordering::Less),
            (_, Value::Null) => Some(Ordering::Greater),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
            (Value::Decimal(a), Value::Decimal(b)) => a.cmp_value(b),
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::Binary(a), Value::Binary(b)) => Some(a.cmp(b)),
            (a, b) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        }
    }

    /// Feed a canonical byte form of this value to `out`.
    ///
    /// Used for key hashing; equal values always produce equal bytes.
    pub fn key_bytes(&self, out: &mut Vec<u8>) {
        match self {
            Value::Null => out.push(0),
            Value::String(s) => {
                out.push(1);
                out.extend_from_slice(&(s.len() as u32).to_be_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Value::Integer(v) => {
                out.push(2);
                out.extend_from_slice(&v.to_be_bytes());
            }
            Value::Number(v) => {
                out.push(3);
                // -0.0 and 0.0 compare equal and must hash the same
                let v = if *v == 0.0 { 0.0f64 } else { *v };
                out.extend_from_slice(&v.to_bits().to_be_bytes());
            }
            Value::Decimal(d) => {
                out.push(4);
                let (mut unscaled, mut scale) = (d.unscaled, d.scale);
                while scale > 0 && unscaled % 10 == 0 {
                    unscaled /= 10;
                    scale -= 1;
                }
                out.extend_from_slice(&unscaled.to_be_bytes());
                out.push(scale);
            }
            Value::Boolean(b) => {
                out.push(5);
                out.push(*b as u8);
            }
            Value::Date(d) => {
                out.push(6);
                out.extend_from_slice(&d.timestamp().to_be_bytes());
                out.extend_from_slice(&d.timestamp_subsec_nanos().to_be_bytes());
            }
            Value::Binary(b) => {
                out.push(7);
                out.extend_from_slice(&(b.len() as u32).to_be_bytes());
                out.extend_from_slice(b);
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("<null>"),
            Value::String(s) => f.write_str(s),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Number(v) => write!(f, "{}", v),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Date(d) => write!(f, "{}", d.format("%Y/%m/%d %H:%M:%S%.3f")),
            Value::Binary(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Value::Decimal(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Date(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Binary(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_fits_every_type() {
        for ty in ValueType::all() {
            assert!(Value::Null.fits(*ty));
        }
        assert!(!Value::Integer(1).fits(ValueType::String));
    }

    #[test]
    fn test_tag_round_trip() {
        for ty in ValueType::all() {
            assert_eq!(ValueType::from_tag(ty.tag()), Some(*ty));
        }
        assert_eq!(ValueType::from_tag(0), None);
    }

    #[test]
    fn test_decimal_display() {
        assert_eq!(Decimal::new(12345, 2).to_string(), "123.45");
        assert_eq!(Decimal::new(-5, 3).to_string(), "-0.005");
        assert_eq!(Decimal::new(42, 0).to_string(), "42");
    }

    #[test]
    fn test_compare_mixed_numeric() {
        assert_eq!(
            Value::Integer(2).compare(&Value::Number(2.5)),
            Some(Ordering::Less)
        );
        assert_eq!(
            Value::Decimal(Decimal::new(150, 2)).compare(&Value::Decimal(Decimal::new(15, 1))),
            Some(Ordering::Equal)
        );
        assert_eq!(Value::String("a".into()).compare(&Value::Boolean(true)), None);
    }

    #[test]
    fn test_key_bytes_zero_sign() {
        let mut a = Vec::new();
        let mut b = Vec::new();
        Value::Number(0.0).key_bytes(&mut a);
        Value::Number(-0.0).key_bytes(&mut b);
        assert_eq!(a, b);
    }
}
