//! Core types for Rowkeep
//!
//! Field values, field descriptors and the `table:key` record address.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved column holding the primary key of every table
pub const KEY_FIELD: &str = "__key__";

/// Reserved column holding the record version of every table
pub const VERSION_FIELD: &str = "__version__";

/// Declared type of a table column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Int,
    Float,
    String,
    Blob,
}

impl FieldType {
    /// Parse the type name used in table definitions
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "int" => Some(Self::Int),
            "float" => Some(Self::Float),
            "string" => Some(Self::String),
            "blob" => Some(Self::Blob),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::Blob => "blob",
        }
    }

    /// Column type used when creating the backing table
    #[must_use]
    pub const fn sql_type(self) -> &'static str {
        match self {
            Self::Int => "INTEGER",
            Self::Float => "REAL",
            Self::String => "TEXT",
            Self::Blob => "BLOB",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed column value
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    String(String),
    Blob(Vec<u8>),
}

impl FieldValue {
    #[must_use]
    pub const fn field_type(&self) -> FieldType {
        match self {
            Self::Int(_) => FieldType::Int,
            Self::Float(_) => FieldType::Float,
            Self::String(_) => FieldType::String,
            Self::Blob(_) => FieldType::Blob,
        }
    }

    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// The zero value of a type
    #[must_use]
    pub const fn zero(ty: FieldType) -> Self {
        match ty {
            FieldType::Int => Self::Int(0),
            FieldType::Float => Self::Float(0.0),
            FieldType::String => Self::String(String::new()),
            FieldType::Blob => Self::Blob(Vec::new()),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Blob(v)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Blob(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

/// A named field value
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub value: FieldValue,
}

impl Field {
    pub fn new(name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Build the `table:key` address of a record
#[must_use]
pub fn make_uni_key(table: &str, key: &str) -> String {
    let mut uni_key = String::with_capacity(table.len() + key.len() + 1);
    uni_key.push_str(table);
    uni_key.push(':');
    uni_key.push_str(key);
    uni_key
}

/// Split a `table:key` address at the first colon
///
/// Table names never contain a colon, keys may.
#[must_use]
pub fn split_uni_key(uni_key: &str) -> Option<(&str, &str)> {
    uni_key
        .split_once(':')
        .filter(|(table, key)| !table.is_empty() && !key.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uni_key() {
        let uni_key = make_uni_key("users", "alice");
        assert_eq!(uni_key, "users:alice");
        assert_eq!(split_uni_key(&uni_key), Some(("users", "alice")));
    }

    #[test]
    fn test_uni_key_with_colon_in_key() {
        let uni_key = make_uni_key("users", "a:b:c");
        assert_eq!(split_uni_key(&uni_key), Some(("users", "a:b:c")));
        assert_eq!(split_uni_key("nokey"), None);
        assert_eq!(split_uni_key(":k"), None);
    }

    #[test]
    fn test_field_type_parse() {
        assert_eq!(FieldType::parse("int"), Some(FieldType::Int));
        assert_eq!(FieldType::parse("blob"), Some(FieldType::Blob));
        assert_eq!(FieldType::parse("uint"), None);
        assert_eq!(FieldType::String.sql_type(), "TEXT");
    }

    #[test]
    fn test_field_value_type() {
        assert_eq!(FieldValue::from(3).field_type(), FieldType::Int);
        assert_eq!(FieldValue::from("x").as_str(), Some("x"));
        assert_eq!(FieldValue::zero(FieldType::Float), FieldValue::Float(0.0));
        assert_eq!(FieldValue::from(vec![1u8, 2]).to_string(), "<2 bytes>");
    }
}
