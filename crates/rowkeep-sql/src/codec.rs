//! Value conversion and statement builders
//!
//! All statements address rows by `__key__` (parameter `?1` unless noted).
//! Identifiers are always quoted.

use crate::error::{SqlError, SqlResult};
use crate::meta::FieldMeta;
use rowkeep_common::{FieldType, FieldValue, KEY_FIELD, VERSION_FIELD};
use rusqlite::types::{Value, ValueRef};
use std::fmt::Write;

/// Quote an identifier for SQLite
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[must_use]
pub fn to_sql(value: &FieldValue) -> Value {
    match value {
        FieldValue::Int(v) => Value::Integer(*v),
        FieldValue::Float(v) => Value::Real(*v),
        FieldValue::String(s) => Value::Text(s.clone()),
        FieldValue::Blob(b) => Value::Blob(b.clone()),
    }
}

/// Convert a stored column into the declared type
///
/// `NULL` reads as the column default.
pub fn from_sql(meta: &FieldMeta, value: ValueRef<'_>) -> SqlResult<FieldValue> {
    let converted = match (meta.field_type, value) {
        (_, ValueRef::Null) => Some(meta.default.clone()),
        (FieldType::Int, ValueRef::Integer(v)) => Some(FieldValue::Int(v)),
        (FieldType::Float, ValueRef::Real(v)) => Some(FieldValue::Float(v)),
        #[allow(clippy::cast_precision_loss)]
        (FieldType::Float, ValueRef::Integer(v)) => Some(FieldValue::Float(v as f64)),
        (FieldType::String, ValueRef::Text(t)) => std::str::from_utf8(t)
            .ok()
            .map(|s| FieldValue::String(s.to_string())),
        (FieldType::Blob, ValueRef::Blob(b) | ValueRef::Text(b)) => {
            Some(FieldValue::Blob(b.to_vec()))
        }
        _ => None,
    };
    converted.ok_or_else(|| SqlError::ColumnType {
        column: meta.name.clone(),
    })
}

fn column_list(columns: &[&str]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `SELECT columns ... WHERE __key__ = ?1 [AND __version__ != ?2]`
#[must_use]
pub fn select_sql(table: &str, columns: &[&str], version_filter: bool) -> String {
    let mut sql = format!(
        "SELECT {} FROM {} WHERE {} = ?1",
        column_list(columns),
        quote_ident(table),
        quote_ident(KEY_FIELD)
    );
    if version_filter {
        let _ = write!(sql, " AND {} != ?2", quote_ident(VERSION_FIELD));
    }
    sql
}

/// Insert with parameters `?1..?n` bound to `columns` in order
#[must_use]
pub fn insert_sql(table: &str, columns: &[&str]) -> String {
    let placeholders = (1..=columns.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table),
        column_list(columns),
        placeholders
    )
}

/// Insert that overwrites every non-key column on key conflict
///
/// `columns` must start with `__key__`.
#[must_use]
pub fn upsert_sql(table: &str, columns: &[&str]) -> String {
    let mut sql = insert_sql(table, columns);
    let _ = write!(sql, " ON CONFLICT({}) DO UPDATE SET ", quote_ident(KEY_FIELD));
    let updates = columns
        .iter()
        .filter(|c| **c != KEY_FIELD)
        .map(|c| {
            let col = quote_ident(c);
            format!("{col} = excluded.{col}")
        })
        .collect::<Vec<_>>()
        .join(", ");
    sql.push_str(&updates);
    sql
}

/// `UPDATE ... SET columns = ?1..?n WHERE __key__ = ?{n+1}`
#[must_use]
pub fn update_sql(table: &str, columns: &[&str]) -> String {
    let sets = columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ?{}", quote_ident(c), i + 1))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "UPDATE {} SET {} WHERE {} = ?{}",
        quote_ident(table),
        sets,
        quote_ident(KEY_FIELD),
        columns.len() + 1
    )
}

#[must_use]
pub fn delete_sql(table: &str) -> String {
    format!(
        "DELETE FROM {} WHERE {} = ?1",
        quote_ident(table),
        quote_ident(KEY_FIELD)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(ty: FieldType, default: FieldValue) -> FieldMeta {
        FieldMeta {
            name: "f".into(),
            field_type: ty,
            default,
        }
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_from_sql() {
        let int = meta(FieldType::Int, FieldValue::Int(7));
        assert_eq!(from_sql(&int, ValueRef::Null).unwrap(), FieldValue::Int(7));
        assert_eq!(from_sql(&int, ValueRef::Integer(3)).unwrap(), FieldValue::Int(3));
        assert!(from_sql(&int, ValueRef::Text(b"3")).is_err());

        let float = meta(FieldType::Float, FieldValue::Float(0.0));
        assert_eq!(
            from_sql(&float, ValueRef::Integer(2)).unwrap(),
            FieldValue::Float(2.0)
        );

        let blob = meta(FieldType::Blob, FieldValue::Blob(Vec::new()));
        assert_eq!(
            from_sql(&blob, ValueRef::Blob(&[1, 2])).unwrap(),
            FieldValue::Blob(vec![1, 2])
        );
    }

    #[test]
    fn test_statements() {
        assert_eq!(
            select_sql("t", &["__version__", "a"], true),
            "SELECT \"__version__\", \"a\" FROM \"t\" WHERE \"__key__\" = ?1 AND \"__version__\" != ?2"
        );
        assert_eq!(
            upsert_sql("t", &["__key__", "__version__", "a"]),
            "INSERT INTO \"t\" (\"__key__\", \"__version__\", \"a\") VALUES (?1, ?2, ?3) \
             ON CONFLICT(\"__key__\") DO UPDATE SET \"__version__\" = excluded.\"__version__\", \
             \"a\" = excluded.\"a\""
        );
        assert_eq!(
            update_sql("t", &["__version__", "a"]),
            "UPDATE \"t\" SET \"__version__\" = ?1, \"a\" = ?2 WHERE \"__key__\" = ?3"
        );
        assert_eq!(delete_sql("t"), "DELETE FROM \"t\" WHERE \"__key__\" = ?1");
    }
}
