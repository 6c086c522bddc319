//! SQL layer error types

use thiserror::Error;

/// SQL layer error
#[derive(Error, Debug)]
pub enum SqlError {
    /// Driver error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Worker thread could not be started
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed table definition
    #[error("Table {table}: {reason}")]
    Schema { table: String, reason: String },

    /// Table is not (or no longer) configured
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    /// Stored column value does not match the declared type
    #[error("Column {column} holds a value of the wrong type")]
    ColumnType { column: String },
}

impl SqlError {
    pub(crate) fn schema(table: &str, reason: impl Into<String>) -> Self {
        Self::Schema {
            table: table.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<SqlError> for rowkeep_common::Error {
    fn from(err: SqlError) -> Self {
        match err {
            SqlError::Schema { .. } => Self::Schema(err.to_string()),
            other => Self::Sql(other.to_string()),
        }
    }
}

/// Result type for SQL operations
pub type SqlResult<T> = Result<T, SqlError>;
