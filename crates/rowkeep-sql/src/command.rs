//! Commands submitted to the SQL pipeline

use rowkeep_common::{ErrorCode, Field, FieldValue, make_uni_key};
use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

/// Which fields a read returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSelection {
    All,
    Fields(Vec<String>),
}

impl FieldSelection {
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Fields(names) => names.iter().any(|n| n == name),
        }
    }
}

/// Statement shape used to persist a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteBackOp {
    Insert,
    Update,
    Delete,
    Upsert,
}

/// A record state captured for write-back
#[derive(Debug, Clone, PartialEq)]
pub struct WriteBackTask {
    pub op: WriteBackOp,
    pub version: i64,
    /// Every column of the record
    pub values: HashMap<String, FieldValue>,
    /// Columns changed since the last write-back, used by `Update`
    pub modified: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SqlRequest {
    Get {
        selection: FieldSelection,
        version: Option<i64>,
    },
    Set {
        fields: Vec<Field>,
        version: Option<i64>,
    },
    SetNx {
        fields: Vec<Field>,
    },
    IncrBy {
        field: String,
        delta: i64,
        version: Option<i64>,
    },
    DecrBy {
        field: String,
        delta: i64,
        version: Option<i64>,
    },
    Del {
        version: Option<i64>,
    },
    WriteBack(WriteBackTask),
}

/// Outcome of a SQL command
#[derive(Debug, Clone, PartialEq)]
pub struct SqlReply {
    pub code: ErrorCode,
    pub version: i64,
    pub fields: HashMap<String, FieldValue>,
}

impl SqlReply {
    #[must_use]
    pub fn code(code: ErrorCode) -> Self {
        Self {
            code,
            version: 0,
            fields: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_version(code: ErrorCode, version: i64) -> Self {
        Self {
            code,
            version,
            fields: HashMap::new(),
        }
    }

    #[must_use]
    pub fn ok(version: i64) -> Self {
        Self::with_version(ErrorCode::Ok, version)
    }

    #[must_use]
    pub fn with_fields(mut self, fields: HashMap<String, FieldValue>) -> Self {
        self.fields = fields;
        self
    }
}

pub type SqlCallback = Box<dyn FnOnce(SqlReply) + Send + 'static>;

/// A request plus the callback that receives its reply
///
/// Commands past their deadline are dropped unexecuted; the callback is
/// dropped with them.
pub struct SqlCommand {
    pub(crate) table: String,
    pub(crate) key: String,
    pub(crate) uni_key: String,
    pub(crate) request: SqlRequest,
    pub(crate) deadline: Option<Instant>,
    pub(crate) callback: SqlCallback,
}

impl SqlCommand {
    pub fn new(
        table: impl Into<String>,
        key: impl Into<String>,
        request: SqlRequest,
        callback: impl FnOnce(SqlReply) + Send + 'static,
    ) -> Self {
        let table = table.into();
        let key = key.into();
        Self {
            uni_key: make_uni_key(&table, &key),
            table,
            key,
            request,
            deadline: None,
            callback: Box::new(callback),
        }
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn uni_key(&self) -> &str {
        &self.uni_key
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    /// Deliver the reply
    pub fn reply(self, reply: SqlReply) {
        (self.callback)(reply);
    }
}

impl fmt::Debug for SqlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlCommand")
            .field("uni_key", &self.uni_key)
            .field("request", &self.request)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}
