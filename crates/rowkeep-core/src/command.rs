//! Client commands and their reply path

use rowkeep_common::{ErrorCode, Field, FieldValue, make_uni_key};
use rowkeep_sql::FieldSelection;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;

/// Default time a client waits for a reply
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Operation requested on a record
#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    /// Read fields; with `version`, only if the record changed since then
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
    CompareAndSet {
        field: String,
        old: FieldValue,
        new: FieldValue,
    },
    /// Like `CompareAndSet`, but creates the record when it is missing
    CompareAndSetNx {
        field: String,
        old: FieldValue,
        new: FieldValue,
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
}

impl CommandKind {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Get { .. } => "get",
            Self::Set { .. } => "set",
            Self::SetNx { .. } => "set_nx",
            Self::CompareAndSet { .. } => "compare_and_set",
            Self::CompareAndSetNx { .. } => "compare_and_set_nx",
            Self::IncrBy { .. } => "incr_by",
            Self::DecrBy { .. } => "decr_by",
            Self::Del { .. } => "del",
        }
    }
}

/// A command as handed to the engine
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub table: String,
    pub key: String,
    pub kind: CommandKind,
    pub timeout: Duration,
}

impl Request {
    pub fn new(table: impl Into<String>, key: impl Into<String>, kind: CommandKind) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
            kind,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn get(table: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(
            table,
            key,
            CommandKind::Get {
                selection: FieldSelection::All,
                version: None,
            },
        )
    }

    pub fn set(table: impl Into<String>, key: impl Into<String>, fields: Vec<Field>) -> Self {
        Self::new(
            table,
            key,
            CommandKind::Set {
                fields,
                version: None,
            },
        )
    }

    pub fn set_nx(table: impl Into<String>, key: impl Into<String>, fields: Vec<Field>) -> Self {
        Self::new(table, key, CommandKind::SetNx { fields })
    }

    pub fn del(table: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(table, key, CommandKind::Del { version: None })
    }
}

/// Result of a command
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub code: ErrorCode,
    pub version: i64,
    pub fields: Vec<Field>,
}

impl Reply {
    #[must_use]
    pub const fn code(code: ErrorCode) -> Self {
        Self {
            code,
            version: 0,
            fields: Vec::new(),
        }
    }

    #[must_use]
    pub const fn with_version(code: ErrorCode, version: i64) -> Self {
        Self {
            code,
            version,
            fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_fields(mut self, mut fields: Vec<Field>) -> Self {
        fields.sort_by(|a, b| a.name.cmp(&b.name));
        self.fields = fields;
        self
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| &f.value)
    }

    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.code.is_ok()
    }
}

/// When a command stops being worth processing, and answering
///
/// Processing must start within half of the client timeout so the reply
/// has the other half to make it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    pub process: Instant,
    pub response: Instant,
}

impl Deadline {
    #[must_use]
    pub fn from_timeout(now: Instant, timeout: Duration) -> Self {
        Self {
            process: now + timeout / 2,
            response: now + timeout,
        }
    }
}

/// Sends the reply of one command, at most once
#[derive(Debug)]
pub struct Replier {
    tx: oneshot::Sender<Reply>,
    deadline: Instant,
}

impl Replier {
    #[must_use]
    pub const fn new(tx: oneshot::Sender<Reply>, deadline: Instant) -> Self {
        Self { tx, deadline }
    }

    /// Deliver `reply` unless the response deadline has passed
    pub fn send(self, reply: Reply) {
        if Instant::now() > self.deadline {
            debug!("Dropping late reply ({})", reply.code);
            return;
        }
        // Receiver may have gone away; nothing to do then
        let _ = self.tx.send(reply);
    }
}

/// A request in flight through a shard
#[derive(Debug)]
pub struct Command {
    pub table: String,
    pub key: String,
    pub uni_key: String,
    pub kind: CommandKind,
    pub deadline: Deadline,
    pub replier: Replier,
}

impl Command {
    /// Build a command and the receiver its reply arrives on
    #[must_use]
    pub fn new(request: Request) -> (Self, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        let deadline = Deadline::from_timeout(Instant::now(), request.timeout);
        let cmd = Self {
            uni_key: make_uni_key(&request.table, &request.key),
            table: request.table,
            key: request.key,
            kind: request.kind,
            deadline,
            replier: Replier::new(tx, deadline.response),
        };
        (cmd, rx)
    }

    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.deadline.process
    }

    pub fn reply(self, reply: Reply) {
        self.replier.send(reply);
    }
}
