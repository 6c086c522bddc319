//! Cached records and their write-back state

use crate::command::Command;
use rowkeep_common::FieldValue;
use rowkeep_sql::WriteBackOp;
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

/// Residency state of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    /// Waiting for the SQL store to answer the initial load
    Loading,
    /// Row exists
    Ok,
    /// Row does not exist; the record remembers that
    Missing,
}

/// Operation still owed to the SQL store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteBackFlag {
    #[default]
    None,
    Insert,
    Update,
    Delete,
    InsertUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid write-back transition: pending {pending:?}, incoming {incoming:?}")]
pub struct InvalidTransition {
    pub pending: WriteBackFlag,
    pub incoming: WriteBackFlag,
}

impl WriteBackFlag {
    /// Coalesce `incoming` onto the pending operation
    ///
    /// A delete that follows a pending insert cancels it, since the row never
    /// reached the store. Recreating a row after a pending delete yields
    /// `InsertUpdate`: the old row may still be in the store.
    pub const fn merge(self, incoming: Self) -> Result<Self, InvalidTransition> {
        let merged = match (self, incoming) {
            (pending, Self::None) => pending,
            (Self::None, incoming) => incoming,
            (Self::Insert, Self::Insert | Self::Update) => Self::Insert,
            (Self::Insert, Self::Delete) => Self::None,
            (Self::Insert | Self::Update | Self::Delete | Self::InsertUpdate, Self::InsertUpdate)
            | (Self::Delete, Self::Insert)
            | (Self::InsertUpdate, Self::Insert | Self::Update) => Self::InsertUpdate,
            (Self::Update, Self::Insert | Self::Update) => Self::Update,
            (Self::Update | Self::Delete | Self::InsertUpdate, Self::Delete) => Self::Delete,
            (Self::Delete, Self::Update) => {
                return Err(InvalidTransition {
                    pending: self,
                    incoming,
                });
            }
        };
        Ok(merged)
    }

    /// Statement used to persist this flag
    #[must_use]
    pub const fn op(self) -> Option<WriteBackOp> {
        match self {
            Self::None => None,
            Self::Insert => Some(WriteBackOp::Insert),
            Self::Update => Some(WriteBackOp::Update),
            Self::Delete => Some(WriteBackOp::Delete),
            Self::InsertUpdate => Some(WriteBackOp::Upsert),
        }
    }

    #[must_use]
    pub const fn from_op(op: WriteBackOp) -> Self {
        match op {
            WriteBackOp::Insert => Self::Insert,
            WriteBackOp::Update => Self::Update,
            WriteBackOp::Delete => Self::Delete,
            WriteBackOp::Upsert => Self::InsertUpdate,
        }
    }

    #[must_use]
    pub const fn is_pending(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// A resident record
#[derive(Debug)]
pub struct Record {
    pub(crate) table: String,
    pub(crate) key: String,
    pub(crate) uni_key: String,
    pub(crate) status: RecordStatus,
    /// `None` unless the record is `Ok`
    pub(crate) values: Option<HashMap<String, FieldValue>>,
    pub(crate) version: i64,
    /// Fields changed since the last write-back was scheduled
    pub(crate) modified: HashSet<String>,
    /// Whether the current binlog file holds a full image of the record
    pub(crate) snapshotted: bool,
    pub(crate) write_back: WriteBackFlag,
    /// A write-back task is in flight
    pub(crate) write_back_locked: bool,
    /// Mutations logged but not yet fsynced
    pub(crate) unflushed: u32,
    /// Commands queued while the record loads
    pub(crate) waiting: VecDeque<Command>,
}

impl Record {
    pub(crate) fn loading(table: &str, key: &str, uni_key: &str) -> Self {
        Self {
            table: table.to_string(),
            key: key.to_string(),
            uni_key: uni_key.to_string(),
            status: RecordStatus::Loading,
            values: None,
            version: 0,
            modified: HashSet::new(),
            snapshotted: false,
            write_back: WriteBackFlag::None,
            write_back_locked: false,
            unflushed: 0,
            waiting: VecDeque::new(),
        }
    }

    pub(crate) fn set_ok(&mut self, values: HashMap<String, FieldValue>, version: i64) {
        self.status = RecordStatus::Ok;
        self.values = Some(values);
        self.version = version;
    }

    pub(crate) fn set_missing(&mut self, version: i64) {
        self.status = RecordStatus::Missing;
        self.values = None;
        self.version = version;
    }

    /// Eligible for eviction: nothing owed to the store or the binlog
    #[must_use]
    pub fn is_kickable(&self) -> bool {
        self.status != RecordStatus::Loading
            && !self.write_back.is_pending()
            && !self.write_back_locked
            && self.unflushed == 0
            && self.waiting.is_empty()
    }

    #[must_use]
    pub const fn status(&self) -> RecordStatus {
        self.status
    }

    #[must_use]
    pub const fn version(&self) -> i64 {
        self.version
    }

    #[must_use]
    pub const fn write_back(&self) -> WriteBackFlag {
        self.write_back
    }
}

/// Read-only copy of a record's state
#[derive(Debug, Clone, PartialEq)]
pub struct RecordView {
    pub status: RecordStatus,
    pub version: i64,
    pub values: Option<HashMap<String, FieldValue>>,
    pub write_back: WriteBackFlag,
    pub write_back_locked: bool,
}

impl From<&Record> for RecordView {
    fn from(record: &Record) -> Self {
        Self {
            status: record.status,
            version: record.version,
            values: record.values.clone(),
            write_back: record.write_back,
            write_back_locked: record.write_back_locked,
        }
    }
}
