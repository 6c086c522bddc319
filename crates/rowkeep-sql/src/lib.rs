//! Rowkeep SQL - table metadata and the SQL store pipeline
//!
//! The SQL store is the source of truth behind the cache. This crate loads
//! table definitions, serves cache misses and persists write-back tasks
//! through a pool of connection-owning worker threads.

pub mod codec;
pub mod command;
pub mod error;
pub mod meta;
pub mod pipeline;
mod task;

pub use command::{
    FieldSelection, SqlCallback, SqlCommand, SqlReply, SqlRequest, WriteBackOp, WriteBackTask,
};
pub use error::{SqlError, SqlResult};
pub use meta::{DbMeta, FieldMeta, TableDef, TableMeta, install_table, load_table_defs};
pub use pipeline::{SqlPipeline, open_connection};
