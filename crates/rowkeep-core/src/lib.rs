//! Rowkeep Core - sharded write-behind record cache
//!
//! Records are served from memory, every mutation is made durable in a
//! per-shard binlog before it is acknowledged, and changes reach the SQL
//! store asynchronously through the write-back pipeline.
//!
//! # Architecture
//!
//! ```text
//! Engine ──(hash uniKey)──> Shard ──> BinlogBuffer ──> flush worker (fsync)
//!                             │                              │
//!                             │<──────── replies released ───┘
//!                             └──> SqlPipeline (load / write-back)
//! ```

pub mod binlog;
pub mod command;
pub mod engine;
pub mod lru;
pub mod record;
pub mod shard;

pub use command::{Command, CommandKind, Deadline, Reply, Request};
pub use engine::{Engine, EngineStats, NodeContext, RecoveryStats};
pub use record::{RecordStatus, RecordView, WriteBackFlag};
pub use shard::ShardStats;
