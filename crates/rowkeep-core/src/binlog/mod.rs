//! Binlog: the durability log of the cache
//!
//! Mutations are buffered per shard, written as checksummed blocks and
//! fsynced before their replies are released. Periodic snapshots rewrite the
//! live record set into a fresh file so old files can be deleted.

pub mod entry;
pub mod reader;
pub mod writer;

/// Block header: payload length (4B) and CRC-64 (8B)
pub const BLOCK_HEADER_SIZE: usize = 12;

pub use entry::{BinlogBuffer, BinlogEntry, Opcode, decode_entries};
pub use reader::{ReadStats, read_file};
pub use writer::{BinlogWriter, FileCounter, list_files, parse_file_index};
