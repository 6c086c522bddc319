//! Binlog file writer
//!
//! Block format (big-endian):
//! ```text
//! +--------+--------+---------+
//! | Length | CRC-64 | Payload |
//! | 4B     | 8B     | var     |
//! +--------+--------+---------+
//! ```
//! Files are named `{prefix}_{index}.bin`. Indices come from a process-wide
//! counter so a later file always sorts after an earlier one.

use super::BLOCK_HEADER_SIZE;
use rowkeep_common::checksum::crc64;
use rowkeep_common::config::BinlogConfig;
use rowkeep_common::{Error, Result};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Source of binlog file indices
#[derive(Debug, Default)]
pub struct FileCounter(AtomicU64);

impl FileCounter {
    #[must_use]
    pub const fn new(last: u64) -> Self {
        Self(AtomicU64::new(last))
    }

    /// Allocate the next index
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Parse the index out of `{prefix}_{index}.bin`
#[must_use]
pub fn parse_file_index(prefix: &str, file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix(prefix)?
        .strip_prefix('_')?
        .strip_suffix(".bin")?
        .parse()
        .ok()
}

/// Binlog files in a directory, ordered by index
pub fn list_files(dir: &Path, prefix: &str) -> Result<Vec<(u64, PathBuf)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(index) = parse_file_index(prefix, name) {
            files.push((index, entry.path()));
        }
    }
    files.sort_by_key(|(index, _)| *index);
    Ok(files)
}

/// Appends checksummed blocks to the current binlog file of one shard
pub struct BinlogWriter {
    config: BinlogConfig,
    counter: Arc<FileCounter>,
    file: Option<File>,
    path: Option<PathBuf>,
    /// Files superseded by a snapshot, deleted once it completes
    retired: Vec<PathBuf>,
    file_size: u64,
    entry_count: u64,
}

impl BinlogWriter {
    pub fn new(config: BinlogConfig, counter: Arc<FileCounter>) -> Self {
        Self {
            config,
            counter,
            file: None,
            path: None,
            retired: Vec::new(),
            file_size: 0,
            entry_count: 0,
        }
    }

    fn open_next(&mut self) -> Result<()> {
        fs::create_dir_all(&self.config.dir)?;
        let path = self.config.file_path(self.counter.next());
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                Error::Storage(format!("failed to create binlog {}: {}", path.display(), e))
            })?;
        debug!("Opened binlog file {}", path.display());
        self.path = Some(path);
        self.file = Some(file);
        Ok(())
    }

    /// Write one block and fsync it
    pub fn append_block(&mut self, payload: &[u8], entries: usize) -> Result<()> {
        let len = u32::try_from(payload.len()).map_err(|_| {
            Error::Storage(format!("binlog block too large: {} bytes", payload.len()))
        })?;

        let mut block = Vec::with_capacity(BLOCK_HEADER_SIZE + payload.len());
        block.extend_from_slice(&len.to_be_bytes());
        block.extend_from_slice(&crc64(payload).to_be_bytes());
        block.extend_from_slice(payload);

        if self.file.is_none() {
            self.open_next()?;
        }
        let Some(file) = self.file.as_mut() else {
            return Err(Error::internal("binlog file not open"));
        };
        file.write_all(&block)?;
        file.sync_data()?;

        self.file_size += block.len() as u64;
        self.entry_count += entries as u64;
        Ok(())
    }

    /// Whether the current file has grown past the snapshot thresholds
    #[must_use]
    pub const fn needs_snapshot(&self) -> bool {
        self.entry_count >= self.config.max_entry_count
            || self.file_size >= self.config.max_file_size
    }

    /// Close the current file; the next block starts a new one
    pub fn rotate(&mut self) {
        self.file = None;
        if let Some(path) = self.path.take() {
            info!(
                "Rotating binlog {} ({} entries, {} bytes)",
                path.display(),
                self.entry_count,
                self.file_size
            );
            self.retired.push(path);
        }
        self.file_size = 0;
        self.entry_count = 0;
    }

    /// Delete the files closed by earlier rotations
    pub fn remove_retired(&mut self) -> usize {
        let mut removed = 0;
        for path in self.retired.drain(..) {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove binlog {}: {}", path.display(), e),
            }
        }
        removed
    }

    #[must_use]
    pub fn current_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[must_use]
    pub const fn entry_count(&self) -> u64 {
        self.entry_count
    }

    #[must_use]
    pub const fn file_size(&self) -> u64 {
        self.file_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(dir: &Path) -> BinlogConfig {
        BinlogConfig {
            dir: dir.to_path_buf(),
            max_entry_count: 3,
            ..BinlogConfig::default()
        }
    }

    #[test]
    fn test_parse_file_index() {
        assert_eq!(parse_file_index("binlog", "binlog_12.bin"), Some(12));
        assert_eq!(parse_file_index("binlog", "binlog_.bin"), None);
        assert_eq!(parse_file_index("binlog", "other_1.bin"), None);
        assert_eq!(parse_file_index("binlog", "binlog_1.tmp"), None);
    }

    #[test]
    fn test_counter() {
        let counter = FileCounter::new(0);
        assert_eq!(counter.next(), 1);
        assert_eq!(counter.next(), 2);

        let resumed = FileCounter::new(7);
        assert_eq!(resumed.next(), 8);
    }

    #[test]
    fn test_append_and_rotate() {
        let dir = tempdir().unwrap();
        let counter = Arc::new(FileCounter::new(0));
        let mut writer = BinlogWriter::new(config(dir.path()), Arc::clone(&counter));
        assert!(writer.current_path().is_none());

        writer.append_block(b"abc", 2).unwrap();
        let first = writer.current_path().unwrap().to_path_buf();
        assert_eq!(first, dir.path().join("binlog_1.bin"));
        assert_eq!(writer.file_size(), (BLOCK_HEADER_SIZE + 3) as u64);
        assert!(!writer.needs_snapshot());

        writer.append_block(b"de", 1).unwrap();
        assert!(writer.needs_snapshot());

        writer.rotate();
        assert_eq!(writer.entry_count(), 0);
        writer.append_block(b"f", 1).unwrap();
        assert_eq!(
            writer.current_path().unwrap(),
            dir.path().join("binlog_2.bin").as_path()
        );

        let files = list_files(dir.path(), "binlog").unwrap();
        assert_eq!(files.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![1, 2]);

        assert_eq!(writer.remove_retired(), 1);
        assert!(!first.exists());
        assert_eq!(list_files(dir.path(), "binlog").unwrap().len(), 1);
    }
}
