//! Binlog file reader

use super::BLOCK_HEADER_SIZE;
use super::entry::{BinlogEntry, decode_entries};
use rowkeep_common::checksum::crc64;
use rowkeep_common::{Error, Result};
use std::fs;
use std::path::Path;
use tracing::warn;

/// Summary of one replayed file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadStats {
    pub blocks: usize,
    pub entries: usize,
    /// The file ended inside a block header or payload
    pub torn_tail: bool,
}

/// Visit every entry of a binlog file in order
///
/// A checksum mismatch is always an error. A block cut short at the end of
/// the file was never acknowledged, so it is skipped with a warning. Every
/// shard appends to its own file, so any file may end that way after a
/// crash.
pub fn read_file<F>(path: &Path, mut visit: F) -> Result<ReadStats>
where
    F: FnMut(BinlogEntry) -> Result<()>,
{
    let data = fs::read(path)
        .map_err(|e| Error::Storage(format!("failed to read binlog {}: {}", path.display(), e)))?;
    let mut stats = ReadStats::default();
    let mut offset = 0;

    while offset < data.len() {
        let rest = &data[offset..];
        let torn = if rest.len() < BLOCK_HEADER_SIZE {
            true
        } else {
            let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
            rest.len() < BLOCK_HEADER_SIZE + len
        };
        if torn {
            warn!(
                "Binlog {} ends with a partial block at offset {}, ignoring {} bytes",
                path.display(),
                offset,
                rest.len()
            );
            stats.torn_tail = true;
            break;
        }

        let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        let mut crc = [0u8; 8];
        crc.copy_from_slice(&rest[4..BLOCK_HEADER_SIZE]);
        let expected = u64::from_be_bytes(crc);
        let payload = &rest[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + len];
        let actual = crc64(payload);
        if actual != expected {
            return Err(Error::ChecksumMismatch { expected, actual });
        }

        for entry in decode_entries(payload)? {
            visit(entry)?;
            stats.entries += 1;
        }
        stats.blocks += 1;
        offset += BLOCK_HEADER_SIZE + len;
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::entry::{BinlogBuffer, Opcode};
    use crate::binlog::writer::{BinlogWriter, FileCounter};
    use rowkeep_common::FieldValue;
    use rowkeep_common::config::BinlogConfig;
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn write_blocks(dir: &Path, blocks: usize) -> std::path::PathBuf {
        let config = BinlogConfig {
            dir: dir.to_path_buf(),
            ..BinlogConfig::default()
        };
        let mut writer = BinlogWriter::new(config, Arc::new(FileCounter::new(0)));
        for i in 0..blocks {
            let mut buffer = BinlogBuffer::new();
            let value = FieldValue::Int(i as i64);
            buffer.append(Opcode::Update, "t:k", i as i64 + 1, [("n", &value)]);
            buffer.append(Opcode::Kick, "t:other", 0, std::iter::empty());
            let (payload, count) = buffer.take();
            writer.append_block(&payload, count).unwrap();
        }
        writer.current_path().unwrap().to_path_buf()
    }

    #[test]
    fn test_read_in_order() {
        let dir = tempdir().unwrap();
        let path = write_blocks(dir.path(), 3);

        let mut versions = Vec::new();
        let stats = read_file(&path, |entry| {
            if entry.opcode == Opcode::Update {
                versions.push(entry.version);
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(stats.blocks, 3);
        assert_eq!(stats.entries, 6);
        assert!(!stats.torn_tail);
    }

    #[test]
    fn test_checksum_mismatch_is_fatal() {
        let dir = tempdir().unwrap();
        let path = write_blocks(dir.path(), 2);
        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        fs::write(&path, &data).unwrap();

        let err = read_file(&path, |_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_torn_tail() {
        let dir = tempdir().unwrap();
        let path = write_blocks(dir.path(), 2);
        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0, 0, 0, 42, 1, 2]).unwrap();
        drop(file);

        let stats = read_file(&path, |_| Ok(())).unwrap();
        assert_eq!(stats.blocks, 2);
        assert_eq!(stats.entries, 4);
        assert!(stats.torn_tail);
    }
}
