//! Binlog entry codec
//!
//! Entry format (all integers big-endian):
//! ```text
//! +--------+--------+-----+---------+-------------+--------+
//! | Opcode | KeyLen | Key | Version | FieldCount  | Fields |
//! | 1B     | 4B     | var | 8B      | 4B          | var    |
//! +--------+--------+-----+---------+-------------+--------+
//! ```
//! Field format: `NameLen 4B | Name | Type 1B | Value`, where string and
//! blob values carry a 4B length prefix and int/float/uint values are 8B.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rowkeep_common::{Error, Field, FieldValue, Result};

/// Kind of a binlog entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Full image of a record; zero fields means the row is missing
    Snapshot = 1,
    /// Changed fields only
    Update = 2,
    /// Record deleted
    Delete = 3,
    /// Record evicted from the cache
    Kick = 4,
}

impl TryFrom<u8> for Opcode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Snapshot),
            2 => Ok(Self::Update),
            3 => Ok(Self::Delete),
            4 => Ok(Self::Kick),
            _ => Err(Error::corruption(format!("invalid opcode: {value}"))),
        }
    }
}

/// Type tag of an encoded field value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum TypeTag {
    String = 1,
    Float = 2,
    Int = 3,
    Uint = 4,
    Blob = 5,
}

impl TryFrom<u8> for TypeTag {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::String),
            2 => Ok(Self::Float),
            3 => Ok(Self::Int),
            4 => Ok(Self::Uint),
            5 => Ok(Self::Blob),
            _ => Err(Error::corruption(format!("invalid value type: {value}"))),
        }
    }
}

/// A decoded binlog entry
#[derive(Debug, Clone, PartialEq)]
pub struct BinlogEntry {
    pub opcode: Opcode,
    pub uni_key: String,
    pub version: i64,
    pub fields: Vec<Field>,
}

#[allow(clippy::cast_possible_truncation)]
fn put_len(buf: &mut BytesMut, len: usize) {
    buf.put_u32(len as u32);
}

fn put_value(buf: &mut BytesMut, value: &FieldValue) {
    match value {
        FieldValue::String(s) => {
            buf.put_u8(TypeTag::String as u8);
            put_len(buf, s.len());
            buf.put_slice(s.as_bytes());
        }
        FieldValue::Float(v) => {
            buf.put_u8(TypeTag::Float as u8);
            buf.put_f64(*v);
        }
        FieldValue::Int(v) => {
            buf.put_u8(TypeTag::Int as u8);
            buf.put_i64(*v);
        }
        FieldValue::Blob(b) => {
            buf.put_u8(TypeTag::Blob as u8);
            put_len(buf, b.len());
            buf.put_slice(b);
        }
    }
}

/// Entries waiting to be written as one block
#[derive(Debug, Default)]
pub struct BinlogBuffer {
    data: BytesMut,
    count: usize,
}

impl BinlogBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry
    pub fn append<'a>(
        &mut self,
        opcode: Opcode,
        uni_key: &str,
        version: i64,
        fields: impl IntoIterator<Item = (&'a str, &'a FieldValue)>,
    ) {
        let buf = &mut self.data;
        buf.put_u8(opcode as u8);
        put_len(buf, uni_key.len());
        buf.put_slice(uni_key.as_bytes());
        buf.put_i64(version);

        // Field count is patched once the fields are written
        let count_at = buf.len();
        buf.put_u32(0);
        let mut field_count: u32 = 0;
        for (name, value) in fields {
            put_len(buf, name.len());
            buf.put_slice(name.as_bytes());
            put_value(buf, value);
            field_count += 1;
        }
        buf[count_at..count_at + 4].copy_from_slice(&field_count.to_be_bytes());

        self.count += 1;
    }

    /// Number of buffered entries
    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Take the buffered payload and entry count, leaving the buffer empty
    pub fn take(&mut self) -> (Bytes, usize) {
        let count = std::mem::take(&mut self.count);
        (self.data.split().freeze(), count)
    }
}

/// Bounds-checked reader over a block payload
struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(Error::corruption(format!(
                "truncated entry: need {n} bytes for {what}, have {}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self, what: &str) -> Result<u8> {
        self.need(1, what)?;
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        self.need(4, what)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self, what: &str) -> Result<u64> {
        self.need(8, what)?;
        Ok(self.buf.get_u64())
    }

    fn bytes(&mut self, what: &str) -> Result<&'a [u8]> {
        let len = self.u32(what)? as usize;
        self.need(len, what)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn string(&mut self, what: &str) -> Result<String> {
        let raw = self.bytes(what)?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| Error::corruption(format!("{what} is not UTF-8: {e}")))
    }

    #[allow(clippy::cast_possible_wrap)]
    fn value(&mut self) -> Result<FieldValue> {
        let tag = TypeTag::try_from(self.u8("value type")?)?;
        Ok(match tag {
            TypeTag::String => FieldValue::String(self.string("string value")?),
            TypeTag::Float => FieldValue::Float(f64::from_bits(self.u64("float value")?)),
            TypeTag::Int => FieldValue::Int(self.u64("int value")? as i64),
            TypeTag::Uint => {
                let v = self.u64("uint value")?;
                let v = i64::try_from(v)
                    .map_err(|_| Error::corruption(format!("uint value {v} out of range")))?;
                FieldValue::Int(v)
            }
            TypeTag::Blob => FieldValue::Blob(self.bytes("blob value")?.to_vec()),
        })
    }

    #[allow(clippy::cast_possible_wrap)]
    fn entry(&mut self) -> Result<BinlogEntry> {
        let opcode = Opcode::try_from(self.u8("opcode")?)?;
        let uni_key = self.string("key")?;
        let version = self.u64("version")? as i64;
        let field_count = self.u32("field count")?;
        let mut fields = Vec::with_capacity(field_count.min(1024) as usize);
        for _ in 0..field_count {
            let name = self.string("field name")?;
            let value = self.value()?;
            fields.push(Field { name, value });
        }
        Ok(BinlogEntry {
            opcode,
            uni_key,
            version,
            fields,
        })
    }
}

/// Decode every entry of a block payload
pub fn decode_entries(payload: &[u8]) -> Result<Vec<BinlogEntry>> {
    let mut cursor = Cursor { buf: payload };
    let mut entries = Vec::new();
    while cursor.buf.has_remaining() {
        entries.push(cursor.entry()?);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_layout() {
        let mut buffer = BinlogBuffer::new();
        let value = FieldValue::Int(7);
        buffer.append(Opcode::Update, "t:k", 2, [("a", &value)]);

        let (payload, count) = buffer.take();
        assert_eq!(count, 1);
        let mut expected = vec![2u8];
        expected.extend_from_slice(&3u32.to_be_bytes());
        expected.extend_from_slice(b"t:k");
        expected.extend_from_slice(&2i64.to_be_bytes());
        expected.extend_from_slice(&1u32.to_be_bytes());
        expected.extend_from_slice(&1u32.to_be_bytes());
        expected.extend_from_slice(b"a");
        expected.push(3);
        expected.extend_from_slice(&7i64.to_be_bytes());
        assert_eq!(&payload[..], &expected[..]);
        assert!(buffer.is_empty());
        assert_eq!(buffer.byte_len(), 0);
    }

    #[test]
    fn test_decode_mixed_entries() {
        let mut buffer = BinlogBuffer::new();
        let name = FieldValue::from("alice");
        let score = FieldValue::Float(2.5);
        let avatar = FieldValue::Blob(vec![0, 1, 2]);
        buffer.append(
            Opcode::Snapshot,
            "users:alice",
            3,
            [("name", &name), ("score", &score), ("avatar", &avatar)],
        );
        buffer.append(Opcode::Snapshot, "users:ghost", 1, std::iter::empty());
        buffer.append(Opcode::Kick, "users:bob", 0, std::iter::empty());

        let (payload, count) = buffer.take();
        let entries = decode_entries(&payload).unwrap();
        assert_eq!(entries.len(), count);
        assert_eq!(entries[0].opcode, Opcode::Snapshot);
        assert_eq!(entries[0].version, 3);
        assert_eq!(entries[0].fields[0], Field::new("name", "alice"));
        assert_eq!(entries[0].fields[2].value, FieldValue::Blob(vec![0, 1, 2]));
        assert!(entries[1].fields.is_empty());
        assert_eq!(entries[2].opcode, Opcode::Kick);
        assert_eq!(entries[2].uni_key, "users:bob");
    }

    #[test]
    fn test_decode_uint_tag() {
        let mut payload = vec![Opcode::Update as u8];
        payload.extend_from_slice(&3u32.to_be_bytes());
        payload.extend_from_slice(b"t:k");
        payload.extend_from_slice(&1i64.to_be_bytes());
        payload.extend_from_slice(&1u32.to_be_bytes());
        payload.extend_from_slice(&1u32.to_be_bytes());
        payload.extend_from_slice(b"n");
        payload.push(4);
        payload.extend_from_slice(&42u64.to_be_bytes());
        let entries = decode_entries(&payload).unwrap();
        assert_eq!(entries[0].fields[0].value, FieldValue::Int(42));

        let len = payload.len();
        payload[len - 8..].copy_from_slice(&u64::MAX.to_be_bytes());
        assert!(decode_entries(&payload).is_err());
    }

    #[test]
    fn test_decode_truncated() {
        let mut buffer = BinlogBuffer::new();
        let value = FieldValue::from("payload");
        buffer.append(Opcode::Snapshot, "t:k", 1, [("f", &value)]);
        let (payload, _) = buffer.take();

        let err = decode_entries(&payload[..payload.len() - 2]).unwrap_err();
        assert!(err.is_corruption());
        assert!(decode_entries(&[9]).unwrap_err().is_corruption());
    }
}
