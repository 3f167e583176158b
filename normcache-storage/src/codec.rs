//! Binary record codec.
//!
//! Values are written as a one-byte tag followed by a payload. The most
//! common small values (null, booleans, zero, empty string/list/map) are a
//! single byte. Multi-byte integers and lengths are little-endian.

use normcache_core::{CacheError, CacheKey, ErrorValue, PathElement, Record, StorageError, Value};
use uuid::Uuid;

const RECORD_VERSION: u8 = 1;
const MAX_DEPTH: usize = 128;

const NULL: u8 = 0;
const FALSE: u8 = 1;
const TRUE: u8 = 2;
const INT_0: u8 = 3;
const INT_I8: u8 = 4;
const INT_I32: u8 = 5;
const INT_I64: u8 = 6;
const DOUBLE: u8 = 7;
const STRING_EMPTY: u8 = 8;
const STRING_SHORT: u8 = 9;
const STRING_LONG: u8 = 10;
const REFERENCE: u8 = 11;
const LIST_EMPTY: u8 = 12;
const LIST: u8 = 13;
const MAP_EMPTY: u8 = 14;
const MAP: u8 = 15;
const ERROR: u8 = 16;

const PATH_FIELD: u8 = 0;
const PATH_INDEX: u8 = 1;

/// Error type for record decoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Unexpected end of input at offset {0}")]
    UnexpectedEof(usize),

    #[error("Unknown tag {tag} at offset {offset}")]
    UnknownTag { tag: u8, offset: usize },

    #[error("Invalid UTF-8 at offset {0}")]
    InvalidUtf8(usize),

    #[error("Unsupported record version {0}")]
    UnsupportedVersion(u8),

    #[error("Value nesting exceeds the maximum depth")]
    TooDeep,

    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),
}

impl From<CodecError> for StorageError {
    fn from(e: CodecError) -> Self {
        StorageError::Codec {
            reason: e.to_string(),
        }
    }
}

impl From<CodecError> for CacheError {
    fn from(e: CodecError) -> Self {
        CacheError::Storage(e.into())
    }
}

// ============================================================================
// ENCODING
// ============================================================================

/// Encode a whole record.
pub fn encode_record(record: &Record) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    buf.push(RECORD_VERSION);
    write_str(&mut buf, record.key.as_str());

    write_len(&mut buf, record.fields.len());
    for (field_key, value) in &record.fields {
        write_str(&mut buf, field_key);
        write_value(&mut buf, value);
    }

    write_len(&mut buf, record.metadata.len());
    for (field_key, meta) in &record.metadata {
        write_str(&mut buf, field_key);
        write_len(&mut buf, meta.len());
        for (name, value) in meta {
            write_str(&mut buf, name);
            write_value(&mut buf, value);
        }
    }

    match record.mutation_id {
        Some(id) => {
            buf.push(1);
            buf.extend_from_slice(id.as_bytes());
        }
        None => buf.push(0),
    }
    buf
}

/// Size in bytes of the encoded record, used as its memory weight.
pub fn encoded_len(record: &Record) -> usize {
    encode_record(record).len()
}

/// Encode a single value.
pub fn encode_value(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    write_value(&mut buf, value);
    buf
}

fn write_len(buf: &mut Vec<u8>, len: usize) {
    buf.extend_from_slice(&(len as u32).to_le_bytes());
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    write_len(buf, s.len());
    buf.extend_from_slice(s.as_bytes());
}

fn write_value(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => buf.push(NULL),
        Value::Boolean(false) => buf.push(FALSE),
        Value::Boolean(true) => buf.push(TRUE),
        Value::Int(0) => buf.push(INT_0),
        Value::Int(i) => {
            if let Ok(small) = i8::try_from(*i) {
                buf.push(INT_I8);
                buf.extend_from_slice(&small.to_le_bytes());
            } else if let Ok(mid) = i32::try_from(*i) {
                buf.push(INT_I32);
                buf.extend_from_slice(&mid.to_le_bytes());
            } else {
                buf.push(INT_I64);
                buf.extend_from_slice(&i.to_le_bytes());
            }
        }
        Value::Double(d) => {
            buf.push(DOUBLE);
            buf.extend_from_slice(&d.to_bits().to_le_bytes());
        }
        Value::String(s) if s.is_empty() => buf.push(STRING_EMPTY),
        Value::String(s) if s.len() <= u8::MAX as usize => {
            buf.push(STRING_SHORT);
            buf.push(s.len() as u8);
            buf.extend_from_slice(s.as_bytes());
        }
        Value::String(s) => {
            buf.push(STRING_LONG);
            write_str(buf, s);
        }
        Value::Reference(key) => {
            buf.push(REFERENCE);
            write_str(buf, key.as_str());
        }
        Value::List(items) if items.is_empty() => buf.push(LIST_EMPTY),
        Value::List(items) => {
            buf.push(LIST);
            write_len(buf, items.len());
            for item in items {
                write_value(buf, item);
            }
        }
        Value::Object(obj) if obj.is_empty() => buf.push(MAP_EMPTY),
        Value::Object(obj) => {
            buf.push(MAP);
            write_len(buf, obj.len());
            for (name, v) in obj {
                write_str(buf, name);
                write_value(buf, v);
            }
        }
        Value::Error(err) => {
            buf.push(ERROR);
            write_str(buf, &err.message);
            write_len(buf, err.path.len());
            for element in &err.path {
                match element {
                    PathElement::Field(name) => {
                        buf.push(PATH_FIELD);
                        write_str(buf, name);
                    }
                    PathElement::Index(idx) => {
                        buf.push(PATH_INDEX);
                        buf.extend_from_slice(&(*idx as u64).to_le_bytes());
                    }
                }
            }
        }
    }
}

// ============================================================================
// DECODING
// ============================================================================

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or(CodecError::UnexpectedEof(self.pos))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn len(&mut self) -> Result<usize, CodecError> {
        Ok(u32::from_le_bytes(self.array()?) as usize)
    }

    fn str_of_len(&mut self, len: usize) -> Result<String, CodecError> {
        let start = self.pos;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| CodecError::InvalidUtf8(start))
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let len = self.len()?;
        self.str_of_len(len)
    }

    fn value(&mut self, depth: usize) -> Result<Value, CodecError> {
        if depth > MAX_DEPTH {
            return Err(CodecError::TooDeep);
        }
        let offset = self.pos;
        let tag = self.u8()?;
        let value = match tag {
            NULL => Value::Null,
            FALSE => Value::Boolean(false),
            TRUE => Value::Boolean(true),
            INT_0 => Value::Int(0),
            INT_I8 => Value::Int(i8::from_le_bytes(self.array()?) as i64),
            INT_I32 => Value::Int(i32::from_le_bytes(self.array()?) as i64),
            INT_I64 => Value::Int(i64::from_le_bytes(self.array()?)),
            DOUBLE => Value::Double(f64::from_bits(u64::from_le_bytes(self.array()?))),
            STRING_EMPTY => Value::String(String::new()),
            STRING_SHORT => {
                let len = self.u8()? as usize;
                Value::String(self.str_of_len(len)?)
            }
            STRING_LONG => Value::String(self.string()?),
            REFERENCE => Value::Reference(CacheKey::new(self.string()?)),
            LIST_EMPTY => Value::List(Vec::new()),
            LIST => {
                let count = self.len()?;
                let mut items = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    items.push(self.value(depth + 1)?);
                }
                Value::List(items)
            }
            MAP_EMPTY => Value::Object(Default::default()),
            MAP => {
                let count = self.len()?;
                let mut obj = normcache_core::Object::new();
                for _ in 0..count {
                    let name = self.string()?;
                    obj.insert(name, self.value(depth + 1)?);
                }
                Value::Object(obj)
            }
            ERROR => {
                let message = self.string()?;
                let count = self.len()?;
                let mut path = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    let element_offset = self.pos;
                    match self.u8()? {
                        PATH_FIELD => path.push(PathElement::Field(self.string()?)),
                        PATH_INDEX => {
                            let idx = u64::from_le_bytes(self.array()?);
                            path.push(PathElement::Index(idx as usize));
                        }
                        tag => {
                            return Err(CodecError::UnknownTag {
                                tag,
                                offset: element_offset,
                            })
                        }
                    }
                }
                Value::Error(ErrorValue { message, path })
            }
            tag => return Err(CodecError::UnknownTag { tag, offset }),
        };
        Ok(value)
    }
}

/// Decode a record produced by [`encode_record`].
pub fn decode_record(bytes: &[u8]) -> Result<Record, CodecError> {
    let mut reader = Reader::new(bytes);
    let version = reader.u8()?;
    if version != RECORD_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let mut record = Record::new(CacheKey::new(reader.string()?));

    let field_count = reader.len()?;
    for _ in 0..field_count {
        let field_key = reader.string()?;
        let value = reader.value(0)?;
        record.fields.insert(field_key, value);
    }

    let meta_count = reader.len()?;
    for _ in 0..meta_count {
        let field_key = reader.string()?;
        let entries = reader.len()?;
        let meta = record.metadata.entry(field_key).or_default();
        for _ in 0..entries {
            let name = reader.string()?;
            meta.insert(name, reader.value(0)?);
        }
    }

    record.mutation_id = match reader.u8()? {
        0 => None,
        1 => Some(Uuid::from_bytes(reader.array()?)),
        tag => {
            return Err(CodecError::UnknownTag {
                tag,
                offset: reader.pos - 1,
            })
        }
    };

    let trailing = bytes.len() - reader.pos;
    if trailing > 0 {
        return Err(CodecError::TrailingBytes(trailing));
    }
    Ok(record)
}

/// Decode a single value produced by [`encode_value`].
pub fn decode_value(bytes: &[u8]) -> Result<Value, CodecError> {
    let mut reader = Reader::new(bytes);
    let value = reader.value(0)?;
    let trailing = bytes.len() - reader.pos;
    if trailing > 0 {
        return Err(CodecError::TrailingBytes(trailing));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_small_values_are_one_byte() {
        for value in [
            Value::Null,
            Value::Boolean(true),
            Value::Boolean(false),
            Value::Int(0),
            Value::String(String::new()),
            Value::List(vec![]),
            Value::Object(Default::default()),
        ] {
            assert_eq!(encode_value(&value).len(), 1, "{:?}", value);
        }
    }

    #[test]
    fn test_integer_widths() {
        assert_eq!(encode_value(&Value::Int(-5)).len(), 2);
        assert_eq!(encode_value(&Value::Int(70_000)).len(), 5);
        assert_eq!(encode_value(&Value::Int(i64::MIN)).len(), 9);
        for i in [-5i64, 127, -128, 128, 70_000, i64::MIN, i64::MAX] {
            assert_eq!(decode_value(&encode_value(&Value::Int(i))), Ok(Value::Int(i)));
        }
    }

    #[test]
    fn test_short_and_long_strings() {
        let short = "x".repeat(255);
        let long = "y".repeat(256);
        assert_eq!(encode_value(&Value::from(short.as_str())).len(), 257);
        assert_eq!(encode_value(&Value::from(long.as_str())).len(), 261);
        assert_eq!(
            decode_value(&encode_value(&Value::from(long.as_str()))),
            Ok(Value::from(long))
        );
    }

    #[test]
    fn test_record_preserves_value_domain() {
        let mut record = Record::new(CacheKey::new("User:1"))
            .with_field("name", "Ann")
            .with_field("score", 1.5)
            .with_field("friend", CacheKey::new("User:2"))
            .with_field("tags", Value::from(json!(["a", null, 3, {"k": true}])))
            .with_field(
                "bio",
                Value::Error(ErrorValue::new(
                    "boom",
                    vec!["user".into(), 0usize.into(), "bio".into()],
                )),
            )
            .with_metadata("name", "received-date", 1_700_000_000i64);
        record.mutation_id = Some(Uuid::new_v4());

        let decoded = decode_record(&encode_record(&record)).expect("decodes");
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_truncated_input_rejected() {
        let record = Record::new(CacheKey::new("User:1")).with_field("name", "Ann");
        let bytes = encode_record(&record);
        for cut in 0..bytes.len() {
            assert!(decode_record(&bytes[..cut]).is_err(), "cut at {}", cut);
        }
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert_eq!(
            decode_value(&[99]),
            Err(CodecError::UnknownTag { tag: 99, offset: 0 })
        );
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        assert_eq!(decode_value(&[NULL, NULL]), Err(CodecError::TrailingBytes(1)));
    }

    #[test]
    fn test_codec_error_maps_to_storage_error() {
        let err: CacheError = CodecError::TooDeep.into();
        assert!(matches!(err, CacheError::Storage(StorageError::Codec { .. })));
    }
}
