//! Tagged argument values passed to the child entry point
//!
//! The parent serializes each argument to one opaque blob; the spawner
//! forwards blobs without looking at them; the child decodes them back just
//! before dispatch. The codec is a stable little-endian tag-byte format, so
//! parent and child binaries built from the same crate version always agree.

use super::{DecodeError, Reader};

const TAG_BYTES: u8 = 0;
const TAG_TEXT: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_BOOL: u8 = 4;
const TAG_LIST: u8 = 5;

/// One argument for a child entry point.
///
/// The permitted shapes are deliberately small; richer structures serialize
/// into `Bytes` with whatever codec the caller prefers.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Bytes(Vec<u8>),
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Vec<ArgValue>),
}

impl ArgValue {
    /// Serialize to one opaque blob
    pub fn to_blob(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write(&mut buf);
        buf
    }

    /// Deserialize one blob produced by [`ArgValue::to_blob`]
    pub fn from_blob(blob: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(blob);
        let value = Self::read(&mut r)?;
        r.finish()?;
        Ok(value)
    }

    fn write(&self, buf: &mut Vec<u8>) {
        match self {
            ArgValue::Bytes(b) => {
                buf.push(TAG_BYTES);
                buf.extend_from_slice(&(b.len() as u32).to_le_bytes());
                buf.extend_from_slice(b);
            }
            ArgValue::Text(s) => {
                buf.push(TAG_TEXT);
                buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
            ArgValue::Int(i) => {
                buf.push(TAG_INT);
                buf.extend_from_slice(&i.to_le_bytes());
            }
            ArgValue::Float(f) => {
                buf.push(TAG_FLOAT);
                buf.extend_from_slice(&f.to_le_bytes());
            }
            ArgValue::Bool(b) => {
                buf.push(TAG_BOOL);
                buf.push(u8::from(*b));
            }
            ArgValue::List(items) => {
                buf.push(TAG_LIST);
                buf.extend_from_slice(&(items.len() as u32).to_le_bytes());
                for item in items {
                    item.write(buf);
                }
            }
        }
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        match r.u8()? {
            TAG_BYTES => Ok(ArgValue::Bytes(r.bytes()?.to_vec())),
            TAG_TEXT => Ok(ArgValue::Text(r.string()?)),
            TAG_INT => Ok(ArgValue::Int(r.i64()?)),
            TAG_FLOAT => Ok(ArgValue::Float(r.f64()?)),
            TAG_BOOL => Ok(ArgValue::Bool(r.u8()? != 0)),
            TAG_LIST => {
                let count = r.u32()? as usize;
                let mut items = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    items.push(Self::read(r)?);
                }
                Ok(ArgValue::List(items))
            }
            tag => Err(DecodeError::BadTag(tag)),
        }
    }

    /// Encode a slice of values to the blob sequence carried by a request
    pub fn encode_all(values: &[ArgValue]) -> Vec<Vec<u8>> {
        values.iter().map(ArgValue::to_blob).collect()
    }

    /// Decode the blob sequence carried by a request
    pub fn decode_all(blobs: &[Vec<u8>]) -> Result<Vec<ArgValue>, DecodeError> {
        blobs.iter().map(|b| ArgValue::from_blob(b)).collect()
    }
}

impl From<&str> for ArgValue {
    fn from(s: &str) -> Self {
        ArgValue::Text(s.to_string())
    }
}

impl From<i64> for ArgValue {
    fn from(i: i64) -> Self {
        ArgValue::Int(i)
    }
}

impl From<Vec<u8>> for ArgValue {
    fn from(b: Vec<u8>) -> Self {
        ArgValue::Bytes(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_roundtrips() {
        for value in [
            ArgValue::Text("héllo".to_string()),
            ArgValue::Int(-7),
            ArgValue::Float(2.5),
            ArgValue::Bool(true),
            ArgValue::Bytes(vec![0, 255, 1]),
        ] {
            assert_eq!(ArgValue::from_blob(&value.to_blob()).unwrap(), value);
        }
    }

    #[test]
    fn test_nested_list_roundtrip() {
        let value = ArgValue::List(vec![
            ArgValue::Int(1),
            ArgValue::List(vec![ArgValue::Text("x".into()), ArgValue::Bool(false)]),
        ]);
        assert_eq!(ArgValue::from_blob(&value.to_blob()).unwrap(), value);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let err = ArgValue::from_blob(&[0x77]).unwrap_err();
        assert_eq!(err, DecodeError::BadTag(0x77));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut blob = ArgValue::Bool(true).to_blob();
        blob.push(0);
        assert_eq!(
            ArgValue::from_blob(&blob).unwrap_err(),
            DecodeError::TrailingBytes(1)
        );
    }

    #[test]
    fn test_truncated_int_rejected() {
        let blob = ArgValue::Int(12345).to_blob();
        let err = ArgValue::from_blob(&blob[..5]).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated(_)));
    }

    #[test]
    fn test_encode_decode_all() {
        let values = vec![ArgValue::from("a"), ArgValue::from(9i64)];
        let blobs = ArgValue::encode_all(&values);
        assert_eq!(blobs.len(), 2);
        assert_eq!(ArgValue::decode_all(&blobs).unwrap(), values);
    }
}
