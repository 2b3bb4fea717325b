//! Codec for the python-marshal dictionaries `p4 -G` writes on stdout.
//!
//! p4 emits marshal format 0 and uses only four of its tags: `{` opens a
//! dictionary, `s` is a length-prefixed byte string, `i` is a 32-bit
//! little-endian integer, and `0` terminates the dictionary. Anything else
//! in the stream means the output is not from `p4 -G` and is rejected.

use std::io::{self, BufRead, Read};

use thiserror::Error;

/// A single value inside a p4 result dictionary.
///
/// p4 writes nearly everything as byte strings; integers show up in fields
/// like `severity` and `generic` on error records.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Bytes(Vec<u8>),
    Int(i32),
}

impl Value {
    /// The value as UTF-8 text, replacing invalid sequences.
    pub fn as_text(&self) -> String {
        match self {
            Self::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Self::Int(i) => i.to_string(),
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            Self::Int(_) => None,
        }
    }
}

/// Errors produced while decoding a marshal stream.
#[derive(Debug, Error)]
pub enum MarshalError {
    #[error("unexpected marshal tag 0x{tag:02x} (not p4 -G output?)")]
    UnexpectedTag { tag: u8 },

    #[error("marshal stream truncated mid-object")]
    Truncated,

    #[error("marshal string length {len} exceeds sanity limit")]
    OversizedString { len: u32 },

    #[error("I/O error reading marshal stream: {0}")]
    Io(#[from] io::Error),
}

// A single fstat record for a large depot stays well under this; anything
// larger is a corrupt stream.
const MAX_STRING: u32 = 64 * 1024 * 1024;

/// Read one dictionary from the stream.
///
/// Returns `Ok(None)` on a clean EOF at an object boundary. EOF anywhere
/// inside an object is [`MarshalError::Truncated`].
pub fn read_dict(r: &mut impl BufRead) -> Result<Option<Vec<(Vec<u8>, Value)>>, MarshalError> {
    let tag = match read_tag(r)? {
        Some(t) => t,
        None => return Ok(None),
    };
    if tag != b'{' {
        return Err(MarshalError::UnexpectedTag { tag });
    }
    let mut entries = Vec::new();
    loop {
        let tag = read_tag(r)?.ok_or(MarshalError::Truncated)?;
        if tag == b'0' {
            return Ok(Some(entries));
        }
        let key = match read_value(r, tag)? {
            Value::Bytes(b) => b,
            Value::Int(i) => i.to_string().into_bytes(),
        };
        let tag = read_tag(r)?.ok_or(MarshalError::Truncated)?;
        let value = read_value(r, tag)?;
        entries.push((key, value));
    }
}

fn read_tag(r: &mut impl BufRead) -> Result<Option<u8>, MarshalError> {
    let mut buf = [0u8; 1];
    match r.read_exact(&mut buf) {
        Ok(()) => Ok(Some(buf[0])),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn read_value(r: &mut impl BufRead, tag: u8) -> Result<Value, MarshalError> {
    match tag {
        b's' => {
            let len = read_u32(r)?;
            if len > MAX_STRING {
                return Err(MarshalError::OversizedString { len });
            }
            let mut buf = vec![0u8; len as usize];
            r.read_exact(&mut buf).map_err(map_eof)?;
            Ok(Value::Bytes(buf))
        }
        b'i' => Ok(Value::Int(read_u32(r)? as i32)),
        other => Err(MarshalError::UnexpectedTag { tag: other }),
    }
}

fn read_u32(r: &mut impl Read) -> Result<u32, MarshalError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).map_err(map_eof)?;
    Ok(u32::from_le_bytes(buf))
}

fn map_eof(e: io::Error) -> MarshalError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        MarshalError::Truncated
    } else {
        MarshalError::Io(e)
    }
}

/// Encode a dictionary the way `p4 -G` would.
///
/// The inverse of [`read_dict`]; the production code only decodes, but test
/// fixtures standing in for p4 need to write the wire form.
pub fn write_dict(out: &mut Vec<u8>, entries: &[(&str, Value)]) {
    out.push(b'{');
    for (key, value) in entries {
        write_value(out, &Value::Bytes(key.as_bytes().to_vec()));
        write_value(out, value);
    }
    out.push(b'0');
}

fn write_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Bytes(b) => {
            out.push(b's');
            out.extend_from_slice(&(b.len() as u32).to_le_bytes());
            out.extend_from_slice(b);
        }
        Value::Int(i) => {
            out.push(b'i');
            out.extend_from_slice(&i.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn bytes(s: &str) -> Value {
        Value::Bytes(s.as_bytes().to_vec())
    }

    #[test]
    fn round_trips_a_stat_dict() {
        let mut wire = Vec::new();
        write_dict(
            &mut wire,
            &[
                ("code", bytes("stat")),
                ("depotFile", bytes("//depot/dir/a.txt")),
                ("headRev", bytes("3")),
            ],
        );
        let mut cursor = Cursor::new(wire);
        let dict = read_dict(&mut cursor).unwrap().unwrap();
        assert_eq!(dict.len(), 3);
        assert_eq!(dict[0], (b"code".to_vec(), bytes("stat")));
        assert_eq!(dict[1].1, bytes("//depot/dir/a.txt"));
        assert!(read_dict(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn decodes_integer_fields() {
        let mut wire = Vec::new();
        write_dict(
            &mut wire,
            &[
                ("code", bytes("error")),
                ("severity", Value::Int(3)),
                ("generic", Value::Int(38)),
            ],
        );
        let dict = read_dict(&mut Cursor::new(wire)).unwrap().unwrap();
        assert_eq!(dict[1].1, Value::Int(3));
        assert_eq!(dict[2].1.as_text(), "3");
    }

    #[test]
    fn multiple_dicts_stream_back_to_back() {
        let mut wire = Vec::new();
        write_dict(&mut wire, &[("code", bytes("stat"))]);
        write_dict(&mut wire, &[("code", bytes("info"))]);
        let mut cursor = Cursor::new(wire);
        assert!(read_dict(&mut cursor).unwrap().is_some());
        assert!(read_dict(&mut cursor).unwrap().is_some());
        assert!(read_dict(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn rejects_non_marshal_input() {
        let mut cursor = Cursor::new(b"Perforce password (P4PASSWD) invalid".to_vec());
        assert!(matches!(
            read_dict(&mut cursor),
            Err(MarshalError::UnexpectedTag { tag: b'P' })
        ));
    }

    #[test]
    fn truncation_inside_an_object_is_an_error() {
        let mut wire = Vec::new();
        write_dict(&mut wire, &[("code", bytes("stat"))]);
        wire.truncate(wire.len() - 3);
        assert!(matches!(
            read_dict(&mut Cursor::new(wire)),
            Err(MarshalError::Truncated)
        ));
    }
}
