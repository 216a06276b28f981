//! Encode/decode the payload of one framed [`Record`].
//!
//! All integers are little-endian. Strings and byte strings carry a `u32` length prefix, maps a
//! `u32` entry count. Every value starts with a one-byte tag naming its variant; see [`tag`].

use crate::record::{Level, Record};
use crate::value::{Group, Value};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, TimeDelta, Utc};
use std::io::{Cursor, Read};

/// Default limit on group nesting, counted from the top-level attribute map.
pub const DEFAULT_MAX_DEPTH: usize = 64;

const FLAG_TIME: u8 = 0b0000_0001;
const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Value tags on the wire.
pub mod tag {
    pub const EMPTY: u8 = 0;
    pub const BOOL: u8 = 1;
    pub const FLOAT: u8 = 2;
    pub const INT: u8 = 3;
    pub const UINT: u8 = 4;
    pub const STRING: u8 = 5;
    pub const TIME: u8 = 6;
    pub const DURATION: u8 = 7;
    pub const GROUP: u8 = 8;
    pub const OPAQUE: u8 = 9;
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("IO: {0}")]
    Io(std::io::Error),
    #[error("Payload truncated")]
    Truncated,
    #[error("Length field {len} exceeds remaining {remaining} bytes")]
    LengthOverflow { len: usize, remaining: usize },
    #[error("Unknown value tag: {0}")]
    UnknownTag(u8),
    #[error("Unknown level: {0}")]
    UnknownLevel(u8),
    #[error("Reserved flag bits set: {0:#04x}")]
    ReservedFlags(u8),
    #[error("Invalid bool byte: {0}")]
    InvalidBool(u8),
    #[error("Invalid UTF-8 in string")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("Invalid timestamp: {secs}s {nanos}ns")]
    InvalidTime { secs: i64, nanos: u32 },
    #[error("Invalid duration: {secs}s {nanos}ns")]
    InvalidDuration { secs: i64, nanos: i32 },
    #[error("Groups nested deeper than {0}")]
    TooDeep(usize),
    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),
}

impl From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            CodecError::Truncated
        } else {
            CodecError::Io(e)
        }
    }
}

/// Payload codec. Stateless apart from the nesting limit, so one instance can be shared.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    pub max_depth: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Codec { max_depth: DEFAULT_MAX_DEPTH }
    }
}

impl Codec {
    pub fn new(max_depth: usize) -> Self {
        Codec { max_depth }
    }

    /// Append the payload for `record` to `out`. On error `out` may hold a partial payload;
    /// callers discard it.
    pub fn encode_record(&self, record: &Record, out: &mut Vec<u8>) -> Result<(), CodecError> {
        let flags = if record.time.is_some() { FLAG_TIME } else { 0 };
        out.write_u8(flags)?;
        if let Some(t) = record.time {
            self.write_time(out, &t)?;
        }
        out.write_u8(record.level.to_wire())?;
        self.write_str(out, &record.message)?;
        self.write_map(out, &record.attrs, 0)
    }

    /// Decode exactly one record; the whole slice must be consumed.
    pub fn decode_record(&self, bytes: &[u8]) -> Result<Record, CodecError> {
        let mut r = Cursor::new(bytes);
        let flags = r.read_u8()?;
        if flags & !FLAG_TIME != 0 {
            return Err(CodecError::ReservedFlags(flags));
        }
        let time = if flags & FLAG_TIME != 0 { Some(self.read_time(&mut r)?) } else { None };
        let level_byte = r.read_u8()?;
        let level = Level::from_wire(level_byte).ok_or(CodecError::UnknownLevel(level_byte))?;
        let message = self.read_str(&mut r)?;
        let attrs = self.read_map(&mut r, 0)?;
        let rest = remaining(&r);
        if rest != 0 {
            return Err(CodecError::TrailingBytes(rest));
        }
        Ok(Record { time, message, level, attrs })
    }

    fn write_value(&self, w: &mut Vec<u8>, v: &Value, depth: usize) -> Result<(), CodecError> {
        match v {
            Value::Empty => w.write_u8(tag::EMPTY)?,
            Value::Bool(b) => {
                w.write_u8(tag::BOOL)?;
                w.write_u8(u8::from(*b))?;
            }
            Value::Float(x) => {
                w.write_u8(tag::FLOAT)?;
                w.write_f64::<LittleEndian>(*x)?;
            }
            Value::Int(x) => {
                w.write_u8(tag::INT)?;
                w.write_i64::<LittleEndian>(*x)?;
            }
            Value::Uint(x) => {
                w.write_u8(tag::UINT)?;
                w.write_u64::<LittleEndian>(*x)?;
            }
            Value::String(s) => {
                w.write_u8(tag::STRING)?;
                self.write_str(w, s)?;
            }
            Value::Time(t) => {
                w.write_u8(tag::TIME)?;
                self.write_time(w, t)?;
            }
            Value::Duration(d) => {
                w.write_u8(tag::DURATION)?;
                w.write_i64::<LittleEndian>(d.num_seconds())?;
                w.write_i32::<LittleEndian>(d.subsec_nanos())?;
            }
            Value::Group(g) => {
                w.write_u8(tag::GROUP)?;
                self.write_map(w, g, depth + 1)?;
            }
            Value::Opaque { type_tag, bytes } => {
                w.write_u8(tag::OPAQUE)?;
                self.write_str(w, type_tag)?;
                self.write_bytes(w, bytes)?;
            }
        }
        Ok(())
    }

    fn read_value(&self, r: &mut Cursor<&[u8]>, depth: usize) -> Result<Value, CodecError> {
        let t = r.read_u8()?;
        Ok(match t {
            tag::EMPTY => Value::Empty,
            tag::BOOL => match r.read_u8()? {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                b => return Err(CodecError::InvalidBool(b)),
            },
            tag::FLOAT => Value::Float(r.read_f64::<LittleEndian>()?),
            tag::INT => Value::Int(r.read_i64::<LittleEndian>()?),
            tag::UINT => Value::Uint(r.read_u64::<LittleEndian>()?),
            tag::STRING => Value::String(self.read_str(r)?),
            tag::TIME => Value::Time(self.read_time(r)?),
            tag::DURATION => {
                let secs = r.read_i64::<LittleEndian>()?;
                let nanos = r.read_i32::<LittleEndian>()?;
                Value::Duration(duration_from_parts(secs, nanos)?)
            }
            tag::GROUP => Value::Group(self.read_map(r, depth + 1)?),
            tag::OPAQUE => {
                let type_tag = self.read_str(r)?;
                let bytes = self.read_bytes(r)?;
                Value::Opaque { type_tag, bytes }
            }
            other => return Err(CodecError::UnknownTag(other)),
        })
    }

    fn write_map(&self, w: &mut Vec<u8>, g: &Group, depth: usize) -> Result<(), CodecError> {
        if depth > self.max_depth {
            return Err(CodecError::TooDeep(self.max_depth));
        }
        self.write_len(w, g.len())?;
        for (k, v) in g {
            self.write_str(w, k)?;
            self.write_value(w, v, depth)?;
        }
        Ok(())
    }

    fn read_map(&self, r: &mut Cursor<&[u8]>, depth: usize) -> Result<Group, CodecError> {
        if depth > self.max_depth {
            return Err(CodecError::TooDeep(self.max_depth));
        }
        let count = r.read_u32::<LittleEndian>()? as usize;
        // Each entry takes at least a key length and a tag.
        let rest = remaining(r);
        if count > rest / 5 {
            return Err(CodecError::LengthOverflow { len: count, remaining: rest });
        }
        let mut g = Group::with_capacity(count);
        for _ in 0..count {
            let k = self.read_str(r)?;
            let v = self.read_value(r, depth)?;
            g.insert(k, v);
        }
        Ok(g)
    }

    fn write_time(&self, w: &mut Vec<u8>, t: &DateTime<Utc>) -> Result<(), CodecError> {
        w.write_i64::<LittleEndian>(t.timestamp())?;
        w.write_u32::<LittleEndian>(t.timestamp_subsec_nanos())?;
        Ok(())
    }

    fn read_time(&self, r: &mut Cursor<&[u8]>) -> Result<DateTime<Utc>, CodecError> {
        let secs = r.read_i64::<LittleEndian>()?;
        let nanos = r.read_u32::<LittleEndian>()?;
        DateTime::from_timestamp(secs, nanos).ok_or(CodecError::InvalidTime { secs, nanos })
    }

    fn write_len(&self, w: &mut Vec<u8>, len: usize) -> Result<(), CodecError> {
        let len32 = u32::try_from(len)
            .map_err(|_| CodecError::LengthOverflow { len, remaining: u32::MAX as usize })?;
        w.write_u32::<LittleEndian>(len32)?;
        Ok(())
    }

    fn write_str(&self, w: &mut Vec<u8>, s: &str) -> Result<(), CodecError> {
        self.write_bytes(w, s.as_bytes())
    }

    fn write_bytes(&self, w: &mut Vec<u8>, b: &[u8]) -> Result<(), CodecError> {
        self.write_len(w, b.len())?;
        w.extend_from_slice(b);
        Ok(())
    }

    fn read_str(&self, r: &mut Cursor<&[u8]>) -> Result<String, CodecError> {
        Ok(String::from_utf8(self.read_bytes(r)?)?)
    }

    fn read_bytes(&self, r: &mut Cursor<&[u8]>) -> Result<Vec<u8>, CodecError> {
        let len = r.read_u32::<LittleEndian>()? as usize;
        let rest = remaining(r);
        if len > rest {
            return Err(CodecError::LengthOverflow { len, remaining: rest });
        }
        let mut buf = vec![0u8; len];
        r.read_exact(&mut buf)?;
        Ok(buf)
    }
}

fn remaining(r: &Cursor<&[u8]>) -> usize {
    r.get_ref().len().saturating_sub(r.position() as usize)
}

fn duration_from_parts(secs: i64, nanos: i32) -> Result<TimeDelta, CodecError> {
    let bad = || CodecError::InvalidDuration { secs, nanos };
    if i64::from(nanos).abs() >= NANOS_PER_SEC || (secs > 0 && nanos < 0) || (secs < 0 && nanos > 0) {
        return Err(bad());
    }
    TimeDelta::try_seconds(secs)
        .and_then(|s| s.checked_add(&TimeDelta::nanoseconds(i64::from(nanos))))
        .ok_or_else(bad)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Record {
        let mut inner = Group::new();
        inner.insert("e".into(), Value::String("f".into()));
        inner.insert("d".into(), Value::Duration(TimeDelta::milliseconds(-1500)));
        let mut attrs = Group::new();
        attrs.insert("a".into(), Value::Int(-7));
        attrs.insert("u".into(), Value::Uint(u64::MAX));
        attrs.insert("none".into(), Value::Empty);
        attrs.insert("G".into(), Value::Group(inner));
        attrs.insert(
            "blob".into(),
            Value::Opaque { type_tag: "rust/x".into(), bytes: b"{\"k\":1}".to_vec() },
        );
        Record {
            time: DateTime::from_timestamp(1_700_000_000, 123_456_789),
            message: "hello".into(),
            level: Level::Warn,
            attrs,
        }
    }

    fn encode(r: &Record) -> Vec<u8> {
        let mut out = Vec::new();
        Codec::default().encode_record(r, &mut out).expect("encode");
        out
    }

    #[test]
    fn record_survives_encoding() {
        let r = sample();
        let back = Codec::default().decode_record(&encode(&r)).expect("decode");
        assert_eq!(back, r);
    }

    #[test]
    fn missing_time_is_a_cleared_flag() {
        let r = Record { message: "m".into(), ..Record::default() };
        let bytes = encode(&r);
        assert_eq!(bytes[0], 0);
        let back = Codec::default().decode_record(&bytes).expect("decode");
        assert!(back.time.is_none());
        assert_eq!(back.level, Level::Unset);
    }

    #[test]
    fn empty_stays_empty() {
        let mut attrs = Group::new();
        attrs.insert("k".into(), Value::Empty);
        let r = Record { attrs, ..Record::default() };
        let back = Codec::default().decode_record(&encode(&r)).expect("decode");
        assert_eq!(back.attrs.get("k"), Some(&Value::Empty));
    }

    #[test]
    fn rejects_reserved_flags_and_unknown_level() {
        let r = Record::default();
        let mut bytes = encode(&r);
        bytes[0] = 0x80;
        assert!(matches!(Codec::default().decode_record(&bytes), Err(CodecError::ReservedFlags(0x80))));

        let mut bytes = encode(&r);
        bytes[1] = 9;
        assert!(matches!(Codec::default().decode_record(&bytes), Err(CodecError::UnknownLevel(9))));
    }

    #[test]
    fn rejects_trailing_and_truncated_payloads() {
        let mut bytes = encode(&sample());
        bytes.push(0);
        assert!(matches!(Codec::default().decode_record(&bytes), Err(CodecError::TrailingBytes(1))));

        let bytes = encode(&sample());
        let cut = &bytes[..bytes.len() - 3];
        let err = Codec::default().decode_record(cut).expect_err("truncated");
        assert!(matches!(err, CodecError::Truncated | CodecError::LengthOverflow { .. }), "{err}");
    }

    #[test]
    fn rejects_bad_bool_and_unknown_tag() {
        // flags=0, level=1, message="", one attr "b" -> tag
        let mut bytes = vec![0u8, 1, 0, 0, 0, 0, 1, 0, 0, 0, 1, 0, 0, 0, b'b'];
        let base = bytes.len();
        bytes.extend_from_slice(&[tag::BOOL, 2]);
        assert!(matches!(Codec::default().decode_record(&bytes), Err(CodecError::InvalidBool(2))));

        bytes.truncate(base);
        bytes.push(42);
        assert!(matches!(Codec::default().decode_record(&bytes), Err(CodecError::UnknownTag(42))));
    }

    #[test]
    fn rejects_mixed_sign_duration() {
        assert!(duration_from_parts(1, -1).is_err());
        assert!(duration_from_parts(0, 1_000_000_000).is_err());
        assert_eq!(duration_from_parts(-1, -500_000_000).expect("ok"), TimeDelta::milliseconds(-1500));
    }

    #[test]
    fn nesting_limit_applies_both_ways() {
        let mut v = Value::Int(1);
        for _ in 0..4 {
            let mut g = Group::new();
            g.insert("n".into(), v);
            v = Value::Group(g);
        }
        let mut attrs = Group::new();
        attrs.insert("root".into(), v);
        let r = Record { attrs, ..Record::default() };

        let shallow = Codec::new(2);
        assert!(matches!(shallow.encode_record(&r, &mut Vec::new()), Err(CodecError::TooDeep(2))));
        let bytes = encode(&r);
        assert!(matches!(shallow.decode_record(&bytes), Err(CodecError::TooDeep(2))));
        assert!(Codec::new(4).decode_record(&bytes).is_ok());
    }

    #[test]
    fn huge_length_field_is_rejected_before_allocating() {
        let mut bytes = vec![0u8, 1];
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            Codec::default().decode_record(&bytes),
            Err(CodecError::LengthOverflow { .. })
        ));
    }
}
