//! Length-prefixed framing: `[len: u32le][payload]`, repeated until end of input.
//!
//! No magic, padding, checksum or trailing delimiter. The length is the exact payload byte count.

use byteorder::{ByteOrder, LittleEndian};
use std::io::Write;

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Default ceiling for a declared frame length on the read side (64 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Input ended with a partial header or a payload shorter than declared.
    #[error("Truncated stream: {remaining} unconsumed bytes at end of input")]
    Truncated { remaining: usize },
    #[error("Frame length {len} exceeds limit {max}")]
    TooLarge { len: usize, max: usize },
    #[error("Payload of {len} bytes does not fit a u32 length prefix")]
    PayloadTooLarge { len: usize },
}

/// Outcome of looking for one frame at the start of a buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Split<'a> {
    /// A full frame; `consumed` counts header plus payload.
    Frame { payload: &'a [u8], consumed: usize },
    /// Not enough bytes yet; at least `needed` more are required.
    Incomplete { needed: usize },
}

/// Write one already-encoded payload as a frame, for producers that drive
/// [`Codec`](crate::codec::Codec) themselves. [`Handler`](crate::handler::Handler) builds its
/// frames in place with [`begin_frame`] and [`finish_frame`] instead.
///
/// Callers that share `w` must hold its lock across this call.
pub fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> Result<(), std::io::Error> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            FrameError::PayloadTooLarge { len: payload.len() },
        )
    })?;
    let mut header = [0u8; HEADER_LEN];
    LittleEndian::write_u32(&mut header, len);
    w.write_all(&header)?;
    w.write_all(payload)
}

/// Reserve room for a header at the end of `buf`; the payload is appended after it and the
/// header patched by [`finish_frame`]. Returns the header offset.
pub fn begin_frame(buf: &mut Vec<u8>) -> usize {
    let start = buf.len();
    buf.extend_from_slice(&[0u8; HEADER_LEN]);
    start
}

/// Patch the length of the frame started at `start` in place.
pub fn finish_frame(buf: &mut [u8], start: usize) -> Result<(), FrameError> {
    let len = buf.len() - start - HEADER_LEN;
    let len32 = u32::try_from(len).map_err(|_| FrameError::PayloadTooLarge { len })?;
    LittleEndian::write_u32(&mut buf[start..start + HEADER_LEN], len32);
    Ok(())
}

/// Extract the first frame of `data` if it is complete.
///
/// A declared length above `max_len` is an error even before the payload arrives.
pub fn split_frame(data: &[u8], max_len: usize) -> Result<Split<'_>, FrameError> {
    if data.len() < HEADER_LEN {
        return Ok(Split::Incomplete { needed: HEADER_LEN - data.len() });
    }
    let len = LittleEndian::read_u32(&data[..HEADER_LEN]) as usize;
    if len > max_len {
        return Err(FrameError::TooLarge { len, max: max_len });
    }
    let end = HEADER_LEN + len;
    if data.len() < end {
        return Ok(Split::Incomplete { needed: end - data.len() });
    }
    Ok(Split::Frame { payload: &data[HEADER_LEN..end], consumed: end })
}

/// End-of-input check: leftover bytes mean the stream was cut mid-frame.
pub fn finish(remaining: usize) -> Result<(), FrameError> {
    if remaining == 0 {
        Ok(())
    } else {
        Err(FrameError::Truncated { remaining })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_little_endian_length() {
        let mut out = Vec::new();
        write_frame(&mut out, b"abc").expect("write");
        assert_eq!(out, [3, 0, 0, 0, b'a', b'b', b'c']);
    }

    #[test]
    fn in_place_header_matches_write_frame() {
        let mut buf = Vec::new();
        let start = begin_frame(&mut buf);
        buf.extend_from_slice(b"hello");
        finish_frame(&mut buf, start).expect("finish");

        let mut direct = Vec::new();
        write_frame(&mut direct, b"hello").expect("write");
        assert_eq!(buf, direct);
    }

    #[test]
    fn split_waits_for_header_and_payload() {
        assert_eq!(split_frame(&[1, 0], 16).expect("split"), Split::Incomplete { needed: 2 });
        assert_eq!(split_frame(&[3, 0, 0, 0, 9], 16).expect("split"), Split::Incomplete { needed: 2 });
        let data = [2, 0, 0, 0, 7, 8, 0xff];
        assert_eq!(
            split_frame(&data, 16).expect("split"),
            Split::Frame { payload: &[7, 8], consumed: 6 }
        );
    }

    #[test]
    fn zero_length_frame_is_complete() {
        assert_eq!(
            split_frame(&[0, 0, 0, 0], 16).expect("split"),
            Split::Frame { payload: &[], consumed: 4 }
        );
    }

    #[test]
    fn oversized_declaration_fails_early() {
        let err = split_frame(&[0xff, 0xff, 0, 0], 1024).expect_err("too large");
        assert!(matches!(err, FrameError::TooLarge { len: 65535, max: 1024 }));
    }

    #[test]
    fn leftovers_at_end_are_truncation() {
        assert!(finish(0).is_ok());
        assert!(matches!(finish(3), Err(FrameError::Truncated { remaining: 3 })));
    }
}
