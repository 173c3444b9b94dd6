//! Byte-framing primitives shared by the multiplexer, the FSLS file channel,
//! and the control-message codec.
//!
//! Little/big-endian readers and writers, an ASCII-4 tag constructor, an
//! FNV-1a hash (used to detect SPS/PPS changes in the downstream H.264
//! stream), and a stateful Annex-B NAL-unit splitter.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("buffer too short: need {need} bytes, have {have}")]
    TooShort { need: usize, have: usize },
    #[error("ascii4 tag must be exactly 4 bytes, got {0}")]
    BadTagLength(usize),
    #[error("invalid utf-8 in payload")]
    InvalidUtf8,
}

/// Concatenate byte slices into a single owned buffer.
pub fn concat(parts: &[&[u8]]) -> Vec<u8> {
    let total: usize = parts.iter().map(|p| p.len()).sum();
    let mut out = Vec::with_capacity(total);
    for p in parts {
        out.extend_from_slice(p);
    }
    out
}

pub fn write_u16_le(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn write_u32_le(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn read_u16_le(buf: &[u8]) -> Result<u16, FramingError> {
    if buf.len() < 2 {
        return Err(FramingError::TooShort {
            need: 2,
            have: buf.len(),
        });
    }
    Ok(u16::from_le_bytes([buf[0], buf[1]]))
}

pub fn read_u32_le(buf: &[u8]) -> Result<u32, FramingError> {
    if buf.len() < 4 {
        return Err(FramingError::TooShort {
            need: 4,
            have: buf.len(),
        });
    }
    Ok(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))
}

pub fn write_u16_be(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub fn write_u32_be(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub fn write_i32_be(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub fn write_i8(buf: &mut Vec<u8>, v: i8) {
    buf.push(v as u8);
}

pub fn read_u16_be(buf: &[u8]) -> Result<u16, FramingError> {
    if buf.len() < 2 {
        return Err(FramingError::TooShort {
            need: 2,
            have: buf.len(),
        });
    }
    Ok(u16::from_be_bytes([buf[0], buf[1]]))
}

pub fn read_u32_be(buf: &[u8]) -> Result<u32, FramingError> {
    if buf.len() < 4 {
        return Err(FramingError::TooShort {
            need: 4,
            have: buf.len(),
        });
    }
    Ok(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]))
}

pub fn read_i32_be(buf: &[u8]) -> Result<i32, FramingError> {
    if buf.len() < 4 {
        return Err(FramingError::TooShort {
            need: 4,
            have: buf.len(),
        });
    }
    Ok(i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]))
}

pub fn read_i8(buf: &[u8]) -> Result<i8, FramingError> {
    if buf.is_empty() {
        return Err(FramingError::TooShort { need: 1, have: 0 });
    }
    Ok(buf[0] as i8)
}

pub fn encode_utf8(s: &str) -> Vec<u8> {
    s.as_bytes().to_vec()
}

pub fn decode_utf8(buf: &[u8]) -> Result<String, FramingError> {
    std::str::from_utf8(buf)
        .map(str::to_string)
        .map_err(|_| FramingError::InvalidUtf8)
}

/// A 4-byte ASCII tag such as `SHEL`, `FSLS`, `LIST`, `DENT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsciiTag([u8; 4]);

impl AsciiTag {
    pub fn new(s: &str) -> Result<Self, FramingError> {
        let bytes = s.as_bytes();
        if bytes.len() != 4 {
            return Err(FramingError::BadTagLength(bytes.len()));
        }
        let mut out = [0u8; 4];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> [u8; 4] {
        self.0
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("????")
    }
}

impl std::fmt::Display for AsciiTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// FNV-1a 32-bit hash, used to detect SPS/PPS change between successive
/// keyframes without decoding the NAL payload.
pub fn fnv1a_32(data: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET_BASIS;
    for &byte in data {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Minimum size of an Annex-B start code (`00 00 01`).
const SHORT_START_CODE_LEN: usize = 3;
/// Size of the long Annex-B start code (`00 00 00 01`).
const LONG_START_CODE_LEN: usize = 4;
/// Bound on retained buffer when no start code has been observed yet, to
/// cap memory use against malformed input.
const MAX_PREFIX_BUFFER: usize = 4096;

/// Stateful consumer of arbitrary-sized byte chunks that emits complete
/// Annex-B NAL units, each still carrying its leading start code.
///
/// Buffers until at least two start codes have been observed, then emits
/// everything strictly between consecutive start codes. The unit following
/// the last observed start code is only emitted on `flush()` (the terminal
/// call made when the owning channel closes).
#[derive(Default)]
pub struct AnnexBSplitter {
    buf: Vec<u8>,
}

impl AnnexBSplitter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed a chunk of bytes, returning zero or more complete NAL units.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();

        loop {
            let starts = find_start_codes(&self.buf);
            if starts.len() < 2 {
                break;
            }
            // Emit the unit between the first and second start code.
            let first = starts[0];
            let second = starts[1];
            let unit = self.buf[first..second].to_vec();
            out.push(unit);
            self.buf.drain(..second);
        }

        // No start code seen at all: cap retained buffer to bound memory.
        if find_start_codes(&self.buf).is_empty() && self.buf.len() > MAX_PREFIX_BUFFER {
            let overflow = self.buf.len() - MAX_PREFIX_BUFFER;
            self.buf.drain(..overflow);
        }

        out
    }

    /// Emit the trailing partial unit (everything from the last observed
    /// start code to the end of the buffer), if any. Call on channel close.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        let starts = find_start_codes(&self.buf);
        let last = *starts.last()?;
        let unit = self.buf[last..].to_vec();
        self.buf.clear();
        if unit.len() >= SHORT_START_CODE_LEN + 1 {
            Some(unit)
        } else {
            None
        }
    }
}

/// Find the byte offsets of every Annex-B start code in `buf`, preferring
/// the long (4-byte) form when both a short and long code would match at
/// the same offset.
fn find_start_codes(buf: &[u8]) -> Vec<usize> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + SHORT_START_CODE_LEN <= buf.len() {
        if buf[i] == 0 && buf[i + 1] == 0 && buf[i + 2] == 1 {
            starts.push(i);
            i += SHORT_START_CODE_LEN;
        } else if i + LONG_START_CODE_LEN <= buf.len()
            && buf[i] == 0
            && buf[i + 1] == 0
            && buf[i + 2] == 0
            && buf[i + 3] == 1
        {
            starts.push(i);
            i += LONG_START_CODE_LEN;
        } else {
            i += 1;
        }
    }
    starts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn le_roundtrip() {
        let mut buf = Vec::new();
        write_u16_le(&mut buf, 0x1234);
        write_u32_le(&mut buf, 0xdead_beef);
        assert_eq!(read_u16_le(&buf[0..2]).unwrap(), 0x1234);
        assert_eq!(read_u32_le(&buf[2..6]).unwrap(), 0xdead_beef);
    }

    #[test]
    fn be_roundtrip() {
        let mut buf = Vec::new();
        write_u16_be(&mut buf, 0x1234);
        write_u32_be(&mut buf, 0xdead_beef);
        write_i32_be(&mut buf, -42);
        write_i8(&mut buf, -1);
        assert_eq!(read_u16_be(&buf[0..2]).unwrap(), 0x1234);
        assert_eq!(read_u32_be(&buf[2..6]).unwrap(), 0xdead_beef);
        assert_eq!(read_i32_be(&buf[6..10]).unwrap(), -42);
        assert_eq!(read_i8(&buf[10..11]).unwrap(), -1);
    }

    #[test]
    fn short_reads_error() {
        assert!(read_u32_be(&[0, 0]).is_err());
        assert!(read_u16_le(&[]).is_err());
    }

    #[test]
    fn ascii_tag_rejects_wrong_length() {
        assert!(AsciiTag::new("FSL").is_err());
        assert!(AsciiTag::new("FSLSX").is_err());
        assert!(AsciiTag::new("FSLS").is_ok());
    }

    #[test]
    fn ascii_tag_display() {
        let tag = AsciiTag::new("LIST").unwrap();
        assert_eq!(tag.as_str(), "LIST");
        assert_eq!(tag.as_bytes(), *b"LIST");
    }

    #[test]
    fn fnv1a_is_deterministic_and_sensitive() {
        let a = fnv1a_32(b"hello world");
        let b = fnv1a_32(b"hello world");
        let c = fnv1a_32(b"hello worle");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn fnv1a_known_vector() {
        // FNV-1a 32-bit of the empty string is the offset basis.
        assert_eq!(fnv1a_32(b""), 0x811c_9dc5);
    }

    #[test]
    fn annex_b_splits_short_start_codes() {
        let mut splitter = AnnexBSplitter::new();
        let mut input = Vec::new();
        input.extend_from_slice(&[0, 0, 1, 0x67, 0xAA, 0xBB]); // SPS
        input.extend_from_slice(&[0, 0, 1, 0x68, 0xCC]); // PPS
        input.extend_from_slice(&[0, 0, 1, 0x65, 0x01, 0x02]); // IDR

        let units = splitter.push(&input);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0], vec![0, 0, 1, 0x67, 0xAA, 0xBB]);
        assert_eq!(units[1], vec![0, 0, 1, 0x68, 0xCC]);

        let trailing = splitter.flush().unwrap();
        assert_eq!(trailing, vec![0, 0, 1, 0x65, 0x01, 0x02]);
    }

    #[test]
    fn annex_b_handles_arbitrary_chunking() {
        let input: Vec<u8> = vec![
            0, 0, 0, 1, 0x67, 0xAA, 0xBB, 0, 0, 1, 0x68, 0xCC, 0, 0, 1, 0x65, 0x01,
        ];
        let mut splitter = AnnexBSplitter::new();
        let mut all_units = Vec::new();
        for chunk in input.chunks(3) {
            all_units.extend(splitter.push(chunk));
        }
        if let Some(last) = splitter.flush() {
            all_units.push(last);
        }
        assert_eq!(all_units.len(), 3);
        assert_eq!(all_units[0], vec![0, 0, 0, 1, 0x67, 0xAA, 0xBB]);
        assert_eq!(all_units[1], vec![0, 0, 1, 0x68, 0xCC]);
        assert_eq!(all_units[2], vec![0, 0, 1, 0x65, 0x01]);
    }

    #[test]
    fn annex_b_caps_buffer_when_no_start_code() {
        let mut splitter = AnnexBSplitter::new();
        let junk = vec![0xFFu8; MAX_PREFIX_BUFFER * 2];
        let units = splitter.push(&junk);
        assert!(units.is_empty());
        assert!(splitter.buf.len() <= MAX_PREFIX_BUFFER);
    }

    #[test]
    fn annex_b_flush_with_no_data_is_none() {
        let mut splitter = AnnexBSplitter::new();
        assert!(splitter.flush().is_none());
    }
}
