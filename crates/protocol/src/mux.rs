//! Outer multiplexer wire frame: `[type: u8][channel_id: u32-LE][payload...]`.
//!
//! This is the byte-level codec only; channel lifecycle and the channel
//! registry live in `tether-server::mux`.

use thiserror::Error;

use crate::framing::{read_u16_le, read_u32_le, write_u16_le, write_u32_le, FramingError};

pub const FRAME_HEADER_LEN: usize = 5; // type (1) + channel_id (4)

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MuxFrameError {
    #[error("frame shorter than header: {0}")]
    TooShort(#[from] FramingError),
    #[error("unknown frame type byte {0:#04x}")]
    UnknownType(u8),
    #[error("close-channel payload truncated")]
    TruncatedClose,
    #[error("close-channel reason is not valid utf-8")]
    BadCloseReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    CreateChannel = 4,
    CloseChannel = 8,
    RawBinaryData = 16,
    RawStringData = 32,
    Data = 64,
}

impl FrameType {
    pub fn from_byte(b: u8) -> Result<Self, MuxFrameError> {
        match b {
            4 => Ok(Self::CreateChannel),
            8 => Ok(Self::CloseChannel),
            16 => Ok(Self::RawBinaryData),
            32 => Ok(Self::RawStringData),
            64 => Ok(Self::Data),
            other => Err(MuxFrameError::UnknownType(other)),
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A decoded outer frame: type, target channel id, and opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxFrame {
    pub frame_type: FrameType,
    pub channel_id: u32,
    pub payload: Vec<u8>,
}

impl MuxFrame {
    pub fn new(frame_type: FrameType, channel_id: u32, payload: Vec<u8>) -> Self {
        Self {
            frame_type,
            channel_id,
            payload,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        buf.push(self.frame_type.as_byte());
        write_u32_le(&mut buf, self.channel_id);
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MuxFrameError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(MuxFrameError::TooShort(FramingError::TooShort {
                need: FRAME_HEADER_LEN,
                have: buf.len(),
            }));
        }
        let frame_type = FrameType::from_byte(buf[0])?;
        let channel_id = read_u32_le(&buf[1..5])?;
        let payload = buf[5..].to_vec();
        Ok(Self {
            frame_type,
            channel_id,
            payload,
        })
    }
}

/// Payload of a `CloseChannel` frame: `[code: u16-LE][reason_len: u32-LE][reason utf-8]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseChannelPayload {
    pub code: u16,
    pub reason: String,
}

impl CloseChannelPayload {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let reason_bytes = self.reason.as_bytes();
        let mut buf = Vec::with_capacity(6 + reason_bytes.len());
        write_u16_le(&mut buf, self.code);
        write_u32_le(&mut buf, reason_bytes.len() as u32);
        buf.extend_from_slice(reason_bytes);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MuxFrameError> {
        if buf.len() < 6 {
            return Err(MuxFrameError::TruncatedClose);
        }
        let code = read_u16_le(&buf[0..2]).map_err(|_| MuxFrameError::TruncatedClose)?;
        let reason_len = read_u32_le(&buf[2..6]).map_err(|_| MuxFrameError::TruncatedClose)? as usize;
        let reason_bytes = buf.get(6..6 + reason_len).ok_or(MuxFrameError::TruncatedClose)?;
        let reason = std::str::from_utf8(reason_bytes)
            .map_err(|_| MuxFrameError::BadCloseReason)?
            .to_string();
        Ok(Self { code, reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip_each_type() {
        for ft in [
            FrameType::CreateChannel,
            FrameType::CloseChannel,
            FrameType::RawBinaryData,
            FrameType::RawStringData,
            FrameType::Data,
        ] {
            let frame = MuxFrame::new(ft, 42, vec![1, 2, 3]);
            let encoded = frame.encode();
            let decoded = MuxFrame::decode(&encoded).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn frame_roundtrip_empty_payload() {
        let frame = MuxFrame::new(FrameType::RawBinaryData, 0, vec![]);
        let encoded = frame.encode();
        assert_eq!(encoded.len(), FRAME_HEADER_LEN);
        assert_eq!(MuxFrame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn unknown_type_byte_errors() {
        let buf = [99u8, 0, 0, 0, 0];
        assert_eq!(
            MuxFrame::decode(&buf).unwrap_err(),
            MuxFrameError::UnknownType(99)
        );
    }

    #[test]
    fn too_short_errors() {
        assert!(MuxFrame::decode(&[4, 0, 0]).is_err());
    }

    #[test]
    fn close_channel_payload_roundtrip() {
        let payload = CloseChannelPayload::new(1000, "goodbye");
        let encoded = payload.encode();
        assert_eq!(CloseChannelPayload::decode(&encoded).unwrap(), payload);
    }

    #[test]
    fn close_channel_payload_empty_reason() {
        let payload = CloseChannelPayload::new(1000, "");
        let encoded = payload.encode();
        assert_eq!(CloseChannelPayload::decode(&encoded).unwrap(), payload);
    }

    #[test]
    fn close_channel_payload_truncated() {
        assert_eq!(
            CloseChannelPayload::decode(&[0, 0]).unwrap_err(),
            MuxFrameError::TruncatedClose
        );
    }

    #[test]
    fn close_channel_payload_bad_reason_len() {
        let mut buf = Vec::new();
        write_u16_le(&mut buf, 0);
        write_u32_le(&mut buf, 100); // claims 100 bytes of reason, has none
        assert_eq!(
            CloseChannelPayload::decode(&buf).unwrap_err(),
            MuxFrameError::TruncatedClose
        );
    }

    #[test]
    fn nested_data_frame_carries_inner_frame() {
        let inner = MuxFrame::new(FrameType::RawStringData, 7, b"hi".to_vec());
        let outer = MuxFrame::new(FrameType::Data, 3, inner.encode());
        let encoded = outer.encode();
        let decoded = MuxFrame::decode(&encoded).unwrap();
        let reencoded_inner = MuxFrame::decode(&decoded.payload).unwrap();
        assert_eq!(reencoded_inner, inner);
    }
}
