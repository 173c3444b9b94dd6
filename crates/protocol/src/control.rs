//! Control-message codecs for the scrcpy-facing wire protocol: the 36-byte
//! stream config sent once per stream, and the touch/key/scroll/text
//! messages sent continuously while a session streams.

use thiserror::Error;

use crate::framing::{
    read_i32_be, read_u16_be, read_u32_be, read_u32_le, write_i32_be, write_u16_be, write_u16_le,
    write_u32_be, write_u32_le, FramingError,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error("expected message type {expected}, got {got}")]
    WrongType { expected: u8, got: u8 },
    #[error("stream config must be exactly 36 bytes, got {0}")]
    BadStreamConfigLen(usize),
    #[error("text message missing trailing NUL terminator")]
    MissingTerminator,
    #[error("text payload is not valid utf-8")]
    BadUtf8,
}

const STREAM_CONFIG_LEN: usize = 36;
const STREAM_CONFIG_TYPE: u8 = 0x65;

const KEY_TYPE: u8 = 0;
const KEY_LEN: usize = 14;

const TEXT_TYPE: u8 = 1;

const TOUCH_TYPE: u8 = 2;
const TOUCH_LEN: usize = 29;

const SCROLL_TYPE: u8 = 3;
const SCROLL_LEN: usize = 21;

/// The 36-byte stream configuration the browser sends as the first frame on
/// a scrcpy stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub bitrate: u32,
    pub max_fps: u8,
    pub i_frame_interval: u8,
    pub width: u16,
    pub height: u16,
    pub send_frame_meta: bool,
    /// `None` represents the wire sentinel `0xFF` ("-1", unlocked).
    pub locked_video_orientation: Option<u8>,
    pub display_id: u32,
}

impl StreamConfig {
    pub fn build(&self) -> [u8; STREAM_CONFIG_LEN] {
        let mut buf = [0u8; STREAM_CONFIG_LEN];
        buf[0] = STREAM_CONFIG_TYPE;
        // bitrate/256, little-endian, occupying bytes 1..=4
        let encoded_bitrate = (self.bitrate / 256).to_le_bytes();
        buf[1..5].copy_from_slice(&encoded_bitrate);
        buf[8] = self.max_fps;
        buf[9] = self.i_frame_interval;
        buf[10..12].copy_from_slice(&self.width.to_be_bytes());
        buf[12..14].copy_from_slice(&self.height.to_be_bytes());
        buf[22] = self.send_frame_meta as u8;
        buf[23] = self.locked_video_orientation.unwrap_or(0xFF);
        buf[24..28].copy_from_slice(&self.display_id.to_le_bytes());
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<Self, ControlError> {
        if buf.len() != STREAM_CONFIG_LEN {
            return Err(ControlError::BadStreamConfigLen(buf.len()));
        }
        if buf[0] != STREAM_CONFIG_TYPE {
            return Err(ControlError::WrongType {
                expected: STREAM_CONFIG_TYPE,
                got: buf[0],
            });
        }
        let mut bitrate_bytes = [0u8; 4];
        bitrate_bytes.copy_from_slice(&buf[1..5]);
        let bitrate = u32::from_le_bytes(bitrate_bytes) * 256;
        let max_fps = buf[8];
        let i_frame_interval = buf[9];
        let width = read_u16_be(&buf[10..12])?;
        let height = read_u16_be(&buf[12..14])?;
        let send_frame_meta = buf[22] != 0;
        let locked_video_orientation = if buf[23] == 0xFF { None } else { Some(buf[23]) };
        let display_id = read_u32_le(&buf[24..28])?;
        Ok(Self {
            bitrate,
            max_fps,
            i_frame_interval,
            width,
            height,
            send_frame_meta,
            locked_video_orientation,
            display_id,
        })
    }
}

/// `[type=2][action u8][u32 zero][u32 pointerId][u32 x][u32 y][u16 screenW]
/// [u16 screenH][u16 pressure*65535][u32 buttons]`, all big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TouchMessage {
    pub action: u8,
    pub pointer_id: u32,
    pub x: u32,
    pub y: u32,
    pub screen_width: u16,
    pub screen_height: u16,
    pub pressure: u16,
    pub buttons: u32,
}

impl TouchMessage {
    pub fn build(&self) -> [u8; TOUCH_LEN] {
        let mut buf = Vec::with_capacity(TOUCH_LEN);
        buf.push(TOUCH_TYPE);
        buf.push(self.action);
        write_u32_be(&mut buf, 0);
        write_u32_be(&mut buf, self.pointer_id);
        write_u32_be(&mut buf, self.x);
        write_u32_be(&mut buf, self.y);
        write_u16_be(&mut buf, self.screen_width);
        write_u16_be(&mut buf, self.screen_height);
        write_u16_be(&mut buf, self.pressure);
        write_u32_be(&mut buf, self.buttons);
        let mut out = [0u8; TOUCH_LEN];
        out.copy_from_slice(&buf);
        out
    }

    pub fn parse(buf: &[u8]) -> Result<Self, ControlError> {
        if buf.len() != TOUCH_LEN {
            return Err(ControlError::Framing(FramingError::TooShort {
                need: TOUCH_LEN,
                have: buf.len(),
            }));
        }
        if buf[0] != TOUCH_TYPE {
            return Err(ControlError::WrongType {
                expected: TOUCH_TYPE,
                got: buf[0],
            });
        }
        let action = buf[1];
        let pointer_id = read_u32_be(&buf[6..10])?;
        let x = read_u32_be(&buf[10..14])?;
        let y = read_u32_be(&buf[14..18])?;
        let screen_width = read_u16_be(&buf[18..20])?;
        let screen_height = read_u16_be(&buf[20..22])?;
        let pressure = read_u16_be(&buf[22..24])?;
        let buttons = read_u32_be(&buf[24..28])?;
        Ok(Self {
            action,
            pointer_id,
            x,
            y,
            screen_width,
            screen_height,
            pressure,
            buttons,
        })
    }
}

/// `[type=0][action u8][u32 keycode][u32 repeat][u32 meta]`, big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyMessage {
    pub action: u8,
    pub keycode: u32,
    pub repeat: u32,
    pub meta: u32,
}

impl KeyMessage {
    pub fn build(&self) -> [u8; KEY_LEN] {
        let mut buf = Vec::with_capacity(KEY_LEN);
        buf.push(KEY_TYPE);
        buf.push(self.action);
        write_u32_be(&mut buf, self.keycode);
        write_u32_be(&mut buf, self.repeat);
        write_u32_be(&mut buf, self.meta);
        let mut out = [0u8; KEY_LEN];
        out.copy_from_slice(&buf);
        out
    }

    pub fn parse(buf: &[u8]) -> Result<Self, ControlError> {
        if buf.len() != KEY_LEN {
            return Err(ControlError::Framing(FramingError::TooShort {
                need: KEY_LEN,
                have: buf.len(),
            }));
        }
        if buf[0] != KEY_TYPE {
            return Err(ControlError::WrongType {
                expected: KEY_TYPE,
                got: buf[0],
            });
        }
        let action = buf[1];
        let keycode = read_u32_be(&buf[2..6])?;
        let repeat = read_u32_be(&buf[6..10])?;
        let meta = read_u32_be(&buf[10..14])?;
        Ok(Self {
            action,
            keycode,
            repeat,
            meta,
        })
    }
}

/// `[type=3][u32 x][u32 y][u16 w][u16 h][i32 hScroll][i32 vScroll]`, big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollMessage {
    pub x: u32,
    pub y: u32,
    pub width: u16,
    pub height: u16,
    pub h_scroll: i32,
    pub v_scroll: i32,
}

impl ScrollMessage {
    pub fn build(&self) -> [u8; SCROLL_LEN] {
        let mut buf = Vec::with_capacity(SCROLL_LEN);
        buf.push(SCROLL_TYPE);
        write_u32_be(&mut buf, self.x);
        write_u32_be(&mut buf, self.y);
        write_u16_be(&mut buf, self.width);
        write_u16_be(&mut buf, self.height);
        write_i32_be(&mut buf, self.h_scroll);
        write_i32_be(&mut buf, self.v_scroll);
        let mut out = [0u8; SCROLL_LEN];
        out.copy_from_slice(&buf);
        out
    }

    pub fn parse(buf: &[u8]) -> Result<Self, ControlError> {
        if buf.len() != SCROLL_LEN {
            return Err(ControlError::Framing(FramingError::TooShort {
                need: SCROLL_LEN,
                have: buf.len(),
            }));
        }
        if buf[0] != SCROLL_TYPE {
            return Err(ControlError::WrongType {
                expected: SCROLL_TYPE,
                got: buf[0],
            });
        }
        let x = read_u32_be(&buf[1..5])?;
        let y = read_u32_be(&buf[5..9])?;
        let width = read_u16_be(&buf[9..11])?;
        let height = read_u16_be(&buf[11..13])?;
        let h_scroll = read_i32_be(&buf[13..17])?;
        let v_scroll = read_i32_be(&buf[17..21])?;
        Ok(Self {
            x,
            y,
            width,
            height,
            h_scroll,
            v_scroll,
        })
    }
}

/// `[type=1][utf-8 bytes][0x00]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextMessage {
    pub text: String,
}

impl TextMessage {
    pub fn build(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + self.text.len());
        buf.push(TEXT_TYPE);
        buf.extend_from_slice(self.text.as_bytes());
        buf.push(0x00);
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<Self, ControlError> {
        if buf.is_empty() || buf[0] != TEXT_TYPE {
            return Err(ControlError::WrongType {
                expected: TEXT_TYPE,
                got: buf.first().copied().unwrap_or(0),
            });
        }
        let rest = &buf[1..];
        let (last, body) = rest.split_last().ok_or(ControlError::MissingTerminator)?;
        if *last != 0x00 {
            return Err(ControlError::MissingTerminator);
        }
        let text = std::str::from_utf8(body)
            .map_err(|_| ControlError::BadUtf8)?
            .to_string();
        Ok(Self { text })
    }
}
