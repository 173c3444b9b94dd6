//! FSLS: the file-system list/stat/push channel layered over mux grandchild
//! channels (spec §4.8). Binary frame shapes are grounded on
//! `tether-protocol`'s fixed-header primitives (`framing.rs`); the push
//! sub-protocol's chunked-with-ack state machine is grounded on the
//! agent's `FileTransferManager` (`filetransfer.rs`), adapted from
//! base64-over-JSON chunks to raw binary frames with per-step ACKs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tether_protocol::{read_i8, read_i32_be, read_u16_be, read_u32_le, write_i8, write_i32_be, write_u16_be, write_u32_le, FramingError};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

const PUSH_FRAME_TYPE: u8 = 102;
const ACK_TIMEOUT: Duration = Duration::from_secs(10);
const FINISH_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_FILE_SIZE: i32 = 200 * 1024 * 1024;
const MAX_FILENAME_LEN: usize = 255;

#[derive(Debug, Error)]
pub enum FslsError {
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error("unknown FSLS opcode {0:?}")]
    UnknownOp([u8; 4]),
    #[error("invalid filename: {0}")]
    BadFilename(String),
    #[error("file too large: {0} bytes")]
    TooLarge(i32),
    #[error("ack timed out")]
    AckTimeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FslsOp {
    List,
    Stat,
    Recv,
    Send,
}

impl FslsOp {
    pub fn from_tag(tag: &[u8; 4]) -> Result<Self, FslsError> {
        match tag {
            b"LIST" => Ok(Self::List),
            b"STAT" => Ok(Self::Stat),
            b"RECV" => Ok(Self::Recv),
            b"SEND" => Ok(Self::Send),
            other => Err(FslsError::UnknownOp(*other)),
        }
    }
}

/// `u32-LE path_len | path`, shared by LIST/STAT/RECV init bodies.
pub fn encode_path_body(path: &str) -> Vec<u8> {
    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(4 + bytes.len());
    write_u32_le(&mut out, bytes.len() as u32);
    out.extend_from_slice(bytes);
    out
}

pub fn decode_path_body(buf: &[u8]) -> Result<String, FslsError> {
    let len = read_u32_le(buf)? as usize;
    let path_bytes = buf.get(4..4 + len).ok_or(FramingError::TooShort {
        need: 4 + len,
        have: buf.len(),
    })?;
    Ok(tether_protocol::decode_utf8(path_bytes)?)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DentFrame {
    pub mode: u32,
    pub size: u32,
    pub mtime_s: u32,
    pub name: String,
}

impl DentFrame {
    pub fn is_dir(&self) -> bool {
        (self.mode & 0o170000) == 0o040000
    }

    pub fn mtime_ms(&self) -> u64 {
        self.mtime_s as u64 * 1000
    }

    pub fn encode(&self) -> Vec<u8> {
        let name_bytes = self.name.as_bytes();
        let mut out = Vec::with_capacity(16 + name_bytes.len());
        write_u32_le(&mut out, self.mode);
        write_u32_le(&mut out, self.size);
        write_u32_le(&mut out, self.mtime_s);
        write_u32_le(&mut out, name_bytes.len() as u32);
        out.extend_from_slice(name_bytes);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FslsError> {
        let mode = read_u32_le(&buf[0..4.min(buf.len())])?;
        let size = read_u32_le(buf.get(4..8).ok_or(FramingError::TooShort { need: 8, have: buf.len() })?)?;
        let mtime_s = read_u32_le(buf.get(8..12).ok_or(FramingError::TooShort { need: 12, have: buf.len() })?)?;
        let name_len = read_u32_le(buf.get(12..16).ok_or(FramingError::TooShort { need: 16, have: buf.len() })?)? as usize;
        let name_bytes = buf.get(16..16 + name_len).ok_or(FramingError::TooShort {
            need: 16 + name_len,
            have: buf.len(),
        })?;
        Ok(Self {
            mode,
            size,
            mtime_s,
            name: tether_protocol::decode_utf8(name_bytes)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFrame {
    pub mode: u32,
    pub size: u32,
    pub mtime_s: u32,
}

impl StatFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12);
        write_u32_le(&mut out, self.mode);
        write_u32_le(&mut out, self.size);
        write_u32_le(&mut out, self.mtime_s);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FslsError> {
        if buf.len() < 12 {
            return Err(FramingError::TooShort { need: 12, have: buf.len() }.into());
        }
        Ok(Self {
            mode: read_u32_le(&buf[0..4])?,
            size: read_u32_le(&buf[4..8])?,
            mtime_s: read_u32_le(&buf[8..12])?,
        })
    }
}

pub fn encode_fail(msg: &str) -> Vec<u8> {
    let bytes = msg.as_bytes();
    let mut out = Vec::with_capacity(4 + bytes.len());
    write_u32_le(&mut out, bytes.len() as u32);
    out.extend_from_slice(bytes);
    out
}

/// One step of the `SEND` push sub-protocol, as sent by the client:
/// `[type=102][id:i16-BE][state:i8][...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushFrame {
    New,
    Start { size: i32, name: String },
    Append { data: Vec<u8> },
    Finish,
    Cancel,
}

impl PushFrame {
    pub fn decode(buf: &[u8]) -> Result<(i16, Self), FslsError> {
        if buf.len() < 3 || buf[0] != PUSH_FRAME_TYPE {
            return Err(FramingError::TooShort { need: 3, have: buf.len() }.into());
        }
        let id = read_u16_be(&buf[1..3])? as i16;
        let state = read_i8(&buf[3..4])?;
        let body = &buf[4..];
        let frame = match state {
            0 => Self::New,
            1 => {
                let size = read_i32_be(body.get(0..4).ok_or(FramingError::TooShort { need: 4, have: body.len() })?)?;
                let name_len = read_u16_be(body.get(4..6).ok_or(FramingError::TooShort { need: 6, have: body.len() })?)? as usize;
                let name_bytes = body.get(6..6 + name_len).ok_or(FramingError::TooShort {
                    need: 6 + name_len,
                    have: body.len(),
                })?;
                Self::Start {
                    size,
                    name: tether_protocol::decode_utf8(name_bytes)?,
                }
            }
            2 => {
                let len = read_i32_be(body.get(0..4).ok_or(FramingError::TooShort { need: 4, have: body.len() })?)? as usize;
                let data = body.get(4..4 + len).ok_or(FramingError::TooShort {
                    need: 4 + len,
                    have: body.len(),
                })?;
                Self::Append { data: data.to_vec() }
            }
            3 => Self::Finish,
            4 => Self::Cancel,
            other => return Err(FslsError::UnknownOp([b'?', b'?', b'?', other as u8])),
        };
        Ok((id, frame))
    }
}

/// `NEW` gets `[id:i16-BE][status:i8]`; every other step gets a plain
/// `[status:i8]` ack (the id is implied by context at that point).
pub fn encode_new_ack(id: i16, status: i8) -> Vec<u8> {
    let mut out = Vec::with_capacity(3);
    write_u16_be(&mut out, id as u16);
    write_i8(&mut out, status);
    out
}

pub fn encode_step_ack(status: i8) -> Vec<u8> {
    let mut out = Vec::with_capacity(1);
    write_i8(&mut out, status);
    out
}

fn sanitize_filename(name: &str) -> Result<String, FslsError> {
    if name.is_empty() || name.contains('\0') {
        return Err(FslsError::BadFilename(name.to_string()));
    }
    let basename = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(name);
    if basename.is_empty() || basename == "." || basename == ".." {
        return Err(FslsError::BadFilename(name.to_string()));
    }
    if basename.len() > MAX_FILENAME_LEN {
        return Err(FslsError::BadFilename(name.to_string()));
    }
    Ok(basename.to_string())
}

struct ActivePush {
    name: String,
    size: i32,
    received: i32,
    dest: PathBuf,
    temp_path: PathBuf,
    file: fs::File,
}

/// Server-side state machine for one `SEND` grandchild channel. Each
/// incoming `PushFrame` drives a transition; callers write the returned ack
/// bytes back onto the channel and enforce the ack/finish timeouts
/// themselves via [`with_ack_timeout`]/[`with_finish_timeout`].
pub struct PushReceiver {
    dest_dir: PathBuf,
    transfers: HashMap<i16, ActivePush>,
    next_id: i16,
}

impl PushReceiver {
    pub fn new(dest_dir: PathBuf) -> Self {
        Self {
            dest_dir,
            transfers: HashMap::new(),
            next_id: 1,
        }
    }

    pub async fn handle(&mut self, id: i16, frame: PushFrame) -> Result<Vec<u8>, FslsError> {
        match frame {
            PushFrame::New => {
                let allocated = self.next_id;
                self.next_id = self.next_id.wrapping_add(1).max(1);
                Ok(encode_new_ack(allocated, 1))
            }
            PushFrame::Start { size, name } => {
                if size > MAX_FILE_SIZE {
                    return Err(FslsError::TooLarge(size));
                }
                let sanitized = sanitize_filename(&name)?;
                fs::create_dir_all(&self.dest_dir).await?;
                let temp_path = self.dest_dir.join(format!(".fsls-push-{id}"));
                let file = fs::File::create(&temp_path).await?;
                self.transfers.insert(
                    id,
                    ActivePush {
                        name: sanitized.clone(),
                        size,
                        received: 0,
                        dest: self.dest_dir.join(&sanitized),
                        temp_path,
                        file,
                    },
                );
                Ok(encode_step_ack(0))
            }
            PushFrame::Append { data } => {
                let transfer = self
                    .transfers
                    .get_mut(&id)
                    .ok_or_else(|| FslsError::BadFilename(format!("no active transfer {id}")))?;
                transfer.received += data.len() as i32;
                if transfer.received > transfer.size {
                    self.abort(id).await;
                    return Err(FslsError::TooLarge(transfer.received));
                }
                transfer.file.write_all(&data).await?;
                Ok(encode_step_ack(0))
            }
            PushFrame::Finish => {
                let mut transfer = self
                    .transfers
                    .remove(&id)
                    .ok_or_else(|| FslsError::BadFilename(format!("no active transfer {id}")))?;
                transfer.file.flush().await?;
                drop(transfer.file);
                fs::rename(&transfer.temp_path, &transfer.dest).await?;
                Ok(encode_step_ack(0))
            }
            PushFrame::Cancel => {
                self.abort(id).await;
                Ok(encode_step_ack(0))
            }
        }
    }

    async fn abort(&mut self, id: i16) {
        if let Some(transfer) = self.transfers.remove(&id) {
            let _ = fs::remove_file(&transfer.temp_path).await;
            let _ = transfer.name;
        }
    }
}

/// Apply the 10s per-step / 30s `FINISH` ack deadline from spec §4.8.
pub async fn with_ack_timeout<F, T>(is_finish: bool, fut: F) -> Result<T, FslsError>
where
    F: std::future::Future<Output = T>,
{
    let deadline = if is_finish { FINISH_TIMEOUT } else { ACK_TIMEOUT };
    timeout(deadline, fut).await.map_err(|_| FslsError::AckTimeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_body_roundtrip() {
        let encoded = encode_path_body("/sdcard/DCIM");
        assert_eq!(decode_path_body(&encoded).unwrap(), "/sdcard/DCIM");
    }

    #[test]
    fn dent_frame_roundtrip_and_dir_bit() {
        let dent = DentFrame {
            mode: 0o040755,
            size: 4096,
            mtime_s: 1_700_000_000,
            name: "DCIM".to_string(),
        };
        let encoded = dent.encode();
        let decoded = DentFrame::decode(&encoded).unwrap();
        assert_eq!(decoded, dent);
        assert!(decoded.is_dir());
        assert_eq!(decoded.mtime_ms(), 1_700_000_000_000);
    }

    #[test]
    fn dent_frame_file_mode_is_not_dir() {
        let dent = DentFrame {
            mode: 0o100644,
            size: 128,
            mtime_s: 0,
            name: "a.txt".to_string(),
        };
        assert!(!dent.is_dir());
    }

    #[test]
    fn stat_frame_roundtrip() {
        let stat = StatFrame { mode: 0o100644, size: 42, mtime_s: 10 };
        assert_eq!(StatFrame::decode(&stat.encode()).unwrap(), stat);
    }

    #[test]
    fn op_from_tag_recognizes_all_four() {
        assert_eq!(FslsOp::from_tag(b"LIST").unwrap(), FslsOp::List);
        assert_eq!(FslsOp::from_tag(b"STAT").unwrap(), FslsOp::Stat);
        assert_eq!(FslsOp::from_tag(b"RECV").unwrap(), FslsOp::Recv);
        assert_eq!(FslsOp::from_tag(b"SEND").unwrap(), FslsOp::Send);
        assert!(FslsOp::from_tag(b"NOPE").is_err());
    }

    #[test]
    fn push_frame_new_decodes() {
        let bytes = [PUSH_FRAME_TYPE, 0, 7, 0];
        let (id, frame) = PushFrame::decode(&bytes).unwrap();
        assert_eq!(id, 7);
        assert_eq!(frame, PushFrame::New);
    }

    #[test]
    fn push_frame_start_decodes() {
        let mut bytes = vec![PUSH_FRAME_TYPE, 0, 1, 1];
        write_i32_be(&mut bytes, 100);
        write_u16_be(&mut bytes, 5);
        bytes.extend_from_slice(b"a.txt");
        let (id, frame) = PushFrame::decode(&bytes).unwrap();
        assert_eq!(id, 1);
        assert_eq!(
            frame,
            PushFrame::Start {
                size: 100,
                name: "a.txt".to_string()
            }
        );
    }

    #[tokio::test]
    async fn push_receiver_full_transfer_roundtrip() {
        let dir = std::env::temp_dir().join(format!("tether-fsls-test-{}", std::process::id()));
        let mut receiver = PushReceiver::new(dir.clone());

        let ack = receiver.handle(1, PushFrame::New).await.unwrap();
        let (allocated_id, status) = (u16::from_be_bytes([ack[0], ack[1]]), ack[2] as i8);
        assert_eq!(status, 1);

        receiver
            .handle(
                allocated_id as i16,
                PushFrame::Start {
                    size: 5,
                    name: "hello.txt".to_string(),
                },
            )
            .await
            .unwrap();
        receiver
            .handle(
                allocated_id as i16,
                PushFrame::Append {
                    data: b"hello".to_vec(),
                },
            )
            .await
            .unwrap();
        receiver.handle(allocated_id as i16, PushFrame::Finish).await.unwrap();

        let dest = dir.join("hello.txt");
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"hello");
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn push_receiver_rejects_oversized_transfer() {
        let dir = std::env::temp_dir().join(format!("tether-fsls-oversize-{}", std::process::id()));
        let mut receiver = PushReceiver::new(dir.clone());
        let result = receiver
            .handle(
                1,
                PushFrame::Start {
                    size: MAX_FILE_SIZE + 1,
                    name: "huge.bin".to_string(),
                },
            )
            .await;
        assert!(result.is_err());
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn push_receiver_cancel_removes_temp_file() {
        let dir = std::env::temp_dir().join(format!("tether-fsls-cancel-{}", std::process::id()));
        let mut receiver = PushReceiver::new(dir.clone());
        receiver
            .handle(
                1,
                PushFrame::Start {
                    size: 10,
                    name: "abort.bin".to_string(),
                },
            )
            .await
            .unwrap();
        receiver.handle(1, PushFrame::Cancel).await.unwrap();
        assert!(!receiver.transfers.contains_key(&1));
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn ack_timeout_fires_when_future_never_resolves() {
        let result = with_ack_timeout(false, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        })
        .await;
        assert!(matches!(result, Err(FslsError::AckTimeout)));
    }
}
