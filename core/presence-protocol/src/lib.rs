//! Wire types for the local rich presence IPC endpoint.
//!
//! This crate is shared by the presence client and by test fakes to prevent
//! schema drift. Every message is an 8-byte header (little-endian `u32`
//! opcode, little-endian `u32` payload length) followed by a UTF-8 JSON body.
//! The presence service is the authority on what it accepts; the client keeps
//! its payloads inside the documented field limits so updates are not rejected.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{self, Read, Write};

pub const HANDSHAKE_VERSION: u32 = 1;
pub const HEADER_LEN: usize = 8;
pub const MAX_FRAME_BYTES: usize = 64 * 1024;
pub const MAX_FIELD_BYTES: usize = 128;
pub const MIN_FIELD_CHARS: usize = 2;

/// Close code sent by a client shutting down normally.
pub const CLOSE_NORMAL: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Handshake,
    Frame,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    pub fn as_u32(self) -> u32 {
        match self {
            Opcode::Handshake => 0,
            Opcode::Frame => 1,
            Opcode::Close => 2,
            Opcode::Ping => 3,
            Opcode::Pong => 4,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Opcode::Handshake),
            1 => Some(Opcode::Frame),
            2 => Some(Opcode::Close),
            3 => Some(Opcode::Ping),
            4 => Some(Opcode::Pong),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Unknown opcode {0}")]
    UnknownOpcode(u32),

    #[error("Frame payload of {0} bytes exceeds maximum size")]
    TooLarge(usize),

    #[error("Frame payload is invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

impl FrameError {
    /// True when a socket read/write timeout expired.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            FrameError::Io(err)
                if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
        )
    }

    /// True when the peer went away mid-stream.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            FrameError::Io(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::UnexpectedEof
                        | io::ErrorKind::BrokenPipe
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::NotConnected
                )
        )
    }
}

/// One framed message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub opcode: Opcode,
    pub payload: Value,
}

impl Message {
    pub fn new(opcode: Opcode, payload: Value) -> Self {
        Self { opcode, payload }
    }

    pub fn handshake(client_id: &str) -> Self {
        Self::new(
            Opcode::Handshake,
            serde_json::json!({ "v": HANDSHAKE_VERSION, "client_id": client_id }),
        )
    }

    pub fn command(frame: &CommandFrame) -> Result<Self, FrameError> {
        Ok(Self::new(Opcode::Frame, serde_json::to_value(frame)?))
    }

    pub fn close(code: i64, message: impl Into<String>) -> Self {
        Self::new(
            Opcode::Close,
            serde_json::json!({ "code": code, "message": message.into() }),
        )
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let body = serde_json::to_vec(&self.payload)?;
        if body.len() > MAX_FRAME_BYTES {
            return Err(FrameError::TooLarge(body.len()));
        }

        let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
        bytes.extend_from_slice(&self.opcode.as_u32().to_le_bytes());
        bytes.extend_from_slice(&(body.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    pub fn command_frame(&self) -> Result<CommandFrame, FrameError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn close_info(&self) -> Option<CloseInfo> {
        if self.opcode != Opcode::Close {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }
}

/// Writes one framed message. The frame is assembled before writing so a
/// single `write_all` carries it.
pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> Result<(), FrameError> {
    let bytes = message.encode()?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// Reads one framed message.
///
/// The payload is always consumed before the opcode is checked, so an
/// unknown opcode leaves the stream aligned on the next header.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Message, FrameError> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header)?;

    let raw_opcode = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let length = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if length > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge(length));
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body)?;

    let opcode = Opcode::from_u32(raw_opcode).ok_or(FrameError::UnknownOpcode(raw_opcode))?;
    let payload = if body.iter().all(|b| b.is_ascii_whitespace()) {
        Value::Null
    } else {
        serde_json::from_slice(&body)?
    };

    Ok(Message { opcode, payload })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub v: u32,
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    Dispatch,
    SetActivity,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Ready,
    Error,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandFrame {
    pub cmd: Command,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evt: Option<EventKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CommandFrame {
    pub fn set_activity(pid: u32, activity: Option<Activity>, nonce: String) -> Self {
        Self {
            cmd: Command::SetActivity,
            evt: None,
            nonce: Some(nonce),
            args: Some(serde_json::json!({ "pid": pid, "activity": activity })),
            data: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.cmd == Command::Dispatch && self.evt == Some(EventKind::Ready)
    }

    pub fn is_error(&self) -> bool {
        self.evt == Some(EventKind::Error)
    }

    /// Human-readable message carried by an `ERROR` dispatch, if any.
    pub fn error_message(&self) -> Option<String> {
        self.data
            .as_ref()
            .and_then(|data| data.get("message"))
            .and_then(|value| value.as_str())
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseInfo {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamps: Option<Timestamps>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assets: Option<Assets>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamps {
    /// Unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assets {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub large_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub large_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub small_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub small_text: Option<String>,
}

impl Activity {
    /// Applies the service field limits to every string field.
    pub fn clamped(self) -> Self {
        Self {
            details: clamp_field(self.details),
            state: clamp_field(self.state),
            timestamps: self.timestamps,
            assets: self.assets.map(|assets| Assets {
                large_image: clamp_field(assets.large_image),
                large_text: clamp_field(assets.large_text),
                small_image: clamp_field(assets.small_image),
                small_text: clamp_field(assets.small_text),
            }),
        }
    }
}

/// Trims, drops values under `MIN_FIELD_CHARS` and truncates values over
/// `MAX_FIELD_BYTES` at a char boundary.
pub fn clamp_field(value: Option<String>) -> Option<String> {
    let value = value?;
    let trimmed = value.trim();
    if trimmed.chars().count() < MIN_FIELD_CHARS {
        return None;
    }
    if trimmed.len() <= MAX_FIELD_BYTES {
        return Some(trimmed.to_string());
    }

    let mut end = MAX_FIELD_BYTES;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    Some(trimmed[..end].to_string())
}
