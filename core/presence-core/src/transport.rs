//! IPC transport to the local presence service.
//!
//! One `Transport` is one handshaken socket. After the handshake a reader
//! thread owns the receive side: it answers pings, logs service errors, and
//! fires the owner's `CloseNotifier` exactly once when the peer closes or the
//! channel fails. The notifier never fires for a locally initiated `close`.

use crate::config::ConnectionConfig;
use crate::error::{ConnectError, SendError};
use chrono::Utc;
use presence_protocol::{
    read_message, write_message, Activity, CommandFrame, FrameError, Message, Opcode,
    CLOSE_NORMAL,
};
use rand::RngCore;
use std::env;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

const SOCKET_PREFIX: &str = "discord-ipc-";
const SOCKET_SLOTS: usize = 10;
const RUNTIME_DIR_ENVS: [&str; 4] = ["XDG_RUNTIME_DIR", "TMPDIR", "TMP", "TEMP"];
const FALLBACK_RUNTIME_DIR: &str = "/tmp";

/// Invoked once, from the reader thread, with a short reason.
pub type CloseNotifier = Box<dyn FnOnce(String) + Send + 'static>;

pub trait Transport: Send {
    fn send(&mut self, activity: &Activity) -> Result<(), SendError>;

    /// Best-effort graceful shutdown. Idempotent.
    fn close(&mut self);
}

pub trait Connector: Send {
    fn connect(
        &mut self,
        client_id: &str,
        on_close: CloseNotifier,
    ) -> Result<Box<dyn Transport>, ConnectError>;
}

#[derive(Debug, Clone)]
pub struct IpcConnector {
    socket_path: Option<PathBuf>,
    handshake_timeout: Duration,
}

impl IpcConnector {
    pub fn new(socket_path: Option<PathBuf>, handshake_timeout: Duration) -> Self {
        Self {
            socket_path,
            handshake_timeout,
        }
    }

    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(config.socket_path.clone(), config.handshake_timeout())
    }
}

impl Connector for IpcConnector {
    fn connect(
        &mut self,
        client_id: &str,
        on_close: CloseNotifier,
    ) -> Result<Box<dyn Transport>, ConnectError> {
        let candidates = match &self.socket_path {
            Some(path) => vec![path.clone()],
            None => candidate_socket_paths(),
        };

        let mut last_error = None;
        for path in &candidates {
            match UnixStream::connect(path) {
                Ok(stream) => {
                    debug!(path = %path.display(), "Presence socket connected; sending handshake");
                    let transport =
                        open_session(stream, path, client_id, self.handshake_timeout, on_close)?;
                    return Ok(Box::new(transport));
                }
                Err(err) => last_error = Some(format!("{}: {}", path.display(), err)),
            }
        }

        Err(ConnectError::EndpointUnavailable {
            details: last_error.unwrap_or_else(|| "no candidate endpoints".to_string()),
        })
    }
}

/// Well-known endpoint names, probed in order.
pub fn candidate_socket_paths() -> Vec<PathBuf> {
    candidates_in(&runtime_dir())
}

fn runtime_dir() -> PathBuf {
    RUNTIME_DIR_ENVS
        .iter()
        .filter_map(|key| env::var(key).ok())
        .find(|value| !value.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(FALLBACK_RUNTIME_DIR))
}

fn candidates_in(dir: &Path) -> Vec<PathBuf> {
    (0..SOCKET_SLOTS)
        .map(|slot| dir.join(format!("{}{}", SOCKET_PREFIX, slot)))
        .collect()
}

#[derive(Debug, Default)]
struct LinkFlags {
    closing: AtomicBool,
    peer_gone: AtomicBool,
}

pub struct IpcTransport {
    writer: Arc<Mutex<UnixStream>>,
    flags: Arc<LinkFlags>,
    closed: bool,
}

fn open_session(
    mut stream: UnixStream,
    path: &Path,
    client_id: &str,
    timeout: Duration,
    on_close: CloseNotifier,
) -> Result<IpcTransport, ConnectError> {
    let _ = stream.set_read_timeout(Some(timeout));
    let _ = stream.set_write_timeout(Some(timeout));

    write_message(&mut stream, &Message::handshake(client_id)).map_err(|err| {
        ConnectError::EndpointUnavailable {
            details: format!("Failed to write handshake: {}", err),
        }
    })?;

    let reply = read_message(&mut stream).map_err(|err| classify_handshake_error(err, timeout))?;
    match reply.opcode {
        Opcode::Frame => {
            let frame = reply
                .command_frame()
                .map_err(|err| ConnectError::ProtocolMismatch {
                    details: format!("Malformed handshake reply: {}", err),
                })?;
            if !frame.is_ready() {
                return Err(ConnectError::ProtocolMismatch {
                    details: format!(
                        "Expected READY dispatch, got {:?}/{:?}",
                        frame.cmd, frame.evt
                    ),
                });
            }
        }
        Opcode::Close => {
            let info = reply.close_info().unwrap_or_default();
            return Err(ConnectError::ProtocolMismatch {
                details: format!("{} (code {})", info.message, info.code),
            });
        }
        other => {
            return Err(ConnectError::ProtocolMismatch {
                details: format!("Unexpected {:?} during handshake", other),
            });
        }
    }

    // The receive timeout is per socket, so clear it before cloning the reader.
    let _ = stream.set_read_timeout(None);
    let reader = stream
        .try_clone()
        .map_err(|err| ConnectError::EndpointUnavailable {
            details: format!("Failed to clone presence socket: {}", err),
        })?;

    let writer = Arc::new(Mutex::new(stream));
    let flags = Arc::new(LinkFlags::default());
    let reader_writer = Arc::clone(&writer);
    let reader_flags = Arc::clone(&flags);
    thread::Builder::new()
        .name("presence-ipc-reader".to_string())
        .spawn(move || run_reader(reader, reader_writer, reader_flags, on_close))
        .map_err(|err| ConnectError::EndpointUnavailable {
            details: format!("Failed to spawn reader: {}", err),
        })?;

    debug!(path = %path.display(), "Presence handshake acknowledged");
    Ok(IpcTransport {
        writer,
        flags,
        closed: false,
    })
}

fn classify_handshake_error(err: FrameError, timeout: Duration) -> ConnectError {
    if err.is_timeout() {
        ConnectError::HandshakeTimeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    } else if err.is_disconnect() {
        ConnectError::EndpointUnavailable {
            details: format!("Connection closed during handshake: {}", err),
        }
    } else {
        ConnectError::ProtocolMismatch {
            details: err.to_string(),
        }
    }
}

fn run_reader(
    mut stream: UnixStream,
    writer: Arc<Mutex<UnixStream>>,
    flags: Arc<LinkFlags>,
    on_close: CloseNotifier,
) {
    let reason = loop {
        let message = match read_message(&mut stream) {
            Ok(message) => message,
            Err(FrameError::UnknownOpcode(opcode)) => {
                debug!(opcode, "Ignoring frame with unknown opcode");
                continue;
            }
            Err(err) => break err.to_string(),
        };

        match message.opcode {
            Opcode::Ping => {
                let pong = Message::new(Opcode::Pong, message.payload);
                let written = match writer.lock() {
                    Ok(mut out) => write_message(&mut *out, &pong),
                    Err(_) => break "writer lock poisoned".to_string(),
                };
                if let Err(err) = written {
                    break format!("Failed to answer ping: {}", err);
                }
            }
            Opcode::Close => {
                let info = message.close_info().unwrap_or_default();
                break format!("peer closed: {} (code {})", info.message, info.code);
            }
            Opcode::Frame => match message.command_frame() {
                Ok(frame) if frame.is_error() => {
                    warn!(
                        cmd = ?frame.cmd,
                        reason = frame.error_message().as_deref().unwrap_or("unknown"),
                        "Presence service rejected command"
                    );
                }
                Ok(frame) => debug!(cmd = ?frame.cmd, evt = ?frame.evt, "Presence frame received"),
                Err(err) => debug!(error = %err, "Ignoring malformed presence frame"),
            },
            Opcode::Handshake | Opcode::Pong => {
                debug!(opcode = ?message.opcode, "Ignoring unexpected frame");
            }
        }
    };

    flags.peer_gone.store(true, Ordering::SeqCst);
    if flags.closing.load(Ordering::SeqCst) {
        return;
    }
    debug!(reason = %reason, "Presence channel closed by peer");
    on_close(reason);
}

fn make_nonce() -> String {
    let mut random = rand::thread_rng();
    format!(
        "{:x}-{:x}",
        Utc::now().timestamp_millis(),
        random.next_u64()
    )
}

impl Transport for IpcTransport {
    fn send(&mut self, activity: &Activity) -> Result<(), SendError> {
        if self.closed || self.flags.peer_gone.load(Ordering::SeqCst) {
            return Err(SendError::ConnectionClosed);
        }

        let frame =
            CommandFrame::set_activity(std::process::id(), Some(activity.clone()), make_nonce());
        let message = Message::command(&frame).map_err(|err| SendError::SendFailure {
            details: err.to_string(),
        })?;

        let mut stream = self.writer.lock().map_err(|_| SendError::SendFailure {
            details: "writer lock poisoned".to_string(),
        })?;
        write_message(&mut *stream, &message).map_err(|err| {
            if err.is_disconnect() {
                SendError::ConnectionClosed
            } else {
                SendError::SendFailure {
                    details: err.to_string(),
                }
            }
        })
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.flags.closing.store(true, Ordering::SeqCst);

        if let Ok(mut stream) = self.writer.lock() {
            if !self.flags.peer_gone.load(Ordering::SeqCst) {
                if let Err(err) =
                    write_message(&mut *stream, &Message::close(CLOSE_NORMAL, "client closing"))
                {
                    debug!(error = %err, "Failed to write close frame");
                }
            }
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for IpcTransport {
    fn drop(&mut self) {
        self.close();
    }
}
