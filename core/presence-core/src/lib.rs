//! # presence-core
//!
//! Presence synchronization controller: mirrors live IDE state (active file,
//! active project, host version, session start) into a local rich presence
//! service over its IPC socket.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime. Two worker threads (`presence-sync`,
//!   `presence-supervisor`) talk over `std::sync::mpsc` channels.
//! - **Best-effort**: Transport failures are logged and retried with backoff;
//!   they never surface to the host.
//! - **Last value wins**: At most one update is pending; newer snapshots
//!   replace older ones.
//! - **Single owner**: The transport and the pending slot belong to the
//!   supervisor thread alone.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use presence_core::{load_config, IdeEvent, PresenceController};
//!
//! let config = load_config(None)?;
//! let mut controller = PresenceController::with_ipc(config, "17.8");
//! controller.start()?;
//! controller.on_ide_event(IdeEvent::SolutionOpened { name: "Foo".into() })?;
//! controller.dispose();
//! ```

// Public modules
pub mod activity;
pub mod backoff;
pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod supervisor;
pub mod synchronizer;
pub mod transport;

#[cfg(test)]
mod test_support;

// Re-export commonly used items at crate root
pub use activity::{build_snapshot, ActivitySnapshot, IdeState};
pub use backoff::Backoff;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::*;
pub use controller::PresenceController;
pub use error::{ConfigError, ConnectError, ControllerError, Result, SendError};
pub use supervisor::{
    CancelToken, ConnectionState, SupervisorCore, SupervisorHandle, SupervisorSender,
    SupervisorSettings,
};
pub use synchronizer::{IdeEvent, SnapshotSink, SyncCore, SyncHandle};
pub use transport::{candidate_socket_paths, CloseNotifier, Connector, IpcConnector, Transport};
