//! Presence synchronizer: IDE events in, debounced and diffed snapshots out.
//!
//! A burst of events opens one coalescing window, fixed at the first event.
//! When it elapses a single snapshot is built and handed to the sink, unless
//! it equals the last snapshot the sink accepted.

use crate::activity::{build_snapshot, ActivitySnapshot, IdeState};
use crate::clock::Clock;
use crate::config::DisplayConfig;
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Host notification, as delivered by the IDE adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IdeEvent {
    ActiveDocumentChanged {
        #[serde(default)]
        path: Option<String>,
    },
    ActiveProjectChanged {
        #[serde(default)]
        name: Option<String>,
    },
    SolutionOpened {
        name: String,
    },
    SolutionClosed,
    ShutdownImminent,
}

/// Receives snapshots that passed debounce and diff. Must not block.
pub trait SnapshotSink: Send {
    fn submit(&self, snapshot: ActivitySnapshot);

    /// Applies new display settings together with the snapshot they produced,
    /// if it differs from the last one accepted.
    fn reconfigure(&self, show_timestamp: bool, snapshot: Option<ActivitySnapshot>);
}

pub struct SyncCore {
    state: IdeState,
    display: DisplayConfig,
    window: Duration,
    deadline: Option<Instant>,
    last_accepted: Option<ActivitySnapshot>,
    builds: u64,
    sink: Box<dyn SnapshotSink>,
}

impl SyncCore {
    pub fn new(
        state: IdeState,
        display: DisplayConfig,
        window: Duration,
        sink: Box<dyn SnapshotSink>,
    ) -> Self {
        Self {
            state,
            display,
            window,
            deadline: None,
            last_accepted: None,
            builds: 0,
            sink,
        }
    }

    pub fn state(&self) -> &IdeState {
        &self.state
    }

    pub fn last_accepted(&self) -> Option<&ActivitySnapshot> {
        self.last_accepted.as_ref()
    }

    /// Number of snapshots built so far.
    pub fn builds(&self) -> u64 {
        self.builds
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn apply(&mut self, event: IdeEvent, now: Instant) {
        trace!(?event, "IDE event");
        match event {
            IdeEvent::ActiveDocumentChanged { path } => self.state.active_file = path,
            IdeEvent::ActiveProjectChanged { name } => self.state.active_project = name,
            IdeEvent::SolutionOpened { name } => {
                // Documents of the new solution announce themselves.
                self.state.active_file = None;
                self.state.active_project = Some(name);
            }
            IdeEvent::SolutionClosed => {
                self.state.active_file = None;
                self.state.active_project = None;
            }
            IdeEvent::ShutdownImminent => return,
        }

        if self.deadline.is_none() {
            self.deadline = Some(now + self.window);
        }
    }

    pub fn poll(&mut self, now: Instant) {
        if self.deadline.map(|at| now >= at).unwrap_or(false) {
            self.deadline = None;
            self.flush();
        }
    }

    /// Rebuilds immediately, bypassing any open window. Still diffed.
    pub fn update_now(&mut self) {
        self.deadline = None;
        self.flush();
    }

    /// Swaps the display settings and rebuilds. The timestamp setting and the
    /// rebuilt snapshot reach the sink as one call.
    pub fn replace_config(&mut self, display: DisplayConfig, window: Duration) {
        let show_timestamp = display.show_timestamp;
        self.display = display;
        self.window = window;
        self.deadline = None;
        let changed = self.rebuild();
        self.sink.reconfigure(show_timestamp, changed);
    }

    fn flush(&mut self) {
        if let Some(snapshot) = self.rebuild() {
            self.sink.submit(snapshot);
        }
    }

    fn rebuild(&mut self) -> Option<ActivitySnapshot> {
        let snapshot = build_snapshot(&self.state, &self.display);
        self.builds += 1;

        if self.last_accepted.as_ref() == Some(&snapshot) {
            debug!("Presence unchanged; skipping update");
            return None;
        }

        self.last_accepted = Some(snapshot.clone());
        Some(snapshot)
    }
}

enum SyncCommand {
    Event(IdeEvent),
    Update,
    UpdateConfig {
        display: DisplayConfig,
        window: Duration,
    },
    Shutdown,
}

/// Owns the `presence-sync` worker. All calls hand off over a channel.
pub struct SyncHandle {
    commands: Sender<SyncCommand>,
    worker: Option<JoinHandle<()>>,
}

impl SyncHandle {
    pub fn spawn(core: SyncCore, clock: Arc<dyn Clock>) -> std::io::Result<Self> {
        let (commands_tx, commands_rx) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("presence-sync".to_string())
            .spawn(move || run_worker(core, commands_rx, clock))?;
        Ok(Self {
            commands: commands_tx,
            worker: Some(worker),
        })
    }

    pub fn on_event(&self, event: IdeEvent) {
        let _ = self.commands.send(SyncCommand::Event(event));
    }

    pub fn update(&self) {
        let _ = self.commands.send(SyncCommand::Update);
    }

    pub fn update_config(&self, display: DisplayConfig, window: Duration) {
        let _ = self
            .commands
            .send(SyncCommand::UpdateConfig { display, window });
    }

    /// Stops the worker, dropping any open window. The worker never does I/O,
    /// so the join is short.
    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = self.commands.send(SyncCommand::Shutdown);
        let _ = worker.join();
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(mut core: SyncCore, commands: Receiver<SyncCommand>, clock: Arc<dyn Clock>) {
    loop {
        let received = match core.next_deadline() {
            Some(deadline) => commands.recv_timeout(deadline.saturating_duration_since(clock.now())),
            None => commands.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(SyncCommand::Event(event)) => core.apply(event, clock.now()),
            Ok(SyncCommand::Update) => core.update_now(),
            Ok(SyncCommand::UpdateConfig { display, window }) => {
                core.replace_config(display, window)
            }
            Ok(SyncCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => core.poll(clock.now()),
        }
    }
    debug!("Presence synchronizer stopped");
}
