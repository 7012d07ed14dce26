//! Connection supervisor.
//!
//! The supervisor is the single owner of the transport and the pending-update
//! slot. Everything that touches either runs on its worker thread; other
//! components talk to it only through `SupervisorCommand`s.
//!
//! ## State Machine
//!
//! ```text
//! Disconnected --attempt--> Connecting --handshake ok--> Connected
//! Connecting   --timeout / unavailable / mismatch--> Disconnected (retry scheduled)
//! Connected    --peer closed / send failure-------> Disconnected (retry scheduled)
//! ```
//!
//! Transport errors are logged here and never returned to callers.

use crate::activity::ActivitySnapshot;
use crate::backoff::Backoff;
use crate::clock::Clock;
use crate::config::PresenceConfig;
use crate::error::ConnectError;
use crate::synchronizer::SnapshotSink;
use crate::transport::{CloseNotifier, Connector, Transport};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Read-only view of the supervisor's connection state.
#[derive(Debug, Clone)]
pub struct StateWatch(Arc<Mutex<ConnectionState>>);

impl StateWatch {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(ConnectionState::Disconnected)))
    }

    pub fn get(&self) -> ConnectionState {
        self.0
            .lock()
            .map(|state| *state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn set(&self, next: ConnectionState) {
        if let Ok(mut state) = self.0.lock() {
            *state = next;
        }
    }
}

/// Once cancelled, no further connection attempt starts.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub enum SupervisorCommand {
    Send(ActivitySnapshot),
    Reconfigure {
        show_timestamp: bool,
        snapshot: Option<ActivitySnapshot>,
    },
    PeerClosed { generation: u64, reason: String },
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub client_id: String,
    pub backoff: Backoff,
    pub show_timestamp: bool,
}

impl SupervisorSettings {
    pub fn from_config(config: &PresenceConfig) -> Self {
        let connection = &config.connection;
        Self {
            client_id: connection.client_id.trim().to_string(),
            backoff: Backoff::new(
                connection.backoff_base(),
                connection.backoff_cap(),
                connection.backoff_reset_after(),
            ),
            show_timestamp: config.display.show_timestamp,
        }
    }
}

pub struct SupervisorCore {
    connector: Box<dyn Connector>,
    client_id: String,
    backoff: Backoff,
    show_timestamp: bool,
    clock: Arc<dyn Clock>,
    events: Sender<SupervisorCommand>,
    cancel: CancelToken,
    state: StateWatch,
    transport: Option<Box<dyn Transport>>,
    generation: u64,
    pending: Option<ActivitySnapshot>,
    last_delivered: Option<ActivitySnapshot>,
    retry_at: Option<Instant>,
    session_start: Option<DateTime<Utc>>,
}

impl SupervisorCore {
    /// `events` receives close notifications from the transport reader.
    pub fn new(
        connector: Box<dyn Connector>,
        settings: SupervisorSettings,
        clock: Arc<dyn Clock>,
        events: Sender<SupervisorCommand>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            connector,
            client_id: settings.client_id,
            backoff: settings.backoff,
            show_timestamp: settings.show_timestamp,
            clock,
            events,
            cancel,
            state: StateWatch::new(),
            transport: None,
            generation: 0,
            pending: None,
            last_delivered: None,
            retry_at: None,
            session_start: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn state_watch(&self) -> StateWatch {
        self.state.clone()
    }

    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    pub fn pending(&self) -> Option<&ActivitySnapshot> {
        self.pending.as_ref()
    }

    pub fn session_start(&self) -> Option<DateTime<Utc>> {
        self.session_start
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.retry_at
    }

    pub fn start(&mut self) {
        self.attempt_connect();
    }

    /// Sends now when connected; otherwise replaces the pending update.
    pub fn submit(&mut self, snapshot: ActivitySnapshot) {
        if self.state() == ConnectionState::Connected {
            self.deliver(snapshot);
        } else {
            if self.pending.is_some() {
                debug!("Superseding pending presence update");
            }
            self.pending = Some(snapshot);
        }
    }

    /// Applies a display change. A changed snapshot is submitted with the new
    /// timestamp setting; with no snapshot, a timestamp toggle re-sends the
    /// last delivered update.
    pub fn reconfigure(&mut self, show_timestamp: bool, snapshot: Option<ActivitySnapshot>) {
        let timestamp_changed = self.show_timestamp != show_timestamp;
        self.show_timestamp = show_timestamp;

        if let Some(snapshot) = snapshot {
            self.submit(snapshot);
        } else if timestamp_changed && self.state() == ConnectionState::Connected {
            if let Some(last) = self.last_delivered.clone() {
                self.deliver(last);
            }
        }
    }

    pub fn on_peer_closed(&mut self, generation: u64, reason: &str) {
        if generation != self.generation || self.state() != ConnectionState::Connected {
            debug!(
                generation,
                current = self.generation,
                "Ignoring close notification for stale connection"
            );
            return;
        }
        info!(reason = %reason, "Presence service disconnected");
        self.drop_connection();
    }

    /// Runs a due reconnect attempt.
    pub fn poll(&mut self, now: Instant) {
        let due = self.retry_at.map(|at| now >= at).unwrap_or(false);
        if due && self.state() == ConnectionState::Disconnected {
            self.attempt_connect();
        }
    }

    /// Terminal: cancels the retry timer, drops the pending update and closes
    /// the transport. Safe to call more than once.
    pub fn shutdown(&mut self) {
        self.retry_at = None;
        self.pending = None;
        if let Some(mut transport) = self.transport.take() {
            transport.close();
            info!("Presence connection closed");
        }
        self.state.set(ConnectionState::Disconnected);
    }

    fn attempt_connect(&mut self) {
        self.retry_at = None;
        if self.cancel.is_cancelled() {
            return;
        }

        self.state.set(ConnectionState::Connecting);
        self.generation += 1;
        let generation = self.generation;
        let events = self.events.clone();
        let notifier: CloseNotifier = Box::new(move |reason| {
            let _ = events.send(SupervisorCommand::PeerClosed { generation, reason });
        });

        match self.connector.connect(&self.client_id, notifier) {
            Ok(mut transport) => {
                if self.cancel.is_cancelled() {
                    transport.close();
                    self.state.set(ConnectionState::Disconnected);
                    return;
                }
                self.transport = Some(transport);
                self.state.set(ConnectionState::Connected);
                self.backoff.on_connected(self.clock.now());
                let session_start = *self.session_start.get_or_insert_with(Utc::now);
                info!(
                    generation,
                    session_start = %session_start.to_rfc3339(),
                    "Presence service connected"
                );
                if let Some(pending) = self.pending.take() {
                    self.deliver(pending);
                }
            }
            Err(err) => {
                match &err {
                    ConnectError::EndpointUnavailable { .. } => {
                        debug!(error = %err, "Presence service unavailable")
                    }
                    ConnectError::HandshakeTimeout { .. } | ConnectError::ProtocolMismatch { .. } => {
                        warn!(error = %err, "Presence handshake failed")
                    }
                }
                self.state.set(ConnectionState::Disconnected);
                self.schedule_retry();
            }
        }
    }

    fn deliver(&mut self, snapshot: ActivitySnapshot) {
        let snapshot = match self.session_start {
            Some(start) => snapshot.with_session_start(start),
            None => snapshot,
        };
        let activity = snapshot.to_activity(self.show_timestamp);

        let result = match self.transport.as_mut() {
            Some(transport) => transport.send(&activity),
            None => {
                self.pending = Some(snapshot);
                return;
            }
        };

        match result {
            Ok(()) => {
                debug!(
                    details = ?activity.details,
                    state = ?activity.state,
                    "Presence update sent"
                );
                self.last_delivered = Some(snapshot);
            }
            Err(err) => {
                warn!(error = %err, "Presence update failed; will retry after reconnect");
                self.pending = Some(snapshot);
                self.drop_connection();
            }
        }
    }

    fn drop_connection(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        // The service forgets the activity of a closed connection, so the
        // last delivered update is re-armed unless something newer is pending.
        if self.pending.is_none() {
            self.pending = self.last_delivered.take();
        }
        self.last_delivered = None;
        self.backoff.on_disconnected(self.clock.now());
        self.state.set(ConnectionState::Disconnected);
        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        if self.cancel.is_cancelled() {
            return;
        }
        let delay = self.backoff.next_delay();
        self.retry_at = Some(self.clock.now() + delay);
        debug!(
            delay_ms = delay.as_millis() as u64,
            failures = self.backoff.failures(),
            "Presence reconnect scheduled"
        );
    }
}

/// Cloneable, non-blocking submission side of a running supervisor.
#[derive(Clone)]
pub struct SupervisorSender {
    commands: Sender<SupervisorCommand>,
}

impl SupervisorSender {
    /// Fire-and-forget: delivery happens as soon as the supervisor is connected.
    pub fn ensure_connected_and_send(&self, snapshot: ActivitySnapshot) {
        let _ = self.commands.send(SupervisorCommand::Send(snapshot));
    }
}

impl SnapshotSink for SupervisorSender {
    fn submit(&self, snapshot: ActivitySnapshot) {
        self.ensure_connected_and_send(snapshot);
    }

    fn reconfigure(&self, show_timestamp: bool, snapshot: Option<ActivitySnapshot>) {
        let _ = self.commands.send(SupervisorCommand::Reconfigure {
            show_timestamp,
            snapshot,
        });
    }
}

/// Owns the `presence-supervisor` worker thread.
pub struct SupervisorHandle {
    sender: SupervisorSender,
    state: StateWatch,
    cancel: CancelToken,
    done: Receiver<()>,
    worker: Option<JoinHandle<()>>,
}

impl SupervisorHandle {
    pub fn spawn(
        connector: Box<dyn Connector>,
        settings: SupervisorSettings,
        clock: Arc<dyn Clock>,
    ) -> std::io::Result<Self> {
        let (commands_tx, commands_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let cancel = CancelToken::default();
        let core = SupervisorCore::new(
            connector,
            settings,
            Arc::clone(&clock),
            commands_tx.clone(),
            cancel.clone(),
        );
        let state = core.state_watch();

        let worker = thread::Builder::new()
            .name("presence-supervisor".to_string())
            .spawn(move || run_worker(core, commands_rx, clock, done_tx))?;

        Ok(Self {
            sender: SupervisorSender {
                commands: commands_tx,
            },
            state,
            cancel,
            done: done_rx,
            worker: Some(worker),
        })
    }

    pub fn sender(&self) -> SupervisorSender {
        self.sender.clone()
    }

    pub fn ensure_connected_and_send(&self, snapshot: ActivitySnapshot) {
        self.sender.ensure_connected_and_send(snapshot);
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Cancels retries and in-flight attempts, then waits up to `grace` for
    /// the worker to close the transport. A worker stuck in I/O is abandoned;
    /// the cancel token makes it close anything it opens afterwards.
    pub fn shutdown(&mut self, grace: Duration) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        self.cancel.cancel();
        let _ = self.sender.commands.send(SupervisorCommand::Shutdown);

        match self.done.recv_timeout(grace) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = worker.join();
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    grace_ms = grace.as_millis() as u64,
                    "Presence supervisor did not stop within grace period; abandoning"
                );
            }
        }
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        self.shutdown(Duration::ZERO);
    }
}

fn run_worker(
    mut core: SupervisorCore,
    commands: Receiver<SupervisorCommand>,
    clock: Arc<dyn Clock>,
    done: Sender<()>,
) {
    core.start();

    let mut backlog: VecDeque<SupervisorCommand> = VecDeque::new();
    loop {
        let received = match backlog.pop_front() {
            Some(command) => Ok(command),
            None => match core.next_deadline() {
                Some(deadline) => {
                    commands.recv_timeout(deadline.saturating_duration_since(clock.now()))
                }
                None => commands
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
            },
        };

        match received {
            Ok(SupervisorCommand::Send(snapshot)) => {
                let latest = coalesce_sends(snapshot, &commands, &mut backlog);
                core.submit(latest);
            }
            Ok(SupervisorCommand::Reconfigure {
                show_timestamp,
                snapshot,
            }) => core.reconfigure(show_timestamp, snapshot),
            Ok(SupervisorCommand::PeerClosed { generation, reason }) => {
                core.on_peer_closed(generation, &reason)
            }
            Ok(SupervisorCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => core.poll(clock.now()),
        }

        if core.cancel.is_cancelled() {
            break;
        }
    }

    core.shutdown();
    let _ = done.send(());
}

// Queued submissions collapse to the newest one; the first other command
// stops the scan and is handled next.
fn coalesce_sends(
    first: ActivitySnapshot,
    commands: &Receiver<SupervisorCommand>,
    backlog: &mut VecDeque<SupervisorCommand>,
) -> ActivitySnapshot {
    let mut latest = first;
    while let Ok(next) = commands.try_recv() {
        match next {
            SupervisorCommand::Send(snapshot) => latest = snapshot,
            other => {
                backlog.push_back(other);
                break;
            }
        }
    }
    latest
}
