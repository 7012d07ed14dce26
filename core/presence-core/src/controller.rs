//! Presence controller: the host-facing lifecycle around the two workers.
//!
//! ```text
//! Idle --start--> Running --dispose--> Disposed
//!   \______________________dispose______/
//! ```
//!
//! Every entry point only hands work to a worker channel, so none of them
//! blocks the host's event thread. `dispose` is the exception: it waits for
//! the supervisor to close the transport, bounded by `dispose_grace`.

use crate::activity::IdeState;
use crate::clock::{Clock, SystemClock};
use crate::config::PresenceConfig;
use crate::error::{ControllerError, Result};
use crate::supervisor::{ConnectionState, SupervisorHandle, SupervisorSettings};
use crate::synchronizer::{IdeEvent, SyncCore, SyncHandle};
use crate::transport::{Connector, IpcConnector};
use std::mem;
use std::sync::Arc;
use tracing::{debug, info};

enum Lifecycle {
    Idle { connector: Box<dyn Connector> },
    Running(Workers),
    Disposed,
}

struct Workers {
    sync: SyncHandle,
    supervisor: SupervisorHandle,
}

pub struct PresenceController {
    config: PresenceConfig,
    host_version: String,
    clock: Arc<dyn Clock>,
    lifecycle: Lifecycle,
}

impl PresenceController {
    pub fn new(
        config: PresenceConfig,
        host_version: impl Into<String>,
        connector: Box<dyn Connector>,
    ) -> Self {
        Self::with_clock(config, host_version, connector, Arc::new(SystemClock))
    }

    /// Controller speaking to the local presence service over its Unix socket.
    pub fn with_ipc(config: PresenceConfig, host_version: impl Into<String>) -> Self {
        let connector = IpcConnector::from_config(&config.connection);
        Self::new(config, host_version, Box::new(connector))
    }

    pub fn with_clock(
        config: PresenceConfig,
        host_version: impl Into<String>,
        connector: Box<dyn Connector>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            host_version: host_version.into(),
            clock,
            lifecycle: Lifecycle::Idle { connector },
        }
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Disposed)
    }

    /// Spawns the workers, begins connecting and queues an initial update.
    pub fn start(&mut self) -> Result<()> {
        match &self.lifecycle {
            Lifecycle::Running(_) => return Err(ControllerError::AlreadyStarted),
            Lifecycle::Disposed => return Err(ControllerError::Disposed),
            Lifecycle::Idle { .. } => {}
        }
        self.config.validate()?;

        let connector = match mem::replace(&mut self.lifecycle, Lifecycle::Disposed) {
            Lifecycle::Idle { connector } => connector,
            other => {
                self.lifecycle = other;
                return Err(ControllerError::AlreadyStarted);
            }
        };

        let supervisor = SupervisorHandle::spawn(
            connector,
            SupervisorSettings::from_config(&self.config),
            Arc::clone(&self.clock),
        )
        .map_err(|source| ControllerError::WorkerSpawn {
            name: "presence-supervisor",
            source,
        })?;

        let core = SyncCore::new(
            IdeState::new(self.host_version.clone()),
            self.config.display.clone(),
            self.config.sync.coalesce_window(),
            Box::new(supervisor.sender()),
        );
        let sync = SyncHandle::spawn(core, Arc::clone(&self.clock)).map_err(|source| {
            ControllerError::WorkerSpawn {
                name: "presence-sync",
                source,
            }
        })?;

        sync.update();
        self.lifecycle = Lifecycle::Running(Workers {
            sync,
            supervisor,
        });
        info!(host_version = %self.host_version, "Presence controller started");
        Ok(())
    }

    /// Hands the event to the synchronizer. `ShutdownImminent` disposes.
    pub fn on_ide_event(&mut self, event: IdeEvent) -> Result<()> {
        if self.is_disposed() {
            return Err(ControllerError::Disposed);
        }
        if event == IdeEvent::ShutdownImminent {
            info!("Host shutting down; disposing presence controller");
            self.dispose();
            return Ok(());
        }
        self.workers()?.sync.on_event(event);
        Ok(())
    }

    /// Recomputes and pushes the current snapshot without waiting for the
    /// coalescing window.
    pub fn update(&mut self) -> Result<()> {
        self.workers()?.sync.update();
        Ok(())
    }

    /// Replaces display and sync settings, then pushes an update.
    /// Connection settings apply to the next controller instance.
    pub fn update_config(&mut self, config: PresenceConfig) -> Result<()> {
        if self.is_disposed() {
            return Err(ControllerError::Disposed);
        }
        config.validate()?;

        if config.connection != self.config.connection {
            debug!("Connection settings changed; they apply after restart");
        }
        if let Lifecycle::Running(workers) = &self.lifecycle {
            workers
                .sync
                .update_config(config.display.clone(), config.sync.coalesce_window());
        }
        self.config = config;
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        match &self.lifecycle {
            Lifecycle::Running(workers) => workers.supervisor.state(),
            _ => ConnectionState::Disconnected,
        }
    }

    /// Stops the synchronizer, then cancels and shuts down the supervisor.
    /// Calling it again is a no-op.
    pub fn dispose(&mut self) {
        match mem::replace(&mut self.lifecycle, Lifecycle::Disposed) {
            Lifecycle::Running(mut workers) => {
                workers.sync.shutdown();
                workers
                    .supervisor
                    .shutdown(self.config.connection.dispose_grace());
                info!("Presence controller disposed");
            }
            Lifecycle::Idle { .. } => debug!("Presence controller disposed before start"),
            Lifecycle::Disposed => debug!("Presence controller already disposed"),
        }
    }

    fn workers(&self) -> Result<&Workers> {
        match &self.lifecycle {
            Lifecycle::Running(workers) => Ok(workers),
            Lifecycle::Idle { .. } => Err(ControllerError::NotStarted),
            Lifecycle::Disposed => Err(ControllerError::Disposed),
        }
    }
}

impl Drop for PresenceController {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::error::ConfigError;
    use crate::test_support::{wait_for, FakeConnector};

    fn config() -> PresenceConfig {
        let mut config = PresenceConfig::default();
        config.connection.client_id = "551591830725066752".to_string();
        config.sync.coalesce_window_ms = 20;
        config
    }

    fn started(connector: &FakeConnector) -> PresenceController {
        let mut controller =
            PresenceController::new(config(), "17.8", Box::new(connector.clone()));
        controller.start().expect("start controller");
        controller
    }

    #[test]
    fn start_pushes_initial_version_only_presence() {
        let connector = FakeConnector::available();
        let _controller = started(&connector);

        assert!(wait_for(|| connector.sent().len() == 1));
        let activity = &connector.sent()[0];
        assert!(activity.details.is_none());
        assert!(activity.state.is_none());
        let assets = activity.assets.as_ref().expect("assets");
        assert_eq!(assets.large_text.as_deref(), Some("Visual Studio 17.8"));
    }

    #[test]
    fn opening_solution_sends_scenario_payload_once() {
        let connector = FakeConnector::available();
        let mut controller = started(&connector);
        assert!(wait_for(|| connector.sent().len() == 1));

        controller
            .on_ide_event(IdeEvent::SolutionOpened {
                name: "Foo".to_string(),
            })
            .expect("event");
        controller
            .on_ide_event(IdeEvent::ActiveDocumentChanged {
                path: Some("C:\\src\\Foo\\bar.cs".to_string()),
            })
            .expect("event");

        assert!(wait_for(|| connector.sent().len() == 2));
        std::thread::sleep(std::time::Duration::from_millis(100));
        let sent = connector.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].details.as_deref(), Some("File bar.cs"));
        assert_eq!(sent[1].state.as_deref(), Some("Project Foo"));
        assert_eq!(controller.state(), ConnectionState::Connected);
    }

    #[test]
    fn start_twice_is_rejected() {
        let connector = FakeConnector::available();
        let mut controller = started(&connector);
        assert!(matches!(
            controller.start(),
            Err(ControllerError::AlreadyStarted)
        ));
    }

    #[test]
    fn start_requires_client_id() {
        let mut controller = PresenceController::new(
            PresenceConfig::default(),
            "17.8",
            Box::new(FakeConnector::available()),
        );
        assert!(matches!(
            controller.start(),
            Err(ControllerError::Config(ConfigError::Invalid(_)))
        ));
        assert!(!controller.is_disposed());
    }

    #[test]
    fn calls_before_start_report_not_started() {
        let mut controller =
            PresenceController::new(config(), "17.8", Box::new(FakeConnector::available()));
        assert!(matches!(
            controller.update(),
            Err(ControllerError::NotStarted)
        ));
    }

    #[test]
    fn dispose_is_idempotent_and_closes_once() {
        let connector = FakeConnector::available();
        let mut controller = started(&connector);
        assert!(wait_for(|| controller.state() == ConnectionState::Connected));

        controller.dispose();
        controller.dispose();
        drop(controller);

        assert_eq!(connector.closes(), 1);
    }

    #[test]
    fn entry_points_after_dispose_fail() {
        let connector = FakeConnector::available();
        let mut controller = started(&connector);
        controller.dispose();

        assert!(matches!(controller.start(), Err(ControllerError::Disposed)));
        assert!(matches!(controller.update(), Err(ControllerError::Disposed)));
        assert!(matches!(
            controller.on_ide_event(IdeEvent::SolutionClosed),
            Err(ControllerError::Disposed)
        ));
        assert!(matches!(
            controller.on_ide_event(IdeEvent::ShutdownImminent),
            Err(ControllerError::Disposed)
        ));
        assert!(matches!(
            controller.update_config(config()),
            Err(ControllerError::Disposed)
        ));
        assert_eq!(controller.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn shutdown_imminent_disposes() {
        let connector = FakeConnector::available();
        let mut controller = started(&connector);
        assert!(wait_for(|| controller.state() == ConnectionState::Connected));

        controller
            .on_ide_event(IdeEvent::ShutdownImminent)
            .expect("shutdown event");

        assert!(controller.is_disposed());
        assert_eq!(connector.closes(), 1);
    }

    #[test]
    fn unavailable_service_stays_silent_and_disposes_promptly() {
        let connector = FakeConnector::default();
        let mut controller = started(&connector);
        controller.update().expect("update");
        assert!(wait_for(|| connector.attempts() >= 1));
        assert_eq!(controller.state(), ConnectionState::Disconnected);

        let started_at = std::time::Instant::now();
        controller.dispose();
        assert!(started_at.elapsed() < std::time::Duration::from_secs(1));
        assert!(connector.sent().is_empty());
    }

    #[test]
    fn update_config_hides_file_name() {
        let connector = FakeConnector::available();
        let mut controller = started(&connector);
        controller
            .on_ide_event(IdeEvent::ActiveDocumentChanged {
                path: Some("bar.cs".to_string()),
            })
            .expect("event");
        assert!(wait_for(|| connector
            .sent()
            .iter()
            .any(|a| a.details.as_deref() == Some("File bar.cs"))));

        let mut next = config();
        next.display.show_file_name = false;
        controller.update_config(next).expect("update config");

        assert!(wait_for(|| connector
            .sent()
            .last()
            .map(|a| a.details.is_none())
            .unwrap_or(false)));
        assert!(!controller.config().display.show_file_name);
    }

    #[test]
    fn display_and_timestamp_change_together_send_once() {
        let connector = FakeConnector::available();
        let mut controller = started(&connector);
        controller
            .on_ide_event(IdeEvent::ActiveDocumentChanged {
                path: Some("bar.cs".to_string()),
            })
            .expect("event");
        assert!(wait_for(|| connector.sent().len() == 2));

        let mut next = config();
        next.display.show_file_name = false;
        next.display.show_timestamp = false;
        controller.update_config(next).expect("update config");

        assert!(wait_for(|| connector.sent().len() == 3));
        std::thread::sleep(std::time::Duration::from_millis(100));
        let sent = connector.sent();
        assert_eq!(sent.len(), 3);
        assert!(sent[2].details.is_none());
        assert!(sent[2].timestamps.is_none());
    }

    #[test]
    fn update_config_rejects_invalid_settings() {
        let connector = FakeConnector::available();
        let mut controller = started(&connector);
        let invalid = PresenceConfig {
            connection: ConnectionConfig {
                handshake_timeout_ms: 0,
                ..config().connection
            },
            ..config()
        };
        assert!(controller.update_config(invalid).is_err());
        assert_eq!(controller.config().connection.handshake_timeout_ms, 5000);
    }
}
