//! Host message pump.
//!
//! The IDE adapter writes one JSON object per line. Anything with a `type`
//! of `update` or `reload_config` is a bridge command; everything else must
//! be an `IdeEvent`. Bad lines are logged and skipped so one malformed
//! notification never takes presence down.

use presence_core::{ConfigError, ControllerError, IdeEvent, PresenceConfig, PresenceController};
use serde::Deserialize;
use serde_json::Value;
use std::io::BufRead;
use std::path::PathBuf;
use tracing::{debug, info, warn};

const MAX_LOGGED_LINE_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlMessage {
    Update,
    ReloadConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostMessage {
    Control(ControlMessage),
    Event(IdeEvent),
}

/// Command-line settings that win over the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub client_id: Option<String>,
    pub socket: Option<PathBuf>,
}

impl ConfigOverrides {
    pub fn apply(&self, config: &mut PresenceConfig) {
        if let Some(client_id) = &self.client_id {
            config.connection.client_id = client_id.clone();
        }
        if let Some(socket) = &self.socket {
            config.connection.socket_path = Some(socket.clone());
        }
    }
}

fn parse_line(line: &str) -> Result<HostMessage, serde_json::Error> {
    let value: Value = serde_json::from_str(line)?;
    let is_control = matches!(
        value.get("type").and_then(Value::as_str),
        Some("update" | "reload_config")
    );
    if is_control {
        serde_json::from_value(value).map(HostMessage::Control)
    } else {
        serde_json::from_value(value).map(HostMessage::Event)
    }
}

/// Feeds host messages into the controller until EOF or `shutdown_imminent`,
/// then disposes it.
pub fn pump<R, F>(
    input: R,
    controller: &mut PresenceController,
    mut reload: F,
) -> Result<(), ControllerError>
where
    R: BufRead,
    F: FnMut() -> Result<PresenceConfig, ConfigError>,
{
    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "Failed to read host input; stopping");
                break;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let message = match parse_line(trimmed) {
            Ok(message) => message,
            Err(err) => {
                let preview: String = trimmed.chars().take(MAX_LOGGED_LINE_CHARS).collect();
                warn!(error = %err, line = %preview, "Skipping malformed host message");
                continue;
            }
        };

        match message {
            HostMessage::Event(event) => {
                let shutdown = event == IdeEvent::ShutdownImminent;
                controller.on_ide_event(event)?;
                if shutdown {
                    break;
                }
            }
            HostMessage::Control(ControlMessage::Update) => controller.update()?,
            HostMessage::Control(ControlMessage::ReloadConfig) => match reload() {
                Ok(config) => match controller.update_config(config) {
                    Ok(()) => info!("Presence config reloaded"),
                    Err(ControllerError::Config(err)) => {
                        warn!(error = %err, "Ignoring invalid presence config")
                    }
                    Err(err) => return Err(err),
                },
                Err(err) => warn!(error = %err, "Failed to reload presence config"),
            },
        }
    }

    debug!("Host input finished");
    controller.dispose();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use presence_core::{CloseNotifier, ConnectError, Connector, Transport};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct OfflineConnector {
        attempts: Arc<AtomicUsize>,
    }

    impl Connector for OfflineConnector {
        fn connect(
            &mut self,
            _client_id: &str,
            _on_close: CloseNotifier,
        ) -> Result<Box<dyn Transport>, ConnectError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(ConnectError::EndpointUnavailable {
                details: "offline".to_string(),
            })
        }
    }

    fn config() -> PresenceConfig {
        let mut config = PresenceConfig::default();
        config.connection.client_id = "551591830725066752".to_string();
        config
    }

    fn started_controller() -> PresenceController {
        let mut controller =
            PresenceController::new(config(), "17.8", Box::new(OfflineConnector::default()));
        controller.start().expect("start controller");
        controller
    }

    #[test]
    fn parses_events_and_control_messages() {
        assert_eq!(
            parse_line(r#"{"type":"solution_opened","name":"Foo"}"#).expect("event"),
            HostMessage::Event(IdeEvent::SolutionOpened {
                name: "Foo".to_string()
            })
        );
        assert_eq!(
            parse_line(r#"{"type":"update"}"#).expect("update"),
            HostMessage::Control(ControlMessage::Update)
        );
        assert_eq!(
            parse_line(r#"{"type":"reload_config"}"#).expect("reload"),
            HostMessage::Control(ControlMessage::ReloadConfig)
        );
        assert!(parse_line(r#"{"type":"solution_opened"}"#).is_err());
        assert!(parse_line("not json").is_err());
    }

    #[test]
    fn malformed_lines_are_skipped_and_eof_disposes() {
        let mut controller = started_controller();
        let input = Cursor::new(
            "garbage\n\n{\"type\":\"active_document_changed\",\"path\":\"a.cs\"}\n{\"type\":\"mystery\"}\n{\"type\":\"update\"}\n",
        );

        pump(input, &mut controller, || Ok(config())).expect("pump");
        assert!(controller.is_disposed());
    }

    #[test]
    fn shutdown_imminent_stops_reading() {
        let mut controller = started_controller();
        let input = Cursor::new(
            "{\"type\":\"shutdown_imminent\"}\n{\"type\":\"update\"}\n",
        );

        pump(input, &mut controller, || Ok(config())).expect("pump");
        assert!(controller.is_disposed());
    }

    #[test]
    fn reload_applies_new_display_settings_and_overrides() {
        let mut controller = started_controller();
        let overrides = ConfigOverrides {
            client_id: Some("42".to_string()),
            socket: None,
        };
        let input = Cursor::new("{\"type\":\"reload_config\"}\n");
        let mut reloads = 0;

        pump(input, &mut controller, || {
            reloads += 1;
            let mut next = config();
            next.display.file_word = "Datei".to_string();
            overrides.apply(&mut next);
            Ok(next)
        })
        .expect("pump");

        assert_eq!(reloads, 1);
        assert_eq!(controller.config().display.file_word, "Datei");
        assert_eq!(controller.config().connection.client_id, "42");
    }

    #[test]
    fn invalid_reloaded_config_is_ignored() {
        let mut controller = started_controller();
        let input = Cursor::new("{\"type\":\"reload_config\"}\n");

        pump(input, &mut controller, || Ok(PresenceConfig::default())).expect("pump");
        assert_eq!(
            controller.config().connection.client_id,
            "551591830725066752"
        );
    }
}
