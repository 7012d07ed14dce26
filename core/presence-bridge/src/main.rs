//! vs-presence-bridge: host adapter for the presence controller.
//!
//! The IDE extension spawns this binary and writes one JSON notification per
//! line to its stdin. The bridge owns logging and config loading; everything
//! else lives in `presence-core`.
//!
//! ## Subcommands
//!
//! - `run`: Start the controller and pump host notifications from stdin
//! - `check-config`: Load and validate the config file, then print it

mod host;
mod logging;

use clap::{Parser, Subcommand};
use host::ConfigOverrides;
use presence_core::{load_config, ConfigError, ControllerError, PresenceController};
use std::io;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "vs-presence-bridge")]
#[command(about = "Mirror IDE activity into the local rich presence service")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the presence controller (reads JSON lines from stdin)
    Run {
        /// Config file (defaults to <config_dir>/vs-presence/presence.toml)
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Application id registered with the presence service
        #[arg(long)]
        client_id: Option<String>,

        /// Host IDE version shown in the presence card
        #[arg(long, default_value = "17.0")]
        host_version: String,

        /// Presence service socket, overriding endpoint discovery
        #[arg(long, value_name = "PATH")]
        socket: Option<PathBuf>,
    },

    /// Validate the config file and print the effective settings
    CheckConfig {
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, thiserror::Error)]
enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error("Failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
}

fn main() {
    let cli = Cli::parse();
    let _logging_guard = logging::init();

    let result = match cli.command {
        Commands::Run {
            config,
            client_id,
            host_version,
            socket,
        } => run(config, ConfigOverrides { client_id, socket }, host_version),
        Commands::CheckConfig { config } => check_config(config),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "vs-presence-bridge failed");
        std::process::exit(1);
    }
}

fn run(
    config_path: Option<PathBuf>,
    overrides: ConfigOverrides,
    host_version: String,
) -> Result<(), BridgeError> {
    let mut config = load_config(config_path.clone())?;
    overrides.apply(&mut config);

    let mut controller = PresenceController::with_ipc(config, host_version);
    controller.start()?;

    let stdin = io::stdin();
    host::pump(stdin.lock(), &mut controller, || {
        let mut config = load_config(config_path.clone())?;
        overrides.apply(&mut config);
        Ok(config)
    })?;
    Ok(())
}

fn check_config(config_path: Option<PathBuf>) -> Result<(), BridgeError> {
    let config = load_config(config_path)?;
    println!("{}", toml::to_string_pretty(&config)?);
    config.validate()?;
    println!("Config OK");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn help_is_handled_by_parser() {
        let err = Cli::try_parse_from(["vs-presence-bridge", "--help"])
            .err()
            .expect("help exits early");
        assert_eq!(err.kind(), ErrorKind::DisplayHelp);
    }

    #[test]
    fn run_accepts_overrides() {
        let cli = Cli::try_parse_from([
            "vs-presence-bridge",
            "run",
            "--client-id",
            "551591830725066752",
            "--socket",
            "/run/user/1000/discord-ipc-0",
        ])
        .expect("parse run");

        match cli.command {
            Commands::Run {
                client_id,
                host_version,
                socket,
                config,
            } => {
                assert_eq!(client_id.as_deref(), Some("551591830725066752"));
                assert_eq!(host_version, "17.0");
                assert_eq!(socket, Some(PathBuf::from("/run/user/1000/discord-ipc-0")));
                assert!(config.is_none());
            }
            Commands::CheckConfig { .. } => panic!("expected run"),
        }
    }
}
