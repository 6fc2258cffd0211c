//! ca-bridge: conditional-access bridge for a CAM server.
//!
//! Listens on a Unix socket for the CAM server and translates its requests
//! into tuner, demux and descrambler operations.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use ca_bridge::logging;
use ca_bridge::platform::DryRunPlatform;
use ca_bridge::{BridgeConfig, CaBridge, ProfileKey, Server, ServerConfig, TunePurpose};

const DEFAULT_SOCKET: &str = "/tmp/.listen.camd.socket";
const DEFAULT_DEMUX_COUNT: usize = 2;
const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CONFIG_FILE: &str = "ca-bridge.toml";

/// ca-bridge - conditional-access bridge for a CAM server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path of the listening Unix socket
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Number of hardware demultiplexers
    #[arg(short = 'n', long)]
    demux_count: Option<usize>,

    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory where log files are stored
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Number of days to keep log files
    #[arg(long)]
    log_retention_days: Option<u64>,
}

/// Configuration file format.
#[derive(Debug, serde::Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    logging: LoggingSection,
    #[serde(default)]
    profiles: Vec<ProfileSection>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct ServerSection {
    socket_path: Option<String>,
    demux_count: Option<usize>,
    handshake_timeout_secs: Option<u64>,
    verify_pmt_crc: Option<bool>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct LoggingSection {
    log_dir: Option<String>,
    retention_days: Option<u64>,
    level: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct ProfileSection {
    purpose: TunePurpose,
    #[serde(default)]
    screen: u8,
}

fn load_config(path: &Path) -> Result<ConfigFile, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: ConfigFile = toml::from_str(&contents)?;
    Ok(config)
}

/// Distinct profiles from the config file, main@0 when none are listed.
fn configured_profiles(sections: &[ProfileSection]) -> Vec<ProfileKey> {
    let profiles: BTreeSet<ProfileKey> = sections
        .iter()
        .map(|p| ProfileKey::new(p.purpose, p.screen))
        .collect();
    if profiles.is_empty() {
        return vec![ProfileKey::main(0)];
    }
    profiles.into_iter().collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Explicit path > auto-detect > defaults
    let config_path = args.config.clone().or_else(|| {
        let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
        default_path.exists().then_some(default_path)
    });
    let file_config = match &config_path {
        Some(path) => match load_config(path) {
            Ok(c) => {
                eprintln!("Loaded config from: {}", path.display());
                c
            }
            Err(e) => {
                eprintln!("Failed to load config file: {}", e);
                return Err(e);
            }
        },
        None => ConfigFile::default(),
    };

    // Command line takes precedence over the file
    let log_dir = args
        .log_dir
        .clone()
        .or_else(|| file_config.logging.log_dir.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("logs"));
    let log_retention_days = args
        .log_retention_days
        .or(file_config.logging.retention_days)
        .unwrap_or(7);
    logging::init_logging(
        &log_dir,
        log_retention_days,
        args.verbose,
        file_config.logging.level.as_deref(),
    )?;

    let socket_path = args
        .socket
        .clone()
        .or_else(|| file_config.server.socket_path.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET));
    let demux_count = args
        .demux_count
        .or(file_config.server.demux_count)
        .unwrap_or(DEFAULT_DEMUX_COUNT);
    let handshake_timeout = Duration::from_secs(
        file_config
            .server
            .handshake_timeout_secs
            .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
    );
    let profiles = configured_profiles(&file_config.profiles);

    let bridge_config = BridgeConfig {
        demux_count,
        profiles,
        verify_pmt_crc: file_config.server.verify_pmt_crc.unwrap_or(true),
    };
    info!(
        "Bridge: {} demux slot(s), profiles [{}], PMT CRC check {}",
        bridge_config.demux_count,
        bridge_config
            .profiles
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", "),
        if bridge_config.verify_pmt_crc { "on" } else { "off" }
    );

    warn!("No hardware backend linked, using the dry-run platform");
    let platform = Arc::new(DryRunPlatform::new());
    let bridge = match CaBridge::new(bridge_config, platform.clone(), platform) {
        Ok(bridge) => Arc::new(bridge),
        Err(e) => {
            error!("{}", e);
            return Err(e.into());
        }
    };

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            wait_for_shutdown_signal().await;
            cancel.cancel();
        }
    });

    let server = Server::new(
        ServerConfig {
            socket_path,
            handshake_timeout,
        },
        bridge,
        cancel,
    );
    match server.run().await {
        Ok(()) => {
            info!("ca-bridge stopped");
            Ok(())
        }
        Err(e) => {
            error!("Stopping on fatal error: {}", e);
            Err(e.into())
        }
    }
}

/// Wait for SIGTERM or SIGINT.
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            warn!("Failed to register signal handlers ({}), falling back to ctrl-c", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl+C");
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_profiles_removes_repeats() {
        let config: ConfigFile = toml::from_str(
            r#"
            [[profiles]]
            purpose = "main"

            [[profiles]]
            purpose = "pip"

            [[profiles]]
            purpose = "main"
            screen = 0
            "#,
        )
        .unwrap();
        assert_eq!(
            configured_profiles(&config.profiles),
            vec![ProfileKey::main(0), ProfileKey::pip(0)]
        );
    }

    #[test]
    fn test_configured_profiles_defaults_to_main() {
        assert_eq!(configured_profiles(&[]), vec![ProfileKey::main(0)]);
    }
}
