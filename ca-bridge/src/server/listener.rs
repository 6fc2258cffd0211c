//! Unix socket listener for the CAM server.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;

use crate::bridge::CaBridge;
use crate::error::BridgeError;
use crate::server::session::Session;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Filesystem path of the listening socket.
    pub socket_path: PathBuf,
    /// How long to wait for the server identification after connect.
    pub handshake_timeout: Duration,
}

/// Accepts CAM server connections and serves them one at a time.
pub struct Server {
    config: ServerConfig,
    bridge: Arc<CaBridge>,
    cancel: CancellationToken,
}

impl Server {
    pub fn new(config: ServerConfig, bridge: Arc<CaBridge>, cancel: CancellationToken) -> Self {
        Self {
            config,
            bridge,
            cancel,
        }
    }

    /// Serve until shutdown is requested or a fatal error occurs.
    ///
    /// The socket path is removed on return either way.
    pub async fn run(&self) -> Result<(), BridgeError> {
        let listener = bind_socket(&self.config.socket_path)?;
        info!("Listening on {}", self.config.socket_path.display());

        let result = self.accept_loop(&listener).await;

        drop(listener);
        remove_socket(&self.config.socket_path);
        result
    }

    async fn accept_loop(&self, listener: &UnixListener) -> Result<(), BridgeError> {
        let mut connection_count = 0u64;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Shutdown requested, closing listener");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        connection_count += 1;
                        let session_id = connection_count;
                        info!("[Session {}] New connection", session_id);

                        let mut session = Session::new(
                            session_id,
                            stream,
                            Arc::clone(&self.bridge),
                            self.cancel.clone(),
                            self.config.handshake_timeout,
                        );
                        match session.run().await {
                            Ok(()) => info!("[Session {}] Connection closed", session_id),
                            Err(e) if e.is_fatal() => {
                                error!("[Session {}] Fatal: {}", session_id, e);
                                return Err(e);
                            }
                            Err(e) => warn!("[Session {}] Connection error: {}", session_id, e),
                        }
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        }
    }
}

/// Bind the listening socket, replacing a stale socket file.
fn bind_socket(path: &Path) -> io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    UnixListener::bind(path)
}

fn remove_socket(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}
