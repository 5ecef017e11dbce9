use super::core::DaemonCore;
use super::housekeeping::Housekeeper;
use super::protocol::{read_frame, write_frame, ArchivedRequest, MessageFrame, Response};
use super::saved_state::SavedStateLog;
use super::transport::SocketTransport;
use crate::clienv;
use crate::error::ConfdError;
use crate::lock;
use crate::user_config::UserConfig;
use anyhow::{Context, Result};
use rkyv::option::ArchivedOption;
use rkyv::string::ArchivedString;
use std::fs::{DirBuilder, File};
use std::io::Write;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;

use tracing::{debug, error, info, trace, warn};

pub struct DaemonConfig {
    pub lock_dir: PathBuf,
    pub state_dir: PathBuf,
    pub socket_path: PathBuf,
    /// Pipe write end inherited from the activating client
    pub ready_fd: Option<RawFd>,
    pub settings: UserConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            lock_dir: clienv::lock_dir(),
            state_dir: clienv::state_dir(),
            socket_path: clienv::daemon_socket_path(std::process::id()),
            ready_fd: None,
            settings: UserConfig::default(),
        }
    }
}

pub struct DaemonServer {
    config: DaemonConfig,
    core: Arc<DaemonCore<SocketTransport>>,
    shutdown: watch::Sender<bool>,
    version: String,
}

impl DaemonServer {
    pub fn new(config: DaemonConfig) -> Self {
        let transport = SocketTransport::new(config.settings.call_timeout());
        let log = SavedStateLog::new(
            clienv::saved_state_path(&config.state_dir),
            config.settings.append_idle(),
        );
        let (shutdown, _) = watch::channel(false);

        Self {
            core: Arc::new(DaemonCore::new(transport, log)),
            config,
            shutdown,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub async fn run(self) -> Result<()> {
        info!("confd starting...");

        let socket_path = self.config.socket_path.clone();
        if let Some(parent) = socket_path.parent() {
            DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        // The name carries our pid, so anything already there is left over.
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }

        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("Failed to bind {}", socket_path.display()))?;
        let _socket = SocketFile(socket_path.clone());

        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&socket_path, perms)?;
        }

        let address = socket_path
            .to_str()
            .with_context(|| format!("Socket path {} is not UTF-8", socket_path.display()))?;
        let lock = lock::acquire(&self.config.lock_dir, Some(address))?;
        info!(
            "Lock acquired in {}; listening on {}",
            self.config.lock_dir.display(),
            address
        );

        if let Some(fd) = self.config.ready_fd {
            signal_ready(fd);
        }

        match self.core.restore_from_saved_state().await {
            Ok(report) => debug!(report = ?report, "Saved state replayed"),
            Err(e) => warn!("Unable to restore saved state, starting empty: {}", e),
        }
        if let Err(e) = self.core.compact().await {
            warn!("Failed to compact saved state: {}", e);
        }

        let mut shutdown_rx = self.shutdown.subscribe();
        let housekeeper = Housekeeper::new(
            Arc::clone(&self.core),
            self.shutdown.clone(),
            &self.config.settings,
        );
        tokio::spawn(housekeeper.run());

        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;
            let shutdown = self.shutdown.clone();

            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM");
                    }
                    _ = sigint.recv() => {
                        info!("Received SIGINT");
                    }
                }
                let _ = shutdown.send(true);
            });
        }

        let server = Arc::new(self);
        info!("confd ready");

        loop {
            tokio::select! {
                conn = listener.accept() => {
                    match conn {
                        Ok((stream, _)) => {
                            let server = Arc::clone(&server);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream).await {
                                    error!("Connection handler error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        server.core.begin_shutdown();
        if let Err(e) = server.core.compact().await {
            warn!("Failed to save state at shutdown: {}", e);
        }

        if let Err(e) = lock.release() {
            error!("Failed to release lock: {}", e);
        }

        info!("confd stopped");
        Ok(())
    }

    async fn handle_connection(&self, mut stream: UnixStream) -> Result<()> {
        trace!("New connection accepted");

        let request_buf = read_frame(&mut stream).await?;
        trace!("Request length: {} bytes", request_buf.len());

        let archived = rkyv::access::<ArchivedRequest, rkyv::rancor::Error>(&request_buf)
            .map_err(|e| anyhow::anyhow!("Failed to deserialize request: {}", e))?;

        let response = self.handle_request(archived).await;

        let response_bytes = MessageFrame::encode_response(&response)
            .map_err(|e| anyhow::anyhow!("Failed to encode response: {}", e))?;
        write_frame(&mut stream, &response_bytes).await?;

        trace!("Response sent");
        Ok(())
    }

    async fn handle_request(&self, request: &ArchivedRequest) -> Response {
        let result = match request {
            ArchivedRequest::Ping => {
                debug!("Handling: Ping");
                self.core.ping().map(|pid| Response::Pong {
                    pid,
                    uptime_secs: self.core.uptime_secs(),
                    version: self.version.clone(),
                })
            }

            ArchivedRequest::Shutdown => {
                info!("Handling: Shutdown");
                self.core.check_in_shutdown().map(|()| {
                    self.core.begin_shutdown();
                    let _ = self.shutdown.send(true);
                    Response::Ok
                })
            }

            ArchivedRequest::GetDefaultDatabase => {
                debug!("Handling: GetDefaultDatabase");
                self.core
                    .obtain_database(None)
                    .await
                    .map(|address| Response::Database { address })
            }

            ArchivedRequest::GetDatabase { address } => {
                debug!("Handling: GetDatabase({})", address);
                self.core
                    .obtain_database(Some(address.as_str()))
                    .await
                    .map(|address| Response::Database { address })
            }

            ArchivedRequest::AddClient { client } => {
                debug!("Handling: AddClient({})", client);
                self.core
                    .add_client(client.as_str())
                    .await
                    .map(|()| Response::Ok)
            }

            ArchivedRequest::RemoveClient { client } => {
                debug!("Handling: RemoveClient({})", client);
                self.core
                    .remove_client(client.as_str())
                    .await
                    .map(|()| Response::Ok)
            }

            ArchivedRequest::Subscribe {
                database,
                prefix,
                client,
            } => {
                debug!("Handling: Subscribe({}, {})", prefix, client);
                self.core
                    .subscribe(database_ref(database), prefix.as_str(), client.as_str())
                    .await
                    .map(|connection_id| Response::Subscribed { connection_id })
            }

            ArchivedRequest::Unsubscribe {
                database,
                connection_id,
            } => {
                let connection_id = connection_id.to_native();
                debug!("Handling: Unsubscribe({})", connection_id);
                self.core
                    .unsubscribe(database_ref(database), connection_id)
                    .await
                    .map(|()| Response::Ok)
            }

            ArchivedRequest::Set {
                database,
                key,
                value,
            } => {
                debug!("Handling: Set({})", key);
                self.core
                    .set(database_ref(database), key.as_str(), value.as_str())
                    .await
                    .map(|()| Response::Ok)
            }

            ArchivedRequest::Unset { database, key } => {
                debug!("Handling: Unset({})", key);
                self.core
                    .unset(database_ref(database), key.as_str())
                    .await
                    .map(|()| Response::Ok)
            }

            ArchivedRequest::Lookup { database, key } => {
                trace!("Handling: Lookup({})", key);
                self.core
                    .lookup(database_ref(database), key.as_str())
                    .await
                    .map(|value| Response::Value { value })
            }
        };

        result.unwrap_or_else(|e| error_response(&e))
    }
}

fn database_ref(database: &ArchivedOption<ArchivedString>) -> Option<&str> {
    database.as_ref().map(|s| s.as_str())
}

fn error_response(e: &ConfdError) -> Response {
    Response::Error {
        kind: e.kind(),
        message: e.to_string(),
    }
}

/// Write the readiness byte to the activating client and close the pipe.
fn signal_ready(fd: RawFd) {
    // SAFETY: the descriptor was handed to us on the command line for this
    // single write; nothing else in the process owns it.
    let mut pipe = unsafe { File::from_raw_fd(fd) };
    match pipe.write_all(b"g") {
        Ok(()) => debug!("Signalled readiness on fd {}", fd),
        Err(e) => warn!("Failed to signal readiness on fd {}: {}", fd, e),
    }
}

/// Removes the daemon socket when the server goes away.
struct SocketFile(PathBuf);

impl SocketFile {
    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for SocketFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(self.path()) {
            debug!("Failed to remove socket {}: {}", self.path().display(), e);
        }
    }
}
