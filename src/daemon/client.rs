//! Client side of the daemon protocol.

use super::protocol::{read_frame, write_frame, MessageFrame, Request, Response};
use crate::error::{ConfdError, Result};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tracing::trace;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// What a daemon says about itself when pinged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonInfo {
    pub pid: u32,
    pub uptime_secs: u64,
    pub version: String,
}

/// Talks to one daemon at a known socket address.
#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl DaemonClient {
    pub fn new(address: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: address.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn address(&self) -> &Path {
        &self.socket_path
    }

    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    pub async fn ping(&self) -> Result<DaemonInfo> {
        match self.request(Request::Ping).await? {
            Response::Pong {
                pid,
                uptime_secs,
                version,
            } => Ok(DaemonInfo {
                pid,
                uptime_secs,
                version,
            }),
            other => Err(unexpected(other)),
        }
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.expect_ok(Request::Shutdown).await
    }

    pub async fn default_database(&self) -> Result<RemoteDatabase> {
        match self.request(Request::GetDefaultDatabase).await? {
            Response::Database { address } => Ok(self.remote(address)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn database(&self, address: &str) -> Result<RemoteDatabase> {
        let request = Request::GetDatabase {
            address: address.to_string(),
        };
        match self.request(request).await? {
            Response::Database { address } => Ok(self.remote(address)),
            other => Err(unexpected(other)),
        }
    }

    /// Register a listener endpoint address as a known client.
    pub async fn add_client(&self, client: &str) -> Result<()> {
        self.expect_ok(Request::AddClient {
            client: client.to_string(),
        })
        .await
    }

    pub async fn remove_client(&self, client: &str) -> Result<()> {
        self.expect_ok(Request::RemoveClient {
            client: client.to_string(),
        })
        .await
    }

    fn remote(&self, address: Option<String>) -> RemoteDatabase {
        RemoteDatabase {
            client: self.clone(),
            address,
        }
    }

    async fn expect_ok(&self, request: Request) -> Result<()> {
        match self.request(request).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Send one request and wait for its response. Error responses come
    /// back as the matching [`ConfdError`].
    async fn request(&self, request: Request) -> Result<Response> {
        trace!(request = ?request, "Sending request to daemon");
        let exchange = async {
            let mut stream = UnixStream::connect(&self.socket_path)
                .await
                .map_err(|e| self.connect_error(e))?;

            let frame = MessageFrame::encode_request(&request)
                .map_err(|e| ConfdError::Protocol(format!("failed to encode request: {}", e)))?;
            write_frame(&mut stream, &frame).await?;

            let payload = read_frame(&mut stream).await?;
            MessageFrame::decode_response(&payload)
                .map_err(|e| ConfdError::Protocol(format!("failed to decode response: {}", e)))
        };

        let response = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                ConfdError::Failed(format!(
                    "daemon at {} did not answer within {:?}",
                    self.socket_path.display(),
                    self.timeout
                ))
            })??;

        match response {
            Response::Error { kind, message } => Err(ConfdError::from_wire(kind, message)),
            other => Ok(other),
        }
    }

    fn connect_error(&self, e: io::Error) -> ConfdError {
        match e.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => ConfdError::NoServer(
                format!("nothing listening at {}", self.socket_path.display()),
            ),
            _ => ConfdError::Io(e),
        }
    }
}

fn unexpected(response: Response) -> ConfdError {
    ConfdError::Protocol(format!("unexpected response: {:?}", response))
}

/// A database opened on a daemon. `address` is `None` for the default one.
#[derive(Debug, Clone)]
pub struct RemoteDatabase {
    client: DaemonClient,
    address: Option<String>,
}

impl RemoteDatabase {
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// Ask for notifications of changes at or below `prefix`, delivered to
    /// the listener endpoint at `listener`.
    pub async fn subscribe(&self, prefix: &str, listener: &str) -> Result<u32> {
        let request = Request::Subscribe {
            database: self.address.clone(),
            prefix: prefix.to_string(),
            client: listener.to_string(),
        };
        match self.client.request(request).await? {
            Response::Subscribed { connection_id } => Ok(connection_id),
            other => Err(unexpected(other)),
        }
    }

    pub async fn unsubscribe(&self, connection_id: u32) -> Result<()> {
        self.client
            .expect_ok(Request::Unsubscribe {
                database: self.address.clone(),
                connection_id,
            })
            .await
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.client
            .expect_ok(Request::Set {
                database: self.address.clone(),
                key: key.to_string(),
                value: value.to_string(),
            })
            .await
    }

    pub async fn unset(&self, key: &str) -> Result<()> {
        self.client
            .expect_ok(Request::Unset {
                database: self.address.clone(),
                key: key.to_string(),
            })
            .await
    }

    pub async fn lookup(&self, key: &str) -> Result<Option<String>> {
        let request = Request::Lookup {
            database: self.address.clone(),
            key: key.to_string(),
        };
        match self.client.request(request).await? {
            Response::Value { value } => Ok(value),
            other => Err(unexpected(other)),
        }
    }
}
