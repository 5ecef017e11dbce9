//! Calls from the daemon back to client listener endpoints.

use super::protocol::{
    read_frame, write_frame, ListenerRequest, ListenerResponse, ListenerUpdate, MessageFrame,
    Notification,
};
use std::fmt;
use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UnixStream;
use tracing::trace;

/// Reference to a client's callback endpoint. Equality and hashing are
/// structural over the address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientHandle(Arc<str>);

impl ClientHandle {
    pub fn new(address: &str) -> Self {
        Self(Arc::from(address))
    }

    pub fn address(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("no object at '{0}'")]
    NoSuchObject(String),

    #[error("I/O error talking to '{address}': {source}")]
    Io {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("call to '{0}' timed out")]
    Timeout(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("client refused the call: {0}")]
    Rejected(String),
}

/// How the daemon reaches clients.
pub trait ClientTransport: Send + Sync + 'static {
    /// Turn a serialized address into a handle without contacting it.
    fn resolve(&self, address: &str) -> Result<ClientHandle, TransportError>;

    fn ping(
        &self,
        client: &ClientHandle,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn notify(
        &self,
        client: &ClientHandle,
        notification: Notification,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Tell a client that one of its subscriptions has a new connection id.
    fn update_listener(
        &self,
        client: &ClientHandle,
        update: ListenerUpdate,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Reaches clients over their unix socket, one connection per call.
#[derive(Debug, Clone)]
pub struct SocketTransport {
    timeout: Duration,
}

impl SocketTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn call(
        &self,
        client: &ClientHandle,
        request: &ListenerRequest,
    ) -> Result<ListenerResponse, TransportError> {
        let address = client.address();
        let exchange = async {
            let mut stream = UnixStream::connect(address)
                .await
                .map_err(|e| connect_error(address, e))?;

            let frame = MessageFrame::encode_listener_request(request)
                .map_err(|e| TransportError::Protocol(e.to_string()))?;
            write_frame(&mut stream, &frame)
                .await
                .map_err(|e| io_error(address, e))?;

            let payload = read_frame(&mut stream)
                .await
                .map_err(|e| io_error(address, e))?;
            MessageFrame::decode_listener_response(&payload)
                .map_err(|e| TransportError::Protocol(e.to_string()))
        };

        let response = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout(address.to_string()))??;
        trace!(client = %client, response = ?response, "Listener call answered");
        Ok(response)
    }

    async fn call_expecting_ok(
        &self,
        client: &ClientHandle,
        request: &ListenerRequest,
    ) -> Result<(), TransportError> {
        match self.call(client, request).await? {
            ListenerResponse::Ok => Ok(()),
            ListenerResponse::Error { message } => Err(TransportError::Rejected(message)),
            other => Err(TransportError::Protocol(format!(
                "unexpected response: {:?}",
                other
            ))),
        }
    }
}

impl ClientTransport for SocketTransport {
    fn resolve(&self, address: &str) -> Result<ClientHandle, TransportError> {
        if address.is_empty() || !Path::new(address).is_absolute() {
            return Err(TransportError::Protocol(format!(
                "'{}' is not a socket path",
                address
            )));
        }
        Ok(ClientHandle::new(address))
    }

    async fn ping(&self, client: &ClientHandle) -> Result<(), TransportError> {
        match self.call(client, &ListenerRequest::Ping).await? {
            ListenerResponse::Pong => Ok(()),
            ListenerResponse::Error { message } => Err(TransportError::Rejected(message)),
            other => Err(TransportError::Protocol(format!(
                "unexpected response to ping: {:?}",
                other
            ))),
        }
    }

    async fn notify(
        &self,
        client: &ClientHandle,
        notification: Notification,
    ) -> Result<(), TransportError> {
        self.call_expecting_ok(client, &ListenerRequest::Notify(notification))
            .await
    }

    async fn update_listener(
        &self,
        client: &ClientHandle,
        update: ListenerUpdate,
    ) -> Result<(), TransportError> {
        self.call_expecting_ok(client, &ListenerRequest::UpdateListener(update))
            .await
    }
}

fn connect_error(address: &str, e: io::Error) -> TransportError {
    match e.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => {
            TransportError::NoSuchObject(address.to_string())
        }
        _ => io_error(address, e),
    }
}

fn io_error(address: &str, source: io::Error) -> TransportError {
    TransportError::Io {
        address: address.to_string(),
        source,
    }
}
