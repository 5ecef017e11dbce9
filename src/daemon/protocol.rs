//! IPC protocol types using rkyv for zero-copy serialization
//!
//! Two conversations share one framing:
//! - clients call the daemon with [`Request`] and get a [`Response`];
//! - the daemon calls a client's listener endpoint with [`ListenerRequest`]
//!   and gets a [`ListenerResponse`].
//!
//! Every connection carries exactly one request and one response.

use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame either side will accept.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// IPC request from client to daemon
///
/// `database: None` addresses the default database.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub enum Request {
    // Daemon lifecycle
    /// Check if daemon is alive; answered with its pid
    Ping,
    /// Shutdown the daemon
    Shutdown,

    // Databases
    GetDefaultDatabase,
    /// Open (or create) the database with this address
    GetDatabase { address: String },

    // Client set
    AddClient { client: String },
    RemoveClient { client: String },

    // Listeners
    Subscribe {
        database: Option<String>,
        prefix: String,
        /// Address of the client's listener endpoint
        client: String,
    },
    Unsubscribe {
        database: Option<String>,
        connection_id: u32,
    },

    // Values
    Set {
        database: Option<String>,
        key: String,
        value: String,
    },
    Unset {
        database: Option<String>,
        key: String,
    },
    Lookup {
        database: Option<String>,
        key: String,
    },
}

/// IPC response from daemon to client
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub enum Response {
    /// Response to Ping
    Pong {
        pid: u32,
        uptime_secs: u64,
        version: String,
    },
    /// Generic success
    Ok,
    /// An opened database
    Database { address: Option<String> },
    /// Subscription accepted
    Subscribed { connection_id: u32 },
    /// Result of a lookup
    Value { value: Option<String> },
    /// Error occurred
    Error { kind: ErrorKind, message: String },
}

/// Error classification carried on the wire
#[derive(Archive, Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub enum ErrorKind {
    LockFailed,
    NoServer,
    Failed,
    InShutdown,
    BadKey,
}

/// A value change under a subscribed prefix.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub struct Notification {
    pub database: Option<String>,
    pub connection_id: u32,
    pub key: String,
    /// New value, `None` when the key was unset
    pub value: Option<String>,
}

/// Tells a client that a restarted daemon re-keyed one of its subscriptions.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub struct ListenerUpdate {
    pub database: Option<String>,
    pub old_connection_id: u32,
    pub location: String,
    pub new_connection_id: u32,
}

/// IPC request from daemon to a client's listener endpoint
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub enum ListenerRequest {
    Ping,
    Notify(Notification),
    UpdateListener(ListenerUpdate),
}

/// IPC response from a listener endpoint
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub enum ListenerResponse {
    Pong,
    Ok,
    Error { message: String },
}

/// Message frame for wire protocol
///
/// Format: [4-byte length (little-endian)][rkyv bytes]
pub struct MessageFrame;

impl MessageFrame {
    /// Encode a request to bytes with length prefix
    pub fn encode_request(request: &Request) -> Result<Vec<u8>, rkyv::rancor::Error> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(request)?;
        Ok(Self::prefixed(&bytes))
    }

    /// Encode a response to bytes with length prefix
    pub fn encode_response(response: &Response) -> Result<Vec<u8>, rkyv::rancor::Error> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(response)?;
        Ok(Self::prefixed(&bytes))
    }

    pub fn encode_listener_request(
        request: &ListenerRequest,
    ) -> Result<Vec<u8>, rkyv::rancor::Error> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(request)?;
        Ok(Self::prefixed(&bytes))
    }

    pub fn encode_listener_response(
        response: &ListenerResponse,
    ) -> Result<Vec<u8>, rkyv::rancor::Error> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(response)?;
        Ok(Self::prefixed(&bytes))
    }

    pub fn decode_response(bytes: &[u8]) -> Result<Response, rkyv::rancor::Error> {
        rkyv::from_bytes::<Response, rkyv::rancor::Error>(bytes)
    }

    pub fn decode_listener_request(bytes: &[u8]) -> Result<ListenerRequest, rkyv::rancor::Error> {
        rkyv::from_bytes::<ListenerRequest, rkyv::rancor::Error>(bytes)
    }

    pub fn decode_listener_response(
        bytes: &[u8],
    ) -> Result<ListenerResponse, rkyv::rancor::Error> {
        rkyv::from_bytes::<ListenerResponse, rkyv::rancor::Error>(bytes)
    }

    /// Read length prefix from buffer
    pub fn read_length(buf: &[u8; 4]) -> usize {
        u32::from_le_bytes(*buf) as usize
    }

    fn prefixed(bytes: &[u8]) -> Vec<u8> {
        let len = bytes.len() as u32;
        let mut result = Vec::with_capacity(4 + bytes.len());
        result.extend_from_slice(&len.to_le_bytes());
        result.extend_from_slice(bytes);
        result
    }
}

/// Read one length-prefixed frame into an aligned buffer ready for rkyv.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<AlignedVec> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = MessageFrame::read_length(&len_buf);
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }

    let mut raw = vec![0u8; len];
    reader.read_exact(&mut raw).await?;

    let mut aligned = AlignedVec::<16>::with_capacity(len);
    aligned.extend_from_slice(&raw);
    Ok(aligned)
}

/// Write an already-framed message and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}
