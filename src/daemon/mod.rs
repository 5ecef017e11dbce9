//! confd daemon - per-user configuration server
//!
//! One daemon per configuration root, elected through the lock directory.
//! It handles:
//! - Databases with their values and listener registries
//! - Change notifications to subscribed clients
//! - The saved-state log that lets a restarted daemon re-key old listeners
//!
//! # Architecture
//!
//! Requests and client callbacks both travel as rkyv archives over unix
//! sockets, one request per connection.
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                 confd daemon                   │
//! ├───────────────────────────────────────────────┤
//! │  Server       │  DaemonCore       │ Housekeeper│
//! │  (socket)     │  (dbs, clients)   │ (sweeps)   │
//! ├───────────────────────────────────────────────┤
//! │        saved_state log    │   ClientTransport  │
//! └───────────────────────────────────────────────┘
//!             │ notify / update listener
//!             ▼
//!      ListenerEndpoint (in each client)
//! ```

pub mod client;
pub mod core;
pub mod database;
pub mod housekeeping;
pub mod listener;
pub mod protocol;
pub mod quote;
pub mod registry;
pub mod saved_state;
pub mod server;
pub mod transport;

pub use client::{DaemonClient, DaemonInfo, RemoteDatabase};
pub use self::core::{DaemonCore, ReplayReport};
pub use housekeeping::Housekeeper;
pub use listener::{ListenerEndpoint, ListenerEvent};
pub use protocol::{Notification, Request, Response};
pub use server::{DaemonConfig, DaemonServer};
pub use transport::{ClientHandle, ClientTransport, SocketTransport};
