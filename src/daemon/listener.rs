//! The endpoint a client process exposes so the daemon can call it back.
//!
//! Serves pings, notifications and connection-id updates on a unix socket.
//! When a restarted daemon re-keys a subscription, later notifications are
//! reported under the id the subscription was first given, so callers keep
//! a stable identity across daemon restarts. Subscribing and unsubscribing
//! through the endpoint keeps those aliases in step with the daemon.

use super::client::RemoteDatabase;
use super::protocol::{
    read_frame, write_frame, ListenerRequest, ListenerResponse, ListenerUpdate, MessageFrame,
    Notification,
};
use crate::clienv;
use crate::error::{ConfdError, Result};
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

static ENDPOINT_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    /// A change under a subscribed prefix, carrying the stable id.
    Notify(Notification),
    /// The daemon restarted and gave subscription `id` a new connection id.
    Rekeyed {
        database: Option<String>,
        id: u32,
        location: String,
        new_connection_id: u32,
    },
}

/// (database, current connection id) -> id the caller knows
type Aliases = Arc<Mutex<HashMap<(Option<String>, u32), u32>>>;

pub struct ListenerEndpoint {
    path: PathBuf,
    address: String,
    events: mpsc::UnboundedReceiver<ListenerEvent>,
    aliases: Aliases,
    task: JoinHandle<()>,
}

impl ListenerEndpoint {
    /// Bind at a fresh path in the runtime directory.
    pub async fn bind_default() -> Result<Self> {
        let seq = ENDPOINT_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = clienv::client_socket_path(std::process::id(), seq);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::bind(path).await
    }

    pub async fn bind(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let address = path
            .to_str()
            .ok_or_else(|| {
                ConfdError::Failed(format!("socket path {} is not UTF-8", path.display()))
            })?
            .to_string();

        let listener = UnixListener::bind(&path)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;

        let (tx, events) = mpsc::unbounded_channel();
        let aliases: Aliases = Arc::default();
        let task = tokio::spawn(serve(listener, tx, Arc::clone(&aliases)));

        debug!("Listener endpoint bound at {}", address);
        Ok(Self {
            path,
            address,
            events,
            aliases,
            task,
        })
    }

    /// Address to hand to the daemon when subscribing.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Next callback from the daemon.
    pub async fn recv(&mut self) -> Option<ListenerEvent> {
        self.events.recv().await
    }

    /// Connection id the daemon currently uses for subscription `id`, needed
    /// to unsubscribe after a daemon restart.
    pub fn current_id(&self, database: Option<&str>, id: u32) -> u32 {
        lock_aliases(&self.aliases)
            .iter()
            .find(|((db, _), stable)| db.as_deref() == database && **stable == id)
            .map(|((_, current), _)| *current)
            .unwrap_or(id)
    }

    /// Subscribe this endpoint to changes under `prefix`.
    pub async fn subscribe(&self, database: &RemoteDatabase, prefix: &str) -> Result<u32> {
        let id = database.subscribe(prefix, &self.address).await?;
        // A fresh id means itself, whatever an earlier daemon used it for.
        drop_aliases(&self.aliases, database.address(), id);
        Ok(id)
    }

    /// Cancel subscription `id`, following it across daemon restarts.
    pub async fn unsubscribe(&self, database: &RemoteDatabase, id: u32) -> Result<()> {
        let current = self.current_id(database.address(), id);
        database.unsubscribe(current).await?;
        self.forget(database.address(), id);
        Ok(())
    }

    /// Drop what the endpoint knows about subscription `id`, for callers
    /// that unsubscribed some other way.
    pub fn forget(&self, database: Option<&str>, id: u32) {
        drop_aliases(&self.aliases, database, id);
    }
}

impl Drop for ListenerEndpoint {
    fn drop(&mut self) {
        self.task.abort();
        if let Err(e) = std::fs::remove_file(&self.path) {
            trace!("Failed to remove listener socket {}: {}", self.path.display(), e);
        }
    }
}

async fn serve(listener: UnixListener, tx: mpsc::UnboundedSender<ListenerEvent>, aliases: Aliases) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let tx = tx.clone();
                let aliases = Arc::clone(&aliases);
                tokio::spawn(async move {
                    if let Err(e) = handle_call(stream, &tx, &aliases).await {
                        debug!("Listener call failed: {}", e);
                    }
                });
            }
            Err(e) => {
                warn!("Listener accept error: {}", e);
                return;
            }
        }
    }
}

async fn handle_call(
    mut stream: UnixStream,
    tx: &mpsc::UnboundedSender<ListenerEvent>,
    aliases: &Aliases,
) -> Result<()> {
    let payload = read_frame(&mut stream).await?;
    let request = MessageFrame::decode_listener_request(&payload)
        .map_err(|e| ConfdError::Protocol(format!("failed to decode callback: {}", e)))?;
    trace!(request = ?request, "Daemon callback");

    let response = match request {
        ListenerRequest::Ping => ListenerResponse::Pong,
        ListenerRequest::Notify(notification) => {
            let id = stable_id(aliases, notification.database.clone(), notification.connection_id);
            forward(
                tx,
                ListenerEvent::Notify(Notification {
                    connection_id: id,
                    ..notification
                }),
            )
        }
        ListenerRequest::UpdateListener(update) => {
            let event = rekey(aliases, update);
            forward(tx, event)
        }
    };

    let frame = MessageFrame::encode_listener_response(&response)
        .map_err(|e| ConfdError::Protocol(format!("failed to encode reply: {}", e)))?;
    write_frame(&mut stream, &frame).await?;
    Ok(())
}

fn forward(tx: &mpsc::UnboundedSender<ListenerEvent>, event: ListenerEvent) -> ListenerResponse {
    match tx.send(event) {
        Ok(()) => ListenerResponse::Ok,
        Err(_) => ListenerResponse::Error {
            message: "listener is no longer receiving".to_string(),
        },
    }
}

fn lock_aliases(aliases: &Aliases) -> MutexGuard<'_, HashMap<(Option<String>, u32), u32>> {
    match aliases.lock() {
        Ok(aliases) => aliases,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn stable_id(aliases: &Aliases, database: Option<String>, connection_id: u32) -> u32 {
    lock_aliases(aliases)
        .get(&(database, connection_id))
        .copied()
        .unwrap_or(connection_id)
}

/// Remove every alias from or to `id` on `database`.
fn drop_aliases(aliases: &Aliases, database: Option<&str>, id: u32) {
    lock_aliases(aliases).retain(|(db, current), stable| {
        db.as_deref() != database || (*current != id && *stable != id)
    });
}

fn rekey(aliases: &Aliases, update: ListenerUpdate) -> ListenerEvent {
    let mut aliases = lock_aliases(aliases);
    let id = aliases
        .remove(&(update.database.clone(), update.old_connection_id))
        .unwrap_or(update.old_connection_id);
    aliases.insert((update.database.clone(), update.new_connection_id), id);
    debug!(
        "Subscription {} on {} is now connection {}",
        id, update.location, update.new_connection_id
    );

    ListenerEvent::Rekeyed {
        database: update.database,
        id,
        location: update.location,
        new_connection_id: update.new_connection_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::transport::{ClientTransport, SocketTransport};
    use std::time::Duration;

    fn notification(connection_id: u32, key: &str) -> Notification {
        Notification {
            database: None,
            connection_id,
            key: key.to_string(),
            value: Some("v".to_string()),
        }
    }

    #[tokio::test]
    async fn answers_ping_and_forwards_notifications() {
        let dir = tempfile::tempdir().unwrap();
        let mut endpoint = ListenerEndpoint::bind(dir.path().join("c.sock")).await.unwrap();
        let transport = SocketTransport::new(Duration::from_secs(2));
        let handle = transport.resolve(endpoint.address()).unwrap();

        transport.ping(&handle).await.unwrap();
        transport
            .notify(&handle, notification(3, "/a/b"))
            .await
            .unwrap();

        assert_eq!(
            endpoint.recv().await,
            Some(ListenerEvent::Notify(notification(3, "/a/b")))
        );
    }

    #[tokio::test]
    async fn rekeyed_subscription_keeps_its_first_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut endpoint = ListenerEndpoint::bind(dir.path().join("c.sock")).await.unwrap();
        let transport = SocketTransport::new(Duration::from_secs(2));
        let handle = transport.resolve(endpoint.address()).unwrap();

        transport
            .update_listener(
                &handle,
                ListenerUpdate {
                    database: None,
                    old_connection_id: 7,
                    location: "/foo".to_string(),
                    new_connection_id: 12,
                },
            )
            .await
            .unwrap();
        assert_eq!(
            endpoint.recv().await,
            Some(ListenerEvent::Rekeyed {
                database: None,
                id: 7,
                location: "/foo".to_string(),
                new_connection_id: 12,
            })
        );
        assert_eq!(endpoint.current_id(None, 7), 12);

        // A second restart re-keys again from the current id.
        transport
            .update_listener(
                &handle,
                ListenerUpdate {
                    database: None,
                    old_connection_id: 12,
                    location: "/foo".to_string(),
                    new_connection_id: 2,
                },
            )
            .await
            .unwrap();
        endpoint.recv().await.unwrap();
        assert_eq!(endpoint.current_id(None, 7), 2);

        transport
            .notify(&handle, notification(2, "/foo/bar"))
            .await
            .unwrap();
        assert_eq!(
            endpoint.recv().await,
            Some(ListenerEvent::Notify(notification(7, "/foo/bar")))
        );
    }

    #[tokio::test]
    async fn forgotten_subscription_no_longer_renames_its_old_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut endpoint = ListenerEndpoint::bind(dir.path().join("c.sock")).await.unwrap();
        let transport = SocketTransport::new(Duration::from_secs(2));
        let handle = transport.resolve(endpoint.address()).unwrap();

        transport
            .update_listener(
                &handle,
                ListenerUpdate {
                    database: None,
                    old_connection_id: 7,
                    location: "/foo".to_string(),
                    new_connection_id: 1,
                },
            )
            .await
            .unwrap();
        endpoint.recv().await.unwrap();

        endpoint.forget(None, 7);
        assert_eq!(endpoint.current_id(None, 7), 7);

        // A later daemon hands out id 1 again for an unrelated subscription.
        transport
            .notify(&handle, notification(1, "/bar/x"))
            .await
            .unwrap();
        assert_eq!(
            endpoint.recv().await,
            Some(ListenerEvent::Notify(notification(1, "/bar/x")))
        );
    }

    #[tokio::test]
    async fn forget_only_touches_its_own_database() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = ListenerEndpoint::bind(dir.path().join("c.sock")).await.unwrap();
        let transport = SocketTransport::new(Duration::from_secs(2));
        let handle = transport.resolve(endpoint.address()).unwrap();

        for database in [None, Some("xml:/srv".to_string())] {
            transport
                .update_listener(
                    &handle,
                    ListenerUpdate {
                        database,
                        old_connection_id: 7,
                        location: "/foo".to_string(),
                        new_connection_id: 3,
                    },
                )
                .await
                .unwrap();
        }

        endpoint.forget(Some("xml:/srv"), 7);
        assert_eq!(endpoint.current_id(Some("xml:/srv"), 7), 7);
        assert_eq!(endpoint.current_id(None, 7), 3);
    }

    #[tokio::test]
    async fn dropping_the_endpoint_removes_its_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.sock");
        let endpoint = ListenerEndpoint::bind(&path).await.unwrap();
        assert!(path.exists());

        drop(endpoint);
        assert!(!path.exists());
    }
}
