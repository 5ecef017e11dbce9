//! Daemon state: the client set, open databases with their listener
//! registries, and the saved-state log, all behind one lock.
//!
//! Change notifications are queued while that lock is held and delivered by
//! one task per client, so a client sees changes in commit order and a
//! client that stops answering only holds up its own queue.

use super::database::{address_from_persisted, persisted_name, Database};
use super::protocol::{ListenerUpdate, Notification};
use super::registry::validate_key;
use super::saved_state::{ListenerRecord, LogEntry, SavedStateLog};
use super::transport::{ClientHandle, ClientTransport};
use crate::error::{ConfdError, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Outcome of replaying the saved-state log.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayReport {
    pub clients_restored: usize,
    pub clients_dropped: usize,
    pub listeners_restored: usize,
    pub listeners_dropped: usize,
}

/// Delivers one client's notifications in the order they were queued.
struct Courier {
    queue: mpsc::UnboundedSender<Notification>,
    task: JoinHandle<()>,
}

impl Courier {
    fn spawn<T: ClientTransport>(transport: Arc<T>, client: ClientHandle) -> Self {
        let (queue, mut pending) = mpsc::unbounded_channel::<Notification>();
        let task = tokio::spawn(async move {
            while let Some(notification) = pending.recv().await {
                let connection_id = notification.connection_id;
                if let Err(e) = transport.notify(&client, notification).await {
                    warn!(
                        client = %client,
                        connection_id,
                        "Failed to notify listener: {}",
                        e
                    );
                }
            }
        });
        Self { queue, task }
    }
}

impl Drop for Courier {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct CoreState {
    clients: BTreeSet<ClientHandle>,
    default_db: Database,
    databases: HashMap<String, Database>,
    log: SavedStateLog,
    needs_compaction: bool,
    couriers: HashMap<ClientHandle, Courier>,
}

impl CoreState {
    fn database(&self, address: Option<&str>) -> Option<&Database> {
        match address {
            None => Some(&self.default_db),
            Some(address) => self.databases.get(address),
        }
    }

    fn database_mut(&mut self, address: Option<&str>) -> Option<&mut Database> {
        match address {
            None => Some(&mut self.default_db),
            Some(address) => self.databases.get_mut(address),
        }
    }

    fn obtain(&mut self, address: Option<&str>) -> &mut Database {
        match address {
            None => &mut self.default_db,
            Some(address) => self
                .databases
                .entry(address.to_string())
                .or_insert_with(|| {
                    debug!("Opened database {}", address);
                    Database::new(address)
                }),
        }
    }

    fn all_databases(&self) -> impl Iterator<Item = &Database> {
        std::iter::once(&self.default_db).chain(self.databases.values())
    }

    /// Record a change. A failed append is logged; the change stands.
    fn log_change(&mut self, entry: LogEntry) {
        self.needs_compaction = true;
        if let Err(e) = self.log.append(&entry) {
            warn!("Failed to log change to saved state: {}", e);
        }
    }

    /// Current state as the entries a compacted log holds.
    fn snapshot(&self) -> Vec<LogEntry> {
        let mut entries: Vec<LogEntry> = self
            .clients
            .iter()
            .map(|c| LogEntry::AddClient(c.address().to_string()))
            .collect();

        for db in self.all_databases() {
            for listener in db.listeners().iter() {
                entries.push(LogEntry::AddListener(ListenerRecord {
                    connection_id: listener.connection_id,
                    database: db.persisted_name().to_string(),
                    location: listener.prefix.clone(),
                    client: listener.client.address().to_string(),
                }));
            }
        }
        entries
    }

    fn listener_count(&self) -> usize {
        self.all_databases().map(|db| db.listeners().len()).sum()
    }

    /// Queue a change for every listener at or above `key`.
    ///
    /// Failed deliveries are logged by the courier and leave the registry
    /// untouched.
    fn queue_notifications<T: ClientTransport>(
        &mut self,
        transport: &Arc<T>,
        database: Option<&str>,
        key: &str,
        value: Option<&str>,
    ) {
        let Some(db) = self.database(database) else {
            return;
        };
        let deliveries: Vec<(ClientHandle, Notification)> = db
            .listeners()
            .matching(key)
            .map(|l| {
                (
                    l.client.clone(),
                    Notification {
                        database: database.map(str::to_string),
                        connection_id: l.connection_id,
                        key: key.to_string(),
                        value: value.map(str::to_string),
                    },
                )
            })
            .collect();

        trace!(key, listeners = deliveries.len(), "Dispatching change");
        for (client, notification) in deliveries {
            let courier = self
                .couriers
                .entry(client.clone())
                .or_insert_with(|| Courier::spawn(Arc::clone(transport), client.clone()));
            if let Err(mpsc::error::SendError(notification)) = courier.queue.send(notification) {
                debug!(client = %client, "Courier stopped, starting a new one");
                let fresh = Courier::spawn(Arc::clone(transport), client.clone());
                let _ = fresh.queue.send(notification);
                self.couriers.insert(client, fresh);
            }
        }
    }
}

/// Everything a running daemon knows, shared by all connections.
pub struct DaemonCore<T: ClientTransport> {
    transport: Arc<T>,
    state: Mutex<CoreState>,
    in_shutdown: AtomicBool,
    started_at: Instant,
}

impl<T: ClientTransport> DaemonCore<T> {
    pub fn new(transport: T, log: SavedStateLog) -> Self {
        Self {
            transport: Arc::new(transport),
            state: Mutex::new(CoreState {
                clients: BTreeSet::new(),
                default_db: Database::new_default(),
                databases: HashMap::new(),
                log,
                needs_compaction: false,
                couriers: HashMap::new(),
            }),
            in_shutdown: AtomicBool::new(false),
            started_at: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn check_in_shutdown(&self) -> Result<()> {
        if self.in_shutdown.load(Ordering::SeqCst) {
            Err(ConfdError::InShutdown)
        } else {
            Ok(())
        }
    }

    /// Refuse every further call.
    pub fn begin_shutdown(&self) {
        if !self.in_shutdown.swap(true, Ordering::SeqCst) {
            info!("Daemon entering shutdown");
        }
    }

    pub fn is_in_shutdown(&self) -> bool {
        self.in_shutdown.load(Ordering::SeqCst)
    }

    pub fn ping(&self) -> Result<u32> {
        self.check_in_shutdown()?;
        Ok(std::process::id())
    }

    /// Open (or create) a database. `None` is the default database.
    pub async fn obtain_database(&self, address: Option<&str>) -> Result<Option<String>> {
        self.check_in_shutdown()?;
        if address == Some("") {
            return Err(ConfdError::Failed("empty database address".to_string()));
        }
        let mut state = self.state.lock().await;
        Ok(state.obtain(address).address().map(str::to_string))
    }

    pub async fn add_client(&self, address: &str) -> Result<()> {
        self.check_in_shutdown()?;
        let client = self.resolve_client(address)?;

        let mut state = self.state.lock().await;
        if state.clients.insert(client.clone()) {
            state.log_change(LogEntry::AddClient(client.address().to_string()));
            debug!(client = %client, "Added a new client");
        } else {
            // Normal after replay: a restored client re-adds itself.
            trace!(client = %client, "Client already known");
        }
        Ok(())
    }

    pub async fn remove_client(&self, address: &str) -> Result<()> {
        self.check_in_shutdown()?;
        let client = ClientHandle::new(address);

        let mut state = self.state.lock().await;
        if state.clients.remove(&client) {
            state.log_change(LogEntry::RemoveClient(client.address().to_string()));
            debug!(client = %client, "Removed client");
        } else {
            warn!(client = %client, "A client removed itself without having been added");
        }
        Ok(())
    }

    pub async fn client_count(&self) -> usize {
        self.state.lock().await.clients.len()
    }

    pub async fn listener_count(&self) -> usize {
        self.state.lock().await.listener_count()
    }

    /// No clients and no listeners anywhere.
    pub async fn is_idle(&self) -> bool {
        let state = self.state.lock().await;
        state.clients.is_empty() && state.listener_count() == 0
    }

    pub async fn subscribe(
        &self,
        database: Option<&str>,
        prefix: &str,
        client_address: &str,
    ) -> Result<u32> {
        self.check_in_shutdown()?;
        validate_key(prefix)?;
        let client = self.resolve_client(client_address)?;

        let mut state = self.state.lock().await;
        let db = state.obtain(database);
        let connection_id = db.listeners_mut().subscribe(prefix, client.clone());
        let record = ListenerRecord {
            connection_id,
            database: db.persisted_name().to_string(),
            location: prefix.to_string(),
            client: client.address().to_string(),
        };
        state.log_change(LogEntry::AddListener(record));

        debug!(
            connection_id,
            prefix,
            client = %client,
            "Added listener"
        );
        Ok(connection_id)
    }

    /// Unknown ids are logged and otherwise ignored.
    pub async fn unsubscribe(&self, database: Option<&str>, connection_id: u32) -> Result<()> {
        self.check_in_shutdown()?;

        let mut state = self.state.lock().await;
        let Some(db) = state.database_mut(database) else {
            warn!(
                "Unsubscribe of connection {} on database '{}' which isn't open",
                connection_id,
                persisted_name(database)
            );
            return Ok(());
        };

        match db.listeners_mut().unsubscribe(connection_id) {
            Some(listener) => {
                let record = ListenerRecord {
                    connection_id,
                    database: db.persisted_name().to_string(),
                    location: listener.prefix,
                    client: listener.client.address().to_string(),
                };
                state.log_change(LogEntry::RemoveListener(record));
                debug!(connection_id, "Removed listener");
            }
            None => {
                warn!(
                    "Listener {} doesn't exist on database '{}'",
                    connection_id,
                    persisted_name(database)
                );
            }
        }
        Ok(())
    }

    /// Store a value. Listeners are notified in the background; `set`
    /// never waits on them.
    pub async fn set(&self, database: Option<&str>, key: &str, value: &str) -> Result<()> {
        self.check_in_shutdown()?;
        let mut state = self.state.lock().await;
        if state.obtain(database).set(key, value)? {
            state.queue_notifications(&self.transport, database, key, Some(value));
        }
        Ok(())
    }

    pub async fn unset(&self, database: Option<&str>, key: &str) -> Result<()> {
        self.check_in_shutdown()?;
        let mut state = self.state.lock().await;
        if state.obtain(database).unset(key)?.is_some() {
            state.queue_notifications(&self.transport, database, key, None);
        }
        Ok(())
    }

    pub async fn lookup(&self, database: Option<&str>, key: &str) -> Result<Option<String>> {
        self.check_in_shutdown()?;
        let state = self.state.lock().await;
        match state.database(database) {
            Some(db) => Ok(db.lookup(key)?.map(str::to_string)),
            None => {
                validate_key(key)?;
                Ok(None)
            }
        }
    }

    /// Ping every known client and forget the dead ones along with their
    /// subscriptions. Returns how many clients were dropped.
    pub async fn sweep_clients(&self) -> usize {
        let candidates: BTreeSet<ClientHandle> = {
            let state = self.state.lock().await;
            let mut all = state.clients.clone();
            for db in state.all_databases() {
                all.extend(db.listeners().clients());
            }
            all
        };

        let mut dead = Vec::new();
        for client in candidates {
            if let Err(e) = self.transport.ping(&client).await {
                debug!(client = %client, "Removing stale client: {}", e);
                dead.push(client);
            }
        }
        if dead.is_empty() {
            return 0;
        }

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        for client in &dead {
            state.couriers.remove(client);
            if state.clients.remove(client) {
                state.log_change(LogEntry::RemoveClient(client.address().to_string()));
            }

            let mut removed = Vec::new();
            for db in std::iter::once(&mut state.default_db).chain(state.databases.values_mut()) {
                let name = db.persisted_name().to_string();
                for listener in db.listeners_mut().remove_client(client) {
                    removed.push(ListenerRecord {
                        connection_id: listener.connection_id,
                        database: name.clone(),
                        location: listener.prefix,
                        client: listener.client.address().to_string(),
                    });
                }
            }
            for record in removed {
                state.log_change(LogEntry::RemoveListener(record));
            }
        }

        info!("Dropped {} stale client(s)", dead.len());
        dead.len()
    }

    /// Rebuild the client set and registries from the saved-state log.
    ///
    /// Only an unreadable log is an error; individual entries that can't be
    /// restored are dropped.
    pub async fn restore_from_saved_state(&self) -> Result<ReplayReport> {
        let surviving = self.state.lock().await.log.read()?;
        let mut report = ReplayReport::default();

        for address in surviving.clients {
            match self.revive_client(&address).await {
                Ok(()) => report.clients_restored += 1,
                Err(e) => {
                    debug!(
                        "Client {} in saved state no longer exists, not restoring it: {}",
                        address, e
                    );
                    report.clients_dropped += 1;
                }
            }
        }

        for record in surviving.listeners {
            if self.restore_listener(record).await {
                report.listeners_restored += 1;
            } else {
                report.listeners_dropped += 1;
            }
        }

        info!(
            clients = report.clients_restored,
            listeners = report.listeners_restored,
            dropped = report.clients_dropped + report.listeners_dropped,
            "Restored saved state"
        );
        Ok(report)
    }

    async fn revive_client(&self, address: &str) -> Result<()> {
        let client = self.resolve_client(address)?;
        self.transport
            .ping(&client)
            .await
            .map_err(|e| ConfdError::Failed(e.to_string()))?;

        let mut state = self.state.lock().await;
        if state.clients.insert(client.clone()) {
            state.log_change(LogEntry::AddClient(client.address().to_string()));
        }
        Ok(())
    }

    /// Re-add a listener from a previous daemon under a fresh id and tell
    /// its client. Returns whether the listener survived.
    async fn restore_listener(&self, record: ListenerRecord) -> bool {
        let database = address_from_persisted(&record.database).map(str::to_string);

        if let Err(e) = validate_key(&record.location) {
            debug!("Dropping saved listener: {}", e);
            return false;
        }
        let client = match self.resolve_client(&record.client) {
            Ok(client) => client,
            Err(e) => {
                debug!(
                    "Client in saved state no longer exists, not updating its listener: {}",
                    e
                );
                return false;
            }
        };

        let new_id = {
            let mut state = self.state.lock().await;
            // Cancel first so a second replay can't apply the entry again.
            state.log_change(LogEntry::RemoveListener(record.clone()));
            state
                .obtain(database.as_deref())
                .listeners_mut()
                .subscribe(&record.location, client.clone())
        };

        debug!(
            "Updating listener from saved state, old connection {}, new connection {}",
            record.connection_id, new_id
        );

        let update = ListenerUpdate {
            database: database.clone(),
            old_connection_id: record.connection_id,
            location: record.location.clone(),
            new_connection_id: new_id,
        };

        match self.transport.update_listener(&client, update).await {
            Ok(()) => {
                self.state
                    .lock()
                    .await
                    .log_change(LogEntry::AddListener(ListenerRecord {
                        connection_id: new_id,
                        ..record
                    }));
                true
            }
            Err(e) => {
                debug!(
                    "Failed to update listener from saved state, client is probably gone: {}",
                    e
                );
                let mut state = self.state.lock().await;
                if let Some(db) = state.database_mut(database.as_deref()) {
                    db.listeners_mut().unsubscribe(new_id);
                }
                false
            }
        }
    }

    /// Rewrite the log from current state.
    pub async fn compact(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let entries = state.snapshot();
        state.log.compact(&entries)?;
        state.needs_compaction = false;
        Ok(())
    }

    /// Compact only if something changed since the last compaction.
    pub async fn compact_if_needed(&self) -> Result<bool> {
        if !self.state.lock().await.needs_compaction {
            return Ok(false);
        }
        self.compact().await?;
        Ok(true)
    }

    pub async fn close_idle_log(&self) -> bool {
        self.state.lock().await.log.close_if_idle(Instant::now())
    }

    fn resolve_client(&self, address: &str) -> Result<ClientHandle> {
        self.transport
            .resolve(address)
            .map_err(|e| ConfdError::Failed(format!("can't resolve client '{}': {}", address, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::transport::fake::FakeTransport;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    fn core_with(transport: FakeTransport, log_path: &Path) -> DaemonCore<FakeTransport> {
        DaemonCore::new(
            transport,
            SavedStateLog::new(log_path, Duration::from_secs(30)),
        )
    }

    /// Wait for at least `count` deliveries, then a little longer so any
    /// extra ones show up too.
    async fn delivered(
        transport: &FakeTransport,
        count: usize,
    ) -> Vec<(ClientHandle, Notification)> {
        for _ in 0..400 {
            if transport.notifications().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.notifications()
    }

    fn log_lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn change_under_prefix_notifies_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::with_clients(&["/c.sock"]);
        let core = core_with(transport.clone(), &dir.path().join("saved_state"));

        let id = core.subscribe(None, "/foo", "/c.sock").await.unwrap();
        core.set(None, "/foo/bar", "1").await.unwrap();
        core.set(None, "/foobar", "2").await.unwrap();

        let delivered = delivered(&transport, 1).await;
        assert_eq!(delivered.len(), 1);
        let (client, notification) = &delivered[0];
        assert_eq!(client.address(), "/c.sock");
        assert_eq!(notification.connection_id, id);
        assert_eq!(notification.key, "/foo/bar");
        assert_eq!(notification.value.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn unchanged_value_and_missing_unset_do_not_notify() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::with_clients(&["/c.sock"]);
        let core = core_with(transport.clone(), &dir.path().join("saved_state"));

        core.subscribe(None, "/", "/c.sock").await.unwrap();
        core.set(None, "/a", "x").await.unwrap();
        core.set(None, "/a", "x").await.unwrap();
        core.unset(None, "/missing").await.unwrap();
        core.unset(None, "/a").await.unwrap();

        let values: Vec<Option<String>> = delivered(&transport, 2)
            .await
            .into_iter()
            .map(|(_, n)| n.value)
            .collect();
        assert_eq!(values, vec![Some("x".to_string()), None]);
    }

    #[tokio::test]
    async fn dead_listener_does_not_fail_set_or_leave_registry() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::with_clients(&["/live.sock", "/dead.sock"]);
        let core = core_with(transport.clone(), &dir.path().join("saved_state"));

        core.subscribe(None, "/a", "/dead.sock").await.unwrap();
        core.subscribe(None, "/a", "/live.sock").await.unwrap();
        transport.kill("/dead.sock");

        core.set(None, "/a/b", "v").await.unwrap();
        assert_eq!(delivered(&transport, 1).await.len(), 1);
        assert_eq!(core.listener_count().await, 2);
    }

    #[tokio::test]
    async fn hung_listener_does_not_hold_up_set_or_other_clients() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::with_clients(&["/hung.sock", "/live.sock"]);
        transport.hang("/hung.sock");
        let core = core_with(transport.clone(), &dir.path().join("saved_state"));

        core.subscribe(None, "/a", "/hung.sock").await.unwrap();
        let live = core.subscribe(None, "/a", "/live.sock").await.unwrap();

        for value in ["1", "2"] {
            tokio::time::timeout(Duration::from_millis(200), core.set(None, "/a/b", value))
                .await
                .expect("set waited on a listener")
                .unwrap();
        }

        let delivered = delivered(&transport, 2).await;
        let values: Vec<_> = delivered
            .iter()
            .map(|(client, n)| {
                assert_eq!(client.address(), "/live.sock");
                assert_eq!(n.connection_id, live);
                n.value.clone()
            })
            .collect();
        assert_eq!(values, vec![Some("1".to_string()), Some("2".to_string())]);
    }

    #[tokio::test]
    async fn changes_to_one_key_arrive_in_commit_order() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::with_clients(&["/c.sock"]);
        let core = Arc::new(core_with(transport.clone(), &dir.path().join("saved_state")));
        core.subscribe(None, "/k", "/c.sock").await.unwrap();

        let writers: Vec<_> = (0..8)
            .map(|i| {
                let core = Arc::clone(&core);
                tokio::spawn(async move { core.set(None, "/k", &i.to_string()).await })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let delivered = delivered(&transport, 8).await;
        assert_eq!(delivered.len(), 8);
        // Each write changed the value, so the last delivery is the stored one.
        let last = delivered.last().map(|(_, n)| n.value.clone()).unwrap();
        assert_eq!(last, core.lookup(None, "/k").await.unwrap());
    }

    #[tokio::test]
    async fn every_mutation_appends_one_line() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("saved_state");
        let core = core_with(FakeTransport::with_clients(&["/c.sock"]), &log_path);

        core.add_client("/c.sock").await.unwrap();
        core.add_client("/c.sock").await.unwrap();
        let id = core
            .subscribe(Some("xml:readwrite:/tmp/db"), "/a", "/c.sock")
            .await
            .unwrap();
        core.unsubscribe(Some("xml:readwrite:/tmp/db"), id)
            .await
            .unwrap();
        core.unsubscribe(Some("xml:readwrite:/tmp/db"), 999)
            .await
            .unwrap();
        core.remove_client("/c.sock").await.unwrap();

        assert_eq!(
            log_lines(&log_path),
            vec![
                r#"CLIENTADD "/c.sock""#.to_string(),
                format!(r#"ADD {} "xml:readwrite:/tmp/db" "/a" "/c.sock""#, id),
                format!(r#"REMOVE {} "xml:readwrite:/tmp/db" "/a" "/c.sock""#, id),
                r#"CLIENTREMOVE "/c.sock""#.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn bad_prefix_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let core = core_with(
            FakeTransport::with_clients(&["/c.sock"]),
            &dir.path().join("saved_state"),
        );
        let err = core.subscribe(None, "foo/", "/c.sock").await.unwrap_err();
        assert!(matches!(err, ConfdError::BadKey { .. }));
    }

    #[tokio::test]
    async fn replay_rekeys_live_listener() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("saved_state");
        fs::write(&log_path, "ADD 7 \"def\" \"/foo\" \"addr-of-C\"\n").unwrap();

        let transport = FakeTransport::with_clients(&["addr-of-C"]);
        let core = core_with(transport.clone(), &log_path);

        let report = core.restore_from_saved_state().await.unwrap();
        assert_eq!(report.listeners_restored, 1);

        let updates = transport.updates();
        assert_eq!(updates.len(), 1);
        let (client, update) = &updates[0];
        assert_eq!(client.address(), "addr-of-C");
        assert_eq!(update.old_connection_id, 7);
        assert_eq!(update.location, "/foo");
        assert_eq!(update.database, None);
        let new_id = update.new_connection_id;

        assert_eq!(
            log_lines(&log_path),
            vec![
                r#"ADD 7 "def" "/foo" "addr-of-C""#.to_string(),
                r#"REMOVE 7 "def" "/foo" "addr-of-C""#.to_string(),
                format!(r#"ADD {} "def" "/foo" "addr-of-C""#, new_id),
            ]
        );

        // The restored listener is live under its new id.
        core.set(None, "/foo/bar", "on").await.unwrap();
        let delivered = delivered(&transport, 1).await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1.connection_id, new_id);
    }

    #[tokio::test]
    async fn replay_drops_unreachable_clients_and_listeners() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("saved_state");
        fs::write(
            &log_path,
            concat!(
                "CLIENTADD \"/gone.sock\"\n",
                "CLIENTADD \"/here.sock\"\n",
                "ADD 3 \"def\" \"/a\" \"/gone.sock\"\n",
                "ADD 4 \"def\" \"/b\" \"/refuses.sock\"\n",
            ),
        )
        .unwrap();

        let transport = FakeTransport::with_clients(&["/here.sock", "/refuses.sock"]);
        transport.refuse_updates("/refuses.sock");
        let core = core_with(transport.clone(), &log_path);

        let report = core.restore_from_saved_state().await.unwrap();
        assert_eq!(
            report,
            ReplayReport {
                clients_restored: 1,
                clients_dropped: 1,
                listeners_restored: 0,
                listeners_dropped: 2,
            }
        );
        assert_eq!(core.client_count().await, 1);
        assert_eq!(core.listener_count().await, 0);
    }

    #[tokio::test]
    async fn replaying_the_same_log_twice_gives_the_same_subscriptions() {
        let log = concat!(
            "CLIENTADD \"/c1.sock\"\n",
            "ADD 1 \"def\" \"/a\" \"/c1.sock\"\n",
            "ADD 2 \"def\" \"/a\" \"/c1.sock\"\n",
            "ADD 5 \"xml:readwrite:/srv/db\" \"/b/c\" \"/c2.sock\"\n",
            "ADD 6 \"def\" \"/z\" \"/c2.sock\"\n",
            "REMOVE 6 \"def\" \"/z\" \"/c2.sock\"\n",
        );

        let mut views = Vec::new();
        for _ in 0..2 {
            let dir = tempfile::tempdir().unwrap();
            let log_path = dir.path().join("saved_state");
            fs::write(&log_path, log).unwrap();

            let core = core_with(
                FakeTransport::with_clients(&["/c1.sock", "/c2.sock"]),
                &log_path,
            );
            core.restore_from_saved_state().await.unwrap();

            let state = core.state.lock().await;
            let mut view: Vec<(String, String, String)> = state
                .all_databases()
                .flat_map(|db| {
                    db.listeners().iter().map(move |l| {
                        (
                            db.persisted_name().to_string(),
                            l.prefix.clone(),
                            l.client.address().to_string(),
                        )
                    })
                })
                .collect();
            view.sort();
            views.push(view);
        }

        assert_eq!(views[0], views[1]);
        assert_eq!(views[0].len(), 3);
    }

    #[tokio::test]
    async fn compaction_after_replay_holds_only_current_state() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("saved_state");
        fs::write(
            &log_path,
            "CLIENTADD \"/c.sock\"\nADD 7 \"def\" \"/foo\" \"/c.sock\"\n",
        )
        .unwrap();

        let transport = FakeTransport::with_clients(&["/c.sock"]);
        let core = core_with(transport.clone(), &log_path);
        core.restore_from_saved_state().await.unwrap();
        assert!(core.compact_if_needed().await.unwrap());
        assert!(!core.compact_if_needed().await.unwrap());

        let new_id = transport.updates()[0].1.new_connection_id;
        assert_eq!(
            log_lines(&log_path),
            vec![
                r#"CLIENTADD "/c.sock""#.to_string(),
                format!(r#"ADD {} "def" "/foo" "/c.sock""#, new_id),
            ]
        );
    }

    #[tokio::test]
    async fn sweep_removes_dead_clients_and_their_listeners() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("saved_state");
        let transport = FakeTransport::with_clients(&["/live.sock", "/dead.sock"]);
        let core = core_with(transport.clone(), &log_path);

        core.add_client("/live.sock").await.unwrap();
        core.add_client("/dead.sock").await.unwrap();
        core.subscribe(None, "/a", "/dead.sock").await.unwrap();
        core.subscribe(Some("xml:/srv"), "/b", "/dead.sock")
            .await
            .unwrap();
        core.subscribe(None, "/a", "/live.sock").await.unwrap();
        core.set(None, "/a/x", "1").await.unwrap();

        transport.kill("/dead.sock");
        assert_eq!(core.sweep_clients().await, 1);
        assert_eq!(core.client_count().await, 1);
        assert_eq!(core.listener_count().await, 1);
        assert!(!core
            .state
            .lock()
            .await
            .couriers
            .contains_key(&ClientHandle::new("/dead.sock")));

        let lines = log_lines(&log_path);
        assert!(lines.contains(&r#"CLIENTREMOVE "/dead.sock""#.to_string()));
        assert_eq!(
            lines.iter().filter(|l| l.starts_with("REMOVE ")).count(),
            2
        );
        assert_eq!(core.sweep_clients().await, 0);
    }

    #[tokio::test]
    async fn calls_are_refused_once_shutdown_begins() {
        let dir = tempfile::tempdir().unwrap();
        let core = core_with(
            FakeTransport::with_clients(&["/c.sock"]),
            &dir.path().join("saved_state"),
        );
        assert_eq!(core.ping().unwrap(), std::process::id());

        core.begin_shutdown();
        assert!(core.ping().unwrap_err().is_in_shutdown());
        assert!(core
            .subscribe(None, "/a", "/c.sock")
            .await
            .unwrap_err()
            .is_in_shutdown());
        assert!(core.add_client("/c.sock").await.unwrap_err().is_in_shutdown());
        assert!(core
            .obtain_database(None)
            .await
            .unwrap_err()
            .is_in_shutdown());
    }

    #[tokio::test]
    async fn unreadable_log_fails_replay_only() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("saved_state");
        fs::create_dir_all(&log_path).unwrap();

        let core = core_with(FakeTransport::default(), &log_path);
        assert!(core.restore_from_saved_state().await.is_err());
        assert!(core.is_idle().await);
        assert_eq!(core.obtain_database(None).await.unwrap(), None);
    }
}
