//! Per-database listener registry and key helpers.

use super::transport::ClientHandle;
use crate::error::{ConfdError, Result};
use std::collections::{BTreeMap, BTreeSet};

/// One subscription: changes at or below `prefix` go to `client`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub connection_id: u32,
    pub prefix: String,
    pub client: ClientHandle,
}

/// Subscriptions against one database, keyed by connection id.
///
/// Ids start at 1, grow monotonically, and never reuse 0 or an id still in
/// use after the counter wraps.
#[derive(Debug)]
pub struct ListenerRegistry {
    listeners: BTreeMap<u32, Listener>,
    next_id: u32,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            listeners: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn subscribe(&mut self, prefix: &str, client: ClientHandle) -> u32 {
        let connection_id = self.allocate_id();
        self.listeners.insert(
            connection_id,
            Listener {
                connection_id,
                prefix: prefix.to_string(),
                client,
            },
        );
        connection_id
    }

    pub fn unsubscribe(&mut self, connection_id: u32) -> Option<Listener> {
        self.listeners.remove(&connection_id)
    }

    pub fn get(&self, connection_id: u32) -> Option<&Listener> {
        self.listeners.get(&connection_id)
    }

    /// Listeners whose prefix is `key` or a structural ancestor of it.
    pub fn matching<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a Listener> + 'a {
        self.listeners
            .values()
            .filter(move |l| key_is_below(&l.prefix, key))
    }

    /// Drop every subscription owned by `client`.
    pub fn remove_client(&mut self, client: &ClientHandle) -> Vec<Listener> {
        let ids: Vec<u32> = self
            .listeners
            .values()
            .filter(|l| &l.client == client)
            .map(|l| l.connection_id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.listeners.remove(&id))
            .collect()
    }

    pub fn clients(&self) -> BTreeSet<ClientHandle> {
        self.listeners.values().map(|l| l.client.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Listener> {
        self.listeners.values()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    fn allocate_id(&mut self) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if id != 0 && !self.listeners.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Whether `key` is `prefix` itself or lies below it. `/` covers everything.
pub fn key_is_below(prefix: &str, key: &str) -> bool {
    if prefix == "/" {
        return key.starts_with('/');
    }
    match key.strip_prefix(prefix) {
        Some("") => true,
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

/// Absolute, slash-separated, no empty components, no trailing slash except
/// for the root itself.
pub fn validate_key(key: &str) -> Result<()> {
    let bad = |reason: &str| ConfdError::BadKey {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    if !key.starts_with('/') {
        return Err(bad("must begin with a slash"));
    }
    if key == "/" {
        return Ok(());
    }
    if key.ends_with('/') {
        return Err(bad("can't end with a slash"));
    }
    if key.contains("//") {
        return Err(bad("can't contain two adjacent slashes"));
    }
    if key.chars().any(char::is_control) {
        return Err(bad("can't contain control characters"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(name: &str) -> ClientHandle {
        ClientHandle::new(name)
    }

    #[test]
    fn prefix_matching_is_structural() {
        assert!(key_is_below("/a/b", "/a/b"));
        assert!(key_is_below("/a/b", "/a/b/c"));
        assert!(!key_is_below("/a/b", "/a/bc"));
        assert!(!key_is_below("/a/b", "/a"));
        assert!(key_is_below("/", "/anything/at/all"));
    }

    #[test]
    fn ids_start_at_one_and_are_not_reused() {
        let mut registry = ListenerRegistry::new();
        let first = registry.subscribe("/a", client("c1"));
        let second = registry.subscribe("/a", client("c1"));
        assert_eq!(first, 1);
        assert_eq!(second, 2);

        registry.unsubscribe(first);
        let third = registry.subscribe("/b", client("c2"));
        assert_eq!(third, 3);
    }

    #[test]
    fn allocation_skips_zero_and_live_ids_after_wrap() {
        let mut registry = ListenerRegistry::new();
        let kept = registry.subscribe("/a", client("c1"));
        assert_eq!(kept, 1);

        registry.next_id = u32::MAX;
        assert_eq!(registry.subscribe("/b", client("c1")), u32::MAX);
        // 0 is never handed out and 1 is still taken.
        assert_eq!(registry.subscribe("/c", client("c1")), 2);
    }

    #[test]
    fn matching_selects_ancestors_only() {
        let mut registry = ListenerRegistry::new();
        let ab = registry.subscribe("/a/b", client("c1"));
        let root = registry.subscribe("/", client("c2"));
        registry.subscribe("/a/bc", client("c3"));

        let ids: Vec<u32> = registry
            .matching("/a/b/c")
            .map(|l| l.connection_id)
            .collect();
        assert_eq!(ids, vec![ab, root]);
    }

    #[test]
    fn same_client_may_subscribe_twice() {
        let mut registry = ListenerRegistry::new();
        let one = registry.subscribe("/a", client("c1"));
        let two = registry.subscribe("/a", client("c1"));
        assert_ne!(one, two);
        assert_eq!(registry.matching("/a/x").count(), 2);
    }

    #[test]
    fn remove_client_drops_its_subscriptions() {
        let mut registry = ListenerRegistry::new();
        registry.subscribe("/a", client("dead"));
        registry.subscribe("/b", client("dead"));
        let live = registry.subscribe("/a", client("live"));

        let removed = registry.remove_client(&client("dead"));
        assert_eq!(removed.len(), 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(live).is_some());
    }

    #[test]
    fn key_validation() {
        assert!(validate_key("/").is_ok());
        assert!(validate_key("/apps/editor/font").is_ok());
        assert!(validate_key("apps").is_err());
        assert!(validate_key("/apps/").is_err());
        assert!(validate_key("/apps//font").is_err());
        assert!(validate_key("/apps/\nfont").is_err());
    }
}
