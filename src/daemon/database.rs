use super::registry::{validate_key, ListenerRegistry};
use crate::error::Result;
use std::collections::BTreeMap;

/// Name recorded in the saved-state log for the default database.
pub const DEFAULT_DATABASE_NAME: &str = "def";

/// One open configuration store and the listeners attached to it.
///
/// `address` is `None` for the default database.
#[derive(Debug)]
pub struct Database {
    address: Option<String>,
    listeners: ListenerRegistry,
    values: BTreeMap<String, String>,
}

impl Database {
    pub fn new_default() -> Self {
        Self::with_address(None)
    }

    pub fn new(address: &str) -> Self {
        Self::with_address(Some(address.to_string()))
    }

    fn with_address(address: Option<String>) -> Self {
        Self {
            address,
            listeners: ListenerRegistry::new(),
            values: BTreeMap::new(),
        }
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn persisted_name(&self) -> &str {
        persisted_name(self.address())
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    pub fn listeners_mut(&mut self) -> &mut ListenerRegistry {
        &mut self.listeners
    }

    /// Store a value. Returns `false` when the key already held it.
    pub fn set(&mut self, key: &str, value: &str) -> Result<bool> {
        validate_key(key)?;
        let previous = self.values.insert(key.to_string(), value.to_string());
        Ok(previous.as_deref() != Some(value))
    }

    /// Remove a value, returning what was there.
    pub fn unset(&mut self, key: &str) -> Result<Option<String>> {
        validate_key(key)?;
        Ok(self.values.remove(key))
    }

    pub fn lookup(&self, key: &str) -> Result<Option<&str>> {
        validate_key(key)?;
        Ok(self.values.get(key).map(String::as_str))
    }
}

/// Log name for a database address.
pub fn persisted_name(address: Option<&str>) -> &str {
    address.unwrap_or(DEFAULT_DATABASE_NAME)
}

/// Database address for a log name.
pub fn address_from_persisted(name: &str) -> Option<&str> {
    if name == DEFAULT_DATABASE_NAME {
        None
    } else {
        Some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_database_persists_as_def() {
        let db = Database::new_default();
        assert_eq!(db.address(), None);
        assert_eq!(db.persisted_name(), "def");
        assert_eq!(address_from_persisted("def"), None);
        assert_eq!(
            address_from_persisted("xml:readwrite:/etc/confd"),
            Some("xml:readwrite:/etc/confd")
        );
    }

    #[test]
    fn set_reports_whether_value_changed() {
        let mut db = Database::new("xml:readwrite:/tmp/db");
        assert!(db.set("/apps/font", "mono").unwrap());
        assert!(!db.set("/apps/font", "mono").unwrap());
        assert!(db.set("/apps/font", "serif").unwrap());
        assert_eq!(db.lookup("/apps/font").unwrap(), Some("serif"));
    }

    #[test]
    fn unset_returns_previous_value() {
        let mut db = Database::new_default();
        db.set("/a", "1").unwrap();
        assert_eq!(db.unset("/a").unwrap(), Some("1".to_string()));
        assert_eq!(db.unset("/a").unwrap(), None);
    }

    #[test]
    fn bad_keys_are_rejected() {
        let mut db = Database::new_default();
        assert!(db.set("relative/key", "x").is_err());
        assert!(db.lookup("/trailing/").is_err());
    }
}
