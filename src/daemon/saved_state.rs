//! The saved-state log: an append-only journal of client and listener
//! changes, replayed by the next daemon after a crash or restart.
//!
//! Line formats:
//!
//! ```text
//! ADD <connection-id> "<database>" "<location>" "<client-address>"
//! REMOVE <connection-id> "<database>" "<location>" "<client-address>"
//! CLIENTADD "<client-address>"
//! CLIENTREMOVE "<client-address>"
//! ```

use super::quote::{quote, unquote, UnquoteError};
use crate::error::{ConfdError, Result};
use std::collections::HashMap;
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// A listener as recorded in the log. `database` is the persisted name
/// (`def` for the default database).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerRecord {
    pub connection_id: u32,
    pub database: String,
    pub location: String,
    pub client: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    AddClient(String),
    RemoveClient(String),
    AddListener(ListenerRecord),
    RemoveListener(ListenerRecord),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LineError {
    #[error("unknown entry type '{0}'")]
    UnknownVerb(String),
    #[error("failed to parse connection ID '{0}'")]
    BadConnectionId(String),
    #[error("connection ID 0 is not valid")]
    ZeroConnectionId,
    #[error("failed to unquote {field}: {source}")]
    Field {
        field: &'static str,
        #[source]
        source: UnquoteError,
    },
    #[error("entry didn't contain all the fields")]
    MissingField,
}

impl LogEntry {
    /// The entry as one log line, without the trailing newline.
    pub fn to_line(&self) -> String {
        match self {
            Self::AddClient(client) => format!("CLIENTADD {}", quote(client)),
            Self::RemoveClient(client) => format!("CLIENTREMOVE {}", quote(client)),
            Self::AddListener(record) => listener_line("ADD", record),
            Self::RemoveListener(record) => listener_line("REMOVE", record),
        }
    }

    pub fn parse(line: &str) -> std::result::Result<Self, LineError> {
        let line = line.trim_start();
        let (verb, rest) = line
            .split_once(|c: char| c.is_ascii_whitespace())
            .unwrap_or((line, ""));

        match verb {
            "CLIENTADD" => Ok(Self::AddClient(parse_client(rest)?)),
            "CLIENTREMOVE" => Ok(Self::RemoveClient(parse_client(rest)?)),
            "ADD" => Ok(Self::AddListener(parse_listener(rest)?)),
            "REMOVE" => Ok(Self::RemoveListener(parse_listener(rest)?)),
            other => Err(LineError::UnknownVerb(other.to_string())),
        }
    }
}

fn listener_line(verb: &str, record: &ListenerRecord) -> String {
    format!(
        "{} {} {} {} {}",
        verb,
        record.connection_id,
        quote(&record.database),
        quote(&record.location),
        quote(&record.client)
    )
}

fn next_field<'a>(
    input: &'a str,
    field: &'static str,
) -> std::result::Result<(String, &'a str), LineError> {
    let (value, rest) =
        unquote(input.trim_start()).map_err(|source| LineError::Field { field, source })?;
    if value.is_empty() {
        return Err(LineError::MissingField);
    }
    Ok((value, rest))
}

fn parse_client(rest: &str) -> std::result::Result<String, LineError> {
    next_field(rest, "client address").map(|(client, _)| client)
}

fn parse_listener(rest: &str) -> std::result::Result<ListenerRecord, LineError> {
    let rest = rest.trim_start();
    let digits_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    let connection_id: u32 = rest[..digits_end]
        .parse()
        .map_err(|_| LineError::BadConnectionId(rest[..digits_end].to_string()))?;
    if connection_id == 0 {
        return Err(LineError::ZeroConnectionId);
    }

    let (database, rest) = next_field(&rest[digits_end..], "database address")?;
    let (location, rest) = next_field(rest, "listener location")?;
    let (client, _) = next_field(rest, "client address")?;

    Ok(ListenerRecord {
        connection_id,
        database,
        location,
        client,
    })
}

/// What remains of a log once adds and removes cancel out, in first-add
/// order.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Surviving {
    pub clients: Vec<String>,
    pub listeners: Vec<ListenerRecord>,
}

/// Fold entries into the surviving set. Duplicate adds and removes of
/// something never added are ignored.
pub fn fold<I: IntoIterator<Item = LogEntry>>(entries: I) -> Surviving {
    let mut clients: HashMap<String, usize> = HashMap::new();
    let mut listeners: HashMap<ListenerRecord, usize> = HashMap::new();

    for (seq, entry) in entries.into_iter().enumerate() {
        match entry {
            LogEntry::AddClient(client) => {
                if clients.contains_key(&client) {
                    debug!("Saved state records the same client added twice; ignoring the second");
                } else {
                    clients.insert(client, seq);
                }
            }
            LogEntry::RemoveClient(client) => {
                if clients.remove(&client).is_none() {
                    debug!("Saved state removes a client that wasn't added; ignoring the removal");
                }
            }
            LogEntry::AddListener(record) => {
                if listeners.contains_key(&record) {
                    debug!("Saved state records the same listener added twice; ignoring the second");
                } else {
                    listeners.insert(record, seq);
                }
            }
            LogEntry::RemoveListener(record) => {
                if listeners.remove(&record).is_none() {
                    debug!(
                        "Saved state removes a listener that wasn't added; ignoring the removal"
                    );
                }
            }
        }
    }

    let mut clients: Vec<(String, usize)> = clients.into_iter().collect();
    clients.sort_by_key(|(_, seq)| *seq);
    let mut listeners: Vec<(ListenerRecord, usize)> = listeners.into_iter().collect();
    listeners.sort_by_key(|(_, seq)| *seq);

    Surviving {
        clients: clients.into_iter().map(|(c, _)| c).collect(),
        listeners: listeners.into_iter().map(|(l, _)| l).collect(),
    }
}

/// The log file plus a lazily opened append handle.
#[derive(Debug)]
pub struct SavedStateLog {
    path: PathBuf,
    append: Option<File>,
    last_used: Instant,
    idle_timeout: Duration,
}

impl SavedStateLog {
    pub fn new(path: impl Into<PathBuf>, idle_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            append: None,
            last_used: Instant::now(),
            idle_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.append.is_some()
    }

    /// Append one entry and flush it.
    pub fn append(&mut self, entry: &LogEntry) -> Result<()> {
        if self.append.is_none() {
            self.append = Some(self.open_append()?);
        }

        let mut line = entry.to_line();
        line.push('\n');
        if let Some(file) = self.append.as_mut() {
            file.write_all(line.as_bytes())
                .and_then(|()| file.flush())
                .map_err(|e| failed("write to", &self.path, e))?;
        }

        self.last_used = Instant::now();
        trace!(line = %line.trim_end(), "Appended to saved state");
        Ok(())
    }

    /// Close the append handle if it has been unused for the idle timeout.
    pub fn close_if_idle(&mut self, now: Instant) -> bool {
        if self.append.is_some() && now.duration_since(self.last_used) >= self.idle_timeout {
            self.close();
            return true;
        }
        false
    }

    pub fn close(&mut self) {
        if let Some(file) = self.append.take() {
            if let Err(e) = file.sync_data() {
                warn!(
                    "Failed to close saved state file; data may not have been saved ({})",
                    e
                );
            }
            trace!("Closed saved state append handle");
        }
    }

    /// Read and fold the whole log. A missing file is an empty log.
    pub fn read(&mut self) -> Result<Surviving> {
        self.close();

        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No saved state file at {}", self.path.display());
                return Ok(Surviving::default());
            }
            Err(e) => return Err(failed("open", &self.path, e)),
        };

        let text = String::from_utf8_lossy(&bytes);
        let entries = text.lines().filter_map(|line| {
            if line.trim().is_empty() {
                return None;
            }
            match LogEntry::parse(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    debug!("Skipping line in saved state file '{}': {}", line, e);
                    None
                }
            }
        });

        Ok(fold(entries))
    }

    /// Replace the log with `entries`, keeping the old file if anything
    /// goes wrong.
    pub fn compact(&mut self, entries: &[LogEntry]) -> Result<()> {
        self.close();
        self.ensure_dir()?;

        let mut contents = String::new();
        for entry in entries {
            contents.push_str(&entry.to_line());
            contents.push('\n');
        }

        let staged = Staged::new(sibling(&self.path, "tmp"));
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(staged.path())
            .map_err(|e| failed("open", staged.path(), e))?;
        file.write_all(contents.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|e| failed("write", staged.path(), e))?;
        drop(file);

        let orig = sibling(&self.path, "orig");
        let moved_aside = if self.path.exists() {
            fs::rename(&self.path, &orig).map_err(|e| failed("move aside", &self.path, e))?;
            true
        } else {
            false
        };

        if let Err(e) = fs::rename(staged.path(), &self.path) {
            if moved_aside {
                if let Err(restore) = fs::rename(&orig, &self.path) {
                    warn!(
                        "Failed to restore original saved state file that had been moved to '{}': {}",
                        orig.display(),
                        restore
                    );
                }
            }
            return Err(failed("move into place", staged.path(), e));
        }
        staged.disarm();

        if moved_aside {
            if let Err(e) = fs::remove_file(&orig) {
                debug!("Failed to remove '{}': {}", orig.display(), e);
            }
        }

        debug!(
            entries = entries.len(),
            path = %self.path.display(),
            "Compacted saved state"
        );
        Ok(())
    }

    fn open_append(&self) -> Result<File> {
        self.ensure_dir()?;
        OpenOptions::new()
            .append(true)
            .create(true)
            .mode(0o600)
            .open(&self.path)
            .map_err(|e| {
                ConfdError::Failed(format!(
                    "failed to open saved state file '{}'; listeners can't be restored after shutdown ({})",
                    self.path.display(),
                    e
                ))
            })
    }

    fn ensure_dir(&self) -> Result<()> {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(dir)
                .map_err(|e| failed("create directory", dir, e)),
            _ => Ok(()),
        }
    }
}

impl Drop for SavedStateLog {
    fn drop(&mut self) {
        self.close();
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn failed(action: &str, path: &Path, e: io::Error) -> ConfdError {
    ConfdError::Failed(format!(
        "could not {} saved state file '{}': {}",
        action,
        path.display(),
        e
    ))
}

/// A file that is removed on drop unless disarmed.
struct Staged {
    path: PathBuf,
    armed: bool,
}

impl Staged {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Staged {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_file(&self.path);
        }
    }
}
