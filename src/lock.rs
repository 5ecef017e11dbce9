//! Singleton election over a lock directory.
//!
//! The directory holds one address file (`ior`). Whoever holds a whole-file
//! advisory write lock on that file owns the configuration root and has its
//! `<pid>:<address>` record published in it. The file is created atomically
//! by locking a uniquely named temporary file and hard-linking it into place;
//! the lock follows the inode, so it is already held the moment the name
//! becomes visible.
//!
//! Locks are taken with `fcntl`. On Linux open-file-description locks are
//! used, which behave like POSIX record locks on NFS and at process death
//! but do not merge across descriptors of the same process.

use crate::error::{ConfdError, Result};
use std::fmt;
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, trace, warn};

/// Name of the address file inside a lock directory.
pub const ADDRESS_FILE: &str = "ior";

/// Address written by a lock holder that is not a daemon.
const PLACEHOLDER_ADDRESS: &str = "none";

#[cfg(target_os = "linux")]
const SET_LOCK: libc::c_int = libc::F_OFD_SETLK;
#[cfg(target_os = "linux")]
const GET_LOCK: libc::c_int = libc::F_OFD_GETLK;
#[cfg(not(target_os = "linux"))]
const SET_LOCK: libc::c_int = libc::F_SETLK;
#[cfg(not(target_os = "linux"))]
const GET_LOCK: libc::c_int = libc::F_GETLK;

static UNIQUE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// What the address file currently says about its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CurrentHolder {
    /// A daemon published a reachable address.
    Daemon { pid: u32, address: String },
    /// A non-daemon process holds (or held) the file.
    Placeholder { pid: Option<u32> },
    /// No address file exists.
    Absent,
}

impl CurrentHolder {
    pub fn address(&self) -> Option<&str> {
        match self {
            Self::Daemon { address, .. } => Some(address),
            _ => None,
        }
    }
}

impl fmt::Display for CurrentHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Daemon { pid, address } => write!(f, "daemon pid {} at {}", pid, address),
            Self::Placeholder { pid: Some(pid) } => write!(f, "non-daemon process {}", pid),
            Self::Placeholder { pid: None } => write!(f, "non-daemon process"),
            Self::Absent => write!(f, "no current holder"),
        }
    }
}

/// Exclusive ownership of a lock directory.
///
/// Dropping the lock without [`AddressLock::release`] closes the descriptor,
/// which drops the advisory lock but leaves the address file behind; the
/// next [`acquire`] treats it as stale.
#[derive(Debug)]
pub struct AddressLock {
    lock_dir: PathBuf,
    address_file: PathBuf,
    file: File,
}

impl AddressLock {
    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    pub fn address_file(&self) -> &Path {
        &self.address_file
    }

    /// Give up ownership and remove the address file and lock directory.
    ///
    /// Fails with [`ConfdError::LockNotHeld`] without touching anything if
    /// another process holds the lock on our file.
    pub fn release(self) -> Result<()> {
        let AddressLock {
            lock_dir,
            address_file,
            file,
        } = self;

        if locked_by_someone_else(&file) {
            return Err(ConfdError::LockNotHeld { path: address_file });
        }

        // Keep a second name on the inode so the final unlink happens after
        // the descriptor is closed; NFS would otherwise leave .nfsXXXX files
        // that keep the directory from being removed.
        let throwaway = TempName::new(&lock_dir);
        fs::hard_link(&address_file, throwaway.path()).map_err(|e| {
            ConfdError::Failed(format!(
                "failed to link '{}' to '{}': {}",
                throwaway.path().display(),
                address_file.display(),
                e
            ))
        })?;

        // Unlink while still holding the lock.
        fs::remove_file(&address_file).map_err(|e| {
            ConfdError::Failed(format!(
                "failed to remove lock file '{}': {}",
                address_file.display(),
                e
            ))
        })?;

        drop(file);

        throwaway.remove().map_err(|e| {
            ConfdError::Failed(format!("failed to clean up lock link: {}", e))
        })?;

        if let Err(e) = fs::remove_dir(&lock_dir) {
            warn!(
                "Failed to remove lock directory '{}': {}",
                lock_dir.display(),
                e
            );
        }

        debug!("Released lock in {}", lock_dir.display());
        Ok(())
    }
}

/// Take ownership of `lock_dir` and publish `address` (or `none`).
///
/// On contention the error is [`ConfdError::LockHeld`] carrying whatever the
/// address file says about the current owner.
pub fn acquire(lock_dir: &Path, address: Option<&str>) -> Result<AddressLock> {
    ensure_lock_dir(lock_dir)?;
    let address_file = lock_dir.join(ADDRESS_FILE);

    let record = format_record(std::process::id(), address);
    let file = open_locked_file(lock_dir, &address_file, &record)?;

    debug!(
        lock_dir = %lock_dir.display(),
        record = %record,
        "Acquired daemon lock"
    );

    Ok(AddressLock {
        lock_dir: lock_dir.to_path_buf(),
        address_file,
        file,
    })
}

/// Read the address file without locking it.
pub fn read_current_holder(lock_dir: &Path) -> Result<CurrentHolder> {
    let path = lock_dir.join(ADDRESS_FILE);
    match fs::read_to_string(&path) {
        Ok(contents) => Ok(parse_record(&contents)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(CurrentHolder::Absent),
        Err(e) => Err(ConfdError::lock_failed(
            path,
            "address file not opened successfully",
            e,
        )),
    }
}

fn format_record(pid: u32, address: Option<&str>) -> String {
    format!("{}:{}", pid, address.unwrap_or(PLACEHOLDER_ADDRESS))
}

fn parse_record(contents: &str) -> CurrentHolder {
    let line = contents.lines().next().unwrap_or("");
    let digits_end = line
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(line.len());
    let pid = line[..digits_end].parse::<u32>().ok();
    let rest = &line[digits_end..];
    let rest = rest.strip_prefix(':').unwrap_or(rest);

    if rest.is_empty() || rest.trim_end() == PLACEHOLDER_ADDRESS {
        return CurrentHolder::Placeholder { pid };
    }

    match pid {
        Some(pid) => CurrentHolder::Daemon {
            pid,
            address: rest.to_string(),
        },
        None => CurrentHolder::Placeholder { pid: None },
    }
}

fn ensure_lock_dir(lock_dir: &Path) -> Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(lock_dir)
        .map_err(|e| ConfdError::lock_failed(lock_dir, "couldn't create directory", e))
}

/// Create the address file already locked and holding `record`, clearing a
/// stale one at most once.
fn open_locked_file(lock_dir: &Path, address_file: &Path, record: &str) -> Result<File> {
    if let Some(file) = create_new_locked_file(lock_dir, address_file, record)? {
        return Ok(file);
    }

    match OpenOptions::new().read(true).write(true).open(address_file) {
        Ok(existing) => match try_lock_entire_file(&existing) {
            Ok(true) => {
                debug!(
                    "Removing stale address file {} (no process holds its lock)",
                    address_file.display()
                );
                match fs::remove_file(address_file) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(ConfdError::lock_failed(
                            address_file,
                            "failed to remove stale address file",
                            e,
                        ))
                    }
                }
                drop(existing);
            }
            Ok(false) => return Err(held(lock_dir, address_file)),
            Err(e) => {
                return Err(ConfdError::lock_failed(
                    address_file,
                    "failed to lock; another process may have the lock, or NFS file locking is misconfigured",
                    e,
                ))
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            trace!("Address file vanished before it could be inspected");
        }
        Err(e) => {
            return Err(ConfdError::lock_failed(
                address_file,
                "failed to create or open",
                e,
            ))
        }
    }

    create_new_locked_file(lock_dir, address_file, record)?
        .ok_or_else(|| held(lock_dir, address_file))
}

/// Returns `Ok(None)` when the address file already exists.
///
/// The record is written before the link so the address file is never
/// visible without it.
fn create_new_locked_file(
    lock_dir: &Path,
    address_file: &Path,
    record: &str,
) -> Result<Option<File>> {
    let unique = TempName::new(lock_dir);

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(unique.path())
        .map_err(|e| ConfdError::lock_failed(unique.path(), "could not create temporary file", e))?;

    match try_lock_entire_file(&file) {
        Ok(true) => {}
        Ok(false) => {
            return Err(ConfdError::LockFailed {
                path: unique.path().to_path_buf(),
                reason: "temporary file is locked by someone else".to_string(),
                source: None,
            })
        }
        Err(e) => {
            return Err(ConfdError::lock_failed(
                unique.path(),
                "could not lock temporary file",
                e,
            ))
        }
    }

    file.write_all(record.as_bytes())
        .map_err(|e| ConfdError::lock_failed(unique.path(), "can't write address record", e))?;

    match fs::hard_link(unique.path(), address_file) {
        Ok(()) => Ok(Some(file)),
        Err(e) => {
            // The server may have performed the link and lost the reply.
            let links = fs::metadata(unique.path()).map(|m| m.nlink()).unwrap_or(0);
            if links == 2 {
                debug!(error = %e, "link reported failure but the address file exists");
                Ok(Some(file))
            } else if e.kind() == io::ErrorKind::AlreadyExists {
                Ok(None)
            } else {
                Err(ConfdError::lock_failed(
                    address_file,
                    "could not create address file",
                    e,
                ))
            }
        }
    }
}

fn held(lock_dir: &Path, address_file: &Path) -> ConfdError {
    let holder = match read_current_holder(lock_dir) {
        Ok(holder) => holder,
        Err(e) => {
            debug!("Could not read current lock holder: {}", e);
            CurrentHolder::Absent
        }
    };
    ConfdError::LockHeld {
        path: address_file.to_path_buf(),
        holder,
    }
}

fn whole_file_lock(kind: libc::c_int) -> libc::flock {
    // SAFETY: `flock` is a plain C struct; all-zero is a valid value and
    // leaves `l_pid` at 0 as open-file-description locks require.
    let mut lock: libc::flock = unsafe { std::mem::zeroed() };
    lock.l_type = kind as libc::c_short;
    lock.l_whence = libc::SEEK_SET as libc::c_short;
    lock.l_start = 0;
    lock.l_len = 0;
    lock
}

/// Non-blocking whole-file write lock. `Ok(false)` means contended.
fn try_lock_entire_file(file: &File) -> io::Result<bool> {
    let mut lock = whole_file_lock(libc::F_WRLCK);
    // SAFETY: the descriptor is owned by `file` and `lock` outlives the call.
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), SET_LOCK, &mut lock) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == libc::EAGAIN || code == libc::EACCES => Ok(false),
        _ => Err(err),
    }
}

fn locked_by_someone_else(file: &File) -> bool {
    let mut lock = whole_file_lock(libc::F_WRLCK);
    // SAFETY: as in `try_lock_entire_file`.
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), GET_LOCK, &mut lock) };
    if rc < 0 {
        return true;
    }
    lock.l_type != libc::F_UNLCK as libc::c_short
}

/// A process-unique file name in a directory, unlinked on drop.
struct TempName {
    path: PathBuf,
    armed: bool,
}

impl TempName {
    fn new(dir: &Path) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let seq = UNIQUE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{:x}-{}", std::process::id(), nanos, seq);
        Self {
            path: dir.join(name),
            armed: true,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn remove(mut self) -> io::Result<()> {
        self.armed = false;
        fs::remove_file(&self.path)
    }
}

impl Drop for TempName {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_file(&self.path);
        }
    }
}
