//! Finding the daemon for a configuration root, starting one if needed.
//!
//! The lock directory's address file names the current daemon. A client
//! reads it without locking, pings the address, and when nothing answers
//! spawns `confd run` with the write end of a pipe. The new daemon writes a
//! single byte once its address is published; the client then reads the
//! address file again.

use crate::clienv;
use crate::daemon::DaemonClient;
use crate::error::{ConfdError, Result};
use crate::lock::{self, CurrentHolder};
use crate::user_config::UserConfig;
use std::ffi::OsString;
use std::fs::File;
use std::io::Read;
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Result of looking at whatever the address file currently names.
enum Sighting {
    Live(String),
    /// Reachable but refusing calls; worth another round later.
    ShuttingDown(String),
    Missing(String),
}

pub struct Activator {
    lock_dir: PathBuf,
    daemon_exe: Option<PathBuf>,
    daemon_args: Vec<OsString>,
    retries: u32,
    timeout: Duration,
}

impl Activator {
    pub fn new(lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            daemon_exe: clienv::daemon_exe(),
            daemon_args: Vec::new(),
            retries: 1,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn from_settings(lock_dir: impl Into<PathBuf>, settings: &UserConfig) -> Self {
        Self::new(lock_dir)
            .with_retries(settings.activation_retries)
            .with_timeout(settings.call_timeout())
    }

    pub fn with_daemon_exe(mut self, exe: impl Into<PathBuf>) -> Self {
        self.daemon_exe = Some(exe.into());
        self
    }

    /// Extra arguments appended to `run` when spawning.
    pub fn with_daemon_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.daemon_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    /// Address of a live daemon, spawning one when `spawn_if_absent`.
    ///
    /// Fails with [`ConfdError::NoServer`] listing why each attempt failed.
    pub async fn resolve(&self, spawn_if_absent: bool) -> Result<String> {
        let mut failures: Vec<String> = Vec::new();

        for attempt in 0..=self.retries {
            if attempt > 0 {
                debug!("Activation attempt {} of {}", attempt + 1, self.retries + 1);
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }

            match self.look().await {
                Sighting::Live(address) => return Ok(address),
                Sighting::ShuttingDown(reason) => {
                    failures.push(reason);
                    continue;
                }
                Sighting::Missing(reason) => failures.push(reason),
            }

            if !spawn_if_absent {
                break;
            }

            match self.spawn_and_wait().await {
                Ok(true) => trace!("Daemon signalled readiness"),
                // Losing the election to another daemon looks like this too,
                // so look at the address file regardless.
                Ok(false) => failures.push("spawned daemon exited before it was ready".to_string()),
                Err(e) => {
                    failures.push(format!("failed to launch daemon: {}", e));
                    continue;
                }
            }

            match self.look().await {
                Sighting::Live(address) => {
                    info!("Activated daemon at {}", address);
                    return Ok(address);
                }
                Sighting::ShuttingDown(reason) | Sighting::Missing(reason) => failures.push(reason),
            }
        }

        Err(ConfdError::NoServer(failures.join("; ")))
    }

    async fn look(&self) -> Sighting {
        let holder = match lock::read_current_holder(&self.lock_dir) {
            Ok(holder) => holder,
            Err(e) => return Sighting::Missing(e.to_string()),
        };

        match holder {
            CurrentHolder::Daemon { pid, address } => {
                let client = DaemonClient::new(&address).with_timeout(self.timeout);
                match client.ping().await {
                    Ok(info) => {
                        trace!(pid = info.pid, "Daemon at {} is alive", address);
                        Sighting::Live(address)
                    }
                    Err(e) if e.is_in_shutdown() => Sighting::ShuttingDown(format!(
                        "daemon {} at {} is shutting down",
                        pid, address
                    )),
                    Err(e) => Sighting::Missing(format!(
                        "daemon {} at {} did not answer: {}",
                        pid, address, e
                    )),
                }
            }
            other @ CurrentHolder::Placeholder { .. } => {
                Sighting::Missing(format!("address file is held by a {}", other))
            }
            CurrentHolder::Absent => Sighting::Missing(format!(
                "no daemon address in {}",
                self.lock_dir.display()
            )),
        }
    }

    /// Spawn a daemon and block until it is ready or gone. Returns whether
    /// the readiness byte arrived.
    async fn spawn_and_wait(&self) -> Result<bool> {
        let exe = self
            .daemon_exe
            .clone()
            .ok_or_else(|| ConfdError::Failed("no daemon executable".to_string()))?;

        let (reader, writer) = ready_pipe()?;
        let ready_fd = writer.as_raw_fd();

        let mut cmd = Command::new(&exe);
        cmd.arg("run")
            .arg("--ready-fd")
            .arg(ready_fd.to_string())
            .arg("--lock-dir")
            .arg(&self.lock_dir)
            .args(&self.daemon_args);
        prepare_daemon_command(&mut cmd, ready_fd);

        debug!("Spawning daemon {}", exe.display());
        let mut child = cmd.spawn()?;
        // Only the child may hold the write end, or EOF never comes.
        drop(writer);

        // The child is waited on here, off the runtime, when it exits
        // without signalling.
        tokio::task::spawn_blocking(move || {
            let mut reader = File::from(reader);
            let mut byte = [0u8; 1];
            let received = reader.read(&mut byte);
            if !matches!(received, Ok(0)) {
                reap_in_background(child);
                return received.map(|n| n == 1);
            }
            match child.wait() {
                Ok(status) => debug!("Spawned daemon exited with {}", status),
                Err(e) => warn!("Failed to reap spawned daemon: {}", e),
            }
            Ok(false)
        })
        .await
        .map_err(|e| ConfdError::Failed(format!("readiness wait failed: {}", e)))?
        .map_err(Into::into)
    }
}

/// Address of a live daemon for `lock_dir` with default settings.
pub async fn resolve(lock_dir: &Path, spawn_if_absent: bool) -> Result<String> {
    Activator::new(lock_dir).resolve(spawn_if_absent).await
}

/// Pipe whose ends are both close-on-exec from the start; the child clears
/// the flag on its copy of the write end.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn ready_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [-1; 2];
    // SAFETY: `fds` has room for the two descriptors pipe2(2) writes.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    // SAFETY: both descriptors were just created and are owned by nobody else.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Without pipe2 a child forked by another thread between the two calls
/// can inherit the write end.
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn ready_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [-1; 2];
    // SAFETY: `fds` has room for the two descriptors pipe(2) writes.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    // SAFETY: both descriptors were just created and are owned by nobody else.
    let (reader, writer) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    for fd in [fds[0], fds[1]] {
        // SAFETY: fcntl on a live descriptor with valid commands.
        if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
    }
    Ok((reader, writer))
}

/// Detach the child from our terminal and leave it nothing but null stdio
/// and the readiness pipe. Everything else we open is close-on-exec.
fn prepare_daemon_command(cmd: &mut Command, ready_fd: RawFd) {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    // SAFETY: `pre_exec` runs in the child between fork and exec; the
    // closure only makes async-signal-safe libc calls and does not allocate.
    unsafe {
        cmd.pre_exec(move || {
            if libc::fcntl(ready_fd, libc::F_SETFD, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            libc::setsid();
            Ok(())
        });
    }
}

/// The daemon outlives this call; someone still has to wait on it.
fn reap_in_background(mut child: Child) {
    std::thread::spawn(move || match child.wait() {
        Ok(status) => debug!("Daemon {} exited with {}", child.id(), status),
        Err(e) => warn!("Failed to wait for daemon {}: {}", child.id(), e),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::protocol::{read_frame, write_frame, ErrorKind, MessageFrame, Response};
    use crate::daemon::server::{DaemonConfig, DaemonServer};
    use std::fs;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn empty_lock_dir_without_spawn_is_no_server() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve(&dir.path().join(".lock"), false).await.unwrap_err();
        match err {
            ConfdError::NoServer(message) => assert!(message.contains("no daemon address")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn placeholder_holder_is_not_a_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let lock_dir = dir.path().join(".lock");
        let _held = lock::acquire(&lock_dir, None).unwrap();

        let err = resolve(&lock_dir, false).await.unwrap_err();
        match err {
            ConfdError::NoServer(message) => assert!(message.contains("non-daemon"), "{message}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_address_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let lock_dir = dir.path().join(".lock");
        fs::create_dir_all(&lock_dir).unwrap();
        let gone = dir.path().join("gone.sock");
        fs::write(
            lock_dir.join(lock::ADDRESS_FILE),
            format!("4242:{}", gone.display()),
        )
        .unwrap();

        let err = resolve(&lock_dir, false).await.unwrap_err();
        match err {
            ConfdError::NoServer(message) => assert!(message.contains("did not answer")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn finds_running_daemon() {
        let root = tempfile::tempdir().unwrap();
        let lock_dir = root.path().join(".lock");
        let socket_path = root.path().join("daemon.sock");
        let config = DaemonConfig {
            lock_dir: lock_dir.clone(),
            state_dir: root.path().join("state"),
            socket_path: socket_path.clone(),
            ready_fd: None,
            settings: UserConfig::default(),
        };
        let daemon = tokio::spawn(DaemonServer::new(config).run());

        let mut address = None;
        for _ in 0..200 {
            if let Ok(found) = resolve(&lock_dir, false).await {
                address = Some(found);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(address.as_deref(), socket_path.to_str());

        DaemonClient::new(&socket_path).shutdown().await.unwrap();
        daemon.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutting_down_daemon_is_retried_a_bounded_number_of_times() {
        let dir = tempfile::tempdir().unwrap();
        let lock_dir = dir.path().join(".lock");
        fs::create_dir_all(&lock_dir).unwrap();
        let path = dir.path().join("closing.sock");
        fs::write(
            lock_dir.join(lock::ADDRESS_FILE),
            format!("4242:{}", path.display()),
        )
        .unwrap();

        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                let _ = read_frame(&mut stream).await.unwrap();
                let frame = MessageFrame::encode_response(&Response::Error {
                    kind: ErrorKind::InShutdown,
                    message: "configuration server is shutting down".to_string(),
                })
                .unwrap();
                write_frame(&mut stream, &frame).await.unwrap();
            }
        });

        let err = Activator::new(&lock_dir)
            .with_retries(2)
            .resolve(true)
            .await
            .unwrap_err();
        match err {
            ConfdError::NoServer(message) => {
                assert_eq!(message.matches("is shutting down").count(), 3, "{message}")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn ready_pipe_is_close_on_exec() {
        let (reader, writer) = ready_pipe().unwrap();
        for fd in [reader.as_raw_fd(), writer.as_raw_fd()] {
            // SAFETY: the descriptor is owned by this test.
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            assert_ne!(flags & libc::FD_CLOEXEC, 0, "fd {fd} is inheritable");
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn daemon_exiting_without_signal_is_reaped() {
        let exe = Path::new("/bin/true");
        if !exe.exists() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let activator = Activator::new(dir.path().join(".lock")).with_daemon_exe(exe);

        let ready = tokio::time::timeout(Duration::from_secs(5), activator.spawn_and_wait())
            .await
            .expect("spawn_and_wait hung")
            .unwrap();
        assert!(!ready);
    }

    #[tokio::test]
    async fn missing_executable_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = Activator::new(dir.path().join(".lock"))
            .with_daemon_exe(dir.path().join("no-such-confd"))
            .with_retries(0)
            .resolve(true)
            .await
            .unwrap_err();
        match err {
            ConfdError::NoServer(message) => {
                assert!(message.contains("failed to launch daemon"), "{message}")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
