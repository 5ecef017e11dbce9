use std::path::PathBuf;

/// Environment variables consulted by confd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvVar {
    ConfdConfigDir,
    ConfdStateDir,
    ConfdRuntimeDir,
    ConfdDaemonExe,
}

impl EnvVar {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvVar::ConfdConfigDir => "CONFD_CONFIG_DIR",
            EnvVar::ConfdStateDir => "CONFD_STATE_DIR",
            EnvVar::ConfdRuntimeDir => "CONFD_RUNTIME_DIR",
            EnvVar::ConfdDaemonExe => "CONFD_DAEMON_EXE",
        }
    }
}

const FALLBACK_CONFIG_DIR: &str = "~/.config";
const FALLBACK_HOME: &str = "~";
const CONFD_SUBDIR: &str = "confd";
const LOCK_SUBDIR: &str = ".lock";
const STATE_SUBDIR: &str = ".daemon-dbus";
const SAVED_STATE_FILE: &str = "saved_state";

/// Non-empty value of an environment variable.
fn env_opt(var: EnvVar) -> Option<String> {
    std::env::var(var.as_str()).ok().filter(|v| !v.is_empty())
}

/// Configuration root ($CONFD_CONFIG_DIR or ~/.config/confd)
pub fn config_dir() -> PathBuf {
    let dir = env_opt(EnvVar::ConfdConfigDir)
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from(FALLBACK_CONFIG_DIR))
                .join(CONFD_SUBDIR)
        });
    tracing::trace!(dir = %dir.display(), "Resolved config directory");
    dir
}

/// Election directory for the configuration root (<config>/.lock)
pub fn lock_dir() -> PathBuf {
    config_dir().join(LOCK_SUBDIR)
}

/// Saved-state directory ($CONFD_STATE_DIR or ~/.daemon-dbus)
pub fn state_dir() -> PathBuf {
    let dir = env_opt(EnvVar::ConfdStateDir)
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from(FALLBACK_HOME))
                .join(STATE_SUBDIR)
        });
    tracing::trace!(dir = %dir.display(), "Resolved state directory");
    dir
}

/// Recovery log inside a state directory.
pub fn saved_state_path(state_dir: &std::path::Path) -> PathBuf {
    state_dir.join(SAVED_STATE_FILE)
}

/// Directory for daemon and client sockets ($CONFD_RUNTIME_DIR, the XDG
/// runtime dir, or ~/.local/share/confd/run)
pub fn runtime_dir() -> PathBuf {
    let dir = env_opt(EnvVar::ConfdRuntimeDir)
        .map(PathBuf::from)
        .or_else(|| dirs::runtime_dir().map(|d| d.join(CONFD_SUBDIR)))
        .unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("~/.local/share"))
                .join(CONFD_SUBDIR)
                .join("run")
        });
    tracing::trace!(dir = %dir.display(), "Resolved runtime directory");
    dir
}

/// Socket the daemon with `pid` listens on.
pub fn daemon_socket_path(pid: u32) -> PathBuf {
    runtime_dir().join(format!("daemon-{}.sock", pid))
}

/// Socket for the `seq`-th listener endpoint of client process `pid`.
pub fn client_socket_path(pid: u32, seq: u64) -> PathBuf {
    runtime_dir().join(format!("client-{}-{}.sock", pid, seq))
}

/// Executable spawned by activation ($CONFD_DAEMON_EXE or the running binary)
pub fn daemon_exe() -> Option<PathBuf> {
    let exe = env_opt(EnvVar::ConfdDaemonExe)
        .map(PathBuf::from)
        .or_else(|| std::env::current_exe().ok());
    tracing::trace!(exe = ?exe, "Daemon executable");
    exe
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_dir_lives_under_config_root() {
        assert!(lock_dir().ends_with(".lock"));
        assert_eq!(lock_dir().parent(), Some(config_dir().as_path()));
    }

    #[test]
    fn saved_state_file_name() {
        let path = saved_state_path(std::path::Path::new("/home/u/.daemon-dbus"));
        assert_eq!(path, PathBuf::from("/home/u/.daemon-dbus/saved_state"));
    }

    #[test]
    fn socket_names_carry_pid() {
        assert!(daemon_socket_path(42)
            .to_string_lossy()
            .ends_with("daemon-42.sock"));
        assert!(client_socket_path(42, 3)
            .to_string_lossy()
            .ends_with("client-42-3.sock"));
    }
}
