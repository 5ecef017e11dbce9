use clap::{Parser, Subcommand};
use std::os::unix::io::RawFd;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "confd")]
#[command(version)]
#[command(about = "Per-user configuration daemon", long_about = None)]
pub(crate) struct Cli {
    /// Lock directory of the configuration root (default: <config dir>/.lock)
    #[arg(long, global = true)]
    pub lock_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the daemon in the foreground
    Run {
        /// Write end of the activation pipe; one byte is written once ready
        #[arg(long)]
        ready_fd: Option<RawFd>,

        /// Directory holding the saved-state log (default: ~/.daemon-dbus)
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },

    /// Find the daemon, starting it if nobody is serving
    Start,

    /// Ask the running daemon to shut down
    Stop,

    /// Show whether a daemon is serving and what it reports
    Status,
}
