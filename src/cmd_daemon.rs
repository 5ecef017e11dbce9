use crate::args::Commands;
use anyhow::{Context, Result};
use confd::activation::Activator;
use confd::clienv;
use confd::daemon::{DaemonClient, DaemonConfig, DaemonServer};
use confd::user_config::UserConfig;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

pub async fn cmd_daemon(command: Commands, lock_dir: Option<PathBuf>) -> Result<()> {
    let settings = UserConfig::load()?;
    let lock_dir = lock_dir.unwrap_or_else(clienv::lock_dir);

    match command {
        Commands::Run {
            ready_fd,
            state_dir,
        } => cmd_daemon_run(lock_dir, state_dir, ready_fd, settings).await,
        Commands::Start => cmd_daemon_start(lock_dir, &settings).await,
        Commands::Stop => cmd_daemon_stop(lock_dir, &settings).await,
        Commands::Status => cmd_daemon_status(lock_dir, &settings).await,
    }
}

async fn cmd_daemon_run(
    lock_dir: PathBuf,
    state_dir: Option<PathBuf>,
    ready_fd: Option<RawFd>,
    settings: UserConfig,
) -> Result<()> {
    let config = DaemonConfig {
        lock_dir,
        state_dir: state_dir.unwrap_or_else(clienv::state_dir),
        ready_fd,
        settings,
        ..DaemonConfig::default()
    };

    // Spawned daemons have nowhere to print to.
    if ready_fd.is_none() {
        println!("Running confd in foreground (Ctrl+C to stop)");
        println!("  Lock:   {}", config.lock_dir.display());
        println!("  Socket: {}", config.socket_path.display());
        println!("  State:  {}", clienv::saved_state_path(&config.state_dir).display());
        println!();
    }

    DaemonServer::new(config).run().await
}

async fn cmd_daemon_start(lock_dir: PathBuf, settings: &UserConfig) -> Result<()> {
    let activator = Activator::from_settings(lock_dir, settings);
    let address = activator
        .resolve(true)
        .await
        .context("Failed to start daemon")?;

    let info = DaemonClient::new(&address)
        .with_timeout(settings.call_timeout())
        .ping()
        .await?;
    println!(
        "Daemon running (v{}, pid {}, uptime: {})",
        info.version,
        info.pid,
        format_duration(info.uptime_secs)
    );
    println!("  Address: {}", address);
    Ok(())
}

async fn cmd_daemon_stop(lock_dir: PathBuf, settings: &UserConfig) -> Result<()> {
    let activator = Activator::from_settings(lock_dir, settings);
    let address = match activator.resolve(false).await {
        Ok(address) => address,
        Err(e) => {
            tracing::debug!("No daemon to stop: {}", e);
            println!("Daemon is not running");
            return Ok(());
        }
    };

    let client = DaemonClient::new(&address).with_timeout(settings.call_timeout());
    println!("Stopping daemon gracefully...");
    client.shutdown().await?;

    // Wait for daemon to actually stop
    for _ in 0..50 {
        if !client.socket_exists() {
            println!("Daemon stopped");
            return Ok(());
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    println!("Daemon may still be stopping (check with `confd status`)");
    Ok(())
}

async fn cmd_daemon_status(lock_dir: PathBuf, settings: &UserConfig) -> Result<()> {
    let activator = Activator::from_settings(&lock_dir, settings);
    match activator.resolve(false).await {
        Ok(address) => {
            let info = DaemonClient::new(&address)
                .with_timeout(settings.call_timeout())
                .ping()
                .await?;
            println!("Daemon Status");
            println!("  Status:  running");
            println!("  Version: {}", info.version);
            println!("  PID:     {}", info.pid);
            println!("  Uptime:  {}", format_duration(info.uptime_secs));
            println!("  Address: {}", address);
        }
        Err(e) => {
            println!("Daemon Status");
            println!("  Status: not running");
            println!("  Lock:   {}", lock_dir.display());
            println!("  Reason: {}", e);
        }
    }
    Ok(())
}

fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    }
}
