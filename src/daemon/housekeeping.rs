use super::core::DaemonCore;
use super::transport::ClientTransport;
use crate::user_config::UserConfig;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How often the loop wakes up
const DEFAULT_TICK: Duration = Duration::from_secs(5);

/// Background upkeep for a running daemon
///
/// Each tick may close the idle log handle, sweep dead clients, compact the
/// saved-state log, or shut the daemon down after a long idle period.
pub struct Housekeeper<T: ClientTransport> {
    core: Arc<DaemonCore<T>>,
    shutdown: watch::Sender<bool>,
    tick: Duration,
    sweep_interval: Duration,
    compact_interval: Duration,
    idle_exit: Option<Duration>,
}

impl<T: ClientTransport> Housekeeper<T> {
    pub fn new(
        core: Arc<DaemonCore<T>>,
        shutdown: watch::Sender<bool>,
        settings: &UserConfig,
    ) -> Self {
        Self {
            core,
            shutdown,
            tick: DEFAULT_TICK,
            sweep_interval: settings.sweep_interval(),
            compact_interval: settings.compact_interval(),
            idle_exit: settings.idle_exit(),
        }
    }

    /// Set the tick interval
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Run until the daemon shuts down
    ///
    /// This should be spawned as a background task.
    pub async fn run(self) {
        info!(
            "Housekeeping started (sweep: {:?}, compact: {:?}, idle exit: {:?})",
            self.sweep_interval, self.compact_interval, self.idle_exit
        );

        let mut interval = tokio::time::interval(self.tick);
        let mut last_sweep = Instant::now();
        let mut last_compact = Instant::now();
        let mut idle_since: Option<Instant> = None;

        loop {
            interval.tick().await;
            if self.core.is_in_shutdown() {
                break;
            }
            let now = Instant::now();

            if self.core.close_idle_log().await {
                debug!("Closed idle saved state handle");
            }

            if now.duration_since(last_sweep) >= self.sweep_interval {
                last_sweep = now;
                self.core.sweep_clients().await;
            }

            if now.duration_since(last_compact) >= self.compact_interval {
                last_compact = now;
                self.compact().await;
            }

            if self.check_idle_exit(now, &mut idle_since).await {
                break;
            }
        }
    }

    async fn compact(&self) {
        match self.core.compact_if_needed().await {
            Ok(true) => debug!("Compacted saved state"),
            Ok(false) => {}
            Err(e) => warn!("Failed to compact saved state: {}", e),
        }
    }

    /// Returns true once the daemon has asked itself to shut down.
    async fn check_idle_exit(&self, now: Instant, idle_since: &mut Option<Instant>) -> bool {
        let Some(limit) = self.idle_exit else {
            return false;
        };

        if !self.core.is_idle().await {
            *idle_since = None;
            return false;
        }

        let since = *idle_since.get_or_insert(now);
        if now.duration_since(since) < limit {
            return false;
        }

        // Clients that died quietly don't count.
        self.core.sweep_clients().await;
        if !self.core.is_idle().await {
            *idle_since = None;
            return false;
        }

        info!("No clients for {:?}, exiting", limit);
        let _ = self.shutdown.send(true);
        true
    }
}
