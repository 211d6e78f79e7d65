//! Connection supervisor: reconnect with backoff, and the idle sub-mode.

use crate::config::SessionConfig;
use crate::idle::{self, WakeReason};
use crate::session::Session;
use portgate_shared::descriptor::IdleDescriptor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Agent connection status. Duplicates are coalesced, not re-emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Connecting,
    Connected,
    Disconnected,
    Idle,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Status::Connecting => "connecting",
            Status::Connected => "connected",
            Status::Disconnected => "disconnected",
            Status::Idle => "idle",
        };
        f.write_str(name)
    }
}

/// Delay before a freshly opened channel counts as connected.
///
/// The relay may close the channel right after accepting it (auth
/// post-check, duplicate-client rejection); a failure inside this window
/// still counts against the backoff counter.
pub const SETTLE_DELAY: Duration = Duration::from_millis(500);

const BACKOFF_BASE: f64 = 1.8;
const MAX_BACKOFF_SECS: u64 = 600;

/// The k-th reconnect delay: `min(600, round(1.8^(k-1)))` seconds.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.powi(attempt.saturating_sub(1) as i32);
    Duration::from_secs((exp.round() as u64).min(MAX_BACKOFF_SECS))
}

/// State machine over {connecting, connected, disconnected, idle}.
///
/// Owns at most one of {tunnel session, idle notifier} at a time and runs
/// until the hosting process is cancelled; there is no terminal state.
pub struct Supervisor {
    config: Arc<SessionConfig>,
    status: watch::Sender<Status>,
    retries: u32,
}

impl Supervisor {
    pub fn new(config: SessionConfig) -> (Self, watch::Receiver<Status>) {
        let (status, status_rx) = watch::channel(Status::Connecting);
        let supervisor = Self {
            config: Arc::new(config),
            status,
            retries: 1,
        };
        (supervisor, status_rx)
    }

    fn set_status(&self, next: Status) {
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    pub async fn run(mut self) {
        loop {
            self.set_status(Status::Connecting);
            let session = match Session::connect(self.config.clone()).await {
                Ok(session) => session,
                Err(err) => {
                    warn!("channel open failed: {err:#}");
                    self.disconnected().await;
                    continue;
                }
            };

            let driver = session.run();
            tokio::pin!(driver);

            // The channel is open; the settle window only gates failures.
            let early = tokio::select! {
                end = &mut driver => Some(end),
                _ = sleep(SETTLE_DELAY) => None,
            };
            let end = match early {
                Some(end) => end,
                None => {
                    self.retries = 1;
                    self.set_status(Status::Connected);
                    info!("tunnel established");
                    driver.await
                }
            };

            match end {
                Ok(descriptor) => {
                    // A park right after accept is still a successful
                    // connection: pass through connected and reset backoff
                    // before idling.
                    self.retries = 1;
                    self.set_status(Status::Connected);
                    self.idle(descriptor).await;
                }
                Err(err) => {
                    warn!("tunnel session ended: {err}");
                    self.disconnected().await;
                }
            }
        }
    }

    async fn disconnected(&mut self) {
        self.set_status(Status::Disconnected);
        let delay = backoff_delay(self.retries);
        self.retries = self.retries.saturating_add(1);
        info!("reconnecting in {}s", delay.as_secs());
        sleep(delay).await;
    }

    async fn idle(&mut self, descriptor: IdleDescriptor) {
        self.set_status(Status::Idle);
        let names = self.config.remote_names();
        match idle::watch(&descriptor, &names).await {
            WakeReason::Changed => info!("wake-up signal received"),
            WakeReason::Timeout => debug!("idle period expired"),
            // Already logged by the notifier; reconnect normally.
            WakeReason::Error => {}
        }
    }
}
