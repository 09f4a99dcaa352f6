//! Connectivity supervision: bring the link up with backoff, drop it for
//! power saving, and decide when repeated failures should hand control to the
//! offline fallback.

use anyhow::{anyhow, bail, Context, Result};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::engine::CycleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectivityState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// What the engine may ask of connectivity. It never sets the state itself.
pub(crate) trait Connectivity {
    fn state(&self) -> ConnectivityState;

    fn is_connected(&self) -> bool {
        self.state() == ConnectivityState::Connected
    }

    /// Return once the link is up, or fail after the reconnect timeout.
    async fn ensure_connected(&mut self) -> Result<()>;

    /// Drop the link to save power. The next `ensure_connected` rejoins.
    fn disconnect(&mut self);
}

/// The physical/network link underneath the supervisor.
pub(crate) trait Link {
    async fn join(&mut self) -> Result<()>;
    fn leave(&mut self);
}

// ---------------------------------------------------------------------------
// TCP reachability link (host builds)
// ---------------------------------------------------------------------------

/// Treats "the schedule server accepts a TCP connection" as link-up.
pub(crate) struct TcpLink {
    host: String,
    port: u16,
    connect_timeout: Duration,
}

impl TcpLink {
    pub(crate) fn from_url(url: &str, connect_timeout: Duration) -> Result<Self> {
        let parsed = reqwest::Url::parse(url).with_context(|| format!("invalid url: {url}"))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| anyhow!("url has no host: {url}"))?
            .to_string();
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| anyhow!("url has no port: {url}"))?;
        Ok(Self {
            host,
            port,
            connect_timeout,
        })
    }
}

impl Link for TcpLink {
    async fn join(&mut self) -> Result<()> {
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(e).with_context(|| format!("connect {}:{}", self.host, self.port)),
            Err(_) => bail!(
                "connect {}:{} timed out after {} ms",
                self.host,
                self.port,
                self.connect_timeout.as_millis()
            ),
        }
    }

    fn leave(&mut self) {
        debug!(host = %self.host, "link released");
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LinkSettings {
    pub(crate) reconnect_interval: Duration,
    pub(crate) backoff_max: Duration,
    pub(crate) reconnect_timeout: Duration,
}

pub(crate) struct Supervisor<L, C> {
    link: L,
    clock: C,
    settings: LinkSettings,
    state: ConnectivityState,
}

impl<L: Link, C: Clock> Supervisor<L, C> {
    pub(crate) fn new(link: L, clock: C, settings: LinkSettings) -> Self {
        Self {
            link,
            clock,
            settings,
            state: ConnectivityState::Disconnected,
        }
    }
}

impl<L: Link, C: Clock> Connectivity for Supervisor<L, C> {
    fn state(&self) -> ConnectivityState {
        self.state
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if self.state == ConnectivityState::Connected {
            return Ok(());
        }

        self.state = ConnectivityState::Connecting;
        let start = self.clock.now();
        let timeout = self.settings.reconnect_timeout;
        let mut delay = self.settings.reconnect_interval;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            match self.link.join().await {
                Ok(()) => {
                    self.state = ConnectivityState::Connected;
                    info!(attempts, "link up");
                    return Ok(());
                }
                Err(e) => debug!(attempts, "link join failed: {e:#}"),
            }

            let elapsed = self.clock.now().saturating_duration_since(start);
            if elapsed >= timeout {
                self.state = ConnectivityState::Failed;
                warn!(
                    attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "link did not come up"
                );
                bail!("link not up after {attempts} attempts");
            }

            self.clock.sleep(delay.min(timeout - elapsed)).await;
            delay = (delay * 2).min(self.settings.backoff_max);
        }
    }

    fn disconnect(&mut self) {
        if self.state != ConnectivityState::Disconnected {
            self.link.leave();
            self.state = ConnectivityState::Disconnected;
            debug!("link dropped for power saving");
        }
    }
}

// ---------------------------------------------------------------------------
// Escalation
// ---------------------------------------------------------------------------

/// What the main loop should do after a failed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Escalation {
    /// Poll again after the normal loop delay.
    Retry,
    /// Link is down; wait out the standby period before trying again.
    Standby,
    /// Server unreachable for too long; water on the fixed offline schedule.
    OfflineFallback,
    /// Hardware refused an operation; stop rather than guess.
    Halt,
}

/// Counts consecutive failures to reach the server.
#[derive(Debug)]
pub(crate) struct FailureTracker {
    threshold: u32,
    consecutive: u32,
}

impl FailureTracker {
    pub(crate) fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
        }
    }

    pub(crate) fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub(crate) fn record_success(&mut self) {
        self.consecutive = 0;
    }

    /// Parse failures come from a reachable server and never count.
    pub(crate) fn record_failure(&mut self, err: &CycleError) -> Escalation {
        match err {
            CycleError::Parse(_) => Escalation::Retry,
            CycleError::Hardware(_) => Escalation::Halt,
            CycleError::Connectivity(_) | CycleError::Transport(_) => {
                self.consecutive += 1;
                if self.consecutive >= self.threshold {
                    self.consecutive = 0;
                    Escalation::OfflineFallback
                } else if matches!(err, CycleError::Connectivity(_)) {
                    Escalation::Standby
                } else {
                    Escalation::Retry
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
