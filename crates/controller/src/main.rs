mod actuator;
mod clock;
mod config;
mod engine;
mod fallback;
mod gpio;
mod network;
mod schedule;
#[cfg(feature = "sim")]
mod sim;
mod supervisor;
#[cfg(test)]
mod testing;

#[cfg(not(any(feature = "sim", feature = "gpio")))]
compile_error!("enable a hardware backend: feature `sim` or `gpio`");

use anyhow::{Context, Result};
use std::env;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use actuator::Actuator;
use clock::{Clock, TokioClock};
use config::Config;
use engine::{CycleError, CycleReport, WateringEngine};
use gpio::Gpio;
use network::{HttpNetwork, Network};
use supervisor::{Connectivity, Escalation, FailureTracker, Supervisor, TcpLink};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "controller.toml".to_string());
    let cfg = config::load(&config_path)?;
    info!(path = %config_path, "config loaded");

    // ── Network + link ──────────────────────────────────────────────
    let network = HttpNetwork::new(cfg.request_timeout())?;
    let link = TcpLink::from_url(&cfg.server.schedule_url, cfg.request_timeout())?;
    let mut supervisor = Supervisor::new(link, TokioClock, cfg.link_settings());

    let cfg = load_remote_constants(cfg, &network, &mut supervisor).await;

    // ── Hardware ────────────────────────────────────────────────────
    #[cfg(feature = "gpio")]
    let gpio = gpio::RppalGpio::new()?;
    #[cfg(not(feature = "gpio"))]
    let gpio = sim::SimGpio::new(sim::SimParams::from_env(), cfg.device.relay_active_low);

    run(cfg, network, supervisor, gpio).await
}

/// Merge the server's constants document over the file config when one is
/// configured. Any failure keeps the file values.
async fn load_remote_constants(
    cfg: Config,
    network: &impl Network,
    link: &mut impl Connectivity,
) -> Config {
    let Some(url) = cfg.server.constants_url.clone() else {
        return cfg;
    };
    let merged: Result<Config> = async {
        link.ensure_connected().await?;
        let remote = config::fetch_remote_constants(network, &url).await?;
        cfg.with_remote(&remote)
    }
    .await;

    match merged {
        Ok(merged) => merged,
        Err(e) => {
            warn!(url = %url, "remote constants unavailable, using file values: {e:#}");
            cfg
        }
    }
}

/// Build the engine and run cycles until a hardware error stops the device.
async fn run<N, K, G>(cfg: Config, network: N, link: K, gpio: G) -> Result<()>
where
    N: Network,
    K: Connectivity,
    G: Gpio,
{
    let actuator = Actuator::new(gpio, TokioClock, cfg.pins(), cfg.ack_settings())?;
    let engine = WateringEngine::new(
        network,
        link,
        actuator,
        TokioClock,
        cfg.engine_settings(),
        cfg.fallback_settings(),
    );
    let mut controller = Controller::new(engine, TokioClock, &cfg);

    if cfg.device.home_on_start {
        controller
            .engine
            .home()
            .await
            .context("valve homing failed")?;
        controller.log_new_faults();
    }

    info!("controller started");
    loop {
        let step = controller.step().await?;
        debug!(?step, "main loop step");
    }
}

// ---------------------------------------------------------------------------
// Main loop
// ---------------------------------------------------------------------------

/// What one main-loop iteration did. Each path waits exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// The engine slept out `sleep_interval`; poll again straight away.
    Slept,
    /// Watered, then waited `loop_delay`.
    Watered,
    /// Schedule rejected; the engine already waited `parse_retry_delay`.
    ParseRetry,
    /// Fetch failed; waited `loop_delay`.
    Retry,
    /// Link down; waited `link.standby_ms`.
    Standby,
    /// Ran one offline fallback cycle, which ends in its own standby.
    Offline,
}

struct Controller<N, K, G, C> {
    engine: WateringEngine<N, K, G, C>,
    clock: C,
    failures: FailureTracker,
    loop_delay: Duration,
    link_standby: Duration,
    faults_logged: u32,
}

impl<N, K, G, C> Controller<N, K, G, C>
where
    N: Network,
    K: Connectivity,
    G: Gpio,
    C: Clock,
{
    fn new(engine: WateringEngine<N, K, G, C>, clock: C, cfg: &Config) -> Self {
        Self {
            engine,
            clock,
            failures: FailureTracker::new(cfg.link.offline_after_failures),
            loop_delay: cfg.loop_delay(),
            link_standby: cfg.link_standby(),
            faults_logged: 0,
        }
    }

    /// Run one cycle and act on its outcome. Fails only when the hardware
    /// does; the valve is OFF by then.
    async fn step(&mut self) -> Result<Step> {
        let step = match self.engine.run_cycle().await {
            Ok(CycleReport::Slept { .. }) => {
                self.failures.record_success();
                Step::Slept
            }
            Ok(report @ CycleReport::Watered(_)) => {
                self.failures.record_success();
                debug!(?report, "cycle complete");
                self.clock.sleep(self.loop_delay).await;
                Step::Watered
            }
            Err(e) => {
                let state = self.engine.state();
                match self.failures.record_failure(&e) {
                    Escalation::Retry if matches!(e, CycleError::Parse(_)) => {
                        warn!(?state, "cycle aborted: {e}");
                        Step::ParseRetry
                    }
                    Escalation::Retry => {
                        warn!(
                            ?state,
                            consecutive = self.failures.consecutive(),
                            "cycle failed: {e}"
                        );
                        self.clock.sleep(self.loop_delay).await;
                        Step::Retry
                    }
                    Escalation::Standby => {
                        warn!(
                            consecutive = self.failures.consecutive(),
                            standby_ms = self.link_standby.as_millis() as u64,
                            "cycle failed, standing by: {e}"
                        );
                        self.clock.sleep(self.link_standby).await;
                        Step::Standby
                    }
                    Escalation::OfflineFallback => {
                        warn!("server unreachable, switching to offline fallback: {e}");
                        let report = self
                            .engine
                            .run_offline_fallback_cycle()
                            .await
                            .context("offline fallback cycle failed")?;
                        info!(?report, "offline cycle complete");
                        Step::Offline
                    }
                    Escalation::Halt => {
                        error!(?state, "halting: {e}");
                        return Err(anyhow::Error::new(e).context("controller halted"));
                    }
                }
            }
        };
        self.log_new_faults();
        Ok(step)
    }

    /// Warn once per newly raised fault. Returns whether anything was logged.
    fn log_new_faults(&mut self) -> bool {
        let faults = self.engine.faults();
        if !faults.is_active() || faults.count() == self.faults_logged {
            return false;
        }
        self.faults_logged = faults.count();
        warn!(count = faults.count(), last = ?faults.last(), "valve fault flag raised");
        true
    }
}

// ===========================================================================
// Tests
// ===========================================================================
