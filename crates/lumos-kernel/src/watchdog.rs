//! [`Watchdog`] – liveness heartbeat towards the external supervisor.
//!
//! The supervisor board cuts laser power by itself when heartbeats stop.  The
//! watchdog's job is to keep them flowing from an independent task and to
//! notice when it cannot: a send error or an iteration that overruns its
//! budget is a *local failure* and trips the [`SafetyCoordinator`] to UNSAFE
//! before the supervisor has to act.
//!
//! Escalation happens once per failure streak.  Heartbeats keep being sent
//! after a failure so the supervisor is not starved while the operator
//! acknowledges.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lumos_hal::HeartbeatLink;
use lumos_types::LumosError;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::safety::SafetyCoordinator;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_HEARTBEAT_BUDGET: Duration = Duration::from_millis(400);
pub const DEFAULT_SUPERVISOR_TIMEOUT: Duration = Duration::from_millis(1000);

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Heartbeat timing.
///
/// Validated so that a late-but-within-budget heartbeat still lands inside
/// the supervisor's timeout: `interval + budget < supervisor_timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawWatchdogConfig")]
pub struct WatchdogConfig {
    interval: Duration,
    budget: Duration,
    supervisor_timeout: Duration,
}

#[derive(Deserialize)]
struct RawWatchdogConfig {
    interval: Duration,
    budget: Duration,
    supervisor_timeout: Duration,
}

impl TryFrom<RawWatchdogConfig> for WatchdogConfig {
    type Error = LumosError;

    fn try_from(raw: RawWatchdogConfig) -> Result<Self, Self::Error> {
        WatchdogConfig::new(raw.interval, raw.budget, raw.supervisor_timeout)
    }
}

impl WatchdogConfig {
    /// # Errors
    ///
    /// [`LumosError::InvalidConfig`] when a value is zero or the timing
    /// leaves no margin before the supervisor timeout.
    pub fn new(
        interval: Duration,
        budget: Duration,
        supervisor_timeout: Duration,
    ) -> Result<Self, LumosError> {
        if interval.is_zero() || budget.is_zero() || supervisor_timeout.is_zero() {
            return Err(LumosError::InvalidConfig(
                "heartbeat timings must be non-zero".to_string(),
            ));
        }
        if interval + budget >= supervisor_timeout {
            return Err(LumosError::InvalidConfig(format!(
                "heartbeat interval {interval:?} + budget {budget:?} must stay below supervisor timeout {supervisor_timeout:?}"
            )));
        }
        Ok(Self {
            interval,
            budget,
            supervisor_timeout,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn supervisor_timeout(&self) -> Duration {
        self.supervisor_timeout
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HEARTBEAT_INTERVAL,
            budget: DEFAULT_HEARTBEAT_BUDGET,
            supervisor_timeout: DEFAULT_SUPERVISOR_TIMEOUT,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Watchdog
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    failures: AtomicU64,
    escalations: AtomicU64,
}

/// Spawns the heartbeat loop.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use lumos_hal::SimSupervisor;
/// use lumos_kernel::{SafetyCoordinator, Watchdog, WatchdogConfig};
///
/// # async fn demo() {
/// let safety = Arc::new(SafetyCoordinator::detached());
/// let config = WatchdogConfig::default();
/// let supervisor = SimSupervisor::new(config.supervisor_timeout());
/// let handle = Watchdog::spawn(config, supervisor, safety);
/// handle.stop().await;
/// # }
/// ```
pub struct Watchdog;

impl Watchdog {
    /// Start sending heartbeats on a dedicated tokio task.
    ///
    /// Must be called inside a tokio runtime.  Dropping the returned handle
    /// stops the loop.
    pub fn spawn(
        config: WatchdogConfig,
        link: Arc<dyn HeartbeatLink>,
        safety: Arc<SafetyCoordinator>,
    ) -> WatchdogHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let counters = Arc::new(Counters::default());
        let task = tokio::spawn(run(config, link, safety, Arc::clone(&counters), stop_rx));
        info!(
            interval_ms = config.interval.as_millis() as u64,
            budget_ms = config.budget.as_millis() as u64,
            "watchdog started"
        );
        WatchdogHandle {
            stop_tx: Some(stop_tx),
            task,
            counters,
        }
    }
}

async fn run(
    config: WatchdogConfig,
    link: Arc<dyn HeartbeatLink>,
    safety: Arc<SafetyCoordinator>,
    counters: Arc<Counters>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut ticker = time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut token: u64 = 0;
    let mut failing = false;

    loop {
        tokio::select! {
            biased;
            _ = &mut stop_rx => break,
            _ = ticker.tick() => {}
        }

        token = token.wrapping_add(1);
        let started = Instant::now();
        let outcome = match time::timeout(config.budget, link.send_heartbeat(token)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("heartbeat send failed: {e}")),
            Err(_) => Err(format!(
                "heartbeat iteration exceeded its {:?} budget",
                config.budget
            )),
        };

        match outcome {
            Ok(()) => {
                counters.sent.fetch_add(1, Ordering::AcqRel);
                debug!(token, elapsed_us = started.elapsed().as_micros() as u64, "heartbeat sent");
                if failing {
                    failing = false;
                    info!(token, "heartbeat restored");
                }
            }
            Err(reason) => {
                counters.failures.fetch_add(1, Ordering::AcqRel);
                if failing {
                    warn!(token, %reason, "heartbeat still failing");
                } else {
                    failing = true;
                    counters.escalations.fetch_add(1, Ordering::AcqRel);
                    error!(token, %reason, "watchdog local failure, escalating");
                    safety.trip_unsafe(&reason);
                }
            }
        }
    }
    info!("watchdog stopped");
}

/// Control handle for a running [`Watchdog`].
pub struct WatchdogHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    counters: Arc<Counters>,
}

impl WatchdogHandle {
    /// Heartbeats delivered successfully.
    pub fn heartbeats_sent(&self) -> u64 {
        self.counters.sent.load(Ordering::Acquire)
    }

    /// Iterations that failed (send error or budget overrun).
    pub fn failures(&self) -> u64 {
        self.counters.failures.load(Ordering::Acquire)
    }

    /// Times the watchdog tripped the safety coordinator.
    pub fn escalations(&self) -> u64 {
        self.counters.escalations.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the loop and wait for it to exit.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!(error = %e, "watchdog task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumos_hal::SimSupervisor;
    use lumos_types::{InterlockSet, SafetyState};

    fn fast_config() -> WatchdogConfig {
        WatchdogConfig::new(
            Duration::from_millis(10),
            Duration::from_millis(20),
            Duration::from_millis(100),
        )
        .unwrap()
    }

    fn armed_safety() -> Arc<SafetyCoordinator> {
        let safety = Arc::new(SafetyCoordinator::detached());
        safety.apply_interlocks(InterlockSet::all_satisfied());
        safety.arm().unwrap();
        safety
    }

    #[test]
    fn config_rejects_no_margin() {
        assert!(matches!(
            WatchdogConfig::new(
                Duration::from_millis(600),
                Duration::from_millis(400),
                Duration::from_millis(1000)
            ),
            Err(LumosError::InvalidConfig(_))
        ));
        assert!(WatchdogConfig::new(Duration::ZERO, Duration::from_millis(1), Duration::from_secs(1)).is_err());
    }

    #[test]
    fn default_config_is_valid() {
        let d = WatchdogConfig::default();
        assert_eq!(
            WatchdogConfig::new(d.interval(), d.budget(), d.supervisor_timeout()).unwrap(),
            d
        );
    }

    #[test]
    fn config_deserialises_with_validation() {
        let ok = r#"{"interval":{"secs":0,"nanos":500000000},"budget":{"secs":0,"nanos":400000000},"supervisor_timeout":{"secs":1,"nanos":0}}"#;
        assert_eq!(
            serde_json::from_str::<WatchdogConfig>(ok).unwrap(),
            WatchdogConfig::default()
        );
        let bad = r#"{"interval":{"secs":1,"nanos":0},"budget":{"secs":1,"nanos":0},"supervisor_timeout":{"secs":1,"nanos":0}}"#;
        assert!(serde_json::from_str::<WatchdogConfig>(bad).is_err());
    }

    #[tokio::test]
    async fn keeps_supervisor_fed() {
        let safety = armed_safety();
        let supervisor = SimSupervisor::new(Duration::from_millis(100));
        let handle = Watchdog::spawn(fast_config(), supervisor.clone(), Arc::clone(&safety));

        time::sleep(Duration::from_millis(120)).await;

        assert!(handle.heartbeats_sent() >= 3);
        assert_eq!(handle.failures(), 0);
        assert!(!supervisor.has_cut_power());
        assert!(supervisor.last_token() >= 3);
        assert_eq!(safety.state(), SafetyState::Armed);
        handle.stop().await;
    }

    #[tokio::test]
    async fn send_failure_trips_unsafe_once_per_streak() {
        let safety = armed_safety();
        let supervisor = SimSupervisor::new(Duration::from_millis(100));
        supervisor.set_link_down(true);
        let handle = Watchdog::spawn(fast_config(), supervisor.clone(), Arc::clone(&safety));

        time::sleep(Duration::from_millis(80)).await;
        assert_eq!(safety.state(), SafetyState::Unsafe);
        assert!(safety.trip_reason().unwrap().contains("heartbeat send failed"));
        assert!(handle.failures() >= 2);
        assert_eq!(handle.escalations(), 1);

        supervisor.set_link_down(false);
        time::sleep(Duration::from_millis(50)).await;
        assert!(handle.heartbeats_sent() >= 1);
        assert_eq!(handle.escalations(), 1);
        handle.stop().await;
    }

    #[tokio::test]
    async fn budget_overrun_is_a_local_failure() {
        let safety = armed_safety();
        let supervisor = SimSupervisor::new(Duration::from_millis(100));
        supervisor.set_latency(Duration::from_millis(50));
        let handle = Watchdog::spawn(fast_config(), supervisor, Arc::clone(&safety));

        time::sleep(Duration::from_millis(80)).await;
        assert_eq!(safety.state(), SafetyState::Unsafe);
        assert!(safety.trip_reason().unwrap().contains("budget"));
        handle.stop().await;
    }

    #[tokio::test]
    async fn stop_ends_the_loop() {
        let safety = Arc::new(SafetyCoordinator::detached());
        let supervisor = SimSupervisor::new(Duration::from_millis(100));
        let handle = Watchdog::spawn(fast_config(), supervisor.clone(), safety);
        time::sleep(Duration::from_millis(30)).await;
        assert!(handle.is_running());
        handle.stop().await;
        let beats = supervisor.beats_received();
        time::sleep(Duration::from_millis(40)).await;
        assert_eq!(supervisor.beats_received(), beats);
    }
}
