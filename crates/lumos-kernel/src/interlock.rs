//! [`InterlockCoordinator`] – aggregates independent safety facts.
//!
//! Each fact has one producer (the laser driver's interlock line, the session
//! reporter, the power monitor, the operator's emergency-stop button).
//! Producers either call the setters directly or hand over a `watch` receiver
//! with [`attach`][InterlockCoordinator::attach]; in both cases the aggregate
//! is recomputed on the change and pushed into the [`SafetyCoordinator`].
//! Nothing is polled.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use lumos_types::{InterlockFact, InterlockSet};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::safety::SafetyCoordinator;

/// Owns the [`InterlockSet`] and forwards every change to the safety state
/// machine.
pub struct InterlockCoordinator {
    facts: Mutex<InterlockSet>,
    safety: Arc<SafetyCoordinator>,
    power_ceiling_w: f64,
    feeds: Mutex<Vec<JoinHandle<()>>>,
}

impl InterlockCoordinator {
    /// Create a coordinator starting from the fail-safe [`InterlockSet`]
    /// default and push that set to `safety`.
    pub fn new(safety: Arc<SafetyCoordinator>, power_ceiling_w: f64) -> Arc<Self> {
        let facts = InterlockSet::default();
        safety.apply_interlocks(facts);
        Arc::new(Self {
            facts: Mutex::new(facts),
            safety,
            power_ceiling_w,
            feeds: Mutex::new(Vec::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, InterlockSet> {
        self.facts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current facts.
    pub fn snapshot(&self) -> InterlockSet {
        *self.lock()
    }

    /// Facts currently denying permission.
    pub fn unsatisfied(&self) -> Vec<InterlockFact> {
        self.lock().unsatisfied()
    }

    pub fn power_ceiling_w(&self) -> f64 {
        self.power_ceiling_w
    }

    /// Set `fact` and, if it changed, push the new aggregate.
    ///
    /// The push happens under this coordinator's lock so the safety
    /// coordinator receives aggregates in the order they were computed.  Any
    /// resulting selective shutdown runs after the lock is released.
    pub fn set_fact(&self, fact: InterlockFact, value: bool) {
        let pending = {
            let mut facts = self.lock();
            if !facts.set(fact, value) {
                return;
            }
            if facts.permits() {
                info!(%fact, value, "interlock changed, laser permitted");
            } else {
                warn!(%fact, value, unsatisfied = ?facts.unsatisfied(), "interlock changed, laser denied");
            }
            self.safety.push_interlocks(*facts)
        };
        self.safety.finish(pending);
    }

    pub fn set_hardware_interlock(&self, satisfied: bool) {
        self.set_fact(InterlockFact::HardwareInterlock, satisfied);
    }

    pub fn set_session_valid(&self, valid: bool) {
        self.set_fact(InterlockFact::SessionValid, valid);
    }

    /// Report the physical emergency-stop button.  `true` means pressed.
    pub fn set_emergency_stop_button(&self, asserted: bool) {
        self.set_fact(InterlockFact::EmergencyStopAsserted, asserted);
    }

    /// Evaluate the power-limit fact against the configured ceiling.
    /// Non-finite readings count as over the limit.
    pub fn report_laser_power(&self, watts: f64) {
        let within = watts.is_finite() && watts <= self.power_ceiling_w;
        if !within {
            warn!(watts, ceiling = self.power_ceiling_w, "laser output above power ceiling");
        }
        self.set_fact(InterlockFact::PowerWithinLimit, within);
    }

    /// Forward every value published on `rx` into `fact`.
    ///
    /// The current value is applied immediately.  Must be called inside a
    /// tokio runtime; the forwarding task ends when the sender is dropped or
    /// this coordinator is dropped.
    pub fn attach(self: &Arc<Self>, fact: InterlockFact, mut rx: watch::Receiver<bool>) {
        self.set_fact(fact, *rx.borrow_and_update());
        let weak = Arc::downgrade(self);
        self.spawn_feed(async move {
            while rx.changed().await.is_ok() {
                let value = *rx.borrow_and_update();
                let Some(this) = Weak::upgrade(&weak) else {
                    break;
                };
                this.set_fact(fact, value);
            }
            debug!(%fact, "interlock feed closed");
        });
    }

    /// Forward laser output readings into the power-limit fact.
    pub fn attach_power(self: &Arc<Self>, mut rx: watch::Receiver<f64>) {
        self.report_laser_power(*rx.borrow_and_update());
        let weak = Arc::downgrade(self);
        self.spawn_feed(async move {
            while rx.changed().await.is_ok() {
                let watts = *rx.borrow_and_update();
                let Some(this) = Weak::upgrade(&weak) else {
                    break;
                };
                this.report_laser_power(watts);
            }
            debug!("power feed closed");
        });
    }

    fn spawn_feed<F>(&self, feed: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(feed);
        if let Ok(mut feeds) = self.feeds.lock() {
            feeds.retain(|h| !h.is_finished());
            feeds.push(handle);
        }
    }
}

impl Drop for InterlockCoordinator {
    fn drop(&mut self) {
        if let Ok(feeds) = self.feeds.get_mut() {
            for feed in feeds.drain(..) {
                feed.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use std::time::Instant;

    use lumos_hal::{HardwareController, SimLaser};
    use lumos_types::{HardwareError, NullObserver, SafetyState, StatusSnapshot};

    fn coordinator(ceiling: f64) -> (Arc<SafetyCoordinator>, Arc<InterlockCoordinator>) {
        let safety = Arc::new(SafetyCoordinator::detached());
        let interlocks = InterlockCoordinator::new(Arc::clone(&safety), ceiling);
        (safety, interlocks)
    }

    fn satisfy(interlocks: &InterlockCoordinator) {
        interlocks.set_hardware_interlock(true);
        interlocks.set_session_valid(true);
    }

    /// Emitter whose shutdown takes a while to acknowledge.
    struct SlowAbort;

    impl HardwareController for SlowAbort {
        fn id(&self) -> &str {
            "slow_laser"
        }

        fn connect(&self) -> Result<(), HardwareError> {
            Ok(())
        }

        fn get_status(&self) -> StatusSnapshot {
            StatusSnapshot::default()
        }

        fn abort(&self) -> Result<(), HardwareError> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        }
    }

    /// Wait until `cond` holds or fail after one second.
    async fn eventually(cond: impl Fn() -> bool) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn starts_fail_safe() {
        let (safety, interlocks) = coordinator(5.0);
        assert!(!interlocks.snapshot().permits());
        assert_eq!(
            interlocks.unsatisfied(),
            vec![InterlockFact::HardwareInterlock, InterlockFact::SessionValid]
        );
        assert_eq!(safety.interlocks(), InterlockSet::default());
    }

    #[test]
    fn setters_push_aggregate_to_safety() {
        let (safety, interlocks) = coordinator(5.0);
        satisfy(&interlocks);
        assert!(safety.interlocks().permits());
        safety.arm().unwrap();
        assert!(safety.query_laser_permitted());

        interlocks.set_session_valid(false);
        assert_eq!(safety.state(), SafetyState::Unsafe);
        assert!(!safety.query_laser_permitted());
    }

    #[test]
    fn slow_shutdown_does_not_block_other_producers() {
        let safety = Arc::new(SafetyCoordinator::new(
            Arc::new(NullObserver),
            vec![Arc::new(SlowAbort) as Arc<dyn HardwareController>],
        ));
        let interlocks = InterlockCoordinator::new(Arc::clone(&safety), 5.0);
        satisfy(&interlocks);
        safety.arm().unwrap();

        let tripping = Arc::clone(&interlocks);
        let trip = std::thread::spawn(move || tripping.set_hardware_interlock(false));
        std::thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        interlocks.set_session_valid(false);
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(!interlocks.snapshot().session_valid);
        assert_eq!(safety.state(), SafetyState::Unsafe);

        trip.join().unwrap();
    }

    #[test]
    fn power_above_ceiling_denies() {
        let (safety, interlocks) = coordinator(5.0);
        satisfy(&interlocks);
        interlocks.report_laser_power(5.0);
        assert!(safety.interlocks().power_within_limit);
        interlocks.report_laser_power(5.5);
        assert!(!safety.interlocks().power_within_limit);
        interlocks.report_laser_power(f64::NAN);
        assert_eq!(interlocks.unsatisfied(), vec![InterlockFact::PowerWithinLimit]);
    }

    #[test]
    fn emergency_button_forces_emergency_stop() {
        let (safety, interlocks) = coordinator(5.0);
        satisfy(&interlocks);
        safety.arm().unwrap();

        interlocks.set_emergency_stop_button(true);
        assert_eq!(safety.state(), SafetyState::EmergencyStop);

        interlocks.set_emergency_stop_button(false);
        assert_eq!(safety.state(), SafetyState::EmergencyStop);
        safety.reset_from_emergency().unwrap();
        assert_eq!(safety.state(), SafetyState::Safe);
    }

    #[tokio::test]
    async fn attached_feed_drives_hardware_fact() {
        let (safety, interlocks) = coordinator(5.0);
        let laser = SimLaser::new("laser");
        interlocks.set_session_valid(true);
        interlocks.attach(InterlockFact::HardwareInterlock, laser.interlock_feed());

        // Initial value applied synchronously.
        assert!(interlocks.snapshot().hardware_interlock_satisfied);
        safety.arm().unwrap();

        laser.set_interlock_line(false);
        eventually(|| safety.state() == SafetyState::Unsafe).await;

        laser.set_interlock_line(true);
        eventually(|| safety.state() == SafetyState::Safe).await;
    }

    #[tokio::test]
    async fn attached_power_feed_checks_ceiling() {
        let (_safety, interlocks) = coordinator(2.0);
        let (tx, rx) = watch::channel(0.0);
        interlocks.attach_power(rx);

        tx.send_replace(3.0);
        eventually(|| !interlocks.snapshot().power_within_limit).await;
        tx.send_replace(1.0);
        eventually(|| interlocks.snapshot().power_within_limit).await;
    }
}
