//! Per-run state of the protocol engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use lumos_types::FaultReason;

/// Cooperative cancellation flag shared between a run and its handles.
///
/// Cancelling is sticky: once set, it stays set for the rest of the run.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Mutable state of one protocol run, owned by the run's task and dropped
/// when the run ends.
#[derive(Debug)]
pub struct ExecutionContext {
    line_index: usize,
    loop_index: u32,
    position_mm: f64,
    cancel: CancellationFlag,
    last_fault: Option<FaultReason>,
    started: Instant,
}

impl ExecutionContext {
    /// Fresh context starting at line 0, loop 0, stage at home.
    pub fn new(cancel: CancellationFlag) -> Self {
        Self {
            line_index: 0,
            loop_index: 0,
            position_mm: 0.0,
            cancel,
            last_fault: None,
            started: Instant::now(),
        }
    }

    pub fn line_index(&self) -> usize {
        self.line_index
    }

    pub fn loop_index(&self) -> u32 {
        self.loop_index
    }

    /// Stage position reached by the last completed movement.
    pub fn position_mm(&self) -> f64 {
        self.position_mm
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn last_fault(&self) -> Option<&FaultReason> {
        self.last_fault.as_ref()
    }

    /// Monotonic time since the run started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub(crate) fn enter(&mut self, loop_index: u32, line_index: usize) {
        self.loop_index = loop_index;
        self.line_index = line_index;
    }

    pub(crate) fn moved_to(&mut self, position_mm: f64) {
        self.position_mm = position_mm;
    }

    pub(crate) fn record_fault(&mut self, reason: FaultReason) {
        self.last_fault = Some(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_shared_between_clones() {
        let flag = CancellationFlag::new();
        let ctx = ExecutionContext::new(flag.clone());
        assert!(!ctx.is_cancelled());
        flag.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn context_tracks_position_and_fault() {
        let mut ctx = ExecutionContext::new(CancellationFlag::new());
        assert_eq!((ctx.loop_index(), ctx.line_index()), (0, 0));
        ctx.enter(1, 2);
        ctx.moved_to(4.5);
        ctx.record_fault(FaultReason::EmergencyStop);
        assert_eq!((ctx.loop_index(), ctx.line_index()), (1, 2));
        assert!((ctx.position_mm() - 4.5).abs() < f64::EPSILON);
        assert_eq!(ctx.last_fault(), Some(&FaultReason::EmergencyStop));
    }
}
