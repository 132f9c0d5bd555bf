//! Append-only audit log of bus events.
//!
//! [`AuditSink`] is the replaceable persistence contract.  [`JsonlAuditLog`]
//! writes one serialised [`Event`] per line; [`MemoryAuditLog`] keeps events
//! in memory for tests and short-lived tools.  [`AuditRecorder`] is the task
//! that drains the [`EventBus`] into a sink.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use lumos_types::{Event, EventPayload, LumosError, Severity};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;

/// Persistence contract for the audit trail.
pub trait AuditSink: Send {
    /// Append one event.
    ///
    /// # Errors
    ///
    /// [`LumosError::Audit`] when the event cannot be persisted.
    fn append(&mut self, event: &Event) -> Result<(), LumosError>;

    /// Make appended events durable.
    ///
    /// # Errors
    ///
    /// [`LumosError::Audit`] on I/O failure.
    fn flush(&mut self) -> Result<(), LumosError> {
        Ok(())
    }
}

fn audit_err(context: &str, e: impl std::fmt::Display) -> LumosError {
    LumosError::Audit(format!("{context}: {e}"))
}

// ────────────────────────────────────────────────────────────────────────────
// JSON lines
// ────────────────────────────────────────────────────────────────────────────

/// JSON-lines file sink.  Opens in append mode and never truncates.
pub struct JsonlAuditLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlAuditLog {
    /// Open (creating if needed) the log at `path`, including parent
    /// directories.
    ///
    /// # Errors
    ///
    /// [`LumosError::Audit`] when the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LumosError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| audit_err("create audit directory", e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| audit_err("open audit log", e))?;
        info!(path = %path.display(), "audit log opened");
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every event back from a JSON-lines log.
    ///
    /// # Errors
    ///
    /// [`LumosError::Audit`] on I/O failure or a malformed line.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<Event>, LumosError> {
        let file = File::open(path.as_ref()).map_err(|e| audit_err("open audit log", e))?;
        let mut events = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| audit_err("read audit log", e))?;
            if line.trim().is_empty() {
                continue;
            }
            let event = serde_json::from_str(&line)
                .map_err(|e| audit_err(&format!("parse audit line {}", n + 1), e))?;
            events.push(event);
        }
        Ok(events)
    }
}

impl AuditSink for JsonlAuditLog {
    fn append(&mut self, event: &Event) -> Result<(), LumosError> {
        serde_json::to_writer(&mut self.writer, event)
            .map_err(|e| audit_err("serialise audit event", e))?;
        self.writer
            .write_all(b"\n")
            .map_err(|e| audit_err("write audit log", e))
    }

    fn flush(&mut self) -> Result<(), LumosError> {
        self.writer
            .flush()
            .map_err(|e| audit_err("flush audit log", e))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// In memory
// ────────────────────────────────────────────────────────────────────────────

/// In-memory sink.  Clones share the same storage, so a test can keep one
/// clone and hand the other to the recorder.
#[derive(Clone, Default)]
pub struct MemoryAuditLog {
    events: Arc<Mutex<Vec<Event>>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for MemoryAuditLog {
    fn append(&mut self, event: &Event) -> Result<(), LumosError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Recorder
// ────────────────────────────────────────────────────────────────────────────

/// Source of the events the recorder publishes about itself.
pub const AUDIT_SOURCE: &str = "lumos-audit";

/// Drains the bus into an [`AuditSink`] on its own task.
///
/// A failing sink does not stop the recorder.  Each failed event is logged
/// and counted, and the first failure of a streak is published on the bus as
/// a critical safety event so the operator learns about it at once.
pub struct AuditRecorder;

impl AuditRecorder {
    /// Subscribe to `bus` now and start recording.
    ///
    /// Subscribing happens before this returns, so no event published after
    /// the call is missed.  Must be called inside a tokio runtime.
    pub fn spawn(bus: &EventBus, sink: Box<dyn AuditSink>) -> AuditRecorderHandle {
        let rx = bus.subscribe();
        let (stop_tx, stop_rx) = oneshot::channel();
        let failures = Arc::new(AtomicU64::new(0));
        let recorder = Recorder {
            sink,
            bus: bus.clone(),
            written: 0,
            failures: Arc::clone(&failures),
            last_error: None,
            failing: false,
        };
        let task = tokio::spawn(recorder.run(rx, stop_rx));
        AuditRecorderHandle {
            stop_tx: Some(stop_tx),
            failures,
            task,
        }
    }
}

struct Recorder {
    sink: Box<dyn AuditSink>,
    bus: EventBus,
    written: u64,
    failures: Arc<AtomicU64>,
    last_error: Option<LumosError>,
    failing: bool,
}

impl Recorder {
    async fn run(
        mut self,
        mut rx: broadcast::Receiver<Event>,
        mut stop_rx: oneshot::Receiver<()>,
    ) -> Result<u64, LumosError> {
        loop {
            tokio::select! {
                biased;
                _ = &mut stop_rx => break,
                received = rx.recv() => match received {
                    Ok(event) => self.persist(&event, true),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "audit recorder lagged, events skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        // Drain whatever was published before the stop request.
        while let Ok(event) = rx.try_recv() {
            self.persist(&event, false);
        }
        if let Err(e) = self.sink.flush() {
            self.fail(e);
        }
        let failed = self.failures.load(Ordering::Acquire);
        debug!(written = self.written, failed, "audit recorder finished");
        match self.last_error {
            Some(last) => Err(LumosError::Audit(format!(
                "{failed} audit write(s) failed, last: {last}"
            ))),
            None => Ok(self.written),
        }
    }

    fn persist(&mut self, event: &Event, flush: bool) {
        let result = match self.sink.append(event) {
            Ok(()) if flush => self.sink.flush(),
            other => other,
        };
        match result {
            Ok(()) => {
                self.written += 1;
                if self.failing {
                    self.failing = false;
                    info!("audit log writable again");
                }
            }
            Err(e) => self.fail(e),
        }
    }

    fn fail(&mut self, e: LumosError) {
        self.failures.fetch_add(1, Ordering::AcqRel);
        error!(error = %e, "audit event could not be persisted");
        if !self.failing {
            self.failing = true;
            self.bus.publish(Event::new(
                AUDIT_SOURCE,
                EventPayload::SafetyEvent {
                    severity: Severity::Critical,
                    message: format!("audit log failing: {e}"),
                    occurred_at: Utc::now(),
                },
            ));
        }
        self.last_error = Some(e);
    }
}

/// Control handle for a running [`AuditRecorder`].
pub struct AuditRecorderHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    failures: Arc<AtomicU64>,
    task: JoinHandle<Result<u64, LumosError>>,
}

impl AuditRecorderHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Events the sink failed to persist so far.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Acquire)
    }

    /// Stop recording, drain queued events and return how many were written.
    ///
    /// # Errors
    ///
    /// [`LumosError::Audit`] if any event failed to persist, or
    /// [`LumosError::Channel`] if the task panicked.
    pub async fn stop(mut self) -> Result<u64, LumosError> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        match (&mut self.task).await {
            Ok(result) => {
                if let Err(e) = &result {
                    error!(error = %e, "audit recorder failed");
                }
                result
            }
            Err(e) => Err(LumosError::Channel(format!("audit recorder task: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use crate::bus::Topic;
    use lumos_types::SafetyState;

    fn event(state: SafetyState) -> Event {
        Event::new("lumos-test", EventPayload::StateChanged { state })
    }

    #[test]
    fn jsonl_appends_one_event_per_line() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("audit.jsonl");

        let mut log = JsonlAuditLog::open(&path)?;
        log.append(&event(SafetyState::Armed))?;
        log.append(&event(SafetyState::Treating))?;
        log.flush()?;

        let raw = fs::read_to_string(&path)?;
        assert_eq!(raw.lines().count(), 2);
        assert!(raw.lines().all(|l| l.contains("\"kind\":\"state_changed\"")));

        let events = JsonlAuditLog::read_all(&path)?;
        assert_eq!(
            events[1].payload,
            EventPayload::StateChanged {
                state: SafetyState::Treating
            }
        );
        Ok(())
    }

    #[test]
    fn reopening_never_truncates() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("audit.jsonl");
        {
            let mut log = JsonlAuditLog::open(&path)?;
            log.append(&event(SafetyState::Armed))?;
            log.flush()?;
        }
        let mut log = JsonlAuditLog::open(&path)?;
        log.append(&event(SafetyState::Safe))?;
        log.flush()?;
        assert_eq!(JsonlAuditLog::read_all(&path)?.len(), 2);
        Ok(())
    }

    #[test]
    fn malformed_line_is_reported() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("audit.jsonl");
        fs::write(&path, "{not json}\n")?;
        let err = JsonlAuditLog::read_all(&path).unwrap_err();
        assert!(matches!(err, LumosError::Audit(ref m) if m.contains("line 1")));
        Ok(())
    }

    #[tokio::test]
    async fn recorder_persists_bus_events() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("audit.jsonl");
        let bus = EventBus::default();
        let recorder = AuditRecorder::spawn(&bus, Box::new(JsonlAuditLog::open(&path)?));

        bus.publish(event(SafetyState::Armed));
        bus.publish(Event::new(
            "lumos-test",
            EventPayload::SafetyEvent {
                severity: Severity::Critical,
                message: "emergency stop asserted".to_string(),
                occurred_at: chrono::Utc::now(),
            },
        ));

        assert_eq!(recorder.stop().await?, 2);
        let events = JsonlAuditLog::read_all(&path)?;
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1].payload,
            EventPayload::SafetyEvent {
                severity: Severity::Critical,
                ..
            }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn memory_sink_shares_storage_between_clones() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let memory = MemoryAuditLog::new();
        let recorder = AuditRecorder::spawn(&bus, Box::new(memory.clone()));
        assert!(recorder.is_running());

        for state in [SafetyState::Armed, SafetyState::Safe] {
            bus.publish(event(state));
        }
        recorder.stop().await?;
        assert_eq!(memory.len(), 2);
        Ok(())
    }

    /// Rejects every append while `broken` is set.
    #[derive(Clone, Default)]
    struct SwitchableSink {
        broken: Arc<AtomicBool>,
        memory: MemoryAuditLog,
    }

    impl AuditSink for SwitchableSink {
        fn append(&mut self, event: &Event) -> Result<(), LumosError> {
            if self.broken.load(Ordering::Acquire) {
                return Err(LumosError::Audit("disk full".to_string()));
            }
            self.memory.append(event)
        }
    }

    #[tokio::test]
    async fn failing_sink_raises_one_alert_and_keeps_recording()
    -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut alerts = bus.subscribe_to(Topic::SafetyEvents);
        let sink = SwitchableSink::default();
        sink.broken.store(true, Ordering::Release);
        let recorder = AuditRecorder::spawn(&bus, Box::new(sink.clone()));

        bus.publish(event(SafetyState::Armed));
        bus.publish(event(SafetyState::Treating));

        let alert = tokio::time::timeout(Duration::from_secs(1), alerts.recv()).await??;
        assert_eq!(alert.source, AUDIT_SOURCE);
        assert!(matches!(
            alert.payload,
            EventPayload::SafetyEvent { severity: Severity::Critical, ref message, .. }
                if message.contains("disk full")
        ));

        // Both events and the alert itself fail to persist.
        for _ in 0..200 {
            if recorder.failures() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(recorder.failures(), 3);
        assert!(recorder.is_running());
        assert!(
            tokio::time::timeout(Duration::from_millis(50), alerts.recv())
                .await
                .is_err(),
            "one alert per failure streak"
        );

        sink.broken.store(false, Ordering::Release);
        bus.publish(event(SafetyState::Safe));

        let err = recorder.stop().await.unwrap_err();
        assert!(matches!(err, LumosError::Audit(ref m) if m.contains("3 audit write(s) failed")));
        let kept = sink.memory.events();
        assert_eq!(kept.len(), 1);
        assert_eq!(
            kept[0].payload,
            EventPayload::StateChanged {
                state: SafetyState::Safe
            }
        );
        Ok(())
    }
}
