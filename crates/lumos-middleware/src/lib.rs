//! `lumos-middleware` – The Nervous System
//!
//! Routes notifications from the kernel and the engine to whoever listens,
//! without caring about their meaning.
//!
//! # Modules
//!
//! - [`bus`] – Headless, topic-based publish/subscribe event bus built on
//!   Tokio broadcast channels.
//! - [`observer`] – [`BusObserver`][observer::BusObserver]: the
//!   `ExecutionObserver` that publishes every callback onto the bus.
//! - [`audit`] – append-only audit sinks (JSON lines, in-memory) and the
//!   recorder task that drains the bus into them.

pub mod audit;
pub mod bus;
pub mod observer;

pub use audit::{AuditRecorder, AuditRecorderHandle, AuditSink, JsonlAuditLog, MemoryAuditLog};
pub use bus::{EventBus, Topic, TopicReceiver};
pub use observer::BusObserver;
