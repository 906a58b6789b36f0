//! Small tokio building blocks shared by the Sphere wallet engine: named
//! tasks, coalescing notifications, one-shot shutdown signals, and a
//! broadcast events bus.

/// Broadcast-backed events bus.
pub mod events_bus;
/// Coalescing notification channel.
pub mod notify;
/// One-shot multi-consumer shutdown signal.
pub mod notify_once;
/// Named task handles which propagate panics.
pub mod task;

/// Default channel capacity for the events bus.
pub const DEFAULT_CHANNEL_SIZE: usize = 256;
