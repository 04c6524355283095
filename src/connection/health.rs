//! Health events raised by a backend connection after it has been handed out.
//!
//! Drivers report problems from wherever they notice them (a pool error
//! handler, a failed query). The events are queued on a channel and applied
//! by the [ConnectionCache](crate::ConnectionCache) under its own lock.

use tokio::sync::mpsc::UnboundedSender;

/// A change in the health of a backend connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    /// The connection hit an error and should not be reused.
    Error(String),
    /// The connection to the store was lost.
    Disconnected,
    /// The driver restored a lost connection on its own.
    Reconnected,
    /// The driver (re)established the connection on its own.
    Connected,
}

/// Sends [HealthEvent]s for one connection back to the cache that created it.
///
/// Each reporter is stamped with the generation of the connection it belongs
/// to, so events from a connection that has since been replaced are ignored.
#[derive(Debug, Clone)]
pub struct HealthReporter {
    generation: u64,
    sender: UnboundedSender<(u64, HealthEvent)>,
}

impl HealthReporter {
    pub(crate) fn new(generation: u64, sender: UnboundedSender<(u64, HealthEvent)>) -> Self {
        Self { generation, sender }
    }

    /// The generation of the connection this reporter belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue `event` for the cache.
    pub fn report(&self, event: HealthEvent) {
        if self.sender.send((self.generation, event)).is_err() {
            tracing::debug!(
                "dropped health event for connection {}, the cache is gone",
                self.generation
            );
        }
    }
}
