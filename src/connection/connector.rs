//! The seam between the [ConnectionCache](crate::ConnectionCache) and a
//! concrete backend store.

use async_trait::async_trait;

use crate::{
    config::ConnectionConfig,
    connection::{ConnectionError, health::HealthReporter},
};

/// Establishes connections to a backend store.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The connection handed out to callers.
    type Connection: BackendConnection;

    /// Open a new connection using `config`.
    ///
    /// The connection should keep `reporter` and use it to report errors and
    /// disconnects that happen after it has been handed out.
    ///
    /// # Errors
    /// Return [ConnectionError::Misconfigured] for problems that retrying
    /// cannot fix (a missing or malformed URI). Any other error is treated as
    /// transient and retried.
    async fn connect(
        &self,
        config: &ConnectionConfig,
        reporter: HealthReporter,
    ) -> Result<Self::Connection, ConnectionError>;
}

/// A live connection (or connection pool) to the backend store.
///
/// Clones share the same underlying connection.
pub trait BackendConnection: Clone + Send + Sync + 'static {
    /// Whether the connection still looks usable.
    ///
    /// This must be a cheap, local check: it is called on every `acquire` and
    /// must not make a round trip to the store.
    fn is_healthy(&self) -> bool;

    /// Close the connection. Later operations on any clone should fail, with
    /// an error that depends on `reason`.
    fn close(&self, reason: CloseReason);
}

/// Why the cache closed a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The connection was dropped after a health event or a new connection
    /// took its place. The cache itself is still usable.
    Replaced,
    /// The cache was shut down.
    Shutdown,
}
