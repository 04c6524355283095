//! A process-wide cache for the single connection to the backend store.
//!
//! Request handlers call [ConnectionCache::acquire] before every operation on
//! the store. The cache hands out the live connection when there is one and
//! otherwise runs one connection attempt (with bounded retries) on behalf of
//! every caller that is waiting for it.
//!
//! State transitions:
//!
//! ```text
//! Unconnected -> Connecting -> Ready
//!                     |
//!                     +-> Unconnected (attempt failed, retry after backoff)
//!                     +-> Unconnected (retries exhausted / misconfigured)
//!
//! Ready -> Degraded      (health error, cheap health check failed)
//! Ready | Degraded -> Unconnected (disconnected)
//! Degraded -> Ready      (driver reconnected on its own)
//! any -> Closed          (shutdown)
//! ```

mod connector;
mod health;
pub mod sqlite;

use std::{
    fmt::Display,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU32, Ordering},
    },
};

use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    watch,
};

use crate::config::ConnectionConfig;

pub use connector::{BackendConnection, CloseReason, Connector};
pub use health::{HealthEvent, HealthReporter};

/// The errors returned by [ConnectionCache::acquire].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// The connection settings are missing or invalid. Retrying will not help.
    #[error("the backend store is misconfigured: {0}")]
    Misconfigured(String),

    /// A timeout, refused connection or dropped connection.
    ///
    /// The cache retries these itself, callers only see this if an attempt
    /// was abandoned before it could finish.
    #[error("transient connection failure: {0}")]
    Transient(String),

    /// Every connect attempt failed.
    ///
    /// The cache stays usable: the next call to `acquire` starts a fresh
    /// round of attempts.
    #[error("could not connect to the backend store after {attempts} attempts: {last_error}")]
    Exhausted {
        /// The number of physical connect attempts that were made.
        attempts: u32,
        /// The error from the final attempt.
        last_error: String,
    },

    /// The cache was used after [ConnectionCache::shutdown].
    #[error("the connection cache has been shut down")]
    Closed,
}

/// The lifecycle state of the cached connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// There is no connection and no attempt is running.
    Unconnected,
    /// A connect attempt is running.
    Connecting,
    /// The connection can be handed out.
    Ready,
    /// The connection is suspected broken and will be replaced on the next
    /// `acquire`.
    Degraded,
    /// The cache has been shut down.
    Closed,
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Unconnected => "unconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Closed => "closed",
        };

        write!(f, "{name}")
    }
}

/// A possibly absent connection plus its health state.
///
/// The connection is present iff the state is [ConnectionState::Ready] or
/// [ConnectionState::Degraded]. A degraded connection is kept only so that it
/// can be closed when it is replaced, it is never handed out.
#[derive(Debug)]
pub struct ResourceHandle<T> {
    connection: Option<T>,
    state: ConnectionState,
}

impl<T: BackendConnection> ResourceHandle<T> {
    fn unconnected() -> Self {
        Self {
            connection: None,
            state: ConnectionState::Unconnected,
        }
    }

    /// The current state of the handle.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The connection, if it is ready to be handed out.
    pub fn ready_connection(&self) -> Option<&T> {
        match self.state {
            ConnectionState::Ready => self.connection.as_ref(),
            _ => None,
        }
    }

    fn set_ready(&mut self, connection: T) {
        self.close_connection(CloseReason::Replaced);
        self.connection = Some(connection);
        self.state = ConnectionState::Ready;
    }

    fn degrade(&mut self) {
        if self.state == ConnectionState::Ready {
            self.state = ConnectionState::Degraded;
        }
    }

    fn restore(&mut self) {
        if self.state == ConnectionState::Degraded && self.connection.is_some() {
            self.state = ConnectionState::Ready;
        }
    }

    /// Close any connection and move to `state`, which must not be `Ready` or
    /// `Degraded`.
    fn reset(&mut self, state: ConnectionState) {
        let reason = match state {
            ConnectionState::Closed => CloseReason::Shutdown,
            _ => CloseReason::Replaced,
        };

        self.close_connection(reason);
        self.state = state;
    }

    fn close_connection(&mut self, reason: CloseReason) {
        if let Some(connection) = self.connection.take() {
            connection.close(reason);
        }
    }
}

/// Outcome of one round of connect attempts, shared with every waiter.
type AttemptOutcome = Option<Result<(), ConnectionError>>;

struct Inner<T> {
    handle: ResourceHandle<T>,
    /// Bumped for every physical connect attempt.
    generation: u64,
    /// Set while a round of connect attempts is running.
    in_flight: Option<watch::Receiver<AttemptOutcome>>,
    /// Failed attempts in the current round, at most `max_retries`.
    retry_count: u32,
    health_events: UnboundedReceiver<(u64, HealthEvent)>,
}

impl<T: BackendConnection> Inner<T> {
    /// Apply queued health events in the order they were reported.
    fn apply_health_events(&mut self) {
        while let Ok((generation, event)) = self.health_events.try_recv() {
            if generation != self.generation {
                tracing::debug!(
                    "ignoring {event:?} from connection {generation}, the current connection is {}",
                    self.generation
                );
                continue;
            }

            let previous = self.handle.state();

            match event {
                HealthEvent::Error(message) => {
                    self.handle.degrade();
                    tracing::warn!("backend connection reported an error: {message}");
                }
                HealthEvent::Disconnected => {
                    if matches!(previous, ConnectionState::Ready | ConnectionState::Degraded) {
                        self.handle.reset(ConnectionState::Unconnected);
                    }
                    tracing::warn!("backend connection was lost");
                }
                HealthEvent::Reconnected | HealthEvent::Connected => {
                    self.handle.restore();
                    tracing::info!("backend connection was restored by the driver");
                }
            }

            if previous != self.handle.state() {
                tracing::debug!(
                    "connection state changed from {previous} to {}",
                    self.handle.state()
                );
            }
        }
    }
}

struct Shared<C: Connector> {
    connector: C,
    config: ConnectionConfig,
    inner: Mutex<Inner<C::Connection>>,
    health_sender: UnboundedSender<(u64, HealthEvent)>,
    connect_attempts: AtomicU32,
}

/// Owns the single connection to the backend store and hands it out to
/// callers.
///
/// Construct one at start-up and pass clones to request handlers, clones share
/// the same state. At most one connect attempt runs at a time, every caller
/// that asks for a connection while it runs gets that attempt's outcome.
pub struct ConnectionCache<C: Connector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for ConnectionCache<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Connector> ConnectionCache<C> {
    /// Create a cache that connects with `connector`.
    ///
    /// No connection is made until the first call to [ConnectionCache::acquire].
    pub fn new(connector: C, config: ConnectionConfig) -> Self {
        let (health_sender, health_events) = mpsc::unbounded_channel();

        Self {
            shared: Arc::new(Shared {
                connector,
                config,
                inner: Mutex::new(Inner {
                    handle: ResourceHandle::unconnected(),
                    generation: 0,
                    in_flight: None,
                    retry_count: 0,
                    health_events,
                }),
                health_sender,
                connect_attempts: AtomicU32::new(0),
            }),
        }
    }

    /// Get a connection that is ready to use, connecting first if needed.
    ///
    /// Returns straight away if the cached connection is ready and healthy.
    /// Otherwise waits for the running connect attempt, or starts one. Dropping
    /// the returned future does not cancel the attempt for other callers.
    ///
    /// # Errors
    /// - [ConnectionError::Misconfigured] if there is no connection URI or the
    ///   connector rejected the settings. No retries are made.
    /// - [ConnectionError::Exhausted] if every attempt failed.
    /// - [ConnectionError::Closed] if the cache has been shut down.
    /// - [ConnectionError::Transient] if the attempt was abandoned without an
    ///   outcome.
    pub async fn acquire(&self) -> Result<C::Connection, ConnectionError> {
        loop {
            let mut outcome_receiver = {
                let mut inner = self.lock_inner();
                inner.apply_health_events();

                match inner.handle.state() {
                    ConnectionState::Closed => return Err(ConnectionError::Closed),
                    ConnectionState::Ready => {
                        if let Some(connection) = inner
                            .handle
                            .ready_connection()
                            .filter(|connection| connection.is_healthy())
                        {
                            tracing::debug!("reusing cached backend connection");
                            return Ok(connection.clone());
                        }

                        tracing::warn!("cached backend connection failed its health check");
                        inner.handle.degrade();
                    }
                    _ => {}
                }

                match &inner.in_flight {
                    Some(receiver) => receiver.clone(),
                    None => {
                        if self.shared.config.uri.is_none() {
                            tracing::error!(
                                "cannot connect to the backend store: no connection URI is configured"
                            );
                            return Err(ConnectionError::Misconfigured(
                                "no connection URI is configured".to_owned(),
                            ));
                        }

                        self.start_attempt(&mut inner)
                    }
                }
            };

            let outcome = outcome_receiver
                .wait_for(Option::is_some)
                .await
                .map(|outcome| outcome.clone());

            match outcome {
                // Another caller's health event may have landed since the
                // attempt succeeded, so check the state again.
                Ok(Some(Ok(()))) => continue,
                Ok(Some(Err(error))) => return Err(error),
                Ok(None) | Err(_) => {
                    let mut inner = self.lock_inner();
                    let abandoned = inner
                        .in_flight
                        .as_ref()
                        .is_some_and(|receiver| receiver.same_channel(&outcome_receiver));
                    if abandoned {
                        inner.in_flight = None;
                        if inner.handle.state() == ConnectionState::Connecting {
                            inner.handle.reset(ConnectionState::Unconnected);
                        }
                    }

                    tracing::error!("connection attempt ended without an outcome");
                    return Err(ConnectionError::Transient(
                        "the connection attempt was abandoned".to_owned(),
                    ));
                }
            }
        }
    }

    /// Close the connection and refuse any further `acquire` calls.
    ///
    /// Calling this more than once has no further effect.
    pub fn shutdown(&self) {
        let mut inner = self.lock_inner();

        if inner.handle.state() == ConnectionState::Closed {
            return;
        }

        inner.handle.reset(ConnectionState::Closed);
        tracing::info!("connection cache shut down");
    }

    /// The current state of the cached connection.
    pub fn state(&self) -> ConnectionState {
        let mut inner = self.lock_inner();
        inner.apply_health_events();
        inner.handle.state()
    }

    /// Failed connect attempts in the current or most recent round.
    ///
    /// Never exceeds the configured `max_retries`. Reset when a round starts
    /// and when a connection becomes ready.
    pub fn retry_count(&self) -> u32 {
        self.lock_inner().retry_count
    }

    /// Total physical connect attempts made by this cache.
    pub fn connect_attempts(&self) -> u32 {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner<C::Connection>> {
        self.shared.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("connection cache lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Spawn a round of connect attempts. The caller must hold the lock and
    /// have checked that no round is in flight.
    fn start_attempt(&self, inner: &mut Inner<C::Connection>) -> watch::Receiver<AttemptOutcome> {
        let (sender, receiver) = watch::channel(None);
        inner.in_flight = Some(receiver.clone());
        inner.retry_count = 0;
        inner.handle.reset(ConnectionState::Connecting);

        let cache = self.clone();
        tokio::spawn(async move {
            let outcome = cache.connect_with_retries().await;

            let mut inner = cache.lock_inner();
            inner.in_flight = None;
            sender.send_replace(Some(outcome));
        });

        receiver
    }

    async fn connect_with_retries(&self) -> Result<(), ConnectionError> {
        let config = &self.shared.config;

        loop {
            let (reporter, attempt) = {
                let mut inner = self.lock_inner();
                if inner.handle.state() == ConnectionState::Closed {
                    return Err(ConnectionError::Closed);
                }

                inner.handle.reset(ConnectionState::Connecting);
                inner.generation += 1;
                let reporter =
                    HealthReporter::new(inner.generation, self.shared.health_sender.clone());
                (reporter, inner.retry_count + 1)
            };

            self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);
            tracing::info!(
                "connecting to the backend store (attempt {attempt} of {})",
                config.max_retries
            );

            let result = tokio::time::timeout(
                config.connect_timeout,
                self.shared.connector.connect(config, reporter),
            )
            .await
            .unwrap_or_else(|_| {
                Err(ConnectionError::Transient(format!(
                    "connect timed out after {:?}",
                    config.connect_timeout
                )))
            });

            let error = match result {
                Ok(connection) => {
                    let mut inner = self.lock_inner();
                    if inner.handle.state() == ConnectionState::Closed {
                        connection.close(CloseReason::Shutdown);
                        return Err(ConnectionError::Closed);
                    }

                    // Events raised while connecting describe the attempt, not the
                    // connection being handed out.
                    inner.apply_health_events();
                    inner.handle.set_ready(connection);
                    inner.retry_count = 0;
                    tracing::info!("connected to the backend store");
                    return Ok(());
                }
                Err(ConnectionError::Misconfigured(reason)) => {
                    let mut inner = self.lock_inner();
                    if inner.handle.state() != ConnectionState::Closed {
                        inner.handle.reset(ConnectionState::Unconnected);
                    }

                    tracing::error!("the backend store is misconfigured: {reason}");
                    return Err(ConnectionError::Misconfigured(reason));
                }
                Err(ConnectionError::Transient(reason)) => reason,
                Err(error) => error.to_string(),
            };

            let attempts = {
                let mut inner = self.lock_inner();
                inner.retry_count += 1;
                if inner.handle.state() != ConnectionState::Closed {
                    inner.handle.reset(ConnectionState::Unconnected);
                }
                inner.retry_count
            };

            if attempts >= config.max_retries {
                tracing::error!(
                    "giving up on the backend store after {attempts} attempts: {error}"
                );
                return Err(ConnectionError::Exhausted {
                    attempts,
                    last_error: error,
                });
            }

            tracing::warn!(
                "connect attempt {attempts} failed: {error}, retrying in {:?}",
                config.retry_backoff
            );
            tokio::time::sleep(config.retry_backoff).await;
        }
    }
}
