//! The SQLite backend: an r2d2 pool of rusqlite connections.

use std::{
    fmt,
    path::PathBuf,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use r2d2::{HandleError, Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, ErrorCode};

use crate::{
    Error,
    config::ConnectionConfig,
    connection::{
        BackendConnection, CloseReason, ConnectionError, Connector, HealthEvent, HealthReporter,
    },
};

/// Consecutive checkout timeouts after which the pool is reported as broken.
///
/// A single timeout usually means every pooled connection is busy.
const CHECKOUT_TIMEOUTS_BEFORE_ERROR: u32 = 3;

/// Opens pooled connections to a SQLite database file.
///
/// Accepts URIs of the form `sqlite://<path>`, `file:<path>` or a bare path.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteConnector;

#[async_trait]
impl Connector for SqliteConnector {
    type Connection = SqliteConnection;

    async fn connect(
        &self,
        config: &ConnectionConfig,
        reporter: HealthReporter,
    ) -> Result<SqliteConnection, ConnectionError> {
        config
            .validate()
            .map_err(|error| ConnectionError::Misconfigured(error.to_string()))?;
        let path = database_path(config.uri.as_deref())?;
        let config = config.clone();

        tokio::task::spawn_blocking(move || open_pool(path, &config, reporter))
            .await
            .map_err(|error| ConnectionError::Transient(format!("connect task failed: {error}")))?
    }
}

fn database_path(uri: Option<&str>) -> Result<PathBuf, ConnectionError> {
    let uri = uri
        .map(str::trim)
        .filter(|uri| !uri.is_empty())
        .ok_or_else(|| {
            ConnectionError::Misconfigured("no connection URI is configured".to_owned())
        })?;

    let path = match uri.split_once("://") {
        Some(("sqlite", path)) => path,
        Some((scheme, _)) => {
            return Err(ConnectionError::Misconfigured(format!(
                "unsupported connection URI scheme \"{scheme}\""
            )));
        }
        // SQLite understands `file:` URIs itself.
        None => uri,
    };

    if path.strip_prefix("file:").unwrap_or(path).trim().is_empty() {
        return Err(ConnectionError::Misconfigured(
            "the connection URI has no database path".to_owned(),
        ));
    }

    Ok(PathBuf::from(path))
}

fn open_pool(
    path: PathBuf,
    config: &ConnectionConfig,
    reporter: HealthReporter,
) -> Result<SqliteConnection, ConnectionError> {
    let busy_timeout = config.socket_timeout;
    let synchronous = config.write_concern.synchronous_pragma();
    let manager = SqliteConnectionManager::file(&path).with_init(move |connection| {
        connection.busy_timeout(busy_timeout)?;
        connection.execute_batch(&format!("PRAGMA synchronous = {synchronous};"))
    });

    let pool = Pool::builder()
        .max_size(config.max_pool_size)
        .min_idle(Some(config.min_pool_size))
        .connection_timeout(config.connect_timeout)
        .idle_timeout(Some(config.max_idle_time))
        .error_handler(Box::new(reporter.clone()))
        .build(manager)
        .map_err(|error| {
            ConnectionError::Transient(format!("could not open {}: {error}", path.display()))
        })?;

    // The pool may not have opened anything yet if the minimum size is zero.
    pool.get()
        .map_err(|error| ConnectionError::Transient(error.to_string()))?
        .execute_batch("SELECT 1;")
        .map_err(|error| ConnectionError::Transient(error.to_string()))?;

    tracing::debug!("opened SQLite pool for {}: {:?}", path.display(), pool.state());

    Ok(SqliteConnection {
        pool,
        reporter,
        healthy: Arc::new(AtomicBool::new(true)),
        closed: Arc::new(OnceLock::new()),
        checkout_timeouts: Arc::new(AtomicU32::new(0)),
        retry_reads: config.retry_reads,
        retry_writes: config.retry_writes,
        write_timeout: config.write_concern_timeout,
    })
}

/// A pool of connections to one SQLite database.
///
/// Clones share the pool. Queries block, so async callers should run them on
/// a blocking thread, e.g. with [tokio::task::spawn_blocking].
#[derive(Clone)]
pub struct SqliteConnection {
    pool: Pool<SqliteConnectionManager>,
    reporter: HealthReporter,
    healthy: Arc<AtomicBool>,
    closed: Arc<OnceLock<CloseReason>>,
    checkout_timeouts: Arc<AtomicU32>,
    retry_reads: bool,
    retry_writes: bool,
    write_timeout: Duration,
}

impl SqliteConnection {
    /// Run `query`, which should only read, on a pooled connection.
    ///
    /// If read retries are enabled, a query that fails because the database
    /// is busy is run once more.
    ///
    /// # Errors
    /// Returns [ConnectionError::Closed] if the cache has been shut down,
    /// [ConnectionError::Transient] if the connection was replaced or no
    /// pooled connection became free in time, and [Error::SqlError] if the
    /// query failed.
    pub fn read<T, F>(&self, query: F) -> Result<T, Error>
    where
        F: Fn(&Connection) -> Result<T, rusqlite::Error>,
    {
        let connection = self.checkout(None)?;
        self.run(&connection, self.retry_reads, query)
    }

    /// Run `query`, which may write, on a pooled connection.
    ///
    /// Waits at most the write-concern timeout for a pooled connection. If
    /// write retries are enabled, a query that fails because the database is
    /// busy is run once more.
    ///
    /// # Errors
    /// See [SqliteConnection::read].
    pub fn write<T, F>(&self, query: F) -> Result<T, Error>
    where
        F: Fn(&Connection) -> Result<T, rusqlite::Error>,
    {
        let connection = self.checkout(Some(self.write_timeout))?;
        self.run(&connection, self.retry_writes, query)
    }

    fn checkout(
        &self,
        timeout: Option<Duration>,
    ) -> Result<PooledConnection<SqliteConnectionManager>, Error> {
        match self.closed.get() {
            Some(CloseReason::Shutdown) => return Err(ConnectionError::Closed.into()),
            Some(CloseReason::Replaced) => {
                return Err(
                    ConnectionError::Transient("connection was replaced".to_owned()).into(),
                );
            }
            None => {}
        }

        let connection = match timeout {
            Some(timeout) => self.pool.get_timeout(timeout),
            None => self.pool.get(),
        };

        match connection {
            Ok(connection) => {
                self.checkout_timeouts.store(0, Ordering::SeqCst);
                Ok(connection)
            }
            Err(error) => {
                let timeouts = self.checkout_timeouts.fetch_add(1, Ordering::SeqCst) + 1;

                if timeouts >= CHECKOUT_TIMEOUTS_BEFORE_ERROR {
                    tracing::error!(
                        "could not check out a SQLite connection {timeouts} times in a row: {error}"
                    );
                    self.healthy.store(false, Ordering::SeqCst);
                    self.reporter.report(HealthEvent::Error(error.to_string()));
                } else {
                    tracing::warn!("timed out waiting for a pooled SQLite connection: {error}");
                }

                Err(ConnectionError::Transient(error.to_string()).into())
            }
        }
    }

    fn run<T, F>(&self, connection: &Connection, retry: bool, query: F) -> Result<T, Error>
    where
        F: Fn(&Connection) -> Result<T, rusqlite::Error>,
    {
        let result = match query(connection) {
            Err(error) if retry && is_busy(&error) => {
                tracing::warn!("SQLite database is busy, retrying once: {error}");
                query(connection)
            }
            result => result,
        };

        result.map_err(|error| {
            if is_fatal(&error) {
                self.report_fatal(&error);
            }

            error.into()
        })
    }

    fn report_fatal(&self, error: &rusqlite::Error) {
        tracing::error!("SQLite connection is unusable: {error}");
        self.healthy.store(false, Ordering::SeqCst);
        self.reporter.report(HealthEvent::Error(error.to_string()));
    }
}

impl BackendConnection for SqliteConnection {
    fn is_healthy(&self) -> bool {
        self.closed.get().is_none() && self.healthy.load(Ordering::SeqCst)
    }

    fn close(&self, reason: CloseReason) {
        if self.closed.set(reason).is_ok() {
            tracing::debug!(
                "closed SQLite connection {} ({reason:?})",
                self.reporter.generation()
            );
        }
    }
}

impl fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("generation", &self.reporter.generation())
            .field("pool", &self.pool.state())
            .field("healthy", &self.healthy.load(Ordering::SeqCst))
            .field("closed", &self.closed.get())
            .finish()
    }
}

impl HandleError<rusqlite::Error> for HealthReporter {
    fn handle_error(&self, error: rusqlite::Error) {
        tracing::warn!("SQLite pool error: {error}");
        self.report(HealthEvent::Error(error.to_string()));
    }
}

/// Errors after which the connection cannot be trusted.
fn is_fatal(error: &rusqlite::Error) -> bool {
    matches!(
        error.sqlite_error_code(),
        Some(
            ErrorCode::SystemIoFailure
                | ErrorCode::DatabaseCorrupt
                | ErrorCode::NotADatabase
                | ErrorCode::CannotOpen
        )
    )
}

fn is_busy(error: &rusqlite::Error) -> bool {
    matches!(
        error.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, time::Duration};

    use rusqlite::ffi;
    use tempfile::TempDir;

    use crate::{
        ConnectionCache, Error,
        config::{ConnectionConfig, WriteConcern},
        connection::{
            BackendConnection, ConnectionError, ConnectionState,
            sqlite::{
                CHECKOUT_TIMEOUTS_BEFORE_ERROR, SqliteConnector, database_path, is_busy, is_fatal,
            },
        },
    };

    fn test_config(dir: &TempDir) -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: Duration::from_secs(2),
            retry_backoff: Duration::from_millis(10),
            ..ConnectionConfig::default()
        }
        .with_uri(format!("sqlite://{}", dir.path().join("test.db").display()))
    }

    #[test]
    fn parses_database_paths() {
        assert_eq!(
            database_path(Some("sqlite:///tmp/budget.db")).unwrap(),
            PathBuf::from("/tmp/budget.db")
        );
        assert_eq!(
            database_path(Some("budget.db")).unwrap(),
            PathBuf::from("budget.db")
        );
        assert_eq!(
            database_path(Some("file:budget.db?mode=rwc")).unwrap(),
            PathBuf::from("file:budget.db?mode=rwc")
        );
    }

    #[test]
    fn rejects_unusable_uris() {
        for uri in [None, Some(""), Some("sqlite://"), Some("file:"), Some("mongodb://host/db")] {
            let result = database_path(uri);

            assert!(
                matches!(result, Err(ConnectionError::Misconfigured(_))),
                "expected {uri:?} to be rejected, got {result:?}"
            );
        }
    }

    #[test]
    fn classifies_errors() {
        let io_error = rusqlite::Error::SqliteFailure(ffi::Error::new(ffi::SQLITE_IOERR), None);
        let busy_error = rusqlite::Error::SqliteFailure(ffi::Error::new(ffi::SQLITE_BUSY), None);

        assert!(is_fatal(&io_error));
        assert!(!is_busy(&io_error));
        assert!(is_busy(&busy_error));
        assert!(!is_fatal(&busy_error));
        assert!(!is_fatal(&rusqlite::Error::QueryReturnedNoRows));
    }

    #[tokio::test]
    async fn reads_and_writes_through_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ConnectionCache::new(SqliteConnector, test_config(&dir));

        let connection = cache.acquire().await.unwrap();
        connection
            .write(|conn| conn.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (42);"))
            .unwrap();
        let value: i64 = connection
            .read(|conn| conn.query_row("SELECT x FROM t", (), |row| row.get(0)))
            .unwrap();

        assert_eq!(value, 42);
        assert!(connection.is_healthy());
        assert_eq!(cache.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn applies_connection_settings() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConnectionConfig {
            socket_timeout: Duration::from_millis(1500),
            write_concern: WriteConcern::Acknowledged,
            ..test_config(&dir)
        };
        let cache = ConnectionCache::new(SqliteConnector, config);
        let connection = cache.acquire().await.unwrap();

        let (busy_timeout, synchronous): (i64, i64) = connection
            .read(|conn| {
                let busy_timeout = conn.query_row("PRAGMA busy_timeout", (), |row| row.get(0))?;
                let synchronous = conn.query_row("PRAGMA synchronous", (), |row| row.get(0))?;
                Ok((busy_timeout, synchronous))
            })
            .unwrap();

        assert_eq!(busy_timeout, 1500);
        // NORMAL
        assert_eq!(synchronous, 1);
    }

    #[tokio::test]
    async fn unsupported_scheme_is_not_retried() {
        let config = ConnectionConfig::default().with_uri("postgres://localhost/budget");
        let cache = ConnectionCache::new(SqliteConnector, config);

        let error = cache.acquire().await.unwrap_err();

        assert!(matches!(error, ConnectionError::Misconfigured(_)));
        assert_eq!(cache.connect_attempts(), 1);
        assert_eq!(cache.retry_count(), 0);
    }

    #[tokio::test]
    async fn unreachable_database_exhausts_retries() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConnectionConfig {
            connect_timeout: Duration::from_millis(200),
            retry_backoff: Duration::from_millis(10),
            max_retries: 2,
            ..ConnectionConfig::default()
        }
        .with_uri(
            dir.path()
                .join("missing")
                .join("nested")
                .join("test.db")
                .display()
                .to_string(),
        );
        let cache = ConnectionCache::new(SqliteConnector, config);

        let error = cache.acquire().await.unwrap_err();

        assert!(
            matches!(error, ConnectionError::Exhausted { attempts: 2, .. }),
            "got {error:?}"
        );
        assert_eq!(cache.state(), ConnectionState::Unconnected);
    }

    #[tokio::test]
    async fn fatal_error_degrades_the_cached_connection() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ConnectionCache::new(SqliteConnector, test_config(&dir));
        let connection = cache.acquire().await.unwrap();

        connection.report_fatal(&rusqlite::Error::SqliteFailure(
            ffi::Error::new(ffi::SQLITE_IOERR),
            None,
        ));

        assert!(!connection.is_healthy());
        assert_eq!(cache.state(), ConnectionState::Degraded);

        let fresh = cache.acquire().await.unwrap();
        assert!(fresh.is_healthy());
        assert_eq!(cache.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn replaced_connection_refuses_queries_as_transient() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ConnectionCache::new(SqliteConnector, test_config(&dir));
        let stale = cache.acquire().await.unwrap();

        stale.report_fatal(&rusqlite::Error::SqliteFailure(
            ffi::Error::new(ffi::SQLITE_IOERR),
            None,
        ));
        let fresh = cache.acquire().await.unwrap();
        let result = stale.read(|conn| conn.execute_batch("SELECT 1;"));

        match result {
            Err(Error::Connection(ConnectionError::Transient(reason))) => {
                assert_eq!(reason, "connection was replaced");
            }
            other => panic!("expected a transient error, got {other:?}"),
        }
        assert!(fresh.read(|conn| conn.execute_batch("SELECT 1;")).is_ok());
        assert_eq!(cache.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn saturated_pool_times_out_without_dropping_the_connection() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConnectionConfig {
            min_pool_size: 1,
            max_pool_size: 1,
            write_concern_timeout: Duration::from_millis(50),
            ..test_config(&dir)
        };
        let cache = ConnectionCache::new(SqliteConnector, config);
        let connection = cache.acquire().await.unwrap();
        let busy = connection.pool.get().unwrap();

        for _ in 1..CHECKOUT_TIMEOUTS_BEFORE_ERROR {
            let result = connection.write(|conn| conn.execute_batch("SELECT 1;"));

            assert!(matches!(
                result,
                Err(Error::Connection(ConnectionError::Transient(_)))
            ));
            assert!(connection.is_healthy());
            assert_eq!(cache.state(), ConnectionState::Ready);
        }

        let result = connection.write(|conn| conn.execute_batch("SELECT 1;"));

        assert!(matches!(
            result,
            Err(Error::Connection(ConnectionError::Transient(_)))
        ));
        assert!(!connection.is_healthy());
        assert_eq!(cache.state(), ConnectionState::Degraded);
        drop(busy);
    }

    #[tokio::test]
    async fn successful_checkout_resets_the_timeout_count() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConnectionConfig {
            min_pool_size: 1,
            max_pool_size: 1,
            write_concern_timeout: Duration::from_millis(50),
            ..test_config(&dir)
        };
        let cache = ConnectionCache::new(SqliteConnector, config);
        let connection = cache.acquire().await.unwrap();

        for _ in 0..CHECKOUT_TIMEOUTS_BEFORE_ERROR {
            let busy = connection.pool.get().unwrap();
            assert!(connection.write(|conn| conn.execute_batch("SELECT 1;")).is_err());
            drop(busy);
            assert!(connection.write(|conn| conn.execute_batch("SELECT 1;")).is_ok());
        }

        assert!(connection.is_healthy());
        assert_eq!(cache.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn closed_connection_refuses_queries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ConnectionCache::new(SqliteConnector, test_config(&dir));
        let connection = cache.acquire().await.unwrap();

        cache.shutdown();
        let result = connection.read(|conn| conn.execute_batch("SELECT 1;"));

        assert!(matches!(
            result,
            Err(Error::Connection(ConnectionError::Closed))
        ));
        assert!(!connection.is_healthy());
    }
}
