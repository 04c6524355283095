//! Pocketbook is the core of a personal finance tracker.
//!
//! This library provides a retrying, self-healing cache for the database
//! connection and the aggregation that turns a user's income and expense
//! records into their dashboard.

#![warn(missing_docs)]

use tokio::signal;

mod auth_token;
mod config;
mod connection;
mod dashboard;
mod database_id;
mod ledger;
mod timezone;
mod transaction;
mod user;

pub use auth_token::{RESET_TOKEN_LIFETIME, ResetToken, TokenError, VerificationToken};
pub use config::{ConfigError, ConnectionConfig, WriteConcern};
pub use connection::{
    BackendConnection, CloseReason, ConnectionCache, ConnectionError, ConnectionState, Connector,
    HealthEvent, HealthReporter, ResourceHandle,
    sqlite::{SqliteConnection, SqliteConnector},
};
pub use dashboard::load_dashboard;
pub use database_id::DatabaseID;
pub use ledger::{
    AggregationError, CategoryTotal, DashboardSummary, LedgerEntry, MAX_AMOUNT,
    MAX_DECIMAL_PLACES, MonthlyTotals, RECENT_TRANSACTION_COUNT, SERIES_MONTHS,
    TransactionRecord, TransactionType, UNCATEGORIZED_LABEL, summarize,
};
pub use timezone::now_in_timezone;
pub use transaction::{
    NewTransaction, create_transaction_table, get_transactions_for_user, insert_transaction,
};
pub use user::UserID;

/// An async task that waits for either the ctrl+c or terminate signal, whichever comes first, and
/// then shuts down `cache`.
///
/// If a signal handler cannot be installed, only the other signal is waited for.
pub async fn shutdown_on_signal<C: Connector>(cache: ConnectionCache<C>) {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {error}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::error!("failed to install signal handler: {error}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::debug!("Received ctrl+c signal.");
        },
        _ = terminate => {
            tracing::debug!("Received terminate signal.");
        },
    }

    cache.shutdown();
}

/// The errors that may occur in the application.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum Error {
    /// The connection settings are invalid.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// No usable database connection could be acquired.
    #[error("database connection failed: {0}")]
    Connection(#[from] ConnectionError),

    /// A stored transaction could not be summarized.
    #[error(transparent)]
    Aggregation(#[from] AggregationError),

    /// An unhandled/unexpected SQL error.
    #[error("an unexpected SQL error occurred: {0}")]
    SqlError(rusqlite::Error),

    /// An error occurred while getting the local timezone from a canonical timezone string.
    #[error("invalid timezone {0}")]
    InvalidTimezoneError(String),

    /// A blocking task panicked or was cancelled.
    #[error("a background task failed: {0}")]
    TaskFailed(String),
}

impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        tracing::error!("an unhandled SQL error occurred: {}", value);
        Error::SqlError(value)
    }
}

#[cfg(test)]
mod tests {
    use crate::{ConnectionError, Error};

    #[test]
    fn sql_errors_are_wrapped() {
        let error = Error::from(rusqlite::Error::QueryReturnedNoRows);

        assert_eq!(error, Error::SqlError(rusqlite::Error::QueryReturnedNoRows));
    }

    #[test]
    fn connection_errors_convert() {
        let error: Error = ConnectionError::Closed.into();

        assert_eq!(error.to_string(), "database connection failed: the connection cache has been shut down");
    }
}
