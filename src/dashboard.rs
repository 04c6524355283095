//! Loads a user's dashboard from the database.

use time::OffsetDateTime;

use crate::{
    Error,
    connection::{ConnectionCache, Connector, sqlite::SqliteConnection},
    ledger::{DashboardSummary, summarize},
    transaction::get_transactions_for_user,
    user::UserID,
};

/// Fetch every transaction for `user_id` and summarize them as seen at `now`.
///
/// A connection is acquired from `cache` on every call, so a connection that
/// went bad between calls is replaced rather than reused.
///
/// # Errors
/// Returns an [Error::Connection] if no connection could be acquired, an
/// [Error::SqlError] if the query failed, or an [Error::Aggregation] if a
/// stored transaction is malformed.
pub async fn load_dashboard<C>(
    cache: &ConnectionCache<C>,
    user_id: UserID,
    now: OffsetDateTime,
) -> Result<DashboardSummary, Error>
where
    C: Connector<Connection = SqliteConnection>,
{
    let connection = cache.acquire().await?;

    let records = tokio::task::spawn_blocking(move || {
        connection.read(|conn| get_transactions_for_user(user_id, conn))
    })
    .await
    .map_err(|error| Error::TaskFailed(error.to_string()))??;

    tracing::debug!("summarizing {} transactions for user {user_id}", records.len());

    Ok(summarize(&records, now)?)
}
