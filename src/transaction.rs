//! Storing and fetching a user's transactions.
//!
//! Values are written in a canonical form but read back as raw text, so that a
//! malformed row is reported by [crate::ledger::summarize] instead of being
//! silently dropped here.

use rusqlite::{Connection, Row};
use rust_decimal::Decimal;
use time::Date;

use crate::{
    ledger::{TransactionRecord, TransactionType},
    user::UserID,
};

/// Builder for a transaction that has not been stored yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    user_id: UserID,
    transaction_type: TransactionType,
    amount: Decimal,
    date: Date,
    description: Option<String>,
    category: Option<String>,
}

impl NewTransaction {
    /// Start building a transaction for `user_id`.
    pub fn build(
        user_id: UserID,
        transaction_type: TransactionType,
        amount: Decimal,
        date: Date,
    ) -> Self {
        Self {
            user_id,
            transaction_type,
            amount,
            date,
            description: None,
            category: None,
        }
    }

    /// Set what the transaction was for.
    pub fn description(mut self, description: &str) -> Self {
        self.description = Some(description.to_owned());
        self
    }

    /// Set the category.
    pub fn category(mut self, category: &str) -> Self {
        self.category = Some(category.to_owned());
        self
    }
}

/// Create the transaction table.
///
/// # Errors
/// Returns an error if the table cannot be created or if there is an SQL error.
pub fn create_transaction_table(connection: &Connection) -> Result<(), rusqlite::Error> {
    connection.execute_batch(
        "CREATE TABLE IF NOT EXISTS \"transaction\" (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                type TEXT NOT NULL,
                amount TEXT NOT NULL,
                description TEXT,
                category TEXT,
                date TEXT NOT NULL
                );
        CREATE INDEX IF NOT EXISTS idx_transaction_user_date ON \"transaction\"(user_id, date);",
    )
}

/// Store a new transaction and return it as it was saved.
///
/// # Errors
/// Returns an error if the insert failed.
pub fn insert_transaction(
    transaction: NewTransaction,
    connection: &Connection,
) -> Result<TransactionRecord, rusqlite::Error> {
    connection
        .prepare(
            "INSERT INTO \"transaction\" (user_id, type, amount, description, category, date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             RETURNING id, user_id, type, amount, description, category, date",
        )?
        .query_row(
            (
                transaction.user_id.as_i64(),
                transaction.transaction_type.as_str(),
                transaction.amount.to_string(),
                transaction.description,
                transaction.category,
                transaction.date.to_string(),
            ),
            map_transaction_row,
        )
}

/// Get every transaction belonging to `user_id`, newest first.
///
/// # Errors
/// Returns an error if the query failed.
pub fn get_transactions_for_user(
    user_id: UserID,
    connection: &Connection,
) -> Result<Vec<TransactionRecord>, rusqlite::Error> {
    connection
        .prepare(
            "SELECT id, user_id, type, amount, description, category, date
             FROM \"transaction\"
             WHERE user_id = :user_id
             ORDER BY date DESC, id DESC",
        )?
        .query_map(&[(":user_id", &user_id.as_i64())], map_transaction_row)?
        .collect()
}

/// Map a database row to a [TransactionRecord].
///
/// Every column is read as text so that values written by other tools survive
/// until validation.
fn map_transaction_row(row: &Row) -> Result<TransactionRecord, rusqlite::Error> {
    Ok(TransactionRecord {
        id: row.get(0)?,
        user_id: UserID::new(row.get(1)?),
        transaction_type: row.get(2)?,
        amount: row.get(3)?,
        description: row.get(4)?,
        category: row.get(5)?,
        date: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;
    use rust_decimal::Decimal;
    use time::macros::date;

    use crate::{
        ledger::{TransactionRecord, TransactionType},
        transaction::{
            NewTransaction, create_transaction_table, get_transactions_for_user,
            insert_transaction,
        },
        user::UserID,
    };

    fn get_test_connection() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        create_transaction_table(&conn).unwrap();
        conn
    }

    #[test]
    fn create_table_is_idempotent() {
        let conn = get_test_connection();

        assert!(create_transaction_table(&conn).is_ok());
    }

    #[test]
    fn insert_returns_stored_record() {
        let conn = get_test_connection();
        let user_id = UserID::new(1);

        let record = insert_transaction(
            NewTransaction::build(
                user_id,
                TransactionType::Expense,
                Decimal::new(1250, 2),
                date!(2024 - 01 - 10),
            )
            .description("groceries")
            .category("food"),
            &conn,
        )
        .unwrap();

        assert_eq!(
            record,
            TransactionRecord {
                id: 1,
                user_id,
                transaction_type: "EXPENSE".to_owned(),
                amount: "12.50".to_owned(),
                description: Some("groceries".to_owned()),
                category: Some("food".to_owned()),
                date: "2024-01-10".to_owned(),
            }
        );
    }

    #[test]
    fn get_transactions_for_user_returns_newest_first() {
        let conn = get_test_connection();
        let user_id = UserID::new(1);
        let amount = Decimal::ONE;

        for date in [
            date!(2024 - 01 - 05),
            date!(2024 - 03 - 01),
            date!(2024 - 02 - 10),
        ] {
            insert_transaction(
                NewTransaction::build(user_id, TransactionType::Income, amount, date),
                &conn,
            )
            .unwrap();
        }

        let dates: Vec<_> = get_transactions_for_user(user_id, &conn)
            .unwrap()
            .into_iter()
            .map(|record| record.date)
            .collect();

        assert_eq!(dates, ["2024-03-01", "2024-02-10", "2024-01-05"]);
    }

    #[test]
    fn get_transactions_for_user_excludes_other_users() {
        let conn = get_test_connection();
        let date = date!(2024 - 01 - 05);
        insert_transaction(
            NewTransaction::build(UserID::new(1), TransactionType::Income, Decimal::TEN, date),
            &conn,
        )
        .unwrap();
        insert_transaction(
            NewTransaction::build(UserID::new(2), TransactionType::Expense, Decimal::new(2, 0), date),
            &conn,
        )
        .unwrap();

        let records = get_transactions_for_user(UserID::new(2), &conn).unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].user_id, UserID::new(2));
        assert_eq!(records[0].transaction_type, "EXPENSE");
    }

    #[test]
    fn get_transactions_for_user_keeps_malformed_values() {
        let conn = get_test_connection();
        conn.execute(
            "INSERT INTO \"transaction\" (user_id, type, amount, date) VALUES (1, 'income', 'lots', 'yesterday')",
            (),
        )
        .unwrap();

        let records = get_transactions_for_user(UserID::new(1), &conn).unwrap();

        assert_eq!(records[0].amount, "lots");
        assert_eq!(records[0].date, "yesterday");
        assert_eq!(records[0].category, None);
    }
}
