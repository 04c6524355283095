//! Transaction records as read from the store, and their validated form.

use std::{fmt::Display, str::FromStr};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::{
    Date, OffsetDateTime, PrimitiveDateTime,
    format_description::{BorrowedFormatItem, well_known::Rfc3339},
    macros::format_description,
};

use crate::{database_id::DatabaseID, ledger::AggregationError, user::UserID};

/// Label for expenses that were saved without a category.
pub const UNCATEGORIZED_LABEL: &str = "Other";

/// The largest amount a single transaction may have, one trillion.
///
/// Keeps the sum of any realistic number of records well inside the range of
/// [Decimal].
// 232 * 2^32 + 3_567_587_328 = 1_000_000_000_000
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(3_567_587_328, 232, 0, false, 0);

/// The most decimal places an amount may have once trailing zeros are removed.
pub const MAX_DECIMAL_PLACES: u32 = 8;

/// SQLite's `CURRENT_TIMESTAMP` format, e.g. "2024-01-05 13:45:00".
const SQL_DATE_TIME_FORMAT: &[BorrowedFormatItem] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second][optional [.[subsecond]]]");

const DATE_FORMAT: &[BorrowedFormatItem] = format_description!("[year]-[month]-[day]");

/// Whether money came in or went out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionType {
    /// Money earned.
    Income,
    /// Money spent.
    Expense,
}

impl TransactionType {
    /// The name used when storing the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Income => "INCOME",
            TransactionType::Expense => "EXPENSE",
        }
    }
}

impl Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INCOME" => Ok(TransactionType::Income),
            "EXPENSE" => Ok(TransactionType::Expense),
            _ => Err(format!("unknown transaction type \"{s}\"")),
        }
    }
}

/// A transaction exactly as it is stored.
///
/// The type, amount and date are kept as text until they are validated by
/// converting the record into a [LedgerEntry].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// The ID of the transaction. Unique within a user's records.
    pub id: DatabaseID,
    /// The user the transaction belongs to.
    pub user_id: UserID,
    /// "INCOME" or "EXPENSE".
    pub transaction_type: String,
    /// A non-negative decimal number, e.g. "12.50".
    pub amount: String,
    /// What the transaction was for.
    pub description: Option<String>,
    /// A user-defined category.
    pub category: Option<String>,
    /// When the transaction happened.
    pub date: String,
}

/// A validated transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    /// The ID of the transaction.
    pub id: DatabaseID,
    /// The user the transaction belongs to.
    pub user_id: UserID,
    /// Whether money came in or went out.
    pub transaction_type: TransactionType,
    /// How much money, never negative.
    pub amount: Decimal,
    /// What the transaction was for.
    pub description: Option<String>,
    /// The category, or [UNCATEGORIZED_LABEL] if none was given.
    pub category: String,
    /// When the transaction happened.
    #[serde(with = "time::serde::rfc3339")]
    pub date: OffsetDateTime,
}

impl TryFrom<&TransactionRecord> for LedgerEntry {
    type Error = AggregationError;

    fn try_from(record: &TransactionRecord) -> Result<Self, Self::Error> {
        let invalid = |reason: String| AggregationError::InvalidRecord {
            id: record.id,
            reason,
        };

        let transaction_type = record.transaction_type.parse().map_err(invalid)?;
        let amount = parse_amount(&record.amount).map_err(invalid)?;
        let date = parse_date(&record.date)
            .ok_or_else(|| invalid(format!("invalid date \"{}\"", record.date)))?;
        let category = record
            .category
            .as_deref()
            .map(str::trim)
            .filter(|category| !category.is_empty())
            .unwrap_or(UNCATEGORIZED_LABEL)
            .to_owned();

        Ok(Self {
            id: record.id,
            user_id: record.user_id,
            transaction_type,
            amount,
            description: record.description.clone(),
            category,
            date,
        })
    }
}

fn parse_amount(text: &str) -> Result<Decimal, String> {
    let amount = Decimal::from_str(text.trim())
        .map_err(|error| format!("invalid amount \"{text}\": {error}"))?;

    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(format!("amount {amount} is negative"));
    }

    if amount > MAX_AMOUNT {
        return Err(format!("amount {amount} is larger than {MAX_AMOUNT}"));
    }

    if amount.normalize().scale() > MAX_DECIMAL_PLACES {
        return Err(format!(
            "amount {amount} has more than {MAX_DECIMAL_PLACES} decimal places"
        ));
    }

    Ok(amount)
}

/// Parse an RFC 3339 timestamp, or a SQL date-time or plain date in UTC.
fn parse_date(text: &str) -> Option<OffsetDateTime> {
    let text = text.trim();

    OffsetDateTime::parse(text, &Rfc3339)
        .or_else(|_| PrimitiveDateTime::parse(text, SQL_DATE_TIME_FORMAT).map(|date| date.assume_utc()))
        .or_else(|_| Date::parse(text, DATE_FORMAT).map(|date| date.midnight().assume_utc()))
        .ok()
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use time::macros::datetime;

    use crate::{
        ledger::{
            AggregationError,
            record::{LedgerEntry, TransactionRecord, TransactionType, UNCATEGORIZED_LABEL},
        },
        user::UserID,
    };

    fn record(transaction_type: &str, amount: &str, date: &str) -> TransactionRecord {
        TransactionRecord {
            id: 7,
            user_id: UserID::new(1),
            transaction_type: transaction_type.to_owned(),
            amount: amount.to_owned(),
            description: Some("groceries".to_owned()),
            category: Some("food".to_owned()),
            date: date.to_owned(),
        }
    }

    fn reason(result: Result<LedgerEntry, AggregationError>) -> String {
        match result {
            Err(AggregationError::InvalidRecord { id: 7, reason }) => reason,
            other => panic!("expected record 7 to be invalid, got {other:?}"),
        }
    }

    #[test]
    fn parses_valid_record() {
        let entry = LedgerEntry::try_from(&record("EXPENSE", "12.50", "2024-01-10T09:30:00Z")).unwrap();

        assert_eq!(entry.transaction_type, TransactionType::Expense);
        assert_eq!(entry.amount, Decimal::new(1250, 2));
        assert_eq!(entry.category, "food");
        assert_eq!(entry.date, datetime!(2024-01-10 09:30:00 UTC));
    }

    #[test]
    fn accepts_lowercase_type() {
        let entry = LedgerEntry::try_from(&record("income", "1000", "2024-01-05")).unwrap();

        assert_eq!(entry.transaction_type, TransactionType::Income);
    }

    #[test]
    fn accepts_sql_and_plain_dates() {
        let sql = LedgerEntry::try_from(&record("INCOME", "1", "2024-01-05 13:45:00")).unwrap();
        let plain = LedgerEntry::try_from(&record("INCOME", "1", "2024-01-05")).unwrap();
        let offset = LedgerEntry::try_from(&record("INCOME", "1", "2024-01-05T13:45:00+13:00")).unwrap();

        assert_eq!(sql.date, datetime!(2024-01-05 13:45:00 UTC));
        assert_eq!(plain.date, datetime!(2024-01-05 00:00:00 UTC));
        assert_eq!(offset.date, datetime!(2024-01-05 13:45:00 +13:00));
    }

    #[test]
    fn missing_or_blank_category_is_other() {
        let mut missing = record("EXPENSE", "5", "2024-01-05");
        missing.category = None;
        let mut blank = record("EXPENSE", "5", "2024-01-05");
        blank.category = Some("  ".to_owned());

        assert_eq!(LedgerEntry::try_from(&missing).unwrap().category, UNCATEGORIZED_LABEL);
        assert_eq!(LedgerEntry::try_from(&blank).unwrap().category, UNCATEGORIZED_LABEL);
    }

    #[test]
    fn rejects_non_numeric_amount() {
        let reason = reason(LedgerEntry::try_from(&record("EXPENSE", "12,50abc", "2024-01-05")));

        assert!(reason.contains("invalid amount"), "got {reason}");
    }

    #[test]
    fn rejects_negative_amount() {
        let reason = reason(LedgerEntry::try_from(&record("EXPENSE", "-3.00", "2024-01-05")));

        assert!(reason.contains("negative"), "got {reason}");
    }

    #[test]
    fn rejects_huge_amount() {
        let reason = reason(LedgerEntry::try_from(&record(
            "INCOME",
            "1000000000000000",
            "2024-01-05",
        )));

        assert!(reason.contains("larger than"), "got {reason}");
    }

    #[test]
    fn rejects_overly_precise_amount() {
        let reason = reason(LedgerEntry::try_from(&record("INCOME", "0.000000001", "2024-01-05")));

        assert!(reason.contains("decimal places"), "got {reason}");
    }

    #[test]
    fn accepts_trailing_zeros_beyond_precision() {
        let entry = LedgerEntry::try_from(&record("INCOME", "1.5000000000", "2024-01-05")).unwrap();

        assert_eq!(entry.amount, Decimal::new(15, 1));
    }

    #[test]
    fn rejects_malformed_date() {
        let reason = reason(LedgerEntry::try_from(&record("INCOME", "1", "05/01/2024")));

        assert!(reason.contains("invalid date"), "got {reason}");
    }

    #[test]
    fn rejects_unknown_type() {
        let reason = reason(LedgerEntry::try_from(&record("TRANSFER", "1", "2024-01-05")));

        assert!(reason.contains("unknown transaction type"), "got {reason}");
    }
}
