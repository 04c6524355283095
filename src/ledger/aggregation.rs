//! Turns a user's transaction records into the figures shown on the dashboard.
//!
//! Summaries are built from exact decimals and every collection in the output
//! has a fixed ordering, so the same records always produce the same summary
//! regardless of the order they were read in.

use std::collections::{BTreeMap, HashMap};

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use time::OffsetDateTime;

use crate::{
    database_id::DatabaseID,
    ledger::record::{LedgerEntry, TransactionRecord, TransactionType},
};

/// The number of months included in [DashboardSummary::monthly_series].
pub const SERIES_MONTHS: usize = 6;

/// The number of transactions included in [DashboardSummary::recent_transactions].
pub const RECENT_TRANSACTION_COUNT: usize = 5;

/// Errors that can occur when summarizing transaction records.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AggregationError {
    /// A record could not be interpreted. No summary is produced for the batch.
    #[error("transaction {id} is invalid: {reason}")]
    InvalidRecord {
        /// The ID of the offending record.
        id: DatabaseID,
        /// What was wrong with it.
        reason: String,
    },
}

/// The total expenses for one category.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryTotal {
    /// The category name.
    pub category: String,
    /// The sum of expenses in the category.
    pub total: Decimal,
}

/// Income and expenses for one calendar month.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyTotals {
    /// The month formatted as "MM/YYYY".
    pub label: String,
    /// The sum of income in the month.
    pub income: Decimal,
    /// The sum of expenses in the month.
    pub expenses: Decimal,
}

/// The derived view of a user's transactions.
///
/// All amounts are rounded to two decimal places.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardSummary {
    /// All income minus all expenses.
    pub total_balance: Decimal,
    /// Income dated on or after the start of the current month.
    pub monthly_income: Decimal,
    /// Expenses dated on or after the start of the current month.
    pub monthly_expenses: Decimal,
    /// Expenses per category, the category with the most recent expense first.
    pub expenses_by_category: Vec<CategoryTotal>,
    /// Up to [SERIES_MONTHS] months that have transactions, oldest first.
    pub monthly_series: Vec<MonthlyTotals>,
    /// Up to [RECENT_TRANSACTION_COUNT] transactions, newest first.
    pub recent_transactions: Vec<LedgerEntry>,
}

/// A calendar month as (year, month number).
type MonthKey = (i32, u8);

#[derive(Default)]
struct Bucket {
    income: Decimal,
    expenses: Decimal,
}

struct CategoryAccumulator {
    total: Decimal,
    latest: (OffsetDateTime, DatabaseID),
}

/// Summarize `records` as seen at `now`.
///
/// Month boundaries, including the start of the current month, are taken in
/// the UTC offset of `now`.
///
/// # Errors
///
/// Returns [AggregationError::InvalidRecord] for the invalid record with the
/// lowest ID if any record has an unknown type, a malformed or negative
/// amount, or a malformed date.
pub fn summarize(
    records: &[TransactionRecord],
    now: OffsetDateTime,
) -> Result<DashboardSummary, AggregationError> {
    let entries = validate(records)?;
    let current_month = month_key(now, now);

    let mut total_balance = Decimal::ZERO;
    let mut monthly_income = Decimal::ZERO;
    let mut monthly_expenses = Decimal::ZERO;
    let mut categories: HashMap<&str, CategoryAccumulator> = HashMap::new();
    let mut buckets: BTreeMap<MonthKey, Bucket> = BTreeMap::new();

    for entry in &entries {
        let month = month_key(entry.date, now);
        let bucket = buckets.entry(month).or_default();
        let in_current_month = month >= current_month;

        match entry.transaction_type {
            TransactionType::Income => {
                total_balance += entry.amount;
                bucket.income += entry.amount;

                if in_current_month {
                    monthly_income += entry.amount;
                }
            }
            TransactionType::Expense => {
                total_balance -= entry.amount;
                bucket.expenses += entry.amount;

                if in_current_month {
                    monthly_expenses += entry.amount;
                }

                let seen_at = (entry.date, entry.id);
                categories
                    .entry(entry.category.as_str())
                    .and_modify(|category| {
                        category.total += entry.amount;
                        category.latest = category.latest.max(seen_at);
                    })
                    .or_insert(CategoryAccumulator {
                        total: entry.amount,
                        latest: seen_at,
                    });
            }
        }
    }

    let mut expenses_by_category: Vec<_> = categories.into_iter().collect();
    expenses_by_category.sort_by(|(name_a, a), (name_b, b)| {
        b.latest.cmp(&a.latest).then_with(|| name_a.cmp(name_b))
    });
    let expenses_by_category = expenses_by_category
        .into_iter()
        .map(|(category, accumulator)| CategoryTotal {
            category: category.to_owned(),
            total: round_money(accumulator.total),
        })
        .collect();

    let skip = buckets.len().saturating_sub(SERIES_MONTHS);
    let monthly_series = buckets
        .into_iter()
        .skip(skip)
        .map(|((year, month), bucket)| MonthlyTotals {
            label: format!("{month:02}/{year:04}"),
            income: round_money(bucket.income),
            expenses: round_money(bucket.expenses),
        })
        .collect();

    let mut recent_transactions = entries;
    recent_transactions.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| b.id.cmp(&a.id)));
    recent_transactions.truncate(RECENT_TRANSACTION_COUNT);

    Ok(DashboardSummary {
        total_balance: round_money(total_balance),
        monthly_income: round_money(monthly_income),
        monthly_expenses: round_money(monthly_expenses),
        expenses_by_category,
        monthly_series,
        recent_transactions,
    })
}

/// Validate every record, checking them in a fixed order so that the same
/// invalid record is reported no matter how the input was ordered.
fn validate(records: &[TransactionRecord]) -> Result<Vec<LedgerEntry>, AggregationError> {
    let mut ordered: Vec<&TransactionRecord> = records.iter().collect();
    ordered.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));

    ordered.into_iter().map(LedgerEntry::try_from).collect()
}

#[allow(clippy::type_complexity)]
fn sort_key(
    record: &TransactionRecord,
) -> (DatabaseID, &str, &str, &str, Option<&str>, Option<&str>) {
    (
        record.id,
        record.date.as_str(),
        record.transaction_type.as_str(),
        record.amount.as_str(),
        record.category.as_deref(),
        record.description.as_deref(),
    )
}

fn month_key(date: OffsetDateTime, now: OffsetDateTime) -> MonthKey {
    let local = date.to_offset(now.offset());

    (local.year(), u8::from(local.month()))
}

/// Round half away from zero to cents, always keeping two decimal places.
fn round_money(amount: Decimal) -> Decimal {
    let mut rounded = amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(2);

    if rounded.is_zero() {
        rounded.set_sign_positive(true);
    }

    rounded
}
