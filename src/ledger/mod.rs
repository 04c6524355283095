//! Validation and aggregation of income and expense records.

mod aggregation;
mod record;

pub use aggregation::{
    AggregationError, CategoryTotal, DashboardSummary, MonthlyTotals, RECENT_TRANSACTION_COUNT,
    SERIES_MONTHS, summarize,
};
pub use record::{
    LedgerEntry, MAX_AMOUNT, MAX_DECIMAL_PLACES, TransactionRecord, TransactionType,
    UNCATEGORIZED_LABEL,
};
