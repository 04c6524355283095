use std::error::Error;
use std::path::Path;
use std::process::exit;

use clap::Parser;
use rusqlite::Connection;
use rust_decimal::Decimal;
use time::{Duration, OffsetDateTime};

use pocketbook::{
    NewTransaction, TransactionType, UserID, create_transaction_table, insert_transaction,
};

/// A utility for creating a test database for the pocketbook dashboard.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// File path to save the SQLite database to.
    #[arg(long, short)]
    output_path: String,

    /// The user that owns the generated transactions.
    #[arg(long, default_value_t = 1)]
    user_id: i64,

    /// How many months of history to generate, ending this month.
    #[arg(long, default_value_t = 8)]
    months: u32,
}

/// Monthly expenses as (category, cents).
const EXPENSE_CATEGORIES: [(&str, i64); 4] = [
    ("rent", 145000),
    ("food", 31245),
    ("transport", 8610),
    ("fun", 12099),
];

/// Create and populate a database for manual testing.
fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let output_path = Path::new(&args.output_path);

    match output_path.extension() {
        None => {
            eprintln!("Output path must include a file extension (e.g., 'my_database.db').");
            exit(1);
        }
        Some(extension) if extension.is_empty() => {
            eprintln!("Output path must include a file extension (e.g., 'my_database.db').");
            exit(1);
        }
        _ => {}
    }

    if output_path.is_file() {
        eprintln!("File already exists at {output_path:#?}!");
        exit(1);
    }

    println!("Creating database at {output_path:#?}");
    let conn = Connection::open(output_path)?;

    create_transaction_table(&conn)?;

    println!(
        "Creating {} months of transactions for user {}...",
        args.months, args.user_id
    );

    let user_id = UserID::new(args.user_id);
    let mut month_start = OffsetDateTime::now_utc().date().replace_day(1)?;
    let mut month_starts = vec![month_start];

    for _ in 1..args.months {
        month_start = (month_start - Duration::days(1)).replace_day(1)?;
        month_starts.push(month_start);
    }

    for (months_ago, month_start) in month_starts.into_iter().enumerate().rev() {
        insert_transaction(
            NewTransaction::build(
                user_id,
                TransactionType::Income,
                Decimal::new(420000, 2),
                month_start,
            )
            .description("salary"),
            &conn,
        )?;

        for (day, (category, cents)) in (2..).zip(EXPENSE_CATEGORIES) {
            insert_transaction(
                NewTransaction::build(
                    user_id,
                    TransactionType::Expense,
                    Decimal::new(cents + months_ago as i64 * 100, 2),
                    month_start.replace_day(day)?,
                )
                .category(category),
                &conn,
            )?;
        }
    }

    println!("Success!");

    Ok(())
}
