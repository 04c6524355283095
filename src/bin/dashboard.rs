use std::{fs::OpenOptions, process::ExitCode, sync::Arc, time::Duration};

use clap::Parser;
use tracing_subscriber::{EnvFilter, Layer, filter, layer::SubscriberExt, util::SubscriberInitExt};

use pocketbook::{
    ConnectionCache, ConnectionConfig, Error, SqliteConnector, UserID, load_dashboard,
    now_in_timezone, shutdown_on_signal,
};

/// Prints a user's dashboard summary as JSON.
///
/// The database connection is configured through the `DATABASE_URL` and
/// `DB_*` environment variables.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The ID of the user whose transactions are summarized.
    #[arg(long)]
    user_id: i64,

    /// The canonical timezone used for month boundaries, e.g. "Pacific/Auckland".
    #[arg(long, env = "TIMEZONE", default_value = "Etc/UTC")]
    timezone: String,

    /// Print a fresh summary every this many seconds until interrupted.
    #[arg(long)]
    refresh_secs: Option<u64>,

    /// File path to write the debug log to.
    #[arg(long, default_value = "debug.log")]
    log_path: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    setup_logging(&args.log_path);

    let config = match ConnectionConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            tracing::error!("{}", Error::from(error));
            return ExitCode::FAILURE;
        }
    };

    let cache = ConnectionCache::new(SqliteConnector, config);
    let mut shutdown = tokio::spawn(shutdown_on_signal(cache.clone()));
    let user_id = UserID::new(args.user_id);

    loop {
        let Some(now) = now_in_timezone(&args.timezone) else {
            tracing::error!("{}", Error::InvalidTimezoneError(args.timezone.clone()));
            return ExitCode::FAILURE;
        };

        match load_dashboard(&cache, user_id, now).await {
            Ok(summary) => match serde_json::to_string_pretty(&summary) {
                Ok(json) => println!("{json}"),
                Err(error) => tracing::error!("could not serialize the summary: {error}"),
            },
            Err(error) => {
                tracing::error!("could not load the dashboard for user {user_id}: {error}");

                if args.refresh_secs.is_none() {
                    return ExitCode::FAILURE;
                }
            }
        }

        let Some(refresh_secs) = args.refresh_secs else {
            break;
        };

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(refresh_secs)) => {},
            _ = &mut shutdown => {
                tracing::info!("Shutting down.");
                break;
            },
        }
    }

    cache.shutdown();
    ExitCode::SUCCESS
}

fn setup_logging(log_path: &str) {
    let stdout_log = tracing_subscriber::fmt::layer()
        .pretty()
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .expect("Could not create log file");

    let debug_log = tracing_subscriber::fmt::layer()
        .pretty()
        .with_ansi(false)
        .with_writer(Arc::new(log_file))
        .with_filter(filter::LevelFilter::DEBUG);

    tracing_subscriber::registry()
        .with(stdout_log)
        .with(debug_log)
        .init();
}
