use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use floodgate::config::{FloodgateConfig, LogFormat, LoggingConfig};
use floodgate::error::{ErrorKind, FloodgateError};
use floodgate::floodcontrol::{CheckContext, FloodControlChecker, UserId};
use floodgate::store::{CounterStore, MemoryStore, RedisStore};

/// Run flood control checks against the shared store.
#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Store backend to check against
    #[arg(long, value_enum, default_value_t = StoreKind::Redis)]
    store: StoreKind,

    /// Number of checks to fire concurrently per user
    #[arg(long, default_value_t = 1)]
    burst: u32,

    /// Give up on a check after this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// User IDs to check
    #[arg(default_values_t = [111_i64])]
    user_ids: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    Redis,
    Memory,
}

/// Output line for a check that ended in an error.
#[derive(Debug, Serialize)]
struct Failure<'a> {
    user_id: &'a UserId,
    error: String,
    kind: ErrorKind,
}

impl<'a> Failure<'a> {
    fn new(user_id: &'a UserId, err: &FloodgateError) -> Self {
        Self {
            user_id,
            error: err.to_string(),
            kind: err.kind(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = FloodgateConfig::load(args.config.as_ref())?;

    init_tracing(&config.logging);

    info!("Starting Floodgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    match &args.config {
        Some(path) => info!(path = %path.display(), "Loaded configuration file"),
        None => info!("No configuration file, using defaults and environment"),
    }

    let policy = config.flood_control.policy()?;
    info!(
        max_requests = policy.max_requests_per_window(),
        window = ?policy.window(),
        lock_retries = policy.lock_retry_limit(),
        "Configuration loaded"
    );

    let store: Arc<dyn CounterStore> = match args.store {
        StoreKind::Redis => Arc::new(RedisStore::connect(&config.redis).await?),
        StoreKind::Memory => Arc::new(MemoryStore::new()),
    };
    let checker = Arc::new(FloodControlChecker::with_key_space(
        store,
        policy,
        config.flood_control.key_space(),
    ));

    let ctx = match args.timeout_ms {
        Some(ms) => CheckContext::background().with_timeout(Duration::from_millis(ms)),
        None => CheckContext::background(),
    };

    let mut failures = 0;
    for user_id in args.user_ids {
        let user = UserId::from(user_id);
        let checks = (0..args.burst).map(|_| checker.evaluate(&ctx, &user));

        for result in futures::future::join_all(checks).await {
            match result {
                Ok(decision) => println!("{}", serde_json::to_string(&decision)?),
                Err(e) => {
                    warn!(user = %user, error = %e, kind = ?e.kind(), "Check failed");
                    println!("{}", serde_json::to_string(&Failure::new(&user, &e))?);
                    failures += 1;
                }
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} checks failed", failures);
    }
    Ok(())
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}
