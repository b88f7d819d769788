pub mod models {
    pub mod orion;
}

pub mod client;
pub mod config;
pub mod db {
    pub mod models;
}
pub mod envfile;
pub mod pool;
pub mod schema;
pub mod transport;
pub mod utils;
pub mod services {
    pub mod backfill;
    pub mod fetch;
    pub mod ingest;
    pub mod metadata;
    pub mod orchestrator;
    pub mod partition;
    pub mod watermarks;
}

use crate::client::OrionClient;
use crate::config::Config;
use crate::pool::ConnectionPool;
use crate::services::fetch::WorkerSettings;
use crate::services::metadata::LogStatusListener;
use crate::services::orchestrator::{IngestContext, RunMode, RunSummary};
use crate::services::{metadata, orchestrator, partition, watermarks};
use crate::transport::{ResilientTransport, RetryPolicy, ThreadSleeper, UreqTransport};
use chrono::{NaiveTime, Utc};
use diesel::PgConnection;
use diesel::prelude::*;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use log::{error, info};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

fn apply_database_migrations(conn: &mut PgConnection) -> Result<(), String> {
    match conn.run_pending_migrations(MIGRATIONS) {
        Ok(applied) if applied.is_empty() => {
            info!("Database schema is up to date");
            Ok(())
        }
        Ok(applied) => {
            let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
            info!("Applied {} database migration(s): {}", applied.len(), names);
            Ok(())
        }
        Err(e) => Err(format!("Applying database migrations failed: {}", e)),
    }
}

pub fn run() -> Result<RunSummary, String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (workers={}, pool={}, margin={}min, start={}, offset_mode={:?}, page_delay={}ms, max_request_attempts={}, backfill_from={})",
        cfg.workers,
        cfg.pool_size(),
        cfg.safety_margin.num_minutes(),
        cfg.start_date,
        cfg.offset_mode,
        cfg.page_delay.as_millis(),
        cfg.max_request_attempts,
        cfg.backfill_from_date
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string()),
    );

    // 2) Authenticate against Orion
    let policy = RetryPolicy {
        max_attempts: cfg.max_request_attempts,
        base_delay: cfg.retry_backoff,
        ..RetryPolicy::default()
    };
    let transport = ResilientTransport::new(UreqTransport::new(cfg.request_timeout), policy);
    let client = OrionClient::connect(transport, &cfg.base_url, &cfg.api_key)
        .map_err(|e| format!("Orion authentication failed (API key invalid?): {}", e))?;
    info!("Authenticated to Orion API at {}", cfg.base_url);

    // 3) Connection pool shared by the registrar and every worker
    let url = cfg.database_url.clone();
    let pool = ConnectionPool::new(cfg.pool_size(), move || {
        PgConnection::establish(&url).map_err(|e| format!("DB connection failed: {}", e))
    });
    let mut conn = pool.acquire()?;
    info!("Connected to database (pool of {} connection(s))", pool.capacity());

    // 4) Apply pending database migrations
    apply_database_migrations(&mut conn)?;

    // 5) Device and sensor inventory
    let devices = client
        .get_user_devices()
        .map_err(|e| format!("get_user_devices failed: {}", e))?;
    info!("Metadata: {} device(s) returned by the API", devices.len());
    let grouping = metadata::register(&mut *conn, &devices, &LogStatusListener)?;

    // 6) Resume points
    let default_start = cfg.start_date.and_time(NaiveTime::MIN);
    let marks = watermarks::load(&mut *conn, cfg.safety_margin, default_start)?;
    drop(conn);

    // 7) Partitions and their windows, all ending at the same instant
    let partitions = partition::partition(&grouping, cfg.max_sensors_per_partition);
    let end = Utc::now().naive_utc();
    let mode = match cfg.backfill_from_date {
        Some(from) => RunMode::Backfill {
            from: from.and_time(NaiveTime::MIN),
            block: chrono::Duration::days(i64::from(cfg.backfill_block_days)),
        },
        None => RunMode::Incremental,
    };
    info!("Run: {} partition(s), mode {:?}, end {}", partitions.len(), mode, end);
    let jobs = orchestrator::plan_jobs(partitions, &marks, &mode, end);

    // 8) Fetch workers
    let settings = WorkerSettings {
        offset_mode: cfg.offset_mode,
        page_delay: cfg.page_delay,
        max_pages_per_window: cfg.max_pages_per_window,
    };
    let ctx = IngestContext {
        source: &client,
        pool: &pool,
        settings: &settings,
        sleeper: &ThreadSleeper,
    };
    let summary = orchestrator::run_partitions(&ctx, jobs, cfg.workers.get());
    summary.log();
    Ok(summary)
}

fn main() {
    let loaded_env = match envfile::load_from_args(std::env::args_os().skip(1)) {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!(
            "Environment loaded from {} .env file: {} ({} variable(s) applied)",
            origin,
            info.path.display(),
            info.applied
        );
    }

    info!(
        "orion-ingest {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    match run() {
        Ok(summary) if !summary.failures.is_empty() => {
            info!("Finished with {} failed partition(s)", summary.failures.len());
        }
        Ok(_) => info!("Finished"),
        Err(e) => {
            error!("fatal: {}", e);
            std::process::exit(1);
        }
    }
}
