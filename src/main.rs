//! pathdb - Main entry point.
//!
//! Opens the pool for the given SQLite files, runs statements and queries against the
//! first one, and prints pool and health statistics as JSON.

use pathdb::config::Config;
use pathdb::db::{ConnectionHandle, RetryExecutor, SqliteEngineConnection, TransactionManager};
use pathdb::global::{self, PathDb};
use pathdb::models::{ExecuteResult, Statement};
use pathdb::DbResult;
use serde_json::{Value as JsonValue, json};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    // Logs go to stderr so stdout carries only the JSON report
    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Run `--execute` statements, then `--query` queries, on one handle.
async fn run_statements(
    config: &Config,
    retry: &RetryExecutor,
    handle: &mut ConnectionHandle<SqliteEngineConnection>,
) -> DbResult<(Vec<ExecuteResult>, Vec<JsonValue>)> {
    let executed = if config.transaction {
        let statements: Vec<Statement> = config
            .statements
            .iter()
            .map(|sql| Statement::new(sql.as_str()))
            .collect();
        TransactionManager::with_retry(handle, retry)
            .execute_in_transaction(&statements)
            .await?
    } else {
        let mut results = Vec::with_capacity(config.statements.len());
        for sql in &config.statements {
            results.push(retry.execute_statement(handle, sql, &[]).await?);
        }
        results
    };

    let mut queries = Vec::with_capacity(config.queries.len());
    for sql in &config.queries {
        let rows = retry.fetch_rows(handle, sql, &[]).await?;
        queries.push(json!({ "sql": sql, "rows": rows }));
    }
    Ok((executed, queries))
}

/// Run the requested work and collect everything that goes into the report.
async fn run(config: &Config, db: &PathDb) -> DbResult<JsonValue> {
    let pool = db.pool();
    let retry = db.retry();

    // Open every database once so missing or unreadable files fail early
    for path in config.databases.iter().skip(1) {
        let handle = pool.checkout_default(path).await?;
        pool.checkin(handle).await?;
    }

    let Some(target) = config.databases.first() else {
        return Ok(JsonValue::Null);
    };
    let mut handle = pool.checkout_default(target).await?;

    let work = run_statements(config, retry, &mut handle).await;

    // The handle goes back even when a statement failed
    pool.checkin(handle).await?;
    let (executed, queries) = work?;

    let evicted = pool.evict_idle(db.config().idle_timeout).await;

    Ok(json!({
        "database": target,
        "executed": executed,
        "queries": queries,
        "evicted_idle": evicted,
        "pool": pool.stats(),
        "query_statistics": db.monitor().query_statistics(),
        "database_statistics": db.monitor().database_statistics(),
        "health": db.monitor().health_check(),
    }))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse_args();

    // Initialize logging
    init_tracing(&config);

    if config.databases.is_empty() {
        eprintln!("Error: At least one database file must be given.");
        eprintln!();
        eprintln!("Usage: pathdb --database <path> [--execute <sql>]... [--query <sql>]...");
        eprintln!();
        eprintln!("Examples:");
        eprintln!("  pathdb --database data.db --execute 'CREATE TABLE t (v INTEGER)'");
        eprintln!("  pathdb --database data.db --transaction -e 'INSERT INTO t VALUES (1)' -e 'INSERT INTO t VALUES (2)'");
        eprintln!("  pathdb --database data.db --query 'SELECT * FROM t'");
        eprintln!("  pathdb --database one.db,two.db --max-connections 4");
        std::process::exit(1);
    }

    info!(
        databases = config.databases.len(),
        "Starting pathdb v{}",
        env!("CARGO_PKG_VERSION")
    );

    let core = config.core_config()?;
    let db = global::init(core, config.sqlite_options())?;

    let result = run(&config, &db).await;
    let shutdown = global::teardown().await;

    match result {
        Ok(mut report) => {
            if let (Some(object), Some(shutdown)) = (report.as_object_mut(), shutdown) {
                object.insert("shutdown".to_string(), json!(shutdown));
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
            info!("pathdb finished");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, code = %e.error_code(), "pathdb failed");
            Err(e.into())
        }
    }
}
