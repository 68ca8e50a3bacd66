//! orm-pool - Main entry point.
//!
//! Runs one SQL statement or key-value command from the command line. The process has no
//! runtime of its own: the engines are driven through the blocking facade, which starts
//! one when needed.

use clap::Parser;
use orm_connection_pool::config::{Command, Config, ConnectionParams, KvArgs, PoolOptions, SqlArgs};
use orm_connection_pool::db::{
    Blocking, DirectSqlEngine, KvEngine, MySqlFactory, RedisFactory, RedisOptions,
};
use orm_connection_pool::{EngineResult, Output};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    // Logs go to stderr so stdout carries only the result
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

/// Run a statement on a direct (non-pooled) engine, optionally inside a transaction.
fn run_sql(params: ConnectionParams, args: &SqlArgs) -> EngineResult<Output> {
    let engine = Blocking::new(DirectSqlEngine::new(MySqlFactory::new(params)?));
    let bound = args.parse_params()?;

    if !args.transaction {
        return engine.execute(&args.statement, &bound, None);
    }

    engine.start_transaction()?;
    match engine.execute(&args.statement, &bound, None) {
        Ok(output) => {
            engine.commit()?;
            Ok(output)
        }
        Err(e) => {
            // A lost connection already ended the transaction
            if engine.engine().in_transaction() {
                if let Err(rollback_err) = engine.rollback() {
                    warn!(error = %rollback_err, "Rollback failed");
                }
            }
            Err(e)
        }
    }
}

fn run_kv(config: &Config, params: ConnectionParams, args: &KvArgs) -> EngineResult<Output> {
    let factory = RedisFactory::new(
        params,
        RedisOptions {
            prefix: config.key_prefix.clone(),
        },
    )?;
    let engine = Blocking::new(KvEngine::new(
        factory,
        PoolOptions::with_max_connections(config.max_connections),
    ));
    engine.execute(&args.verb, &args.to_params(), None)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    let params = ConnectionParams::from_url(&config.url)?;
    info!(
        target_db = %params.masked(),
        "Starting orm-pool v{}",
        env!("CARGO_PKG_VERSION")
    );

    let result = match &config.command {
        Command::Sql(args) => run_sql(params, args),
        Command::Kv(args) => run_kv(&config, params, args),
    };

    match result {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output.into_json())?);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Execution failed");
            Err(e.into())
        }
    }
}
