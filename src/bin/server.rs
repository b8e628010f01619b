//! Hoard daemon
//!
//! Run with: hoard-server [--stdio]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use hoard::auth::limits::RateLimiter;
use hoard::auth::tokens::ensure_agent_from_config;
use hoard::config::{data_dir, load_config, DataPaths};
use hoard::embedding::EmbedderRegistry;
use hoard::mcp::{protocol, ServerState};
use hoard::storage::lock::ServerLock;
use hoard::storage::migrations;
use hoard::storage::writer::{WriteCoordinator, WriterOptions};
use hoard::storage::{open_connection, StoragePool};
use hoard::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "hoard-server")]
#[command(about = "Hoard personal knowledge daemon")]
struct Args {
    /// Data directory (config, database, locks)
    #[arg(long, env = "HOARD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Bind host for the HTTP transport
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Bind port for the HTTP transport
    #[arg(long, default_value = "19850")]
    port: u16,

    /// Serve line-delimited JSON-RPC on stdio instead of HTTP
    /// (write tools are disabled on this transport)
    #[arg(long)]
    stdio: bool,

    /// Skip schema migrations (fail if any are pending)
    #[arg(long)]
    no_migrate: bool,

    /// Reader connection pool size
    #[arg(long, default_value = "4")]
    readers: usize,

    /// Disable the background worker
    #[arg(long)]
    no_worker: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let dir = args.data_dir.clone().unwrap_or_else(data_dir);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("creating data directory {}", dir.display()))?;

    let config = load_config(&dir)?;
    let paths = DataPaths::resolve(&dir, &config);

    // The admin secret comes from the environment, falling back to the
    // server.key file in the data directory.
    if config.server_secret().is_none() && paths.server_key_path.exists() {
        let key = std::fs::read_to_string(&paths.server_key_path)?;
        let key = key.trim();
        if !key.is_empty() {
            std::env::set_var(&config.write.server_secret_env, key);
        }
    }
    if config.write.enabled && config.server_secret().is_none() {
        bail!(
            "{} is not set and {} does not exist; the daemon cannot authenticate agents",
            config.write.server_secret_env,
            paths.server_key_path.display()
        );
    }

    // One daemon per storage file. Failure here is fatal.
    let _server_lock = ServerLock::acquire(&paths.db_path)
        .context("acquiring the server singleton lock")?;

    std::fs::create_dir_all(&paths.artifacts_dir)?;
    std::fs::write(&paths.pid_path, format!("{}\n", std::process::id()))?;

    // Migrate (or refuse to start read-write with pending migrations).
    {
        let conn = open_connection(&paths.db_path, config.write.database.busy_timeout_ms)?;
        if args.no_migrate {
            let current = migrations::current_version(&conn)?;
            let latest = migrations::latest_version();
            if current < latest {
                bail!(
                    "schema migrations pending (v{} -> v{}); restart without --no-migrate",
                    current,
                    latest
                );
            }
        } else {
            migrations::migrate(&conn, Some(hoard::VERSION))?;
        }
    }

    let writer = Arc::new(WriteCoordinator::new(
        &paths.db_path,
        WriterOptions {
            busy_timeout_ms: config.write.database.busy_timeout_ms,
            lock_timeout_ms: config.write.database.lock_timeout_ms,
        },
    )?);

    // Statically configured tokens become agent registrations.
    if let Some(secret) = config.server_secret() {
        let tokens = config.security.tokens.clone();
        let rate_limit = config.security.rate_limits.max_writes_per_hour as i64;
        writer.submit(move |conn| {
            for entry in &tokens {
                ensure_agent_from_config(
                    conn,
                    &entry.name,
                    &entry.token,
                    &entry.scopes,
                    rate_limit,
                    &secret,
                )?;
            }
            Ok(())
        })?;
    }

    let readers = StoragePool::new(
        &paths.db_path,
        args.readers,
        config.write.database.busy_timeout_ms,
    )?;
    let embedders = Arc::new(EmbedderRegistry::new());
    let limiter = RateLimiter::new(config.security.rate_limits.clone());

    let mut background_worker = if args.no_worker {
        None
    } else {
        Some(Worker::start(
            paths.db_path.clone(),
            config.clone(),
            writer.clone(),
            embedders.clone(),
        )?)
    };

    let state = Arc::new(ServerState {
        config,
        paths,
        readers,
        writer,
        limiter,
        embedders,
    });

    let result = if args.stdio {
        protocol::serve_stdio(&state).map_err(anyhow::Error::from)
    } else {
        let runtime = tokio::runtime::Runtime::new()?;
        runtime
            .block_on(hoard::mcp::http::serve(state.clone(), &args.host, args.port))
            .map_err(anyhow::Error::from)
    };

    if let Some(worker) = background_worker.as_mut() {
        worker.stop();
    }
    let _ = std::fs::remove_file(&state.paths.pid_path);
    result
}
