use clap::{Parser, ValueEnum};
use rewards_core::LedgerStorageConfig;
use rewards_service::{build_router, ServiceConfig, ServiceState};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LedgerStorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "rewardsd", version, about = "Rewards ledger REST service")]
struct Cli {
    /// REST socket address to bind, e.g. 127.0.0.1:8095
    #[arg(long, default_value = "127.0.0.1:8095", env = "REWARDS_LISTEN")]
    listen: SocketAddr,
    /// Ledger persistence backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = LedgerStorageMode::Auto, env = "REWARDS_LEDGER_STORAGE")]
    ledger_storage: LedgerStorageMode,
    /// PostgreSQL url for ledger persistence.
    #[arg(long, env = "REWARDS_DATABASE_URL")]
    database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 5, env = "REWARDS_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// Seconds between expiry sweeps of stale redemptions. 0 disables the sweep.
    #[arg(long, default_value_t = 300, env = "REWARDS_SWEEP_INTERVAL_SECS")]
    sweep_interval_secs: u64,
    /// Days a redemption code stays usable.
    #[arg(long, default_value_t = 30, env = "REWARDS_REDEMPTION_WINDOW_DAYS")]
    redemption_window_days: i64,
    /// Optimistic commit attempts before a mutation fails with a conflict.
    #[arg(long, default_value_t = 8, env = "REWARDS_MUTATOR_ATTEMPTS")]
    mutator_attempts: u32,
    /// HTTP endpoint of the fulfilment partner. The mock partner is used when unset.
    #[arg(long, env = "REWARDS_PARTNER_ENDPOINT")]
    partner_endpoint: Option<String>,
    /// Per-call partner timeout in milliseconds.
    #[arg(long, default_value_t = 5_000, env = "REWARDS_PARTNER_TIMEOUT_MS")]
    partner_timeout_ms: u64,
    /// Account id provisioned with the admin role at startup.
    #[arg(long, env = "REWARDS_BOOTSTRAP_ADMIN")]
    bootstrap_admin: Option<String>,
}

fn resolve_ledger_storage(cli: &Cli) -> anyhow::Result<LedgerStorageConfig> {
    let resolved_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let storage = match cli.ledger_storage {
        LedgerStorageMode::Memory => LedgerStorageConfig::Memory,
        LedgerStorageMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!("ledger_storage=postgres requires --database-url or DATABASE_URL")
            })?;
            LedgerStorageConfig::postgres(database_url, cli.pg_max_connections)
        }
        LedgerStorageMode::Auto => {
            if let Some(database_url) = resolved_url {
                LedgerStorageConfig::postgres(database_url, cli.pg_max_connections)
            } else {
                LedgerStorageConfig::Memory
            }
        }
    };

    Ok(storage)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "rewards_service=info,info".to_string()),
        )
        .init();

    let cli = Cli::parse();
    let ledger_storage = resolve_ledger_storage(&cli)?;
    info!("ledger storage: {}", ledger_storage.label());

    let config = ServiceConfig {
        ledger_storage,
        redemption_window_days: cli.redemption_window_days,
        mutator_attempts: cli.mutator_attempts,
        partner_endpoint: cli.partner_endpoint.clone(),
        partner_timeout_ms: cli.partner_timeout_ms,
        bootstrap_admin: cli.bootstrap_admin.clone(),
    };
    let state = ServiceState::bootstrap(config).await?;

    let sweep_task = if cli.sweep_interval_secs > 0 {
        info!(
            "expiring stale redemptions every {}s",
            cli.sweep_interval_secs
        );
        Some(
            state
                .engine
                .spawn_expiry_sweep(Duration::from_secs(cli.sweep_interval_secs)),
        )
    } else {
        None
    };

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("rewards-service REST listening on {}", listener.local_addr()?);

    let served = axum::serve(listener, app).await;
    if let Some(sweep_task) = sweep_task {
        sweep_task.abort();
    }
    served?;

    Ok(())
}
