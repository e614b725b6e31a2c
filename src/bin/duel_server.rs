use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use duel_engine::config::{DuelRules, EngineConfig};
use duel_engine::server::bootstrap::DEFAULT_REDIS_PREFIX;
use duel_engine::server::{run_server, ServerConfig};

const LOG_TARGET: &str = "bin::duel_server";
const DEFAULT_BIND: &str = "127.0.0.1:4000";

#[derive(Debug, Parser)]
#[command(name = "duel_server")]
#[command(about = "Run the wagered PvP duel server", long_about = None)]
struct Args {
    /// Address to bind the HTTP server to (host:port)
    #[arg(long, env = "SERVER_BIND", default_value = DEFAULT_BIND)]
    bind: SocketAddr,

    /// SeaORM-compatible Postgres URL; the ledger stays in memory when unset
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Redis URL for shared live state and challenge requests; process-local when unset
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Key and channel prefix inside Redis
    #[arg(long, env = "REDIS_PREFIX", default_value = DEFAULT_REDIS_PREFIX)]
    redis_prefix: String,

    /// Optional RNG seed for deterministic deals
    #[arg(long, env = "SERVER_RNG_SEED")]
    rng_seed: Option<u64>,

    /// Toggle structured (JSON) logs
    #[arg(long, env = "SERVER_LOG_JSON", default_value_t = false)]
    json: bool,

    #[arg(long, env = "DUEL_MAX_ROUNDS", default_value_t = DuelRules::default().max_rounds)]
    max_rounds: u32,

    #[arg(long, env = "DUEL_DAMAGE_THRESHOLD", default_value_t = DuelRules::default().damage_threshold)]
    damage_threshold: u32,

    #[arg(long, env = "DUEL_BASE_DAMAGE", default_value_t = DuelRules::default().base_damage)]
    base_damage: u32,

    #[arg(long, env = "DUEL_READY_WINDOW_SECS", default_value_t = 30)]
    ready_window_secs: u64,

    #[arg(long, env = "DUEL_TURN_TIMEOUT_SECS", default_value_t = 30)]
    turn_timeout_secs: u64,

    #[arg(long, env = "DUEL_RECONNECT_GRACE_SECS", default_value_t = 20)]
    reconnect_grace_secs: u64,

    #[arg(long, env = "DUEL_CHALLENGE_TTL_SECS", default_value_t = 300)]
    challenge_ttl_secs: u64,

    /// Seed accounts 1..=N in the in-memory ledger for local play
    #[arg(long, env = "SERVER_DEV_ACCOUNTS", default_value_t = 0)]
    dev_accounts: u64,

    #[arg(long, env = "SERVER_DEV_BALANCE", default_value_t = 1_000)]
    dev_balance: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();
    let args = Args::parse();
    init_tracing(args.json)?;
    let config = build_config(args);
    config
        .engine
        .validate()
        .context("invalid duel configuration")?;
    info!(
        target = LOG_TARGET,
        bind = %config.bind,
        max_rounds = config.engine.rules.max_rounds,
        damage_threshold = config.engine.rules.damage_threshold,
        "starting duel server"
    );
    run_server(config).await
}

fn load_dotenv() {
    let manifest_env = env!("CARGO_MANIFEST_DIR");
    let manifest_env_path = PathBuf::from(manifest_env).join(".env");
    dotenv::from_filename(manifest_env_path).ok();
    dotenv::dotenv().ok();
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt::fmt().with_env_filter(filter).with_target(false);

    if json {
        builder.json().flatten_event(true).init();
    } else {
        builder.compact().init();
    }

    Ok(())
}

fn build_config(args: Args) -> ServerConfig {
    let rules = DuelRules {
        max_rounds: args.max_rounds,
        damage_threshold: args.damage_threshold,
        base_damage: args.base_damage,
        ready_window: Duration::from_secs(args.ready_window_secs),
        turn_timeout: Duration::from_secs(args.turn_timeout_secs),
        reconnect_grace: Duration::from_secs(args.reconnect_grace_secs),
        ..DuelRules::default()
    };
    let engine = EngineConfig {
        rules,
        challenge_ttl: Duration::from_secs(args.challenge_ttl_secs),
        rng_seed: args.rng_seed,
        ..EngineConfig::default()
    };

    ServerConfig {
        bind: args.bind,
        engine,
        database_url: args.database_url,
        redis_url: args.redis_url,
        redis_prefix: args.redis_prefix,
        dev_accounts: args.dev_accounts,
        dev_balance: args.dev_balance,
    }
}
