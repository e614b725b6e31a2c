use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::cache::{
    ChallengeStore, DuelStateCache, InMemoryChallengeStore, InMemoryDuelCache,
    RedisChallengeStore, RedisDuelCache,
};
use crate::config::EngineConfig;
use crate::db;
use crate::engine::duel::Coins;
use crate::game::coordinator::{DuelCoordinator, DuelRuntime};
use crate::ledger::DuelLedger;
use crate::tokio_tools::spawn_periodic_task;

use super::fanout::DuelFanout;
use super::rooms::RoomRegistry;
use super::routes::{DuelServer, ServerContext};

const LOG_TARGET: &str = "server::bootstrap";

pub const DEFAULT_REDIS_PREFIX: &str = "duel:";

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub engine: EngineConfig,
    /// `None` keeps the ledger in memory.
    pub database_url: Option<String>,
    /// `None` keeps live state and challenge requests in this process only.
    pub redis_url: Option<String>,
    pub redis_prefix: String,
    /// Opens accounts `1..=dev_accounts` with `dev_balance` each; in-memory ledgers only.
    pub dev_accounts: u64,
    pub dev_balance: Coins,
}

impl ServerConfig {
    pub fn in_memory(bind: SocketAddr, engine: EngineConfig) -> Self {
        Self {
            bind,
            engine,
            database_url: None,
            redis_url: None,
            redis_prefix: DEFAULT_REDIS_PREFIX.to_string(),
            dev_accounts: 0,
            dev_balance: 0,
        }
    }
}

/// A router wired to a running engine. Shut the runtime down after the
/// listener stops.
pub struct DuelApp {
    pub router: Router,
    pub context: Arc<ServerContext>,
    pub runtime: DuelRuntime,
}

/// Picks the ledger and cache backends, then starts the runtime and fanout.
pub async fn build_app(config: &ServerConfig) -> Result<DuelApp> {
    config
        .engine
        .validate()
        .context("invalid engine configuration")?;
    let ttl = config.engine.live_state_ttl();

    let ledger = match &config.database_url {
        Some(url) => DuelLedger::from_sea_orm(db::connect(Some(url)).await?),
        None => {
            warn!(target = LOG_TARGET, "DATABASE_URL not set; ledger kept in memory");
            let ledger = DuelLedger::in_memory();
            for player_id in 1..=config.dev_accounts {
                ledger
                    .open_account(player_id, config.dev_balance, 1)
                    .await
                    .with_context(|| format!("failed to open dev account {player_id}"))?;
            }
            if config.dev_accounts > 0 {
                info!(
                    target = LOG_TARGET,
                    accounts = config.dev_accounts,
                    balance = config.dev_balance,
                    "dev accounts opened"
                );
            }
            ledger
        }
    };

    let backend = match &config.redis_url {
        Some(url) => CacheBackend::Redis(
            Arc::new(
                RedisDuelCache::new(url, config.redis_prefix.clone(), ttl)
                    .context("failed to open redis client")?,
            ),
            Arc::new(
                RedisChallengeStore::new(url, config.redis_prefix.clone())
                    .context("failed to open redis client")?,
            ),
        ),
        None => {
            warn!(
                target = LOG_TARGET,
                "REDIS_URL not set; live state and challenges kept in memory"
            );
            CacheBackend::Memory(
                Arc::new(InMemoryDuelCache::new(ttl)),
                Arc::new(InMemoryChallengeStore::new()),
            )
        }
    };

    let coordinator = Arc::new(DuelCoordinator::new(
        backend.shared(),
        ledger,
        config.engine.clone(),
    ));
    let mut runtime = DuelRuntime::spawn_with_challenges(coordinator, backend.challenges());
    backend.spawn_maintenance(&mut runtime, config.engine.reconciliation_interval);
    Ok(finish_app(runtime))
}

enum CacheBackend {
    Memory(Arc<InMemoryDuelCache>, Arc<InMemoryChallengeStore>),
    Redis(Arc<RedisDuelCache>, Arc<RedisChallengeStore>),
}

impl CacheBackend {
    fn shared(&self) -> Arc<dyn DuelStateCache> {
        match self {
            CacheBackend::Memory(cache, _) => Arc::clone(cache) as Arc<dyn DuelStateCache>,
            CacheBackend::Redis(cache, _) => Arc::clone(cache) as Arc<dyn DuelStateCache>,
        }
    }

    fn challenges(&self) -> Arc<dyn ChallengeStore> {
        match self {
            CacheBackend::Memory(_, store) => Arc::clone(store) as Arc<dyn ChallengeStore>,
            CacheBackend::Redis(_, store) => Arc::clone(store) as Arc<dyn ChallengeStore>,
        }
    }

    /// Redis needs its pub/sub listeners; the in-memory cache needs expired
    /// entries dropped.
    fn spawn_maintenance(&self, runtime: &mut DuelRuntime, every: Duration) {
        match self {
            CacheBackend::Redis(cache, store) => {
                runtime.track(cache.spawn_update_listener(runtime.child_token()));
                runtime.track(store.spawn_event_listener(runtime.child_token()));
            }
            CacheBackend::Memory(cache, _) => {
                let cache = Arc::clone(cache);
                let handle = spawn_periodic_task(
                    "duel-cache-purge",
                    every,
                    runtime.child_token(),
                    move || {
                        let cache = Arc::clone(&cache);
                        async move {
                            let purged = cache.purge_expired();
                            if purged > 0 {
                                debug!(target = LOG_TARGET, purged, "expired live states purged");
                            }
                        }
                    },
                );
                runtime.track(handle);
            }
        }
    }
}

fn finish_app(mut runtime: DuelRuntime) -> DuelApp {
    let rooms = Arc::new(RoomRegistry::new());
    let context = Arc::new(ServerContext::from_runtime(&runtime, Arc::clone(&rooms)));
    let coordinator = runtime.coordinator();
    let fanout = Arc::new(DuelFanout::new(rooms));
    runtime.track(fanout.spawn(
        coordinator.cache().subscribe(),
        context.negotiator.subscribe(),
        runtime.child_token(),
    ));

    let router = DuelServer::new(Arc::clone(&context)).into_router();
    DuelApp {
        router,
        context,
        runtime,
    }
}

pub async fn run_server(config: ServerConfig) -> Result<()> {
    let app = build_app(&config).await?;

    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    let local_addr = listener.local_addr()?;
    info!(
        target = LOG_TARGET,
        %local_addr,
        durable_ledger = config.database_url.is_some(),
        shared_cache = config.redis_url.is_some(),
        "duel server listening"
    );

    let served = axum::serve(listener, app.router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server exited with error");
    app.runtime.shutdown().await?;
    served
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(
            target = LOG_TARGET,
            error = %err,
            "failed to install ctrl-c handler"
        );
    }
    info!(target = LOG_TARGET, "shutdown signal received");
}
