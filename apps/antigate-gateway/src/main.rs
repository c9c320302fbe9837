//! Binary entry point for the Antigravity upstream dispatch engine.
//! Wires the L1-L6/C1-C5 components together, starts the D1 periodic
//! cleanup job, and serves the thin HTTP surface over the Forward
//! Orchestrator.
//!
//! Grounded on `apps/gproxy/src/main.rs`'s bootstrap-then-serve shape;
//! the multi-provider registry and admin router it wires are out of scope
//! here (single Antigravity provider family, no admin CRUD per spec §1).

mod cli;
mod credential_store;
mod http;
mod oauth;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use antigate_common::GatewayConfig;
use antigate_core::orchestrator::{ForwardOrchestrator, OrchestratorConfig};
use antigate_core::sticky_session::StickySessionCache;
use antigate_core::token_provider::TokenProvider;
use antigate_core::upstream_client::{UpstreamClientConfig, WreqUpstreamClient};
use antigate_core::url_tracker::UrlAvailabilityTracker;
use antigate_provider_core::{Event, EventHub, EventSink, OperationalEvent};
use antigate_provider_core::AccountPool;
use antigate_storage::cleanup::{self, CleanupConfig};
use antigate_storage::leader_lock::{DbAdvisoryLock, RedisLeaderLock};

use cli::CliArgs;
use credential_store::{load_accounts_into_pool, DbCredentialSink};
use http::AppState;
use oauth::GoogleOAuthRefresher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = CliArgs::parse();
    let config = args.config_patch().apply_over(GatewayConfig::default());

    let db = antigate_storage::connect_shared(&args.dsn).await?;
    antigate_storage::sync_schema(&db).await?;

    let events = EventHub::new(1024);
    events.add_sink(Arc::new(TracingEventSink)).await;

    let pool = Arc::new(AccountPool::new(events));
    let loaded = load_accounts_into_pool(&db, &pool).await?;
    info!(accounts_loaded = loaded, "account pool initialized");

    let urls = Arc::new(UrlAvailabilityTracker::new(args.base_urls.clone()));
    let sticky = Arc::new(StickySessionCache::new(config.sticky_session_ttl()));

    let wreq_client = wreq::Client::builder().build()?;
    let refresher = Arc::new(GoogleOAuthRefresher::new(wreq_client));
    let main_store = Arc::new(DbCredentialSink::new(db.clone()));
    let tokens = Arc::new(TokenProvider::new(refresher, main_store, oauth::known_client_ids()));

    let upstream_config = UpstreamClientConfig {
        proxy: None,
        connect_timeout: Duration::from_secs(10),
        request_timeout: Duration::from_secs(120),
        stream_idle_timeout: Duration::from_secs(config.stream_data_interval_timeout_s),
    };
    let client = Arc::new(WreqUpstreamClient::new(upstream_config, 4));

    let orchestrator_config = OrchestratorConfig {
        model_mapping: args.parsed_model_mapping(),
        max_attempts_per_url: config.max_retries_per_url,
        smart_retry_threshold: config.smart_retry_threshold(),
        smart_retry_min_wait: config.smart_retry_min_wait(),
        default_rate_limit_window: config.default_rate_limit_window(),
        journal_capacity: config.upstream_error_journal_capacity,
        max_line_size: config.max_line_size,
    };
    let orchestrator = ForwardOrchestrator::new(pool, urls, sticky, tokens, client, orchestrator_config);

    spawn_cleanup_job(db.clone(), config.clone(), args.redis_url.clone());

    let state = Arc::new(AppState {
        orchestrator,
        journal_capacity: config.upstream_error_journal_capacity,
    });
    let app = http::router(state);

    let bind = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(bind, "antigate-gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}

struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn write<'a>(&'a self, event: &'a Event) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let Event::Operational(op) = event;
            match op {
                OperationalEvent::UnavailableStart(e) => {
                    warn!(account_id = e.account_id, reason = ?e.reason, "account unavailable");
                }
                OperationalEvent::UnavailableEnd(e) => {
                    info!(account_id = e.account_id, "account recovered");
                }
                OperationalEvent::ModelUnavailableStart(e) => {
                    warn!(account_id = e.account_id, model = %e.model, reason = ?e.reason, "model unavailable for account");
                }
                OperationalEvent::ModelUnavailableEnd(e) => {
                    info!(account_id = e.account_id, model = %e.model, "model recovered for account");
                }
            }
        })
    }
}

/// Background loop for the D1 periodic cleanup job: sleeps until the next
/// cron firing, then races for leadership and runs one pass if it wins.
/// Losing the race is the common case in a multi-replica deployment and is
/// not logged as an error.
fn spawn_cleanup_job(db: sea_orm::DatabaseConnection, config: GatewayConfig, redis_url: Option<String>) {
    tokio::spawn(async move {
        loop {
            let delay = match cleanup::next_fire_delay(&config.cleanup_cron, time::OffsetDateTime::now_utc()) {
                Ok(delay) => delay,
                Err(err) => {
                    error!(error = %err, "invalid cleanup cron expression, retrying in 1h");
                    Duration::from_secs(3600)
                }
            };
            tokio::time::sleep(delay).await;

            let cleanup_config = CleanupConfig {
                retention: config.retention_days,
                batch_size: config.cleanup_batch_size,
                dry_run: config.cleanup_dry_run,
            };

            let ran = match &redis_url {
                Some(url) => run_with_redis_lock(url, &db, &cleanup_config, config.leader_lock_ttl_secs).await,
                None => run_with_advisory_lock(&db, &cleanup_config).await,
            };
            if !ran {
                info!("cleanup job did not acquire leadership this cycle");
            }
        }
    });
}

async fn run_with_redis_lock(
    redis_url: &str,
    db: &sea_orm::DatabaseConnection,
    config: &CleanupConfig,
    ttl_secs: u64,
) -> bool {
    let Ok(client) = redis::Client::open(redis_url) else {
        error!("invalid redis url for cleanup leader lock");
        return false;
    };
    let Ok(conn) = redis::aio::ConnectionManager::new(client).await else {
        error!("could not connect to redis for cleanup leader lock");
        return false;
    };
    let token = uuid::Uuid::new_v4().to_string();
    let mut lock = RedisLeaderLock::new(conn, cleanup::LEADER_LOCK_KEY, token, ttl_secs);
    match lock.try_acquire().await {
        Ok(true) => {
            cleanup::run_once(db, config).await;
            let _ = lock.release().await;
            true
        }
        Ok(false) => false,
        Err(err) => {
            error!(error = %err, "cleanup leader lock error");
            false
        }
    }
}

async fn run_with_advisory_lock(db: &sea_orm::DatabaseConnection, config: &CleanupConfig) -> bool {
    let mut lock = DbAdvisoryLock::new(db, cleanup::LEADER_LOCK_KEY);
    match lock.try_acquire().await {
        Ok(true) => {
            cleanup::run_once(db, config).await;
            let _ = lock.release().await;
            true
        }
        Ok(false) => false,
        Err(err) => {
            error!(error = %err, "cleanup advisory lock error");
            false
        }
    }
}
