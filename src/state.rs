//! Wires together the backend and the capability layers built on top of it
//! into one handle the dispatcher, sweeper, and transport all share.

use std::sync::Arc;

use crate::backend::local::LocalBackend;
use crate::backend::redis_backend::RedisBackend;
use crate::backend::StateBackend;
use crate::config::Config;
use crate::hub::{Hub, LocalHub, RedisHub};
use crate::invite::InviteStore;
use crate::matchmaking::Matchmaker;
use crate::rate_limit::RateLimiter;
use crate::session::SessionRegistry;

pub struct AppState {
    pub config: Config,
    pub sessions: SessionRegistry,
    pub rate_limiter: RateLimiter,
    pub invites: InviteStore,
    pub matchmaker: Matchmaker,
    pub hub: Arc<dyn Hub>,
}

impl AppState {
    pub async fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        let (backend, hub): (Arc<dyn StateBackend>, Arc<dyn Hub>) = match &config.redis_url {
            Some(url) => {
                let backend = Arc::new(RedisBackend::connect(url).await?);
                let client = redis::Client::open(url.as_str())?;
                let hub: Arc<dyn Hub> = RedisHub::new(client);
                (backend, hub)
            }
            None => {
                let backend: Arc<dyn StateBackend> = Arc::new(LocalBackend::new());
                let hub: Arc<dyn Hub> = Arc::new(LocalHub::new());
                (backend, hub)
            }
        };

        Ok(Arc::new(Self {
            sessions: SessionRegistry::new(backend.clone()),
            rate_limiter: RateLimiter::new(backend.clone()),
            invites: InviteStore::new(backend.clone()),
            matchmaker: Matchmaker::new(backend.clone()),
            hub,
            config,
        }))
    }

    /// Local-backend state with defaults, for unit and integration tests.
    pub fn new_local_for_tests() -> Arc<Self> {
        let backend: Arc<dyn StateBackend> = Arc::new(LocalBackend::new());
        let hub: Arc<dyn Hub> = Arc::new(LocalHub::new());
        Arc::new(Self {
            config: Config {
                port: 0,
                cors_origin: crate::config::CorsOrigin::Any,
                admin_key: None,
                redis_url: None,
                session_ttl: std::time::Duration::from_secs(1800),
                sweep_interval: std::time::Duration::from_secs(30),
            },
            sessions: SessionRegistry::new(backend.clone()),
            rate_limiter: RateLimiter::new(backend.clone()),
            invites: InviteStore::new(backend.clone()),
            matchmaker: Matchmaker::new(backend.clone()),
            hub,
        })
    }
}
