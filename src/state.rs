use std::sync::Arc;
use std::time::Duration;

use diesel::{
    pg::PgConnection,
    r2d2::{ConnectionManager, PooledConnection},
};

use crate::{
    auth::jwt::JwtService,
    config::AppConfig,
    db::PgPool,
    error::{AppError, AppResult},
    integrations::{CredentialVault, IntegrationCache, RateLimiter},
    mailer::Mailer,
    storage::ObjectStorage,
};

type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<AppConfig>,
    pub storage: Arc<dyn ObjectStorage>,
    pub mailer: Arc<dyn Mailer>,
    pub jwt: JwtService,
    pub vault: CredentialVault,
    pub integration_cache: IntegrationCache,
    pub rate_limiter: RateLimiter,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        config: AppConfig,
        storage: Arc<dyn ObjectStorage>,
        mailer: Arc<dyn Mailer>,
        jwt: JwtService,
        vault: CredentialVault,
    ) -> Self {
        let cache_ttl = Duration::from_secs(config.integration_cache_ttl_seconds);
        Self {
            pool,
            config: Arc::new(config),
            storage,
            mailer,
            jwt,
            vault,
            integration_cache: IntegrationCache::new(cache_ttl),
            rate_limiter: RateLimiter::default(),
        }
    }

    pub fn db(&self) -> AppResult<PgPooledConnection> {
        self.pool
            .get()
            .map_err(|err| AppError::internal(format!("database pool error: {err}")))
    }
}
