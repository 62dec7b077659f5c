use std::sync::Arc;

use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tracing_subscriber::EnvFilter;

use mesa_partes::{
    auth::jwt::JwtService,
    config::AppConfig,
    db,
    integrations::CredentialVault,
    mailer::{HttpMailer, Mailer, NoopMailer},
    routes::create_router,
    state::AppState,
    storage::S3Storage,
};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "api",
        database_url = %config.redacted_database_url(),
        pool_size = config.database_max_pool_size,
        s3_bucket = %config.s3_bucket,
        mail_relay = config.mail_api_url.is_some(),
        "loaded configuration"
    );

    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
    {
        let mut conn = pool.get()?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|err| anyhow::anyhow!("migrations failed: {err}"))?;
    }

    let storage = Arc::new(S3Storage::from_config(&config).await?);
    let mailer: Arc<dyn Mailer> = match HttpMailer::from_config(&config) {
        Some(mailer) => Arc::new(mailer),
        None => Arc::new(NoopMailer),
    };
    let jwt = JwtService::from_config(&config)?;
    let vault = CredentialVault::new(config.sealing_key()?);

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let state = AppState::new(pool, config, storage, mailer, jwt, vault);
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
