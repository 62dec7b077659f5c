use std::{sync::Arc, time::Duration};

use tokio::signal;
use tracing_subscriber::EnvFilter;

use mesa_partes::{
    auth::jwt::JwtService,
    config::AppConfig,
    db,
    integrations::CredentialVault,
    mailer::{HttpMailer, Mailer, NoopMailer},
    state::AppState,
    storage::S3Storage,
    Dispatcher,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "dispatcher",
        database_url = %config.redacted_database_url(),
        pool_size = 1,
        mail_relay = config.mail_api_url.is_some(),
        "loaded configuration"
    );
    let pool = db::init_pool_with_size(&config.database_url, 1)?;
    let storage = Arc::new(S3Storage::from_config(&config).await?);
    let mailer: Arc<dyn Mailer> = match HttpMailer::from_config(&config) {
        Some(mailer) => Arc::new(mailer),
        None => Arc::new(NoopMailer),
    };
    let jwt = JwtService::from_config(&config)?;
    let vault = CredentialVault::new(config.sealing_key()?);

    let state = Arc::new(AppState::new(pool, config, storage, mailer, jwt, vault));
    let dispatcher = Dispatcher::new(state, Duration::from_secs(2))?;

    tokio::select! {
        _ = dispatcher.run() => {}
        _ = signal::ctrl_c() => {
            tracing::info!("dispatcher received shutdown signal");
        }
    }

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
