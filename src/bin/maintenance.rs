use std::env;

use anyhow::{Context, Result};
use chrono::{Timelike, Utc};
use tracing_subscriber::EnvFilter;

use mesa_partes::{
    config::AppConfig,
    db,
    mailer::{HttpMailer, Mailer, NoopMailer},
    notify,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        Some("scan-deadlines") => scan_deadlines()?,
        Some("fire-alerts") => fire_alerts()?,
        Some("send-digests") => send_digests().await?,
        Some("purge-notifications") => {
            let include_unread = args.any(|arg| arg == "--incluir-no-leidas");
            purge_notifications(include_unread)?;
        }
        Some(cmd) => {
            eprintln!("Unknown command: {cmd}\n{USAGE}");
            std::process::exit(1);
        }
        None => {
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    }

    Ok(())
}

const USAGE: &str =
    "Usage: maintenance <scan-deadlines|fire-alerts|send-digests|purge-notifications [--incluir-no-leidas]>";

fn scan_deadlines() -> Result<()> {
    let config = AppConfig::from_env()?;
    let pool = db::init_pool_with_size(&config.database_url, 1)?;
    let mut conn = pool.get().context("failed to get database connection")?;

    let created = notify::scan_deadlines(&mut conn, config.deadline_warning_days)?;
    println!("Deadline sweep created {created} notifications.");
    Ok(())
}

fn fire_alerts() -> Result<()> {
    let config = AppConfig::from_env()?;
    let pool = db::init_pool_with_size(&config.database_url, 1)?;
    let mut conn = pool.get().context("failed to get database connection")?;

    let created = notify::fire_scheduled_alerts(&mut conn)?;
    println!("Fired {created} scheduled alerts.");
    Ok(())
}

async fn send_digests() -> Result<()> {
    let config = AppConfig::from_env()?;
    let pool = db::init_pool_with_size(&config.database_url, 1)?;
    let mailer: Box<dyn Mailer> = match HttpMailer::from_config(&config) {
        Some(mailer) => Box::new(mailer),
        None => Box::new(NoopMailer),
    };
    let mut conn = pool.get().context("failed to get database connection")?;

    let hour = Utc::now().hour() as i32;
    let recipients = notify::digest_recipients(&mut conn, hour)?;
    let mut sent = 0usize;
    for user in recipients {
        let unread = notify::unread_for_user(&mut conn, user.id)?;
        if unread.is_empty() {
            continue;
        }
        let Some(email) = user.email.as_deref() else {
            continue;
        };
        let body = notify::compose_digest(&unread);
        if let Err(err) = mailer
            .send(email, "Resumen diario de mesa de partes", &body)
            .await
        {
            eprintln!("Failed to send digest to {}: {err}", user.username);
            continue;
        }
        sent += 1;
    }
    println!("Sent {sent} digests for hour {hour}.");
    Ok(())
}

fn purge_notifications(include_unread: bool) -> Result<()> {
    let config = AppConfig::from_env()?;
    let pool = db::init_pool_with_size(&config.database_url, 1)?;
    let mut conn = pool.get().context("failed to get database connection")?;

    let deleted = notify::purge_old(
        &mut conn,
        config.notification_retention_days,
        !include_unread,
    )?;
    println!("Purged {deleted} notifications.");
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
