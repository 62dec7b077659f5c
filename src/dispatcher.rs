//! Outbox dispatcher. Polls the persistent outbox, signs each payload
//! with the target integration's secret and delivers it over HTTP.
//! Undeliverable rows back off exponentially until the integration's
//! retry budget runs out, at which point the row fails terminally and
//! the integration drops to ERROR.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use diesel::prelude::*;
use reqwest::Client;
use serde_json::json;
use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::integrations::CONN_ERROR;
use crate::mailer::Mailer;
use crate::models::{Integration, NewSyncLogEntry, Notification, OutboxEntry, User};
use crate::notify;
use crate::schema::{integrations, notifications, sync_log, users};
use crate::state::AppState;
use crate::webhooks::{
    self, EVENT_HEADER, INTEGRATION_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};

pub struct Dispatcher {
    state: Arc<AppState>,
    client: Client,
    poll_interval: Duration,
}

enum Delivery {
    Success,
    Retry(String),
}

impl Dispatcher {
    pub fn new(state: Arc<AppState>, poll_interval: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("mesa-partes/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            state,
            client,
            poll_interval,
        })
    }

    pub async fn run(&self) {
        info!("dispatcher started");
        loop {
            match self.tick().await {
                Ok(true) => {}
                Ok(false) => {
                    if let Err(err) = self.deliver_pending_emails().await {
                        error!(error = %err, "email sweep failed");
                    }
                    sleep(self.poll_interval).await;
                }
                Err(err) => {
                    error!(error = %err, "dispatcher tick failed");
                    sleep(self.poll_interval).await;
                }
            }
        }
    }

    async fn tick(&self) -> anyhow::Result<bool> {
        let mut conn = self.state.db()?;
        let entry_opt = webhooks::reserve_next(&mut conn)?;
        drop(conn);

        let Some(entry) = entry_opt else {
            return Ok(false);
        };

        let mut conn = self.state.db()?;
        let integration: Option<Integration> = integrations::table
            .find(entry.integration_id)
            .first(&mut conn)
            .optional()?;
        drop(conn);

        let Some(integration) = integration else {
            let mut conn = self.state.db()?;
            webhooks::mark_failed(&mut conn, entry.id, "integracion eliminada")?;
            return Ok(true);
        };
        if !integration.active || integration.webhook_url.is_none() {
            let mut conn = self.state.db()?;
            webhooks::mark_failed(&mut conn, entry.id, "integracion inactiva")?;
            return Ok(true);
        }

        let started = std::time::Instant::now();
        let outcome = self.deliver(&integration, &entry).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        let mut conn = self.state.db()?;
        match outcome {
            Delivery::Success => {
                webhooks::mark_delivered(&mut conn, entry.id)?;
                self.log_attempt(&mut conn, &integration, &entry, "ok", duration_ms, None)?;
                info!(evento = %entry.event, integracion = %integration.code, "webhook entregado");
            }
            Delivery::Retry(message) => {
                if entry.attempts >= integration.webhook_max_retries {
                    webhooks::mark_failed(&mut conn, entry.id, &message)?;
                    self.log_attempt(
                        &mut conn,
                        &integration,
                        &entry,
                        "fallido",
                        duration_ms,
                        Some(&message),
                    )?;
                    flag_integration_error(&mut conn, integration.id)?;
                    self.state.integration_cache.invalidate(integration.id);
                    error!(
                        evento = %entry.event,
                        integracion = %integration.code,
                        intentos = entry.attempts,
                        "webhook agotado, integracion en ERROR"
                    );
                } else {
                    let delay = webhooks::backoff_delay(
                        i64::from(integration.retry_backoff_seconds),
                        entry.attempts,
                    );
                    let next_run = Utc::now().naive_utc() + delay;
                    webhooks::retry_after(&mut conn, entry.id, next_run, &message)?;
                    self.log_attempt(
                        &mut conn,
                        &integration,
                        &entry,
                        "reintento",
                        duration_ms,
                        Some(&message),
                    )?;
                    warn!(
                        evento = %entry.event,
                        integracion = %integration.code,
                        intento = entry.attempts,
                        "entrega fallo, reintento programado"
                    );
                }
            }
        }
        Ok(true)
    }

    async fn deliver(&self, integration: &Integration, entry: &OutboxEntry) -> Delivery {
        let url = integration
            .webhook_url
            .as_deref()
            .expect("checked by caller");

        let sealed = match integration.webhook_secret_sealed.as_deref() {
            Some(sealed) => sealed,
            None => return Delivery::Retry("integracion sin secreto de webhook".to_string()),
        };
        let secret = match self.state.vault.open(sealed) {
            Ok(secret) => secret,
            Err(err) => return Delivery::Retry(format!("secreto ilegible: {err}")),
        };

        let signature = webhooks::sign(&secret, &entry.payload);
        let timeout = Duration::from_secs(integration.webhook_timeout_seconds.max(1) as u64);

        let mut request = self
            .client
            .post(url)
            .timeout(timeout)
            .header(SIGNATURE_HEADER, signature)
            .header(EVENT_HEADER, &entry.event)
            .header(TIMESTAMP_HEADER, Utc::now().to_rfc3339())
            .header(INTEGRATION_HEADER, integration.id.to_string())
            .json(&entry.payload);
        if let Some(headers) = integration.webhook_headers.as_object() {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name.as_str(), value);
                }
            }
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => Delivery::Success,
            Ok(response) => Delivery::Retry(format!("codigo {}", response.status().as_u16())),
            Err(err) => Delivery::Retry(err.to_string()),
        }
    }

    fn log_attempt(
        &self,
        conn: &mut PgConnection,
        integration: &Integration,
        entry: &OutboxEntry,
        status: &str,
        duration_ms: i64,
        error_message: Option<&str>,
    ) -> anyhow::Result<()> {
        let log_entry = NewSyncLogEntry {
            id: Uuid::new_v4(),
            integration_id: integration.id,
            document_id: entry.document_id,
            operation: entry.event.clone(),
            direction: "saliente".to_string(),
            request: entry.payload.clone(),
            response: error_message.map(|message| json!({"error": message})),
            status: status.to_string(),
            attempt: entry.attempts,
            next_retry_at: None,
            duration_ms: Some(duration_ms),
            client_ip: None,
            user_agent: None,
        };
        diesel::insert_into(sync_log::table)
            .values(&log_entry)
            .execute(conn)?;
        Ok(())
    }

    /// Sends one email per undelivered notification whose owner opted
    /// into email, then marks the row so it never sends twice.
    async fn deliver_pending_emails(&self) -> anyhow::Result<()> {
        let mut conn = self.state.db()?;
        let pending: Vec<Notification> = notifications::table
            .filter(notifications::email_delivered.eq(false))
            .order(notifications::created_at.asc())
            .limit(50)
            .load(&mut conn)?;

        for notification in pending {
            let prefs = notify::load_or_default_preferences(&mut conn, notification.user_id)?;
            if !prefs.email_enabled {
                diesel::update(notifications::table.find(notification.id))
                    .set(notifications::email_delivered.eq(true))
                    .execute(&mut conn)?;
                continue;
            }
            let user: User = users::table.find(notification.user_id).first(&mut conn)?;
            let Some(email) = user.email.as_deref() else {
                diesel::update(notifications::table.find(notification.id))
                    .set(notifications::email_delivered.eq(true))
                    .execute(&mut conn)?;
                continue;
            };

            match self
                .state
                .mailer
                .send(email, &notification.title, &notification.body)
                .await
            {
                Ok(()) => {
                    diesel::update(notifications::table.find(notification.id))
                        .set(notifications::email_delivered.eq(true))
                        .execute(&mut conn)?;
                }
                Err(err) => {
                    warn!(usuario = %user.username, error = %err, "envio de correo fallo");
                }
            }
        }
        Ok(())
    }
}

fn flag_integration_error(conn: &mut PgConnection, integration_id: Uuid) -> anyhow::Result<()> {
    diesel::update(integrations::table.find(integration_id))
        .set((
            integrations::connection_state.eq(CONN_ERROR),
            integrations::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}
