//! Webhook bus: canonical payload signing, inbound verification and the
//! persistent outbox the background dispatcher drains.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Integration, NewOutboxEntry, OutboxEntry};
use crate::schema::{integrations, webhook_outbox};

type HmacSha256 = Hmac<Sha256>;

pub const EVENT_DOCUMENTO_CREADO: &str = "documento.creado";
pub const EVENT_DOCUMENTO_ACTUALIZADO: &str = "documento.actualizado";
pub const EVENT_DOCUMENTO_DERIVADO: &str = "documento.derivado";
pub const EVENT_DOCUMENTO_RECIBIDO: &str = "documento.recibido";
pub const EVENT_DOCUMENTO_ATENDIDO: &str = "documento.atendido";
pub const EVENT_DOCUMENTO_ARCHIVADO: &str = "documento.archivado";
pub const EVENT_DERIVACION_CREADA: &str = "derivacion.creada";
pub const EVENT_DERIVACION_RECIBIDA: &str = "derivacion.recibida";
pub const EVENT_DERIVACION_ATENDIDA: &str = "derivacion.atendida";
pub const EVENT_ESTADO_SINCRONIZADO: &str = "estado.sincronizado";

pub const OUTBOUND_EVENTS: &[&str] = &[
    EVENT_DOCUMENTO_CREADO,
    EVENT_DOCUMENTO_ACTUALIZADO,
    EVENT_DOCUMENTO_DERIVADO,
    EVENT_DOCUMENTO_RECIBIDO,
    EVENT_DOCUMENTO_ATENDIDO,
    EVENT_DOCUMENTO_ARCHIVADO,
    EVENT_DERIVACION_CREADA,
    EVENT_DERIVACION_RECIBIDA,
    EVENT_DERIVACION_ATENDIDA,
];

pub const STATUS_QUEUED: &str = "queued";
pub const STATUS_PROCESSING: &str = "processing";
pub const STATUS_SUCCEEDED: &str = "succeeded";
pub const STATUS_FAILED: &str = "failed";

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const EVENT_HEADER: &str = "X-Webhook-Event";
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";
pub const INTEGRATION_HEADER: &str = "X-Integration-ID";

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
}

pub type WebhookResult<T> = Result<T, WebhookError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("firma invalida")]
    SignatureInvalid,
    #[error("timestamp fuera de ventana")]
    TimestampSkewed,
    #[error("timestamp invalido")]
    TimestampMalformed,
}

/// Serializes a JSON value with object keys in lexicographic order at
/// every level. Both ends canonicalise before signing so formatting
/// differences never break verification.
pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("string serializes"));
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar).expect("scalar serializes")),
    }
}

/// `sha256=<hex>` over the canonical form of `payload`.
pub fn sign(secret: &str, payload: &Value) -> String {
    let canonical = canonicalize(payload);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(canonical.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time verification of an inbound signature.
pub fn verify_signature(secret: &str, payload: &Value, signature: &str) -> Result<(), VerifyError> {
    let hex_part = signature
        .strip_prefix("sha256=")
        .ok_or(VerifyError::SignatureInvalid)?;
    let expected = hex::decode(hex_part).map_err(|_| VerifyError::SignatureInvalid)?;
    let canonical = canonicalize(payload);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(canonical.as_bytes());
    mac.verify_slice(&expected)
        .map_err(|_| VerifyError::SignatureInvalid)
}

/// Rejects timestamps outside the replay window.
pub fn verify_timestamp(raw: &str, now: DateTime<Utc>, skew_seconds: i64) -> Result<(), VerifyError> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .map_err(|_| VerifyError::TimestampMalformed)?
        .with_timezone(&Utc);
    let skew = (now - parsed).num_seconds().abs();
    if skew > skew_seconds {
        return Err(VerifyError::TimestampSkewed);
    }
    Ok(())
}

/// Builds the canonical outbound envelope for one integration.
pub fn build_payload(event: &str, integration_id: Uuid, datos: &Value) -> Value {
    json!({
        "evento": event,
        "timestamp": Utc::now().to_rfc3339(),
        "integracion_id": integration_id,
        "datos": datos,
    })
}

/// Fans an event out to every active integration subscribed to it,
/// committing one outbox row per target. Runs inside the caller's
/// transaction so the rows commit atomically with the domain write.
pub fn enqueue_event(
    conn: &mut PgConnection,
    event: &str,
    document_id: Option<Uuid>,
    datos: &Value,
) -> WebhookResult<usize> {
    let targets: Vec<Integration> = integrations::table
        .filter(integrations::active.eq(true))
        .filter(integrations::webhook_url.is_not_null())
        .load(conn)?;

    let mut enqueued = 0usize;
    for integration in targets {
        let subscribed = integration
            .webhook_events
            .as_array()
            .map(|events| events.iter().any(|e| e.as_str() == Some(event)))
            .unwrap_or(false);
        if !subscribed {
            continue;
        }

        let entry = NewOutboxEntry {
            id: Uuid::new_v4(),
            integration_id: integration.id,
            event: event.to_string(),
            payload: build_payload(event, integration.id, datos),
            document_id,
            status: STATUS_QUEUED.to_string(),
            run_after: Utc::now().naive_utc(),
        };
        diesel::insert_into(webhook_outbox::table)
            .values(&entry)
            .execute(conn)?;
        enqueued += 1;
    }
    Ok(enqueued)
}

/// A processing row whose claim is older than this is treated as
/// abandoned (dispatcher died mid-delivery) and becomes claimable
/// again.
pub const PROCESSING_LEASE_SECONDS: i64 = 600;

const RESERVE_BATCH: i64 = 20;

/// Claims the next deliverable outbox row. A row is deliverable when it
/// is queued and due, or processing past its lease, and no older
/// undelivered row exists for the same (integration, document) pair, so
/// a backing-off delivery holds younger rows of its pair back.
pub fn reserve_next(conn: &mut PgConnection) -> WebhookResult<Option<OutboxEntry>> {
    let now = Utc::now().naive_utc();
    let lease_cutoff = now - ChronoDuration::seconds(PROCESSING_LEASE_SECONDS);

    conn.transaction(|conn| {
        let candidates: Vec<OutboxEntry> = webhook_outbox::table
            .filter(
                webhook_outbox::status
                    .eq(STATUS_QUEUED)
                    .and(webhook_outbox::run_after.le(now))
                    .or(webhook_outbox::status
                        .eq(STATUS_PROCESSING)
                        .and(webhook_outbox::updated_at.le(lease_cutoff))),
            )
            .order(webhook_outbox::created_at.asc())
            .limit(RESERVE_BATCH)
            .for_update()
            .skip_locked()
            .load(conn)?;

        for entry in candidates {
            let blockers: i64 = webhook_outbox::table
                .filter(webhook_outbox::integration_id.eq(entry.integration_id))
                .filter(webhook_outbox::document_id.is_not_distinct_from(entry.document_id))
                .filter(webhook_outbox::status.eq_any([STATUS_QUEUED, STATUS_PROCESSING]))
                .filter(webhook_outbox::created_at.lt(entry.created_at))
                .count()
                .get_result(conn)?;
            if blockers > 0 {
                continue;
            }

            diesel::update(webhook_outbox::table.find(entry.id))
                .set((
                    webhook_outbox::status.eq(STATUS_PROCESSING),
                    webhook_outbox::attempts.eq(entry.attempts + 1),
                    webhook_outbox::updated_at.eq(now),
                ))
                .execute(conn)?;

            let refreshed = webhook_outbox::table.find(entry.id).first(conn)?;
            return Ok::<Option<OutboxEntry>, diesel::result::Error>(Some(refreshed));
        }
        Ok::<Option<OutboxEntry>, diesel::result::Error>(None)
    })
    .map_err(WebhookError::from)
}

pub fn mark_delivered(conn: &mut PgConnection, entry_id: Uuid) -> WebhookResult<()> {
    diesel::update(webhook_outbox::table.find(entry_id))
        .set((
            webhook_outbox::status.eq(STATUS_SUCCEEDED),
            webhook_outbox::last_error.eq::<Option<String>>(None),
            webhook_outbox::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

pub fn retry_after(
    conn: &mut PgConnection,
    entry_id: Uuid,
    next_run: NaiveDateTime,
    error_message: &str,
) -> WebhookResult<()> {
    diesel::update(webhook_outbox::table.find(entry_id))
        .set((
            webhook_outbox::status.eq(STATUS_QUEUED),
            webhook_outbox::run_after.eq(next_run),
            webhook_outbox::last_error.eq(Some(error_message.to_string())),
            webhook_outbox::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

pub fn mark_failed(
    conn: &mut PgConnection,
    entry_id: Uuid,
    error_message: &str,
) -> WebhookResult<()> {
    diesel::update(webhook_outbox::table.find(entry_id))
        .set((
            webhook_outbox::status.eq(STATUS_FAILED),
            webhook_outbox::last_error.eq(Some(error_message.to_string())),
            webhook_outbox::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

/// Exponential backoff: base, 2x, 4x... capped at six hours.
pub fn backoff_delay(base_seconds: i64, attempt: i32) -> ChronoDuration {
    let exponent = attempt.saturating_sub(1).clamp(0, 16) as u32;
    let seconds = base_seconds.saturating_mul(1i64 << exponent);
    ChronoDuration::seconds(seconds.min(6 * 3600))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn canonical_form_sorts_keys_recursively() {
        let value = json!({"b": 1, "a": {"z": true, "m": [3, {"y": 2, "x": 1}]}});
        assert_eq!(
            canonicalize(&value),
            r#"{"a":{"m":[3,{"x":1,"y":2}],"z":true},"b":1}"#
        );
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let payload = json!({"evento": "documento.creado", "datos": {"id": "abc"}});
        let signature = sign("secreto", &payload);
        assert!(signature.starts_with("sha256="));
        assert!(verify_signature("secreto", &payload, &signature).is_ok());
    }

    #[test]
    fn verification_is_format_insensitive() {
        let signed = json!({"a": 1, "b": 2});
        let reordered: Value =
            serde_json::from_str(r#"{"b": 2, "a": 1}"#).unwrap();
        let signature = sign("secreto", &signed);
        assert!(verify_signature("secreto", &reordered, &signature).is_ok());
    }

    #[test]
    fn wrong_secret_or_tampered_payload_fails() {
        let payload = json!({"a": 1});
        let signature = sign("secreto", &payload);
        assert_eq!(
            verify_signature("otro", &payload, &signature),
            Err(VerifyError::SignatureInvalid)
        );
        assert_eq!(
            verify_signature("secreto", &json!({"a": 2}), &signature),
            Err(VerifyError::SignatureInvalid)
        );
    }

    #[test]
    fn malformed_signature_header_is_rejected() {
        let payload = json!({"a": 1});
        assert_eq!(
            verify_signature("secreto", &payload, "md5=abc"),
            Err(VerifyError::SignatureInvalid)
        );
        assert_eq!(
            verify_signature("secreto", &payload, "sha256=zzzz"),
            Err(VerifyError::SignatureInvalid)
        );
    }

    #[test]
    fn timestamps_inside_the_window_pass() {
        let now = Utc.with_ymd_and_hms(2026, 8, 30, 12, 0, 0).unwrap();
        assert!(verify_timestamp("2026-08-30T11:58:00Z", now, 300).is_ok());
        assert!(verify_timestamp("2026-08-30T12:04:59Z", now, 300).is_ok());
    }

    #[test]
    fn stale_or_future_timestamps_are_rejected() {
        let now = Utc.with_ymd_and_hms(2026, 8, 30, 12, 0, 0).unwrap();
        assert_eq!(
            verify_timestamp("2026-08-30T11:54:00Z", now, 300),
            Err(VerifyError::TimestampSkewed)
        );
        assert_eq!(
            verify_timestamp("2026-08-30T12:06:00Z", now, 300),
            Err(VerifyError::TimestampSkewed)
        );
        assert_eq!(
            verify_timestamp("ayer", now, 300),
            Err(VerifyError::TimestampMalformed)
        );
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay(300, 1), ChronoDuration::seconds(300));
        assert_eq!(backoff_delay(300, 2), ChronoDuration::seconds(600));
        assert_eq!(backoff_delay(300, 3), ChronoDuration::seconds(1200));
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(backoff_delay(300, 12), ChronoDuration::seconds(6 * 3600));
    }
}
