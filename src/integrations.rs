//! Integration registry support: credential sealing, field mappings,
//! per-partner rate limiting and the read-mostly entry cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::Integration;

pub const KIND_API_REST: &str = "API_REST";
pub const KIND_WEBHOOK: &str = "WEBHOOK";
pub const KIND_SOAP: &str = "SOAP";
pub const KIND_FTP: &str = "FTP";

pub const INTEGRATION_KINDS: &[&str] = &[KIND_API_REST, KIND_WEBHOOK, KIND_SOAP, KIND_FTP];

pub const AUTH_API_KEY: &str = "API_KEY";
pub const AUTH_BEARER: &str = "BEARER";
pub const AUTH_BASIC: &str = "BASIC";
pub const AUTH_OAUTH2: &str = "OAUTH2";
pub const AUTH_NONE: &str = "NONE";

pub const AUTH_KINDS: &[&str] = &[AUTH_API_KEY, AUTH_BEARER, AUTH_BASIC, AUTH_OAUTH2, AUTH_NONE];

pub const CONN_CONNECTED: &str = "CONNECTED";
pub const CONN_DISCONNECTED: &str = "DISCONNECTED";
pub const CONN_ERROR: &str = "ERROR";
pub const CONN_TESTING: &str = "TESTING";

pub fn is_valid_kind(value: &str) -> bool {
    INTEGRATION_KINDS.contains(&value)
}

pub fn is_valid_auth_kind(value: &str) -> bool {
    AUTH_KINDS.contains(&value)
}

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("sealed blob is malformed")]
    Malformed,
    #[error("sealing operation failed")]
    Cipher,
}

/// Envelope encryption for partner credentials and webhook secrets.
/// The key is held by the process; sealed blobs are
/// base64(nonce || ciphertext) with a random 24-byte XChaCha20 nonce.
#[derive(Clone)]
pub struct CredentialVault {
    cipher: XChaCha20Poly1305,
}

impl CredentialVault {
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new((&key).into()),
        }
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, VaultError> {
        let mut nonce_bytes = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::Cipher)?;
        let mut blob = nonce_bytes.to_vec();
        blob.extend(ciphertext);
        Ok(BASE64.encode(blob))
    }

    pub fn open(&self, sealed: &str) -> Result<String, VaultError> {
        let blob = BASE64.decode(sealed).map_err(|_| VaultError::Malformed)?;
        if blob.len() < 24 {
            return Err(VaultError::Malformed);
        }
        let (nonce_bytes, ciphertext) = blob.split_at(24);
        let nonce = XNonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| VaultError::Cipher)?;
        String::from_utf8(plaintext).map_err(|_| VaultError::Malformed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMapping {
    pub local: String,
    pub remote: String,
    #[serde(default)]
    pub transform: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
}

pub fn parse_mappings(raw: &Value) -> AppResult<Vec<FieldMapping>> {
    serde_json::from_value(raw.clone())
        .map_err(|err| AppError::bad_request(format!("field mappings invalidos: {err}")))
}

fn apply_transform(value: Value, transform: &str) -> AppResult<Value> {
    let transformed = match (transform, &value) {
        ("uppercase", Value::String(s)) => Value::String(s.to_uppercase()),
        ("lowercase", Value::String(s)) => Value::String(s.to_lowercase()),
        ("trim", Value::String(s)) => Value::String(s.trim().to_string()),
        ("to_string", other) => match other {
            Value::String(_) => value,
            other => Value::String(other.to_string()),
        },
        (other, _) => {
            return Err(AppError::bad_request(format!(
                "transformacion desconocida: {other}"
            )))
        }
    };
    Ok(transformed)
}

/// Projects a local document view into the remote shape. A required
/// field with neither a value nor a default fails the send, not the
/// configuration.
pub fn apply_mappings(local: &Value, mappings: &[FieldMapping]) -> AppResult<Value> {
    let mut out = Map::new();
    for mapping in mappings {
        let value = local.get(&mapping.local).cloned().filter(|v| !v.is_null());
        let value = match (value, &mapping.default) {
            (Some(v), _) => Some(v),
            (None, Some(default)) => Some(default.clone()),
            (None, None) => None,
        };
        match value {
            Some(v) => {
                let v = match &mapping.transform {
                    Some(t) => apply_transform(v, t)?,
                    None => v,
                };
                out.insert(mapping.remote.clone(), v);
            }
            None if mapping.required => {
                return Err(AppError::unprocessable(format!(
                    "campo requerido sin valor ni default: {}",
                    mapping.local
                )));
            }
            None => {}
        }
    }
    Ok(Value::Object(out))
}

/// Inverse projection: translates a partner payload (remote names) back
/// into the local shape.
pub fn apply_mappings_inbound(remote: &Value, mappings: &[FieldMapping]) -> AppResult<Value> {
    let mut out = Map::new();
    for mapping in mappings {
        let value = remote
            .get(&mapping.remote)
            .cloned()
            .filter(|v| !v.is_null());
        let value = match (value, &mapping.default) {
            (Some(v), _) => Some(v),
            (None, Some(default)) => Some(default.clone()),
            (None, None) => None,
        };
        match value {
            Some(v) => {
                let v = match &mapping.transform {
                    Some(t) => apply_transform(v, t)?,
                    None => v,
                };
                out.insert(mapping.local.clone(), v);
            }
            None if mapping.required => {
                return Err(AppError::unprocessable(format!(
                    "campo requerido sin valor ni default: {}",
                    mapping.remote
                )));
            }
            None => {}
        }
    }
    Ok(Value::Object(out))
}

/// Fixed-window limiter keyed by integration. Excess calls fail with
/// 429 and are not retried by the core.
#[derive(Clone, Default)]
pub struct RateLimiter {
    windows: Arc<Mutex<HashMap<Uuid, (Instant, u32)>>>,
}

impl RateLimiter {
    pub fn check(&self, integration_id: Uuid, limit_per_minute: i32) -> AppResult<()> {
        if limit_per_minute <= 0 {
            return Ok(());
        }
        let mut windows = self
            .windows
            .lock()
            .map_err(|_| AppError::internal("rate limiter poisoned"))?;
        let now = Instant::now();
        let entry = windows.entry(integration_id).or_insert((now, 0));
        if now.duration_since(entry.0) >= Duration::from_secs(60) {
            *entry = (now, 0);
        }
        if entry.1 >= limit_per_minute as u32 {
            return Err(AppError::rate_limited(
                "limite de solicitudes de la integracion excedido",
            ));
        }
        entry.1 += 1;
        Ok(())
    }
}

/// Read-mostly cache over integration rows, TTL-bounded and invalidated
/// on every CRUD write.
#[derive(Clone)]
pub struct IntegrationCache {
    ttl: Duration,
    entries: Arc<RwLock<HashMap<Uuid, (Integration, Instant)>>>,
}

impl IntegrationCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn get(&self, id: Uuid) -> Option<Integration> {
        let entries = self.entries.read().ok()?;
        let (integration, stored_at) = entries.get(&id)?;
        if stored_at.elapsed() > self.ttl {
            return None;
        }
        Some(integration.clone())
    }

    pub fn put(&self, integration: Integration) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(integration.id, (integration, Instant::now()));
        }
    }

    pub fn invalidate(&self, id: Uuid) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vault() -> CredentialVault {
        CredentialVault::new([7u8; 32])
    }

    #[test]
    fn seal_then_open_returns_plaintext() {
        let vault = vault();
        let sealed = vault.seal("api-key-123").unwrap();
        assert_ne!(sealed, "api-key-123");
        assert_eq!(vault.open(&sealed).unwrap(), "api-key-123");
    }

    #[test]
    fn sealing_twice_yields_distinct_blobs() {
        let vault = vault();
        let a = vault.seal("secret").unwrap();
        let b = vault.seal("secret").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_blob_is_rejected() {
        let vault = vault();
        let sealed = vault.seal("secret").unwrap();
        let mut blob = BASE64.decode(&sealed).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        let tampered = BASE64.encode(blob);
        assert!(vault.open(&tampered).is_err());
    }

    #[test]
    fn wrong_key_cannot_open() {
        let sealed = vault().seal("secret").unwrap();
        let other = CredentialVault::new([9u8; 32]);
        assert!(other.open(&sealed).is_err());
    }

    #[test]
    fn mappings_rename_and_transform() {
        let mappings = vec![
            FieldMapping {
                local: "expediente".into(),
                remote: "reference".into(),
                transform: Some("uppercase".into()),
                required: true,
                default: None,
            },
            FieldMapping {
                local: "asunto".into(),
                remote: "subject".into(),
                transform: None,
                required: false,
                default: None,
            },
        ];
        let local = json!({"expediente": "exp-2026-0001", "asunto": "Consulta"});
        let remote = apply_mappings(&local, &mappings).unwrap();
        assert_eq!(remote["reference"], "EXP-2026-0001");
        assert_eq!(remote["subject"], "Consulta");
    }

    #[test]
    fn inbound_mapping_translates_back_to_local_names() {
        let mappings = vec![FieldMapping {
            local: "expediente".into(),
            remote: "numero_expediente".into(),
            transform: None,
            required: true,
            default: None,
        }];
        let remote = json!({"numero_expediente": "EXP-2026-0001"});
        let local = apply_mappings_inbound(&remote, &mappings).unwrap();
        assert_eq!(local["expediente"], "EXP-2026-0001");
        assert!(local.get("numero_expediente").is_none());
    }

    #[test]
    fn required_without_default_fails_the_send() {
        let mappings = vec![FieldMapping {
            local: "remitente".into(),
            remote: "sender".into(),
            transform: None,
            required: true,
            default: None,
        }];
        let err = apply_mappings(&json!({}), &mappings).unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn default_fills_missing_optional_and_required() {
        let mappings = vec![FieldMapping {
            local: "prioridad".into(),
            remote: "priority".into(),
            transform: None,
            required: true,
            default: Some(json!("NORMAL")),
        }];
        let remote = apply_mappings(&json!({}), &mappings).unwrap();
        assert_eq!(remote["priority"], "NORMAL");
    }

    #[test]
    fn rate_limiter_enforces_window() {
        let limiter = RateLimiter::default();
        let id = Uuid::new_v4();
        for _ in 0..2 {
            assert!(limiter.check(id, 2).is_ok());
        }
        let err = limiter.check(id, 2).unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::TOO_MANY_REQUESTS);
        // Other integrations keep their own window.
        assert!(limiter.check(Uuid::new_v4(), 2).is_ok());
    }

    #[test]
    fn unlimited_integrations_never_throttle() {
        let limiter = RateLimiter::default();
        let id = Uuid::new_v4();
        for _ in 0..100 {
            assert!(limiter.check(id, 0).is_ok());
        }
    }
}
