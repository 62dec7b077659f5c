//! Partner-facing surface. No JWT here: POST bodies carry an HMAC
//! signature over the canonical payload and GETs present the
//! integration's API key. Every rejection leaves a sync-log row.

use axum::extract::{Json, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::integrations::{apply_mappings_inbound, parse_mappings};
use crate::lifecycle::{self, DOC_IN_PROGRESS, DOC_REGISTERED, PRIORITY_NORMAL};
use crate::models::{Document, Integration, NewDocumentAuditEntry, NewSyncLogEntry};
use crate::schema::{document_audit, documents, integrations as integrations_table, sync_log};
use crate::state::AppState;
use crate::webhooks::{
    self, EVENT_HEADER, INTEGRATION_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};
use crate::workflow::{self, DeriveInput, RegisterDocumentInput};

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    header_value(headers, "x-forwarded-for")
        .map(|raw| raw.split(',').next().unwrap_or("").trim().to_string())
        .filter(|value| !value.is_empty())
}

fn load_integration(state: &AppState, headers: &HeaderMap) -> AppResult<Integration> {
    let raw = header_value(headers, INTEGRATION_HEADER)
        .ok_or_else(|| AppError::unauthorized())?;
    let id: Uuid = raw.parse().map_err(|_| AppError::unauthorized())?;

    if let Some(cached) = state.integration_cache.get(id) {
        return Ok(cached);
    }

    let mut conn = state.db()?;
    let integration: Integration = integrations_table::table
        .find(id)
        .first::<Integration>(&mut conn)
        .optional()?
        .ok_or_else(AppError::unauthorized)?;
    if !integration.active {
        return Err(AppError::unauthorized());
    }
    state.integration_cache.put(integration.clone());
    Ok(integration)
}

fn log_exchange(
    state: &AppState,
    integration_id: Uuid,
    operation: &str,
    status: &str,
    request: Value,
    response: Option<Value>,
    document_id: Option<Uuid>,
    headers: &HeaderMap,
) -> AppResult<()> {
    let mut conn = state.db()?;
    let entry = NewSyncLogEntry {
        id: Uuid::new_v4(),
        integration_id,
        document_id,
        operation: operation.to_string(),
        direction: "entrante".to_string(),
        request,
        response,
        status: status.to_string(),
        attempt: 1,
        next_retry_at: None,
        duration_ms: None,
        client_ip: client_ip(headers),
        user_agent: header_value(headers, "user-agent"),
    };
    diesel::insert_into(sync_log::table)
        .values(&entry)
        .execute(&mut conn)?;
    Ok(())
}

/// Timestamp and signature checks for a signed POST. Failures are
/// recorded before the 401 goes out.
fn verify_signed_request(
    state: &AppState,
    integration: &Integration,
    headers: &HeaderMap,
    body: &Value,
    operation: &str,
) -> AppResult<()> {
    let skew = integration
        .webhook_skew_seconds
        .map(i64::from)
        .unwrap_or(state.config.webhook_skew_seconds);

    let timestamp = header_value(headers, TIMESTAMP_HEADER)
        .ok_or_else(|| AppError::unauthorized())?;
    if let Err(reason) = webhooks::verify_timestamp(&timestamp, Utc::now(), skew) {
        warn!(integracion = %integration.code, %reason, "peticion firmada rechazada");
        log_exchange(
            state,
            integration.id,
            operation,
            "rechazado_timestamp",
            json!({"timestamp": timestamp}),
            Some(json!({"motivo": reason.to_string()})),
            None,
            headers,
        )?;
        return Err(AppError::unauthorized());
    }

    let sealed = integration
        .webhook_secret_sealed
        .as_deref()
        .ok_or_else(|| AppError::unauthorized())?;
    let secret = state.vault.open(sealed).map_err(AppError::internal)?;

    let signature = header_value(headers, SIGNATURE_HEADER)
        .ok_or_else(|| AppError::unauthorized())?;
    if webhooks::verify_signature(&secret, body, &signature).is_err() {
        warn!(integracion = %integration.code, "firma invalida");
        log_exchange(
            state,
            integration.id,
            operation,
            "rechazado_firma",
            json!({}),
            None,
            None,
            headers,
        )?;
        return Err(AppError::unauthorized());
    }
    Ok(())
}

/// API-key check for unsigned GETs.
fn verify_api_key(state: &AppState, integration: &Integration, headers: &HeaderMap) -> AppResult<()> {
    let sealed = integration
        .credentials_sealed
        .as_deref()
        .ok_or_else(|| AppError::unauthorized())?;
    let expected = state.vault.open(sealed).map_err(AppError::internal)?;
    let presented = header_value(headers, "X-API-Key").ok_or_else(|| AppError::unauthorized())?;
    if presented != expected {
        return Err(AppError::unauthorized());
    }
    Ok(())
}

/// Translates partner field names into ours before anything touches the
/// database.
fn translate_datos(integration: &Integration, datos: &Value) -> AppResult<Value> {
    let mappings = parse_mappings(&integration.field_mappings)?;
    if mappings.is_empty() {
        Ok(datos.clone())
    } else {
        apply_mappings_inbound(datos, &mappings)
    }
}

fn required_str<'a>(datos: &'a Value, key: &str) -> AppResult<&'a str> {
    datos
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| AppError::unprocessable(format!("datos.{key} requerido")))
}

fn optional_deadline(datos: &Value) -> AppResult<Option<chrono::NaiveDateTime>> {
    match datos.get("plazo").and_then(Value::as_str) {
        Some(raw) => {
            let parsed = DateTime::parse_from_rfc3339(raw)
                .map_err(|_| AppError::unprocessable("datos.plazo no es RFC 3339"))?;
            Ok(Some(parsed.with_timezone(&Utc).naive_utc()))
        }
        None => Ok(None),
    }
}

fn register_input_from_datos(datos: &Value) -> AppResult<RegisterDocumentInput> {
    Ok(RegisterDocumentInput {
        doc_type: datos
            .get("tipo")
            .and_then(Value::as_str)
            .unwrap_or("EXTERNO")
            .to_string(),
        sender: required_str(datos, "remitente")?.to_string(),
        subject: required_str(datos, "asunto")?.to_string(),
        folios: datos.get("folios").and_then(Value::as_i64).unwrap_or(1) as i32,
        priority: datos
            .get("prioridad")
            .and_then(Value::as_str)
            .unwrap_or(PRIORITY_NORMAL)
            .to_string(),
        deadline: optional_deadline(datos)?,
        related_expedient: datos
            .get("expediente_relacionado")
            .and_then(Value::as_str)
            .map(String::from),
        tags: datos.get("etiquetas").cloned().unwrap_or_else(|| json!([])),
        metadata: datos.get("metadata").cloned().unwrap_or_else(|| json!({})),
        initial_area_id: None,
    })
}

fn find_document_by_expedient(state: &AppState, expediente: &str) -> AppResult<Document> {
    let mut conn = state.db()?;
    documents::table
        .filter(documents::expedient_number.eq(expediente))
        .first::<Document>(&mut conn)
        .optional()?
        .ok_or_else(AppError::not_found)
}

pub async fn inbound_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AppResult<Json<Value>> {
    let integration = load_integration(&state, &headers)?;
    state
        .rate_limiter
        .check(integration.id, integration.rate_limit_per_minute.unwrap_or(0))?;
    verify_signed_request(&state, &integration, &headers, &body, "webhook_entrante")?;

    let event = header_value(&headers, EVENT_HEADER)
        .or_else(|| body.get("evento").and_then(|v| v.as_str()).map(String::from))
        .ok_or_else(|| AppError::bad_request("evento no indicado"))?;
    let datos = body.get("datos").cloned().unwrap_or_else(|| json!({}));
    let translated = translate_datos(&integration, &datos)?;

    let document_id = match event.as_str() {
        webhooks::EVENT_DOCUMENTO_CREADO => {
            let input = register_input_from_datos(&translated)?;
            let mut conn = state.db()?;
            let doc = workflow::register_document_external(&mut conn, input, integration.id)?;
            Some(doc.id)
        }
        webhooks::EVENT_DOCUMENTO_ACTUALIZADO => {
            let expediente = required_str(&translated, "expediente")?;
            let mut conn = state.db()?;
            let doc =
                workflow::update_document_external(&mut conn, expediente, &translated, integration.id)?;
            Some(doc.id)
        }
        webhooks::EVENT_DOCUMENTO_DERIVADO => {
            let expediente = required_str(&translated, "expediente")?;
            let area_destino: Uuid = required_str(&translated, "area_destino")?
                .parse()
                .map_err(|_| AppError::unprocessable("datos.area_destino no es un uuid"))?;
            let doc = find_document_by_expedient(&state, expediente)?;
            let input = DeriveInput {
                destination_area_id: area_destino,
                instructions: translated
                    .get("instrucciones")
                    .and_then(Value::as_str)
                    .unwrap_or("Derivacion externa")
                    .to_string(),
                urgent: translated
                    .get("urgente")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                deadline: optional_deadline(&translated)?,
            };
            let mut conn = state.db()?;
            let (doc, _) = workflow::derive_document_external(&mut conn, doc.id, input, integration.id)?;
            Some(doc.id)
        }
        webhooks::EVENT_ESTADO_SINCRONIZADO => {
            let expediente = required_str(&translated, "expediente")?;
            let mut conn = state.db()?;
            let doc =
                workflow::sync_external_state(&mut conn, expediente, &translated, integration.id)?;
            Some(doc.id)
        }
        other => {
            log_exchange(
                &state,
                integration.id,
                "webhook_entrante",
                "error",
                json!({"evento": other, "datos": datos}),
                Some(json!({"motivo": "evento no soportado"})),
                None,
                &headers,
            )?;
            return Err(AppError::unprocessable(format!("evento no soportado: {other}")));
        }
    };

    log_exchange(
        &state,
        integration.id,
        "webhook_entrante",
        "ok",
        json!({"evento": event, "datos": datos}),
        None,
        document_id,
        &headers,
    )?;
    info!(integracion = %integration.code, evento = %event, "webhook entrante procesado");
    Ok(Json(json!({"recibido": true})))
}

/// Direct intake from a partner system: the signed body carries the
/// document fields and a fresh expedient is allocated for it.
pub async fn receive_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let integration = load_integration(&state, &headers)?;
    state
        .rate_limiter
        .check(integration.id, integration.rate_limit_per_minute.unwrap_or(0))?;
    verify_signed_request(&state, &integration, &headers, &body, "recibir_documento")?;

    let datos = body.get("datos").cloned().unwrap_or_else(|| body.clone());
    let translated = translate_datos(&integration, &datos)?;
    let input = register_input_from_datos(&translated)?;

    let mut conn = state.db()?;
    let doc = workflow::register_document_external(&mut conn, input, integration.id)?;
    drop(conn);

    log_exchange(
        &state,
        integration.id,
        "recibir_documento",
        "ok",
        json!({"datos": datos}),
        Some(json!({"expediente": doc.expedient_number})),
        Some(doc.id),
        &headers,
    )?;
    info!(integracion = %integration.code, expediente = %doc.expedient_number, "documento externo recibido");
    Ok((
        StatusCode::CREATED,
        Json(json!({"id": doc.id, "expediente": doc.expedient_number})),
    ))
}

/// Partner push of its processing state for one expedient.
pub async fn update_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(expediente): Path<String>,
    Json(body): Json<Value>,
) -> AppResult<Json<Value>> {
    let integration = load_integration(&state, &headers)?;
    state
        .rate_limiter
        .check(integration.id, integration.rate_limit_per_minute.unwrap_or(0))?;
    verify_signed_request(&state, &integration, &headers, &body, "actualizar_estado")?;

    let datos = body.get("datos").cloned().unwrap_or_else(|| body.clone());
    let translated = translate_datos(&integration, &datos)?;

    let mut conn = state.db()?;
    let doc = workflow::sync_external_state(&mut conn, &expediente, &translated, integration.id)?;
    drop(conn);

    log_exchange(
        &state,
        integration.id,
        "actualizar_estado",
        "ok",
        json!({"expediente": expediente, "datos": datos}),
        None,
        Some(doc.id),
        &headers,
    )?;
    Ok(Json(json!({"sincronizado": true, "expediente": doc.expedient_number})))
}

pub async fn document_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(expediente): Path<String>,
) -> AppResult<Json<Value>> {
    let integration = load_integration(&state, &headers)?;
    state
        .rate_limiter
        .check(integration.id, integration.rate_limit_per_minute.unwrap_or(0))?;
    verify_api_key(&state, &integration, &headers)?;

    if lifecycle::parse_expedient_number(&expediente).is_none() {
        return Err(AppError::bad_request("numero de expediente invalido"));
    }

    let mut conn = state.db()?;
    let doc: Document = documents::table
        .filter(documents::expedient_number.eq(&expediente))
        .first::<Document>(&mut conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;

    log_exchange(
        &state,
        integration.id,
        "consulta_estado",
        "ok",
        json!({"expediente": expediente}),
        None,
        Some(doc.id),
        &headers,
    )?;

    Ok(Json(json!({
        "expediente": doc.expedient_number,
        "estado": doc.state,
        "prioridad": doc.priority,
        "area_actual": doc.current_area_id,
        "recepcion": doc.reception_at.and_utc().to_rfc3339(),
        "plazo": doc.deadline.map(|d| d.and_utc().to_rfc3339()),
    })))
}

#[derive(Deserialize)]
pub struct PendingQuery {
    pub limite: Option<i64>,
}

pub async fn pending_documents(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PendingQuery>,
) -> AppResult<Json<Value>> {
    let integration = load_integration(&state, &headers)?;
    state
        .rate_limiter
        .check(integration.id, integration.rate_limit_per_minute.unwrap_or(0))?;
    verify_api_key(&state, &integration, &headers)?;

    let limit = query.limite.unwrap_or(100).clamp(1, 500);
    let mut conn = state.db()?;
    let docs: Vec<Document> = documents::table
        .filter(documents::state.eq_any([DOC_REGISTERED, DOC_IN_PROGRESS]))
        .order(documents::reception_at.asc())
        .limit(limit)
        .load(&mut conn)?;

    log_exchange(
        &state,
        integration.id,
        "consulta_pendientes",
        "ok",
        json!({"limite": limit}),
        Some(json!({"total": docs.len()})),
        None,
        &headers,
    )?;

    let items: Vec<Value> = docs
        .into_iter()
        .map(|doc| {
            json!({
                "expediente": doc.expedient_number,
                "estado": doc.state,
                "prioridad": doc.priority,
                "asunto": doc.subject,
                "recepcion": doc.reception_at.and_utc().to_rfc3339(),
            })
        })
        .collect();
    Ok(Json(json!({"pendientes": items})))
}

pub async fn confirm_reception(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AppResult<Json<Value>> {
    let integration = load_integration(&state, &headers)?;
    state
        .rate_limiter
        .check(integration.id, integration.rate_limit_per_minute.unwrap_or(0))?;
    verify_signed_request(&state, &integration, &headers, &body, "confirmar_recepcion")?;

    let expediente = body
        .get("expediente")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::bad_request("expediente requerido"))?;

    let mut conn = state.db()?;
    let doc: Document = documents::table
        .filter(documents::expedient_number.eq(expediente))
        .first::<Document>(&mut conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;

    let audit = NewDocumentAuditEntry {
        id: Uuid::new_v4(),
        document_id: doc.id,
        actor: None,
        action: "recepcion_confirmada_externa".to_string(),
        detail: json!({"integracion_id": integration.id}),
    };
    diesel::insert_into(document_audit::table)
        .values(&audit)
        .execute(&mut conn)?;

    log_exchange(
        &state,
        integration.id,
        "confirmar_recepcion",
        "ok",
        json!({"expediente": expediente}),
        None,
        Some(doc.id),
        &headers,
    )?;
    Ok(Json(json!({"confirmado": true})))
}

pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

pub async fn version() -> Json<Value> {
    Json(json!({"version": env!("CARGO_PKG_VERSION")}))
}

/// Machine-readable description of the envelope partners receive.
pub async fn schema() -> Json<Value> {
    Json(json!({
        "eventos": webhooks::OUTBOUND_EVENTS,
        "sobre": {
            "evento": "string",
            "timestamp": "RFC 3339",
            "integracion_id": "uuid",
            "datos": "object",
        },
        "cabeceras": {
            "firma": webhooks::SIGNATURE_HEADER,
            "evento": webhooks::EVENT_HEADER,
            "timestamp": webhooks::TIMESTAMP_HEADER,
            "integracion": webhooks::INTEGRATION_HEADER,
        },
        "firma": "sha256=HMAC-SHA256(canonico(cuerpo))",
    }))
}
