use std::time::{Duration, Instant};

use axum::extract::{Json, Path, Query, State};
use axum::http::StatusCode;
use chrono::Utc;
use diesel::prelude::*;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};
use crate::integrations::{
    self, apply_mappings, parse_mappings, AUTH_API_KEY, AUTH_BASIC, AUTH_BEARER, AUTH_NONE,
    AUTH_OAUTH2, CONN_CONNECTED, CONN_DISCONNECTED, CONN_ERROR, CONN_TESTING,
};
use crate::models::{
    Document, Integration, NewIntegration, NewOutboxEntry, NewSyncLogEntry, SyncLogEntry,
};
use crate::schema::{documents, integrations as integrations_table, sync_log, webhook_outbox};
use crate::state::AppState;
use crate::webhooks::{self, OUTBOUND_EVENTS};

/// Credential material never leaves the server; responses only say
/// whether something is on file.
#[derive(Serialize)]
pub struct IntegrationResponse {
    pub id: Uuid,
    pub nombre: String,
    pub codigo: String,
    pub tipo: String,
    pub url_base: String,
    pub autenticacion: String,
    pub credenciales_configuradas: bool,
    pub cabeceras: Value,
    pub mapeo_campos: Value,
    pub webhook_url: Option<String>,
    pub webhook_eventos: Value,
    pub webhook_secreto_configurado: bool,
    pub webhook_timeout_segundos: i32,
    pub webhook_reintentos_max: i32,
    pub limite_por_minuto: Option<i32>,
    pub estado_conexion: String,
    pub activa: bool,
    pub ultima_verificacion: Option<String>,
}

impl From<Integration> for IntegrationResponse {
    fn from(integration: Integration) -> Self {
        Self {
            id: integration.id,
            nombre: integration.name,
            codigo: integration.code,
            tipo: integration.kind,
            url_base: integration.base_url,
            autenticacion: integration.auth_kind,
            credenciales_configuradas: integration.credentials_sealed.is_some(),
            cabeceras: integration.headers,
            mapeo_campos: integration.field_mappings,
            webhook_url: integration.webhook_url,
            webhook_eventos: integration.webhook_events,
            webhook_secreto_configurado: integration.webhook_secret_sealed.is_some(),
            webhook_timeout_segundos: integration.webhook_timeout_seconds,
            webhook_reintentos_max: integration.webhook_max_retries,
            limite_por_minuto: integration.rate_limit_per_minute,
            estado_conexion: integration.connection_state,
            activa: integration.active,
            ultima_verificacion: integration
                .last_checked_at
                .map(|d| d.and_utc().to_rfc3339()),
        }
    }
}

fn validate_webhook_events(events: &Value) -> AppResult<()> {
    let Some(items) = events.as_array() else {
        return Err(AppError::bad_request("webhook_eventos debe ser una lista"));
    };
    for item in items {
        let Some(event) = item.as_str() else {
            return Err(AppError::bad_request("webhook_eventos contiene un valor no textual"));
        };
        if !OUTBOUND_EVENTS.contains(&event) {
            return Err(AppError::bad_request(format!(
                "evento desconocido: {event}"
            )));
        }
    }
    Ok(())
}

#[derive(Deserialize)]
pub struct CreateIntegrationRequest {
    pub nombre: String,
    pub codigo: String,
    pub tipo: String,
    pub url_base: String,
    pub autenticacion: String,
    pub credenciales: Option<String>,
    #[serde(default = "empty_object")]
    pub cabeceras: Value,
    #[serde(default = "empty_array")]
    pub mapeo_campos: Value,
    pub webhook_url: Option<String>,
    #[serde(default = "empty_array")]
    pub webhook_eventos: Value,
    pub webhook_secreto: Option<String>,
    pub webhook_timeout_segundos: Option<i32>,
    pub webhook_reintentos_max: Option<i32>,
    pub limite_por_minuto: Option<i32>,
}

fn empty_object() -> Value {
    json!({})
}

fn empty_array() -> Value {
    json!([])
}

pub async fn create_integration(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<CreateIntegrationRequest>,
) -> AppResult<(StatusCode, Json<IntegrationResponse>)> {
    if !user.is_admin() {
        return Err(AppError::forbidden("solo administracion gestiona integraciones"));
    }
    if !integrations::is_valid_kind(&payload.tipo) {
        return Err(AppError::bad_request(format!("tipo invalido: {}", payload.tipo)));
    }
    if !integrations::is_valid_auth_kind(&payload.autenticacion) {
        return Err(AppError::bad_request(format!(
            "autenticacion invalida: {}",
            payload.autenticacion
        )));
    }
    if payload.autenticacion != AUTH_NONE && payload.credenciales.is_none() {
        return Err(AppError::bad_request(
            "credenciales requeridas para este modo de autenticacion",
        ));
    }
    url::Url::parse(&payload.url_base)
        .map_err(|_| AppError::bad_request("url_base invalida"))?;
    if let Some(webhook_url) = payload.webhook_url.as_deref() {
        url::Url::parse(webhook_url).map_err(|_| AppError::bad_request("webhook_url invalida"))?;
        if payload.webhook_secreto.is_none() {
            return Err(AppError::bad_request(
                "webhook_secreto requerido cuando hay webhook_url",
            ));
        }
    }
    validate_webhook_events(&payload.webhook_eventos)?;
    parse_mappings(&payload.mapeo_campos)?;

    let credentials_sealed = payload
        .credenciales
        .as_deref()
        .map(|plain| state.vault.seal(plain))
        .transpose()
        .map_err(AppError::internal)?;
    let webhook_secret_sealed = payload
        .webhook_secreto
        .as_deref()
        .map(|plain| state.vault.seal(plain))
        .transpose()
        .map_err(AppError::internal)?;

    let row = NewIntegration {
        id: Uuid::new_v4(),
        name: payload.nombre.trim().to_string(),
        code: payload.codigo.trim().to_uppercase(),
        kind: payload.tipo,
        base_url: payload.url_base,
        auth_kind: payload.autenticacion,
        credentials_sealed,
        headers: payload.cabeceras,
        field_mappings: payload.mapeo_campos,
        webhook_url: payload.webhook_url,
        webhook_events: payload.webhook_eventos,
        webhook_secret_sealed,
        webhook_headers: json!({}),
        webhook_timeout_seconds: payload
            .webhook_timeout_segundos
            .unwrap_or(state.config.webhook_default_timeout_seconds),
        webhook_max_retries: payload
            .webhook_reintentos_max
            .unwrap_or(state.config.webhook_default_max_retries),
        webhook_skew_seconds: None,
        retry_backoff_seconds: state.config.webhook_default_backoff_seconds,
        rate_limit_per_minute: payload.limite_por_minuto,
        connection_state: CONN_DISCONNECTED.to_string(),
        active: true,
    };

    let mut conn = state.db()?;
    diesel::insert_into(integrations_table::table)
        .values(&row)
        .execute(&mut conn)?;
    let integration: Integration = integrations_table::table.find(row.id).first(&mut conn)?;
    info!(integracion = %integration.code, "integracion creada");
    Ok((StatusCode::CREATED, Json(integration.into())))
}

pub async fn list_integrations(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<IntegrationResponse>>> {
    if !user.is_admin() {
        return Err(AppError::forbidden("solo administracion gestiona integraciones"));
    }
    let mut conn = state.db()?;
    let rows: Vec<Integration> = integrations_table::table
        .order(integrations_table::name.asc())
        .load(&mut conn)?;
    Ok(Json(rows.into_iter().map(IntegrationResponse::from).collect()))
}

pub async fn get_integration(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<IntegrationResponse>> {
    if !user.is_admin() {
        return Err(AppError::forbidden("solo administracion gestiona integraciones"));
    }
    let mut conn = state.db()?;
    let integration: Integration = integrations_table::table
        .find(id)
        .first::<Integration>(&mut conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;
    Ok(Json(integration.into()))
}

#[derive(Deserialize)]
pub struct UpdateIntegrationRequest {
    pub nombre: Option<String>,
    pub url_base: Option<String>,
    pub credenciales: Option<String>,
    pub cabeceras: Option<Value>,
    pub mapeo_campos: Option<Value>,
    pub webhook_url: Option<String>,
    pub webhook_eventos: Option<Value>,
    pub webhook_secreto: Option<String>,
    pub webhook_timeout_segundos: Option<i32>,
    pub webhook_reintentos_max: Option<i32>,
    pub limite_por_minuto: Option<i32>,
    pub activa: Option<bool>,
}

pub async fn update_integration(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateIntegrationRequest>,
) -> AppResult<Json<IntegrationResponse>> {
    if !user.is_admin() {
        return Err(AppError::forbidden("solo administracion gestiona integraciones"));
    }
    if let Some(url_base) = payload.url_base.as_deref() {
        url::Url::parse(url_base).map_err(|_| AppError::bad_request("url_base invalida"))?;
    }
    if let Some(webhook_url) = payload.webhook_url.as_deref() {
        url::Url::parse(webhook_url).map_err(|_| AppError::bad_request("webhook_url invalida"))?;
    }
    if let Some(eventos) = payload.webhook_eventos.as_ref() {
        validate_webhook_events(eventos)?;
    }
    if let Some(mapeo) = payload.mapeo_campos.as_ref() {
        parse_mappings(mapeo)?;
    }

    let mut conn = state.db()?;
    integrations_table::table
        .find(id)
        .select(integrations_table::id)
        .first::<Uuid>(&mut conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;

    if let Some(nombre) = payload.nombre {
        diesel::update(integrations_table::table.find(id))
            .set(integrations_table::name.eq(nombre.trim().to_string()))
            .execute(&mut conn)?;
    }
    if let Some(url_base) = payload.url_base {
        diesel::update(integrations_table::table.find(id))
            .set(integrations_table::base_url.eq(url_base))
            .execute(&mut conn)?;
    }
    if let Some(credenciales) = payload.credenciales {
        let sealed = state.vault.seal(&credenciales).map_err(AppError::internal)?;
        diesel::update(integrations_table::table.find(id))
            .set(integrations_table::credentials_sealed.eq(Some(sealed)))
            .execute(&mut conn)?;
    }
    if let Some(cabeceras) = payload.cabeceras {
        diesel::update(integrations_table::table.find(id))
            .set(integrations_table::headers.eq(cabeceras))
            .execute(&mut conn)?;
    }
    if let Some(mapeo) = payload.mapeo_campos {
        diesel::update(integrations_table::table.find(id))
            .set(integrations_table::field_mappings.eq(mapeo))
            .execute(&mut conn)?;
    }
    if let Some(webhook_url) = payload.webhook_url {
        diesel::update(integrations_table::table.find(id))
            .set(integrations_table::webhook_url.eq(Some(webhook_url)))
            .execute(&mut conn)?;
    }
    if let Some(eventos) = payload.webhook_eventos {
        diesel::update(integrations_table::table.find(id))
            .set(integrations_table::webhook_events.eq(eventos))
            .execute(&mut conn)?;
    }
    if let Some(secreto) = payload.webhook_secreto {
        let sealed = state.vault.seal(&secreto).map_err(AppError::internal)?;
        diesel::update(integrations_table::table.find(id))
            .set(integrations_table::webhook_secret_sealed.eq(Some(sealed)))
            .execute(&mut conn)?;
    }
    if let Some(timeout) = payload.webhook_timeout_segundos {
        diesel::update(integrations_table::table.find(id))
            .set(integrations_table::webhook_timeout_seconds.eq(timeout))
            .execute(&mut conn)?;
    }
    if let Some(reintentos) = payload.webhook_reintentos_max {
        diesel::update(integrations_table::table.find(id))
            .set(integrations_table::webhook_max_retries.eq(reintentos))
            .execute(&mut conn)?;
    }
    if let Some(limite) = payload.limite_por_minuto {
        diesel::update(integrations_table::table.find(id))
            .set(integrations_table::rate_limit_per_minute.eq(Some(limite)))
            .execute(&mut conn)?;
    }
    if let Some(activa) = payload.activa {
        diesel::update(integrations_table::table.find(id))
            .set(integrations_table::active.eq(activa))
            .execute(&mut conn)?;
    }
    diesel::update(integrations_table::table.find(id))
        .set(integrations_table::updated_at.eq(Utc::now().naive_utc()))
        .execute(&mut conn)?;

    state.integration_cache.invalidate(id);
    let integration: Integration = integrations_table::table.find(id).first(&mut conn)?;
    Ok(Json(integration.into()))
}

pub async fn delete_integration(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    if !user.is_admin() {
        return Err(AppError::forbidden("solo administracion gestiona integraciones"));
    }
    let mut conn = state.db()?;
    let deleted = diesel::update(integrations_table::table.find(id))
        .set((
            integrations_table::active.eq(false),
            integrations_table::connection_state.eq(CONN_DISCONNECTED),
            integrations_table::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(&mut conn)?;
    if deleted == 0 {
        return Err(AppError::not_found());
    }
    state.integration_cache.invalidate(id);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
pub struct TestConnectionResponse {
    pub estado: String,
    pub codigo_http: Option<u16>,
    pub duracion_ms: i64,
}

/// Probes the partner's base URL with the stored credentials, records
/// the result in the sync log and updates the connection state.
pub async fn test_connection(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<TestConnectionResponse>> {
    if !user.is_admin() {
        return Err(AppError::forbidden("solo administracion gestiona integraciones"));
    }
    let mut conn = state.db()?;
    let integration: Integration = integrations_table::table
        .find(id)
        .first::<Integration>(&mut conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;

    // The probe can take a while; flag the row so concurrent readers see
    // the check in flight.
    diesel::update(integrations_table::table.find(id))
        .set(integrations_table::connection_state.eq(CONN_TESTING))
        .execute(&mut conn)?;

    let client = Client::builder()
        .timeout(Duration::from_secs(integration.webhook_timeout_seconds.max(1) as u64))
        .build()
        .map_err(AppError::internal)?;

    let mut request = client.get(&integration.base_url);
    if let Some(sealed) = integration.credentials_sealed.as_deref() {
        let plain = state.vault.open(sealed).map_err(AppError::internal)?;
        request = match integration.auth_kind.as_str() {
            AUTH_API_KEY => request.header("X-API-Key", plain),
            AUTH_BEARER | AUTH_OAUTH2 => request.bearer_auth(plain),
            AUTH_BASIC => match plain.split_once(':') {
                Some((username, secret)) => request.basic_auth(username, Some(secret)),
                None => request.basic_auth(plain, Option::<String>::None),
            },
            _ => request,
        };
    }
    if let Some(headers) = integration.headers.as_object() {
        for (name, value) in headers {
            if let Some(value) = value.as_str() {
                request = request.header(name.as_str(), value);
            }
        }
    }

    let started = Instant::now();
    let outcome = request.send().await;
    let duration_ms = started.elapsed().as_millis() as i64;
    let now = Utc::now().naive_utc();

    let (connection_state, http_status, log_status, response_body) = match outcome {
        Ok(response) if response.status().is_success() => {
            let status = response.status().as_u16();
            (CONN_CONNECTED, Some(status), "ok", json!({"codigo": status}))
        }
        Ok(response) => {
            let status = response.status().as_u16();
            warn!(integracion = %integration.code, codigo = status, "prueba de conexion rechazada");
            (CONN_ERROR, Some(status), "error", json!({"codigo": status}))
        }
        Err(err) => {
            warn!(integracion = %integration.code, error = %err, "prueba de conexion fallo");
            (CONN_ERROR, None, "error", json!({"error": err.to_string()}))
        }
    };

    diesel::update(integrations_table::table.find(id))
        .set((
            integrations_table::connection_state.eq(connection_state),
            integrations_table::last_checked_at.eq(Some(now)),
            integrations_table::updated_at.eq(now),
        ))
        .execute(&mut conn)?;
    state.integration_cache.invalidate(id);

    let log_entry = NewSyncLogEntry {
        id: Uuid::new_v4(),
        integration_id: id,
        document_id: None,
        operation: "prueba_conexion".to_string(),
        direction: "saliente".to_string(),
        request: json!({"url": integration.base_url}),
        response: Some(response_body),
        status: log_status.to_string(),
        attempt: 1,
        next_retry_at: None,
        duration_ms: Some(duration_ms),
        client_ip: None,
        user_agent: None,
    };
    diesel::insert_into(sync_log::table)
        .values(&log_entry)
        .execute(&mut conn)?;

    Ok(Json(TestConnectionResponse {
        estado: connection_state.to_string(),
        codigo_http: http_status,
        duracion_ms: duration_ms,
    }))
}

#[derive(Deserialize)]
pub struct SyncLogQuery {
    pub limite: Option<i64>,
    pub estado: Option<String>,
}

#[derive(Serialize)]
pub struct SyncLogResponse {
    pub id: Uuid,
    pub operacion: String,
    pub direccion: String,
    pub estado: String,
    pub intento: i32,
    pub duracion_ms: Option<i64>,
    pub documento_id: Option<Uuid>,
    pub fecha: String,
}

impl From<SyncLogEntry> for SyncLogResponse {
    fn from(entry: SyncLogEntry) -> Self {
        Self {
            id: entry.id,
            operacion: entry.operation,
            direccion: entry.direction,
            estado: entry.status,
            intento: entry.attempt,
            duracion_ms: entry.duration_ms,
            documento_id: entry.document_id,
            fecha: entry.created_at.and_utc().to_rfc3339(),
        }
    }
}

pub async fn sync_log(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Query(query): Query<SyncLogQuery>,
) -> AppResult<Json<Vec<SyncLogResponse>>> {
    if !user.is_admin() {
        return Err(AppError::forbidden("solo administracion gestiona integraciones"));
    }
    let mut conn = state.db()?;
    let limit = query.limite.unwrap_or(100).clamp(1, 500);

    let mut selection = sync_log::table
        .filter(sync_log::integration_id.eq(id))
        .into_boxed();
    if let Some(estado) = query.estado {
        selection = selection.filter(sync_log::status.eq(estado));
    }
    let rows: Vec<SyncLogEntry> = selection
        .order(sync_log::created_at.desc())
        .limit(limit)
        .load(&mut conn)?;
    Ok(Json(rows.into_iter().map(SyncLogResponse::from).collect()))
}

#[derive(Deserialize)]
pub struct SendDocumentRequest {
    pub documento_id: Uuid,
    #[serde(default)]
    pub forzar: bool,
}

#[derive(Serialize)]
pub struct SendDocumentResponse {
    pub encolado: bool,
    pub evento: String,
    pub expediente: String,
}

/// Pushes one document to a partner: projects it through the configured
/// field mappings and commits an outbox row for the dispatcher. Without
/// `forzar`, a still-undelivered push for the same pair is a conflict.
pub async fn send_document(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<SendDocumentRequest>,
) -> AppResult<(StatusCode, Json<SendDocumentResponse>)> {
    if !user.can_route() {
        return Err(AppError::forbidden("solo mesa de partes envia documentos"));
    }
    let mut conn = state.db()?;
    let integration: Integration = integrations_table::table
        .find(id)
        .first::<Integration>(&mut conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;
    if !integration.active {
        return Err(AppError::bad_request("integracion inactiva"));
    }
    if integration.webhook_url.is_none() {
        return Err(AppError::bad_request("integracion sin webhook_url"));
    }

    let doc: Document = documents::table
        .find(payload.documento_id)
        .first::<Document>(&mut conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;

    let local_view = json!({
        "expediente": doc.expedient_number,
        "tipo": doc.doc_type,
        "remitente": doc.sender,
        "asunto": doc.subject,
        "folios": doc.folios,
        "prioridad": doc.priority,
        "estado": doc.state,
        "recepcion": doc.reception_at.and_utc().to_rfc3339(),
        "plazo": doc.deadline.map(|d| d.and_utc().to_rfc3339()),
    });
    let mappings = parse_mappings(&integration.field_mappings)?;
    let datos = if mappings.is_empty() {
        local_view
    } else {
        apply_mappings(&local_view, &mappings)?
    };

    let event = webhooks::EVENT_DOCUMENTO_ACTUALIZADO;
    let expedient_number = doc.expedient_number.clone();
    conn.transaction::<_, AppError, _>(|conn| {
        if !payload.forzar {
            let open: i64 = webhook_outbox::table
                .filter(webhook_outbox::integration_id.eq(id))
                .filter(webhook_outbox::document_id.eq(doc.id))
                .filter(
                    webhook_outbox::status
                        .eq_any([webhooks::STATUS_QUEUED, webhooks::STATUS_PROCESSING]),
                )
                .count()
                .get_result(conn)?;
            if open > 0 {
                return Err(AppError::invalid_transition(
                    "ya existe un envio pendiente para este documento",
                ));
            }
        }

        let entry = NewOutboxEntry {
            id: Uuid::new_v4(),
            integration_id: id,
            event: event.to_string(),
            payload: webhooks::build_payload(event, id, &datos),
            document_id: Some(doc.id),
            status: webhooks::STATUS_QUEUED.to_string(),
            run_after: Utc::now().naive_utc(),
        };
        diesel::insert_into(webhook_outbox::table)
            .values(&entry)
            .execute(conn)?;

        let log_entry = NewSyncLogEntry {
            id: Uuid::new_v4(),
            integration_id: id,
            document_id: Some(doc.id),
            operation: "envio_documento".to_string(),
            direction: "saliente".to_string(),
            request: datos.clone(),
            response: None,
            status: "pendiente".to_string(),
            attempt: 1,
            next_retry_at: None,
            duration_ms: None,
            client_ip: None,
            user_agent: None,
        };
        diesel::insert_into(sync_log::table)
            .values(&log_entry)
            .execute(conn)?;
        Ok(())
    })?;

    info!(integracion = %integration.code, expediente = %expedient_number, "documento encolado para envio");
    Ok((
        StatusCode::ACCEPTED,
        Json(SendDocumentResponse {
            encolado: true,
            evento: event.to_string(),
            expediente: expedient_number,
        }),
    ))
}
