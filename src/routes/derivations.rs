use axum::extract::{Json, Multipart, Path, Query, State};
use axum::http::StatusCode;
use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};
use crate::inbox;
use crate::lifecycle::{probe_matches_mime, validate_attachment, DER_PENDING, DER_RECEIVED};
use crate::models::Derivation;
use crate::schema::{derivations, documents};
use crate::state::AppState;
use crate::workflow::{self, DeriveInput};

#[derive(Serialize)]
pub struct DerivationResponse {
    pub id: Uuid,
    pub documento_id: Uuid,
    pub area_origen: Option<Uuid>,
    pub area_destino: Uuid,
    pub derivado_por: Option<Uuid>,
    pub instrucciones: String,
    pub urgente: bool,
    pub plazo: Option<String>,
    pub estado: String,
    pub enviado: String,
    pub recibido: Option<String>,
    pub atendido: Option<String>,
    pub cerrado: Option<String>,
    pub observaciones: Option<String>,
    pub sucesora_id: Option<Uuid>,
}

impl From<Derivation> for DerivationResponse {
    fn from(derivation: Derivation) -> Self {
        Self {
            id: derivation.id,
            documento_id: derivation.document_id,
            area_origen: derivation.origin_area_id,
            area_destino: derivation.destination_area_id,
            derivado_por: derivation.derived_by,
            instrucciones: derivation.instructions,
            urgente: derivation.urgent,
            plazo: derivation.deadline.map(|d| d.and_utc().to_rfc3339()),
            estado: derivation.state,
            enviado: derivation.dispatched_at.and_utc().to_rfc3339(),
            recibido: derivation.received_at.map(|d| d.and_utc().to_rfc3339()),
            atendido: derivation.attended_at.map(|d| d.and_utc().to_rfc3339()),
            cerrado: derivation.closed_at.map(|d| d.and_utc().to_rfc3339()),
            observaciones: derivation.observations,
            sucesora_id: derivation.successor_id,
        }
    }
}

#[derive(Deserialize)]
pub struct DeriveRequest {
    pub area_destino: Uuid,
    pub instrucciones: String,
    #[serde(default)]
    pub urgente: bool,
    pub plazo: Option<NaiveDateTime>,
}

pub async fn derive_document(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<DeriveRequest>,
) -> AppResult<(StatusCode, Json<DerivationResponse>)> {
    let mut conn = state.db()?;
    let input = DeriveInput {
        destination_area_id: payload.area_destino,
        instructions: payload.instrucciones,
        urgent: payload.urgente,
        deadline: payload.plazo,
    };
    let (doc, derivation) = workflow::derive_document(&mut conn, id, input, &user)?;
    info!(expediente = %doc.expedient_number, derivacion = %derivation.id, "documento derivado");
    Ok((StatusCode::CREATED, Json(derivation.into())))
}

#[derive(Deserialize)]
pub struct BulkDeriveRequest {
    pub documentos: Vec<Uuid>,
    pub area_destino: Uuid,
    pub instrucciones: String,
    #[serde(default)]
    pub urgente: bool,
    pub plazo: Option<NaiveDateTime>,
}

#[derive(Serialize)]
pub struct BulkDeriveItem {
    pub documento_id: Uuid,
    pub derivacion_id: Option<Uuid>,
    pub error: Option<String>,
}

pub async fn bulk_derive(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<BulkDeriveRequest>,
) -> AppResult<Json<Vec<BulkDeriveItem>>> {
    if payload.documentos.is_empty() {
        return Err(AppError::bad_request("lista de documentos vacia"));
    }
    let mut conn = state.db()?;
    let input = DeriveInput {
        destination_area_id: payload.area_destino,
        instructions: payload.instrucciones,
        urgent: payload.urgente,
        deadline: payload.plazo,
    };
    let outcomes = workflow::bulk_derive(&mut conn, &payload.documentos, &input, &user);
    Ok(Json(
        outcomes
            .into_iter()
            .map(|outcome| match outcome.result {
                Ok(derivation_id) => BulkDeriveItem {
                    documento_id: outcome.document_id,
                    derivacion_id: Some(derivation_id),
                    error: None,
                },
                Err(message) => BulkDeriveItem {
                    documento_id: outcome.document_id,
                    derivacion_id: None,
                    error: Some(message),
                },
            })
            .collect(),
    ))
}

/// Every routing hop of one document, oldest first.
pub async fn document_derivations(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Vec<DerivationResponse>>> {
    let mut conn = state.db()?;
    documents::table
        .find(id)
        .select(documents::id)
        .first::<Uuid>(&mut conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;

    let hops: Vec<Derivation> = derivations::table
        .filter(derivations::document_id.eq(id))
        .order(derivations::dispatched_at.asc())
        .load(&mut conn)?;
    Ok(Json(hops.into_iter().map(Into::into).collect()))
}

/// Open derivations waiting in the caller's own area.
pub async fn pending_for_user(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<DerivationResponse>>> {
    let area = user
        .area_id
        .ok_or_else(|| AppError::bad_request("el usuario no tiene area asignada"))?;

    let mut conn = state.db()?;
    let open: Vec<Derivation> = derivations::table
        .filter(derivations::destination_area_id.eq(area))
        .filter(derivations::state.eq_any([DER_PENDING, DER_RECEIVED]))
        .order(derivations::dispatched_at.asc())
        .load(&mut conn)?;
    Ok(Json(open.into_iter().map(Into::into).collect()))
}

pub async fn get_derivation(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<DerivationResponse>> {
    let mut conn = state.db()?;
    let derivation: Derivation = derivations::table
        .find(id)
        .first::<Derivation>(&mut conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;
    Ok(Json(derivation.into()))
}

#[derive(Deserialize)]
pub struct ReceiveRequest {
    pub observaciones: Option<String>,
}

pub async fn receive_derivation(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    payload: Option<Json<ReceiveRequest>>,
) -> AppResult<Json<DerivationResponse>> {
    let mut conn = state.db()?;
    let observations = payload.and_then(|Json(p)| p.observaciones);
    let (_, derivation) = workflow::receive_derivation(&mut conn, id, observations, &user)?;
    Ok(Json(derivation.into()))
}

/// Multipart: text field `observaciones` (required) plus an optional
/// `respuesta` file that lands in the blob store.
pub async fn attend_derivation(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    mut multipart: Multipart,
) -> AppResult<Json<DerivationResponse>> {
    let mut observations: Option<String> = None;
    let mut response_file: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(format!("multipart invalido: {err}")))?
    {
        match field.name() {
            Some("observaciones") => {
                let text = field
                    .text()
                    .await
                    .map_err(|err| AppError::bad_request(format!("campo invalido: {err}")))?;
                observations = Some(text);
            }
            Some("respuesta") => {
                let mime_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| {
                        AppError::bad_request(format!("lectura de respuesta fallo: {err}"))
                    })?
                    .to_vec();
                validate_attachment(&mime_type, bytes.len() as i64)?;
                if !probe_matches_mime(&bytes, &mime_type) {
                    return Err(AppError::unprocessable(
                        "el contenido del archivo no coincide con su tipo declarado",
                    ));
                }
                response_file = Some((mime_type, bytes));
            }
            _ => {}
        }
    }

    let observations = observations
        .filter(|text| !text.trim().is_empty())
        .ok_or_else(|| AppError::bad_request("observaciones requeridas para atender"))?;

    let response_blob_key = match response_file {
        Some((mime_type, bytes)) => {
            let key = format!("respuestas/{}/{}", id, Uuid::new_v4());
            state
                .storage
                .put_object(&key, bytes, Some(mime_type), None)
                .await
                .map_err(AppError::from)?;
            Some(key)
        }
        None => None,
    };

    let mut conn = state.db()?;
    let (doc, derivation) =
        workflow::attend_derivation(&mut conn, id, observations, response_blob_key, &user)?;
    info!(expediente = %doc.expedient_number, derivacion = %derivation.id, "derivacion atendida");
    Ok(Json(derivation.into()))
}

#[derive(Deserialize)]
pub struct ReassignRequest {
    pub area_destino: Uuid,
    pub motivo: String,
}

#[derive(Serialize)]
pub struct ReassignResponse {
    pub cerrada: DerivationResponse,
    pub sucesora: DerivationResponse,
}

pub async fn reassign_derivation(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<ReassignRequest>,
) -> AppResult<Json<ReassignResponse>> {
    if payload.motivo.trim().is_empty() {
        return Err(AppError::bad_request("motivo requerido"));
    }
    let mut conn = state.db()?;
    let (_, closed, successor) = workflow::reassign_derivation(
        &mut conn,
        id,
        payload.area_destino,
        payload.motivo,
        &user,
    )?;
    Ok(Json(ReassignResponse {
        cerrada: closed.into(),
        sucesora: successor.into(),
    }))
}

#[derive(Deserialize)]
pub struct ReturnRequest {
    pub motivo: String,
    pub observaciones: Option<String>,
}

#[derive(Serialize)]
pub struct ReturnResponse {
    pub cerrada: DerivationResponse,
    pub sucesora: Option<DerivationResponse>,
    pub estado_documento: String,
}

pub async fn return_derivation(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<ReturnRequest>,
) -> AppResult<Json<ReturnResponse>> {
    if payload.motivo.trim().is_empty() {
        return Err(AppError::bad_request("motivo requerido"));
    }
    let mut conn = state.db()?;
    let (doc, closed, successor) = workflow::return_derivation(
        &mut conn,
        id,
        payload.motivo,
        payload.observaciones,
        &user,
    )?;
    Ok(Json(ReturnResponse {
        cerrada: closed.into(),
        sucesora: successor.map(DerivationResponse::from),
        estado_documento: doc.state,
    }))
}

#[derive(Deserialize)]
pub struct InboxQuery {
    pub area: Option<Uuid>,
    #[serde(default)]
    pub urgentes: bool,
    #[serde(default)]
    pub vencidos: bool,
    pub por_vencer_dias: Option<i64>,
}

fn resolve_area(user: &AuthenticatedUser, requested: Option<Uuid>) -> AppResult<Uuid> {
    match requested {
        Some(area) if user.is_admin() || user.is_supervisor() || user.belongs_to(area) => Ok(area),
        Some(_) => Err(AppError::forbidden("bandeja de otra area")),
        None => user
            .area_id
            .ok_or_else(|| AppError::bad_request("el usuario no tiene area asignada")),
    }
}

#[derive(Serialize)]
pub struct InboxItemResponse {
    pub derivacion_id: Uuid,
    pub documento_id: Uuid,
    pub estado: String,
    pub urgente: bool,
    pub plazo: Option<String>,
    pub enviado: String,
}

pub async fn area_inbox(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(query): Query<InboxQuery>,
) -> AppResult<Json<Vec<InboxItemResponse>>> {
    let area = resolve_area(&user, query.area)?;
    let mut conn = state.db()?;

    let entries = if query.urgentes {
        inbox::urgent_for_area(&mut conn, area)?
    } else if query.vencidos {
        inbox::overdue(&mut conn, Some(area))?
    } else if let Some(days) = query.por_vencer_dias {
        inbox::due_within(&mut conn, Some(area), days)?
    } else {
        inbox::pending_for_area(&mut conn, area)?
    };

    Ok(Json(
        entries
            .into_iter()
            .map(|entry| InboxItemResponse {
                derivacion_id: entry.derivation_id,
                documento_id: entry.document_id,
                estado: entry.state,
                urgente: entry.urgent,
                plazo: entry.deadline.map(|d| d.and_utc().to_rfc3339()),
                enviado: entry.dispatched_at.and_utc().to_rfc3339(),
            })
            .collect(),
    ))
}

#[derive(Deserialize)]
pub struct StatsQuery {
    pub area: Option<Uuid>,
    pub ventana_dias: Option<i64>,
}

pub async fn area_statistics(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(query): Query<StatsQuery>,
) -> AppResult<Json<Value>> {
    let area = resolve_area(&user, query.area)?;
    let window = query.ventana_dias.unwrap_or(30).clamp(1, 365);
    let mut conn = state.db()?;
    let stats = inbox::area_stats(&mut conn, area, window)?;
    Ok(Json(json!({
        "area_id": stats.area_id,
        "abiertas": stats.open,
        "urgentes": stats.urgent,
        "vencidas": stats.overdue,
        "recibidas_en_ventana": stats.received_in_window,
        "atendidas_en_ventana": stats.attended_in_window,
        "ventana_dias": window,
    })))
}
