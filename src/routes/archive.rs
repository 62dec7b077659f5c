use axum::extract::{Json, Path, Query, State};
use axum::http::StatusCode;
use chrono::Utc;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::archive::{CLASSIFICATIONS, STATUS_ARCHIVED};
use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};
use crate::models::ArchiveRecord;
use crate::schema::archive_records;
use crate::state::AppState;
use crate::workflow::{self, ArchiveInput};

use super::documents::DocumentResponse;

#[derive(Serialize)]
pub struct ArchiveRecordResponse {
    pub id: Uuid,
    pub documento_id: Uuid,
    pub clasificacion: String,
    pub retencion: String,
    pub codigo_ubicacion: String,
    pub ubicacion_fisica: Option<String>,
    pub notas: Option<String>,
    pub archivado_por: Uuid,
    pub archivado: String,
    pub vence: Option<String>,
    pub estado: String,
    pub restaurado: Option<String>,
    pub motivo_restauracion: Option<String>,
}

impl From<ArchiveRecord> for ArchiveRecordResponse {
    fn from(record: ArchiveRecord) -> Self {
        Self {
            id: record.id,
            documento_id: record.document_id,
            clasificacion: record.classification,
            retencion: record.retention_policy,
            codigo_ubicacion: record.location_code,
            ubicacion_fisica: record.physical_location,
            notas: record.notes,
            archivado_por: record.archived_by,
            archivado: record.archived_at.and_utc().to_rfc3339(),
            vence: record.expires_at.map(|d| d.and_utc().to_rfc3339()),
            estado: record.status,
            restaurado: record.restored_at.map(|d| d.and_utc().to_rfc3339()),
            motivo_restauracion: record.restoration_reason,
        }
    }
}

#[derive(Deserialize)]
pub struct ArchiveRequest {
    pub clasificacion: String,
    pub retencion: String,
    pub ubicacion_fisica: Option<String>,
    pub notas: Option<String>,
}

pub async fn archive_document(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<ArchiveRequest>,
) -> AppResult<(StatusCode, Json<ArchiveRecordResponse>)> {
    let mut conn = state.db()?;
    let input = ArchiveInput {
        classification: payload.clasificacion,
        retention_policy: payload.retencion,
        physical_location: payload.ubicacion_fisica,
        notes: payload.notas,
    };
    let (doc, record) = workflow::archive_document(&mut conn, id, input, &user)?;
    info!(expediente = %doc.expedient_number, codigo = %record.location_code, "documento archivado");
    Ok((StatusCode::CREATED, Json(record.into())))
}

#[derive(Deserialize)]
pub struct RestoreRequest {
    pub motivo: String,
}

#[derive(Serialize)]
pub struct RestoreResponse {
    pub documento: DocumentResponse,
    pub registro: ArchiveRecordResponse,
    pub derivacion_id: Uuid,
}

pub async fn restore_document(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<RestoreRequest>,
) -> AppResult<Json<RestoreResponse>> {
    let mut conn = state.db()?;
    let (doc, record, derivation) =
        workflow::restore_document(&mut conn, id, payload.motivo, &user)?;
    info!(expediente = %doc.expedient_number, "documento restaurado del archivo");
    Ok(Json(RestoreResponse {
        documento: doc.into(),
        registro: record.into(),
        derivacion_id: derivation.id,
    }))
}

#[derive(Deserialize)]
pub struct ArchiveListQuery {
    pub clasificacion: Option<String>,
    pub retencion: Option<String>,
    pub estado: Option<String>,
    pub limite: Option<i64>,
    pub desplazamiento: Option<i64>,
}

pub async fn list_archive(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Query(query): Query<ArchiveListQuery>,
) -> AppResult<Json<Vec<ArchiveRecordResponse>>> {
    let mut conn = state.db()?;
    let mut selection = archive_records::table.into_boxed();
    if let Some(clasificacion) = query.clasificacion {
        selection = selection.filter(archive_records::classification.eq(clasificacion));
    }
    if let Some(retencion) = query.retencion {
        selection = selection.filter(archive_records::retention_policy.eq(retencion));
    }
    if let Some(estado) = query.estado {
        selection = selection.filter(archive_records::status.eq(estado));
    }

    let limit = query.limite.unwrap_or(50).clamp(1, 200);
    let offset = query.desplazamiento.unwrap_or(0).max(0);
    let records: Vec<ArchiveRecord> = selection
        .order(archive_records::archived_at.desc())
        .limit(limit)
        .offset(offset)
        .load(&mut conn)?;

    Ok(Json(
        records.into_iter().map(ArchiveRecordResponse::from).collect(),
    ))
}

pub async fn get_record(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ArchiveRecordResponse>> {
    let mut conn = state.db()?;
    let record: ArchiveRecord = archive_records::table
        .find(id)
        .first::<ArchiveRecord>(&mut conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;
    Ok(Json(record.into()))
}

/// Archive history of one document; restore-and-rearchive cycles leave
/// several records.
pub async fn document_records(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Vec<ArchiveRecordResponse>>> {
    let mut conn = state.db()?;
    let records: Vec<ArchiveRecord> = archive_records::table
        .filter(archive_records::document_id.eq(id))
        .order(archive_records::archived_at.desc())
        .load(&mut conn)?;
    Ok(Json(
        records.into_iter().map(ArchiveRecordResponse::from).collect(),
    ))
}

#[derive(Deserialize)]
pub struct UpdateRecordRequest {
    pub ubicacion_fisica: Option<String>,
    pub notas: Option<String>,
}

/// Shelf-keeping: the physical location and the notes can change after
/// archiving, nothing else can.
pub async fn update_record(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateRecordRequest>,
) -> AppResult<Json<ArchiveRecordResponse>> {
    if !(user.can_route() || user.is_supervisor()) {
        return Err(AppError::forbidden("sin permiso para editar el archivo"));
    }
    if payload.ubicacion_fisica.is_none() && payload.notas.is_none() {
        return Err(AppError::bad_request("nada que actualizar"));
    }

    let mut conn = state.db()?;
    archive_records::table
        .find(id)
        .select(archive_records::id)
        .first::<Uuid>(&mut conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;

    if let Some(ubicacion) = payload.ubicacion_fisica {
        diesel::update(archive_records::table.find(id))
            .set(archive_records::physical_location.eq(Some(ubicacion)))
            .execute(&mut conn)?;
    }
    if let Some(notas) = payload.notas {
        diesel::update(archive_records::table.find(id))
            .set(archive_records::notes.eq(Some(notas)))
            .execute(&mut conn)?;
    }
    diesel::update(archive_records::table.find(id))
        .set(archive_records::updated_at.eq(Utc::now().naive_utc()))
        .execute(&mut conn)?;

    let record: ArchiveRecord = archive_records::table.find(id).first(&mut conn)?;
    Ok(Json(record.into()))
}

/// Records whose retention ran out and are still on the shelf; what the
/// expurgo committee reviews.
pub async fn expired_records(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<ArchiveRecordResponse>>> {
    if !(user.can_route() || user.is_supervisor()) {
        return Err(AppError::forbidden("solo supervision revisa vencimientos"));
    }
    let mut conn = state.db()?;
    let now = Utc::now().naive_utc();
    let records: Vec<ArchiveRecord> = archive_records::table
        .filter(archive_records::status.eq(STATUS_ARCHIVED))
        .filter(archive_records::expires_at.is_not_null())
        .filter(archive_records::expires_at.le(now))
        .order(archive_records::expires_at.asc())
        .load(&mut conn)?;
    Ok(Json(
        records.into_iter().map(ArchiveRecordResponse::from).collect(),
    ))
}

pub async fn archive_statistics(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
) -> AppResult<Json<Value>> {
    let mut conn = state.db()?;
    let now = Utc::now().naive_utc();

    let total: i64 = archive_records::table.count().get_result(&mut conn)?;
    let active: i64 = archive_records::table
        .filter(archive_records::status.eq(STATUS_ARCHIVED))
        .count()
        .get_result(&mut conn)?;
    let expired: i64 = archive_records::table
        .filter(archive_records::status.eq(STATUS_ARCHIVED))
        .filter(archive_records::expires_at.is_not_null())
        .filter(archive_records::expires_at.le(now))
        .count()
        .get_result(&mut conn)?;

    let mut by_classification = json!({});
    for (name, _) in CLASSIFICATIONS {
        let count: i64 = archive_records::table
            .filter(archive_records::classification.eq(*name))
            .count()
            .get_result(&mut conn)?;
        by_classification[*name] = json!(count);
    }

    Ok(Json(json!({
        "total": total,
        "archivados": active,
        "restaurados": total - active,
        "retencion_vencida": expired,
        "por_clasificacion": by_classification,
    })))
}
