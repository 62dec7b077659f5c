use std::time::Duration;

use axum::extract::{Json, Multipart, Path, Query, State};
use axum::http::StatusCode;
use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};
use crate::lifecycle::{
    is_valid_priority, probe_matches_mime, validate_attachment, DOC_ARCHIVED,
};
use crate::models::{
    Derivation, Document, DocumentAttachment, DocumentAuditEntry, NewDocumentAttachment,
    NewDocumentAuditEntry,
};
use crate::schema::{derivations, document_attachments, document_audit, documents};
use crate::state::AppState;
use crate::webhooks;
use crate::workflow::{self, RegisterDocumentInput};

const PRESIGNED_URL_EXPIRY_SECONDS: u64 = 300;
const DEFAULT_PAGE_SIZE: i64 = 25;
const MAX_PAGE_SIZE: i64 = 100;

#[derive(Serialize)]
pub struct DocumentResponse {
    pub id: Uuid,
    pub expediente: String,
    pub tipo: String,
    pub remitente: String,
    pub asunto: String,
    pub folios: i32,
    pub prioridad: String,
    pub estado: String,
    pub area_actual: Option<Uuid>,
    pub recepcion: String,
    pub plazo: Option<String>,
    pub expediente_relacionado: Option<String>,
    pub etiquetas: Value,
    pub metadata: Value,
    pub archivado: Option<String>,
}

impl From<Document> for DocumentResponse {
    fn from(doc: Document) -> Self {
        Self {
            id: doc.id,
            expediente: doc.expedient_number,
            tipo: doc.doc_type,
            remitente: doc.sender,
            asunto: doc.subject,
            folios: doc.folios,
            prioridad: doc.priority,
            estado: doc.state,
            area_actual: doc.current_area_id,
            recepcion: doc.reception_at.and_utc().to_rfc3339(),
            plazo: doc.deadline.map(|d| d.and_utc().to_rfc3339()),
            expediente_relacionado: doc.related_expedient,
            etiquetas: doc.tags,
            metadata: doc.metadata,
            archivado: doc.archived_at.map(|d| d.and_utc().to_rfc3339()),
        }
    }
}

#[derive(Deserialize)]
pub struct RegisterDocumentRequest {
    pub tipo: String,
    pub remitente: String,
    pub asunto: String,
    pub folios: i32,
    #[serde(default = "default_priority")]
    pub prioridad: String,
    pub plazo: Option<NaiveDateTime>,
    pub expediente_relacionado: Option<String>,
    #[serde(default = "empty_array")]
    pub etiquetas: Value,
    #[serde(default = "empty_object")]
    pub metadata: Value,
    pub area_inicial: Option<Uuid>,
}

fn default_priority() -> String {
    crate::lifecycle::PRIORITY_NORMAL.to_string()
}

fn empty_array() -> Value {
    json!([])
}

fn empty_object() -> Value {
    json!({})
}

pub async fn register_document(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<RegisterDocumentRequest>,
) -> AppResult<(StatusCode, Json<DocumentResponse>)> {
    let mut conn = state.db()?;
    let input = RegisterDocumentInput {
        doc_type: payload.tipo,
        sender: payload.remitente,
        subject: payload.asunto,
        folios: payload.folios,
        priority: payload.prioridad,
        deadline: payload.plazo,
        related_expedient: payload.expediente_relacionado,
        tags: payload.etiquetas,
        metadata: payload.metadata,
        initial_area_id: payload.area_inicial,
    };
    let doc = workflow::register_document(&mut conn, input, &user)?;
    info!(expediente = %doc.expedient_number, "documento registrado");
    Ok((StatusCode::CREATED, Json(doc.into())))
}

#[derive(Deserialize)]
pub struct DocumentListQuery {
    pub estado: Option<String>,
    pub tipo: Option<String>,
    pub prioridad: Option<String>,
    pub area: Option<Uuid>,
    pub buscar: Option<String>,
    pub desde: Option<NaiveDateTime>,
    pub hasta: Option<NaiveDateTime>,
    pub limite: Option<i64>,
    pub desplazamiento: Option<i64>,
}

/// The same filter set feeds both the page query and the total count,
/// so the query is rebuilt rather than cloned.
fn filtered_documents(query: &DocumentListQuery) -> documents::BoxedQuery<'static, diesel::pg::Pg> {
    let mut selection = documents::table.into_boxed();
    if let Some(estado) = &query.estado {
        selection = selection.filter(documents::state.eq(estado.clone()));
    }
    if let Some(tipo) = &query.tipo {
        selection = selection.filter(documents::doc_type.eq(tipo.clone()));
    }
    if let Some(prioridad) = &query.prioridad {
        selection = selection.filter(documents::priority.eq(prioridad.clone()));
    }
    if let Some(area) = query.area {
        selection = selection.filter(documents::current_area_id.eq(area));
    }
    if let Some(buscar) = query
        .buscar
        .as_ref()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
    {
        let pattern = format!("%{buscar}%");
        selection = selection.filter(
            documents::subject
                .ilike(pattern.clone())
                .or(documents::sender.ilike(pattern.clone()))
                .or(documents::expedient_number.ilike(pattern)),
        );
    }
    if let Some(desde) = query.desde {
        selection = selection.filter(documents::reception_at.ge(desde));
    }
    if let Some(hasta) = query.hasta {
        selection = selection.filter(documents::reception_at.le(hasta));
    }
    selection
}

pub async fn list_documents(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Query(query): Query<DocumentListQuery>,
) -> AppResult<Json<Value>> {
    let mut conn = state.db()?;

    let limit = query
        .limite
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let offset = query.desplazamiento.unwrap_or(0).max(0);

    let total: i64 = filtered_documents(&query).count().get_result(&mut conn)?;
    let docs: Vec<Document> = filtered_documents(&query)
        .order(documents::reception_at.desc())
        .limit(limit)
        .offset(offset)
        .load(&mut conn)?;

    let documentos: Vec<DocumentResponse> = docs.into_iter().map(Into::into).collect();
    Ok(Json(json!({ "total": total, "documentos": documentos })))
}

pub async fn get_document(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<DocumentResponse>> {
    let mut conn = state.db()?;
    let doc: Document = documents::table
        .find(id)
        .first::<Document>(&mut conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;
    Ok(Json(doc.into()))
}

#[derive(Deserialize)]
pub struct UpdateDocumentRequest {
    pub asunto: Option<String>,
    pub prioridad: Option<String>,
    pub folios: Option<i32>,
    pub plazo: Option<NaiveDateTime>,
    pub expediente_relacionado: Option<String>,
    pub etiquetas: Option<Value>,
    pub metadata: Option<Value>,
}

pub async fn update_document(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateDocumentRequest>,
) -> AppResult<Json<DocumentResponse>> {
    if let Some(prioridad) = payload.prioridad.as_deref() {
        if !is_valid_priority(prioridad) {
            return Err(AppError::bad_request(format!(
                "prioridad invalida: {prioridad}"
            )));
        }
    }
    if let Some(folios) = payload.folios {
        if folios < 1 {
            return Err(AppError::bad_request("folios debe ser al menos 1"));
        }
    }

    let mut conn = state.db()?;
    let doc = conn.transaction::<Document, AppError, _>(|conn| {
        let doc: Document = documents::table
            .find(id)
            .for_update()
            .first::<Document>(conn)
            .optional()?
            .ok_or_else(AppError::not_found)?;
        if doc.state == DOC_ARCHIVED {
            return Err(AppError::invalid_transition(
                "un documento archivado es inmutable",
            ));
        }

        let now = Utc::now().naive_utc();
        let mut changes = json!({});
        if let Some(asunto) = &payload.asunto {
            diesel::update(documents::table.find(id))
                .set(documents::subject.eq(asunto.trim()))
                .execute(conn)?;
            changes["asunto"] = json!(asunto.trim());
        }
        if let Some(prioridad) = &payload.prioridad {
            diesel::update(documents::table.find(id))
                .set(documents::priority.eq(prioridad))
                .execute(conn)?;
            changes["prioridad"] = json!(prioridad);
        }
        if let Some(folios) = payload.folios {
            diesel::update(documents::table.find(id))
                .set(documents::folios.eq(folios))
                .execute(conn)?;
            changes["folios"] = json!(folios);
        }
        if let Some(plazo) = payload.plazo {
            diesel::update(documents::table.find(id))
                .set(documents::deadline.eq(Some(plazo)))
                .execute(conn)?;
            changes["plazo"] = json!(plazo.and_utc().to_rfc3339());
        }
        if let Some(rel) = &payload.expediente_relacionado {
            diesel::update(documents::table.find(id))
                .set(documents::related_expedient.eq(Some(rel.clone())))
                .execute(conn)?;
            changes["expediente_relacionado"] = json!(rel);
        }
        if let Some(etiquetas) = &payload.etiquetas {
            diesel::update(documents::table.find(id))
                .set(documents::tags.eq(etiquetas))
                .execute(conn)?;
            changes["etiquetas"] = etiquetas.clone();
        }
        if let Some(metadata) = &payload.metadata {
            diesel::update(documents::table.find(id))
                .set(documents::metadata.eq(metadata))
                .execute(conn)?;
            changes["metadata"] = metadata.clone();
        }

        diesel::update(documents::table.find(id))
            .set(documents::updated_at.eq(now))
            .execute(conn)?;
        let doc: Document = documents::table.find(id).first(conn)?;

        let entry = NewDocumentAuditEntry {
            id: Uuid::new_v4(),
            document_id: doc.id,
            actor: Some(user.user_id),
            action: "actualizado".to_string(),
            detail: changes,
        };
        diesel::insert_into(document_audit::table)
            .values(&entry)
            .execute(conn)?;

        workflow::emit_document_event(
            conn,
            webhooks::EVENT_DOCUMENTO_ACTUALIZADO,
            &doc,
            &json!({
                "documento_id": doc.id,
                "expediente": doc.expedient_number,
                "estado": doc.state,
                "prioridad": doc.priority,
            }),
        )?;

        Ok(doc)
    })?;

    Ok(Json(doc.into()))
}

#[derive(Serialize)]
pub struct AuditEntryResponse {
    pub id: Uuid,
    pub actor: Option<Uuid>,
    pub accion: String,
    pub detalle: Value,
    pub fecha: String,
}

/// Chronological trail: audit entries interleaved with the routing
/// hops, each hop rendered as a `derivacion` entry.
pub async fn document_audit_trail(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Vec<AuditEntryResponse>>> {
    let mut conn = state.db()?;
    documents::table
        .find(id)
        .select(documents::id)
        .first::<Uuid>(&mut conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;

    let entries: Vec<DocumentAuditEntry> = document_audit::table
        .filter(document_audit::document_id.eq(id))
        .order(document_audit::created_at.asc())
        .load(&mut conn)?;
    let hops: Vec<Derivation> = derivations::table
        .filter(derivations::document_id.eq(id))
        .order(derivations::dispatched_at.asc())
        .load(&mut conn)?;

    let mut trail: Vec<(NaiveDateTime, AuditEntryResponse)> = entries
        .into_iter()
        .map(|entry| {
            (
                entry.created_at,
                AuditEntryResponse {
                    id: entry.id,
                    actor: entry.actor,
                    accion: entry.action,
                    detalle: entry.detail,
                    fecha: entry.created_at.and_utc().to_rfc3339(),
                },
            )
        })
        .collect();
    trail.extend(hops.into_iter().map(|hop| {
        (
            hop.dispatched_at,
            AuditEntryResponse {
                id: hop.id,
                actor: hop.derived_by,
                accion: "derivacion".to_string(),
                detalle: json!({
                    "derivacion_id": hop.id,
                    "estado": hop.state,
                    "area_origen": hop.origin_area_id,
                    "area_destino": hop.destination_area_id,
                    "urgente": hop.urgent,
                }),
                fecha: hop.dispatched_at.and_utc().to_rfc3339(),
            },
        )
    }));
    trail.sort_by_key(|(at, _)| *at);

    Ok(Json(trail.into_iter().map(|(_, entry)| entry).collect()))
}

/// Exact expedient-number lookup; `buscar` on the listing is substring.
pub async fn find_by_expedient(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Path(expediente): Path<String>,
) -> AppResult<Json<DocumentResponse>> {
    let mut conn = state.db()?;
    let doc: Document = documents::table
        .filter(documents::expedient_number.eq(&expediente))
        .first::<Document>(&mut conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;
    Ok(Json(doc.into()))
}

/// Open documents already past their deadline, most overdue first.
pub async fn overdue_documents(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
) -> AppResult<Json<Vec<DocumentResponse>>> {
    let mut conn = state.db()?;
    let now = Utc::now().naive_utc();
    let docs: Vec<Document> = documents::table
        .filter(documents::state.ne(DOC_ARCHIVED))
        .filter(documents::deadline.is_not_null())
        .filter(documents::deadline.le(now))
        .order(documents::deadline.asc())
        .load(&mut conn)?;
    Ok(Json(docs.into_iter().map(Into::into).collect()))
}

#[derive(Serialize)]
pub struct AttachmentResponse {
    pub id: Uuid,
    pub nombre_original: String,
    pub mime: String,
    pub bytes: i64,
    pub fecha: String,
}

impl From<DocumentAttachment> for AttachmentResponse {
    fn from(attachment: DocumentAttachment) -> Self {
        Self {
            id: attachment.id,
            nombre_original: attachment.original_name,
            mime: attachment.mime_type,
            bytes: attachment.size_bytes,
            fecha: attachment.created_at.and_utc().to_rfc3339(),
        }
    }
}

pub async fn list_attachments(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Vec<AttachmentResponse>>> {
    let mut conn = state.db()?;
    let attachments: Vec<DocumentAttachment> = document_attachments::table
        .filter(document_attachments::document_id.eq(id))
        .order(document_attachments::created_at.asc())
        .load(&mut conn)?;
    Ok(Json(
        attachments.into_iter().map(AttachmentResponse::from).collect(),
    ))
}

pub async fn upload_attachment(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<AttachmentResponse>)> {
    let mut conn = state.db()?;
    let doc: Document = documents::table
        .find(id)
        .first::<Document>(&mut conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;
    if doc.state == DOC_ARCHIVED {
        return Err(AppError::invalid_transition(
            "un documento archivado no acepta adjuntos",
        ));
    }

    let mut file: Option<(String, String, Vec<u8>)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(format!("multipart invalido: {err}")))?
    {
        if field.name() == Some("archivo") {
            let original_name = field
                .file_name()
                .unwrap_or("adjunto")
                .to_string();
            let mime_type = field
                .content_type()
                .unwrap_or("application/octet-stream")
                .to_string();
            let bytes = field
                .bytes()
                .await
                .map_err(|err| AppError::bad_request(format!("lectura de adjunto fallo: {err}")))?
                .to_vec();
            file = Some((original_name, mime_type, bytes));
        }
    }
    let (original_name, mime_type, bytes) =
        file.ok_or_else(|| AppError::bad_request("falta el campo 'archivo'"))?;

    validate_attachment(&mime_type, bytes.len() as i64)?;
    if !probe_matches_mime(&bytes, &mime_type) {
        return Err(AppError::unprocessable(
            "el contenido del archivo no coincide con su tipo declarado",
        ));
    }

    let attachment_id = Uuid::new_v4();
    let blob_key = format!("adjuntos/{}/{}", doc.id, attachment_id);
    state
        .storage
        .put_object(&blob_key, bytes.clone(), Some(mime_type.clone()), None)
        .await
        .map_err(AppError::from)?;

    let row = NewDocumentAttachment {
        id: attachment_id,
        document_id: doc.id,
        blob_key,
        mime_type,
        size_bytes: bytes.len() as i64,
        original_name,
        uploaded_by: user.user_id,
    };
    diesel::insert_into(document_attachments::table)
        .values(&row)
        .execute(&mut conn)?;

    let entry = NewDocumentAuditEntry {
        id: Uuid::new_v4(),
        document_id: doc.id,
        actor: Some(user.user_id),
        action: "adjunto_agregado".to_string(),
        detail: json!({"adjunto_id": attachment_id}),
    };
    diesel::insert_into(document_audit::table)
        .values(&entry)
        .execute(&mut conn)?;

    let attachment: DocumentAttachment =
        document_attachments::table.find(attachment_id).first(&mut conn)?;
    Ok((StatusCode::CREATED, Json(attachment.into())))
}

#[derive(Serialize)]
pub struct DownloadResponse {
    pub url: String,
    pub expira_en_segundos: u64,
}

pub async fn download_attachment(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Path((id, attachment_id)): Path<(Uuid, Uuid)>,
) -> AppResult<Json<DownloadResponse>> {
    let mut conn = state.db()?;
    let attachment: DocumentAttachment = document_attachments::table
        .find(attachment_id)
        .first::<DocumentAttachment>(&mut conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;
    if attachment.document_id != id {
        return Err(AppError::not_found());
    }

    let url = state
        .storage
        .presign_get_object(
            &attachment.blob_key,
            Duration::from_secs(PRESIGNED_URL_EXPIRY_SECONDS),
        )
        .await
        .map_err(AppError::from)?;

    Ok(Json(DownloadResponse {
        url,
        expira_en_segundos: PRESIGNED_URL_EXPIRY_SECONDS,
    }))
}

/// Desk-level summary: totals grouped by state and priority, plus the
/// count of open documents already past their deadline.
pub async fn document_statistics(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
) -> AppResult<Json<Value>> {
    use diesel::dsl::count_star;

    let mut conn = state.db()?;
    let now = Utc::now().naive_utc();

    let total: i64 = documents::table.count().get_result(&mut conn)?;

    let by_state: Vec<(String, i64)> = documents::table
        .group_by(documents::state)
        .select((documents::state, count_star()))
        .load(&mut conn)?;

    let by_priority: Vec<(String, i64)> = documents::table
        .group_by(documents::priority)
        .select((documents::priority, count_star()))
        .load(&mut conn)?;

    let overdue: i64 = documents::table
        .filter(documents::state.ne(DOC_ARCHIVED))
        .filter(documents::deadline.is_not_null())
        .filter(documents::deadline.le(now))
        .count()
        .get_result(&mut conn)?;

    let por_estado: serde_json::Map<String, Value> = by_state
        .into_iter()
        .map(|(estado, cuenta)| (estado, json!(cuenta)))
        .collect();
    let por_prioridad: serde_json::Map<String, Value> = by_priority
        .into_iter()
        .map(|(prioridad, cuenta)| (prioridad, json!(cuenta)))
        .collect();

    Ok(Json(json!({
        "total": total,
        "por_estado": por_estado,
        "por_prioridad": por_prioridad,
        "vencidos": overdue,
    })))
}

#[derive(Serialize)]
pub struct QrPayloadResponse {
    pub expediente: String,
    pub token: String,
    pub url: String,
}

/// Payload the front end renders into a QR image. The token lets a
/// kiosk look up tracking state without a session.
pub async fn qr_payload(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<QrPayloadResponse>> {
    let mut conn = state.db()?;
    let doc: Document = documents::table
        .find(id)
        .first::<Document>(&mut conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;

    let url = format!(
        "{}/seguimiento/{}?token={}",
        state.config.public_base_url.trim_end_matches('/'),
        doc.expedient_number,
        doc.qr_token
    );
    Ok(Json(QrPayloadResponse {
        expediente: doc.expedient_number,
        token: doc.qr_token,
        url,
    }))
}
