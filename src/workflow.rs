//! Workflow coordinator. Every public mutation of a document runs here:
//! one transaction that locks the document row, validates the state
//! machines, writes the ledger, the inbox projection, the audit trail,
//! the outbox rows and the in-app notifications together. Email and
//! webhook delivery happen after commit on their own loops.

use chrono::{NaiveDateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use rand::RngCore;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::allocator;
use crate::archive::{self, STATUS_ARCHIVED, STATUS_RESTORED};
use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};
use crate::inbox;
use crate::lifecycle::{
    ensure_derivation_attendable, ensure_derivation_closable, ensure_derivation_receivable,
    ensure_document_transition, is_valid_priority, DER_ATTENDED, DER_PENDING, DER_REASSIGNED,
    DER_RECEIVED, DER_RETURNED, DOC_ARCHIVED, DOC_ATTENDED, DOC_IN_PROGRESS, DOC_REGISTERED,
    PRIORITY_NORMAL, PRIORITY_URGENTE,
};
use crate::models::{
    Area, ArchiveRecord, Derivation, Document, NewArchiveRecord, NewDerivation, NewDocument,
    NewDocumentAuditEntry,
};
use crate::notify;
use crate::schema::{archive_records, areas, derivations, document_audit, documents};
use crate::webhooks;

pub struct RegisterDocumentInput {
    pub doc_type: String,
    pub sender: String,
    pub subject: String,
    pub folios: i32,
    pub priority: String,
    pub deadline: Option<NaiveDateTime>,
    pub related_expedient: Option<String>,
    pub tags: Value,
    pub metadata: Value,
    /// Area the intake desk expects to work the document; only used to
    /// target the urgent-document notification.
    pub initial_area_id: Option<Uuid>,
}

pub struct DeriveInput {
    pub destination_area_id: Uuid,
    pub instructions: String,
    pub urgent: bool,
    pub deadline: Option<NaiveDateTime>,
}

pub struct ArchiveInput {
    pub classification: String,
    pub retention_policy: String,
    pub physical_location: Option<String>,
    pub notes: Option<String>,
}

fn generate_qr_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn lock_document(conn: &mut PgConnection, document_id: Uuid) -> AppResult<Document> {
    documents::table
        .find(document_id)
        .for_update()
        .first::<Document>(conn)
        .optional()?
        .ok_or_else(AppError::not_found)
}

fn load_area(conn: &mut PgConnection, area_id: Uuid) -> AppResult<Area> {
    let area: Option<Area> = areas::table.find(area_id).first(conn).optional()?;
    match area {
        Some(area) if area.active => Ok(area),
        Some(_) => Err(AppError::bad_request("el area destino esta inactiva")),
        None => Err(AppError::bad_request("area destino desconocida")),
    }
}

fn append_audit(
    conn: &mut PgConnection,
    document_id: Uuid,
    actor: Option<Uuid>,
    action: &str,
    detail: Value,
) -> AppResult<()> {
    let entry = NewDocumentAuditEntry {
        id: Uuid::new_v4(),
        document_id,
        actor,
        action: action.to_string(),
        detail,
    };
    diesel::insert_into(document_audit::table)
        .values(&entry)
        .execute(conn)?;
    Ok(())
}

fn document_event_datos(doc: &Document) -> Value {
    json!({
        "documento_id": doc.id,
        "expediente": doc.expedient_number,
        "tipo": doc.doc_type,
        "estado": doc.state,
        "prioridad": doc.priority,
        "area_actual": doc.current_area_id,
        "asunto": doc.subject,
    })
}

fn derivation_event_datos(doc: &Document, derivation: &Derivation) -> Value {
    json!({
        "documento_id": doc.id,
        "expediente": doc.expedient_number,
        "derivacion_id": derivation.id,
        "estado": derivation.state,
        "area_origen": derivation.origin_area_id,
        "area_destino": derivation.destination_area_id,
        "urgente": derivation.urgent,
        "plazo": derivation.deadline.map(|d| d.and_utc().to_rfc3339()),
    })
}

fn open_derivation(conn: &mut PgConnection, document_id: Uuid) -> AppResult<Option<Derivation>> {
    let open = derivations::table
        .filter(derivations::document_id.eq(document_id))
        .filter(derivations::state.eq_any([DER_PENDING, DER_RECEIVED]))
        .first::<Derivation>(conn)
        .optional()?;
    Ok(open)
}

/// Queues the outbox fan-out and notifies every user who subscribed to
/// the event by name in their preferences. Runs inside the caller's
/// transaction so a rollback takes both with it.
pub fn emit_document_event(
    conn: &mut PgConnection,
    event: &str,
    doc: &Document,
    datos: &Value,
) -> AppResult<()> {
    webhooks::enqueue_event(conn, event, Some(doc.id), datos).map_err(AppError::internal)?;

    let subscribers = notify::event_subscribers(conn, event)?;
    if !subscribers.is_empty() {
        notify::notify_users(
            conn,
            &subscribers,
            notify::KIND_EVENTO_SUSCRITO,
            &format!("Evento {event}"),
            &format!("{} ({})", doc.subject, doc.expedient_number),
            PRIORITY_NORMAL,
            Some(doc.id),
        )?;
    }
    Ok(())
}

fn validate_register_input(input: &RegisterDocumentInput) -> AppResult<()> {
    if !is_valid_priority(&input.priority) {
        return Err(AppError::bad_request(format!(
            "prioridad invalida: {}",
            input.priority
        )));
    }
    if input.sender.trim().is_empty() {
        return Err(AppError::bad_request("remitente requerido"));
    }
    if input.subject.trim().is_empty() {
        return Err(AppError::bad_request("asunto requerido"));
    }
    if input.folios < 1 {
        return Err(AppError::bad_request("folios debe ser al menos 1"));
    }
    Ok(())
}

fn register_with_origin(
    conn: &mut PgConnection,
    input: RegisterDocumentInput,
    created_by: Option<Uuid>,
    source_integration: Option<Uuid>,
) -> AppResult<Document> {
    validate_register_input(&input)?;

    conn.transaction::<Document, AppError, _>(|conn| {
        let now = Utc::now().naive_utc();
        let year = Utc::now().format("%Y").to_string().parse::<i32>().unwrap_or(1970);
        let expedient_number = allocator::allocate_expedient(conn, year)
            .map_err(|err| AppError::internal(format!("asignacion de expediente fallo: {err}")))?;

        let new_doc = NewDocument {
            id: Uuid::new_v4(),
            expedient_number,
            doc_type: input.doc_type.clone(),
            sender: input.sender.trim().to_string(),
            subject: input.subject.trim().to_string(),
            folios: input.folios,
            priority: input.priority.clone(),
            state: DOC_REGISTERED.to_string(),
            current_area_id: None,
            reception_at: now,
            deadline: input.deadline,
            related_expedient: input.related_expedient.clone(),
            qr_token: generate_qr_token(),
            tags: input.tags.clone(),
            metadata: input.metadata.clone(),
            created_by,
        };
        diesel::insert_into(documents::table)
            .values(&new_doc)
            .execute(conn)?;

        let doc: Document = documents::table.find(new_doc.id).first(conn)?;

        let (action, detail) = match source_integration {
            Some(integration_id) => (
                "registrado_externo",
                json!({
                    "expediente": doc.expedient_number,
                    "integracion_id": integration_id,
                }),
            ),
            None => ("registrado", json!({"expediente": doc.expedient_number})),
        };
        append_audit(conn, doc.id, created_by, action, detail)?;

        emit_document_event(
            conn,
            webhooks::EVENT_DOCUMENTO_CREADO,
            &doc,
            &document_event_datos(&doc),
        )?;

        if doc.priority == PRIORITY_URGENTE {
            if let Some(area_id) = input.initial_area_id {
                let recipients = notify::users_of_area(conn, area_id)?;
                notify::notify_users(
                    conn,
                    &recipients,
                    notify::KIND_DOCUMENTO_URGENTE,
                    &format!("Documento urgente {}", doc.expedient_number),
                    &format!("Ingreso urgente: {}", doc.subject),
                    PRIORITY_URGENTE,
                    Some(doc.id),
                )?;
            }
        }

        Ok(doc)
    })
}

/// Intake: allocates the expedient number, persists the document in
/// REGISTERED with no owning area, seeds the audit trail and fans out
/// the creation event.
pub fn register_document(
    conn: &mut PgConnection,
    input: RegisterDocumentInput,
    actor: &AuthenticatedUser,
) -> AppResult<Document> {
    if !actor.can_route() {
        return Err(AppError::forbidden("solo mesa de partes registra documentos"));
    }
    register_with_origin(conn, input, Some(actor.user_id), None)
}

/// Intake on behalf of a partner system. The HMAC layer already
/// authenticated the caller, so there is no local actor.
pub fn register_document_external(
    conn: &mut PgConnection,
    input: RegisterDocumentInput,
    integration_id: Uuid,
) -> AppResult<Document> {
    register_with_origin(conn, input, None, Some(integration_id))
}

/// Routes a document to an area. Rejected while another derivation is
/// still open; re-deriving an attended document reopens it.
pub fn derive_document(
    conn: &mut PgConnection,
    document_id: Uuid,
    input: DeriveInput,
    actor: &AuthenticatedUser,
) -> AppResult<(Document, Derivation)> {
    derive_with_origin(conn, document_id, input, Some(actor), None)
}

/// Routing announced by a partner system; the derivation carries no
/// local actor but honors the same state machine.
pub fn derive_document_external(
    conn: &mut PgConnection,
    document_id: Uuid,
    input: DeriveInput,
    integration_id: Uuid,
) -> AppResult<(Document, Derivation)> {
    derive_with_origin(conn, document_id, input, None, Some(integration_id))
}

fn derive_with_origin(
    conn: &mut PgConnection,
    document_id: Uuid,
    input: DeriveInput,
    actor: Option<&AuthenticatedUser>,
    source_integration: Option<Uuid>,
) -> AppResult<(Document, Derivation)> {
    conn.transaction::<(Document, Derivation), AppError, _>(|conn| {
        let doc = lock_document(conn, document_id)?;

        if let Some(actor) = actor {
            let allowed = actor.can_route()
                || doc
                    .current_area_id
                    .map(|area| actor.belongs_to(area))
                    .unwrap_or(false);
            if !allowed {
                return Err(AppError::forbidden("sin permiso para derivar este documento"));
            }
        }

        if doc.state == DOC_ARCHIVED {
            return Err(AppError::invalid_transition(
                "un documento archivado no puede derivarse",
            ));
        }
        if let Some(open) = open_derivation(conn, doc.id)? {
            return Err(AppError::invalid_transition(format!(
                "el documento tiene una derivacion abierta ({})",
                open.state
            )));
        }

        let now = Utc::now().naive_utc();
        if let Some(deadline) = input.deadline {
            if deadline <= now {
                return Err(AppError::bad_request("el plazo debe ser posterior al envio"));
            }
        }
        load_area(conn, input.destination_area_id)?;

        if doc.state != DOC_IN_PROGRESS {
            ensure_document_transition(&doc.state, DOC_IN_PROGRESS)?;
        }

        let new_derivation = NewDerivation {
            id: Uuid::new_v4(),
            document_id: doc.id,
            origin_area_id: doc.current_area_id,
            destination_area_id: input.destination_area_id,
            derived_by: actor.map(|a| a.user_id),
            instructions: input.instructions.clone(),
            urgent: input.urgent,
            deadline: input.deadline,
            state: DER_PENDING.to_string(),
            dispatched_at: now,
        };
        diesel::insert_into(derivations::table)
            .values(&new_derivation)
            .execute(conn)?;
        let derivation: Derivation = derivations::table.find(new_derivation.id).first(conn)?;

        diesel::update(documents::table.find(doc.id))
            .set((
                documents::state.eq(DOC_IN_PROGRESS),
                documents::current_area_id.eq(Some(input.destination_area_id)),
                documents::updated_at.eq(now),
            ))
            .execute(conn)?;
        let doc: Document = documents::table.find(doc.id).first(conn)?;

        inbox::sync_entry(conn, &derivation)?;
        let mut detail = json!({
            "derivacion_id": derivation.id,
            "area_destino": derivation.destination_area_id,
            "urgente": derivation.urgent,
        });
        let action = match source_integration {
            Some(integration_id) => {
                detail["integracion_id"] = json!(integration_id);
                "derivado_externo"
            }
            None => "derivado",
        };
        append_audit(conn, doc.id, actor.map(|a| a.user_id), action, detail)?;

        let datos = derivation_event_datos(&doc, &derivation);
        emit_document_event(conn, webhooks::EVENT_DOCUMENTO_DERIVADO, &doc, &datos)?;
        emit_document_event(conn, webhooks::EVENT_DERIVACION_CREADA, &doc, &datos)?;

        let recipients = notify::users_of_area(conn, derivation.destination_area_id)?;
        let priority = if derivation.urgent {
            PRIORITY_URGENTE
        } else {
            PRIORITY_NORMAL
        };
        notify::notify_users(
            conn,
            &recipients,
            notify::KIND_DERIVACION_RECIBIDA,
            &format!("Nueva derivacion {}", doc.expedient_number),
            &format!("Instrucciones: {}", derivation.instructions),
            priority,
            Some(doc.id),
        )?;

        Ok((doc, derivation))
    })
}

fn load_derivation(conn: &mut PgConnection, derivation_id: Uuid) -> AppResult<Derivation> {
    derivations::table
        .find(derivation_id)
        .first::<Derivation>(conn)
        .optional()?
        .ok_or_else(AppError::not_found)
}

fn ensure_works_destination(actor: &AuthenticatedUser, derivation: &Derivation) -> AppResult<()> {
    if actor.is_admin() || actor.belongs_to(derivation.destination_area_id) {
        Ok(())
    } else {
        Err(AppError::forbidden(
            "la derivacion pertenece a otra area",
        ))
    }
}

/// Marks a PENDING derivation as received by a user of the destination
/// area.
pub fn receive_derivation(
    conn: &mut PgConnection,
    derivation_id: Uuid,
    observations: Option<String>,
    actor: &AuthenticatedUser,
) -> AppResult<(Document, Derivation)> {
    conn.transaction::<(Document, Derivation), AppError, _>(|conn| {
        let derivation = load_derivation(conn, derivation_id)?;
        let doc = lock_document(conn, derivation.document_id)?;
        let derivation = load_derivation(conn, derivation_id)?;

        ensure_works_destination(actor, &derivation)?;
        ensure_derivation_receivable(&derivation.state)?;

        let now = Utc::now().naive_utc();
        diesel::update(derivations::table.find(derivation.id))
            .set((
                derivations::state.eq(DER_RECEIVED),
                derivations::received_at.eq(Some(now)),
                derivations::received_by.eq(Some(actor.user_id)),
                derivations::observations.eq(observations.clone().or(derivation.observations.clone())),
                derivations::updated_at.eq(now),
            ))
            .execute(conn)?;
        let derivation: Derivation = derivations::table.find(derivation.id).first(conn)?;

        inbox::sync_entry(conn, &derivation)?;
        append_audit(
            conn,
            doc.id,
            Some(actor.user_id),
            "recibido",
            json!({"derivacion_id": derivation.id}),
        )?;

        let datos = derivation_event_datos(&doc, &derivation);
        emit_document_event(conn, webhooks::EVENT_DOCUMENTO_RECIBIDO, &doc, &datos)?;
        emit_document_event(conn, webhooks::EVENT_DERIVACION_RECIBIDA, &doc, &datos)?;

        Ok((doc, derivation))
    })
}

/// Closes a RECEIVED derivation and flips the document to ATTENDED in
/// the same transaction.
pub fn attend_derivation(
    conn: &mut PgConnection,
    derivation_id: Uuid,
    observations: String,
    response_blob_key: Option<String>,
    actor: &AuthenticatedUser,
) -> AppResult<(Document, Derivation)> {
    conn.transaction::<(Document, Derivation), AppError, _>(|conn| {
        let derivation = load_derivation(conn, derivation_id)?;
        let doc = lock_document(conn, derivation.document_id)?;
        let derivation = load_derivation(conn, derivation_id)?;

        ensure_works_destination(actor, &derivation)?;
        ensure_derivation_attendable(&derivation.state)?;
        ensure_document_transition(&doc.state, DOC_ATTENDED)?;

        let now = Utc::now().naive_utc();
        diesel::update(derivations::table.find(derivation.id))
            .set((
                derivations::state.eq(DER_ATTENDED),
                derivations::attended_at.eq(Some(now)),
                derivations::attended_by.eq(Some(actor.user_id)),
                derivations::observations.eq(Some(observations.clone())),
                derivations::response_blob_key.eq(response_blob_key.clone()),
                derivations::updated_at.eq(now),
            ))
            .execute(conn)?;
        let derivation: Derivation = derivations::table.find(derivation.id).first(conn)?;

        diesel::update(documents::table.find(doc.id))
            .set((
                documents::state.eq(DOC_ATTENDED),
                documents::updated_at.eq(now),
            ))
            .execute(conn)?;
        let doc: Document = documents::table.find(doc.id).first(conn)?;

        inbox::sync_entry(conn, &derivation)?;
        append_audit(
            conn,
            doc.id,
            Some(actor.user_id),
            "atendido",
            json!({"derivacion_id": derivation.id, "observaciones": observations}),
        )?;

        let datos = derivation_event_datos(&doc, &derivation);
        emit_document_event(conn, webhooks::EVENT_DOCUMENTO_ATENDIDO, &doc, &datos)?;
        emit_document_event(conn, webhooks::EVENT_DERIVACION_ATENDIDA, &doc, &datos)?;

        Ok((doc, derivation))
    })
}

fn spawn_successor(
    conn: &mut PgConnection,
    predecessor: &Derivation,
    destination_area_id: Uuid,
    instructions: String,
    actor: &AuthenticatedUser,
    now: NaiveDateTime,
) -> AppResult<Derivation> {
    let successor = NewDerivation {
        id: Uuid::new_v4(),
        document_id: predecessor.document_id,
        origin_area_id: Some(predecessor.destination_area_id),
        destination_area_id,
        derived_by: Some(actor.user_id),
        instructions,
        urgent: predecessor.urgent,
        deadline: predecessor.deadline,
        state: DER_PENDING.to_string(),
        dispatched_at: now,
    };
    diesel::insert_into(derivations::table)
        .values(&successor)
        .execute(conn)?;
    diesel::update(derivations::table.find(predecessor.id))
        .set(derivations::successor_id.eq(Some(successor.id)))
        .execute(conn)?;
    Ok(derivations::table.find(successor.id).first(conn)?)
}

/// Forwards an open derivation to a different area. The old derivation
/// closes as REASSIGNED and a fresh PENDING one is spawned.
pub fn reassign_derivation(
    conn: &mut PgConnection,
    derivation_id: Uuid,
    new_area_id: Uuid,
    reason: String,
    actor: &AuthenticatedUser,
) -> AppResult<(Document, Derivation, Derivation)> {
    conn.transaction::<(Document, Derivation, Derivation), AppError, _>(|conn| {
        let derivation = load_derivation(conn, derivation_id)?;
        let doc = lock_document(conn, derivation.document_id)?;
        let derivation = load_derivation(conn, derivation_id)?;

        ensure_works_destination(actor, &derivation)?;
        ensure_derivation_closable(&derivation.state)?;
        if new_area_id == derivation.destination_area_id {
            return Err(AppError::bad_request(
                "la nueva area coincide con la actual",
            ));
        }
        load_area(conn, new_area_id)?;

        let now = Utc::now().naive_utc();
        diesel::update(derivations::table.find(derivation.id))
            .set((
                derivations::state.eq(DER_REASSIGNED),
                derivations::closed_at.eq(Some(now)),
                derivations::observations.eq(Some(reason.clone())),
                derivations::updated_at.eq(now),
            ))
            .execute(conn)?;
        let closed: Derivation = derivations::table.find(derivation.id).first(conn)?;

        let successor = spawn_successor(conn, &closed, new_area_id, reason.clone(), actor, now)?;

        diesel::update(documents::table.find(doc.id))
            .set((
                documents::current_area_id.eq(Some(new_area_id)),
                documents::updated_at.eq(now),
            ))
            .execute(conn)?;
        let doc: Document = documents::table.find(doc.id).first(conn)?;

        inbox::sync_entry(conn, &closed)?;
        inbox::sync_entry(conn, &successor)?;
        append_audit(
            conn,
            doc.id,
            Some(actor.user_id),
            "reasignado",
            json!({
                "derivacion_id": closed.id,
                "sucesora_id": successor.id,
                "area_destino": new_area_id,
                "motivo": reason,
            }),
        )?;

        let datos = derivation_event_datos(&doc, &successor);
        emit_document_event(conn, webhooks::EVENT_DERIVACION_CREADA, &doc, &datos)?;

        let recipients = notify::users_of_area(conn, new_area_id)?;
        notify::notify_users(
            conn,
            &recipients,
            notify::KIND_DERIVACION_RECIBIDA,
            &format!("Derivacion reasignada {}", doc.expedient_number),
            &format!("Motivo: {reason}"),
            if successor.urgent { PRIORITY_URGENTE } else { PRIORITY_NORMAL },
            Some(doc.id),
        )?;

        Ok((doc, closed, successor))
    })
}

/// Sends an open derivation back where it came from. With a known
/// origin area the areas swap and a successor opens there; a first-hop
/// derivation (no origin) is a full devolution to the intake desk and
/// the document returns to REGISTERED.
pub fn return_derivation(
    conn: &mut PgConnection,
    derivation_id: Uuid,
    reason: String,
    observations: Option<String>,
    actor: &AuthenticatedUser,
) -> AppResult<(Document, Derivation, Option<Derivation>)> {
    conn.transaction::<(Document, Derivation, Option<Derivation>), AppError, _>(|conn| {
        let derivation = load_derivation(conn, derivation_id)?;
        let doc = lock_document(conn, derivation.document_id)?;
        let derivation = load_derivation(conn, derivation_id)?;

        ensure_works_destination(actor, &derivation)?;
        ensure_derivation_closable(&derivation.state)?;

        let now = Utc::now().naive_utc();
        let notes = observations.unwrap_or_else(|| reason.clone());
        diesel::update(derivations::table.find(derivation.id))
            .set((
                derivations::state.eq(DER_RETURNED),
                derivations::closed_at.eq(Some(now)),
                derivations::observations.eq(Some(notes)),
                derivations::updated_at.eq(now),
            ))
            .execute(conn)?;
        let closed: Derivation = derivations::table.find(derivation.id).first(conn)?;

        let successor = match closed.origin_area_id {
            Some(origin) => {
                let successor =
                    spawn_successor(conn, &closed, origin, format!("Devuelto: {reason}"), actor, now)?;
                diesel::update(documents::table.find(doc.id))
                    .set((
                        documents::current_area_id.eq(Some(origin)),
                        documents::updated_at.eq(now),
                    ))
                    .execute(conn)?;
                inbox::sync_entry(conn, &successor)?;

                let recipients = notify::users_of_area(conn, origin)?;
                notify::notify_users(
                    conn,
                    &recipients,
                    notify::KIND_DERIVACION_RECIBIDA,
                    &format!("Documento devuelto {}", doc.expedient_number),
                    &format!("Motivo: {reason}"),
                    PRIORITY_NORMAL,
                    Some(doc.id),
                )?;
                Some(successor)
            }
            None => {
                ensure_document_transition(&doc.state, DOC_REGISTERED)?;
                diesel::update(documents::table.find(doc.id))
                    .set((
                        documents::state.eq(DOC_REGISTERED),
                        documents::current_area_id.eq::<Option<Uuid>>(None),
                        documents::updated_at.eq(now),
                    ))
                    .execute(conn)?;
                None
            }
        };
        let doc: Document = documents::table.find(doc.id).first(conn)?;

        inbox::sync_entry(conn, &closed)?;
        append_audit(
            conn,
            doc.id,
            Some(actor.user_id),
            "devuelto",
            json!({
                "derivacion_id": closed.id,
                "sucesora_id": successor.as_ref().map(|s| s.id),
                "motivo": reason,
            }),
        )?;

        let datos = derivation_event_datos(&doc, &closed);
        emit_document_event(conn, webhooks::EVENT_DOCUMENTO_ACTUALIZADO, &doc, &datos)?;

        Ok((doc, closed, successor))
    })
}

/// Moves an ATTENDED document into the archive: allocates the location
/// code, computes retention expiry and flips the document to ARCHIVED.
pub fn archive_document(
    conn: &mut PgConnection,
    document_id: Uuid,
    input: ArchiveInput,
    actor: &AuthenticatedUser,
) -> AppResult<(Document, ArchiveRecord)> {
    if !(actor.can_route() || actor.is_supervisor()) {
        return Err(AppError::forbidden("sin permiso para archivar"));
    }

    conn.transaction::<(Document, ArchiveRecord), AppError, _>(|conn| {
        let doc = lock_document(conn, document_id)?;
        ensure_document_transition(&doc.state, DOC_ARCHIVED)?;

        let class_code = archive::classification_code(&input.classification)?;
        let now = Utc::now().naive_utc();
        let year = now.and_utc().format("%Y").to_string().parse::<i32>().unwrap_or(1970);
        let location_code = allocator::allocate_archive_code(conn, class_code, year)
            .map_err(|err| AppError::internal(format!("asignacion de codigo fallo: {err}")))?;
        let expires_at = archive::compute_expiry(now, &input.retention_policy)?;

        let record = NewArchiveRecord {
            id: Uuid::new_v4(),
            document_id: doc.id,
            classification: input.classification.clone(),
            retention_policy: input.retention_policy.clone(),
            location_code,
            physical_location: input.physical_location.clone(),
            notes: input.notes.clone(),
            archived_by: actor.user_id,
            archived_at: now,
            expires_at,
            status: STATUS_ARCHIVED.to_string(),
        };
        diesel::insert_into(archive_records::table)
            .values(&record)
            .execute(conn)?;
        let record: ArchiveRecord = archive_records::table.find(record.id).first(conn)?;

        diesel::update(documents::table.find(doc.id))
            .set((
                documents::state.eq(DOC_ARCHIVED),
                documents::current_area_id.eq::<Option<Uuid>>(None),
                documents::archived_at.eq(Some(now)),
                documents::updated_at.eq(now),
            ))
            .execute(conn)?;
        let doc: Document = documents::table.find(doc.id).first(conn)?;

        append_audit(
            conn,
            doc.id,
            Some(actor.user_id),
            "archivado",
            json!({
                "codigo_ubicacion": record.location_code,
                "clasificacion": record.classification,
                "retencion": record.retention_policy,
            }),
        )?;

        emit_document_event(
            conn,
            webhooks::EVENT_DOCUMENTO_ARCHIVADO,
            &doc,
            &document_event_datos(&doc),
        )?;

        Ok((doc, record))
    })
}

/// Brings an archived document back into processing. The archive
/// record stays behind as RESTORED and a fresh derivation opens in the
/// restorer's area carrying the restoration motive.
pub fn restore_document(
    conn: &mut PgConnection,
    archive_record_id: Uuid,
    reason: String,
    actor: &AuthenticatedUser,
) -> AppResult<(Document, ArchiveRecord, Derivation)> {
    if !(actor.can_route() || actor.is_supervisor()) {
        return Err(AppError::forbidden("sin permiso para restaurar"));
    }
    let Some(target_area) = actor.area_id else {
        return Err(AppError::bad_request(
            "el usuario restaurador no tiene area asignada",
        ));
    };
    if reason.trim().is_empty() {
        return Err(AppError::bad_request("motivo de restauracion requerido"));
    }

    conn.transaction::<(Document, ArchiveRecord, Derivation), AppError, _>(|conn| {
        let record: ArchiveRecord = archive_records::table
            .find(archive_record_id)
            .first::<ArchiveRecord>(conn)
            .optional()?
            .ok_or_else(AppError::not_found)?;
        if record.status != STATUS_ARCHIVED {
            return Err(AppError::invalid_transition(
                "el registro de archivo ya fue restaurado",
            ));
        }

        let doc = lock_document(conn, record.document_id)?;
        ensure_document_transition(&doc.state, DOC_IN_PROGRESS)?;

        let now = Utc::now().naive_utc();
        diesel::update(archive_records::table.find(record.id))
            .set((
                archive_records::status.eq(STATUS_RESTORED),
                archive_records::restored_at.eq(Some(now)),
                archive_records::restored_by.eq(Some(actor.user_id)),
                archive_records::restoration_reason.eq(Some(reason.clone())),
                archive_records::updated_at.eq(now),
            ))
            .execute(conn)?;
        let record: ArchiveRecord = archive_records::table.find(record.id).first(conn)?;

        let new_derivation = NewDerivation {
            id: Uuid::new_v4(),
            document_id: doc.id,
            origin_area_id: None,
            destination_area_id: target_area,
            derived_by: Some(actor.user_id),
            instructions: format!("Restauracion: {reason}"),
            urgent: false,
            deadline: None,
            state: DER_PENDING.to_string(),
            dispatched_at: now,
        };
        diesel::insert_into(derivations::table)
            .values(&new_derivation)
            .execute(conn)?;
        let derivation: Derivation = derivations::table.find(new_derivation.id).first(conn)?;

        diesel::update(documents::table.find(doc.id))
            .set((
                documents::state.eq(DOC_IN_PROGRESS),
                documents::current_area_id.eq(Some(target_area)),
                documents::archived_at.eq::<Option<NaiveDateTime>>(None),
                documents::updated_at.eq(now),
            ))
            .execute(conn)?;
        let doc: Document = documents::table.find(doc.id).first(conn)?;

        inbox::sync_entry(conn, &derivation)?;
        append_audit(
            conn,
            doc.id,
            Some(actor.user_id),
            "restaurado",
            json!({"registro_archivo": record.id, "motivo": reason}),
        )?;

        emit_document_event(
            conn,
            webhooks::EVENT_DOCUMENTO_ACTUALIZADO,
            &doc,
            &document_event_datos(&doc),
        )?;

        Ok((doc, record, derivation))
    })
}

fn lock_document_by_expedient(conn: &mut PgConnection, expedient: &str) -> AppResult<Document> {
    documents::table
        .filter(documents::expedient_number.eq(expedient))
        .for_update()
        .first::<Document>(conn)
        .optional()?
        .ok_or_else(AppError::not_found)
}

/// Folds partner-supplied fields into the document metadata object.
/// Keys in `skip` map to real columns and are patched separately.
fn merge_external_metadata(metadata: &Value, datos: &Value, skip: &[&str]) -> Value {
    let mut merged = metadata.as_object().cloned().unwrap_or_default();
    if let Some(entries) = datos.as_object() {
        for (key, value) in entries {
            if skip.contains(&key.as_str()) {
                continue;
            }
            merged.insert(key.clone(), value.clone());
        }
    }
    Value::Object(merged)
}

const EXTERNAL_COLUMN_KEYS: &[&str] = &["expediente", "asunto", "prioridad", "folios"];

/// Applies a partner-announced update to a document: recognised fields
/// patch their columns, everything else lands in the metadata object.
pub fn update_document_external(
    conn: &mut PgConnection,
    expedient: &str,
    datos: &Value,
    integration_id: Uuid,
) -> AppResult<Document> {
    conn.transaction::<Document, AppError, _>(|conn| {
        let doc = lock_document_by_expedient(conn, expedient)?;
        if doc.state == DOC_ARCHIVED {
            return Err(AppError::invalid_transition(
                "un documento archivado no puede actualizarse",
            ));
        }

        let now = Utc::now().naive_utc();
        if let Some(asunto) = datos.get("asunto").and_then(Value::as_str) {
            if asunto.trim().is_empty() {
                return Err(AppError::bad_request("asunto no puede quedar vacio"));
            }
            diesel::update(documents::table.find(doc.id))
                .set(documents::subject.eq(asunto.trim()))
                .execute(conn)?;
        }
        if let Some(prioridad) = datos.get("prioridad").and_then(Value::as_str) {
            if !is_valid_priority(prioridad) {
                return Err(AppError::bad_request(format!(
                    "prioridad invalida: {prioridad}"
                )));
            }
            diesel::update(documents::table.find(doc.id))
                .set(documents::priority.eq(prioridad))
                .execute(conn)?;
        }
        if let Some(folios) = datos.get("folios").and_then(Value::as_i64) {
            if folios < 1 {
                return Err(AppError::bad_request("folios debe ser al menos 1"));
            }
            diesel::update(documents::table.find(doc.id))
                .set(documents::folios.eq(folios as i32))
                .execute(conn)?;
        }

        let merged = merge_external_metadata(&doc.metadata, datos, EXTERNAL_COLUMN_KEYS);
        diesel::update(documents::table.find(doc.id))
            .set((
                documents::metadata.eq(merged),
                documents::updated_at.eq(now),
            ))
            .execute(conn)?;
        let doc: Document = documents::table.find(doc.id).first(conn)?;

        append_audit(
            conn,
            doc.id,
            None,
            "actualizado_externo",
            json!({"integracion_id": integration_id, "datos": datos}),
        )?;

        emit_document_event(
            conn,
            webhooks::EVENT_DOCUMENTO_ACTUALIZADO,
            &doc,
            &document_event_datos(&doc),
        )?;

        Ok(doc)
    })
}

/// Records the partner's processing state on the document without
/// touching the local state machine: the payload merges into metadata
/// and the audit trail gets a sync entry, one transaction.
pub fn sync_external_state(
    conn: &mut PgConnection,
    expedient: &str,
    datos: &Value,
    integration_id: Uuid,
) -> AppResult<Document> {
    conn.transaction::<Document, AppError, _>(|conn| {
        let doc = lock_document_by_expedient(conn, expedient)?;

        let now = Utc::now().naive_utc();
        let merged = merge_external_metadata(&doc.metadata, datos, &["expediente"]);
        diesel::update(documents::table.find(doc.id))
            .set((
                documents::metadata.eq(merged),
                documents::updated_at.eq(now),
            ))
            .execute(conn)?;
        let doc: Document = documents::table.find(doc.id).first(conn)?;

        append_audit(
            conn,
            doc.id,
            None,
            "sincronizado_externo",
            json!({"integracion_id": integration_id, "datos": datos}),
        )?;

        Ok(doc)
    })
}

pub struct BulkDeriveOutcome {
    pub document_id: Uuid,
    pub result: Result<Uuid, String>,
}

/// Applies `derive` per document, one transaction each, collecting the
/// outcomes. Individual failures never abort the batch.
pub fn bulk_derive(
    conn: &mut PgConnection,
    document_ids: &[Uuid],
    input: &DeriveInput,
    actor: &AuthenticatedUser,
) -> Vec<BulkDeriveOutcome> {
    document_ids
        .iter()
        .map(|&document_id| {
            let per_doc = DeriveInput {
                destination_area_id: input.destination_area_id,
                instructions: input.instructions.clone(),
                urgent: input.urgent,
                deadline: input.deadline,
            };
            let result = derive_document(conn, document_id, per_doc, actor)
                .map(|(_, derivation)| derivation.id)
                .map_err(|err| err.message().to_string());
            BulkDeriveOutcome {
                document_id,
                result,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::merge_external_metadata;

    #[test]
    fn metadata_merge_skips_column_keys() {
        let metadata = json!({"origen": "ventanilla"});
        let datos = json!({"expediente": "EXP-2026-000001", "asunto": "x", "ref": "OF-12"});
        let merged = merge_external_metadata(&metadata, &datos, &["expediente", "asunto"]);
        assert_eq!(merged, json!({"origen": "ventanilla", "ref": "OF-12"}));
    }

    #[test]
    fn metadata_merge_overwrites_existing_keys() {
        let metadata = json!({"estado_externo": "en_revision", "origen": "ventanilla"});
        let datos = json!({"estado_externo": "aprobado"});
        let merged = merge_external_metadata(&metadata, &datos, &[]);
        assert_eq!(
            merged,
            json!({"estado_externo": "aprobado", "origen": "ventanilla"})
        );
    }
}
