use chrono::NaiveDateTime;
use diesel::prelude::*;
use uuid::Uuid;

use crate::schema::*;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub role: String,
    pub area_id: Option<Uuid>,
    pub email: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub role: String,
    pub area_id: Option<Uuid>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = areas)]
pub struct Area {
    pub id: Uuid,
    pub name: String,
    pub code: String,
    pub active: bool,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = areas)]
pub struct NewArea {
    pub id: Uuid,
    pub name: String,
    pub code: String,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = documents)]
pub struct Document {
    pub id: Uuid,
    pub expedient_number: String,
    pub doc_type: String,
    pub sender: String,
    pub subject: String,
    pub folios: i32,
    pub priority: String,
    pub state: String,
    pub current_area_id: Option<Uuid>,
    pub reception_at: NaiveDateTime,
    pub deadline: Option<NaiveDateTime>,
    pub related_expedient: Option<String>,
    pub qr_token: String,
    pub tags: serde_json::Value,
    pub metadata: serde_json::Value,
    pub created_by: Option<Uuid>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub archived_at: Option<NaiveDateTime>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = documents)]
pub struct NewDocument {
    pub id: Uuid,
    pub expedient_number: String,
    pub doc_type: String,
    pub sender: String,
    pub subject: String,
    pub folios: i32,
    pub priority: String,
    pub state: String,
    pub current_area_id: Option<Uuid>,
    pub reception_at: NaiveDateTime,
    pub deadline: Option<NaiveDateTime>,
    pub related_expedient: Option<String>,
    pub qr_token: String,
    pub tags: serde_json::Value,
    pub metadata: serde_json::Value,
    pub created_by: Option<Uuid>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = document_attachments)]
#[diesel(belongs_to(Document))]
pub struct DocumentAttachment {
    pub id: Uuid,
    pub document_id: Uuid,
    pub blob_key: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub original_name: String,
    pub uploaded_by: Uuid,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = document_attachments)]
pub struct NewDocumentAttachment {
    pub id: Uuid,
    pub document_id: Uuid,
    pub blob_key: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub original_name: String,
    pub uploaded_by: Uuid,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = document_audit)]
#[diesel(belongs_to(Document))]
pub struct DocumentAuditEntry {
    pub id: Uuid,
    pub document_id: Uuid,
    pub actor: Option<Uuid>,
    pub action: String,
    pub detail: serde_json::Value,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = document_audit)]
pub struct NewDocumentAuditEntry {
    pub id: Uuid,
    pub document_id: Uuid,
    pub actor: Option<Uuid>,
    pub action: String,
    pub detail: serde_json::Value,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = derivations)]
#[diesel(belongs_to(Document))]
pub struct Derivation {
    pub id: Uuid,
    pub document_id: Uuid,
    pub origin_area_id: Option<Uuid>,
    pub destination_area_id: Uuid,
    pub derived_by: Option<Uuid>,
    pub instructions: String,
    pub urgent: bool,
    pub deadline: Option<NaiveDateTime>,
    pub state: String,
    pub dispatched_at: NaiveDateTime,
    pub received_at: Option<NaiveDateTime>,
    pub attended_at: Option<NaiveDateTime>,
    pub closed_at: Option<NaiveDateTime>,
    pub received_by: Option<Uuid>,
    pub attended_by: Option<Uuid>,
    pub observations: Option<String>,
    pub response_blob_key: Option<String>,
    pub successor_id: Option<Uuid>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = derivations)]
pub struct NewDerivation {
    pub id: Uuid,
    pub document_id: Uuid,
    pub origin_area_id: Option<Uuid>,
    pub destination_area_id: Uuid,
    pub derived_by: Option<Uuid>,
    pub instructions: String,
    pub urgent: bool,
    pub deadline: Option<NaiveDateTime>,
    pub state: String,
    pub dispatched_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = area_inbox)]
#[diesel(primary_key(derivation_id))]
pub struct AreaInboxEntry {
    pub derivation_id: Uuid,
    pub area_id: Uuid,
    pub document_id: Uuid,
    pub state: String,
    pub urgent: bool,
    pub deadline: Option<NaiveDateTime>,
    pub dispatched_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = area_inbox)]
pub struct NewAreaInboxEntry {
    pub derivation_id: Uuid,
    pub area_id: Uuid,
    pub document_id: Uuid,
    pub state: String,
    pub urgent: bool,
    pub deadline: Option<NaiveDateTime>,
    pub dispatched_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = archive_records)]
#[diesel(belongs_to(Document))]
pub struct ArchiveRecord {
    pub id: Uuid,
    pub document_id: Uuid,
    pub classification: String,
    pub retention_policy: String,
    pub location_code: String,
    pub physical_location: Option<String>,
    pub notes: Option<String>,
    pub archived_by: Uuid,
    pub archived_at: NaiveDateTime,
    pub expires_at: Option<NaiveDateTime>,
    pub status: String,
    pub restored_at: Option<NaiveDateTime>,
    pub restored_by: Option<Uuid>,
    pub restoration_reason: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = archive_records)]
pub struct NewArchiveRecord {
    pub id: Uuid,
    pub document_id: Uuid,
    pub classification: String,
    pub retention_policy: String,
    pub location_code: String,
    pub physical_location: Option<String>,
    pub notes: Option<String>,
    pub archived_by: Uuid,
    pub archived_at: NaiveDateTime,
    pub expires_at: Option<NaiveDateTime>,
    pub status: String,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = integrations)]
pub struct Integration {
    pub id: Uuid,
    pub name: String,
    pub code: String,
    pub kind: String,
    pub base_url: String,
    pub auth_kind: String,
    pub credentials_sealed: Option<String>,
    pub headers: serde_json::Value,
    pub field_mappings: serde_json::Value,
    pub webhook_url: Option<String>,
    pub webhook_events: serde_json::Value,
    pub webhook_secret_sealed: Option<String>,
    pub webhook_headers: serde_json::Value,
    pub webhook_timeout_seconds: i32,
    pub webhook_max_retries: i32,
    pub webhook_skew_seconds: Option<i32>,
    pub retry_backoff_seconds: i32,
    pub rate_limit_per_minute: Option<i32>,
    pub connection_state: String,
    pub active: bool,
    pub last_checked_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = integrations)]
pub struct NewIntegration {
    pub id: Uuid,
    pub name: String,
    pub code: String,
    pub kind: String,
    pub base_url: String,
    pub auth_kind: String,
    pub credentials_sealed: Option<String>,
    pub headers: serde_json::Value,
    pub field_mappings: serde_json::Value,
    pub webhook_url: Option<String>,
    pub webhook_events: serde_json::Value,
    pub webhook_secret_sealed: Option<String>,
    pub webhook_headers: serde_json::Value,
    pub webhook_timeout_seconds: i32,
    pub webhook_max_retries: i32,
    pub webhook_skew_seconds: Option<i32>,
    pub retry_backoff_seconds: i32,
    pub rate_limit_per_minute: Option<i32>,
    pub connection_state: String,
    pub active: bool,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = sync_log)]
#[diesel(belongs_to(Integration))]
pub struct SyncLogEntry {
    pub id: Uuid,
    pub integration_id: Uuid,
    pub document_id: Option<Uuid>,
    pub operation: String,
    pub direction: String,
    pub request: serde_json::Value,
    pub response: Option<serde_json::Value>,
    pub status: String,
    pub attempt: i32,
    pub next_retry_at: Option<NaiveDateTime>,
    pub duration_ms: Option<i64>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = sync_log)]
pub struct NewSyncLogEntry {
    pub id: Uuid,
    pub integration_id: Uuid,
    pub document_id: Option<Uuid>,
    pub operation: String,
    pub direction: String,
    pub request: serde_json::Value,
    pub response: Option<serde_json::Value>,
    pub status: String,
    pub attempt: i32,
    pub next_retry_at: Option<NaiveDateTime>,
    pub duration_ms: Option<i64>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = webhook_outbox)]
#[diesel(belongs_to(Integration))]
pub struct OutboxEntry {
    pub id: Uuid,
    pub integration_id: Uuid,
    pub event: String,
    pub payload: serde_json::Value,
    pub document_id: Option<Uuid>,
    pub status: String,
    pub attempts: i32,
    pub run_after: NaiveDateTime,
    pub last_error: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = webhook_outbox)]
pub struct NewOutboxEntry {
    pub id: Uuid,
    pub integration_id: Uuid,
    pub event: String,
    pub payload: serde_json::Value,
    pub document_id: Option<Uuid>,
    pub status: String,
    pub run_after: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = notifications)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub priority: String,
    pub document_id: Option<Uuid>,
    pub read: bool,
    pub read_at: Option<NaiveDateTime>,
    pub email_delivered: bool,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = notifications)]
pub struct NewNotification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub priority: String,
    pub document_id: Option<Uuid>,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = notification_preferences)]
#[diesel(primary_key(user_id))]
pub struct NotificationPreferences {
    pub user_id: Uuid,
    pub kind_toggles: serde_json::Value,
    pub email_enabled: bool,
    pub digest_enabled: bool,
    pub digest_hour: i32,
    pub subscriptions: serde_json::Value,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = notification_preferences)]
pub struct NewNotificationPreferences {
    pub user_id: Uuid,
    pub kind_toggles: serde_json::Value,
    pub email_enabled: bool,
    pub digest_enabled: bool,
    pub digest_hour: i32,
    pub subscriptions: serde_json::Value,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = scheduled_alerts)]
pub struct ScheduledAlert {
    pub id: Uuid,
    pub user_id: Uuid,
    pub document_id: Uuid,
    pub message: String,
    pub fire_at: NaiveDateTime,
    pub fired: bool,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = scheduled_alerts)]
pub struct NewScheduledAlert {
    pub id: Uuid,
    pub user_id: Uuid,
    pub document_id: Uuid,
    pub message: String,
    pub fire_at: NaiveDateTime,
}
