use axum::extract::{Json, Path, Query, State};
use axum::http::StatusCode;
use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};
use crate::models::{NewScheduledAlert, Notification, NotificationPreferences};
use crate::notify;
use crate::schema::{documents, notification_preferences, notifications, scheduled_alerts};
use crate::state::AppState;
use crate::webhooks;

#[derive(Serialize)]
pub struct NotificationResponse {
    pub id: Uuid,
    pub tipo: String,
    pub titulo: String,
    pub cuerpo: String,
    pub prioridad: String,
    pub documento_id: Option<Uuid>,
    pub leida: bool,
    pub fecha: String,
}

impl From<Notification> for NotificationResponse {
    fn from(notification: Notification) -> Self {
        Self {
            id: notification.id,
            tipo: notification.kind,
            titulo: notification.title,
            cuerpo: notification.body,
            prioridad: notification.priority,
            documento_id: notification.document_id,
            leida: notification.read,
            fecha: notification.created_at.and_utc().to_rfc3339(),
        }
    }
}

#[derive(Deserialize)]
pub struct NotificationListQuery {
    #[serde(default)]
    pub solo_no_leidas: bool,
    pub limite: Option<i64>,
}

pub async fn list_notifications(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(query): Query<NotificationListQuery>,
) -> AppResult<Json<Vec<NotificationResponse>>> {
    let mut conn = state.db()?;
    let limit = query.limite.unwrap_or(50).clamp(1, 200);

    let mut selection = notifications::table
        .filter(notifications::user_id.eq(user.user_id))
        .into_boxed();
    if query.solo_no_leidas {
        selection = selection.filter(notifications::read.eq(false));
    }
    let rows: Vec<Notification> = selection
        .order(notifications::created_at.desc())
        .limit(limit)
        .load(&mut conn)?;

    Ok(Json(rows.into_iter().map(NotificationResponse::from).collect()))
}

pub async fn mark_read(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<NotificationResponse>> {
    let mut conn = state.db()?;
    let notification: Notification = notifications::table
        .find(id)
        .first::<Notification>(&mut conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;
    if notification.user_id != user.user_id {
        return Err(AppError::not_found());
    }

    diesel::update(notifications::table.find(id))
        .set((
            notifications::read.eq(true),
            notifications::read_at.eq(Some(Utc::now().naive_utc())),
        ))
        .execute(&mut conn)?;
    let notification: Notification = notifications::table.find(id).first(&mut conn)?;
    Ok(Json(notification.into()))
}

pub async fn delete_notification(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let mut conn = state.db()?;
    let owner: Uuid = notifications::table
        .find(id)
        .select(notifications::user_id)
        .first::<Uuid>(&mut conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;
    if owner != user.user_id {
        return Err(AppError::not_found());
    }

    diesel::delete(notifications::table.find(id)).execute(&mut conn)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Unread and per-kind counts for the caller's bell badge.
pub async fn notification_summary(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<Value>> {
    use diesel::dsl::count_star;

    let mut conn = state.db()?;
    let total: i64 = notifications::table
        .filter(notifications::user_id.eq(user.user_id))
        .count()
        .get_result(&mut conn)?;
    let unread: i64 = notifications::table
        .filter(notifications::user_id.eq(user.user_id))
        .filter(notifications::read.eq(false))
        .count()
        .get_result(&mut conn)?;
    let by_kind: Vec<(String, i64)> = notifications::table
        .filter(notifications::user_id.eq(user.user_id))
        .group_by(notifications::kind)
        .select((notifications::kind, count_star()))
        .load(&mut conn)?;

    let por_tipo: serde_json::Map<String, Value> = by_kind
        .into_iter()
        .map(|(tipo, cuenta)| (tipo, serde_json::json!(cuenta)))
        .collect();
    Ok(Json(serde_json::json!({
        "total": total,
        "no_leidas": unread,
        "por_tipo": por_tipo,
    })))
}

pub async fn notification_kinds(_user: AuthenticatedUser) -> Json<Value> {
    Json(serde_json::json!({"tipos": notify::KINDS}))
}

#[derive(Serialize)]
pub struct ClearReadResponse {
    pub eliminadas: usize,
}

/// Deletes the caller's read notifications; unread ones stay.
pub async fn clear_read(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<ClearReadResponse>> {
    let mut conn = state.db()?;
    let deleted = diesel::delete(
        notifications::table
            .filter(notifications::user_id.eq(user.user_id))
            .filter(notifications::read.eq(true)),
    )
    .execute(&mut conn)?;
    Ok(Json(ClearReadResponse { eliminadas: deleted }))
}

#[derive(Serialize)]
pub struct MarkAllResponse {
    pub marcadas: usize,
}

pub async fn mark_all_read(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<MarkAllResponse>> {
    let mut conn = state.db()?;
    let updated = diesel::update(
        notifications::table
            .filter(notifications::user_id.eq(user.user_id))
            .filter(notifications::read.eq(false)),
    )
    .set((
        notifications::read.eq(true),
        notifications::read_at.eq(Some(Utc::now().naive_utc())),
    ))
    .execute(&mut conn)?;
    Ok(Json(MarkAllResponse { marcadas: updated }))
}

#[derive(Serialize)]
pub struct PreferencesResponse {
    pub tipos: Value,
    pub correo: bool,
    pub resumen_diario: bool,
    pub hora_resumen: i32,
    pub suscripciones: Value,
}

impl From<NotificationPreferences> for PreferencesResponse {
    fn from(prefs: NotificationPreferences) -> Self {
        Self {
            tipos: prefs.kind_toggles,
            correo: prefs.email_enabled,
            resumen_diario: prefs.digest_enabled,
            hora_resumen: prefs.digest_hour,
            suscripciones: prefs.subscriptions,
        }
    }
}

pub async fn get_preferences(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<PreferencesResponse>> {
    let mut conn = state.db()?;
    let prefs = notify::load_or_default_preferences(&mut conn, user.user_id)?;
    Ok(Json(prefs.into()))
}

#[derive(Deserialize)]
pub struct UpdatePreferencesRequest {
    pub tipos: Option<Value>,
    pub correo: Option<bool>,
    pub resumen_diario: Option<bool>,
    pub hora_resumen: Option<i32>,
    pub suscripciones: Option<Value>,
}

pub async fn update_preferences(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<UpdatePreferencesRequest>,
) -> AppResult<Json<PreferencesResponse>> {
    if let Some(hour) = payload.hora_resumen {
        if !(0..24).contains(&hour) {
            return Err(AppError::bad_request("hora_resumen fuera de rango (0-23)"));
        }
    }
    if let Some(tipos) = payload.tipos.as_ref() {
        if let Some(map) = tipos.as_object() {
            for key in map.keys() {
                if !notify::KINDS.contains(&key.as_str()) {
                    return Err(AppError::bad_request(format!(
                        "tipo de notificacion desconocido: {key}"
                    )));
                }
            }
        } else {
            return Err(AppError::bad_request("tipos debe ser un objeto"));
        }
    }
    if let Some(suscripciones) = payload.suscripciones.as_ref() {
        let Some(items) = suscripciones.as_array() else {
            return Err(AppError::bad_request("suscripciones debe ser una lista"));
        };
        for item in items {
            let Some(event) = item.as_str() else {
                return Err(AppError::bad_request("suscripciones debe listar eventos"));
            };
            if !webhooks::OUTBOUND_EVENTS.contains(&event) {
                return Err(AppError::bad_request(format!(
                    "evento desconocido: {event}"
                )));
            }
        }
    }

    let mut conn = state.db()?;
    notify::load_or_default_preferences(&mut conn, user.user_id)?;

    let now = Utc::now().naive_utc();
    if let Some(tipos) = payload.tipos {
        diesel::update(notification_preferences::table.find(user.user_id))
            .set(notification_preferences::kind_toggles.eq(tipos))
            .execute(&mut conn)?;
    }
    if let Some(correo) = payload.correo {
        diesel::update(notification_preferences::table.find(user.user_id))
            .set(notification_preferences::email_enabled.eq(correo))
            .execute(&mut conn)?;
    }
    if let Some(resumen) = payload.resumen_diario {
        diesel::update(notification_preferences::table.find(user.user_id))
            .set(notification_preferences::digest_enabled.eq(resumen))
            .execute(&mut conn)?;
    }
    if let Some(hora) = payload.hora_resumen {
        diesel::update(notification_preferences::table.find(user.user_id))
            .set(notification_preferences::digest_hour.eq(hora))
            .execute(&mut conn)?;
    }
    if let Some(suscripciones) = payload.suscripciones {
        diesel::update(notification_preferences::table.find(user.user_id))
            .set(notification_preferences::subscriptions.eq(suscripciones))
            .execute(&mut conn)?;
    }
    diesel::update(notification_preferences::table.find(user.user_id))
        .set(notification_preferences::updated_at.eq(now))
        .execute(&mut conn)?;

    let prefs: NotificationPreferences = notification_preferences::table
        .find(user.user_id)
        .first(&mut conn)?;
    Ok(Json(prefs.into()))
}

#[derive(Deserialize)]
pub struct ScheduleAlertRequest {
    pub documento_id: Uuid,
    pub mensaje: String,
    pub fecha: NaiveDateTime,
}

#[derive(Serialize)]
pub struct ScheduleAlertResponse {
    pub id: Uuid,
}

pub async fn schedule_alert(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<ScheduleAlertRequest>,
) -> AppResult<(StatusCode, Json<ScheduleAlertResponse>)> {
    if payload.mensaje.trim().is_empty() {
        return Err(AppError::bad_request("mensaje requerido"));
    }
    if payload.fecha <= Utc::now().naive_utc() {
        return Err(AppError::bad_request("la fecha debe ser futura"));
    }

    let mut conn = state.db()?;
    documents::table
        .find(payload.documento_id)
        .select(documents::id)
        .first::<Uuid>(&mut conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;

    let alert = NewScheduledAlert {
        id: Uuid::new_v4(),
        user_id: user.user_id,
        document_id: payload.documento_id,
        message: payload.mensaje.trim().to_string(),
        fire_at: payload.fecha,
    };
    diesel::insert_into(scheduled_alerts::table)
        .values(&alert)
        .execute(&mut conn)?;

    Ok((StatusCode::CREATED, Json(ScheduleAlertResponse { id: alert.id })))
}
