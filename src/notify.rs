//! Notification fan-out and the sweep logic behind the maintenance
//! binary: deadline scanning, scheduled alerts, digests and retention.

use chrono::{Duration, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde_json::json;
use uuid::Uuid;

use crate::lifecycle::{PRIORITY_ALTA, PRIORITY_NORMAL};
use crate::models::{
    Document, NewNotification, NewNotificationPreferences, Notification, NotificationPreferences,
    ScheduledAlert, User,
};
use crate::schema::{
    documents, notification_preferences, notifications, scheduled_alerts, users,
};

pub const KIND_DERIVACION_RECIBIDA: &str = "DERIVACION_RECIBIDA";
pub const KIND_DOCUMENTO_URGENTE: &str = "DOCUMENTO_URGENTE";
pub const KIND_DOCUMENTO_PROXIMO_VENCER: &str = "DOCUMENTO_PROXIMO_VENCER";
pub const KIND_DOCUMENTO_VENCIDO: &str = "DOCUMENTO_VENCIDO";
pub const KIND_ALERTA_PROGRAMADA: &str = "ALERTA_PROGRAMADA";
pub const KIND_EVENTO_SUSCRITO: &str = "EVENTO_SUSCRITO";

pub const KINDS: &[&str] = &[
    KIND_DERIVACION_RECIBIDA,
    KIND_DOCUMENTO_URGENTE,
    KIND_DOCUMENTO_PROXIMO_VENCER,
    KIND_DOCUMENTO_VENCIDO,
    KIND_ALERTA_PROGRAMADA,
    KIND_EVENTO_SUSCRITO,
];

pub fn load_or_default_preferences(
    conn: &mut PgConnection,
    user_id: Uuid,
) -> QueryResult<NotificationPreferences> {
    if let Some(prefs) = notification_preferences::table
        .find(user_id)
        .first::<NotificationPreferences>(conn)
        .optional()?
    {
        return Ok(prefs);
    }

    let defaults = NewNotificationPreferences {
        user_id,
        kind_toggles: json!({}),
        email_enabled: false,
        digest_enabled: false,
        digest_hour: 8,
        subscriptions: json!([]),
    };
    diesel::insert_into(notification_preferences::table)
        .values(&defaults)
        .on_conflict(notification_preferences::user_id)
        .do_nothing()
        .execute(conn)?;
    notification_preferences::table.find(user_id).first(conn)
}

/// A kind is enabled unless the user explicitly turned it off.
pub fn kind_enabled(prefs: &NotificationPreferences, kind: &str) -> bool {
    prefs
        .kind_toggles
        .get(kind)
        .and_then(|v| v.as_bool())
        .unwrap_or(true)
}

pub fn users_of_area(conn: &mut PgConnection, area_id: Uuid) -> QueryResult<Vec<User>> {
    users::table
        .filter(users::area_id.eq(area_id))
        .load(conn)
}

pub fn supervisors(conn: &mut PgConnection) -> QueryResult<Vec<User>> {
    users::table
        .filter(users::role.eq_any(["supervisor", "admin"]))
        .load(conn)
}

/// Users who listed `event` in the subscriptions array of their
/// preferences.
pub fn event_subscribers(conn: &mut PgConnection, event: &str) -> QueryResult<Vec<User>> {
    let user_ids: Vec<Uuid> = notification_preferences::table
        .filter(notification_preferences::subscriptions.contains(json!([event])))
        .select(notification_preferences::user_id)
        .load(conn)?;
    if user_ids.is_empty() {
        return Ok(Vec::new());
    }
    users::table.filter(users::id.eq_any(user_ids)).load(conn)
}

/// Persists one in-app notification per recipient whose preferences
/// admit the kind. Email and realtime delivery happen post-commit.
pub fn notify_users(
    conn: &mut PgConnection,
    recipients: &[User],
    kind: &str,
    title: &str,
    body: &str,
    priority: &str,
    document_id: Option<Uuid>,
) -> QueryResult<usize> {
    let mut created = 0usize;
    for user in recipients {
        let prefs = load_or_default_preferences(conn, user.id)?;
        if !kind_enabled(&prefs, kind) {
            continue;
        }
        let row = NewNotification {
            id: Uuid::new_v4(),
            user_id: user.id,
            kind: kind.to_string(),
            title: title.to_string(),
            body: body.to_string(),
            priority: priority.to_string(),
            document_id,
        };
        diesel::insert_into(notifications::table)
            .values(&row)
            .execute(conn)?;
        created += 1;
    }
    Ok(created)
}

fn has_unread_of_kind(
    conn: &mut PgConnection,
    user_id: Uuid,
    kind: &str,
    document_id: Uuid,
) -> QueryResult<bool> {
    let count: i64 = notifications::table
        .filter(notifications::user_id.eq(user_id))
        .filter(notifications::kind.eq(kind))
        .filter(notifications::document_id.eq(document_id))
        .filter(notifications::read.eq(false))
        .count()
        .get_result(conn)?;
    Ok(count > 0)
}

/// Deadline sweep: warns the current area about documents due within
/// `warning_days` and escalates expired ones to the area plus
/// supervisors. An unread notification of the same kind suppresses a
/// duplicate on the next sweep.
pub fn scan_deadlines(conn: &mut PgConnection, warning_days: i64) -> QueryResult<usize> {
    let now = Utc::now().naive_utc();
    let horizon = now + Duration::days(warning_days);

    let due_soon: Vec<Document> = documents::table
        .filter(documents::deadline.is_not_null())
        .filter(documents::deadline.gt(now))
        .filter(documents::deadline.le(horizon))
        .filter(documents::state.eq_any(["REGISTERED", "IN_PROGRESS"]))
        .load(conn)?;

    let expired: Vec<Document> = documents::table
        .filter(documents::deadline.is_not_null())
        .filter(documents::deadline.le(now))
        .filter(documents::state.eq_any(["REGISTERED", "IN_PROGRESS"]))
        .load(conn)?;

    let mut created = 0usize;

    for doc in &due_soon {
        let Some(area_id) = doc.current_area_id else {
            continue;
        };
        for user in users_of_area(conn, area_id)? {
            if has_unread_of_kind(conn, user.id, KIND_DOCUMENTO_PROXIMO_VENCER, doc.id)? {
                continue;
            }
            created += notify_users(
                conn,
                std::slice::from_ref(&user),
                KIND_DOCUMENTO_PROXIMO_VENCER,
                &format!("Documento {} proximo a vencer", doc.expedient_number),
                &format!("El expediente {} vence pronto: {}", doc.expedient_number, doc.subject),
                PRIORITY_NORMAL,
                Some(doc.id),
            )?;
        }
    }

    for doc in &expired {
        let mut recipients: Vec<User> = match doc.current_area_id {
            Some(area_id) => users_of_area(conn, area_id)?,
            None => Vec::new(),
        };
        for supervisor in supervisors(conn)? {
            if !recipients.iter().any(|u| u.id == supervisor.id) {
                recipients.push(supervisor);
            }
        }
        for user in recipients {
            if has_unread_of_kind(conn, user.id, KIND_DOCUMENTO_VENCIDO, doc.id)? {
                continue;
            }
            created += notify_users(
                conn,
                std::slice::from_ref(&user),
                KIND_DOCUMENTO_VENCIDO,
                &format!("Documento {} vencido", doc.expedient_number),
                &format!("El expediente {} excedio su plazo: {}", doc.expedient_number, doc.subject),
                PRIORITY_ALTA,
                Some(doc.id),
            )?;
        }
    }

    Ok(created)
}

/// Fires due scheduled alerts, marking each so it fires once.
pub fn fire_scheduled_alerts(conn: &mut PgConnection) -> QueryResult<usize> {
    let now = Utc::now().naive_utc();
    let due: Vec<ScheduledAlert> = scheduled_alerts::table
        .filter(scheduled_alerts::fired.eq(false))
        .filter(scheduled_alerts::fire_at.le(now))
        .load(conn)?;

    let mut created = 0usize;
    for alert in due {
        let user: User = users::table.find(alert.user_id).first(conn)?;
        created += notify_users(
            conn,
            std::slice::from_ref(&user),
            KIND_ALERTA_PROGRAMADA,
            "Alerta programada",
            &alert.message,
            PRIORITY_NORMAL,
            Some(alert.document_id),
        )?;
        diesel::update(scheduled_alerts::table.find(alert.id))
            .set(scheduled_alerts::fired.eq(true))
            .execute(conn)?;
    }
    Ok(created)
}

/// Deletes notifications older than `retention_days`; when `only_read`
/// is set, unread ones survive the sweep.
pub fn purge_old(
    conn: &mut PgConnection,
    retention_days: i64,
    only_read: bool,
) -> QueryResult<usize> {
    let cutoff = Utc::now().naive_utc() - Duration::days(retention_days);
    let deleted = if only_read {
        diesel::delete(
            notifications::table
                .filter(notifications::created_at.lt(cutoff))
                .filter(notifications::read.eq(true)),
        )
        .execute(conn)?
    } else {
        diesel::delete(notifications::table.filter(notifications::created_at.lt(cutoff)))
            .execute(conn)?
    };
    Ok(deleted)
}

/// Users whose digest is due at `hour` (0-23) and who have unread mail-
/// worthy notifications.
pub fn digest_recipients(conn: &mut PgConnection, hour: i32) -> QueryResult<Vec<User>> {
    let user_ids: Vec<Uuid> = notification_preferences::table
        .filter(notification_preferences::digest_enabled.eq(true))
        .filter(notification_preferences::digest_hour.eq(hour))
        .select(notification_preferences::user_id)
        .load(conn)?;
    users::table.filter(users::id.eq_any(user_ids)).load(conn)
}

pub fn unread_for_user(conn: &mut PgConnection, user_id: Uuid) -> QueryResult<Vec<Notification>> {
    notifications::table
        .filter(notifications::user_id.eq(user_id))
        .filter(notifications::read.eq(false))
        .order(notifications::created_at.desc())
        .load(conn)
}

/// One plain-text digest body per user, newest first.
pub fn compose_digest(unread: &[Notification]) -> String {
    let mut body = format!("Tiene {} notificaciones sin leer:\n\n", unread.len());
    for notification in unread {
        body.push_str(&format!(
            "- [{}] {}: {}\n",
            notification.priority, notification.title, notification.body
        ));
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn prefs_with(toggles: serde_json::Value) -> NotificationPreferences {
        NotificationPreferences {
            user_id: Uuid::new_v4(),
            kind_toggles: toggles,
            email_enabled: true,
            digest_enabled: false,
            digest_hour: 8,
            subscriptions: json!([]),
            updated_at: Utc::now().naive_utc(),
        }
    }

    #[test]
    fn kinds_default_to_enabled() {
        let prefs = prefs_with(json!({}));
        assert!(kind_enabled(&prefs, KIND_DERIVACION_RECIBIDA));
    }

    #[test]
    fn explicit_opt_out_disables_a_kind() {
        let prefs = prefs_with(json!({ KIND_DOCUMENTO_VENCIDO: false }));
        assert!(!kind_enabled(&prefs, KIND_DOCUMENTO_VENCIDO));
        assert!(kind_enabled(&prefs, KIND_DERIVACION_RECIBIDA));
    }

    #[test]
    fn digest_lists_every_unread_notification() {
        let mk = |title: &str| Notification {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            kind: KIND_DERIVACION_RECIBIDA.into(),
            title: title.into(),
            body: "detalle".into(),
            priority: PRIORITY_NORMAL.into(),
            document_id: None,
            read: false,
            read_at: None,
            email_delivered: false,
            created_at: Utc::now().naive_utc(),
        };
        let digest = compose_digest(&[mk("uno"), mk("dos")]);
        assert!(digest.contains("2 notificaciones"));
        assert!(digest.contains("uno"));
        assert!(digest.contains("dos"));
    }
}
