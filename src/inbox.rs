//! Area inbox projection over the derivation ledger. Kept in step
//! inside every ledger transaction; only open work (PENDING, RECEIVED)
//! lives here, so worklist queries never scan the ledger.

use chrono::{Duration, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::Serialize;
use uuid::Uuid;

use crate::lifecycle::derivation_is_open;
use crate::models::{AreaInboxEntry, Derivation, NewAreaInboxEntry};
use crate::schema::{area_inbox, derivations};

/// Brings the projection in line with one ledger row: open derivations
/// are upserted, closed ones drop out.
pub fn sync_entry(conn: &mut PgConnection, derivation: &Derivation) -> QueryResult<()> {
    if derivation_is_open(&derivation.state) {
        let entry = NewAreaInboxEntry {
            derivation_id: derivation.id,
            area_id: derivation.destination_area_id,
            document_id: derivation.document_id,
            state: derivation.state.clone(),
            urgent: derivation.urgent,
            deadline: derivation.deadline,
            dispatched_at: derivation.dispatched_at,
        };
        diesel::insert_into(area_inbox::table)
            .values(&entry)
            .on_conflict(area_inbox::derivation_id)
            .do_update()
            .set((
                area_inbox::state.eq(&derivation.state),
                area_inbox::urgent.eq(derivation.urgent),
                area_inbox::deadline.eq(derivation.deadline),
            ))
            .execute(conn)?;
    } else {
        diesel::delete(area_inbox::table.find(derivation.id)).execute(conn)?;
    }
    Ok(())
}

pub fn pending_for_area(conn: &mut PgConnection, area_id: Uuid) -> QueryResult<Vec<AreaInboxEntry>> {
    area_inbox::table
        .filter(area_inbox::area_id.eq(area_id))
        .order(area_inbox::dispatched_at.asc())
        .load(conn)
}

pub fn urgent_for_area(conn: &mut PgConnection, area_id: Uuid) -> QueryResult<Vec<AreaInboxEntry>> {
    area_inbox::table
        .filter(area_inbox::area_id.eq(area_id))
        .filter(area_inbox::urgent.eq(true))
        .order(area_inbox::dispatched_at.asc())
        .load(conn)
}

/// Open items whose deadline falls within the next `within_days` days.
pub fn due_within(
    conn: &mut PgConnection,
    area_id: Option<Uuid>,
    within_days: i64,
) -> QueryResult<Vec<AreaInboxEntry>> {
    let now = Utc::now().naive_utc();
    let horizon = now + Duration::days(within_days);
    let mut query = area_inbox::table
        .filter(area_inbox::deadline.is_not_null())
        .filter(area_inbox::deadline.gt(now))
        .filter(area_inbox::deadline.le(horizon))
        .into_boxed();
    if let Some(area_id) = area_id {
        query = query.filter(area_inbox::area_id.eq(area_id));
    }
    query.order(area_inbox::deadline.asc()).load(conn)
}

/// Open items whose deadline has already passed.
pub fn overdue(conn: &mut PgConnection, area_id: Option<Uuid>) -> QueryResult<Vec<AreaInboxEntry>> {
    let now = Utc::now().naive_utc();
    let mut query = area_inbox::table
        .filter(area_inbox::deadline.is_not_null())
        .filter(area_inbox::deadline.le(now))
        .into_boxed();
    if let Some(area_id) = area_id {
        query = query.filter(area_inbox::area_id.eq(area_id));
    }
    query.order(area_inbox::deadline.asc()).load(conn)
}

#[derive(Debug, Serialize)]
pub struct AreaStats {
    pub area_id: Uuid,
    pub open: i64,
    pub urgent: i64,
    pub overdue: i64,
    pub received_in_window: i64,
    pub attended_in_window: i64,
}

/// Worklist counters come from the projection; the window counters come
/// from the ledger, which stays the source of truth for history.
pub fn area_stats(
    conn: &mut PgConnection,
    area_id: Uuid,
    window_days: i64,
) -> QueryResult<AreaStats> {
    let now = Utc::now().naive_utc();
    let since = now - Duration::days(window_days);

    let open: i64 = area_inbox::table
        .filter(area_inbox::area_id.eq(area_id))
        .count()
        .get_result(conn)?;

    let urgent: i64 = area_inbox::table
        .filter(area_inbox::area_id.eq(area_id))
        .filter(area_inbox::urgent.eq(true))
        .count()
        .get_result(conn)?;

    let overdue: i64 = area_inbox::table
        .filter(area_inbox::area_id.eq(area_id))
        .filter(area_inbox::deadline.is_not_null())
        .filter(area_inbox::deadline.le(now))
        .count()
        .get_result(conn)?;

    let received_in_window: i64 = derivations::table
        .filter(derivations::destination_area_id.eq(area_id))
        .filter(derivations::dispatched_at.ge(since))
        .count()
        .get_result(conn)?;

    let attended_in_window: i64 = derivations::table
        .filter(derivations::destination_area_id.eq(area_id))
        .filter(derivations::attended_at.ge(since))
        .count()
        .get_result(conn)?;

    Ok(AreaStats {
        area_id,
        open,
        urgent,
        overdue,
        received_in_window,
        attended_in_window,
    })
}
