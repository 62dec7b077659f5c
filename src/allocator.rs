//! Counter-backed allocation of expedient numbers and archive location
//! codes. Each (kind, year, bucket) triple owns one row; the increment is
//! a single upsert so concurrent callers get distinct, gap-free values.
//! Running inside the caller's transaction means a rolled-back create
//! also rolls the increment back.

use diesel::pg::PgConnection;
use diesel::prelude::*;
use thiserror::Error;

use crate::schema::sequence_counters;

pub const KIND_EXPEDIENT: &str = "expedient";
pub const KIND_ARCHIVE: &str = "archive";

// Bucket for kinds that do not subdivide further.
const NO_BUCKET: &str = "-";

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("allocation failed: {0}")]
    Database(#[from] diesel::result::Error),
}

pub type AllocationResult<T> = Result<T, AllocationError>;

fn next_value(
    conn: &mut PgConnection,
    kind: &str,
    year: i32,
    bucket: &str,
) -> AllocationResult<i64> {
    let value = diesel::insert_into(sequence_counters::table)
        .values((
            sequence_counters::kind.eq(kind),
            sequence_counters::year.eq(year),
            sequence_counters::bucket.eq(bucket),
            sequence_counters::value.eq(1i64),
        ))
        .on_conflict((
            sequence_counters::kind,
            sequence_counters::year,
            sequence_counters::bucket,
        ))
        .do_update()
        .set(sequence_counters::value.eq(sequence_counters::value + 1))
        .returning(sequence_counters::value)
        .get_result::<i64>(conn)?;
    Ok(value)
}

/// Next expedient number for the given year, `EXP-YYYY-NNNN`.
pub fn allocate_expedient(conn: &mut PgConnection, year: i32) -> AllocationResult<String> {
    let seq = next_value(conn, KIND_EXPEDIENT, year, NO_BUCKET)?;
    Ok(format_expedient(year, seq))
}

/// Next archive location code for (classification code, year),
/// `EST-XX-YYYY-NNNN`. `class_code` is the two-letter classification
/// abbreviation.
pub fn allocate_archive_code(
    conn: &mut PgConnection,
    class_code: &str,
    year: i32,
) -> AllocationResult<String> {
    let seq = next_value(conn, KIND_ARCHIVE, year, class_code)?;
    Ok(format_archive_code(class_code, year, seq))
}

pub fn format_expedient(year: i32, seq: i64) -> String {
    format!("EXP-{year}-{seq:04}")
}

pub fn format_archive_code(class_code: &str, year: i32, seq: i64) -> String {
    format!("EST-{class_code}-{year}-{seq:04}")
}
