//! Archive classifications, retention policies and expiry computation.

use chrono::{Duration, NaiveDateTime};

use crate::error::{AppError, AppResult};

pub const STATUS_ARCHIVED: &str = "ARCHIVED";
pub const STATUS_RESTORED: &str = "RESTORED";

pub const CLASSIFICATIONS: &[(&str, &str)] = &[
    ("TRAMITE_DOCUMENTARIO", "TD"),
    ("ADMINISTRATIVO", "AD"),
    ("LEGAL", "LE"),
    ("CONTABLE", "CO"),
    ("TECNICO", "TE"),
    ("OTROS", "OT"),
];

pub const RETENTION_POLICIES: &[(&str, Option<i64>)] = &[
    ("UN_ANO", Some(365)),
    ("TRES_ANOS", Some(1095)),
    ("CINCO_ANOS", Some(1825)),
    ("DIEZ_ANOS", Some(3650)),
    ("PERMANENTE", None),
];

/// Two-letter code used inside location codes, e.g. `EST-AD-2026-0001`.
pub fn classification_code(classification: &str) -> AppResult<&'static str> {
    CLASSIFICATIONS
        .iter()
        .find(|(name, _)| *name == classification)
        .map(|(_, code)| *code)
        .ok_or_else(|| {
            AppError::bad_request(format!("clasificacion desconocida: {classification}"))
        })
}

pub fn retention_days(policy: &str) -> AppResult<Option<i64>> {
    RETENTION_POLICIES
        .iter()
        .find(|(name, _)| *name == policy)
        .map(|(_, days)| *days)
        .ok_or_else(|| AppError::bad_request(format!("politica de retencion desconocida: {policy}")))
}

/// None iff the policy is PERMANENTE.
pub fn compute_expiry(archived_at: NaiveDateTime, policy: &str) -> AppResult<Option<NaiveDateTime>> {
    Ok(retention_days(policy)?.map(|days| archived_at + Duration::days(days)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 8, 30)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
    }

    #[test]
    fn classification_codes_match_the_catalogue() {
        assert_eq!(classification_code("ADMINISTRATIVO").unwrap(), "AD");
        assert_eq!(classification_code("TRAMITE_DOCUMENTARIO").unwrap(), "TD");
        assert_eq!(classification_code("OTROS").unwrap(), "OT");
        assert!(classification_code("FISCAL").is_err());
    }

    #[test]
    fn three_year_policy_expires_after_1095_days() {
        let expiry = compute_expiry(ts(), "TRES_ANOS").unwrap().unwrap();
        assert_eq!((expiry - ts()).num_days(), 1095);
    }

    #[test]
    fn permanent_policy_never_expires() {
        assert_eq!(compute_expiry(ts(), "PERMANENTE").unwrap(), None);
    }

    #[test]
    fn unknown_policy_is_rejected() {
        assert!(compute_expiry(ts(), "DOS_ANOS").is_err());
    }

    #[test]
    fn remaining_policies_cover_the_expected_spans() {
        for (policy, days) in [("UN_ANO", 365), ("CINCO_ANOS", 1825), ("DIEZ_ANOS", 3650)] {
            let expiry = compute_expiry(ts(), policy).unwrap().unwrap();
            assert_eq!((expiry - ts()).num_days(), days);
        }
    }
}
