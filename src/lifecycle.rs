//! State constants and transition rules for documents and derivations,
//! plus the attachment validation the intake surface enforces.

use crate::error::{AppError, AppResult};

// Document states.
pub const DOC_REGISTERED: &str = "REGISTERED";
pub const DOC_IN_PROGRESS: &str = "IN_PROGRESS";
pub const DOC_ATTENDED: &str = "ATTENDED";
pub const DOC_ARCHIVED: &str = "ARCHIVED";

// Derivation states.
pub const DER_PENDING: &str = "PENDING";
pub const DER_RECEIVED: &str = "RECEIVED";
pub const DER_ATTENDED: &str = "ATTENDED";
pub const DER_REASSIGNED: &str = "REASSIGNED";
pub const DER_RETURNED: &str = "RETURNED";

// Priorities, shared by documents, derivation urgency and notifications.
pub const PRIORITY_NORMAL: &str = "NORMAL";
pub const PRIORITY_ALTA: &str = "ALTA";
pub const PRIORITY_URGENTE: &str = "URGENTE";

pub const PRIORITIES: &[&str] = &[PRIORITY_NORMAL, PRIORITY_ALTA, PRIORITY_URGENTE];

pub const MAX_ATTACHMENT_BYTES: i64 = 10 * 1024 * 1024;

pub const ALLOWED_ATTACHMENT_MIMES: &[&str] = &[
    "application/pdf",
    "image/jpeg",
    "image/png",
    "image/gif",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
];

pub fn is_valid_priority(value: &str) -> bool {
    PRIORITIES.contains(&value)
}

/// Legal document transitions: the forward walk plus the two recovery
/// edges (restoration and full devolution).
pub fn document_transition_allowed(from: &str, to: &str) -> bool {
    matches!(
        (from, to),
        (DOC_REGISTERED, DOC_IN_PROGRESS)
            | (DOC_IN_PROGRESS, DOC_ATTENDED)
            | (DOC_ATTENDED, DOC_ARCHIVED)
            | (DOC_ATTENDED, DOC_IN_PROGRESS)
            | (DOC_ARCHIVED, DOC_IN_PROGRESS)
            | (DOC_IN_PROGRESS, DOC_REGISTERED)
    )
}

pub fn ensure_document_transition(from: &str, to: &str) -> AppResult<()> {
    if document_transition_allowed(from, to) {
        Ok(())
    } else {
        Err(AppError::invalid_transition(format!(
            "documento no puede pasar de {from} a {to}"
        )))
    }
}

pub fn derivation_is_open(state: &str) -> bool {
    state == DER_PENDING || state == DER_RECEIVED
}

pub fn ensure_derivation_receivable(state: &str) -> AppResult<()> {
    if state == DER_PENDING {
        Ok(())
    } else {
        Err(AppError::invalid_transition(format!(
            "derivacion en estado {state} no puede recibirse"
        )))
    }
}

pub fn ensure_derivation_attendable(state: &str) -> AppResult<()> {
    if state == DER_RECEIVED {
        Ok(())
    } else {
        Err(AppError::invalid_transition(format!(
            "derivacion en estado {state} no puede atenderse"
        )))
    }
}

/// Reassignment and devolution are legal from either open state.
pub fn ensure_derivation_closable(state: &str) -> AppResult<()> {
    if derivation_is_open(state) {
        Ok(())
    } else {
        Err(AppError::invalid_transition(format!(
            "derivacion en estado {state} ya fue cerrada"
        )))
    }
}

pub fn validate_attachment(mime_type: &str, size_bytes: i64) -> AppResult<()> {
    if !ALLOWED_ATTACHMENT_MIMES.contains(&mime_type) {
        return Err(AppError::unprocessable(format!(
            "tipo de archivo no permitido: {mime_type}"
        )));
    }
    if size_bytes > MAX_ATTACHMENT_BYTES {
        return Err(AppError::payload_too_large(format!(
            "archivo excede el limite de {} bytes",
            MAX_ATTACHMENT_BYTES
        )));
    }
    Ok(())
}

/// Cheap magic-number check on the first bytes of an upload. Only the
/// formats with a stable signature are probed; Office containers all
/// share the zip magic, legacy Office the OLE magic.
pub fn probe_matches_mime(bytes: &[u8], mime_type: &str) -> bool {
    match mime_type {
        "application/pdf" => bytes.starts_with(b"%PDF"),
        "image/png" => bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47]),
        "image/jpeg" => bytes.starts_with(&[0xFF, 0xD8, 0xFF]),
        "image/gif" => bytes.starts_with(b"GIF8"),
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        | "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => {
            bytes.starts_with(&[0x50, 0x4B])
        }
        "application/msword" | "application/vnd.ms-excel" => {
            bytes.starts_with(&[0xD0, 0xCF, 0x11, 0xE0])
        }
        _ => false,
    }
}

/// Parses `EXP-YYYY-NNNN` into (year, sequence).
pub fn parse_expedient_number(value: &str) -> Option<(i32, i64)> {
    let rest = value.strip_prefix("EXP-")?;
    let (year, seq) = rest.split_once('-')?;
    if year.len() != 4 || seq.len() < 4 {
        return None;
    }
    let year: i32 = year.parse().ok()?;
    if !seq.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let seq: i64 = seq.parse().ok()?;
    Some((year, seq))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_walk_is_allowed() {
        assert!(document_transition_allowed(DOC_REGISTERED, DOC_IN_PROGRESS));
        assert!(document_transition_allowed(DOC_IN_PROGRESS, DOC_ATTENDED));
        assert!(document_transition_allowed(DOC_ATTENDED, DOC_ARCHIVED));
    }

    #[test]
    fn recovery_edges_are_allowed() {
        assert!(document_transition_allowed(DOC_ARCHIVED, DOC_IN_PROGRESS));
        assert!(document_transition_allowed(DOC_IN_PROGRESS, DOC_REGISTERED));
    }

    #[test]
    fn skipping_states_is_rejected() {
        assert!(!document_transition_allowed(DOC_REGISTERED, DOC_ATTENDED));
        assert!(!document_transition_allowed(DOC_REGISTERED, DOC_ARCHIVED));
        assert!(!document_transition_allowed(DOC_ARCHIVED, DOC_REGISTERED));
        assert!(!document_transition_allowed(DOC_ATTENDED, DOC_REGISTERED));
    }

    #[test]
    fn attend_requires_received() {
        assert!(ensure_derivation_attendable(DER_RECEIVED).is_ok());
        assert!(ensure_derivation_attendable(DER_PENDING).is_err());
        assert!(ensure_derivation_attendable(DER_ATTENDED).is_err());
    }

    #[test]
    fn reassign_allowed_from_both_open_states() {
        assert!(ensure_derivation_closable(DER_PENDING).is_ok());
        assert!(ensure_derivation_closable(DER_RECEIVED).is_ok());
        assert!(ensure_derivation_closable(DER_RETURNED).is_err());
    }

    #[test]
    fn attachment_validation_enforces_allow_list_and_size() {
        assert!(validate_attachment("application/pdf", 1024).is_ok());
        assert!(validate_attachment("text/plain", 1024).is_err());
        assert!(validate_attachment("application/pdf", MAX_ATTACHMENT_BYTES + 1).is_err());
    }

    #[test]
    fn magic_probe_recognizes_pdf_and_png() {
        assert!(probe_matches_mime(b"%PDF-1.7 rest", "application/pdf"));
        assert!(probe_matches_mime(
            &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A],
            "image/png"
        ));
        assert!(!probe_matches_mime(b"plain text", "application/pdf"));
    }

    #[test]
    fn expedient_numbers_parse_and_reject_garbage() {
        assert_eq!(parse_expedient_number("EXP-2026-0001"), Some((2026, 1)));
        assert_eq!(parse_expedient_number("EXP-2026-12345"), Some((2026, 12345)));
        assert_eq!(parse_expedient_number("EXP-26-0001"), None);
        assert_eq!(parse_expedient_number("EST-AD-2026-0001"), None);
        assert_eq!(parse_expedient_number("EXP-2026-12a"), None);
    }
}
