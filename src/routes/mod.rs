use axum::http::HeaderValue;
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, patch, post},
    Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::{auth::AuthenticatedUser, lifecycle::MAX_ATTACHMENT_BYTES, state::AppState};

pub mod archive;
pub mod areas;
pub mod auth;
pub mod derivations;
pub mod documents;
pub mod health;
pub mod integrations;
pub mod notifications;
pub mod partner;

pub fn create_router(state: AppState) -> Router<()> {
    let cors = if let Some(origins) = state.config.cors_allowed_origin.as_ref() {
        let headers: Vec<HeaderValue> = origins
            .split(',')
            .filter_map(|value| {
                let trimmed = value.trim();
                (!trimmed.is_empty()).then(|| {
                    trimmed
                        .parse::<HeaderValue>()
                        .expect("invalid CORS allowed origin")
                })
            })
            .collect();

        let allow_origin = AllowOrigin::list(headers);

        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods(tower_http::cors::AllowMethods::mirror_request())
            .allow_headers(tower_http::cors::AllowHeaders::mirror_request())
            .allow_credentials(true)
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::mirror_request())
            .allow_methods(tower_http::cors::AllowMethods::mirror_request())
            .allow_headers(tower_http::cors::AllowHeaders::mirror_request())
            .allow_credentials(true)
    };

    let documents_routes = Router::new()
        .route(
            "/",
            get(documents::list_documents).post(documents::register_document),
        )
        .route("/estadisticas", get(documents::document_statistics))
        .route("/vencidos", get(documents::overdue_documents))
        .route("/buscar/:expediente", get(documents::find_by_expedient))
        .route("/bulk/derivar", post(derivations::bulk_derive))
        .route(
            "/:id",
            get(documents::get_document).patch(documents::update_document),
        )
        .route("/:id/derivar", post(derivations::derive_document))
        .route("/:id/archivar", post(archive::archive_document))
        .route("/:id/historial", get(documents::document_audit_trail))
        .route(
            "/:id/adjuntos",
            get(documents::list_attachments).post(documents::upload_attachment),
        )
        .route(
            "/:id/adjuntos/:attachment_id",
            get(documents::download_attachment),
        )
        .route("/:id/qr", get(documents::qr_payload));

    let derivations_routes = Router::new()
        .route("/bandeja", get(derivations::area_inbox))
        .route("/bandeja/estadisticas", get(derivations::area_statistics))
        .route("/pendientes", get(derivations::pending_for_user))
        .route("/documento/:id", get(derivations::document_derivations))
        .route("/:id", get(derivations::get_derivation))
        .route("/:id/recibir", post(derivations::receive_derivation))
        .route("/:id/atender", post(derivations::attend_derivation))
        .route("/:id/reasignar", post(derivations::reassign_derivation))
        .route("/:id/devolver", post(derivations::return_derivation));

    let notifications_routes = Router::new()
        .route("/", get(notifications::list_notifications))
        .route("/resumen", get(notifications::notification_summary))
        .route("/tipos", get(notifications::notification_kinds))
        .route("/limpiar", delete(notifications::clear_read))
        .route("/leer-todas", post(notifications::mark_all_read))
        .route("/:id", delete(notifications::delete_notification))
        .route("/:id/leer", post(notifications::mark_read))
        .route(
            "/preferencias",
            get(notifications::get_preferences).put(notifications::update_preferences),
        )
        .route("/alertas", post(notifications::schedule_alert));

    let integrations_routes = Router::new()
        .route(
            "/",
            get(integrations::list_integrations).post(integrations::create_integration),
        )
        .route(
            "/:id",
            get(integrations::get_integration)
                .patch(integrations::update_integration)
                .delete(integrations::delete_integration),
        )
        .route("/:id/probar", post(integrations::test_connection))
        .route("/:id/enviar", post(integrations::send_document))
        .route("/:id/bitacora", get(integrations::sync_log));

    let archive_routes = Router::new()
        .route("/", get(archive::list_archive))
        .route("/estadisticas", get(archive::archive_statistics))
        .route("/vencidos", get(archive::expired_records))
        .route("/documento/:id", get(archive::document_records))
        .route(
            "/:id",
            get(archive::get_record).put(archive::update_record),
        )
        .route("/:id/restaurar", post(archive::restore_document));

    let areas_routes = Router::new()
        .route("/", get(areas::list_areas).post(areas::create_area))
        .route("/:id", patch(areas::update_area));

    // Signed partner traffic authenticates by HMAC, not by JWT.
    let partner_routes = Router::new()
        .route("/webhook", post(partner::inbound_webhook))
        .route("/recibir-documento", post(partner::receive_document))
        .route(
            "/estado/:expediente",
            get(partner::document_status).put(partner::update_status),
        )
        .route("/pendientes", get(partner::pending_documents))
        .route("/confirmar-recepcion", post(partner::confirm_reception))
        .route("/health", get(partner::health))
        .route("/version", get(partner::version))
        .route("/esquema", get(partner::schema));

    let protected_state = state.clone();
    let protected_routes = Router::new()
        .nest("/api/v1/documentos", documents_routes)
        .nest("/api/v1/derivaciones", derivations_routes)
        .nest("/api/v1/notificaciones", notifications_routes)
        .nest("/api/v1/integraciones", integrations_routes)
        .nest("/api/v1/archivo", archive_routes)
        .nest("/api/v1/areas", areas_routes)
        .layer(middleware::from_extractor_with_state::<AuthenticatedUser, _>(protected_state));

    let auth_routes = Router::new()
        .route("/login", post(auth::login))
        .route("/me", get(auth::me));

    Router::new()
        .merge(protected_routes)
        .nest("/api/v1/integracion", partner_routes)
        .nest("/api/v1/auth", auth_routes)
        .route("/api/v1/health", get(health::health_check))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(MAX_ATTACHMENT_BYTES as usize + 1024 * 1024))
}
