mod common;

use anyhow::Result;
use axum::http::StatusCode;
use chrono::{DateTime, Datelike, Utc};
use common::{acquire_db_lock, body_to_json, TestApp};
use serde_json::{json, Value};
use uuid::Uuid;

struct Setup {
    mesa_token: String,
    legal_token: String,
    legal_area: Uuid,
}

async fn setup(app: &TestApp) -> Result<Setup> {
    let legal_area = app.insert_area("Asesoria Legal", "LEG").await?;
    app.insert_user("mesa", "passw0rd", "mesa_partes", None).await?;
    app.insert_user("abogada", "passw0rd", "funcionario", Some(legal_area))
        .await?;
    Ok(Setup {
        mesa_token: app.login_token("mesa", "passw0rd").await?,
        legal_token: app.login_token("abogada", "passw0rd").await?,
        legal_area,
    })
}

/// Register, derive, receive and attend, leaving the document ready for
/// the archive.
async fn attended_document(app: &TestApp, s: &Setup) -> Result<Uuid> {
    let payload = json!({
        "tipo": "OFICIO",
        "remitente": "Ciudadano",
        "asunto": "Tramite concluido",
        "folios": 1,
    });
    let response = app
        .post_json("/api/v1/documentos", &payload, Some(&s.mesa_token))
        .await?;
    let doc = body_to_json(response.into_body()).await?;
    let doc_id: Uuid = doc["id"].as_str().unwrap().parse()?;

    let response = app
        .post_json(
            &format!("/api/v1/documentos/{doc_id}/derivar"),
            &json!({"area_destino": s.legal_area, "instrucciones": "atender"}),
            Some(&s.mesa_token),
        )
        .await?;
    let derivation = body_to_json(response.into_body()).await?;
    let derivation_id = derivation["id"].as_str().unwrap().to_string();

    app.post_json(
        &format!("/api/v1/derivaciones/{derivation_id}/recibir"),
        &json!({}),
        Some(&s.legal_token),
    )
    .await?;
    app.post_multipart(
        &format!("/api/v1/derivaciones/{derivation_id}/atender"),
        None,
        &[("observaciones", "atendido")],
        &s.legal_token,
    )
    .await?;
    Ok(doc_id)
}

async fn archive(
    app: &TestApp,
    token: &str,
    doc_id: Uuid,
    classification: &str,
    retention: &str,
) -> Result<(StatusCode, Value)> {
    let payload = json!({
        "clasificacion": classification,
        "retencion": retention,
        "ubicacion_fisica": "Estante 4, Caja 12",
    });
    let response = app
        .post_json(
            &format!("/api/v1/documentos/{doc_id}/archivar"),
            &payload,
            Some(token),
        )
        .await?;
    let status = response.status();
    let body = body_to_json(response.into_body()).await?;
    Ok((status, body))
}

#[tokio::test]
async fn archiving_allocates_location_code_and_expiry() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };
    let s = setup(&app).await?;
    let doc_id = attended_document(&app, &s).await?;

    let year = Utc::now().year();
    let (status, record) =
        archive(&app, &s.mesa_token, doc_id, "ADMINISTRATIVO", "TRES_ANOS").await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(record["codigo_ubicacion"], format!("EST-AD-{year}-0001"));
    assert_eq!(record["estado"], "ARCHIVED");

    let archived: DateTime<Utc> = record["archivado"].as_str().unwrap().parse()?;
    let expires: DateTime<Utc> = record["vence"].as_str().unwrap().parse()?;
    assert_eq!((expires - archived).num_days(), 1095);

    let response = app
        .get(&format!("/api/v1/documentos/{doc_id}"), Some(&s.mesa_token))
        .await?;
    let doc = body_to_json(response.into_body()).await?;
    assert_eq!(doc["estado"], "ARCHIVED");
    assert!(doc["area_actual"].is_null());
    assert!(doc["archivado"].is_string());

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn permanent_retention_never_expires() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };
    let s = setup(&app).await?;
    let doc_id = attended_document(&app, &s).await?;

    let (status, record) = archive(&app, &s.mesa_token, doc_id, "LEGAL", "PERMANENTE").await?;
    assert_eq!(status, StatusCode::CREATED);
    assert!(record["vence"].is_null());
    assert!(record["codigo_ubicacion"]
        .as_str()
        .unwrap()
        .starts_with("EST-LE-"));

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn only_attended_documents_can_be_archived() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };
    let s = setup(&app).await?;

    let payload = json!({
        "tipo": "OFICIO",
        "remitente": "Ciudadano",
        "asunto": "Recien llegado",
        "folios": 1,
    });
    let response = app
        .post_json("/api/v1/documentos", &payload, Some(&s.mesa_token))
        .await?;
    let doc = body_to_json(response.into_body()).await?;
    let doc_id: Uuid = doc["id"].as_str().unwrap().parse()?;

    let (status, _) = archive(&app, &s.mesa_token, doc_id, "OTROS", "UN_ANO").await?;
    assert_eq!(status, StatusCode::CONFLICT);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn unknown_classification_is_rejected() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };
    let s = setup(&app).await?;
    let doc_id = attended_document(&app, &s).await?;

    let (status, _) = archive(&app, &s.mesa_token, doc_id, "FISCAL", "UN_ANO").await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = archive(&app, &s.mesa_token, doc_id, "LEGAL", "DOS_ANOS").await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn restore_reopens_the_document_in_the_restorers_area() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };
    let s = setup(&app).await?;
    app.insert_user("supervisora", "passw0rd", "supervisor", Some(s.legal_area))
        .await?;
    let supervisor_token = app.login_token("supervisora", "passw0rd").await?;

    let doc_id = attended_document(&app, &s).await?;
    let (_, record) = archive(&app, &s.mesa_token, doc_id, "ADMINISTRATIVO", "UN_ANO").await?;
    let record_id = record["id"].as_str().unwrap().to_string();

    let response = app
        .post_json(
            &format!("/api/v1/archivo/{record_id}/restaurar"),
            &json!({"motivo": "Nueva resolucion sobre el expediente"}),
            Some(&supervisor_token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_json(response.into_body()).await?;
    assert_eq!(body["documento"]["estado"], "IN_PROGRESS");
    assert_eq!(body["documento"]["area_actual"], json!(s.legal_area));
    assert_eq!(body["registro"]["estado"], "RESTORED");
    assert!(body["derivacion_id"].is_string());

    // A restored record cannot be restored twice.
    let response = app
        .post_json(
            &format!("/api/v1/archivo/{record_id}/restaurar"),
            &json!({"motivo": "otra vez"}),
            Some(&supervisor_token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn archive_listing_and_statistics() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };
    let s = setup(&app).await?;

    let first = attended_document(&app, &s).await?;
    archive(&app, &s.mesa_token, first, "ADMINISTRATIVO", "UN_ANO").await?;
    let second = attended_document(&app, &s).await?;
    archive(&app, &s.mesa_token, second, "LEGAL", "PERMANENTE").await?;

    let response = app
        .get("/api/v1/archivo?clasificacion=LEGAL", Some(&s.mesa_token))
        .await?;
    let list = body_to_json(response.into_body()).await?;
    assert_eq!(list.as_array().unwrap().len(), 1);

    let response = app
        .get("/api/v1/archivo/estadisticas", Some(&s.mesa_token))
        .await?;
    let stats = body_to_json(response.into_body()).await?;
    assert_eq!(stats["total"], 2);
    assert_eq!(stats["archivados"], 2);
    assert_eq!(stats["por_clasificacion"]["LEGAL"], 1);
    assert_eq!(stats["por_clasificacion"]["ADMINISTRATIVO"], 1);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn record_lookup_by_id_and_by_document() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };
    let s = setup(&app).await?;
    app.insert_user("supervisora", "passw0rd", "supervisor", Some(s.legal_area))
        .await?;
    let supervisor_token = app.login_token("supervisora", "passw0rd").await?;

    let doc_id = attended_document(&app, &s).await?;
    let (_, first) = archive(&app, &s.mesa_token, doc_id, "ADMINISTRATIVO", "UN_ANO").await?;
    let first_id = first["id"].as_str().unwrap().to_string();

    let response = app
        .get(&format!("/api/v1/archivo/{first_id}"), Some(&s.legal_token))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let record = body_to_json(response.into_body()).await?;
    assert_eq!(record["documento_id"], json!(doc_id));

    // Restore and re-archive; the document now has two records.
    app.post_json(
        &format!("/api/v1/archivo/{first_id}/restaurar"),
        &json!({"motivo": "revision del caso"}),
        Some(&supervisor_token),
    )
    .await?;
    let response = app
        .get("/api/v1/derivaciones/bandeja", Some(&s.legal_token))
        .await?;
    let inbox = body_to_json(response.into_body()).await?;
    let derivation_id = inbox.as_array().unwrap()[0]["derivacion_id"]
        .as_str()
        .unwrap()
        .to_string();
    app.post_json(
        &format!("/api/v1/derivaciones/{derivation_id}/recibir"),
        &json!({}),
        Some(&s.legal_token),
    )
    .await?;
    app.post_multipart(
        &format!("/api/v1/derivaciones/{derivation_id}/atender"),
        None,
        &[("observaciones", "atendido de nuevo")],
        &s.legal_token,
    )
    .await?;
    archive(&app, &s.mesa_token, doc_id, "ADMINISTRATIVO", "UN_ANO").await?;

    let response = app
        .get(
            &format!("/api/v1/archivo/documento/{doc_id}"),
            Some(&s.mesa_token),
        )
        .await?;
    let records = body_to_json(response.into_body()).await?;
    let records = records.as_array().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["estado"], "ARCHIVED");
    assert_eq!(records[1]["estado"], "RESTORED");

    let response = app
        .get(&format!("/api/v1/archivo/{}", Uuid::new_v4()), Some(&s.mesa_token))
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn shelf_details_can_be_corrected_after_archiving() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };
    let s = setup(&app).await?;
    let doc_id = attended_document(&app, &s).await?;
    let (_, record) = archive(&app, &s.mesa_token, doc_id, "OTROS", "UN_ANO").await?;
    let record_id = record["id"].as_str().unwrap().to_string();

    let response = app
        .put_json(
            &format!("/api/v1/archivo/{record_id}"),
            &json!({"ubicacion_fisica": "Estante 7, Caja 2", "notas": "reubicado"}),
            Some(&s.mesa_token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let updated = body_to_json(response.into_body()).await?;
    assert_eq!(updated["ubicacion_fisica"], "Estante 7, Caja 2");
    assert_eq!(updated["notas"], "reubicado");

    // Empty update and unauthorized roles are rejected.
    let response = app
        .put_json(
            &format!("/api/v1/archivo/{record_id}"),
            &json!({}),
            Some(&s.mesa_token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let response = app
        .put_json(
            &format!("/api/v1/archivo/{record_id}"),
            &json!({"notas": "no deberia"}),
            Some(&s.legal_token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    app.cleanup().await?;
    Ok(())
}
