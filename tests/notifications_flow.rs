mod common;

use anyhow::Result;
use axum::http::StatusCode;
use chrono::{Duration, Utc};
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

async fn register_and_derive(app: &TestApp, s: &Setup, urgent: bool) -> Result<Uuid> {
    let payload = json!({
        "tipo": "OFICIO",
        "remitente": "Fiscalia",
        "asunto": "Requerimiento de informacion",
        "folios": 2,
    });
    let response = app
        .post_json("/api/v1/documentos", &payload, Some(&s.mesa_token))
        .await?;
    let doc = body_to_json(response.into_body()).await?;
    let doc_id: Uuid = doc["id"].as_str().unwrap().parse()?;

    let response = app
        .post_json(
            &format!("/api/v1/documentos/{doc_id}/derivar"),
            &json!({
                "area_destino": s.legal_area,
                "instrucciones": "atender con prioridad",
                "urgente": urgent,
            }),
            Some(&s.mesa_token),
        )
        .await?;
    anyhow::ensure!(response.status() == StatusCode::CREATED, "derive failed");
    Ok(doc_id)
}

async fn list_notifications(app: &TestApp, token: &str) -> Result<Value> {
    let response = app.get("/api/v1/notificaciones", Some(token)).await?;
    body_to_json(response.into_body()).await
}

#[tokio::test]
async fn derivation_notifies_the_destination_area() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };
    let s = setup(&app).await?;
    register_and_derive(&app, &s, true).await?;

    let list = list_notifications(&app, &s.legal_token).await?;
    let items = list.as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["tipo"], "DERIVACION_RECIBIDA");
    assert_eq!(items[0]["prioridad"], "URGENTE");
    assert_eq!(items[0]["leida"], false);

    // The originator gets nothing.
    let list = list_notifications(&app, &s.mesa_token).await?;
    assert!(list.as_array().unwrap().is_empty());

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn preference_opt_out_suppresses_the_kind() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };
    let s = setup(&app).await?;

    let response = app
        .put_json(
            "/api/v1/notificaciones/preferencias",
            &json!({"tipos": {"DERIVACION_RECIBIDA": false}}),
            Some(&s.legal_token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    register_and_derive(&app, &s, false).await?;
    let list = list_notifications(&app, &s.legal_token).await?;
    assert!(list.as_array().unwrap().is_empty());

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn unknown_preference_kind_is_rejected() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };
    let s = setup(&app).await?;

    let response = app
        .put_json(
            "/api/v1/notificaciones/preferencias",
            &json!({"tipos": {"NOTIFICACION_INVENTADA": true}}),
            Some(&s.legal_token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .put_json(
            "/api/v1/notificaciones/preferencias",
            &json!({"hora_resumen": 24}),
            Some(&s.legal_token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn mark_read_and_mark_all() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };
    let s = setup(&app).await?;
    register_and_derive(&app, &s, false).await?;
    register_and_derive(&app, &s, false).await?;

    let list = list_notifications(&app, &s.legal_token).await?;
    let items = list.as_array().unwrap();
    assert_eq!(items.len(), 2);
    let first_id = items[0]["id"].as_str().unwrap().to_string();

    let response = app
        .post_json(
            &format!("/api/v1/notificaciones/{first_id}/leer"),
            &json!({}),
            Some(&s.legal_token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let marked = body_to_json(response.into_body()).await?;
    assert_eq!(marked["leida"], true);

    // Another user cannot touch it.
    let response = app
        .post_json(
            &format!("/api/v1/notificaciones/{first_id}/leer"),
            &json!({}),
            Some(&s.mesa_token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .post_json(
            "/api/v1/notificaciones/leer-todas",
            &json!({}),
            Some(&s.legal_token),
        )
        .await?;
    let body = body_to_json(response.into_body()).await?;
    assert_eq!(body["marcadas"], 1);

    let response = app
        .get(
            "/api/v1/notificaciones?solo_no_leidas=true",
            Some(&s.legal_token),
        )
        .await?;
    let unread = body_to_json(response.into_body()).await?;
    assert!(unread.as_array().unwrap().is_empty());

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn scheduled_alerts_validate_document_and_date() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };
    let s = setup(&app).await?;
    let doc_id = register_and_derive(&app, &s, false).await?;

    let future = (Utc::now() + Duration::days(1)).naive_utc();
    let response = app
        .post_json(
            "/api/v1/notificaciones/alertas",
            &json!({
                "documento_id": doc_id,
                "mensaje": "Revisar antes de la audiencia",
                "fecha": future,
            }),
            Some(&s.legal_token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);

    let past = (Utc::now() - Duration::hours(1)).naive_utc();
    let response = app
        .post_json(
            "/api/v1/notificaciones/alertas",
            &json!({
                "documento_id": doc_id,
                "mensaje": "tarde",
                "fecha": past,
            }),
            Some(&s.legal_token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .post_json(
            "/api/v1/notificaciones/alertas",
            &json!({
                "documento_id": Uuid::new_v4(),
                "mensaje": "documento fantasma",
                "fecha": future,
            }),
            Some(&s.legal_token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn event_subscription_notifies_the_subscriber() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };
    let s = setup(&app).await?;

    let response = app
        .put_json(
            "/api/v1/notificaciones/preferencias",
            &json!({"suscripciones": ["documento.creado"]}),
            Some(&s.legal_token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let prefs = body_to_json(response.into_body()).await?;
    assert_eq!(prefs["suscripciones"], json!(["documento.creado"]));

    // A registration fires documento.creado; only the subscriber hears.
    let response = app
        .post_json(
            "/api/v1/documentos",
            &json!({
                "tipo": "OFICIO",
                "remitente": "Contraloria",
                "asunto": "Accion de control",
                "folios": 1,
            }),
            Some(&s.mesa_token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);

    let list = list_notifications(&app, &s.legal_token).await?;
    let items = list.as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["tipo"], "EVENTO_SUSCRITO");
    assert!(items[0]["titulo"]
        .as_str()
        .unwrap()
        .contains("documento.creado"));

    let list = list_notifications(&app, &s.mesa_token).await?;
    assert!(list.as_array().unwrap().is_empty());

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn unknown_event_subscription_is_rejected() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };
    let s = setup(&app).await?;

    let response = app
        .put_json(
            "/api/v1/notificaciones/preferencias",
            &json!({"suscripciones": ["documento.inventado"]}),
            Some(&s.legal_token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn delete_and_clear_respect_ownership_and_read_state() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };
    let s = setup(&app).await?;
    register_and_derive(&app, &s, false).await?;
    register_and_derive(&app, &s, false).await?;

    let list = list_notifications(&app, &s.legal_token).await?;
    let items = list.as_array().unwrap();
    assert_eq!(items.len(), 2);
    let first_id = items[0]["id"].as_str().unwrap().to_string();
    let second_id = items[1]["id"].as_str().unwrap().to_string();

    // Someone else's delete lands on 404.
    let response = app
        .delete(
            &format!("/api/v1/notificaciones/{first_id}"),
            Some(&s.mesa_token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .delete(
            &format!("/api/v1/notificaciones/{first_id}"),
            Some(&s.legal_token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // limpiar removes read ones only.
    let response = app
        .post_json(
            &format!("/api/v1/notificaciones/{second_id}/leer"),
            &json!({}),
            Some(&s.legal_token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    register_and_derive(&app, &s, false).await?;

    let response = app
        .delete("/api/v1/notificaciones/limpiar", Some(&s.legal_token))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_json(response.into_body()).await?;
    assert_eq!(body["eliminadas"], 1);

    let list = list_notifications(&app, &s.legal_token).await?;
    assert_eq!(list.as_array().unwrap().len(), 1);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn summary_counts_unread_per_kind() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };
    let s = setup(&app).await?;
    register_and_derive(&app, &s, false).await?;
    register_and_derive(&app, &s, false).await?;

    let response = app
        .get("/api/v1/notificaciones/resumen", Some(&s.legal_token))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let summary = body_to_json(response.into_body()).await?;
    assert_eq!(summary["total"], 2);
    assert_eq!(summary["no_leidas"], 2);
    assert_eq!(summary["por_tipo"]["DERIVACION_RECIBIDA"], 2);

    let response = app
        .get("/api/v1/notificaciones/tipos", Some(&s.legal_token))
        .await?;
    let kinds = body_to_json(response.into_body()).await?;
    assert!(kinds["tipos"]
        .as_array()
        .unwrap()
        .iter()
        .any(|k| k == "EVENTO_SUSCRITO"));

    app.cleanup().await?;
    Ok(())
}
