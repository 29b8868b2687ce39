use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use greenhouse_link::{build_router, config::ServerConfig, db, AppState};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const SECRET: &str = "0f1e2d3c4b5a69788796a5b4c3d2e1f00f1e2d3c4b5a69788796a5b4c3d2e1f0";

async fn app() -> Router {
    let pool = db::init_pool("sqlite::memory:").await.unwrap();
    build_router(Arc::new(AppState::new(pool, ServerConfig::default())))
}

async fn call(app: &Router, method: &str, uri: &str, key: Option<(&str, &str)>, body: Value) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some((id, secret)) = key {
        builder = builder
            .header("x-composite-device-id", id)
            .header("x-device-key", secret);
    }
    let response = app
        .clone()
        .oneshot(builder.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn register(app: &Router) {
    let (status, device) = call(
        app,
        "POST",
        "/api/devices",
        None,
        json!({ "project_code": "proj1", "slot": 5, "name": "North tunnel" }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(device["id"], "PROJ1-ESP5");
    assert!(device.get("secret_hash").is_none());
}

#[tokio::test]
async fn first_heartbeat_binds_and_marks_online() {
    let app = app().await;
    register(&app).await;

    let creds = Some(("PROJ1-ESP5", SECRET));
    let (status, body) = call(
        &app,
        "POST",
        "/device/heartbeat",
        creds,
        json!({ "firmware_version": "v3.2.0", "hostname": "http://10.0.0.7" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["config_version"], 0);

    let (_, device) = call(&app, "GET", "/api/devices/PROJ1-ESP5", None, Value::Null).await;
    assert_eq!(device["status"], "online");
    assert!(device["last_contact_at"].is_string());
    assert_eq!(device["firmware_version"], "v3.2.0");

    let (status, _) = call(
        &app,
        "POST",
        "/device/heartbeat",
        Some(("PROJ1-ESP5", "someone-else")),
        json!({ "firmware_version": "v3.2.0" }),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_identity_and_missing_headers_are_rejected() {
    let app = app().await;
    let (status, _) = call(
        &app,
        "POST",
        "/device/heartbeat",
        Some(("GHOST-ESP1", SECRET)),
        json!({ "firmware_version": "v1" }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&app, "POST", "/device/commands/poll", None, json!({})).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (_, list) = call(&app, "GET", "/api/devices", None, Value::Null).await;
    assert_eq!(list["devices"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn config_edit_command_round_trip() {
    let app = app().await;
    register(&app).await;
    let creds = Some(("PROJ1-ESP5", SECRET));

    let (status, _) = call(
        &app,
        "PUT",
        "/api/devices/PROJ1-ESP5/actuators/GPIO12",
        None,
        json!({ "actuator_type": "fan", "supports_pwm": true }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, beat) = call(&app, "POST", "/device/heartbeat", creds, json!({ "firmware_version": "v3" })).await;
    assert_eq!(beat["config_version"], 1);

    let (status, snapshot) = call(&app, "POST", "/device/config", creds, json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot["config_version"], 1);
    assert_eq!(snapshot["entries"][0]["type"], "fan");
    assert_eq!(snapshot["entries"][0]["port_id"], "GPIO12");

    let commands_uri = "/api/devices/PROJ1-ESP5/actuators/GPIO12/commands";
    let (status, _) = call(&app, "POST", commands_uri, None, json!({ "kind": "set_value", "value": 150 })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, command) = call(&app, "POST", commands_uri, None, json!({ "kind": "set_value", "value": 50 })).await;
    assert_eq!(status, StatusCode::CREATED);
    let command_id = command["id"].as_str().unwrap().to_string();

    let (_, polled) = call(&app, "POST", "/device/commands/poll", creds, json!({})).await;
    assert_eq!(polled["commands"].as_array().unwrap().len(), 1);
    assert_eq!(polled["commands"][0]["actuator_local_id"], "GPIO12");
    assert_eq!(polled["commands"][0]["value"], 50);

    let (_, again) = call(&app, "POST", "/device/commands/poll", creds, json!({})).await;
    assert!(again["commands"].as_array().unwrap().is_empty());

    let confirm_uri = format!("/device/commands/{}/confirm", command_id);
    let (status, ack) = call(&app, "POST", &confirm_uri, creds, json!({ "outcome": "confirmed" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["status"], "confirmed");
    let (status, _) = call(&app, "POST", &confirm_uri, creds, json!({ "outcome": "confirmed" })).await;
    assert_eq!(status, StatusCode::OK);

    let (_, actuators) = call(&app, "GET", "/api/devices/PROJ1-ESP5/actuators", None, Value::Null).await;
    assert_eq!(actuators["actuators"][0]["is_on"], true);
    assert_eq!(actuators["actuators"][0]["current_value"], 50);
}

#[tokio::test]
async fn readings_discover_sensors() {
    let app = app().await;
    register(&app).await;
    let creds = Some(("PROJ1-ESP5", SECRET));

    let (status, body) = call(
        &app,
        "POST",
        "/device/readings",
        creds,
        json!({ "readings": [
            { "local_sensor_id": "GPIO4", "declared_type": "temperature", "value": 23.5, "unit": "C" }
        ] }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["inserted_count"], 1);

    let (_, sensors) = call(&app, "GET", "/api/devices/PROJ1-ESP5/sensors", None, Value::Null).await;
    let sensor_id = sensors["sensors"][0]["id"].as_str().unwrap().to_string();
    let (_, readings) = call(
        &app,
        "GET",
        &format!("/api/sensors/{}/readings?limit=5", sensor_id),
        None,
        Value::Null,
    )
    .await;
    assert_eq!(readings["readings"][0]["value"], 23.5);
}

#[tokio::test]
async fn rejected_first_calls_do_not_bind_the_secret() {
    let app = app().await;
    register(&app).await;

    let (status, _) = call(
        &app,
        "POST",
        "/device/heartbeat",
        Some(("PROJ1-ESP5", "intruder")),
        json!({ "firmware_version": "" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        &app,
        "POST",
        "/device/readings",
        Some(("PROJ1-ESP5", "intruder")),
        json!({ "readings": [
            { "local_sensor_id": "", "declared_type": "temperature", "value": 20.0 }
        ] }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, device) = call(&app, "GET", "/api/devices/PROJ1-ESP5", None, Value::Null).await;
    assert_eq!(device["status"], "offline");
    assert!(device["last_contact_at"].is_null());

    // The real device still binds on its first valid call
    let creds = Some(("PROJ1-ESP5", SECRET));
    let (status, _) = call(&app, "POST", "/device/heartbeat", creds, json!({ "firmware_version": "v3" })).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(
        &app,
        "POST",
        "/device/heartbeat",
        Some(("PROJ1-ESP5", "intruder")),
        json!({ "firmware_version": "v3" }),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn device_commands_ride_on_the_heartbeat() {
    let app = app().await;
    register(&app).await;
    let creds = Some(("PROJ1-ESP5", SECRET));
    call(&app, "POST", "/device/heartbeat", creds, json!({ "firmware_version": "v3" })).await;

    let uri = "/api/devices/PROJ1-ESP5/device-commands";
    let (status, _) = call(&app, "POST", uri, None, json!({ "kind": "wifi_update", "ssid": "" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, queued) = call(
        &app,
        "POST",
        uri,
        None,
        json!({ "kind": "wifi_update", "ssid": "barn", "password": "hay" }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(queued.get("wifi_password").is_none());
    let command_id = queued["id"].as_str().unwrap().to_string();

    let (_, beat) = call(&app, "POST", "/device/heartbeat", creds, json!({ "firmware_version": "v3" })).await;
    assert_eq!(beat["device_command"]["command_id"], command_id.as_str());
    assert_eq!(beat["device_command"]["kind"], "wifi_update");
    assert_eq!(beat["device_command"]["password"], "hay");

    let (_, again) = call(&app, "POST", "/device/heartbeat", creds, json!({ "firmware_version": "v3" })).await;
    assert!(again.get("device_command").is_none());

    let confirm_uri = format!("/device/device-commands/{}/confirm", command_id);
    let (status, ack) = call(
        &app,
        "POST",
        &confirm_uri,
        creds,
        json!({ "outcome": "failed", "error_message": "WiFi connection failed, restored backup" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["status"], "failed");

    let (_, listed) = call(&app, "GET", uri, None, Value::Null).await;
    assert_eq!(listed["commands"][0]["status"], "failed");
    assert_eq!(
        listed["commands"][0]["error_message"],
        "WiFi connection failed, restored backup"
    );
}
