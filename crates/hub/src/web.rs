use anyhow::{Context, Result};
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::header;
use axum::http::request::Parts;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::clock::Clock;
use crate::db::Db;
use crate::error::ApiError;
use crate::filtration::{FiltrationService, Outcome};
use crate::gateway::{self, Command};
use crate::jobs;
use crate::model::{is_valid_serial, Device, ProcessStatus, ReportStatus, User};
use crate::mqtt::Publisher;
use crate::queue::StageAction;
use crate::state::SharedState;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub shared: SharedState,
    pub filtration: Arc<FiltrationService>,
    pub publisher: Arc<dyn Publisher>,
    pub clock: Arc<dyn Clock>,
}

type ApiResult = Result<Json<Value>, ApiError>;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/devices", get(list_devices))
        .route("/api/devices/pair", post(pair_device))
        .route("/api/devices/unpair", post(unpair_device))
        .route("/api/devices/archive", post(archive_device))
        .route("/api/filtration/current", get(current_process))
        .route("/api/filtration/abort", post(abort_process))
        .route("/api/filtration/{command}", post(send_command))
        .route(
            "/api/filtration/processes/{id}/actions/{action}",
            post(run_stage_action),
        )
        .route("/api/treatment/latest", get(latest_treatment))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

/// Caller resolved from `Authorization: Bearer <api_token>`.
pub struct AuthUser(pub User);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(ApiError::Unauthenticated)?;

        state
            .db
            .user_by_token(token)
            .await?
            .map(AuthUser)
            .ok_or(ApiError::Unauthenticated)
    }
}

// ---------------------------------------------------------------------------
// Bodies
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SerialBody {
    serial: String,
}

#[derive(Deserialize)]
struct SerialQuery {
    serial: Option<String>,
}

fn ok(data: impl Serialize) -> ApiResult {
    Ok(Json(json!({ "success": true, "data": data })))
}

fn ok_message(message: &str, data: impl Serialize) -> ApiResult {
    Ok(Json(json!({ "success": true, "message": message, "data": data })))
}

fn checked_serial(serial: &str) -> Result<&str, ApiError> {
    let serial = serial.trim();
    if is_valid_serial(serial) {
        Ok(serial)
    } else {
        Err(ApiError::Validation(format!("malformed serial '{serial}'")))
    }
}

async fn owned(db: &Db, user: &User, serial: &str) -> Result<Device, ApiError> {
    db.owned_device(user.id, checked_serial(serial)?)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("device {serial} not found")))
}

// ---------------------------------------------------------------------------
// Handlers: hub + devices
// ---------------------------------------------------------------------------

async fn api_status(State(state): State<AppState>) -> ApiResult {
    let st = state.shared.read().await;
    ok(st.to_status())
}

async fn list_devices(State(state): State<AppState>, AuthUser(user): AuthUser) -> ApiResult {
    ok(state.db.devices_for_owner(user.id).await?)
}

async fn pair_device(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(body): Json<SerialBody>,
) -> ApiResult {
    let serial = checked_serial(&body.serial)?;
    let device = state
        .db
        .device_by_serial(serial)
        .await?
        .filter(|d| d.archived_at.is_none())
        .ok_or_else(|| ApiError::NotFound(format!("device {serial} not found")))?;

    match device.owner_id {
        Some(owner) if owner == user.id => {
            return ok_message("Device already paired.", &device);
        }
        Some(_) => {
            return Err(ApiError::Conflict(
                "Device is already paired to another account.".to_string(),
            ))
        }
        None => {}
    }

    if !state.db.pair_device(device.id, user.id).await? {
        return Err(ApiError::Conflict(
            "Device is already paired to another account.".to_string(),
        ));
    }
    info!(serial = %serial, user = %user.name, "device paired");
    let device = state.db.device(device.id).await?;
    ok_message("Device paired.", device)
}

async fn unpair_device(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(body): Json<SerialBody>,
) -> ApiResult {
    let device = owned(&state.db, &user, &body.serial).await?;
    state.db.unpair_device(device.id, user.id).await?;
    info!(serial = %device.serial_number, user = %user.name, "device unpaired");
    ok_message("Device unpaired.", Value::Null)
}

async fn archive_device(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(body): Json<SerialBody>,
) -> ApiResult {
    let device = owned(&state.db, &user, &body.serial).await?;
    state
        .db
        .archive_device(device.id, user.id, state.clock.now())
        .await?;
    info!(serial = %device.serial_number, user = %user.name, "device archived");
    ok_message("Device archived.", Value::Null)
}

// ---------------------------------------------------------------------------
// Handlers: filtration
// ---------------------------------------------------------------------------

async fn send_command(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(command): Path<String>,
    Query(q): Query<SerialQuery>,
) -> ApiResult {
    let command: Command = command.parse()?;
    let device = gateway::send(
        &state.db,
        state.publisher.as_ref(),
        user.id,
        q.serial.as_deref(),
        command,
    )
    .await?;
    state
        .shared
        .write()
        .await
        .record_publish(&command.topic(&device.serial_number), command.payload());

    ok_message(
        command.sent_message(),
        json!({ "serial": device.serial_number, "command": command.name() }),
    )
}

async fn current_process(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Query(q): Query<SerialQuery>,
) -> ApiResult {
    let device = gateway::resolve_device(&state.db, user.id, q.serial.as_deref()).await?;
    let Some(process) = state.db.latest_process(device.id).await? else {
        return ok_message("No filtration process found.", Value::Null);
    };
    let stages = state.db.stages(process.id).await?;
    ok(json!({ "process": process, "stages": stages }))
}

async fn abort_process(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Query(q): Query<SerialQuery>,
) -> ApiResult {
    let device = gateway::resolve_device(&state.db, user.id, q.serial.as_deref()).await?;

    let mut running = None;
    for status in [ProcessStatus::Active, ProcessStatus::Paused] {
        running = state.db.process_with_status(device.id, status).await?;
        if running.is_some() {
            break;
        }
    }
    let process = running
        .ok_or_else(|| ApiError::NotFound("No running filtration process.".to_string()))?;

    match state.filtration.abort(process.id).await? {
        Outcome::Applied => ok_message(
            "Filtration process aborted.",
            json!({ "process_id": process.id }),
        ),
        Outcome::Skipped(skip) => Err(ApiError::Conflict(format!(
            "process {} could not be aborted: {skip:?}",
            process.id
        ))),
    }
}

async fn run_stage_action(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((process_id, action)): Path<(i64, String)>,
) -> ApiResult {
    let action: StageAction = action
        .parse()
        .map_err(|e: crate::queue::UnknownAction| ApiError::Validation(e.to_string()))?;

    let not_found = || ApiError::NotFound(format!("process {process_id} not found"));
    let process = state.db.process(process_id).await?.ok_or_else(not_found)?;
    let device = state.db.device(process.device_id).await?.ok_or_else(not_found)?;
    if device.owner_id != Some(user.id) {
        return Err(not_found());
    }

    info!(process_id, action = %action, user = %user.name, "operator stage action");
    let outcome = jobs::run_stage_action(&state.filtration, process_id, action).await?;
    let data = match outcome {
        Outcome::Applied => json!({ "outcome": "applied" }),
        Outcome::Skipped(skip) => json!({ "outcome": "skipped", "reason": format!("{skip:?}") }),
    };
    ok(data)
}

async fn latest_treatment(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Query(q): Query<SerialQuery>,
) -> ApiResult {
    let device = gateway::resolve_device(&state.db, user.id, q.serial.as_deref()).await?;
    let report = state
        .db
        .latest_report(device.id)
        .await?
        .ok_or_else(|| ApiError::NotFound("No treatment report found.".to_string()))?;

    let stages = if report.final_status == ReportStatus::Pending {
        match state.db.process_for_report(report.id).await? {
            Some(p) => Some(state.db.stages(p.id).await?),
            None => None,
        }
    } else {
        None
    };
    ok(json!({ "report": report, "stages": stages }))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState) -> Result<()> {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "http api listening");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Config;
    use crate::filtration::StateMachineSettings;
    use crate::mqtt::RecordingPublisher;
    use crate::queue::RecordingScheduler;
    use crate::state;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const T0: i64 = 1_700_000_000;
    const ALICE: &str = "alice-token-0123456789";
    const BOB: &str = "bob-token-0123456789ab";

    struct TestApp {
        state: AppState,
        publisher: Arc<RecordingPublisher>,
    }

    async fn test_app() -> TestApp {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.upsert_user("alice", ALICE).await.unwrap();
        db.upsert_user("bob", BOB).await.unwrap();

        let publisher = Arc::new(RecordingPublisher::default());
        let clock = Arc::new(ManualClock::at(T0));
        let shared = state::new_shared();
        let filtration = Arc::new(FiltrationService::new(
            db.clone(),
            publisher.clone(),
            Arc::new(RecordingScheduler::default()),
            clock.clone(),
            shared.clone(),
            StateMachineSettings::from(&Config::default()),
        ));
        TestApp {
            state: AppState {
                db,
                shared,
                filtration,
                publisher: publisher.clone(),
                clock,
            },
            publisher,
        }
    }

    impl TestApp {
        async fn call(
            &self,
            method: &str,
            uri: &str,
            token: Option<&str>,
            body: Option<Value>,
        ) -> (StatusCode, Value) {
            let mut req = Request::builder().method(method).uri(uri);
            if let Some(t) = token {
                req = req.header(header::AUTHORIZATION, format!("Bearer {t}"));
            }
            let body = match body {
                Some(v) => {
                    req = req.header(header::CONTENT_TYPE, "application/json");
                    Body::from(v.to_string())
                }
                None => Body::empty(),
            };
            let resp = router(self.state.clone())
                .oneshot(req.body(body).unwrap())
                .await
                .unwrap();
            let status = resp.status();
            let bytes = resp.into_body().collect().await.unwrap().to_bytes();
            let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
            (status, json)
        }

        async fn pair(&self, token: &str, serial: &str) -> StatusCode {
            self.state.db.ensure_device(serial, T0).await.unwrap();
            self.call("POST", "/api/devices/pair", Some(token), Some(json!({ "serial": serial })))
                .await
                .0
        }
    }

    #[tokio::test]
    async fn status_is_public() {
        let app = test_app().await;
        let (status, json) = app.call("GET", "/api/status", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["mqtt_connected"], false);
    }

    #[tokio::test]
    async fn missing_or_unknown_token_is_401() {
        let app = test_app().await;
        let (status, json) = app.call("GET", "/api/devices", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["success"], false);

        let (status, _) = app.call("GET", "/api/devices", Some("nope"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn pairing_rules() {
        let app = test_app().await;
        assert_eq!(app.pair(ALICE, "BT1").await, StatusCode::OK);
        // idempotent for the owner
        assert_eq!(app.pair(ALICE, "BT1").await, StatusCode::OK);
        assert_eq!(app.pair(BOB, "BT1").await, StatusCode::CONFLICT);

        let (status, _) = app
            .call("POST", "/api/devices/pair", Some(BOB), Some(json!({ "serial": "NOPE" })))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = app
            .call("POST", "/api/devices/pair", Some(BOB), Some(json!({ "serial": "a/b" })))
            .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (_, json) = app.call("GET", "/api/devices", Some(ALICE), None).await;
        assert_eq!(json["data"][0]["serial_number"], "BT1");
        let (_, json) = app.call("GET", "/api/devices", Some(BOB), None).await;
        assert_eq!(json["data"], json!([]));
    }

    #[tokio::test]
    async fn unpair_then_archive() {
        let app = test_app().await;
        app.pair(ALICE, "BT1").await;

        let (status, _) = app
            .call("POST", "/api/devices/unpair", Some(BOB), Some(json!({ "serial": "BT1" })))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = app
            .call("POST", "/api/devices/unpair", Some(ALICE), Some(json!({ "serial": "BT1" })))
            .await;
        assert_eq!(status, StatusCode::OK);

        assert_eq!(app.pair(BOB, "BT1").await, StatusCode::OK);
        let (status, _) = app
            .call("POST", "/api/devices/archive", Some(BOB), Some(json!({ "serial": "BT1" })))
            .await;
        assert_eq!(status, StatusCode::OK);
        // archived devices cannot be paired again
        assert_eq!(app.pair(ALICE, "BT1").await, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn command_publishes_without_touching_state() {
        let app = test_app().await;
        app.pair(ALICE, "BT1").await;

        let (status, json) = app
            .call("POST", "/api/filtration/start", Some(ALICE), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            json["message"],
            "Start process command sent. State will update when device acknowledges."
        );
        assert_eq!(
            app.publisher.take(),
            vec![("mfc/BT1/pump/3".to_string(), "OPEN".to_string())]
        );
        let dev = app.state.db.device_by_serial("BT1").await.unwrap().unwrap();
        assert!(app.state.db.latest_process(dev.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn command_errors() {
        let app = test_app().await;
        let (status, json) = app
            .call("POST", "/api/filtration/start", Some(ALICE), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(
            json["message"],
            "No device found. Pair a device first or provide a valid serial."
        );

        app.pair(ALICE, "BT1").await;
        let (status, _) = app
            .call("POST", "/api/filtration/self-destruct", Some(ALICE), None)
            .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        let (status, _) = app
            .call("POST", "/api/filtration/restart?serial=BT2", Some(ALICE), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(app.publisher.take().is_empty());
    }

    #[tokio::test]
    async fn current_process_and_abort() {
        let app = test_app().await;
        app.pair(ALICE, "BT1").await;

        let (status, json) = app
            .call("GET", "/api/filtration/current", Some(ALICE), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"], Value::Null);

        app.state.filtration.handle_start_ack("BT1", true).await.unwrap();
        let (_, json) = app
            .call("GET", "/api/filtration/current?serial=BT1", Some(ALICE), None)
            .await;
        assert_eq!(json["data"]["process"]["status"], "active");
        assert_eq!(json["data"]["stages"][0]["status"], "active");
        assert_eq!(json["data"]["stages"][3]["name"], "Clean Water Tank");

        let (status, _) = app
            .call("POST", "/api/filtration/abort", Some(ALICE), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = app
            .call("POST", "/api/filtration/abort", Some(ALICE), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, json) = app
            .call("GET", "/api/treatment/latest", Some(ALICE), None)
            .await;
        assert_eq!(json["data"]["report"]["final_status"], "failed");
        assert_eq!(json["data"]["stages"], Value::Null);
    }

    #[tokio::test]
    async fn latest_treatment_includes_stages_while_pending() {
        let app = test_app().await;
        app.pair(ALICE, "BT1").await;
        let (status, _) = app
            .call("GET", "/api/treatment/latest", Some(ALICE), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        app.state.filtration.handle_start_ack("BT1", true).await.unwrap();
        let (_, json) = app
            .call("GET", "/api/treatment/latest", Some(ALICE), None)
            .await;
        assert_eq!(json["data"]["report"]["final_status"], "pending");
        assert_eq!(json["data"]["stages"].as_array().map(Vec::len), Some(4));
    }

    #[tokio::test]
    async fn operator_stage_action() {
        let app = test_app().await;
        app.pair(ALICE, "BT1").await;
        app.state.filtration.handle_start_ack("BT1", true).await.unwrap();
        let dev = app.state.db.device_by_serial("BT1").await.unwrap().unwrap();
        let pid = app.state.db.latest_process(dev.id).await.unwrap().unwrap().id;

        let uri = |action: &str| format!("/api/filtration/processes/{pid}/actions/{action}");

        let (status, json) = app.call("POST", &uri("start_stage_3"), Some(ALICE), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["outcome"], "skipped");

        let (_, json) = app
            .call("POST", &uri("complete_stage_1"), Some(ALICE), None)
            .await;
        assert_eq!(json["data"]["outcome"], "applied");

        let (status, _) = app.call("POST", &uri("teleport"), Some(ALICE), None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        // someone else's process is invisible
        let (status, _) = app.call("POST", &uri("start_stage_2"), Some(BOB), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
