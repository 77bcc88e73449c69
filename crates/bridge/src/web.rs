use axum::body::Bytes;
use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::alert::NotifyOutcome;
use crate::dispatch::{DispatchError, Dispatcher};
use crate::ingress::{self, Payload};
use crate::state::SharedState;

// ---------------------------------------------------------------------------
// Application state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub shared: SharedState,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ipx-event", get(ipx_event).post(ipx_event))
        .route("/ipx-alarms", post(ipx_alarms))
        .route("/test-sms", get(test_sms))
        .route("/api/status", get(api_status))
        .route("/api/mapping/reload", post(reload_mapping))
        .route(
            "/simulator/api/devices/{id}/action/{action}",
            post(simulator_action),
        )
        .with_state(state)
}

fn error_reply(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "status": "error", "message": message.into() })),
    )
        .into_response()
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = match &self {
            DispatchError::InvalidInput(_) | DispatchError::UnmappedDevice(_) => {
                StatusCode::BAD_REQUEST
            }
            DispatchError::UpstreamFailed(_) => StatusCode::BAD_GATEWAY,
            DispatchError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error_reply(status, self.to_string())
    }
}

/// Relay state change pushed by the IPX800.
async fn ipx_event(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    debug!(
        query = query.as_deref().unwrap_or(""),
        content_type = content_type.unwrap_or(""),
        body = %String::from_utf8_lossy(&body),
        "ipx-event: request received"
    );

    let payload = Payload::from_parts(query.as_deref(), content_type, &body);
    let event = match ingress::extract(&payload) {
        Ok(ev) => ev,
        Err(e) => {
            warn!("ipx-event: {e}");
            state.shared.write().await.record_error(format!("ipx-event: {e}"));
            return DispatchError::from(e).into_response();
        }
    };

    let device_ref = event.device_ref.clone();
    match state.dispatcher.normalize_and_dispatch(event).await {
        Ok(done) => {
            state.shared.write().await.record_dispatch(format!(
                "{device_ref} -> device {} {} ({})",
                done.device, done.action, done.delivery
            ));
            (StatusCode::OK, Json(done)).into_response()
        }
        Err(e) => {
            state
                .shared
                .write()
                .await
                .record_error(format!("{device_ref}: {e}"));
            e.into_response()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PowerTelemetry {
    device: Option<String>,
    state: Option<String>,
}

/// Power-state telemetry for monitored devices (e.g. a freezer outlet).
async fn ipx_alarms(State(state): State<AppState>, body: Bytes) -> Response {
    let telemetry: PowerTelemetry = match serde_json::from_slice(&body) {
        Ok(t) => t,
        Err(e) => {
            warn!("ipx-alarms: bad json: {e}");
            return error_reply(StatusCode::BAD_REQUEST, "invalid payload");
        }
    };

    let report = match state
        .dispatcher
        .power_event(telemetry.device.as_deref(), telemetry.state.as_deref())
        .await
    {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };
    debug!(
        device = %report.device,
        powered = report.powered,
        hub_id = ?report.hub_id,
        "ipx-alarms: handled"
    );

    if let Some(outcome) = report.alert {
        let mut st = state.shared.write().await;
        st.record_alert(format!("{}: power lost, sms {outcome:?}", report.device));
    }

    Json(json!({ "status": "OK" })).into_response()
}

/// Manual end-to-end check of the SMS path, bypassing the cooldown.
async fn test_sms(State(state): State<AppState>) -> Response {
    info!("test-sms: triggered manually");
    let outcome = state.dispatcher.notifier().notify("TEST", true).await;
    state
        .shared
        .write()
        .await
        .record_alert(format!("TEST: sms {outcome:?}"));

    let status = match outcome {
        NotifyOutcome::Sent => "sms test sent",
        NotifyOutcome::Failed | NotifyOutcome::Suppressed => "sms test failed",
    };
    Json(json!({ "status": status })).into_response()
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

async fn reload_mapping(State(state): State<AppState>) -> impl IntoResponse {
    let devices = state.dispatcher.mapping().reload();
    {
        let mut st = state.shared.write().await;
        st.mapped_devices = devices;
        st.record_system(format!("device mapping reloaded ({devices} devices)"));
    }
    Json(json!({ "status": "OK", "devices": devices }))
}

/// Stand-in for the HC3 device-action API, used when the simulator flag is on.
async fn simulator_action(Path((id, action)): Path<(u32, String)>) -> impl IntoResponse {
    info!(device = id, action = %action, "simulator: action accepted");
    Json(json!({ "simulated": true, "device": id, "action": action }))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("web: listening on http://{addr}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::tests::{harness, Harness};
    use crate::dispatch::DispatchPolicy;
    use crate::state::SystemState;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use mockito::Matcher;
    use tower::ServiceExt;

    fn app(h: &Harness) -> Router {
        router(AppState {
            dispatcher: Arc::clone(&h.dispatcher),
            shared: SystemState::new(h.server.url(), true, 3).shared(),
        })
    }

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    fn post(uri: &str, content_type: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", content_type)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    // -- /ipx-event ---------------------------------------------------------

    #[tokio::test]
    async fn json_event_dispatched() {
        let mut h = harness(DispatchPolicy::default()).await;
        let mock = h
            .server
            .mock("POST", "/api/devices/10/action/turnOn")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let (status, json) = send(
            app(&h),
            post("/ipx-event", "application/json", r#"{"device_id": 10, "action": "on"}"#),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "OK");
        assert_eq!(json["device"], 10);
        assert_eq!(json["action"], "on");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn query_event_with_mapping() {
        let mut h = harness(DispatchPolicy::default()).await;
        let mock = h
            .server
            .mock("POST", "/api/devices/27/action/turnOff")
            .with_status(200)
            .create_async()
            .await;

        let (status, json) = send(app(&h), get_req("/ipx-event?relais=ipx_congelateur&etat=0")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, json!({"status": "OK", "device": 27, "etat": "off"}));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn raw_text_event_dispatched() {
        let mut h = harness(DispatchPolicy::default()).await;
        h.server
            .mock("POST", "/api/devices/31/action/turnOn")
            .with_status(200)
            .create_async()
            .await;

        let (status, json) = send(
            app(&h),
            post("/ipx-event", "text/plain", "relais=ipx_garage&etat=1"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["device"], 31);
    }

    #[tokio::test]
    async fn missing_device_is_400() {
        let mut h = harness(DispatchPolicy::default()).await;
        let mock = h
            .server
            .mock("POST", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let (status, json) = send(
            app(&h),
            post("/ipx-event", "application/json", r#"{"action": "on"}"#),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["status"], "error");
        assert!(json["message"].as_str().unwrap().contains("device_id"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn missing_state_is_400_without_hub_call() {
        let mut h = harness(DispatchPolicy::default()).await;
        let mock = h
            .server
            .mock("POST", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let (status, _) = send(
            app(&h),
            post("/ipx-event", "application/json", r#"{"device_id": "12"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn invalid_json_is_400() {
        let h = harness(DispatchPolicy::default()).await;
        let (status, json) = send(
            app(&h),
            post("/ipx-event", "application/json", "c'est pas du json"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["message"], "invalid JSON body");
    }

    #[tokio::test]
    async fn unmapped_device_is_400() {
        let h = harness(DispatchPolicy::default()).await;
        let (status, json) = send(app(&h), get_req("/ipx-event?relais=ipx_cave&etat=1")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["message"].as_str().unwrap().contains("ipx_cave"));
    }

    #[tokio::test]
    async fn numeric_relay_follows_mapping() {
        let mut h = harness(DispatchPolicy::default()).await;
        let mock = h
            .server
            .mock("POST", "/api/devices/27/action/turnOn")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let (status, json) = send(app(&h), get_req("/ipx-event?relais=1&etat=1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["device"], 27);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn internal_fault_is_generic_500() {
        let app = Router::new().route("/fault", get(|| async { DispatchError::Internal }));
        let (status, json) = send(app, get_req("/fault")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            json,
            serde_json::json!({"status": "error", "message": "internal server error"})
        );
    }

    #[tokio::test]
    async fn upstream_failure_acked_200() {
        let mut h = harness(DispatchPolicy::default()).await;
        h.server
            .mock("POST", "/api/devices/20/action/turnOff")
            .with_status(500)
            .create_async()
            .await;

        let (status, json) = send(app(&h), get_req("/ipx-event?device_id=20&action=off")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "OK");
    }

    #[tokio::test]
    async fn upstream_failure_502_when_strict() {
        let mut h = harness(DispatchPolicy {
            optimistic_ack: false,
            ..DispatchPolicy::default()
        })
        .await;
        h.server
            .mock("POST", "/api/devices/20/action/turnOff")
            .with_status(500)
            .create_async()
            .await;

        let (status, json) = send(app(&h), get_req("/ipx-event?device_id=20&action=off")).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(json["status"], "error");
    }

    // -- /ipx-alarms --------------------------------------------------------

    #[tokio::test]
    async fn alarm_off_twice_one_sms() {
        let h = harness(DispatchPolicy::default()).await;
        let body = r#"{"device": "congelateur", "state": "OFF"}"#;

        let (s1, j1) = send(app(&h), post("/ipx-alarms", "application/json", body)).await;
        let (s2, _) = send(app(&h), post("/ipx-alarms", "application/json", body)).await;

        assert_eq!(s1, StatusCode::OK);
        assert_eq!(j1["status"], "OK");
        assert_eq!(s2, StatusCode::OK);
        assert_eq!(h.transport.count(), 1);
    }

    #[tokio::test]
    async fn alarm_missing_state_is_400() {
        let h = harness(DispatchPolicy::default()).await;
        let (status, json) = send(
            app(&h),
            post("/ipx-alarms", "application/json", r#"{"device": "congelateur"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["message"], "invalid payload");
    }

    #[tokio::test]
    async fn alarm_bad_json_is_400() {
        let h = harness(DispatchPolicy::default()).await;
        let (status, _) = send(app(&h), post("/ipx-alarms", "application/json", "nope")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    // -- Misc ---------------------------------------------------------------

    #[tokio::test]
    async fn test_sms_forces_send() {
        let h = harness(DispatchPolicy::default()).await;
        let (_, first) = send(app(&h), get_req("/test-sms")).await;
        let (_, second) = send(app(&h), get_req("/test-sms")).await;

        assert_eq!(first["status"], "sms test sent");
        assert_eq!(second["status"], "sms test sent");
        assert_eq!(h.transport.count(), 2);
    }

    #[tokio::test]
    async fn status_reports_recent_events() {
        let h = harness(DispatchPolicy::default()).await;
        let state = AppState {
            dispatcher: Arc::clone(&h.dispatcher),
            shared: SystemState::new(h.server.url(), true, 3).shared(),
        };

        send(router(state.clone()), get_req("/ipx-event?relais=ipx_cave&etat=1")).await;
        let (status, json) = send(router(state), get_req("/api/status")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["simulator"], true);
        assert_eq!(json["events"][0]["kind"], "error");
    }

    #[tokio::test]
    async fn reload_without_file_reports_zero() {
        let h = harness(DispatchPolicy::default()).await;
        let (status, json) = send(
            app(&h),
            Request::builder()
                .method("POST")
                .uri("/api/mapping/reload")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["devices"], 0);
    }

    #[tokio::test]
    async fn simulator_accepts_actions() {
        let h = harness(DispatchPolicy::default()).await;
        let (status, json) = send(
            app(&h),
            post("/simulator/api/devices/12/action/turnOn", "application/json", r#"{"args":""}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["simulated"], true);
        assert_eq!(json["action"], "turnOn");
    }
}
