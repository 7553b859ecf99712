//! The gateway's external surface: JSON over HTTP plus an SSE event stream
//! carrying base64-encoded binary snapshots.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response as HttpResponse,
    },
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::{stream, Stream};
use log::warn;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;

use discovery::ServiceKind;
use protocol::{ActuatorAction, ErrorBody, ErrorCode};

use crate::commands::send_actuator_command;
use crate::registry::{DeviceEntry, DeviceRegistry, RegistryEvent};

#[derive(Clone)]
pub struct ApiState {
    registry: Arc<DeviceRegistry>,
}

pub fn create_router(registry: Arc<DeviceRegistry>) -> Router {
    Router::new()
        .route("/api/devices", get(list_devices))
        .route("/api/devices/{id}/command", post(send_command))
        .route("/api/events", get(event_stream))
        .layer(CorsLayer::permissive())
        .with_state(ApiState { registry })
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    kind: Option<ServiceKind>,
    name: Option<String>,
}

#[derive(Debug, Serialize)]
struct DeviceListResponse {
    devices: Vec<DeviceEntry>,
}

async fn list_devices(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> Json<DeviceListResponse> {
    let devices = state.registry.list(query.kind, query.name.as_deref()).await;
    Json(DeviceListResponse { devices })
}

#[derive(Debug, Serialize)]
struct CommandResponse {
    message: String,
}

async fn send_command(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(action): Json<ActuatorAction>,
) -> Result<Json<CommandResponse>, ApiError> {
    match send_actuator_command(&state.registry, &id, action).await {
        Ok(message) => Ok(Json(CommandResponse { message })),
        Err(body) => Err(ApiError(body)),
    }
}

/// Structured errors leave as JSON bodies with a mapped status code.
pub struct ApiError(pub ErrorBody);

impl IntoResponse for ApiError {
    fn into_response(self) -> HttpResponse {
        (status_for(self.0.code), Json(self.0)).into_response()
    }
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::DeviceNotFound => StatusCode::NOT_FOUND,
        ErrorCode::InvalidCommand | ErrorCode::ValidationError => StatusCode::BAD_REQUEST,
        ErrorCode::DeviceOffline => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::UnknownError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// One SSE event per registry event, in subscription order. A subscriber
/// that falls behind gets a single coalesced `resync` and should re-list.
async fn event_stream(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.registry.subscribe();
    let stream = stream::unfold(receiver, |mut receiver| async move {
        match receiver.recv().await {
            Ok(event) => Some((Ok(to_sse_event(&event)), receiver)),
            Err(RecvError::Lagged(skipped)) => {
                warn!("Event subscriber lagged by {} events, requesting resync", skipped);
                Some((
                    Ok(Event::default().event("resync").data("resync")),
                    receiver,
                ))
            }
            Err(RecvError::Closed) => None,
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn to_sse_event(event: &RegistryEvent) -> Event {
    match event {
        RegistryEvent::Added(entry) => Event::default().event("added").data(encode_snapshot(entry)),
        RegistryEvent::Changed(entry) => {
            Event::default().event("changed").data(encode_snapshot(entry))
        }
        RegistryEvent::Removed(entry) => {
            Event::default().event("removed").data(encode_snapshot(entry))
        }
        RegistryEvent::Resync => Event::default().event("resync").data("resync"),
    }
}

/// The event payload: base64 of the bincode-serialized entry snapshot.
fn encode_snapshot(entry: &DeviceEntry) -> String {
    match bincode::serialize(entry) {
        Ok(bytes) => BASE64.encode(bytes),
        Err(e) => {
            warn!("Could not serialize snapshot of {}: {}", entry.id, e);
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DeviceStatus;
    use chrono::Utc;
    use discovery::{DeviceCategory, Transport};
    use http_body_util::BodyExt;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;
    use tower::util::ServiceExt;

    fn entry(id: &str, name: &str) -> DeviceEntry {
        DeviceEntry {
            id: id.to_string(),
            device_name: name.to_string(),
            category: DeviceCategory::LightLamp,
            kind: ServiceKind::Actuator,
            transport: Transport::Tcp,
            port: 4040,
            addresses: vec![Ipv4Addr::new(192, 168, 1, 20)],
            properties: HashMap::new(),
            status: DeviceStatus::Unknown,
            expires_at: Utc::now() + chrono::Duration::seconds(60),
            last_health_ok_at: None,
        }
    }

    #[test]
    fn snapshots_decode_back_to_the_entry() {
        let entry = entry("Lamp._lightlamp._tcp.local.", "Lamp");
        let encoded = encode_snapshot(&entry);
        let bytes = BASE64.decode(encoded).unwrap();
        let decoded: DeviceEntry = bincode::deserialize(&bytes).unwrap();
        // Timestamps serialize at second precision.
        assert_eq!(decoded.id, entry.id);
        assert_eq!(decoded.properties, entry.properties);
        assert_eq!(decoded.status, entry.status);
    }

    #[test]
    fn error_codes_map_to_http_statuses() {
        assert_eq!(status_for(ErrorCode::DeviceNotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorCode::InvalidCommand), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorCode::ValidationError), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(ErrorCode::DeviceOffline),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(ErrorCode::UnknownError),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn device_listing_respects_filters() {
        let registry = Arc::new(DeviceRegistry::new());
        registry.upsert(entry("Lamp._lightlamp._tcp.local.", "Lamp")).await;
        let router = create_router(registry);

        let response = router
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/devices?kind=actuator")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["devices"].as_array().unwrap().len(), 1);
        assert_eq!(parsed["devices"][0]["id"], "Lamp._lightlamp._tcp.local.");

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/devices?kind=sensor")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(parsed["devices"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_devices_get_a_structured_404() {
        let registry = Arc::new(DeviceRegistry::new());
        let router = create_router(registry);

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/devices/ghost/command")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(
                        serde_json::json!({"sink": {"turnOn": true}}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["code"], "DEVICE_NOT_FOUND");
    }
}
