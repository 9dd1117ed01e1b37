use crate::metrics::Metrics;
use crate::stats;
use crate::store::{
    clamp_message, DeviceUpdate, ErrorSample, NewDevice, StatusSample, Store, StoreError,
};
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub store: Arc<RwLock<Store>>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid API Key")]
    Unauthorized,
    #[error("Device not found")]
    NotFound,
    #[error("API key already registered")]
    DuplicateApiKey,
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateApiKey => ApiError::DuplicateApiKey,
            StoreError::DeviceNotFound(_) => ApiError::NotFound,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::DuplicateApiKey => StatusCode::CONFLICT,
        };
        let body = Json(serde_json::json!({ "detail": self.to_string() }));
        (status, body).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct DeviceCreate {
    pub name: String,
    #[serde(default = "default_device_type")]
    pub device_type: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub public_ip: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeviceUpdateBody {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub public_ip: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

// Полезная нагрузка статус-отчёта: каждое поле задано явным Option,
// отсутствующие числовые значения при сохранении превращаются в ноль.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusReport {
    pub api_key: String,
    #[serde(default)]
    pub runtime_status: Option<String>,
    #[serde(default)]
    pub cpu_percent: Option<f64>,
    #[serde(default)]
    pub memory_percent: Option<f64>,
    #[serde(default)]
    pub memory_total: Option<f64>,
    #[serde(default)]
    pub memory_used: Option<f64>,
    #[serde(default)]
    pub disk_percent: Option<f64>,
    #[serde(default)]
    pub disk_total: Option<f64>,
    #[serde(default)]
    pub disk_used: Option<f64>,
    #[serde(default)]
    pub upload_speed: Option<f64>,
    #[serde(default)]
    pub download_speed: Option<f64>,
    #[serde(default)]
    pub public_ip: Option<String>,
    #[serde(default)]
    pub context_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub api_key: String,
    #[serde(default = "default_error_level")]
    pub level: String,
    pub message: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub stack_trace: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HoursQuery {
    #[serde(default = "default_hours")]
    pub hours: i64,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

#[derive(Debug, Deserialize)]
pub struct ErrorsQuery {
    #[serde(default)]
    pub device_id: Option<u64>,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

pub fn build_router(metrics: Arc<Metrics>, store: Arc<RwLock<Store>>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/devices", post(create_device).get(list_devices))
        .route(
            "/api/devices/:id",
            get(get_device).put(update_device).delete(delete_device),
        )
        .route("/api/report/status", post(report_status))
        .route("/api/report/error", post(report_error))
        .route("/api/devices/:id/status", get(device_status))
        .route("/api/devices/:id/errors", get(device_errors))
        .route("/api/errors", get(all_errors))
        .route("/api/stats", get(get_stats))
        .route("/api/trends", get(get_trends))
        .with_state(HttpAppState { metrics, store })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    {
        let guard = state.store.read().await;
        state.metrics.update_from_store(&guard);
    }
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ошибка кодирования метрик: {err}"),
        )
            .into_response(),
    }
}

async fn create_device(
    State(state): State<HttpAppState>,
    Json(body): Json<DeviceCreate>,
) -> Result<Response, ApiError> {
    let mut guard = state.store.write().await;
    let device = guard.register(
        NewDevice {
            name: body.name,
            device_type: body.device_type,
            api_key: body.api_key,
            public_ip: body.public_ip,
            notes: body.notes,
        },
        Utc::now(),
    )?;
    Ok(Json(device).into_response())
}

async fn list_devices(State(state): State<HttpAppState>) -> Response {
    let guard = state.store.read().await;
    Json(guard.list_devices()).into_response()
}

async fn get_device(
    State(state): State<HttpAppState>,
    Path(id): Path<u64>,
) -> Result<Response, ApiError> {
    let guard = state.store.read().await;
    let device = guard.device(id).ok_or(ApiError::NotFound)?;
    Ok(Json(device.clone()).into_response())
}

async fn update_device(
    State(state): State<HttpAppState>,
    Path(id): Path<u64>,
    Json(body): Json<DeviceUpdateBody>,
) -> Result<Response, ApiError> {
    let mut guard = state.store.write().await;
    let device = guard.update_device(
        id,
        DeviceUpdate {
            name: body.name,
            device_type: body.device_type,
            public_ip: body.public_ip,
            notes: body.notes,
        },
    )?;
    Ok(Json(device).into_response())
}

async fn delete_device(
    State(state): State<HttpAppState>,
    Path(id): Path<u64>,
) -> Result<Response, ApiError> {
    let mut guard = state.store.write().await;
    guard.delete_device(id)?;
    Ok(Json(serde_json::json!({ "message": "Device deleted" })).into_response())
}

async fn report_status(
    State(state): State<HttpAppState>,
    Json(report): Json<StatusReport>,
) -> Result<Response, ApiError> {
    let now = Utc::now();
    let mut guard = state.store.write().await;
    let device_id = match guard.lookup_by_api_key(&report.api_key) {
        Some(device) => device.id,
        None => {
            state.metrics.inc_report_unauthorized("status");
            return Err(ApiError::Unauthorized);
        }
    };

    guard.mark_seen(device_id, report.public_ip.as_deref(), now);
    guard.append_status(StatusSample {
        device_id,
        timestamp: now,
        runtime_status: report.runtime_status,
        cpu_percent: report.cpu_percent.unwrap_or(0.0),
        memory_percent: report.memory_percent.unwrap_or(0.0),
        memory_total: report.memory_total.unwrap_or(0.0),
        memory_used: report.memory_used.unwrap_or(0.0),
        disk_percent: report.disk_percent.unwrap_or(0.0),
        disk_total: report.disk_total.unwrap_or(0.0),
        disk_used: report.disk_used.unwrap_or(0.0),
        upload_speed: report.upload_speed.unwrap_or(0.0),
        download_speed: report.download_speed.unwrap_or(0.0),
        context_tokens: report.context_tokens.unwrap_or(0),
        total_tokens: report.total_tokens.unwrap_or(0),
    });
    state.metrics.inc_report_received("status");

    Ok(Json(serde_json::json!({ "message": "Status received" })).into_response())
}

async fn report_error(
    State(state): State<HttpAppState>,
    Json(report): Json<ErrorReport>,
) -> Result<Response, ApiError> {
    let now = Utc::now();
    let mut guard = state.store.write().await;
    // В отличие от статус-отчёта, отчёт об ошибке не считается
    // признаком жизни и mark_seen не вызывает.
    let device_id = match guard.lookup_by_api_key(&report.api_key) {
        Some(device) => device.id,
        None => {
            state.metrics.inc_report_unauthorized("error");
            return Err(ApiError::Unauthorized);
        }
    };

    guard.append_error(ErrorSample {
        device_id,
        timestamp: now,
        level: report.level,
        message: clamp_message(&report.message),
        source: report.source,
        stack_trace: report.stack_trace,
    });
    state.metrics.inc_report_received("error");

    Ok(Json(serde_json::json!({ "message": "Error logged" })).into_response())
}

async fn device_status(
    State(state): State<HttpAppState>,
    Path(id): Path<u64>,
    Query(query): Query<HoursQuery>,
) -> Response {
    let since = Utc::now() - Duration::hours(query.hours);
    let guard = state.store.read().await;
    Json(guard.device_statuses_since(id, since)).into_response()
}

async fn device_errors(
    State(state): State<HttpAppState>,
    Path(id): Path<u64>,
    Query(query): Query<LimitQuery>,
) -> Response {
    let guard = state.store.read().await;
    Json(guard.errors_filtered(Some(id), None, query.limit)).into_response()
}

async fn all_errors(
    State(state): State<HttpAppState>,
    Query(query): Query<ErrorsQuery>,
) -> Response {
    let guard = state.store.read().await;
    Json(guard.errors_filtered(query.device_id, query.level.as_deref(), query.limit))
        .into_response()
}

async fn get_stats(State(state): State<HttpAppState>) -> Response {
    let guard = state.store.read().await;
    Json(stats::fleet_stats(&guard, Utc::now())).into_response()
}

async fn get_trends(State(state): State<HttpAppState>, Query(query): Query<HoursQuery>) -> Response {
    let guard = state.store.read().await;
    Json(stats::trends(&guard, query.hours, Utc::now())).into_response()
}

fn default_device_type() -> String {
    "unknown".to_string()
}

fn default_error_level() -> String {
    "error".to_string()
}

const fn default_hours() -> i64 {
    24
}

const fn default_limit() -> usize {
    100
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn test_app() -> Router {
        let metrics = Metrics::new().expect("инициализация метрик");
        let store = Arc::new(RwLock::new(Store::new()));
        build_router(metrics, store)
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let app = test_app();
        let response = app.oneshot(get_request("/healthz")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.as_ref(), b"ok");
    }

    #[tokio::test]
    async fn register_report_and_stats_end_to_end() {
        let app = test_app();

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/devices",
                json!({"name": "node-1", "device_type": "vps"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let device = body_json(response).await;
        let api_key = device["api_key"].as_str().expect("ключ в ответе").to_string();
        assert_eq!(api_key.len(), 64);
        assert_eq!(device["is_online"], json!(false));
        assert_eq!(device["last_seen"], Value::Null);

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/report/status",
                json!({"api_key": api_key, "cpu_percent": 42.0, "total_tokens": 500}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.clone().oneshot(get_request("/api/stats")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let stats = body_json(response).await;
        assert_eq!(stats["total_devices"], json!(1));
        assert_eq!(stats["online_devices"], json!(1));
        assert_eq!(stats["offline_devices"], json!(0));
        assert_eq!(stats["total_tokens"], json!(500));
        assert_eq!(stats["today_tokens"], json!(500));
        assert_eq!(stats["devices"][0]["cpu_percent"], json!(42.0));
        assert_eq!(stats["devices"][0]["is_online"], json!(true));
    }

    #[tokio::test]
    async fn status_roundtrip_defaults_missing_fields_to_zero() {
        let app = test_app();

        let response = app
            .clone()
            .oneshot(json_request("POST", "/api/devices", json!({"name": "n"})))
            .await
            .unwrap();
        let device = body_json(response).await;
        let api_key = device["api_key"].as_str().unwrap().to_string();
        let id = device["id"].as_u64().unwrap();

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/report/status",
                json!({"api_key": api_key, "cpu_percent": 17.5}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(get_request(&format!("/api/devices/{id}/status?hours=24")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let samples = body_json(response).await;
        assert_eq!(samples.as_array().unwrap().len(), 1);
        assert_eq!(samples[0]["cpu_percent"], json!(17.5));
        assert_eq!(samples[0]["memory_percent"], json!(0.0));
        assert_eq!(samples[0]["total_tokens"], json!(0));
        assert_eq!(samples[0]["runtime_status"], Value::Null);
    }

    #[tokio::test]
    async fn unknown_api_key_rejected_and_nothing_stored() {
        let app = test_app();

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/devices",
                json!({"name": "n", "api_key": "real-key"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/report/status",
                json!({"api_key": "wrong-key", "cpu_percent": 99.0}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app.clone().oneshot(get_request("/api/stats")).await.unwrap();
        let stats = body_json(response).await;
        assert_eq!(stats["online_devices"], json!(0));
        assert_eq!(stats["devices"][0]["cpu_percent"], json!(0.0));

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/report/error",
                json!({"api_key": "wrong-key", "message": "boom"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn error_report_does_not_mark_device_online() {
        let app = test_app();

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/devices",
                json!({"name": "n", "api_key": "key-1"}),
            ))
            .await
            .unwrap();
        let id = body_json(response).await["id"].as_u64().unwrap();

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/report/error",
                json!({"api_key": "key-1", "message": "boom"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(get_request(&format!("/api/devices/{id}")))
            .await
            .unwrap();
        let device = body_json(response).await;
        assert_eq!(device["is_online"], json!(false));
        assert_eq!(device["last_seen"], Value::Null);
    }

    #[tokio::test]
    async fn error_report_defaults_level_and_truncates_message() {
        let app = test_app();

        app.clone()
            .oneshot(json_request(
                "POST",
                "/api/devices",
                json!({"name": "n", "api_key": "key-1"}),
            ))
            .await
            .unwrap();

        let long_message = "a".repeat(700);
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/report/error",
                json!({"api_key": "key-1", "message": long_message, "source": "gateway.log"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(get_request("/api/errors?limit=10"))
            .await
            .unwrap();
        let errors = body_json(response).await;
        assert_eq!(errors.as_array().unwrap().len(), 1);
        assert_eq!(errors[0]["level"], json!("error"));
        assert_eq!(errors[0]["message"].as_str().unwrap().len(), 500);
        assert_eq!(errors[0]["source"], json!("gateway.log"));
    }

    #[tokio::test]
    async fn device_crud_with_partial_update() {
        let app = test_app();

        let response = app
            .clone()
            .oneshot(get_request("/api/devices/5"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/devices",
                json!({"name": "old", "device_type": "nas", "notes": "кладовка"}),
            ))
            .await
            .unwrap();
        let id = body_json(response).await["id"].as_u64().unwrap();

        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                &format!("/api/devices/{id}"),
                json!({"name": "new"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let device = body_json(response).await;
        assert_eq!(device["name"], json!("new"));
        assert_eq!(device["device_type"], json!("nas"));
        assert_eq!(device["notes"], json!("кладовка"));

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/devices/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(get_request(&format!("/api/devices/{id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn duplicate_api_key_registration_conflicts() {
        let app = test_app();

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/devices",
                json!({"name": "a", "api_key": "shared"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/devices",
                json!({"name": "b", "api_key": "shared"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn metrics_endpoint_exports_fleet_gauges() {
        let app = test_app();

        app.clone()
            .oneshot(json_request("POST", "/api/devices", json!({"name": "n"})))
            .await
            .unwrap();

        let response = app.clone().oneshot(get_request("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("server_devices_total 1"));
        assert!(text.contains("server_scrape_count_total"));
    }

    #[tokio::test]
    async fn trends_returns_bucketed_points() {
        let app = test_app();

        app.clone()
            .oneshot(json_request(
                "POST",
                "/api/devices",
                json!({"name": "n", "api_key": "key-1"}),
            ))
            .await
            .unwrap();
        app.clone()
            .oneshot(json_request(
                "POST",
                "/api/report/status",
                json!({"api_key": "key-1", "cpu_percent": 30.0, "memory_percent": 55.0}),
            ))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(get_request("/api/trends?hours=1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let points = body_json(response).await;
        assert_eq!(points.as_array().unwrap().len(), 1);
        assert_eq!(points[0]["cpu"], json!(30.0));
        assert_eq!(points[0]["memory"], json!(55.0));
        assert_eq!(points[0]["disk"], json!(0.0));
    }
}
