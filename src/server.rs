use crate::{
    aggregation::{AggregationEngine, Granularity, HistoryWindow},
    client::TuyaClient,
    config::AppConfig,
    device::{self, HistoryRequest},
    error::{ApiError, FailureKind},
    fallback::PeriodType,
};
use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    extract::{Query, State},
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{MethodRouter, get},
};
use chrono::{NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

const ENDPOINTS: &[(&str, &str)] = &[
    ("/", "service banner and endpoint list"),
    ("/info", "API description"),
    ("/status", "device online status"),
    ("/properties", "current device shadow properties"),
    ("/consumption", "current draw and estimated consumption"),
    ("/history", "device logs (type, start_time, end_time in ms)"),
    ("/statistics", "provider consumption statistics (type)"),
    (
        "/database",
        "stored history (start_date, end_date, granularity daily|hourly|raw)",
    ),
];

#[derive(Clone)]
pub struct AppState {
    config: Arc<AppConfig>,
    engine: AggregationEngine,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, engine: AggregationEngine) -> Self {
        Self { config, engine }
    }

    fn device_id(&self, requested: Option<String>) -> String {
        requested
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| self.config.tuya.device_id.clone())
    }

    async fn client(&self) -> Result<TuyaClient, Failure> {
        TuyaClient::connect(&self.config.tuya)
            .await
            .map_err(|err| Failure::from(ApiError::from(err)))
    }
}

pub struct ServerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<Result<()>>,
}

impl ServerHandle {
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.join.await {
            Ok(result) => result,
            Err(err) => Err(anyhow!(err)),
        }
    }
}

pub async fn spawn(config: Arc<AppConfig>, engine: AggregationEngine) -> Result<ServerHandle> {
    let addr: SocketAddr = config
        .server
        .listen_addr
        .parse()
        .with_context(|| "failed to parse listen_addr")?;

    let router = router(AppState::new(config, engine));

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| "failed to bind HTTP listener")?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let join = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .map_err(|err| anyhow!(err))
    });

    tracing::info!(listen = %addr, "HTTP listener started");

    Ok(ServerHandle {
        shutdown: Some(shutdown_tx),
        join,
    })
}

pub fn router(state: AppState) -> Router {
    let mut router = Router::new().route("/", get(banner));
    for (path, handler) in [
        ("/info", get(info)),
        ("/status", get(status)),
        ("/properties", get(properties)),
        ("/consumption", get(consumption)),
        ("/history", get(history)),
        ("/statistics", get(statistics)),
        ("/database", get(database)),
    ] {
        router = route_both(router, path, handler);
    }
    router.fallback(not_found).with_state(state)
}

fn route_both(
    router: Router<AppState>,
    path: &str,
    handler: MethodRouter<AppState>,
) -> Router<AppState> {
    router
        .route(path, handler.clone())
        .route(&format!("{path}/"), handler)
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn endpoint_list() -> Value {
    ENDPOINTS
        .iter()
        .map(|(path, description)| json!({ "path": path, "description": description }))
        .collect()
}

fn success(data: impl Serialize, extras: Map<String, Value>) -> Result<Response, Failure> {
    let data = serde_json::to_value(data)
        .map_err(|err| Failure::from(ApiError::Internal(anyhow!(err))))?;
    let mut body = Map::new();
    body.insert("success".into(), Value::Bool(true));
    body.insert("data".into(), data);
    body.insert("timestamp".into(), Value::String(timestamp()));
    body.extend(extras);
    Ok(Json(Value::Object(body)).into_response())
}

#[derive(Debug)]
pub struct Failure {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl Failure {
    fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "invalid_request",
            message: message.into(),
        }
    }
}

impl From<ApiError> for Failure {
    fn from(err: ApiError) -> Self {
        let kind = err.kind();
        let status = match kind {
            FailureKind::NoData => StatusCode::NOT_FOUND,
            FailureKind::Upstream => StatusCode::BAD_GATEWAY,
            FailureKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        match kind {
            FailureKind::NoData => tracing::info!(error = %err, "request found no data"),
            FailureKind::Upstream => tracing::warn!(error = %err, "provider request failed"),
            FailureKind::Internal => tracing::error!(error = ?err, "request failed"),
        }
        Self {
            status,
            kind: kind.as_str(),
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for Failure {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err).into()
    }
}

impl IntoResponse for Failure {
    fn into_response(self) -> Response {
        let body = json!({
            "success": false,
            "error": self.message,
            "kind": self.kind,
            "timestamp": timestamp(),
        });
        (self.status, Json(body)).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
struct DeviceQuery {
    device_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct HistoryQuery {
    device_id: Option<String>,
    #[serde(rename = "type")]
    period: Option<String>,
    start_time: Option<String>,
    end_time: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StatisticsQuery {
    device_id: Option<String>,
    #[serde(rename = "type")]
    period: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabaseQuery {
    device_id: Option<String>,
    granularity: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
}

fn parse_period(value: Option<&str>) -> Result<PeriodType, Failure> {
    match value.filter(|v| !v.trim().is_empty()) {
        None => Ok(PeriodType::default()),
        Some(raw) => PeriodType::parse(raw).ok_or_else(|| {
            Failure::invalid_request(format!("unknown type `{raw}` (expected day, hour or month)"))
        }),
    }
}

fn parse_millis(name: &str, value: Option<&str>) -> Result<Option<i64>, Failure> {
    value
        .filter(|v| !v.trim().is_empty())
        .map(|raw| {
            raw.trim()
                .parse::<i64>()
                .map_err(|_| Failure::invalid_request(format!("{name} must be epoch milliseconds")))
        })
        .transpose()
}

fn parse_date(name: &str, value: Option<&str>) -> Result<Option<NaiveDate>, Failure> {
    value
        .filter(|v| !v.trim().is_empty())
        .map(|raw| {
            NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
                .map_err(|_| Failure::invalid_request(format!("{name} must be YYYY-MM-DD")))
        })
        .transpose()
}

async fn banner() -> Result<Response, Failure> {
    success(
        json!({
            "service": "Smart meter API",
            "version": env!("CARGO_PKG_VERSION"),
            "endpoints": endpoint_list(),
        }),
        Map::new(),
    )
}

async fn info(State(state): State<AppState>) -> Result<Response, Failure> {
    success(
        json!({
            "name": "Smart meter API",
            "description": "Reads a Tuya energy meter and serves live and stored consumption data",
            "version": env!("CARGO_PKG_VERSION"),
            "device_id": state.config.tuya.device_id,
            "endpoints": endpoint_list(),
        }),
        Map::new(),
    )
}

async fn status(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> Result<Response, Failure> {
    let device_id = state.device_id(query.device_id);
    let client = state.client().await?;
    success(device::status(&client, &device_id).await?, Map::new())
}

async fn properties(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> Result<Response, Failure> {
    let device_id = state.device_id(query.device_id);
    let client = state.client().await?;
    success(device::properties(&client, &device_id).await?, Map::new())
}

async fn consumption(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> Result<Response, Failure> {
    let device_id = state.device_id(query.device_id);
    let client = state.client().await?;
    success(device::consumption(&client, &device_id).await?, Map::new())
}

async fn history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Response, Failure> {
    let period = parse_period(query.period.as_deref())?;
    let request = HistoryRequest::resolve(
        parse_millis("start_time", query.start_time.as_deref())?,
        parse_millis("end_time", query.end_time.as_deref())?,
        period,
        Utc::now(),
    );
    let device_id = state.device_id(query.device_id);
    let client = state.client().await?;
    let data = device::history(&client, &device_id, request).await?;

    let mut extras = Map::new();
    extras.insert("period".into(), json!(period.as_str()));
    success(data, extras)
}

async fn statistics(
    State(state): State<AppState>,
    Query(query): Query<StatisticsQuery>,
) -> Result<Response, Failure> {
    let period = parse_period(query.period.as_deref())?;
    let device_id = state.device_id(query.device_id);
    let client = state.client().await?;
    let data = device::statistics(&client, &device_id, period).await?;

    let mut extras = Map::new();
    extras.insert("statistics_type".into(), json!(period.as_str()));
    success(data, extras)
}

async fn database(
    State(state): State<AppState>,
    Query(query): Query<DatabaseQuery>,
) -> Result<Response, Failure> {
    let granularity = match query
        .granularity
        .as_deref()
        .or(query.kind.as_deref())
        .filter(|v| !v.trim().is_empty())
    {
        None => Granularity::default(),
        Some(raw) => Granularity::parse(raw).ok_or_else(|| {
            Failure::invalid_request(format!(
                "unknown granularity `{raw}` (expected daily, hourly or raw)"
            ))
        })?,
    };
    let window = HistoryWindow::resolve(
        parse_date("start_date", query.start_date.as_deref())?,
        parse_date("end_date", query.end_date.as_deref())?,
        Utc::now().date_naive(),
        state.config.history.default_window_days,
    );
    if window.start > window.end {
        return Err(Failure::invalid_request(
            "start_date must not be after end_date",
        ));
    }
    let device_id = state.device_id(query.device_id);

    if granularity == Granularity::Daily {
        state
            .engine
            .recompute_range(&device_id, window.start, window.end)
            .await?;
    }
    let rows = state
        .engine
        .query_history(&device_id, window, granularity)
        .await?;

    let mut extras = Map::new();
    extras.insert(
        "filters".into(),
        json!({
            "device_id": device_id,
            "granularity": granularity.as_str(),
            "start_date": window.start.to_string(),
            "end_date": window.end.to_string(),
        }),
    );
    extras.insert("count".into(), json!(rows.len()));
    success(rows, extras)
}

async fn not_found(uri: Uri) -> Response {
    tracing::debug!(path = %uri.path(), "unknown endpoint");
    let body = json!({
        "success": false,
        "error": format!("endpoint {} not found", uri.path()),
        "available_endpoints": ENDPOINTS.iter().map(|(path, _)| *path).collect::<Vec<_>>(),
        "timestamp": timestamp(),
    });
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::tests::{mock_token, test_config},
        normalize::Measurement,
        storage::Storage,
    };
    use axum::body::{self, Body};
    use axum::http::Request;
    use chrono::TimeZone;
    use mockito::Matcher;
    use tempfile::NamedTempFile;
    use tower::ServiceExt;

    async fn test_state(base_url: &str) -> (NamedTempFile, AppState) {
        let db_file = NamedTempFile::new().unwrap();
        let storage = Storage::connect(db_file.path()).await.unwrap();
        storage.ensure_schema().await.unwrap();
        let config = AppConfig {
            tuya: test_config(base_url),
            ..AppConfig::default()
        };
        (
            db_file,
            AppState::new(Arc::new(config), AggregationEngine::new(storage)),
        )
    }

    async fn get_json(state: AppState, uri: &str) -> (StatusCode, Value) {
        let response = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn unknown_path_lists_endpoints() {
        let (_db, state) = test_state("http://127.0.0.1:9").await;
        let (status, body) = get_json(state, "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
        let endpoints = body["available_endpoints"].as_array().unwrap();
        assert!(endpoints.iter().any(|e| e == "/database"));
    }

    #[tokio::test]
    async fn banner_and_info_do_not_touch_provider() {
        let (_db, state) = test_state("http://127.0.0.1:9").await;
        let (status, body) = get_json(state.clone(), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert!(body["timestamp"].is_string());

        let (status, body) = get_json(state, "/info/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["device_id"], "meter-1");
    }

    #[tokio::test]
    async fn properties_with_trailing_slash_returns_envelope() {
        let mut server = mockito::Server::new_async().await;
        let _token = mock_token(&mut server).await;
        let _props = server
            .mock("GET", "/v2.0/cloud/thing/meter-1/shadow/properties")
            .with_status(200)
            .with_body(
                json!({"success": true, "result": {"properties": [{"code": "total_power", "value": 10}]}})
                    .to_string(),
            )
            .create_async()
            .await;
        let (_db, state) = test_state(&server.url()).await;

        let (status, body) = get_json(state, "/properties/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["properties"][0]["code"], "total_power");
    }

    #[tokio::test]
    async fn rejected_credentials_map_to_bad_gateway() {
        let mut server = mockito::Server::new_async().await;
        let _token = server
            .mock("GET", Matcher::Regex(r"^/v1\.0/token".to_string()))
            .with_status(200)
            .with_body(json!({"success": false, "msg": "sign invalid"}).to_string())
            .create_async()
            .await;
        let (_db, state) = test_state(&server.url()).await;

        let (status, body) = get_json(state, "/status").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["success"], false);
        assert_eq!(body["kind"], "upstream");
        assert!(body["error"].as_str().unwrap().contains("sign invalid"));
    }

    #[tokio::test]
    async fn exhausted_statistics_map_to_not_found() {
        let mut server = mockito::Server::new_async().await;
        let _token = mock_token(&mut server).await;
        let _any = server
            .mock("GET", Matcher::Regex(r"/statistics|/consumption".to_string()))
            .with_status(200)
            .with_body(json!({"success": false, "msg": "permission deny"}).to_string())
            .create_async()
            .await;
        let (_db, state) = test_state(&server.url()).await;

        let (status, body) = get_json(state, "/statistics?type=month").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "no_data");
    }

    #[tokio::test]
    async fn history_reports_period() {
        let mut server = mockito::Server::new_async().await;
        let _token = mock_token(&mut server).await;
        let _logs = server
            .mock("GET", Matcher::Regex(r"^/v1\.0/iot-03/devices/meter-1/logs".to_string()))
            .match_query(Matcher::UrlEncoded("type".into(), "hour".into()))
            .with_status(200)
            .with_body(json!({"success": true, "result": {"logs": []}}).to_string())
            .create_async()
            .await;
        let (_db, state) = test_state(&server.url()).await;

        let (status, body) = get_json(state, "/history?type=hour&start_time=1&end_time=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["period"], "hour");
        assert_eq!(body["data"]["logs"], json!([]));
    }

    #[tokio::test]
    async fn invalid_parameters_are_rejected() {
        let (_db, state) = test_state("http://127.0.0.1:9").await;

        let (status, body) = get_json(state.clone(), "/history?type=week").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "invalid_request");

        let (status, _) = get_json(state.clone(), "/database?granularity=weekly").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = get_json(state.clone(), "/database?start_date=2024-13-01").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) =
            get_json(state, "/database?start_date=2024-01-05&end_date=2024-01-01").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn database_recomputes_daily_window_before_reading() {
        let (_db, state) = test_state("http://127.0.0.1:9").await;
        for (hour, energy) in [(8, 10.0), (20, 12.5)] {
            state
                .engine
                .storage()
                .insert_measurement(&Measurement {
                    device_id: "meter-1".to_string(),
                    captured_at: Utc.with_ymd_and_hms(2024, 1, 2, hour, 0, 0).unwrap(),
                    total_energy_kwh: Some(energy),
                    power_kw: Some(1.0),
                    voltage: None,
                    current: None,
                    frequency: None,
                    power_factor: None,
                    online: true,
                    raw_payload: json!({"properties": []}),
                })
                .await
                .unwrap();
        }

        let (status, body) = get_json(
            state.clone(),
            "/database/?start_date=2024-01-01&end_date=2024-01-03",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["filters"]["granularity"], "daily");
        assert_eq!(body["filters"]["start_date"], "2024-01-01");
        assert_eq!(body["data"][0]["date"], "2024-01-02");
        assert_eq!(body["data"][0]["consumption_kwh"], 2.5);
        assert_eq!(body["data"][0]["sample_count"], 2);

        let (status, body) = get_json(
            state,
            "/database?type=raw&start_date=2024-01-02&end_date=2024-01-02",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 2);
        assert_eq!(body["filters"]["granularity"], "raw");
        assert!(body["filters"].get("database").is_none());
    }

    #[tokio::test]
    async fn database_with_only_end_date_looks_back_from_it() {
        let (_db, state) = test_state("http://127.0.0.1:9").await;
        let (status, body) = get_json(state, "/database?end_date=2024-01-31").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["filters"]["start_date"], "2024-01-01");
        assert_eq!(body["filters"]["end_date"], "2024-01-31");
        assert_eq!(body["count"], 0);
    }
}
