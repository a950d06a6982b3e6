use crate::{
    client::TuyaClient,
    error::{ApiError, ApiResult},
    fallback::{self, PeriodType},
    normalize::{self, ConsumptionSummary},
};
use chrono::{DateTime, Days, NaiveTime, Utc};
use serde_json::Value;

pub fn status_path(device_id: &str) -> String {
    format!("/v2.0/cloud/thing/batch?device_ids={device_id}")
}

pub fn properties_path(device_id: &str) -> String {
    format!("/v2.0/cloud/thing/{device_id}/shadow/properties")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryRequest {
    pub start_ms: i64,
    pub end_ms: i64,
    pub period: PeriodType,
}

impl HistoryRequest {
    pub fn resolve(
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        period: PeriodType,
        now: DateTime<Utc>,
    ) -> Self {
        let today = now.date_naive();
        let day_start = today.and_time(NaiveTime::MIN).and_utc();
        let day_end = today
            .checked_add_days(Days::new(1))
            .map(|tomorrow| tomorrow.and_time(NaiveTime::MIN).and_utc().timestamp_millis() - 1)
            .unwrap_or(i64::MAX);

        Self {
            start_ms: start_ms.unwrap_or(day_start.timestamp_millis()),
            end_ms: end_ms.unwrap_or(day_end),
            period,
        }
    }
}

async fn fetch(client: &TuyaClient, path: &str) -> ApiResult<Value> {
    let response = client.get(path).await?.parse()?;
    if response.reports_failure() {
        return Err(ApiError::Rejected(response.failure_message()));
    }
    Ok(response.result)
}

pub async fn status(client: &TuyaClient, device_id: &str) -> ApiResult<Value> {
    fetch(client, &status_path(device_id)).await
}

pub async fn properties(client: &TuyaClient, device_id: &str) -> ApiResult<Value> {
    fetch(client, &properties_path(device_id)).await
}

pub async fn consumption(client: &TuyaClient, device_id: &str) -> ApiResult<ConsumptionSummary> {
    let path = properties_path(device_id);
    let result = fetch(client, &path).await?;
    let properties = normalize::properties_from_result(&path, &result)?;
    Ok(normalize::consumption_summary(device_id, &properties))
}

pub async fn history(
    client: &TuyaClient,
    device_id: &str,
    request: HistoryRequest,
) -> ApiResult<Value> {
    let candidates =
        fallback::history_candidates(device_id, request.start_ms, request.end_ms, request.period);
    let response = fallback::resolve("device history", &candidates, client).await?;
    Ok(response.result)
}

pub async fn statistics(
    client: &TuyaClient,
    device_id: &str,
    period: PeriodType,
) -> ApiResult<Value> {
    let candidates = fallback::statistics_candidates(device_id, period);
    let response = fallback::resolve("device statistics", &candidates, client).await?;
    Ok(response.result)
}
