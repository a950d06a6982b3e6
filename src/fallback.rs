use crate::{
    client::{ApiResponse, TuyaClient},
    error::AllFailedError,
};
use reqwest::Method;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointCandidate {
    pub method: Method,
    pub path: String,
}

impl EndpointCandidate {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeriodType {
    #[default]
    Day,
    Hour,
    Month,
}

impl PeriodType {
    pub fn as_str(self) -> &'static str {
        match self {
            PeriodType::Day => "day",
            PeriodType::Hour => "hour",
            PeriodType::Month => "month",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "day" => Some(PeriodType::Day),
            "hour" => Some(PeriodType::Hour),
            "month" => Some(PeriodType::Month),
            _ => None,
        }
    }
}

impl fmt::Display for PeriodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn history_candidates(
    device_id: &str,
    start_ms: i64,
    end_ms: i64,
    period: PeriodType,
) -> Vec<EndpointCandidate> {
    let range = format!("start_time={start_ms}&end_time={end_ms}");
    vec![
        EndpointCandidate::get(format!(
            "/v1.0/iot-03/devices/{device_id}/logs?{range}&type={period}"
        )),
        EndpointCandidate::get(format!(
            "/v1.0/iot-03/devices/{device_id}/history?{range}&type={period}"
        )),
        EndpointCandidate::get(format!(
            "/v2.0/cloud/thing/{device_id}/logs?{range}&type={period}"
        )),
        EndpointCandidate::get(format!(
            "/v1.0/iot-03/devices/{device_id}/statistics?type={period}"
        )),
        EndpointCandidate::get(format!(
            "/v1.0/iot-03/devices/{device_id}/consumption?{range}"
        )),
    ]
}

pub fn statistics_candidates(device_id: &str, period: PeriodType) -> Vec<EndpointCandidate> {
    vec![
        EndpointCandidate::get(format!(
            "/v1.0/iot-03/devices/{device_id}/statistics?type={period}"
        )),
        EndpointCandidate::get(format!(
            "/v2.0/cloud/thing/{device_id}/statistics?type={period}"
        )),
        EndpointCandidate::get(format!(
            "/v1.0/iot-03/devices/{device_id}/consumption?type={period}"
        )),
    ]
}

/// Returns the first candidate response that is not an explicit failure.
///
/// Transport errors, unparseable bodies and `success: false` all move on to the
/// next candidate without being reported; once one succeeds the rest are never
/// called. Exhausting the list yields [`AllFailedError`] and nothing else.
pub async fn resolve(
    operation: &str,
    candidates: &[EndpointCandidate],
    client: &TuyaClient,
) -> Result<ApiResponse, AllFailedError> {
    for (index, candidate) in candidates.iter().enumerate() {
        let raw = match client
            .call(candidate.method.clone(), &candidate.path, None)
            .await
        {
            Ok(raw) => raw,
            Err(err) => {
                tracing::debug!(operation, index, error = %err, "candidate endpoint failed");
                continue;
            }
        };

        match raw.parse() {
            Ok(response) if !response.reports_failure() => {
                tracing::debug!(operation, index, "candidate endpoint answered");
                return Ok(response);
            }
            Ok(response) => {
                tracing::debug!(operation, index, msg = ?response.msg, "candidate endpoint reported failure");
            }
            Err(err) => {
                tracing::debug!(operation, index, error = %err, "candidate endpoint returned unreadable body");
            }
        }
    }

    tracing::info!(operation, candidates = candidates.len(), "no candidate endpoint answered");
    Err(AllFailedError {
        operation: operation.to_string(),
    })
}
