use crate::error::DataError;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ENERGY_CODE: &str = "total_forward_energy";
pub const POWER_CODE: &str = "total_power";
const ENERGY_DIVISOR: f64 = 100.0;
const POWER_DIVISOR: f64 = 1000.0;
const HOURS_PER_DAY: f64 = 24.0;
const DAYS_PER_MONTH: f64 = 30.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawProperty {
    pub code: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub time: Option<i64>,
    #[serde(default)]
    pub custom_name: Option<String>,
    #[serde(default)]
    pub dp_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    pub device_id: String,
    pub captured_at: DateTime<Utc>,
    pub total_energy_kwh: Option<f64>,
    pub power_kw: Option<f64>,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub frequency: Option<f64>,
    pub power_factor: Option<f64>,
    pub online: bool,
    pub raw_payload: Value,
}

pub fn properties_from_result(path: &str, result: &Value) -> Result<Vec<RawProperty>, DataError> {
    let list = result
        .get("properties")
        .ok_or_else(|| DataError::MissingField {
            path: path.to_string(),
            field: "properties",
        })?;
    serde_json::from_value(list.clone()).map_err(|source| DataError::InvalidJson {
        path: path.to_string(),
        source,
    })
}

pub fn normalize_result(
    device_id: &str,
    path: &str,
    result: &Value,
    captured_at: DateTime<Utc>,
) -> Result<Measurement, DataError> {
    let properties = properties_from_result(path, result)?;
    let mut measurement = normalize(device_id, &properties, captured_at);
    measurement.raw_payload = result.clone();
    Ok(measurement)
}

pub fn normalize(
    device_id: &str,
    properties: &[RawProperty],
    captured_at: DateTime<Utc>,
) -> Measurement {
    let mut measurement = Measurement {
        device_id: device_id.to_string(),
        captured_at,
        total_energy_kwh: None,
        power_kw: None,
        voltage: None,
        current: None,
        frequency: None,
        power_factor: None,
        online: true,
        raw_payload: serde_json::json!({ "properties": properties }),
    };

    for property in properties {
        let value = numeric(&property.value);
        match property.code.as_str() {
            ENERGY_CODE => measurement.total_energy_kwh = value.map(energy_kwh),
            POWER_CODE => measurement.power_kw = value.map(power_kw),
            "voltage" => measurement.voltage = value,
            "current" => measurement.current = value,
            "frequency" => measurement.frequency = value,
            "power_factor" => measurement.power_factor = value,
            _ => {}
        }
    }

    measurement
}

pub fn energy_kwh(raw: f64) -> f64 {
    raw / ENERGY_DIVISOR
}

pub fn power_kw(raw: f64) -> f64 {
    raw / POWER_DIVISOR
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumptionEntry {
    pub code: String,
    pub value: Value,
    pub time: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumptionSummary {
    pub device_id: String,
    pub consumption_data: Vec<ConsumptionEntry>,
    pub current_power_w: f64,
    pub current_power_kw: f64,
    pub total_energy_kwh: f64,
    pub estimated_daily_consumption_kwh: f64,
    pub estimated_monthly_consumption_kwh: f64,
    pub note: &'static str,
    pub total_properties: usize,
}

pub fn consumption_summary(device_id: &str, properties: &[RawProperty]) -> ConsumptionSummary {
    let measurement = normalize(device_id, properties, Utc::now());
    // Absent readings count as zero here and only here.
    let current_power_kw = measurement.power_kw.unwrap_or(0.0);
    let total_energy_kwh = measurement.total_energy_kwh.unwrap_or(0.0);
    let estimated_daily = if current_power_kw > 0.0 {
        current_power_kw * HOURS_PER_DAY
    } else {
        0.0
    };

    let consumption_data = properties
        .iter()
        .filter(|property| property.code.contains("total"))
        .map(|property| {
            let converted = match (property.code.as_str(), numeric(&property.value)) {
                (ENERGY_CODE, Some(raw)) => serde_json::json!(energy_kwh(raw)),
                (POWER_CODE, Some(raw)) => serde_json::json!(power_kw(raw)),
                _ => property.value.clone(),
            };
            ConsumptionEntry {
                code: property.code.clone(),
                value: converted,
                time: property.time.and_then(format_reported_at),
                name: property
                    .custom_name
                    .clone()
                    .filter(|name| !name.trim().is_empty())
                    .unwrap_or_else(|| property.code.clone()),
            }
        })
        .collect();

    ConsumptionSummary {
        device_id: device_id.to_string(),
        consumption_data,
        current_power_w: current_power_kw * POWER_DIVISOR,
        current_power_kw: round_to(current_power_kw, 3),
        total_energy_kwh,
        estimated_daily_consumption_kwh: round_to(estimated_daily, 2),
        estimated_monthly_consumption_kwh: round_to(estimated_daily * DAYS_PER_MONTH, 2),
        note: "Estimates extrapolate the current power draw and may differ from actual consumption.",
        total_properties: properties.len(),
    }
}

fn format_reported_at(time_ms: i64) -> Option<String> {
    Utc.timestamp_millis_opt(time_ms)
        .single()
        .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
