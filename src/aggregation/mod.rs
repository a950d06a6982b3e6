use crate::{
    normalize::Measurement,
    storage::{AggregateStats, DailyAggregate, Storage},
};
use anyhow::{Result, anyhow};
use chrono::{Days, NaiveDate, Timelike};
use serde::Serialize;
use std::{collections::BTreeMap, fmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Granularity {
    #[default]
    Daily,
    Hourly,
    Raw,
}

impl Granularity {
    pub fn as_str(self) -> &'static str {
        match self {
            Granularity::Daily => "daily",
            Granularity::Hourly => "hourly",
            Granularity::Raw => "raw",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "daily" => Some(Granularity::Daily),
            "hourly" => Some(Granularity::Hourly),
            "raw" => Some(Granularity::Raw),
            _ => None,
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl HistoryWindow {
    pub fn resolve(
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        today: NaiveDate,
        default_days: u32,
    ) -> Self {
        let end = end.unwrap_or(today);
        let start = start.unwrap_or_else(|| {
            end.checked_sub_days(Days::new(u64::from(default_days)))
                .unwrap_or(NaiveDate::MIN)
        });
        Self { start, end }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourlyAggregate {
    pub device_id: String,
    pub date: NaiveDate,
    pub hour: u32,
    #[serde(flatten)]
    pub stats: AggregateStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum HistoryRows {
    Daily(Vec<DailyAggregate>),
    Hourly(Vec<HourlyAggregate>),
    Raw(Vec<Measurement>),
}

impl HistoryRows {
    pub fn len(&self) -> usize {
        match self {
            HistoryRows::Daily(rows) => rows.len(),
            HistoryRows::Hourly(rows) => rows.len(),
            HistoryRows::Raw(rows) => rows.len(),
        }
    }
}

/// Summary statistics over one set of measurements.
///
/// Boundary energies come from the chronologically first and last samples that
/// carry a reading. A cumulative counter that resets inside the set produces a
/// negative consumption; that is passed through unchanged.
pub fn summarize(samples: &[Measurement]) -> Option<AggregateStats> {
    if samples.is_empty() {
        return None;
    }

    let mut ordered: Vec<&Measurement> = samples.iter().collect();
    ordered.sort_by_key(|m| m.captured_at);

    let start_energy_kwh = ordered.iter().find_map(|m| m.total_energy_kwh);
    let end_energy_kwh = ordered.iter().rev().find_map(|m| m.total_energy_kwh);
    let consumption_kwh = match (start_energy_kwh, end_energy_kwh) {
        (Some(start), Some(end)) => Some(end - start),
        _ => None,
    };

    let powers: Vec<f64> = ordered.iter().filter_map(|m| m.power_kw).collect();
    let (avg_power_kw, max_power_kw, min_power_kw) = if powers.is_empty() {
        (None, None, None)
    } else {
        let sum: f64 = powers.iter().sum();
        (
            Some(sum / powers.len() as f64),
            powers.iter().copied().reduce(f64::max),
            powers.iter().copied().reduce(f64::min),
        )
    };

    Some(AggregateStats {
        start_energy_kwh,
        end_energy_kwh,
        consumption_kwh,
        avg_power_kw,
        max_power_kw,
        min_power_kw,
        sample_count: samples.len() as i64,
    })
}

pub fn hourly_aggregates(measurements: &[Measurement]) -> Vec<HourlyAggregate> {
    let mut buckets: BTreeMap<(NaiveDate, u32, &str), Vec<Measurement>> = BTreeMap::new();
    for m in measurements {
        let key = (m.captured_at.date_naive(), m.captured_at.hour(), m.device_id.as_str());
        buckets.entry(key).or_default().push(m.clone());
    }

    buckets
        .into_iter()
        .rev()
        .filter_map(|((date, hour, device_id), samples)| {
            summarize(&samples).map(|stats| HourlyAggregate {
                device_id: device_id.to_string(),
                date,
                hour,
                stats,
            })
        })
        .collect()
}

#[derive(Clone)]
pub struct AggregationEngine {
    storage: Storage,
}

impl AggregationEngine {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    #[cfg(test)]
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub async fn record_measurement(&self, measurement: &Measurement) -> Result<DailyAggregate> {
        self.storage.insert_measurement(measurement).await?;
        let date = measurement.captured_at.date_naive();
        self.recompute_daily(&measurement.device_id, date)
            .await?
            .ok_or_else(|| anyhow!("no measurements found for {date} right after insert"))
    }

    pub async fn recompute_daily(
        &self,
        device_id: &str,
        date: NaiveDate,
    ) -> Result<Option<DailyAggregate>> {
        let aggregate = self
            .storage
            .rewrite_daily_aggregate(device_id, date, summarize)
            .await?;
        if let Some(aggregate) = &aggregate {
            tracing::debug!(
                device_id,
                %date,
                samples = aggregate.stats.sample_count,
                consumption_kwh = ?aggregate.stats.consumption_kwh,
                "daily aggregate updated"
            );
        }
        Ok(aggregate)
    }

    /// Recomputes every day in `[start, end]` that has measurements. Days without
    /// any are skipped, so no row is created or cleared for them.
    pub async fn recompute_range(
        &self,
        device_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyAggregate>> {
        let mut written = Vec::new();
        if start > end {
            return Ok(written);
        }
        for date in self
            .storage
            .dates_with_measurements(device_id, start, end)
            .await?
        {
            if let Some(aggregate) = self.recompute_daily(device_id, date).await? {
                written.push(aggregate);
            }
        }
        tracing::info!(device_id, %start, %end, days = written.len(), "recomputed daily aggregates");
        Ok(written)
    }

    pub async fn query_history(
        &self,
        device_id: &str,
        window: HistoryWindow,
        granularity: Granularity,
    ) -> Result<HistoryRows> {
        let rows = match granularity {
            Granularity::Daily => HistoryRows::Daily(
                self.storage
                    .daily_aggregates_between(device_id, window.start, window.end)
                    .await?,
            ),
            Granularity::Hourly => {
                let measurements = self
                    .storage
                    .measurements_between(device_id, window.start, window.end)
                    .await?;
                HistoryRows::Hourly(hourly_aggregates(&measurements))
            }
            Granularity::Raw => HistoryRows::Raw(
                self.storage
                    .measurements_between(device_id, window.start, window.end)
                    .await?,
            ),
        };
        Ok(rows)
    }
}
