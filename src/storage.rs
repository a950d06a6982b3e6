use crate::normalize::Measurement;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, SubsecRound, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{
    Row, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
};
use std::{path::Path, sync::Arc};

const MEASUREMENT_COLUMNS: &str = "device_id, captured_at, total_energy_kwh, power_kw, voltage, current, frequency, power_factor, online, raw_payload";
const AGGREGATE_COLUMNS: &str = "device_id, date, start_energy_kwh, end_energy_kwh, consumption_kwh, avg_power_kw, max_power_kw, min_power_kw, sample_count, updated_at";

#[derive(Clone)]
pub struct Storage {
    pool: Arc<SqlitePool>,
}

impl Storage {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| "failed to connect to sqlite database")?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS measurements (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id TEXT NOT NULL,
                captured_at TEXT NOT NULL,
                date TEXT NOT NULL,
                total_energy_kwh REAL,
                power_kw REAL,
                voltage REAL,
                current REAL,
                frequency REAL,
                power_factor REAL,
                online INTEGER NOT NULL DEFAULT 1,
                raw_payload TEXT NOT NULL
            );
            "#,
        )
        .execute(&*self.pool)
        .await
        .with_context(|| "failed to ensure measurements schema")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_measurements_device_date
            ON measurements(device_id, date, captured_at);
            "#,
        )
        .execute(&*self.pool)
        .await
        .with_context(|| "failed to ensure measurements index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS daily_aggregates (
                device_id TEXT NOT NULL,
                date TEXT NOT NULL,
                start_energy_kwh REAL,
                end_energy_kwh REAL,
                consumption_kwh REAL,
                avg_power_kw REAL,
                max_power_kw REAL,
                min_power_kw REAL,
                sample_count INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (device_id, date)
            );
            "#,
        )
        .execute(&*self.pool)
        .await
        .with_context(|| "failed to ensure daily_aggregates schema")?;

        Ok(())
    }

    pub async fn insert_measurement(&self, measurement: &Measurement) -> Result<i64> {
        let raw_payload = serde_json::to_string(&measurement.raw_payload)
            .with_context(|| "failed to serialize raw payload")?;

        let result = sqlx::query(
            r#"
            INSERT INTO measurements (
                device_id, captured_at, date, total_energy_kwh, power_kw, voltage, current, frequency, power_factor, online, raw_payload
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);
            "#,
        )
        .bind(&measurement.device_id)
        .bind(timestamp_key(measurement.captured_at))
        .bind(measurement.captured_at.date_naive().to_string())
        .bind(measurement.total_energy_kwh)
        .bind(measurement.power_kw)
        .bind(measurement.voltage)
        .bind(measurement.current)
        .bind(measurement.frequency)
        .bind(measurement.power_factor)
        .bind(measurement.online)
        .bind(raw_payload)
        .execute(&*self.pool)
        .await
        .with_context(|| "failed to insert measurement row")?;

        Ok(result.last_insert_rowid())
    }

    pub async fn measurements_between(
        &self,
        device_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Measurement>> {
        let sql = format!(
            "SELECT {MEASUREMENT_COLUMNS} FROM measurements WHERE device_id = ? AND date BETWEEN ? AND ? ORDER BY captured_at DESC, id DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(device_id)
            .bind(start.to_string())
            .bind(end.to_string())
            .fetch_all(&*self.pool)
            .await
            .with_context(|| "failed to load measurements between dates")?;

        rows.iter().map(measurement_from_row).collect()
    }

    pub async fn dates_with_measurements(
        &self,
        device_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<NaiveDate>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT date FROM measurements
            WHERE device_id = ? AND date BETWEEN ? AND ?
            ORDER BY date ASC
            "#,
        )
        .bind(device_id)
        .bind(start.to_string())
        .bind(end.to_string())
        .fetch_all(&*self.pool)
        .await
        .with_context(|| "failed to list measurement dates")?;

        rows.iter()
            .map(|row| {
                let value: String = row.try_get("date")?;
                NaiveDate::parse_from_str(&value, "%Y-%m-%d")
                    .with_context(|| format!("invalid date stored in DB: {value}"))
            })
            .collect()
    }

    /// Recomputes the aggregate row for `(device_id, date)` from the measurements
    /// currently stored, reading and upserting inside one transaction.
    ///
    /// `summarize` receives the day's measurements oldest first. Returning `None`
    /// leaves the table untouched.
    pub async fn rewrite_daily_aggregate<F>(
        &self,
        device_id: &str,
        date: NaiveDate,
        summarize: F,
    ) -> Result<Option<DailyAggregate>>
    where
        F: FnOnce(&[Measurement]) -> Option<AggregateStats>,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .with_context(|| "failed to begin aggregate transaction")?;

        let sql = format!(
            "SELECT {MEASUREMENT_COLUMNS} FROM measurements WHERE device_id = ? AND date = ? ORDER BY captured_at ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(device_id)
            .bind(date.to_string())
            .fetch_all(&mut *tx)
            .await
            .with_context(|| "failed to load measurements for aggregate")?;
        let measurements = rows
            .iter()
            .map(measurement_from_row)
            .collect::<Result<Vec<_>>>()?;

        let Some(stats) = summarize(&measurements) else {
            tx.rollback()
                .await
                .with_context(|| "failed to close aggregate transaction")?;
            return Ok(None);
        };

        let aggregate = DailyAggregate {
            device_id: device_id.to_string(),
            date,
            stats,
            // Matches the millisecond precision of the stored text.
            updated_at: Utc::now().trunc_subsecs(3),
        };

        sqlx::query(
            r#"
            INSERT INTO daily_aggregates (
                device_id, date, start_energy_kwh, end_energy_kwh, consumption_kwh,
                avg_power_kw, max_power_kw, min_power_kw, sample_count, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(device_id, date) DO UPDATE SET
                start_energy_kwh = excluded.start_energy_kwh,
                end_energy_kwh = excluded.end_energy_kwh,
                consumption_kwh = excluded.consumption_kwh,
                avg_power_kw = excluded.avg_power_kw,
                max_power_kw = excluded.max_power_kw,
                min_power_kw = excluded.min_power_kw,
                sample_count = excluded.sample_count,
                updated_at = excluded.updated_at;
            "#,
        )
        .bind(&aggregate.device_id)
        .bind(aggregate.date.to_string())
        .bind(aggregate.stats.start_energy_kwh)
        .bind(aggregate.stats.end_energy_kwh)
        .bind(aggregate.stats.consumption_kwh)
        .bind(aggregate.stats.avg_power_kw)
        .bind(aggregate.stats.max_power_kw)
        .bind(aggregate.stats.min_power_kw)
        .bind(aggregate.stats.sample_count)
        .bind(timestamp_key(aggregate.updated_at))
        .execute(&mut *tx)
        .await
        .with_context(|| "failed to upsert daily aggregate")?;

        tx.commit()
            .await
            .with_context(|| "failed to commit daily aggregate")?;

        Ok(Some(aggregate))
    }

    #[cfg(test)]
    pub async fn daily_aggregate(
        &self,
        device_id: &str,
        date: NaiveDate,
    ) -> Result<Option<DailyAggregate>> {
        let sql = format!(
            "SELECT {AGGREGATE_COLUMNS} FROM daily_aggregates WHERE device_id = ? AND date = ?"
        );
        let row = sqlx::query(&sql)
            .bind(device_id)
            .bind(date.to_string())
            .fetch_optional(&*self.pool)
            .await
            .with_context(|| "failed to load daily aggregate")?;

        row.as_ref().map(aggregate_from_row).transpose()
    }

    pub async fn daily_aggregates_between(
        &self,
        device_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyAggregate>> {
        let sql = format!(
            "SELECT {AGGREGATE_COLUMNS} FROM daily_aggregates WHERE device_id = ? AND date BETWEEN ? AND ? ORDER BY date DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(device_id)
            .bind(start.to_string())
            .bind(end.to_string())
            .fetch_all(&*self.pool)
            .await
            .with_context(|| "failed to load daily aggregates")?;

        rows.iter().map(aggregate_from_row).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateStats {
    pub start_energy_kwh: Option<f64>,
    pub end_energy_kwh: Option<f64>,
    pub consumption_kwh: Option<f64>,
    pub avg_power_kw: Option<f64>,
    pub max_power_kw: Option<f64>,
    pub min_power_kw: Option<f64>,
    pub sample_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyAggregate {
    pub device_id: String,
    pub date: NaiveDate,
    #[serde(flatten)]
    pub stats: AggregateStats,
    pub updated_at: DateTime<Utc>,
}

fn timestamp_key(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .with_context(|| format!("invalid timestamp stored in DB: {value}"))
}

fn measurement_from_row(row: &SqliteRow) -> Result<Measurement> {
    let captured_at: String = row.try_get("captured_at")?;
    let raw_payload: String = row.try_get("raw_payload")?;
    Ok(Measurement {
        device_id: row.try_get("device_id")?,
        captured_at: parse_timestamp(&captured_at)?,
        total_energy_kwh: row.try_get("total_energy_kwh")?,
        power_kw: row.try_get("power_kw")?,
        voltage: row.try_get("voltage")?,
        current: row.try_get("current")?,
        frequency: row.try_get("frequency")?,
        power_factor: row.try_get("power_factor")?,
        online: row.try_get("online")?,
        raw_payload: serde_json::from_str(&raw_payload).unwrap_or(Value::String(raw_payload)),
    })
}

fn aggregate_from_row(row: &SqliteRow) -> Result<DailyAggregate> {
    let date_str: String = row.try_get("date")?;
    let date = NaiveDate::parse_from_str(&date_str, "%Y-%m-%d")
        .with_context(|| format!("invalid date stored in DB: {date_str}"))?;
    let updated_at: String = row.try_get("updated_at")?;
    Ok(DailyAggregate {
        device_id: row.try_get("device_id")?,
        date,
        stats: AggregateStats {
            start_energy_kwh: row.try_get("start_energy_kwh")?,
            end_energy_kwh: row.try_get("end_energy_kwh")?,
            consumption_kwh: row.try_get("consumption_kwh")?,
            avg_power_kw: row.try_get("avg_power_kw")?,
            max_power_kw: row.try_get("max_power_kw")?,
            min_power_kw: row.try_get("min_power_kw")?,
            sample_count: row.try_get("sample_count")?,
        },
        updated_at: parse_timestamp(&updated_at)?,
    })
}
