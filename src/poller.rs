use crate::{
    aggregation::AggregationEngine,
    client::TuyaClient,
    config::{AppConfig, TuyaConfig},
    device,
    error::ApiResult,
    normalize::{self, Measurement},
    storage::DailyAggregate,
};
use anyhow::{Result, anyhow};
use chrono::Utc;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::{sync::oneshot, task::JoinHandle, time};

#[derive(Debug, Clone, Serialize)]
pub struct PollOutcome {
    pub measurement: Measurement,
    pub aggregate: DailyAggregate,
}

pub async fn poll_once(config: &TuyaConfig, engine: &AggregationEngine) -> ApiResult<PollOutcome> {
    let device_id = config.device_id.as_str();
    let client = TuyaClient::connect(config).await?;
    if let Some(session) = client.session() {
        tracing::debug!(device_id, token_expires_at = %session.expires_at, "authenticated for poll");
    }
    let result = device::properties(&client, device_id).await?;
    let measurement = normalize::normalize_result(
        device_id,
        &device::properties_path(device_id),
        &result,
        Utc::now(),
    )?;
    let aggregate = engine.record_measurement(&measurement).await?;

    tracing::info!(
        device_id,
        captured_at = %measurement.captured_at,
        energy_kwh = ?measurement.total_energy_kwh,
        power_kw = ?measurement.power_kw,
        day_consumption_kwh = ?aggregate.stats.consumption_kwh,
        "measurement recorded"
    );

    Ok(PollOutcome {
        measurement,
        aggregate,
    })
}

pub struct PollerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<Result<()>>,
}

impl PollerHandle {
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

pub fn spawn(config: Arc<AppConfig>, engine: AggregationEngine) -> Option<PollerHandle> {
    let interval_secs = config.poller.interval_secs?;
    let poll_interval = Duration::from_secs(interval_secs.max(1));
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

    let join = tokio::spawn(async move {
        let mut ticker = time::interval(poll_interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = poll_once(&config.tuya, &engine).await {
                        tracing::warn!(error = %err, kind = err.kind().as_str(), "scheduled poll failed");
                    }
                }
                _ = &mut shutdown_rx => {
                    break;
                }
            }
        }
        Ok(())
    });

    tracing::info!(interval_secs = poll_interval.as_secs(), "poller started");

    Some(PollerHandle {
        shutdown: Some(shutdown_tx),
        join,
    })
}
