use crate::{
    aggregation::{AggregationEngine, Granularity, HistoryWindow},
    cli::Command,
    config::AppConfig,
    poller, server,
    storage::Storage,
};
use anyhow::{Context, Result, bail};
use chrono::{NaiveDate, Utc};
use std::sync::Arc;

pub struct App {
    config: Arc<AppConfig>,
    engine: AggregationEngine,
}

impl App {
    pub async fn new(config: AppConfig) -> Result<Self> {
        let storage = Storage::connect(&config.storage.database_path).await?;
        storage.ensure_schema().await?;
        Ok(Self {
            config: Arc::new(config),
            engine: AggregationEngine::new(storage),
        })
    }

    pub async fn run(self, command: Command) -> Result<()> {
        match command {
            Command::Poll => self.poll().await,
            Command::Serve => self.serve().await,
            Command::Recompute {
                start,
                end,
                device_id,
            } => self.recompute(device_id, start, end).await,
            Command::History {
                start,
                end,
                granularity,
                device_id,
            } => self.history(device_id, start, end, granularity).await,
        }
    }

    fn device_id(&self, requested: Option<String>) -> String {
        requested.unwrap_or_else(|| self.config.tuya.device_id.clone())
    }

    async fn poll(&self) -> Result<()> {
        self.config.validate()?;
        match poller::poll_once(&self.config.tuya, &self.engine).await {
            Ok(outcome) => {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
                Ok(())
            }
            Err(err) => {
                tracing::error!(error = %err, kind = err.kind().as_str(), "poll failed");
                Err(err.into())
            }
        }
    }

    async fn serve(self) -> Result<()> {
        self.config.validate()?;
        let server_handle = server::spawn(self.config.clone(), self.engine.clone()).await?;
        let poller_handle = poller::spawn(self.config.clone(), self.engine.clone());

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        tracing::info!("shutting down");

        if let Some(handle) = poller_handle {
            handle.shutdown().await?;
        }
        server_handle.shutdown().await
    }

    async fn recompute(
        &self,
        device_id: Option<String>,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<()> {
        if start > end {
            bail!("--start {start} is after --end {end}");
        }
        let device_id = self.device_id(device_id);
        let written = self.engine.recompute_range(&device_id, start, end).await?;
        println!("{}", serde_json::to_string_pretty(&written)?);
        Ok(())
    }

    async fn history(
        &self,
        device_id: Option<String>,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        granularity: Granularity,
    ) -> Result<()> {
        let window = HistoryWindow::resolve(
            start,
            end,
            Utc::now().date_naive(),
            self.config.history.default_window_days,
        );
        let device_id = self.device_id(device_id);
        let rows = self
            .engine
            .query_history(&device_id, window, granularity)
            .await?;
        println!("{}", serde_json::to_string_pretty(&rows)?);
        Ok(())
    }
}
