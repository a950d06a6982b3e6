use crate::aggregation::Granularity;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(author, version, about = "Tuya smart-meter poller and consumption API", long_about = None)]
pub struct Cli {
    /// Path to a TOML configuration file (defaults to ./meter.toml if present).
    #[arg(long, value_name = "FILE", global = true)]
    pub config_path: Option<PathBuf>,
    /// Append log output to this file instead of stderr.
    #[arg(long, value_name = "FILE", global = true)]
    pub log_file: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Poll,
    Serve,
    Recompute {
        #[arg(long, value_name = "YYYY-MM-DD")]
        start: NaiveDate,
        #[arg(long, value_name = "YYYY-MM-DD")]
        end: NaiveDate,
        #[arg(long)]
        device_id: Option<String>,
    },
    History {
        #[arg(long, value_name = "YYYY-MM-DD")]
        start: Option<NaiveDate>,
        #[arg(long, value_name = "YYYY-MM-DD")]
        end: Option<NaiveDate>,
        #[arg(long, value_enum, default_value_t = Granularity::Daily)]
        granularity: Granularity,
        #[arg(long)]
        device_id: Option<String>,
    },
}
