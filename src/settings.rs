use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use crate::result_store::DEFAULT_RESULTS_FILE;
use crate::scheduler::RunMode;

pub const DEFAULT_CONFIG_PATH: &str = "config/routes.yaml";
pub const DEFAULT_LOG_LEVEL: &str = "INFO";

/// Process-level flags. Every flag falls back to a `ROUTE_MONITOR_*` variable.
#[derive(Debug, Clone, Parser)]
#[command(name = "route-monitor", version, about = "HTTP route monitoring with JSON result files")]
pub struct RunSettings {
    /// YAML/JSON file with route definitions, or a directory of them
    #[arg(long, env = "ROUTE_MONITOR_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Where the latest probe results are stored; a directory splits them per source file
    #[arg(long, env = "ROUTE_MONITOR_RESULTS_FILE", default_value = DEFAULT_RESULTS_FILE)]
    pub results_file: PathBuf,

    /// DEBUG, INFO, WARNING, ERROR or CRITICAL
    #[arg(long, env = "ROUTE_MONITOR_LOG_LEVEL", default_value = DEFAULT_LOG_LEVEL)]
    pub log_level: String,

    #[arg(long, env = "ROUTE_MONITOR_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Run every monitor once and exit
    #[arg(long, env = "ROUTE_MONITOR_ONE_SHOT")]
    pub one_shot: bool,
}

impl RunSettings {
    pub fn run_mode(&self) -> RunMode {
        RunMode::from_one_shot(self.one_shot)
    }

    pub fn log_configuration(&self) {
        info!("Route Monitor Configuration:");
        info!("  Config path: {}", self.config.display());
        info!("  Results file: {}", self.results_file.display());
        info!("  Log level: {}", self.log_level);
        match &self.log_file {
            Some(path) => info!("  Log file: {}", path.display()),
            None => info!("  Log file: none"),
        }
        info!("  Mode: {:?}", self.run_mode());
    }
}
