use anyhow::Context;
use clap::Parser;
use route_monitor::{
    load_config, logging, FileResultStore, MonitorRegistry, RunSettings, Supervisor,
};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let settings = RunSettings::parse();

    if let Err(err) = logging::init(&settings.log_level, settings.log_file.as_deref()) {
        eprintln!("Failed to initialise logging: {err}");
        return ExitCode::FAILURE;
    }
    settings.log_configuration();

    match run(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(settings: RunSettings) -> anyhow::Result<()> {
    let config = load_config(&settings.config)
        .with_context(|| format!("Failed to load config {}", settings.config.display()))?;

    let routes = config.enabled_routes();
    if routes.is_empty() {
        warn!("No enabled routes configured. Nothing to monitor.");
        return Ok(());
    }

    let store = FileResultStore::new(&settings.results_file).with_context(|| {
        format!("Failed to prepare results output {}", settings.results_file.display())
    })?;
    info!(layout = ?store.layout(), "Writing results");

    let supervisor = Supervisor::build(
        &routes,
        Arc::new(store),
        &MonitorRegistry::default(),
        settings.run_mode(),
    )
    .context("Failed to initialize monitors")?;

    let report = supervisor.run(shutdown_signal()).await;
    info!(
        completed = report.completed,
        stopped = report.stopped,
        failed = report.failed,
        "Monitoring stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for interrupt: {err}");
        std::future::pending::<()>().await;
    }
}
