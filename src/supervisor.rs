use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ConfigError, RouteConfig};
use crate::registry::MonitorRegistry;
use crate::result_store::ResultStore;
use crate::scheduler::{RouteScheduler, RunMode, SchedulerReport, SchedulerState};

pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct SupervisorReport {
    pub completed: usize,
    pub stopped: usize,
    pub failed: usize,
    pub schedulers: Vec<SchedulerReport>,
}

/// Owns one scheduler per enabled route and waits for them to finish.
pub struct Supervisor {
    schedulers: Vec<RouteScheduler>,
    cancel: CancellationToken,
    mode: RunMode,
    shutdown_grace: Duration,
}

impl Supervisor {
    /// Builds every scheduler up front; any failure aborts before one starts.
    pub fn build(
        routes: &[RouteConfig],
        store: Arc<dyn ResultStore>,
        registry: &MonitorRegistry,
        mode: RunMode,
    ) -> Result<Self, ConfigError> {
        let cancel = CancellationToken::new();
        let schedulers = routes
            .iter()
            .filter(|route| route.enabled)
            .map(|route| {
                let probe = registry.build(route)?;
                Ok(RouteScheduler::new(probe, Arc::clone(&store), cancel.clone(), mode))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(Self {
            schedulers,
            cancel,
            mode,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        })
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn scheduler_count(&self) -> usize {
        self.schedulers.len()
    }

    pub fn route_names(&self) -> Vec<&str> {
        self.schedulers.iter().map(RouteScheduler::name).collect()
    }

    /// Token that stops every scheduler once cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Starts all schedulers and waits for them.
    ///
    /// Returns once every scheduler has finished. When `shutdown` resolves
    /// first, the schedulers are cancelled and each gets `shutdown_grace` to
    /// wind down before the rest are aborted.
    pub async fn run<F>(self, shutdown: F) -> SupervisorReport
    where
        F: Future<Output = ()>,
    {
        let Self {
            schedulers,
            cancel,
            mode,
            shutdown_grace,
        } = self;

        let mut tasks = JoinSet::new();
        for scheduler in schedulers {
            let route = scheduler.route();
            info!(
                route = %route.name,
                method = %route.method,
                url = %route.url,
                interval = ?route.interval,
                mode = ?mode,
                "Started monitor"
            );
            tasks.spawn(scheduler.run());
        }

        let mut report = SupervisorReport::default();
        let mut interrupted = false;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(joined) => record(&mut report, joined),
                    None => break,
                },
                _ = &mut shutdown => {
                    info!("Received interrupt, stopping monitors...");
                    cancel.cancel();
                    interrupted = true;
                    break;
                }
            }
        }

        if interrupted {
            loop {
                match tokio::time::timeout(shutdown_grace, tasks.join_next()).await {
                    Ok(Some(joined)) => record(&mut report, joined),
                    Ok(None) => break,
                    Err(_) => {
                        warn!(
                            remaining = tasks.len(),
                            "Monitors did not stop within {:?}, aborting them", shutdown_grace
                        );
                        report.failed += tasks.len();
                        tasks.abort_all();
                        break;
                    }
                }
            }
        }

        report
    }
}

fn record(report: &mut SupervisorReport, joined: Result<SchedulerReport, tokio::task::JoinError>) {
    match joined {
        Ok(scheduler) => {
            match scheduler.state {
                SchedulerState::Completed => report.completed += 1,
                SchedulerState::Stopped => report.stopped += 1,
                _ => report.failed += 1,
            }
            report.schedulers.push(scheduler);
        }
        Err(err) => {
            error!("Monitor task failed: {err}");
            report.failed += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config;
    use crate::http_client::MockHttpClient;
    use crate::probe::{Probe, ProbeExecutor};
    use crate::result_store::{FileResultStore, MemoryResultStore};
    use serde_json::{json, Value};
    use tokio::time::Instant;

    fn mock_registry(delay: Duration) -> MonitorRegistry {
        let mut registry = MonitorRegistry::empty();
        registry.register("http", move |route| {
            let client = MockHttpClient::new()
                .with_default_response(200, "ok")
                .with_delay(delay);
            Ok(Box::new(ProbeExecutor::new(route, Box::new(client))) as Box<dyn Probe>)
        });
        registry
    }

    fn routes(count: usize) -> Vec<RouteConfig> {
        (0..count)
            .map(|i| {
                let mut route = RouteConfig::new(format!("route-{i}"), format!("http://host-{i}"));
                route.interval = Duration::from_secs(1);
                route
            })
            .collect()
    }

    #[test]
    fn test_one_scheduler_per_enabled_route() {
        let mut routes = routes(4);
        routes[1].enabled = false;
        routes[3].enabled = false;
        let store = Arc::new(MemoryResultStore::new());

        let supervisor =
            Supervisor::build(&routes, store, &mock_registry(Duration::ZERO), RunMode::OneShot).unwrap();

        assert_eq!(supervisor.scheduler_count(), 2);
        assert_eq!(supervisor.route_names(), vec!["route-0", "route-2"]);
    }

    #[test]
    fn test_unknown_kind_fails_before_start() {
        let mut routes = routes(2);
        routes[1].monitor_kind = "ftp".into();
        let store = Arc::new(MemoryResultStore::new());

        let err = Supervisor::build(
            &routes,
            store.clone(),
            &mock_registry(Duration::ZERO),
            RunMode::OneShot,
        )
        .err()
        .unwrap();

        assert!(matches!(err, ConfigError::UnknownMonitorKind { .. }));
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn test_one_shot_runs_every_route_once() {
        let routes = routes(3);
        let store = Arc::new(MemoryResultStore::new());
        let supervisor = Supervisor::build(
            &routes,
            store.clone(),
            &mock_registry(Duration::ZERO),
            RunMode::OneShot,
        )
        .unwrap();

        let report = supervisor.run(std::future::pending()).await;

        assert_eq!(report.completed, 3);
        assert_eq!(report.stopped, 0);
        for route in &routes {
            assert_eq!(store.write_count(&route.name), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_all_within_timeout() {
        let mut routes = routes(3);
        for route in &mut routes {
            route.timeout = Duration::from_secs(2);
        }
        let store = Arc::new(MemoryResultStore::new());
        let supervisor = Supervisor::build(
            &routes,
            store.clone(),
            &mock_registry(Duration::from_secs(2)),
            RunMode::Continuous,
        )
        .unwrap();

        let started = Instant::now();
        let report = supervisor
            .run(tokio::time::sleep(Duration::from_millis(2500)))
            .await;

        assert_eq!(report.stopped, 3);
        assert_eq!(report.failed, 0);
        // second round of probes started at 2s and finishes at 4s
        assert!(started.elapsed() <= Duration::from_millis(2500) + Duration::from_secs(2) + Duration::from_secs(1));
        for route in &routes {
            assert_eq!(store.write_count(&route.name), 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_cancel_ends_continuous_run() {
        let store = Arc::new(MemoryResultStore::new());
        let supervisor = Supervisor::build(
            &routes(2),
            store,
            &mock_registry(Duration::ZERO),
            RunMode::Continuous,
        )
        .unwrap();
        let token = supervisor.cancel_token();

        let handle = tokio::spawn(supervisor.run(std::future::pending()));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        token.cancel();
        let report = handle.await.unwrap();

        assert_eq!(report.stopped, 2);
        assert!(report.schedulers.iter().all(|s| s.executions == 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_scheduler_is_aborted_after_grace() {
        let store = Arc::new(MemoryResultStore::new());
        let supervisor = Supervisor::build(
            &routes(1),
            store,
            &mock_registry(Duration::from_secs(60)),
            RunMode::Continuous,
        )
        .unwrap()
        .with_shutdown_grace(Duration::from_secs(1));

        let report = supervisor
            .run(tokio::time::sleep(Duration::from_millis(100)))
            .await;

        assert_eq!(report.failed, 1);
        assert_eq!(report.stopped, 0);
    }

    async fn spawn_server() -> String {
        let app = axum::Router::new().route("/health", axum::routing::get(|| async { "ok" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/health")
    }

    #[tokio::test]
    async fn test_end_to_end_one_shot() {
        let url = spawn_server().await;
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("routes.yaml");
        std::fs::write(
            &config_path,
            format!(
                "routes:\n  - name: health\n    url: {url}\n    interval: 1\n    tags: [smoke]\n  - name: refused\n    url: http://127.0.0.1:1/\n    timeout: 2\n  - name: disabled\n    url: {url}\n    enabled: false\n"
            ),
        )
        .unwrap();
        let results_path = dir.path().join("results.json");

        let config = load_config(&config_path).unwrap();
        let store = Arc::new(FileResultStore::new(&results_path).unwrap());
        let supervisor = Supervisor::build(
            &config.routes,
            store,
            &MonitorRegistry::default(),
            RunMode::OneShot,
        )
        .unwrap();
        let report = supervisor.run(std::future::pending()).await;
        assert_eq!(report.completed, 2);

        let document: Value =
            serde_json::from_str(&std::fs::read_to_string(&results_path).unwrap()).unwrap();
        let routes = document["routes"].as_object().unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(document["schema_version"], json!(1));

        let health = &routes["health"];
        assert_eq!(health["status_code"], json!(200));
        assert_eq!(health["ok"], json!(true));
        assert_eq!(health["body_excerpt"], json!("ok"));
        assert_eq!(health["body_truncated"], json!(false));
        assert_eq!(health["error"], Value::Null);
        assert_eq!(health["tags"], json!(["smoke"]));
        assert!(health["response_time_ms"].as_f64().unwrap() > 0.0);

        let refused = &routes["refused"];
        assert_eq!(refused["status_code"], Value::Null);
        assert_eq!(refused["ok"], json!(false));
        assert!(refused["error"].as_str().is_some_and(|e| !e.is_empty()));
    }
}
