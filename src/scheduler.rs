use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::RouteConfig;
use crate::probe::Probe;
use crate::result_store::ResultStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Continuous,
    OneShot,
}

impl RunMode {
    pub fn from_one_shot(one_shot: bool) -> Self {
        if one_shot {
            RunMode::OneShot
        } else {
            RunMode::Continuous
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopping,
    Completed,
    Stopped,
}

impl SchedulerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SchedulerState::Completed | SchedulerState::Stopped)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerReport {
    pub route: String,
    pub state: SchedulerState,
    pub executions: u64,
}

/// Drives one route: probe, persist, wait, repeat.
///
/// Waits are measured from the start of the previous probe. The cancellation
/// token is honoured between probes only; a request in flight always runs to
/// completion or to its own timeout.
pub struct RouteScheduler {
    probe: Box<dyn Probe>,
    store: Arc<dyn ResultStore>,
    cancel: CancellationToken,
    mode: RunMode,
    state: SchedulerState,
    executions: u64,
}

impl RouteScheduler {
    pub fn new(
        probe: Box<dyn Probe>,
        store: Arc<dyn ResultStore>,
        cancel: CancellationToken,
        mode: RunMode,
    ) -> Self {
        Self {
            probe,
            store,
            cancel,
            mode,
            state: SchedulerState::Idle,
            executions: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.probe.route().name
    }

    pub fn route(&self) -> &RouteConfig {
        self.probe.route()
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Runs until completion (one-shot) or cancellation (continuous).
    pub async fn run(mut self) -> SchedulerReport {
        self.transition(SchedulerState::Running);
        let interval = self.probe.route().interval;
        let cancel = self.cancel.clone();

        loop {
            if cancel.is_cancelled() {
                self.transition(SchedulerState::Stopping);
                break;
            }

            let started = Instant::now();
            self.run_once().await;

            if self.mode == RunMode::OneShot {
                self.transition(SchedulerState::Completed);
                return self.report();
            }

            // an interval past the clock's range means the next probe never comes
            let cancelled = match started.checked_add(interval) {
                Some(deadline) => tokio::select! {
                    _ = cancel.cancelled() => true,
                    _ = tokio::time::sleep_until(deadline) => false,
                },
                None => {
                    cancel.cancelled().await;
                    true
                }
            };
            if cancelled {
                self.transition(SchedulerState::Stopping);
                break;
            }
        }

        self.transition(SchedulerState::Stopped);
        self.report()
    }

    async fn run_once(&mut self) {
        let result = self.probe.execute().await;
        self.executions += 1;

        if let Err(err) = self.store.write(self.probe.route(), &result).await {
            error!(route = %self.name(), "Failed to persist probe result: {err}");
            return;
        }

        debug!(
            route = %self.name(),
            ok = result.ok(),
            status = ?result.status_code(),
            elapsed_ms = result.response_time_ms,
            "Stored probe result"
        );
    }

    fn transition(&mut self, next: SchedulerState) {
        debug!(route = %self.name(), from = ?self.state, to = ?next, "Scheduler state change");
        self.state = next;
        if next.is_terminal() {
            info!(route = %self.name(), state = ?next, executions = self.executions, "Monitor finished");
        }
    }

    fn report(&self) -> SchedulerReport {
        SchedulerReport {
            route: self.name().to_string(),
            state: self.state,
            executions: self.executions,
        }
    }
}
