pub mod config;
pub mod http_client;
pub mod logging;
pub mod probe;
pub mod registry;
pub mod result_store;
pub mod scheduler;
pub mod settings;
pub mod supervisor;

pub use config::{load_config, ConfigError, MonitoringConfig, RouteConfig};
pub use http_client::{HttpClient, MockHttpClient, ProbeError, ReqwestHttpClient};
pub use probe::{Probe, ProbeExecutor, ProbeOutcome, ProbeResult};
pub use registry::MonitorRegistry;
pub use result_store::{FileResultStore, MemoryResultStore, ResultStore, StoreError};
pub use scheduler::{RouteScheduler, RunMode, SchedulerState};
pub use settings::RunSettings;
pub use supervisor::{Supervisor, SupervisorReport};
