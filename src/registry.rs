use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{ConfigError, RouteConfig};
use crate::http_client::ReqwestHttpClient;
use crate::probe::{Probe, ProbeExecutor};

pub type ProbeBuilder =
    Box<dyn Fn(Arc<RouteConfig>) -> Result<Box<dyn Probe>, ConfigError> + Send + Sync>;

/// Maps a route's `type` to the constructor of its probe.
pub struct MonitorRegistry {
    builders: BTreeMap<String, ProbeBuilder>,
}

impl MonitorRegistry {
    pub fn empty() -> Self {
        Self {
            builders: BTreeMap::new(),
        }
    }

    pub fn register<F>(&mut self, kind: &str, builder: F)
    where
        F: Fn(Arc<RouteConfig>) -> Result<Box<dyn Probe>, ConfigError> + Send + Sync + 'static,
    {
        self.builders.insert(kind.to_lowercase(), Box::new(builder));
    }

    pub fn build(&self, route: &RouteConfig) -> Result<Box<dyn Probe>, ConfigError> {
        let builder = self
            .builders
            .get(&route.monitor_kind)
            .ok_or_else(|| ConfigError::UnknownMonitorKind {
                route: route.name.clone(),
                kind: route.monitor_kind.clone(),
            })?;
        builder(Arc::new(route.clone()))
    }
}

impl Default for MonitorRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("http", build_http_probe);
        registry
    }
}

/// Real HTTP probe with its own connection pool.
///
/// The upload file must be readable and the CA bundle, when present, must
/// parse; otherwise the route is rejected before anything is scheduled.
pub fn build_http_probe(route: Arc<RouteConfig>) -> Result<Box<dyn Probe>, ConfigError> {
    if let Some(upload) = &route.file_upload {
        let path = upload.resolved_path();
        std::fs::File::open(&path).map_err(|e| ConfigError::Resolution {
            route: route.name.clone(),
            message: format!("upload file {}: {e}", path.display()),
        })?;
    }

    let client = ReqwestHttpClient::for_route(&route).map_err(|e| ConfigError::Resolution {
        route: route.name.clone(),
        message: e.to_string(),
    })?;

    Ok(Box::new(ProbeExecutor::new(route, Box::new(client))))
}
