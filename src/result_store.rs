use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::config::RouteConfig;
use crate::probe::ProbeResult;

pub const SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_RESULTS_FILE: &str = "monitoring_results.json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize results: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("store rejected write: {0}")]
    Rejected(String),
}

/// Keeps the latest probe result per route name.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Stores `result` under the route's name, replacing any earlier result.
    async fn write(&self, route: &RouteConfig, result: &ProbeResult) -> Result<(), StoreError>;

    async fn read_all(&self) -> Result<BTreeMap<String, ProbeResult>, StoreError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputLayout {
    SingleFile(PathBuf),
    Directory(PathBuf),
}

impl OutputLayout {
    /// A target is a directory when it already is one or is spelled with a
    /// trailing path separator.
    pub fn detect(output: &Path) -> Self {
        if output.exists() {
            return if output.is_dir() {
                OutputLayout::Directory(output.to_path_buf())
            } else {
                OutputLayout::SingleFile(output.to_path_buf())
            };
        }
        let raw = output.as_os_str().to_string_lossy();
        if raw.ends_with('/') || raw.ends_with(std::path::MAIN_SEPARATOR) {
            OutputLayout::Directory(output.to_path_buf())
        } else {
            OutputLayout::SingleFile(output.to_path_buf())
        }
    }
}

/// JSON files read by the external collector.
///
/// Every write is a read-modify-write of one file, serialised with all other
/// writes of this store by a single lock.
pub struct FileResultStore {
    layout: OutputLayout,
    schema_version: u32,
    written: tokio::sync::Mutex<BTreeSet<PathBuf>>,
}

impl FileResultStore {
    pub fn new(output: impl AsRef<Path>) -> Result<Self, StoreError> {
        let layout = OutputLayout::detect(output.as_ref());

        let dir = match &layout {
            OutputLayout::Directory(dir) => Some(dir.as_path()),
            OutputLayout::SingleFile(file) => file.parent().filter(|p| !p.as_os_str().is_empty()),
        };
        if let Some(dir) = dir {
            std::fs::create_dir_all(dir).map_err(|source| StoreError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        debug!(layout = ?layout, "Result store ready");
        Ok(Self {
            layout,
            schema_version: SCHEMA_VERSION,
            written: tokio::sync::Mutex::new(BTreeSet::new()),
        })
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    /// File receiving a route's results.
    ///
    /// In directory mode this is `<label parent>/<label stem>.json` under the
    /// output directory, or [`DEFAULT_RESULTS_FILE`] for unlabelled routes.
    pub fn target_file(&self, route: &RouteConfig) -> PathBuf {
        let base = match &self.layout {
            OutputLayout::SingleFile(file) => return file.clone(),
            OutputLayout::Directory(dir) => dir,
        };

        let Some(label) = route.source_label.as_deref().filter(|l| !l.is_empty()) else {
            return base.join(DEFAULT_RESULTS_FILE);
        };

        let relative = Path::new(label);
        let stem = relative
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| label.to_string());
        let parent = relative.parent().unwrap_or_else(|| Path::new(""));
        base.join(parent).join(format!("{stem}.json"))
    }

    async fn read_state(&self, path: &Path) -> Result<Map<String, Value>, StoreError> {
        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(self.empty_state()),
            Err(source) => {
                return Err(StoreError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        match serde_json::from_slice::<Value>(&content) {
            Ok(Value::Object(state)) => Ok(state),
            Ok(_) | Err(_) => {
                warn!(file = %path.display(), "Results file is corrupt, starting from an empty state");
                Ok(self.empty_state())
            }
        }
    }

    fn empty_state(&self) -> Map<String, Value> {
        let mut state = Map::new();
        state.insert("routes".to_string(), Value::Object(Map::new()));
        state.insert("schema_version".to_string(), json!(self.schema_version));
        state
    }
}

#[async_trait]
impl ResultStore for FileResultStore {
    async fn write(&self, route: &RouteConfig, result: &ProbeResult) -> Result<(), StoreError> {
        let target = self.target_file(route);
        let mut written = self.written.lock().await;

        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let mut state = self.read_state(&target).await?;
        let mut routes = match state.remove("routes") {
            Some(Value::Object(routes)) => routes,
            _ => Map::new(),
        };
        routes.insert(route.name.clone(), serde_json::to_value(result)?);
        state.insert("routes".to_string(), Value::Object(routes));
        state.insert("last_updated".to_string(), serde_json::to_value(result.timestamp)?);
        state.insert("schema_version".to_string(), json!(self.schema_version));

        let content = serde_json::to_string_pretty(&Value::Object(state))?;
        replace_file(&target, content).await?;

        written.insert(target);
        Ok(())
    }

    async fn read_all(&self) -> Result<BTreeMap<String, ProbeResult>, StoreError> {
        let written = self.written.lock().await;
        let files: Vec<PathBuf> = match &self.layout {
            OutputLayout::SingleFile(file) => vec![file.clone()],
            OutputLayout::Directory(_) => written.iter().cloned().collect(),
        };

        let mut results = BTreeMap::new();
        for file in files {
            let mut state = self.read_state(&file).await?;
            let Some(Value::Object(routes)) = state.remove("routes") else {
                continue;
            };
            for (name, value) in routes {
                match serde_json::from_value::<ProbeResult>(value) {
                    Ok(result) => {
                        results.insert(name, result);
                    }
                    Err(err) => debug!(route = %name, file = %file.display(), "Skipping unreadable result: {err}"),
                }
            }
        }
        Ok(results)
    }
}

/// Writes next to `target` and renames over it so readers never see a partial file.
async fn replace_file(target: &Path, content: String) -> Result<(), StoreError> {
    let mut staging = target.as_os_str().to_owned();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);

    tokio::fs::write(&staging, content)
        .await
        .map_err(|source| StoreError::Write {
            path: staging.clone(),
            source,
        })?;
    tokio::fs::rename(&staging, target)
        .await
        .map_err(|source| StoreError::Write {
            path: target.to_path_buf(),
            source,
        })
}

/// In-process store keeping results in a map and a log of every write.
#[derive(Default)]
pub struct MemoryResultStore {
    results: Mutex<BTreeMap<String, ProbeResult>>,
    writes: Mutex<Vec<String>>,
    reject_writes: bool,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose every write fails.
    pub fn rejecting() -> Self {
        Self {
            reject_writes: true,
            ..Self::default()
        }
    }

    /// Route names in the order their results were written.
    pub fn writes(&self) -> Vec<String> {
        self.writes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn write_count(&self, route: &str) -> usize {
        self.writes().iter().filter(|name| name.as_str() == route).count()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn write(&self, route: &RouteConfig, result: &ProbeResult) -> Result<(), StoreError> {
        self.writes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(route.name.clone());
        if self.reject_writes {
            return Err(StoreError::Rejected(format!("write for '{}'", route.name)));
        }
        self.results
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(route.name.clone(), result.clone());
        Ok(())
    }

    async fn read_all(&self) -> Result<BTreeMap<String, ProbeResult>, StoreError> {
        Ok(self
            .results
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone())
    }
}
