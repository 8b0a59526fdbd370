use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_INTERVAL_SECS: f64 = 60.0;
pub const DEFAULT_TIMEOUT_SECS: f64 = 10.0;
pub const DEFAULT_BODY_MAX_CHARS: usize = 2048;
pub const DEFAULT_UPLOAD_FIELD: &str = "file";
pub const DEFAULT_MONITOR_KIND: &str = "http";

const MIN_PERIOD_SECS: f64 = 1.0;
const SUPPORTED_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file or directory not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported config format: {0}")]
    UnsupportedFormat(PathBuf),

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("config file {0} must contain a 'routes' section")]
    MissingRoutes(PathBuf),

    #[error("directory {0} does not contain config files (*.yaml, *.yml, *.json)")]
    EmptyDirectory(PathBuf),

    #[error("config does not contain any routes")]
    NoRoutes,

    #[error("route #{index} in {source_label}: {message}")]
    InvalidRoute {
        source_label: String,
        index: usize,
        message: String,
    },

    #[error("invalid JSON content in {path}: {source}")]
    InvalidJsonFile {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported monitor type '{kind}' for route '{route}'")]
    UnknownMonitorKind { route: String, kind: String },

    #[error("route '{route}' cannot be prepared: {message}")]
    Resolution { route: String, message: String },
}

/// File sent as multipart form data with every probe of a route.
#[derive(Debug, Clone, PartialEq)]
pub struct FileUpload {
    pub path: PathBuf,
    pub field_name: String,
    pub content_type: Option<String>,
}

impl FileUpload {
    /// Expands a leading `~` and anchors relative paths at the working directory.
    pub fn resolved_path(&self) -> PathBuf {
        let expanded = expand_home(&self.path);
        if expanded.is_absolute() {
            return expanded;
        }
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(expanded),
            Err(_) => expanded,
        }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.field_name.clone())
    }
}

#[derive(Clone, PartialEq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// One probe target and the shape of the request sent to it.
///
/// Route names are expected to be unique per results file. Two routes with the
/// same name overwrite each other's stored result; the loader warns about it
/// but keeps both routes.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteConfig {
    pub name: String,
    pub url: String,
    pub method: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub headers: BTreeMap<String, String>,
    pub params: BTreeMap<String, Value>,
    pub data: Option<Value>,
    pub json_body: Option<Value>,
    pub json_query_param: Option<String>,
    pub allow_redirects: bool,
    pub verify_ssl: bool,
    pub ca_bundle: Option<PathBuf>,
    pub description: Option<String>,
    pub enabled: bool,
    pub body_max_chars: usize,
    pub file_upload: Option<FileUpload>,
    pub basic_auth: Option<BasicAuth>,
    pub multipart_json_field: Option<String>,
    pub tags: Vec<String>,
    pub monitor_kind: String,
    pub source_label: Option<String>,
}

impl RouteConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            method: "GET".to_string(),
            interval: Duration::from_secs_f64(DEFAULT_INTERVAL_SECS),
            timeout: Duration::from_secs_f64(DEFAULT_TIMEOUT_SECS),
            headers: BTreeMap::new(),
            params: BTreeMap::new(),
            data: None,
            json_body: None,
            json_query_param: None,
            allow_redirects: true,
            verify_ssl: true,
            ca_bundle: None,
            description: None,
            enabled: true,
            body_max_chars: DEFAULT_BODY_MAX_CHARS,
            file_upload: None,
            basic_auth: None,
            multipart_json_field: None,
            tags: Vec::new(),
            monitor_kind: DEFAULT_MONITOR_KIND.to_string(),
            source_label: None,
        }
    }

    /// Builds a route from one entry of a `routes` list.
    ///
    /// `base_dir` is the directory of the defining config file; string `json`
    /// payloads naming a file there are replaced by the file's parsed content.
    pub fn from_value(
        raw: Value,
        index: usize,
        source_label: Option<&str>,
        base_dir: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        let label = source_label.unwrap_or("<inline>").to_string();
        let invalid = |message: String| ConfigError::InvalidRoute {
            source_label: label.clone(),
            index,
            message,
        };

        let raw: RawRoute = serde_json::from_value(raw).map_err(|e| invalid(e.to_string()))?;

        let name = raw
            .name
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| invalid("missing required field 'name'".to_string()))?;
        let url = raw
            .url
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| invalid(format!("route '{name}' is missing required field 'url'")))?;

        let interval = floored_duration(raw.interval.unwrap_or(DEFAULT_INTERVAL_SECS))
            .map_err(|e| invalid(format!("invalid interval: {e}")))?;
        let timeout = floored_duration(raw.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS))
            .map_err(|e| invalid(format!("invalid timeout: {e}")))?;

        let body_max_chars = raw
            .body_max_chars
            .unwrap_or(DEFAULT_BODY_MAX_CHARS as i64)
            .max(1) as usize;

        let json_body = match raw.json {
            Some(payload) => Some(resolve_json_payload(payload, base_dir)?),
            None => None,
        };

        let file_upload = raw.file_upload.map(|upload| FileUpload {
            path: PathBuf::from(upload.path),
            field_name: upload
                .field_name
                .unwrap_or_else(|| DEFAULT_UPLOAD_FIELD.to_string()),
            content_type: upload.content_type,
        });

        let basic_auth = raw.basic_auth.map(|auth| BasicAuth {
            username: auth.username,
            password: auth.password,
        });

        Ok(Self {
            name,
            url,
            method: raw
                .method
                .unwrap_or_else(|| "GET".to_string())
                .to_uppercase(),
            interval,
            timeout,
            headers: raw
                .headers
                .into_iter()
                .filter(|(_, value)| !value.is_null())
                .map(|(key, value)| (key, scalar_text(&value)))
                .collect(),
            params: raw.params,
            data: raw.data.filter(|data| !data.is_null()),
            json_body,
            json_query_param: raw.json_query_param.filter(|p| !p.is_empty()),
            allow_redirects: raw.allow_redirects.unwrap_or(true),
            verify_ssl: raw.verify_ssl.unwrap_or(true),
            ca_bundle: raw.ca_bundle.filter(|p| !p.is_empty()).map(PathBuf::from),
            description: raw.description,
            enabled: raw.enabled.unwrap_or(true),
            body_max_chars,
            file_upload,
            basic_auth,
            multipart_json_field: raw.multipart_json_field.filter(|f| !f.is_empty()),
            tags: raw.tags,
            monitor_kind: raw
                .kind
                .unwrap_or_else(|| DEFAULT_MONITOR_KIND.to_string())
                .to_lowercase(),
            source_label: source_label.map(str::to_string),
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawRoute {
    name: Option<String>,
    url: Option<String>,
    method: Option<String>,
    interval: Option<f64>,
    timeout: Option<f64>,
    #[serde(default)]
    headers: BTreeMap<String, Value>,
    #[serde(default)]
    params: BTreeMap<String, Value>,
    #[serde(default, alias = "body")]
    data: Option<Value>,
    #[serde(default)]
    json: Option<Value>,
    #[serde(default, alias = "json_param")]
    json_query_param: Option<String>,
    allow_redirects: Option<bool>,
    verify_ssl: Option<bool>,
    #[serde(default, alias = "ca_cert", alias = "verify_path")]
    ca_bundle: Option<String>,
    description: Option<String>,
    enabled: Option<bool>,
    #[serde(default, alias = "max_response_chars")]
    body_max_chars: Option<i64>,
    #[serde(default, alias = "file")]
    file_upload: Option<RawFileUpload>,
    #[serde(default, alias = "auth")]
    basic_auth: Option<RawBasicAuth>,
    #[serde(default, alias = "json_field")]
    multipart_json_field: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawFileUpload {
    path: String,
    field_name: Option<String>,
    content_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawBasicAuth {
    username: String,
    password: String,
}

/// Every route found at a config location, enabled or not.
#[derive(Debug, Clone, Default)]
pub struct MonitoringConfig {
    pub routes: Vec<RouteConfig>,
}

impl MonitoringConfig {
    pub fn enabled_routes(&self) -> Vec<RouteConfig> {
        self.routes.iter().filter(|r| r.enabled).cloned().collect()
    }

    /// Names used by more than one route, in first-seen order.
    pub fn duplicate_names(&self) -> Vec<String> {
        let mut seen: HashMap<&str, usize> = HashMap::new();
        let mut duplicates = Vec::new();
        for route in &self.routes {
            let count = seen.entry(route.name.as_str()).or_insert(0);
            *count += 1;
            if *count == 2 {
                duplicates.push(route.name.clone());
            }
        }
        duplicates
    }
}

/// Loads routes from a YAML/JSON file or from every such file under a directory.
///
/// Files in a directory are read in path order and each route is labelled with
/// the file's path relative to the directory. A single file labels its routes
/// with its file name.
pub fn load_config(config_path: impl AsRef<Path>) -> Result<MonitoringConfig, ConfigError> {
    let path = expand_home(config_path.as_ref());
    if !path.exists() {
        return Err(ConfigError::NotFound(path));
    }

    let mut routes = Vec::new();

    if path.is_file() {
        let label = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        routes.extend(load_routes_from_file(&path, &label)?);
    } else {
        let mut files = Vec::new();
        collect_config_files(&path, &mut files)?;
        files.sort();
        if files.is_empty() {
            return Err(ConfigError::EmptyDirectory(path));
        }
        for file in files {
            let label = file
                .strip_prefix(&path)
                .unwrap_or(&file)
                .components()
                .map(|part| part.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            routes.extend(load_routes_from_file(&file, &label)?);
        }
    }

    if routes.is_empty() {
        return Err(ConfigError::NoRoutes);
    }

    let config = MonitoringConfig { routes };
    for name in config.duplicate_names() {
        warn!(route = %name, "Route name is used more than once; results will overwrite each other");
    }
    Ok(config)
}

fn collect_config_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), ConfigError> {
    let entries = std::fs::read_dir(dir).map_err(|source| ConfigError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let candidate = entry.path();
        if candidate.is_dir() {
            collect_config_files(&candidate, files)?;
        } else if has_supported_extension(&candidate) {
            files.push(candidate);
        }
    }
    Ok(())
}

fn has_supported_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
}

fn read_document(path: &Path) -> Result<Value, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    let parse_error = |message: String| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    };

    let document = match extension.as_str() {
        "yaml" | "yml" => {
            serde_yaml::from_str::<Value>(&content).map_err(|e| parse_error(e.to_string()))?
        }
        "json" if content.trim().is_empty() => Value::Null,
        "json" => serde_json::from_str::<Value>(&content).map_err(|e| parse_error(e.to_string()))?,
        _ => return Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
    };

    Ok(match document {
        Value::Null => Value::Object(Default::default()),
        other => other,
    })
}

fn load_routes_from_file(path: &Path, source_label: &str) -> Result<Vec<RouteConfig>, ConfigError> {
    let document = read_document(path)?;
    let entries = match document.get("routes") {
        Some(Value::Array(entries)) => entries.clone(),
        Some(Value::Null) => Vec::new(),
        Some(_) => {
            return Err(ConfigError::Parse {
                path: path.to_path_buf(),
                message: "'routes' must be a list".to_string(),
            })
        }
        None => return Err(ConfigError::MissingRoutes(path.to_path_buf())),
    };

    let base_dir = path.parent();
    let routes = entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| RouteConfig::from_value(entry, index, Some(source_label), base_dir))
        .collect::<Result<Vec<_>, _>>()?;

    debug!(file = %path.display(), routes = routes.len(), "Loaded routes");
    Ok(routes)
}

/// Replaces a string payload naming an existing file with that file's JSON.
fn resolve_json_payload(payload: Value, base_dir: Option<&Path>) -> Result<Value, ConfigError> {
    let Value::String(raw) = &payload else {
        return Ok(payload);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(payload);
    }

    let direct = expand_home(Path::new(trimmed));
    let mut candidates = vec![direct.clone()];
    if !direct.is_absolute() {
        if let Some(base) = base_dir {
            candidates.push(base.join(&direct));
        }
    }

    for candidate in candidates {
        if candidate.is_file() {
            let content = std::fs::read_to_string(&candidate).map_err(|source| ConfigError::Io {
                path: candidate.clone(),
                source,
            })?;
            let content = if content.trim().is_empty() { "null" } else { content.as_str() };
            return serde_json::from_str(content).map_err(|source| ConfigError::InvalidJsonFile {
                path: candidate,
                source,
            });
        }
    }

    Ok(payload)
}

fn floored_duration(seconds: f64) -> Result<Duration, std::time::TryFromFloatSecsError> {
    Duration::try_from_secs_f64(seconds.max(MIN_PERIOD_SECS))
}

/// Textual form of a scalar config value: strings unquoted, everything else as JSON.
pub(crate) fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}
