use async_trait::async_trait;
use chrono::{DateTime, Utc};
use encoding_rs::{Encoding, UTF_8};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::config::{scalar_text, RouteConfig};
use crate::http_client::{
    FilePart, HttpClient, HttpResponse, MultipartBody, ProbeError, ProbeRequest, RequestBody,
};

pub const BINARY_PLACEHOLDER: &str = "<binary content>";
pub const TRUNCATION_MARKER: &str = "...";
pub const DEFAULT_MULTIPART_JSON_FIELD: &str = "json";
pub const DEFAULT_UPLOAD_CONTENT_TYPE: &str = "application/octet-stream";

/// How a single probe ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Success {
        status_code: u16,
        reason: Option<String>,
        body_excerpt: String,
        body_truncated: bool,
    },
    Failure {
        error: String,
    },
}

/// Outcome of one probe execution, as persisted for the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "ProbeRecord", try_from = "ProbeRecord")]
pub struct ProbeResult {
    pub name: String,
    pub url: String,
    pub method: String,
    pub timestamp: DateTime<Utc>,
    pub response_time_ms: f64,
    pub tags: Vec<String>,
    pub outcome: ProbeOutcome,
}

impl ProbeResult {
    pub fn new(
        route: &RouteConfig,
        timestamp: DateTime<Utc>,
        response_time_ms: f64,
        outcome: ProbeOutcome,
    ) -> Self {
        Self {
            name: route.name.clone(),
            url: route.url.clone(),
            method: route.method.clone(),
            timestamp,
            response_time_ms,
            tags: route.tags.clone(),
            outcome,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match &self.outcome {
            ProbeOutcome::Success { status_code, .. } => Some(*status_code),
            ProbeOutcome::Failure { .. } => None,
        }
    }

    /// True for a response with a status in [200, 400).
    pub fn ok(&self) -> bool {
        self.status_code()
            .is_some_and(|status| (200..400).contains(&status))
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            ProbeOutcome::Failure { error } => Some(error),
            ProbeOutcome::Success { .. } => None,
        }
    }
}

/// Flat wire shape of a [`ProbeResult`]; every key is always present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeRecord {
    pub name: String,
    pub url: String,
    pub method: String,
    pub timestamp: DateTime<Utc>,
    pub response_time_ms: f64,
    #[serde(default)]
    pub tags: Vec<String>,
    pub status_code: Option<u16>,
    pub reason: Option<String>,
    pub ok: bool,
    pub body_excerpt: Option<String>,
    pub body_truncated: bool,
    pub error: Option<String>,
}

impl From<ProbeResult> for ProbeRecord {
    fn from(result: ProbeResult) -> Self {
        let ok = result.ok();
        let (status_code, reason, body_excerpt, body_truncated, error) = match result.outcome {
            ProbeOutcome::Success {
                status_code,
                reason,
                body_excerpt,
                body_truncated,
            } => (Some(status_code), reason, Some(body_excerpt), body_truncated, None),
            ProbeOutcome::Failure { error } => (None, None, None, false, Some(error)),
        };

        Self {
            name: result.name,
            url: result.url,
            method: result.method,
            timestamp: result.timestamp,
            response_time_ms: result.response_time_ms,
            tags: result.tags,
            status_code,
            reason,
            ok,
            body_excerpt,
            body_truncated,
            error,
        }
    }
}

impl TryFrom<ProbeRecord> for ProbeResult {
    type Error = String;

    fn try_from(record: ProbeRecord) -> Result<Self, Self::Error> {
        let outcome = match (record.error, record.status_code) {
            (Some(error), _) => ProbeOutcome::Failure { error },
            (None, Some(status_code)) => ProbeOutcome::Success {
                status_code,
                reason: record.reason,
                body_excerpt: record.body_excerpt.unwrap_or_default(),
                body_truncated: record.body_truncated,
            },
            (None, None) => {
                return Err(format!(
                    "result for '{}' has neither status_code nor error",
                    record.name
                ))
            }
        };

        Ok(Self {
            name: record.name,
            url: record.url,
            method: record.method,
            timestamp: record.timestamp,
            response_time_ms: record.response_time_ms,
            tags: record.tags,
            outcome,
        })
    }
}

/// Decodes a response body and caps it at `max_chars` characters.
///
/// The declared `charset` is used when it names a known encoding, UTF-8
/// otherwise. Bodies that do not decode become [`BINARY_PLACEHOLDER`]. A cut
/// body gets [`TRUNCATION_MARKER`] appended and the flag set.
pub fn excerpt_body(body: &[u8], charset: Option<&str>, max_chars: usize) -> (String, bool) {
    let encoding = charset
        .and_then(|label| Encoding::for_label(label.as_bytes()))
        .unwrap_or(UTF_8);
    let decoded = encoding.decode_without_bom_handling_and_without_replacement(body);
    let text = decoded.as_deref().unwrap_or(BINARY_PLACEHOLDER);
    match text.char_indices().nth(max_chars.max(1)) {
        None => (text.to_string(), false),
        Some((cut, _)) => (format!("{}{TRUNCATION_MARKER}", &text[..cut]), true),
    }
}

/// Query pairs for a route's `params`; lists repeat their key, nulls are dropped.
pub fn query_pairs(params: &BTreeMap<String, Value>) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for (key, value) in params {
        match value {
            Value::Null => {}
            Value::Array(items) => pairs.extend(
                items
                    .iter()
                    .filter(|item| !item.is_null())
                    .map(|item| (key.clone(), scalar_text(item))),
            ),
            other => pairs.push((key.clone(), scalar_text(other))),
        }
    }
    pairs
}

/// Decides where a route's raw body and JSON payload go.
///
/// JSON precedence, highest first: the `json_query_param` query parameter, a
/// multipart field when a file is uploaded, then a native JSON body. Returns
/// the body plus the extra query pair carrying JSON, if any.
pub fn resolve_request_body(
    route: &RouteConfig,
    file: Option<FilePart>,
) -> (RequestBody, Option<(String, String)>) {
    let json_text = route.json_body.as_ref().map(Value::to_string);

    let (json_query, json_field, native_json) = match (&route.json_query_param, json_text) {
        (_, None) => (None, None, None),
        (Some(param), Some(text)) => (Some((param.clone(), text)), None, None),
        (None, Some(text)) if file.is_some() => {
            let field = route
                .multipart_json_field
                .clone()
                .unwrap_or_else(|| DEFAULT_MULTIPART_JSON_FIELD.to_string());
            (None, Some((field, text)), None)
        }
        (None, Some(_)) => (None, None, route.json_body.clone()),
    };

    let body = if let Some(file) = file {
        let mut fields = match &route.data {
            Some(Value::Object(map)) => map
                .iter()
                .filter(|(_, value)| !value.is_null())
                .map(|(key, value)| (key.clone(), scalar_text(value)))
                .collect(),
            _ => Vec::new(),
        };
        fields.extend(json_field);
        RequestBody::Multipart(MultipartBody { file, fields })
    } else if let Some(payload) = native_json {
        RequestBody::Json(payload)
    } else {
        match &route.data {
            None => RequestBody::Empty,
            Some(Value::Object(map)) => RequestBody::Form(
                map.iter()
                    .filter(|(_, value)| !value.is_null())
                    .map(|(key, value)| (key.clone(), scalar_text(value)))
                    .collect(),
            ),
            Some(other) => RequestBody::Raw(scalar_text(other)),
        }
    };

    (body, json_query)
}

#[async_trait]
pub trait Probe: Send + Sync {
    fn route(&self) -> &RouteConfig;

    /// Runs one probe. Failures are reported inside the result, never returned.
    async fn execute(&self) -> ProbeResult;
}

/// Sends one HTTP request per call and turns the exchange into a [`ProbeResult`].
pub struct ProbeExecutor {
    route: Arc<RouteConfig>,
    client: Box<dyn HttpClient>,
}

impl ProbeExecutor {
    pub fn new(route: Arc<RouteConfig>, client: Box<dyn HttpClient>) -> Self {
        let native_json = route.json_body.is_some()
            && route.json_query_param.is_none()
            && route.file_upload.is_none();
        if native_json && route.data.is_some() {
            warn!(route = %route.name, "Both 'data' and 'json' are set; the raw body is ignored");
        }
        if route.file_upload.is_some() && matches!(route.data, Some(ref data) if !data.is_object()) {
            warn!(route = %route.name, "Non-mapping 'data' cannot be sent with a file upload and is ignored");
        }
        Self { route, client }
    }

    async fn build_request(&self) -> Result<ProbeRequest, ProbeError> {
        let route = self.route.as_ref();

        let file = match &route.file_upload {
            Some(upload) => {
                let path = upload.resolved_path();
                let bytes = tokio::fs::read(&path)
                    .await
                    .map_err(|source| ProbeError::Io { path, source })?;
                Some(FilePart {
                    field_name: upload.field_name.clone(),
                    file_name: upload.file_name(),
                    content_type: upload
                        .content_type
                        .clone()
                        .unwrap_or_else(|| DEFAULT_UPLOAD_CONTENT_TYPE.to_string()),
                    bytes,
                })
            }
            None => None,
        };

        let (body, json_query) = resolve_request_body(route, file);
        let mut query = query_pairs(&route.params);
        query.extend(json_query);

        Ok(ProbeRequest {
            method: route.method.clone(),
            url: route.url.clone(),
            headers: (!route.headers.is_empty()).then(|| route.headers.clone()),
            query: (!query.is_empty()).then_some(query),
            body,
            basic_auth: route.basic_auth.clone(),
            timeout: route.timeout,
        })
    }

    fn success(&self, response: HttpResponse) -> ProbeOutcome {
        let (body_excerpt, body_truncated) = excerpt_body(
            &response.body,
            response.charset.as_deref(),
            self.route.body_max_chars,
        );
        ProbeOutcome::Success {
            status_code: response.status_code,
            reason: response.reason,
            body_excerpt,
            body_truncated,
        }
    }
}

#[async_trait]
impl Probe for ProbeExecutor {
    fn route(&self) -> &RouteConfig {
        &self.route
    }

    async fn execute(&self) -> ProbeResult {
        let timestamp = Utc::now();
        let started = Instant::now();

        let exchange = match self.build_request().await {
            Ok(request) => self.client.execute(request).await,
            Err(err) => Err(err),
        };

        let response_time_ms = round_millis(started.elapsed().as_secs_f64() * 1000.0);

        let outcome = match exchange {
            Ok(response) => {
                debug!(
                    route = %self.route.name,
                    status = response.status_code,
                    elapsed_ms = response_time_ms,
                    "Probe completed"
                );
                self.success(response)
            }
            Err(err) => {
                warn!(
                    route = %self.route.name,
                    url = %self.route.url,
                    elapsed_ms = response_time_ms,
                    "Probe failed: {err}"
                );
                ProbeOutcome::Failure {
                    error: err.to_string(),
                }
            }
        };

        ProbeResult::new(&self.route, timestamp, response_time_ms, outcome)
    }
}

fn round_millis(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileUpload;
    use crate::http_client::MockHttpClient;
    use serde_json::json;
    use std::path::PathBuf;

    fn executor(route: RouteConfig, client: MockHttpClient) -> ProbeExecutor {
        ProbeExecutor::new(Arc::new(route), Box::new(client))
    }

    fn file_part() -> FilePart {
        FilePart {
            field_name: "file".into(),
            file_name: "a.bin".into(),
            content_type: DEFAULT_UPLOAD_CONTENT_TYPE.into(),
            bytes: vec![1, 2, 3],
        }
    }

    #[test]
    fn test_excerpt_truncates_with_marker() {
        assert_eq!(excerpt_body(b"abcdefgh", None, 5), ("abcde...".to_string(), true));
        assert_eq!(excerpt_body(b"abcde", None, 5), ("abcde".to_string(), false));
        assert_eq!(excerpt_body(b"", None, 5), (String::new(), false));
    }

    #[test]
    fn test_excerpt_counts_characters_not_bytes() {
        let (excerpt, truncated) = excerpt_body("привет".as_bytes(), None, 3);
        assert_eq!(excerpt, "при...");
        assert!(truncated);
    }

    #[test]
    fn test_excerpt_binary_placeholder() {
        let (excerpt, truncated) = excerpt_body(&[0xff, 0xfe, 0x00], None, 2048);
        assert_eq!(excerpt, BINARY_PLACEHOLDER);
        assert!(!truncated);

        // unknown labels fall back to UTF-8
        let (excerpt, _) = excerpt_body(&[0xff, 0xfe, 0x00], Some("x-no-such-charset"), 2048);
        assert_eq!(excerpt, BINARY_PLACEHOLDER);
    }

    #[test]
    fn test_excerpt_uses_declared_charset() {
        let latin1 = [b'c', b'a', b'f', 0xe9];
        assert_eq!(excerpt_body(&latin1, Some("iso-8859-1"), 2048), ("café".to_string(), false));
        assert_eq!(excerpt_body(&latin1, None, 2048).0, BINARY_PLACEHOLDER);

        let cyrillic = [0xef, 0xf0, 0xe8, 0xe2, 0xe5, 0xf2];
        assert_eq!(
            excerpt_body(&cyrillic, Some("windows-1251"), 3),
            ("при...".to_string(), true)
        );
    }

    #[test]
    fn test_query_pairs_expand_lists() {
        let params: BTreeMap<String, Value> = serde_json::from_value(json!({
            "id": [1, 2],
            "q": "text",
            "flag": true,
            "skip": null
        }))
        .unwrap();

        assert_eq!(
            query_pairs(&params),
            vec![
                ("flag".to_string(), "true".to_string()),
                ("id".to_string(), "1".to_string()),
                ("id".to_string(), "2".to_string()),
                ("q".to_string(), "text".to_string()),
            ]
        );
    }

    #[test]
    fn test_file_and_json_become_multipart_field() {
        let mut route = RouteConfig::new("upload", "http://x");
        route.json_body = Some(json!({"a": 1}));

        let (body, json_query) = resolve_request_body(&route, Some(file_part()));

        assert!(json_query.is_none());
        match body {
            RequestBody::Multipart(multipart) => {
                assert_eq!(multipart.fields, vec![("json".to_string(), r#"{"a":1}"#.to_string())]);
                assert_eq!(multipart.file.field_name, "file");
            }
            other => panic!("expected multipart body, got {other:?}"),
        }
    }

    #[test]
    fn test_custom_multipart_json_field() {
        let mut route = RouteConfig::new("upload", "http://x");
        route.json_body = Some(json!([1]));
        route.multipart_json_field = Some("meta".into());
        route.data = Some(json!({"kind": "report"}));

        let (body, _) = resolve_request_body(&route, Some(file_part()));
        let RequestBody::Multipart(multipart) = body else {
            panic!("expected multipart body");
        };
        assert_eq!(
            multipart.fields,
            vec![
                ("kind".to_string(), "report".to_string()),
                ("meta".to_string(), "[1]".to_string()),
            ]
        );
    }

    #[test]
    fn test_json_query_param_wins() {
        let mut route = RouteConfig::new("q", "http://x");
        route.json_body = Some(json!({"a": 1}));
        route.json_query_param = Some("payload".into());
        route.data = Some(json!("raw"));

        let (body, json_query) = resolve_request_body(&route, Some(file_part()));
        assert_eq!(json_query, Some(("payload".to_string(), r#"{"a":1}"#.to_string())));
        let RequestBody::Multipart(multipart) = body else {
            panic!("expected multipart body");
        };
        assert!(multipart.fields.is_empty());
    }

    #[test]
    fn test_native_json_drops_raw_data() {
        let mut route = RouteConfig::new("j", "http://x");
        route.json_body = Some(json!({"a": 1}));
        route.data = Some(json!("raw"));

        let (body, json_query) = resolve_request_body(&route, None);
        assert_eq!(body, RequestBody::Json(json!({"a": 1})));
        assert!(json_query.is_none());
    }

    #[test]
    fn test_raw_and_form_data() {
        let mut route = RouteConfig::new("d", "http://x");
        assert_eq!(resolve_request_body(&route, None).0, RequestBody::Empty);

        route.data = Some(json!("plain text"));
        assert_eq!(
            resolve_request_body(&route, None).0,
            RequestBody::Raw("plain text".into())
        );

        route.data = Some(json!({"k": "v", "n": 2}));
        assert_eq!(
            resolve_request_body(&route, None).0,
            RequestBody::Form(vec![("k".into(), "v".into()), ("n".into(), "2".into())])
        );
    }

    #[tokio::test]
    async fn test_execute_success() {
        let mut route = RouteConfig::new("api", "http://example.com/health");
        route.tags = vec!["core".into()];
        route.body_max_chars = 5;
        let client = MockHttpClient::new().with_response("http://example.com/health", 200, "abcdefgh");

        let result = executor(route, client).execute().await;

        assert_eq!(result.name, "api");
        assert_eq!(result.tags, vec!["core".to_string()]);
        assert!(result.ok());
        assert!(result.error().is_none());
        assert!(result.response_time_ms >= 0.0);
        assert_eq!(
            result.outcome,
            ProbeOutcome::Success {
                status_code: 200,
                reason: Some("OK".into()),
                body_excerpt: "abcde...".into(),
                body_truncated: true,
            }
        );
    }

    #[tokio::test]
    async fn test_execute_decodes_latin1_response() {
        let route = RouteConfig::new("legacy", "http://example.com/legacy");
        let client = MockHttpClient::new().with_encoded_response(
            "http://example.com/legacy",
            200,
            vec![b'c', b'a', b'f', 0xe9],
            "ISO-8859-1",
        );

        let result = executor(route, client).execute().await;

        assert_eq!(
            result.outcome,
            ProbeOutcome::Success {
                status_code: 200,
                reason: Some("OK".into()),
                body_excerpt: "café".into(),
                body_truncated: false,
            }
        );
    }

    #[tokio::test]
    async fn test_execute_redirect_status_is_ok() {
        let route = RouteConfig::new("moved", "http://example.com");
        let client = MockHttpClient::new().with_default_response(302, "");

        let result = executor(route, client).execute().await;
        assert!(result.ok());
    }

    #[tokio::test]
    async fn test_execute_server_error_is_not_ok() {
        let route = RouteConfig::new("api", "http://example.com");
        let client = MockHttpClient::new().with_default_response(503, "down");

        let result = executor(route, client).execute().await;
        assert_eq!(result.status_code(), Some(503));
        assert!(!result.ok());
        assert!(result.error().is_none());
    }

    #[tokio::test]
    async fn test_execute_transport_failure() {
        let route = RouteConfig::new("api", "http://unreachable");
        let client = MockHttpClient::new().with_error("http://unreachable", "connection refused");

        let result = executor(route, client).execute().await;
        assert_eq!(result.status_code(), None);
        assert!(!result.ok());
        assert_eq!(result.error(), Some("connection refused"));
    }

    #[tokio::test]
    async fn test_execute_missing_upload_file_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut route = RouteConfig::new("upload", "http://example.com");
        route.file_upload = Some(FileUpload {
            path: dir.path().join("missing.bin"),
            field_name: "file".into(),
            content_type: None,
        });
        let client = MockHttpClient::new().with_default_response(200, "ok");
        let recorded = client.recorded();

        let result = executor(route, client).execute().await;

        assert!(result.error().is_some_and(|e| e.contains("missing.bin")));
        assert!(recorded.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_execute_sends_upload_with_json_field() {
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("report.csv");
        std::fs::write(&path, "a,b\n").unwrap();

        let mut route = RouteConfig::new("upload", "http://example.com/upload");
        route.method = "POST".into();
        route.json_body = Some(json!({"id": 7}));
        route.file_upload = Some(FileUpload {
            path,
            field_name: "document".into(),
            content_type: Some("text/csv".into()),
        });
        let client = MockHttpClient::new().with_response("http://example.com/upload", 201, "");
        let recorded = client.recorded();

        let result = executor(route, client).execute().await;
        assert!(result.ok());

        let requests = recorded.lock().unwrap();
        let RequestBody::Multipart(multipart) = &requests[0].body else {
            panic!("expected multipart body, got {:?}", requests[0].body);
        };
        assert_eq!(multipart.file.field_name, "document");
        assert_eq!(multipart.file.file_name, "report.csv");
        assert_eq!(multipart.file.content_type, "text/csv");
        assert_eq!(multipart.file.bytes, b"a,b\n");
        assert_eq!(multipart.fields, vec![("json".to_string(), r#"{"id":7}"#.to_string())]);
    }

    #[tokio::test]
    async fn test_execute_normalises_empty_headers_and_params() {
        let route = RouteConfig::new("plain", "http://example.com");
        let client = MockHttpClient::new().with_default_response(200, "ok");
        let recorded = client.recorded();

        executor(route, client).execute().await;

        let requests = recorded.lock().unwrap();
        assert!(requests[0].headers.is_none());
        assert!(requests[0].query.is_none());
        assert_eq!(requests[0].body, RequestBody::Empty);
    }

    #[test]
    fn test_record_shape() {
        let route = RouteConfig::new("api", "http://x");
        let failure = ProbeResult::new(
            &route,
            Utc::now(),
            12.5,
            ProbeOutcome::Failure {
                error: "timed out".into(),
            },
        );

        let value = serde_json::to_value(&failure).unwrap();
        assert_eq!(value["status_code"], Value::Null);
        assert_eq!(value["reason"], Value::Null);
        assert_eq!(value["ok"], json!(false));
        assert_eq!(value["body_excerpt"], Value::Null);
        assert_eq!(value["body_truncated"], json!(false));
        assert_eq!(value["error"], json!("timed out"));

        let parsed: ProbeResult = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, failure);
    }

    #[test]
    fn test_record_without_branch_is_rejected() {
        let value = json!({
            "name": "x", "url": "http://x", "method": "GET",
            "timestamp": "2024-01-01T00:00:00Z", "response_time_ms": 1.0,
            "status_code": null, "reason": null, "ok": false,
            "body_excerpt": null, "body_truncated": false, "error": null
        });
        assert!(serde_json::from_value::<ProbeResult>(value).is_err());
    }

    #[test]
    fn test_round_millis() {
        assert_eq!(round_millis(12.3456), 12.35);
        assert_eq!(round_millis(0.001), 0.0);
    }
}
