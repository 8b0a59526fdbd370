use async_trait::async_trait;
use reqwest::{redirect, Certificate, Client, Method};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::error::Error as StdError;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

use crate::config::{BasicAuth, RouteConfig};

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("{0}")]
    Transport(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ProbeError {
    /// Flattens an error and its sources into one line.
    pub fn transport(err: impl StdError) -> Self {
        let mut message = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            let text = cause.to_string();
            if !message.contains(&text) {
                message.push_str(": ");
                message.push_str(&text);
            }
            source = cause.source();
        }
        ProbeError::Transport(message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientBuildError {
    #[error("failed to read CA bundle {path}: {source}")]
    CaBundle {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid CA bundle {path}: {source}")]
    InvalidCaBundle {
        path: PathBuf,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilePart {
    pub field_name: String,
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MultipartBody {
    pub file: FilePart,
    pub fields: Vec<(String, String)>,
}

/// What goes on the wire after a route's body options are resolved.
///
/// Only one variant can be chosen, so a raw body and a JSON body never
/// travel together.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Raw(String),
    Form(Vec<(String, String)>),
    Json(Value),
    Multipart(MultipartBody),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeRequest {
    pub method: String,
    pub url: String,
    pub headers: Option<BTreeMap<String, String>>,
    pub query: Option<Vec<(String, String)>>,
    pub body: RequestBody,
    pub basic_auth: Option<BasicAuth>,
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status_code: u16,
    pub reason: Option<String>,
    /// Charset declared by the response's `Content-Type`, if any.
    pub charset: Option<String>,
    pub body: Vec<u8>,
}

/// Extracts the `charset` parameter from a `Content-Type` value.
pub fn charset_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("charset") {
            return None;
        }
        let value = value.trim().trim_matches('"').trim();
        (!value.is_empty()).then(|| value.to_string())
    })
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, request: ProbeRequest) -> Result<HttpResponse, ProbeError>;
}

/// Certificate verification policy of a route's client.
#[derive(Debug, Clone, PartialEq)]
pub enum TlsMode {
    Verify,
    Insecure,
    CustomRoots(PathBuf),
}

impl TlsMode {
    /// Uses the route's CA bundle when it exists, otherwise its `verify_ssl` flag.
    pub fn resolve(route: &RouteConfig) -> Self {
        let fallback = if route.verify_ssl {
            TlsMode::Verify
        } else {
            TlsMode::Insecure
        };

        match &route.ca_bundle {
            Some(path) if path.exists() => TlsMode::CustomRoots(path.clone()),
            Some(path) => {
                warn!(
                    route = %route.name,
                    ca_bundle = %path.display(),
                    "CA bundle not found, falling back to verify_ssl={}",
                    route.verify_ssl
                );
                fallback
            }
            None => fallback,
        }
    }
}

pub struct ReqwestHttpClient {
    client: Client,
}

impl ReqwestHttpClient {
    pub fn new(timeout: Duration, allow_redirects: bool, tls: &TlsMode) -> Result<Self, ClientBuildError> {
        let redirect_policy = if allow_redirects {
            redirect::Policy::default()
        } else {
            redirect::Policy::none()
        };

        let mut builder = Client::builder().timeout(timeout).redirect(redirect_policy);

        match tls {
            TlsMode::Verify => {}
            TlsMode::Insecure => builder = builder.danger_accept_invalid_certs(true),
            TlsMode::CustomRoots(path) => {
                let pem = std::fs::read(path).map_err(|source| ClientBuildError::CaBundle {
                    path: path.clone(),
                    source,
                })?;
                let certificates = Certificate::from_pem_bundle(&pem).map_err(|source| {
                    ClientBuildError::InvalidCaBundle {
                        path: path.clone(),
                        source,
                    }
                })?;
                builder = builder.tls_built_in_root_certs(false);
                for certificate in certificates {
                    builder = builder.add_root_certificate(certificate);
                }
            }
        }

        Ok(Self {
            client: builder.build()?,
        })
    }

    pub fn for_route(route: &RouteConfig) -> Result<Self, ClientBuildError> {
        Self::new(route.timeout, route.allow_redirects, &TlsMode::resolve(route))
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn execute(&self, request: ProbeRequest) -> Result<HttpResponse, ProbeError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|e| ProbeError::InvalidRequest(format!("method '{}': {e}", request.method)))?;

        let mut builder = self.client.request(method, &request.url).timeout(request.timeout);

        if let Some(headers) = &request.headers {
            for (name, value) in headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }
        if let Some(query) = &request.query {
            builder = builder.query(query);
        }
        if let Some(auth) = &request.basic_auth {
            builder = builder.basic_auth(&auth.username, Some(&auth.password));
        }

        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Raw(text) => builder.body(text),
            RequestBody::Form(fields) => builder.form(&fields),
            RequestBody::Json(payload) => builder.json(&payload),
            RequestBody::Multipart(multipart) => builder.multipart(multipart_form(multipart)?),
        };

        let response = builder.send().await.map_err(ProbeError::transport)?;
        let status = response.status();
        let charset = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(charset_from_content_type);
        let body = response.bytes().await.map_err(ProbeError::transport)?;

        Ok(HttpResponse {
            status_code: status.as_u16(),
            reason: status.canonical_reason().map(str::to_string),
            charset,
            body: body.to_vec(),
        })
    }
}

fn multipart_form(body: MultipartBody) -> Result<reqwest::multipart::Form, ProbeError> {
    let FilePart {
        field_name,
        file_name,
        content_type,
        bytes,
    } = body.file;

    let part = reqwest::multipart::Part::bytes(bytes)
        .file_name(file_name)
        .mime_str(&content_type)
        .map_err(|e| ProbeError::InvalidRequest(format!("content type '{content_type}': {e}")))?;

    let mut form = reqwest::multipart::Form::new().part(field_name, part);
    for (name, value) in body.fields {
        form = form.text(name, value);
    }
    Ok(form)
}

#[derive(Clone)]
pub enum MockHttpResponse {
    Reply {
        status_code: u16,
        charset: Option<String>,
        body: Vec<u8>,
    },
    Fail(String),
}

/// Scripted client that answers by URL and remembers every request it saw.
pub struct MockHttpClient {
    responses: HashMap<String, MockHttpResponse>,
    default_response: MockHttpResponse,
    delay: Duration,
    requests: Arc<Mutex<Vec<ProbeRequest>>>,
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self {
            responses: HashMap::new(),
            default_response: MockHttpResponse::Reply {
                status_code: 404,
                charset: None,
                body: b"Not Found".to_vec(),
            },
            delay: Duration::ZERO,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_response(self, url: &str, status_code: u16, body: &str) -> Self {
        self.with_raw_response(url, status_code, body.as_bytes().to_vec())
    }

    pub fn with_raw_response(mut self, url: &str, status_code: u16, body: Vec<u8>) -> Self {
        self.responses.insert(
            url.to_string(),
            MockHttpResponse::Reply {
                status_code,
                charset: None,
                body,
            },
        );
        self
    }

    /// Like [`Self::with_raw_response`], with a declared body charset.
    pub fn with_encoded_response(mut self, url: &str, status_code: u16, body: Vec<u8>, charset: &str) -> Self {
        self.responses.insert(
            url.to_string(),
            MockHttpResponse::Reply {
                status_code,
                charset: Some(charset.to_string()),
                body,
            },
        );
        self
    }

    pub fn with_error(mut self, url: &str, message: &str) -> Self {
        self.responses
            .insert(url.to_string(), MockHttpResponse::Fail(message.to_string()));
        self
    }

    pub fn with_default_response(mut self, status_code: u16, body: &str) -> Self {
        self.default_response = MockHttpResponse::Reply {
            status_code,
            charset: None,
            body: body.as_bytes().to_vec(),
        };
        self
    }

    /// Holds every exchange open for `delay`, like a slow upstream.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Handle onto the recorded requests that outlives the client.
    pub fn recorded(&self) -> Arc<Mutex<Vec<ProbeRequest>>> {
        Arc::clone(&self.requests)
    }
}

impl Default for MockHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn execute(&self, request: ProbeRequest) -> Result<HttpResponse, ProbeError> {
        let scripted = self
            .responses
            .get(&request.url)
            .unwrap_or(&self.default_response)
            .clone();

        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match scripted {
            MockHttpResponse::Reply {
                status_code,
                charset,
                body,
            } => Ok(HttpResponse {
                status_code,
                reason: reqwest::StatusCode::from_u16(status_code)
                    .ok()
                    .and_then(|status| status.canonical_reason())
                    .map(str::to_string),
                charset,
                body,
            }),
            MockHttpResponse::Fail(message) => Err(ProbeError::Transport(message)),
        }
    }
}
