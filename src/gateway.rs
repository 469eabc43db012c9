//! Signed REST requests against a FHIR server
//!
//! [`RequestGateway`] resolves resource paths against the server base URL,
//! asks a [`RequestSigner`] for an `Authorization` header, executes exactly
//! one HTTP attempt, and normalizes the outcome into a [`FhirResponse`] or a
//! [`SmartError`] from the shared taxonomy:
//!
//! - connect/DNS/TLS/timeout failures become [`SmartError::Transport`]
//! - unreadable responses become [`SmartError::NonHttpResponse`]
//! - statuses of 400 and above become [`SmartError::HttpStatus`]
//! - bodies that are not JSON become [`SmartError::BodyParse`]

use std::sync::Arc;

use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, CONTENT_TYPE, LOCATION};
use reqwest::Method;
use serde_json::Value;
use url::Url;

use crate::error::{Result, SmartError};

/// Default resource serialization format, sent as `application/<format>`.
pub const DEFAULT_FORMAT: &str = "fhir+json";

/// Produces the `Authorization` header value for outgoing requests.
///
/// Returning `None` sends the request unsigned.
#[async_trait::async_trait]
pub trait RequestSigner: Send + Sync {
    /// Returns the full header value (e.g. `Bearer abc`) when a live
    /// credential is available.
    async fn authorization_header(&self) -> Option<String>;
}

/// Signer that never signs. Used for capability discovery.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unsigned;

#[async_trait::async_trait]
impl RequestSigner for Unsigned {
    async fn authorization_header(&self) -> Option<String> {
        None
    }
}

/// Signer holding a fixed bearer token.
#[derive(Debug, Clone)]
pub struct BearerToken(pub String);

#[async_trait::async_trait]
impl RequestSigner for BearerToken {
    async fn authorization_header(&self) -> Option<String> {
        Some(format!("Bearer {}", self.0))
    }
}

/// A normalized successful response.
#[derive(Debug, Clone)]
pub struct FhirResponse {
    /// HTTP status code (always below 400)
    pub status: u16,
    /// Response headers
    pub headers: HeaderMap,
    /// Parsed JSON body; `None` when the server returned no content
    pub body: Option<Value>,
}

impl FhirResponse {
    /// Returns the `Location` header, set by servers on create.
    pub fn location(&self) -> Option<&str> {
        self.headers.get(LOCATION).and_then(|v| v.to_str().ok())
    }

    /// Returns the body or a [`SmartError::BodyParse`] when it is missing.
    pub fn into_body(self) -> Result<Value> {
        self.body.ok_or_else(|| {
            SmartError::BodyParse {
                raw_body: String::new(),
                message: "response has no body".to_string(),
            }
            .into()
        })
    }
}

/// Builds, signs, and executes requests against one FHIR base URL.
#[derive(Clone)]
pub struct RequestGateway {
    http: reqwest::Client,
    base_url: Url,
    signer: Arc<dyn RequestSigner>,
    media_type: String,
}

impl std::fmt::Debug for RequestGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestGateway")
            .field("base_url", &self.base_url.as_str())
            .field("media_type", &self.media_type)
            .finish_non_exhaustive()
    }
}

impl RequestGateway {
    /// Creates a gateway for `base_url`.
    ///
    /// A trailing slash is added to the base path so relative resource paths
    /// resolve beneath it rather than replacing its last segment.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use url::Url;
    /// use smartfhir::gateway::{RequestGateway, Unsigned};
    ///
    /// let gateway = RequestGateway::new(
    ///     reqwest::Client::new(),
    ///     Url::parse("https://fhir.example.com/r4").unwrap(),
    ///     Arc::new(Unsigned),
    /// );
    /// assert_eq!(gateway.base_url().as_str(), "https://fhir.example.com/r4/");
    /// ```
    pub fn new(http: reqwest::Client, base_url: Url, signer: Arc<dyn RequestSigner>) -> Self {
        Self {
            http,
            base_url: with_trailing_slash(base_url),
            signer,
            media_type: format!("application/{}", DEFAULT_FORMAT),
        }
    }

    /// Overrides the serialization format (`application/<format>`).
    pub fn with_format(mut self, format: &str) -> Self {
        self.media_type = format!("application/{}", format);
        self
    }

    /// Returns a copy of this gateway that signs with `signer`.
    pub fn with_signer(&self, signer: Arc<dyn RequestSigner>) -> Self {
        Self {
            signer,
            ..self.clone()
        }
    }

    /// The normalized server base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolves `path` against the base URL. Absolute URLs (e.g. server
    /// provided paging links) are returned unchanged.
    pub fn resolve(&self, path: &str) -> Result<Url> {
        if let Ok(absolute) = Url::parse(path) {
            return Ok(absolute);
        }
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| SmartError::Transport(format!("invalid request path '{path}': {e}")).into())
    }

    /// Performs one request.
    ///
    /// GET, PUT, POST, and DELETE are supported; a body is only sent with PUT
    /// and POST.
    ///
    /// # Errors
    ///
    /// Returns [`SmartError::OperationNotSupported`] for other methods and the
    /// normalized failure variants described in the module docs.
    pub async fn perform(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<FhirResponse> {
        if ![Method::GET, Method::PUT, Method::POST, Method::DELETE].contains(&method) {
            return Err(SmartError::OperationNotSupported(format!(
                "HTTP method {method} is not supported"
            ))
            .into());
        }

        let url = self.resolve(path)?;
        tracing::debug!(%method, url = %url, "performing FHIR request");

        let mut request = self
            .http
            .request(method.clone(), url)
            .header(ACCEPT, self.media_type.as_str());

        if let Some(header) = self.signer.authorization_header().await {
            request = request.header(AUTHORIZATION, header);
        }

        if method == Method::PUT || method == Method::POST {
            if let Some(body) = body {
                request = request
                    .header(
                        CONTENT_TYPE,
                        format!("{}; charset=utf-8", self.media_type),
                    )
                    .body(serde_json::to_vec(body)?);
            }
        }

        let response = request.send().await.map_err(classify_send_error)?;
        read_response(response).await
    }

    /// GET `path`.
    pub async fn get(&self, path: &str) -> Result<FhirResponse> {
        self.perform(Method::GET, path, None).await
    }

    /// PUT `body` to `path`.
    pub async fn put(&self, path: &str, body: &Value) -> Result<FhirResponse> {
        self.perform(Method::PUT, path, Some(body)).await
    }

    /// POST `body` to `path`.
    pub async fn post(&self, path: &str, body: &Value) -> Result<FhirResponse> {
        self.perform(Method::POST, path, Some(body)).await
    }

    /// Reads one resource instance by type and id.
    pub async fn read(&self, resource_type: &str, id: &str) -> Result<Value> {
        self.get(&format!("{resource_type}/{id}"))
            .await?
            .into_body()
    }
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

fn classify_send_error(err: reqwest::Error) -> anyhow::Error {
    if err.is_connect() || err.is_timeout() || err.is_request() || err.is_builder() {
        SmartError::Transport(err.to_string()).into()
    } else {
        SmartError::NonHttpResponse(err.to_string()).into()
    }
}

async fn read_response(response: reqwest::Response) -> Result<FhirResponse> {
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response
        .bytes()
        .await
        .map_err(|e| SmartError::NonHttpResponse(format!("failed to read response: {e}")))?;

    if status.as_u16() >= 400 {
        let reason = status_reason(status, &bytes);
        tracing::debug!(status = status.as_u16(), %reason, "FHIR request failed");
        return Err(SmartError::HttpStatus {
            status: status.as_u16(),
            reason,
        }
        .into());
    }

    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(FhirResponse {
            status: status.as_u16(),
            headers,
            body: None,
        });
    }

    let body = serde_json::from_slice::<Value>(&bytes).map_err(|e| SmartError::BodyParse {
        raw_body: String::from_utf8_lossy(&bytes).into_owned(),
        message: e.to_string(),
    })?;

    Ok(FhirResponse {
        status: status.as_u16(),
        headers,
        body: Some(body),
    })
}

/// Builds a human-readable reason, appending OperationOutcome diagnostics
/// when the error body carries any.
fn status_reason(status: reqwest::StatusCode, body: &[u8]) -> String {
    let canonical = status.canonical_reason().unwrap_or("Unknown Status").to_string();

    let diagnostics: Vec<String> = serde_json::from_slice::<Value>(body)
        .ok()
        .filter(|v| v["resourceType"] == "OperationOutcome")
        .and_then(|v| v["issue"].as_array().cloned())
        .unwrap_or_default()
        .iter()
        .filter_map(|issue| {
            issue["diagnostics"]
                .as_str()
                .or_else(|| issue["details"]["text"].as_str())
                .map(str::to_string)
        })
        .collect();

    if diagnostics.is_empty() {
        canonical
    } else {
        format!("{}: {}", canonical, diagnostics.join("; "))
    }
}
