//! REST transport
//!
//! Request/response types, the failure taxonomy every collaborator call is
//! classified into, and the reqwest-backed [`RestClient`]. Failed calls are
//! never retried here; retrying is an explicit user action.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

// =============================================================================
// Error Types
// =============================================================================

/// How a failed collaborator call should be handled by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network trouble or a server hiccup; safe to retry on user request
    Transient,
    /// The target changed under us (e.g. an invitation was already resolved)
    Conflict,
    /// The session lacks the rights for this call
    Permission,
    /// The backend rejected the input
    Validation,
    /// The target does not exist
    NotFound,
    /// The session is missing or expired
    Unauthenticated,
    /// Anything else, including unparseable responses
    Unexpected,
}

/// A failed REST call
///
/// # Examples
/// ```
/// use market_client::rest::{ApiError, ErrorKind};
///
/// let error = ApiError::new(409, "NotPending", "Request is no longer pending");
/// assert_eq!(error.kind(), ErrorKind::Conflict);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    status: u16,
    code: String,
    message: String,
}

impl ApiError {
    /// Create a new error
    pub fn new(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Error for a request that never produced an HTTP status
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(0, "NetworkError", message)
    }

    /// Error for a response body that could not be understood
    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(0, "ParseError", message)
    }

    /// HTTP status code (0 when no response was received)
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Machine-readable error code
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Human-readable message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Classify the failure
    pub fn kind(&self) -> ErrorKind {
        match self.status {
            0 if self.code == "ParseError" => ErrorKind::Unexpected,
            0 | 408 | 425 | 429 | 500..=599 => ErrorKind::Transient,
            400 | 422 => ErrorKind::Validation,
            401 => ErrorKind::Unauthenticated,
            403 => ErrorKind::Permission,
            404 => ErrorKind::NotFound,
            409 => ErrorKind::Conflict,
            _ => ErrorKind::Unexpected,
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "API error {}: {} - {}", self.status, self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

/// Error body the backend sends with non-2xx responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error code
    pub error: String,
    /// Error message
    pub message: String,
}

// =============================================================================
// Request Types
// =============================================================================

/// HTTP method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
}

impl HttpMethod {
    /// Method name
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// A request relative to the API base URL
#[derive(Debug, Clone)]
pub struct RestRequest {
    /// HTTP method
    pub method: HttpMethod,
    /// Path below the base URL, e.g. `/api/messages/conversations`
    pub path: String,
    /// Query parameters
    pub params: Vec<(String, String)>,
    /// Request headers
    pub headers: HashMap<String, String>,
    /// JSON body
    pub body: Option<Vec<u8>>,
}

impl RestRequest {
    fn with_method(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            params: Vec::new(),
            headers: HashMap::new(),
            body: None,
        }
    }

    /// GET request
    pub fn get(path: impl Into<String>) -> Self {
        Self::with_method(HttpMethod::Get, path)
    }

    /// POST request
    pub fn post(path: impl Into<String>) -> Self {
        Self::with_method(HttpMethod::Post, path)
    }

    /// PUT request
    pub fn put(path: impl Into<String>) -> Self {
        Self::with_method(HttpMethod::Put, path)
    }

    /// DELETE request
    pub fn delete(path: impl Into<String>) -> Self {
        Self::with_method(HttpMethod::Delete, path)
    }

    /// Add a query parameter
    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((key.into(), value.to_string()));
        self
    }

    /// Add a header
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Attach a JSON body
    pub fn json_body<T: Serialize>(mut self, value: &T) -> Result<Self, ApiError> {
        let body = serde_json::to_vec(value).map_err(|e| ApiError::parse(e.to_string()))?;
        self.body = Some(body);
        Ok(self)
    }
}

/// A successful response
#[derive(Debug, Clone)]
pub struct RestResponse<T> {
    /// HTTP status code
    pub status: u16,
    /// Decoded body
    pub data: T,
}

// =============================================================================
// Client Configuration
// =============================================================================

/// Configuration for [`RestClient`]
#[derive(Debug, Clone)]
pub struct RestClientConfig {
    /// API base URL, without trailing slash
    pub base_url: String,
    /// Request timeout
    pub timeout: Duration,
    /// User agent string
    pub user_agent: String,
    /// Headers sent with every request
    pub default_headers: HashMap<String, String>,
}

impl Default for RestClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            timeout: Duration::from_secs(30),
            user_agent: format!("Carmarket/{}", env!("CARGO_PKG_VERSION")),
            default_headers: HashMap::new(),
        }
    }
}

impl RestClientConfig {
    /// Create a config for a base URL
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            ..Default::default()
        }
    }

    /// Set the timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the user agent
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Add a default header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(key.into(), value.into());
        self
    }
}

// =============================================================================
// Client
// =============================================================================

/// JSON-over-HTTP client for the marketplace backend
#[derive(Debug, Clone)]
pub struct RestClient {
    client: reqwest::Client,
    config: RestClientConfig,
}

impl RestClient {
    /// Build a client from configuration
    pub fn new(config: RestClientConfig) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| ApiError::network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// Client configuration
    pub fn config(&self) -> &RestClientConfig {
        &self.config
    }

    /// Send a request and decode the JSON response body
    pub async fn send<T: DeserializeOwned>(
        &self,
        request: RestRequest,
        bearer: Option<&str>,
    ) -> Result<RestResponse<T>, ApiError> {
        let (status, body) = self.execute(request, bearer).await?;

        let data = serde_json::from_str(&body)
            .map_err(|e| ApiError::parse(format!("failed to parse JSON: {}", e)))?;

        Ok(RestResponse { status, data })
    }

    /// Send a request whose response body is irrelevant
    pub async fn send_empty(&self, request: RestRequest, bearer: Option<&str>) -> Result<u16, ApiError> {
        let (status, _) = self.execute(request, bearer).await?;
        Ok(status)
    }

    async fn execute(&self, request: RestRequest, bearer: Option<&str>) -> Result<(u16, String), ApiError> {
        let url = format!("{}{}", self.config.base_url, request.path);
        let method = request.method;

        let mut req = match method {
            HttpMethod::Get => self.client.get(&url),
            HttpMethod::Post => self.client.post(&url),
            HttpMethod::Put => self.client.put(&url),
            HttpMethod::Delete => self.client.delete(&url),
        };

        if !request.params.is_empty() {
            req = req.query(&request.params);
        }
        for (key, value) in &self.config.default_headers {
            req = req.header(key, value);
        }
        for (key, value) in &request.headers {
            req = req.header(key, value);
        }
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }
        if let Some(body) = request.body {
            req = req.header("Content-Type", "application/json").body(body);
        }

        let response = req.send().await.map_err(|e| {
            tracing::warn!(method = method.as_str(), path = %request.path, "request failed: {}", e);
            ApiError::network(format!("request failed: {}", e))
        })?;

        let status = response.status().as_u16();
        let success = response.status().is_success();
        let body = response
            .text()
            .await
            .map_err(|e| ApiError::parse(format!("failed to read response: {}", e)))?;

        if !success {
            let error = match serde_json::from_str::<ErrorBody>(&body) {
                Ok(parsed) => ApiError::new(status, parsed.error, parsed.message),
                Err(_) => ApiError::new(status, "Unknown", format!("HTTP {}: {}", status, body)),
            };
            tracing::debug!(method = method.as_str(), path = %request.path, %error, "backend returned an error");
            return Err(error);
        }

        Ok((status, body))
    }
}
