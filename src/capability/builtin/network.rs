//! `endowment:network-access`: HTTP fetch from inside the sandbox.
//!
//! Narrowed with an `allowedOrigins` caveat in practice; without one the
//! snap may reach any http(s) URL. Redirects are never followed: a 3xx is
//! handed back to the snap, whose next fetch goes through the caveat again.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};
use url::Url;

use super::NETWORK_ACCESS;
use crate::capability::{CaveatKind, Endowment, EndowmentContext};
use crate::error::{ExecutionError, Result};

/// Maximum response body returned to the sandbox (5 MB).
const MAX_RESPONSE_SIZE: usize = 5 * 1024 * 1024;

/// HTTP timeout in seconds.
const FETCH_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct FetchParams {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    body: Option<String>,
}

pub struct NetworkEndowment {
    client: Option<reqwest::Client>,
}

impl NetworkEndowment {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| warn!("network access disabled, HTTP client unavailable: {e}"))
            .ok();
        Self { client }
    }
}

impl Default for NetworkEndowment {
    fn default() -> Self {
        Self::new()
    }
}

/// Validates the request target and method before any I/O happens.
fn prepare(params: Value) -> Result<(reqwest::Method, Url, Option<String>)> {
    let params: FetchParams = serde_json::from_value(params)
        .map_err(|e| ExecutionError::InvalidParams(format!("{NETWORK_ACCESS}: {e}")))?;
    let url = Url::parse(&params.url)
        .map_err(|e| ExecutionError::InvalidParams(format!("invalid url '{}': {e}", params.url)))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ExecutionError::InvalidParams(format!(
            "unsupported scheme '{}'",
            url.scheme()
        )));
    }
    let method = match params.method.as_deref().unwrap_or("GET").to_uppercase().as_str() {
        "GET" => reqwest::Method::GET,
        "POST" => reqwest::Method::POST,
        "PUT" => reqwest::Method::PUT,
        "PATCH" => reqwest::Method::PATCH,
        "DELETE" => reqwest::Method::DELETE,
        "HEAD" => reqwest::Method::HEAD,
        other => {
            return Err(ExecutionError::InvalidParams(format!(
                "unsupported method '{other}'"
            )))
        }
    };
    Ok((method, url, params.body))
}

#[async_trait]
impl Endowment for NetworkEndowment {
    fn name(&self) -> &str {
        NETWORK_ACCESS
    }

    fn supported_caveats(&self) -> &[CaveatKind] {
        &[CaveatKind::AllowedOrigins]
    }

    async fn invoke(&self, params: Value, context: &EndowmentContext) -> Result<Value> {
        let (method, url, body) = prepare(params)?;
        debug!(snap = %context.snap_id, %method, %url, "sandbox fetch");

        let client = self.client.as_ref().ok_or_else(|| {
            ExecutionError::Internal("HTTP client unavailable".into())
        })?;
        let mut request = client
            .request(method, url.clone())
            .timeout(std::time::Duration::from_secs(FETCH_TIMEOUT_SECS));
        if let Some(body) = body {
            request = request.body(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ExecutionError::Internal(format!("fetch {url} failed: {e}")))?;

        let status = response.status().as_u16();
        if response
            .content_length()
            .is_some_and(|len| len as usize > MAX_RESPONSE_SIZE)
        {
            return Err(ExecutionError::Internal(format!(
                "response from {url} exceeds {MAX_RESPONSE_SIZE} bytes"
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ExecutionError::Internal(format!("reading {url} failed: {e}")))?;
        if bytes.len() > MAX_RESPONSE_SIZE {
            return Err(ExecutionError::Internal(format!(
                "response from {url} exceeds {MAX_RESPONSE_SIZE} bytes"
            )));
        }

        Ok(json!({
            "status": status,
            "body": String::from_utf8_lossy(&bytes),
        }))
    }
}
