//! HTTP request processor.

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use serde_json::{Map, Value, json};
use std::sync::OnceLock;
use std::time::Instant;
use tracing::{debug, warn};

use super::traits::{Processor, ProcessorInput, ProcessorOutput};
use crate::domain::{Command, HttpBody};
use crate::error::ExecutionKind;
use crate::{Error, Result};

/// Install the aws-lc-rs rustls provider once per process.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Another crate got there first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

fn http_error(message: impl Into<String>) -> Error {
    Error::execution(ExecutionKind::Http, message)
}

/// Issues the described request with a shared client.
///
/// Responses with a status of 400 or above fail the attempt. The result is
/// `{status, headers, body}`; JSON bodies are parsed, anything else is kept as text.
pub struct HttpProcessor {
    client: Client,
}

impl HttpProcessor {
    pub fn new() -> Self {
        install_rustls_provider();
        let client = Client::builder()
            .user_agent(concat!("jobflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build HTTP client, falling back to defaults: {}", e);
                Client::new()
            });
        Self { client }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn build_headers(headers: &std::collections::BTreeMap<String, String>) -> Result<HeaderMap> {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            let name = name
                .parse::<HeaderName>()
                .map_err(|e| http_error(format!("invalid header name '{}': {}", name, e)))?;
            let value = value
                .parse::<HeaderValue>()
                .map_err(|e| http_error(format!("invalid header value for {}: {}", name, e)))?;
            map.insert(name, value);
        }
        Ok(map)
    }
}

impl Default for HttpProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Processor for HttpProcessor {
    fn kind(&self) -> ExecutionKind {
        ExecutionKind::Http
    }

    fn name(&self) -> &'static str {
        "HttpProcessor"
    }

    async fn process(&self, input: &ProcessorInput) -> Result<ProcessorOutput> {
        let Command::Http(request) = &input.command else {
            return Err(Error::invalid_argument("HttpProcessor only runs HTTP requests"));
        };

        let start = Instant::now();
        let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| http_error(format!("invalid method '{}': {}", request.method, e)))?;

        let mut builder = self
            .client
            .request(method.clone(), &request.url)
            .headers(Self::build_headers(&request.headers)?);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        builder = match &request.body {
            Some(HttpBody::Json(body)) => builder.json(body),
            Some(HttpBody::Text(body)) => builder.body(body.clone()),
            None => builder,
        };

        debug!(job_id = %input.job_id, "{} {}", method, request.url);
        let response = builder
            .send()
            .await
            .map_err(|e| http_error(format!("request to {} failed: {}", request.url, e)))?;

        let status = response.status();
        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), Value::String(v.to_string())))
            })
            .collect();
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("json"));

        let text = response
            .text()
            .await
            .map_err(|e| http_error(format!("failed to read response body: {}", e)))?;

        if status.as_u16() >= 400 {
            let snippet: String = text.chars().take(512).collect();
            return Err(http_error(format!("{} {}: {}", status, request.url, snippet)));
        }

        let body = if is_json {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        } else {
            Value::String(text)
        };

        Ok(ProcessorOutput {
            result: json!({
                "status": status.as_u16(),
                "headers": headers,
                "body": body,
            }),
            duration_secs: start.elapsed().as_secs_f64(),
        })
    }
}
