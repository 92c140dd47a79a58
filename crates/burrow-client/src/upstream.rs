//! Replays forwarded requests against the local service

use burrow_proto::{strip_hop_by_hop, RequestFrame, ResponseFrame};
use std::time::Duration;
use tracing::{debug, warn};

/// Largest upstream body relayed back; base64 keeps it inside one frame
pub const DEFAULT_MAX_RESPONSE_BODY: usize = 10 * 1024 * 1024;

/// HTTP client bound to the local upstream
///
/// Never fails: any error talking to the upstream becomes a 500 response
/// frame carrying `Error: <cause>`, so every forwarded request gets an answer.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
    max_body_size: usize,
}

impl UpstreamClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        // Redirects belong to the public caller, not to us
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build upstream client ({}), using defaults", e);
                reqwest::Client::new()
            });

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_body_size: DEFAULT_MAX_RESPONSE_BODY,
        }
    }

    pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.max_body_size = max_body_size;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Execute one request frame and produce its response frame
    pub async fn execute(&self, frame: RequestFrame) -> ResponseFrame {
        let id = frame.id;
        match self.try_execute(frame).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Upstream request {} failed: {}", id, e);
                ResponseFrame::text(id, 500, format!("Error: {}", e))
            }
        }
    }

    async fn try_execute(&self, frame: RequestFrame) -> Result<ResponseFrame, String> {
        let method = reqwest::Method::from_bytes(frame.method.as_bytes())
            .map_err(|e| format!("invalid method '{}': {}", frame.method, e))?;
        let url = format!("{}{}", self.base_url, frame.path);

        debug!("{} {} (request {})", method, url, frame.id);

        let mut request = self.client.request(method, &url);
        for (name, value) in strip_hop_by_hop(&frame.headers, &["host", "content-length"]) {
            request = request.header(name, value);
        }
        if !frame.body.is_empty() {
            request = request.body(frame.body);
        }

        let mut response = request.send().await.map_err(|e| e.to_string())?;

        let too_large = |size: u64| {
            format!(
                "response too large: {} bytes (max {})",
                size, self.max_body_size
            )
        };
        if let Some(length) = response.content_length() {
            if length > self.max_body_size as u64 {
                return Err(too_large(length));
            }
        }

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        // Chunked bodies carry no length up front
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| e.to_string())? {
            if body.len() + chunk.len() > self.max_body_size {
                return Err(too_large((body.len() + chunk.len()) as u64));
            }
            body.extend_from_slice(&chunk);
        }

        debug!("Request {} answered {} ({} bytes)", frame.id, status, body.len());

        Ok(ResponseFrame {
            id: frame.id,
            status,
            headers,
            body,
        })
    }
}
