//! Upstream relay: sends a rewritten request and buffers the response

use crate::{ProxyError, Result};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, CONTENT_LENGTH};
use hyper::http::{request, response};
use hyper::Response;
use std::time::Duration;
use tokio::time::timeout as tokio_timeout;
use tracing::{debug, warn};

/// HTTP/HTTPS request forwarder with connection pooling and timeout support.
///
/// The forwarder never follows redirects and never decodes content, so the
/// rewriting stages see exactly what the upstream sent.
pub struct RequestForwarder {
    client: reqwest::Client,
    timeout: Duration,
}

impl RequestForwarder {
    /// Create a new request forwarder with connection pooling
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(timeout)
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Relay a request whose URI already points at the upstream
    pub async fn forward(
        &self,
        mut parts: request::Parts,
        body: Bytes,
    ) -> Result<(response::Parts, Bytes)> {
        debug!("Forwarding request to: {}", parts.uri);

        let removed = strip_hop_by_hop_headers(&mut parts.headers);
        debug!(
            "Request details - method: {}, headers: {} (removed {} hop-by-hop)",
            parts.method,
            parts.headers.len(),
            removed
        );

        let request = self
            .client
            .request(parts.method, parts.uri.to_string())
            .headers(parts.headers)
            .body(body)
            .build()?;

        debug!("Sending request to upstream with {}s timeout", self.timeout.as_secs());

        let relay = async {
            let response = self.client.execute(request).await?;
            debug!("Upstream responded with status: {}", response.status());

            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, headers, body))
        };

        match tokio_timeout(self.timeout, relay).await {
            Ok(Ok((status, mut headers, body))) => {
                strip_hop_by_hop_headers(&mut headers);
                debug!("Response body size: {} bytes", body.len());

                let mut response = Response::new(());
                *response.status_mut() = status;
                *response.headers_mut() = headers;
                let (parts, ()) = response.into_parts();
                Ok((parts, body))
            }
            Ok(Err(e)) => {
                warn!("Upstream request error: {}", e);
                Err(ProxyError::Upstream(e))
            }
            Err(_) => {
                warn!("Upstream request timeout after {}s", self.timeout.as_secs());
                Err(ProxyError::UpstreamTimeout(self.timeout))
            }
        }
    }
}

/// Remove hop-by-hop headers, returning how many were removed
pub fn strip_hop_by_hop_headers(headers: &mut HeaderMap) -> usize {
    let hop_by_hop: Vec<_> = headers
        .keys()
        .filter(|k| is_hop_by_hop_header(k.as_str()))
        .cloned()
        .collect();
    let mut removed = 0;
    for name in hop_by_hop {
        removed += headers.get_all(&name).iter().count();
        headers.remove(&name);
    }
    removed
}

/// Set `Content-Length` to match a rewritten body.
///
/// A body that was empty before and after rewriting keeps whatever length
/// header it had, which keeps `HEAD` and `304` responses intact.
pub fn sync_content_length(headers: &mut HeaderMap, before: usize, after: usize) {
    if before == 0 && after == 0 {
        return;
    }
    headers.insert(CONTENT_LENGTH, after.into());
}

/// Check if header is hop-by-hop (should not be forwarded)
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
