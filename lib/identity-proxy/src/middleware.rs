//! Middleware framework for feature-specific request/response rewriting
//!
//! Middlewares run after the base host, cookie and body rewriting: request
//! hooks just before the relay, response hooks just before the response is
//! written. They receive the decoded body and return the body to use.

use crate::{ProxyError, Result};
use anyhow::Context;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, LOCATION};
use hyper::http::{request, response};
use identity_core::TargetConfig;
use std::sync::Arc;
use tracing::{debug, span, Instrument, Level};
use url::Url;

/// Middleware trait for processing requests and responses
#[async_trait::async_trait]
pub trait Middleware: Send + Sync {
    /// Name used in logs and errors
    fn name(&self) -> &'static str {
        "UnnamedMiddleware"
    }

    /// Called with the rewritten request before it is relayed
    async fn on_request(
        &self,
        _parts: &mut request::Parts,
        _target: &TargetConfig,
        body: Bytes,
    ) -> anyhow::Result<Bytes> {
        Ok(body)
    }

    /// Called with the rewritten response before it is written
    async fn on_response(
        &self,
        _parts: &mut response::Parts,
        _target: &TargetConfig,
        body: Bytes,
    ) -> anyhow::Result<Bytes> {
        Ok(body)
    }
}

/// Chain of middleware to execute in order
pub struct MiddlewareChain {
    middleware: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    /// Create a new middleware chain
    pub fn new() -> Self {
        Self {
            middleware: Vec::new(),
        }
    }

    /// Add middleware to the chain
    pub fn add<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    /// Run every request hook in order, threading the body through
    pub async fn on_request(
        &self,
        parts: &mut request::Parts,
        target: &TargetConfig,
        mut body: Bytes,
    ) -> Result<Bytes> {
        for mw in &self.middleware {
            let span = span!(Level::DEBUG, "middleware", name = mw.name());
            debug!(parent: &span, "Processing on_request");
            body = mw
                .on_request(parts, target, body)
                .instrument(span)
                .await
                .map_err(|source| ProxyError::Middleware {
                    name: mw.name(),
                    source,
                })?;
        }
        Ok(body)
    }

    /// Run every response hook in order, threading the body through
    pub async fn on_response(
        &self,
        parts: &mut response::Parts,
        target: &TargetConfig,
        mut body: Bytes,
    ) -> Result<Bytes> {
        for mw in &self.middleware {
            let span = span!(Level::DEBUG, "middleware", name = mw.name());
            debug!(parent: &span, "Processing on_response");
            body = mw
                .on_response(parts, target, body)
                .instrument(span)
                .await
                .map_err(|source| ProxyError::Middleware {
                    name: mw.name(),
                    source,
                })?;
        }
        Ok(body)
    }
}

impl Default for MiddlewareChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Logging middleware that logs request and response info
pub struct LoggingMiddleware;

#[async_trait::async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "LoggingMiddleware"
    }

    async fn on_request(
        &self,
        parts: &mut request::Parts,
        target: &TargetConfig,
        body: Bytes,
    ) -> anyhow::Result<Bytes> {
        debug!(
            "Request: {} {} -> {} (headers: {}, body: {} bytes)",
            parts.method,
            parts.uri.path(),
            target.upstream_host,
            parts.headers.len(),
            body.len()
        );
        Ok(body)
    }

    async fn on_response(
        &self,
        parts: &mut response::Parts,
        target: &TargetConfig,
        body: Bytes,
    ) -> anyhow::Result<Bytes> {
        debug!(
            "Response: {} <- {} (body: {} bytes)",
            parts.status,
            target.upstream_host,
            body.len()
        );
        Ok(body)
    }
}

/// Replaces redirects to the identity service's welcome page with a fixed
/// URL, so a finished flow lands on the application instead.
pub struct WelcomeRedirectMiddleware {
    welcome_path: String,
    redirect_to: Url,
}

impl WelcomeRedirectMiddleware {
    pub fn new(path_prefix: &str, redirect_to: Url) -> Self {
        Self {
            welcome_path: format!("{}/ui/welcome", path_prefix),
            redirect_to,
        }
    }

    pub fn welcome_path(&self) -> &str {
        &self.welcome_path
    }

    fn is_welcome(&self, location: &str) -> bool {
        let path = match Url::parse(location) {
            Ok(url) => url.path().to_string(),
            Err(_) => location
                .split(['?', '#'])
                .next()
                .unwrap_or_default()
                .to_string(),
        };
        path == self.welcome_path
    }
}

#[async_trait::async_trait]
impl Middleware for WelcomeRedirectMiddleware {
    fn name(&self) -> &'static str {
        "WelcomeRedirectMiddleware"
    }

    async fn on_response(
        &self,
        parts: &mut response::Parts,
        _target: &TargetConfig,
        body: Bytes,
    ) -> anyhow::Result<Bytes> {
        let Some(location) = parts.headers.get(LOCATION).and_then(|v| v.to_str().ok()) else {
            return Ok(body);
        };
        if self.is_welcome(location) {
            debug!("Replacing welcome redirect with {}", self.redirect_to);
            let value = HeaderValue::from_str(self.redirect_to.as_str())
                .context("default redirect URL is not a valid header value")?;
            parts.headers.insert(LOCATION, value);
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::{Request, Response, StatusCode};

    fn target() -> TargetConfig {
        TargetConfig {
            cookie_domain: "localhost".to_string(),
            upstream_host: "slug.projects.example.com".to_string(),
            upstream_scheme: "https".to_string(),
            target_host: "slug.projects.example.com".to_string(),
            path_prefix: String::new(),
            original_host: "localhost:4000".to_string(),
            original_scheme: "http".to_string(),
        }
    }

    fn redirect(location: &str) -> response::Parts {
        Response::builder()
            .status(StatusCode::SEE_OTHER)
            .header(LOCATION, location)
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    struct Append(&'static str);

    #[async_trait::async_trait]
    impl Middleware for Append {
        fn name(&self) -> &'static str {
            "Append"
        }

        async fn on_request(
            &self,
            _parts: &mut request::Parts,
            _target: &TargetConfig,
            body: Bytes,
        ) -> anyhow::Result<Bytes> {
            let mut out = body.to_vec();
            out.extend_from_slice(self.0.as_bytes());
            Ok(Bytes::from(out))
        }
    }

    struct Fail;

    #[async_trait::async_trait]
    impl Middleware for Fail {
        fn name(&self) -> &'static str {
            "Fail"
        }

        async fn on_response(
            &self,
            _parts: &mut response::Parts,
            _target: &TargetConfig,
            _body: Bytes,
        ) -> anyhow::Result<Bytes> {
            anyhow::bail!("refusing response")
        }
    }

    #[tokio::test]
    async fn test_middleware_chain_runs_in_order() {
        let chain = MiddlewareChain::new().add(Append("a")).add(Append("b"));
        assert_eq!(chain.len(), 2);
        let (mut parts, _) = Request::builder().uri("/").body(()).unwrap().into_parts();
        let body = chain
            .on_request(&mut parts, &target(), Bytes::from_static(b">"))
            .await
            .unwrap();
        assert_eq!(&body[..], b">ab");
    }

    #[tokio::test]
    async fn test_middleware_error_aborts() {
        let chain = MiddlewareChain::default().add(LoggingMiddleware).add(Fail);
        let mut parts = redirect("/");
        let result = chain.on_response(&mut parts, &target(), Bytes::new()).await;
        match result {
            Err(ProxyError::Middleware { name, .. }) => assert_eq!(name, "Fail"),
            other => panic!("expected middleware error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_welcome_redirect_is_replaced() {
        let mw = WelcomeRedirectMiddleware::new("", Url::parse("http://localhost:3000/").unwrap());
        let mut parts = redirect("http://localhost:4000/ui/welcome");
        mw.on_response(&mut parts, &target(), Bytes::new()).await.unwrap();
        assert_eq!(parts.headers[LOCATION], "http://localhost:3000/");
    }

    #[tokio::test]
    async fn test_welcome_redirect_respects_prefix() {
        let mw = WelcomeRedirectMiddleware::new("/.ory", Url::parse("http://localhost:3000/home").unwrap());
        assert_eq!(mw.welcome_path(), "/.ory/ui/welcome");

        let mut parts = redirect("/.ory/ui/welcome?flow=1");
        mw.on_response(&mut parts, &target(), Bytes::new()).await.unwrap();
        assert_eq!(parts.headers[LOCATION], "http://localhost:3000/home");
    }

    #[tokio::test]
    async fn test_other_redirects_pass_through() {
        let mw = WelcomeRedirectMiddleware::new("", Url::parse("http://localhost:3000/").unwrap());
        let mut parts = redirect("http://localhost:4000/ui/login");
        mw.on_response(&mut parts, &target(), Bytes::new()).await.unwrap();
        assert_eq!(parts.headers[LOCATION], "http://localhost:4000/ui/login");
    }
}
