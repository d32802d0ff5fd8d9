//! Rewriting reverse proxy
//!
//! [`RewritingProxy`] wraps the upstream relay with two stages:
//! `on_forward` (host resolution, request header rewrite, request body
//! rewrite, request middlewares) and `on_receive` (response header rewrite,
//! response body rewrite, response middlewares). The [`TargetConfig`]
//! resolved by `on_forward` is handed to `on_receive` directly.

use crate::body::BodyRewriter;
use crate::forwarder::{sync_content_length, RequestForwarder};
use crate::headers::{rewrite_request_headers, rewrite_response_headers};
use crate::middleware::MiddlewareChain;
use crate::{ProxyError, Result};
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::header::{CONTENT_LENGTH, HOST};
use hyper::http::{request, response};
use hyper::{Request, Response};
use identity_core::{HostResolver, TargetConfig};
use std::sync::Arc;
use tracing::debug;

/// Caller-supplied policy turning a per-request failure into a response
pub type ErrorHook = Arc<dyn Fn(&ProxyError) -> Response<Full<Bytes>> + Send + Sync>;

/// Reverse proxy that rewrites hosts, paths, bodies and cookies
pub struct RewritingProxy {
    resolver: HostResolver,
    rewriter: BodyRewriter,
    middleware: Arc<MiddlewareChain>,
    forwarder: RequestForwarder,
    on_error: ErrorHook,
}

impl RewritingProxy {
    pub fn new(
        resolver: HostResolver,
        forwarder: RequestForwarder,
        middleware: Arc<MiddlewareChain>,
        on_error: ErrorHook,
    ) -> Self {
        Self {
            resolver,
            rewriter: BodyRewriter::prefix_aware(),
            middleware,
            forwarder,
            on_error,
        }
    }

    /// Replace the body rewriter, e.g. to install different path mutators
    pub fn with_body_rewriter(mut self, rewriter: BodyRewriter) -> Self {
        self.rewriter = rewriter;
        self
    }

    /// Get the host resolver
    pub fn resolver(&self) -> &HostResolver {
        &self.resolver
    }

    /// Proxy one request. Failures are turned into a response by the error
    /// hook and never escape.
    pub async fn proxy<B>(&self, request: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes>,
        B::Error: std::fmt::Display,
    {
        match self.try_proxy(request).await {
            Ok(response) => response,
            Err(e) => {
                debug!("Proxy error: {}", e);
                (self.on_error)(&e)
            }
        }
    }

    async fn try_proxy<B>(&self, request: Request<B>) -> Result<Response<Full<Bytes>>>
    where
        B: Body<Data = Bytes>,
        B::Error: std::fmt::Display,
    {
        let (mut parts, body) = request.into_parts();
        let body = read_body(&parts, body).await?;

        let (target, body) = self.on_forward(&mut parts, body).await?;

        let (mut response_parts, response_body) = self.forwarder.forward(parts, body).await?;

        let response_body = self
            .on_receive(&target, &mut response_parts, response_body)
            .await?;
        Ok(Response::from_parts(response_parts, Full::new(response_body)))
    }

    /// Resolve the target and rewrite the request for the upstream
    pub async fn on_forward(
        &self,
        parts: &mut request::Parts,
        body: Bytes,
    ) -> Result<(TargetConfig, Bytes)> {
        let host = request_host(parts);
        let target = self.resolver.resolve(&host, parts.uri.path())?;

        rewrite_request_headers(parts, &target)?;

        let before = body.len();
        let mut decoded = BodyRewriter::decode(&parts.headers, body)?;
        self.rewriter.rewrite_request(&mut decoded, &target)?;

        let content = decoded.content().clone();
        let content = self.middleware.on_request(parts, &target, content).await?;
        decoded.replace(content);

        let body = decoded.encode()?;
        sync_content_length(&mut parts.headers, before, body.len());
        Ok((target, body))
    }

    /// Rewrite an upstream response for the caller
    pub async fn on_receive(
        &self,
        target: &TargetConfig,
        parts: &mut response::Parts,
        body: Bytes,
    ) -> Result<Bytes> {
        rewrite_response_headers(parts, target)?;

        let before = body.len();
        let mut decoded = BodyRewriter::decode(&parts.headers, body)?;
        self.rewriter.rewrite_response(&mut decoded, target)?;

        let content = decoded.content().clone();
        let content = self.middleware.on_response(parts, target, content).await?;
        decoded.replace(content);

        let body = decoded.encode()?;
        sync_content_length(&mut parts.headers, before, body.len());
        Ok(body)
    }
}

/// Host the caller addressed: the `Host` header, or the URI authority for
/// absolute-form requests
fn request_host(parts: &request::Parts) -> String {
    parts
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

/// Buffer a body. A declared length of zero is honored without polling the
/// body at all.
pub(crate) async fn read_body<B>(parts: &request::Parts, body: B) -> Result<Bytes>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let declared_empty = parts
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v.trim() == "0");
    if declared_empty || body.is_end_stream() {
        return Ok(Bytes::new());
    }
    let collected = body
        .collect()
        .await
        .map_err(|e| ProxyError::Body(e.to_string()))?;
    Ok(collected.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::WelcomeRedirectMiddleware;
    use hyper::header::{LOCATION, SET_COOKIE};
    use hyper::StatusCode;
    use identity_core::ProxyConfig;
    use std::time::Duration;
    use url::Url;

    fn error_hook() -> ErrorHook {
        Arc::new(|e: &ProxyError| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Full::new(Bytes::from(e.to_string())))
                .unwrap()
        })
    }

    fn proxy(tunnel: bool, middleware: MiddlewareChain) -> RewritingProxy {
        let upstream = Url::parse("http://localhost:3000").unwrap();
        let identity = Url::parse("https://upstream.internal").unwrap();
        let builder = if tunnel {
            ProxyConfig::tunnel(upstream, identity)
        } else {
            ProxyConfig::proxy(upstream, identity)
        };
        let config = builder
            .cookie_domain(Some("example.com".to_string()))
            .build()
            .unwrap();
        RewritingProxy::new(
            HostResolver::new(Arc::new(config)),
            RequestForwarder::new(Duration::from_secs(5)).unwrap(),
            Arc::new(middleware),
            error_hook(),
        )
    }

    fn request(path: &str, body: &'static str) -> request::Parts {
        let (parts, _) = Request::builder()
            .method("POST")
            .uri(path)
            .header(HOST, "localhost:4000")
            .header(CONTENT_LENGTH, body.len())
            .body(())
            .unwrap()
            .into_parts();
        parts
    }

    #[tokio::test]
    async fn test_on_forward_rewrites_identity_request() {
        let proxy = proxy(false, MiddlewareChain::new());
        let mut parts = request("/.ory/self-service/login", "return_to=http://localhost:4000/.ory/x");
        let (target, body) = proxy
            .on_forward(
                &mut parts,
                Bytes::from_static(b"return_to=http://localhost:4000/.ory/x"),
            )
            .await
            .unwrap();

        assert_eq!(target.upstream_host, "upstream.internal");
        assert_eq!(parts.uri.to_string(), "https://upstream.internal/self-service/login");
        assert_eq!(&body[..], b"return_to=http://upstream.internal/x");
        assert_eq!(parts.headers[CONTENT_LENGTH], body.len().to_string().as_str());
    }

    #[tokio::test]
    async fn test_on_forward_rejects_bad_host() {
        let proxy = proxy(false, MiddlewareChain::new());
        let mut parts = request("/", "");
        parts.headers.insert(HOST, "bad host".parse().unwrap());
        let result = proxy.on_forward(&mut parts, Bytes::new()).await;
        assert!(matches!(result, Err(ProxyError::Resolve(_))));
    }

    #[tokio::test]
    async fn test_on_receive_rewrites_cookies_and_body() {
        let proxy = proxy(false, MiddlewareChain::new());
        let mut parts = request("/.ory/ui/login", "");
        let (target, _) = proxy.on_forward(&mut parts, Bytes::new()).await.unwrap();

        let (mut response_parts, _) = Response::builder()
            .status(StatusCode::OK)
            .header(SET_COOKIE, "session=1234; Domain=upstream.internal")
            .body(())
            .unwrap()
            .into_parts();
        let body = proxy
            .on_receive(
                &target,
                &mut response_parts,
                Bytes::from_static(b"<a href=\"https://upstream.internal/ui/registration\">"),
            )
            .await
            .unwrap();

        assert_eq!(response_parts.headers[SET_COOKIE], "session=1234; Domain=example.com");
        assert_eq!(
            &body[..],
            b"<a href=\"https://localhost:4000/.ory/ui/registration\">"
        );
    }

    #[tokio::test]
    async fn test_tunnel_welcome_redirect_is_overridden() {
        let middleware = MiddlewareChain::new().add(WelcomeRedirectMiddleware::new(
            "",
            Url::parse("http://localhost:3000/").unwrap(),
        ));
        let proxy = proxy(true, middleware);
        let mut parts = request("/self-service/login", "");
        let (target, _) = proxy.on_forward(&mut parts, Bytes::new()).await.unwrap();

        let (mut response_parts, _) = Response::builder()
            .status(StatusCode::SEE_OTHER)
            .header(LOCATION, "https://upstream.internal/ui/welcome")
            .body(())
            .unwrap()
            .into_parts();
        proxy
            .on_receive(&target, &mut response_parts, Bytes::new())
            .await
            .unwrap();
        assert_eq!(response_parts.headers[LOCATION], "http://localhost:3000/");
    }

    #[tokio::test]
    async fn test_empty_declared_body_is_not_read() {
        struct Exploding;

        impl Body for Exploding {
            type Data = Bytes;
            type Error = std::convert::Infallible;

            fn poll_frame(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<Option<std::result::Result<hyper::body::Frame<Bytes>, Self::Error>>>
            {
                panic!("body must not be polled");
            }
        }

        let parts = request("/", "");
        let body = read_body(&parts, Exploding).await.unwrap();
        assert!(body.is_empty());
    }
}
