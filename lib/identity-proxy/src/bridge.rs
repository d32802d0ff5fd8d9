//! Session to JWT bridge in front of the rewriting proxy
//!
//! Every request first loses its inbound `Authorization` header. JWKS paths
//! are answered directly. Everything else is checked against the identity
//! service and, for an active session, forwarded with a freshly minted
//! `Authorization: Bearer` token.

use crate::jwt::MintedJwt;
use crate::keys::SigningKeySet;
use crate::proxy::{ErrorHook, RewritingProxy};
use crate::session::{SessionCheck, SessionChecker, SessionDocument};
use crate::{ProxyError, Result};
use http_body_util::Full;
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderValue, AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use identity_core::ProxyConfig;
use std::sync::Arc;
use tracing::{debug, warn};

/// Per-request state of the bridge
enum Outcome {
    /// Forward with a minted token
    Issued(String),
    /// Forward without any `Authorization` header
    Passthrough,
}

pub struct SessionJwtBridge {
    config: Arc<ProxyConfig>,
    checker: SessionChecker,
    keys: Arc<SigningKeySet>,
    proxy: Arc<RewritingProxy>,
    on_error: ErrorHook,
}

impl SessionJwtBridge {
    pub fn new(
        config: Arc<ProxyConfig>,
        checker: SessionChecker,
        keys: Arc<SigningKeySet>,
        proxy: Arc<RewritingProxy>,
        on_error: ErrorHook,
    ) -> Self {
        Self {
            config,
            checker,
            keys,
            proxy,
            on_error,
        }
    }

    /// Handle one inbound request
    pub async fn handle<B>(&self, mut request: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes>,
        B::Error: std::fmt::Display,
    {
        let original_headers = request.headers().clone();
        request.headers_mut().remove(AUTHORIZATION);

        let path = request.uri().path().to_string();
        if self.config.is_jwks_path(&path) {
            debug!("Serving JWKS on {}", path);
            return self.jwks_response();
        }

        let outcome = if self.config.no_jwt || self.config.is_identity_path(&path) {
            Outcome::Passthrough
        } else {
            match self.checker.check(&original_headers).await {
                SessionCheck::Active(session) => match self.mint(&session) {
                    Ok(Some(token)) => Outcome::Issued(token),
                    Ok(None) => Outcome::Passthrough,
                    Err(e) => return (self.on_error)(&e),
                },
                SessionCheck::Inactive => Outcome::Passthrough,
                SessionCheck::Unavailable(reason) => {
                    warn!("Session check unavailable, forwarding without token: {}", reason);
                    Outcome::Passthrough
                }
            }
        };

        debug!("Session outcome for {}: {}", path, outcome_label(&outcome));
        if let Outcome::Issued(token) = outcome {
            match HeaderValue::from_str(&format!("Bearer {}", token)) {
                Ok(value) => {
                    request.headers_mut().insert(AUTHORIZATION, value);
                }
                Err(e) => return (self.on_error)(&ProxyError::from(e)),
            }
        }

        self.proxy.proxy(request).await
    }

    fn mint(&self, session: &SessionDocument) -> Result<Option<String>> {
        let Some(claims) = MintedJwt::new(self.config.identity_service_url.as_str(), session) else {
            return Ok(None);
        };
        self.keys.sign(&claims).map(Some)
    }

    fn jwks_response(&self) -> Response<Full<Bytes>> {
        let document = match self.keys.jwks_document() {
            Ok(document) => document,
            Err(e) => return (self.on_error)(&e),
        };
        let mut response = Response::new(Full::new(document));
        *response.status_mut() = StatusCode::OK;
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
        response
    }
}

fn outcome_label(outcome: &Outcome) -> &'static str {
    match outcome {
        Outcome::Issued(_) => "jwt-issued",
        Outcome::Passthrough => "passthrough",
    }
}
