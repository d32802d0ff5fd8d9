//! Session introspection against the identity service's `whoami` endpoint

use crate::policy::RetryPolicy;
use crate::{ProxyError, Result};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, COOKIE};
use identity_core::CoreError;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::time::{sleep, timeout as tokio_timeout};
use tracing::{debug, warn};
use url::Url;

/// Path of the session introspection endpoint below the identity service URL
pub const WHOAMI_PATH: &str = "/api/kratos/public/sessions/whoami";

/// Request headers carried over to the introspection call
const FORWARDED_HEADERS: [HeaderName; 4] = [
    COOKIE,
    AUTHORIZATION,
    HeaderName::from_static("x-session-token"),
    HeaderName::from_static("x-request-id"),
];

/// Session document returned by the identity service.
///
/// Only `active` and `identity.id` are interpreted; the document is otherwise
/// carried verbatim.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(transparent)]
pub struct SessionDocument(Value);

impl SessionDocument {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn is_active(&self) -> bool {
        self.0.get("active").and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn identity_id(&self) -> Option<&str> {
        self.0
            .get("identity")
            .and_then(|identity| identity.get("id"))
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

/// Terminal result of a session check
#[derive(Clone, Debug, PartialEq)]
pub enum SessionCheck {
    /// The caller has an active session
    Active(SessionDocument),
    /// The identity service answered and the caller has no usable session
    Inactive,
    /// The identity service could not give an answer
    Unavailable(String),
}

/// Outcome of a single attempt
enum Attempt {
    Done(SessionCheck),
    Transient(String),
}

/// Client for the identity service's session introspection endpoint
pub struct SessionChecker {
    client: reqwest::Client,
    whoami_url: Url,
    policy: RetryPolicy,
    attempt_timeout: Duration,
}

impl SessionChecker {
    pub fn new(identity_service_url: &Url, policy: RetryPolicy, attempt_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Self::with_client(client, identity_service_url, policy, attempt_timeout)
    }

    pub fn with_client(
        client: reqwest::Client,
        identity_service_url: &Url,
        policy: RetryPolicy,
        attempt_timeout: Duration,
    ) -> Result<Self> {
        let raw = format!(
            "{}{}",
            identity_service_url.as_str().trim_end_matches('/'),
            WHOAMI_PATH
        );
        let whoami_url = Url::parse(&raw).map_err(|e| CoreError::InvalidUrl {
            url: raw.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            client,
            whoami_url,
            policy,
            attempt_timeout,
        })
    }

    pub fn whoami_url(&self) -> &Url {
        &self.whoami_url
    }

    /// Check the session carried by `headers`, retrying transient failures
    /// until the attempt budget is spent
    pub async fn check(&self, headers: &HeaderMap) -> SessionCheck {
        let forwarded = forwarded_headers(headers);
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.attempt(&forwarded).await {
                Attempt::Done(check) => {
                    debug!("Session check finished after {} attempt(s)", attempts);
                    return check;
                }
                Attempt::Transient(reason) if self.policy.has_attempts_left(attempts) => {
                    let backoff = self.policy.backoff_duration(attempts - 1);
                    debug!(
                        "Session check attempt {} failed ({}), retrying in {:?}",
                        attempts, reason, backoff
                    );
                    sleep(backoff).await;
                }
                Attempt::Transient(reason) => {
                    warn!("Session check gave up after {} attempt(s): {}", attempts, reason);
                    return SessionCheck::Unavailable(reason);
                }
            }
        }
    }

    /// One attempt, bounded as a whole by the per-attempt timeout
    async fn attempt(&self, headers: &HeaderMap) -> Attempt {
        match tokio_timeout(self.attempt_timeout, self.exchange(headers)).await {
            Ok(attempt) => attempt,
            Err(_) => Attempt::Transient(ProxyError::UpstreamTimeout(self.attempt_timeout).to_string()),
        }
    }

    async fn exchange(&self, headers: &HeaderMap) -> Attempt {
        let response = match self
            .client
            .get(self.whoami_url.clone())
            .headers(headers.clone())
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return Attempt::Transient(ProxyError::Upstream(e).to_string()),
        };

        let status = response.status();
        if self.policy.should_retry(status.as_u16()) {
            return Attempt::Transient(format!("identity service returned {}", status));
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Attempt::Done(SessionCheck::Inactive);
        }
        if !status.is_success() {
            return Attempt::Done(SessionCheck::Unavailable(format!(
                "identity service returned {}",
                status
            )));
        }

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => return Attempt::Transient(ProxyError::Upstream(e).to_string()),
        };
        let document = match serde_json::from_slice::<Value>(&body) {
            Ok(value) => SessionDocument::new(value),
            Err(e) => {
                return Attempt::Done(SessionCheck::Unavailable(format!(
                    "invalid session document: {}",
                    e
                )))
            }
        };

        if document.is_active() && document.identity_id().is_some() {
            Attempt::Done(SessionCheck::Active(document))
        } else {
            Attempt::Done(SessionCheck::Inactive)
        }
    }
}

fn forwarded_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::new();
    for name in FORWARDED_HEADERS.iter() {
        for value in headers.get_all(name) {
            forwarded.append(name.clone(), value.clone());
        }
    }
    forwarded.insert(ACCEPT, HeaderValue::from_static("application/json"));
    forwarded
}
