//! Process-lifetime proxy configuration
//!
//! A [`ProxyConfig`] is built once at startup through [`ProxyConfigBuilder`]
//! and shared read-only (behind an `Arc`) by every request task.

use crate::{CoreError, Result};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Default listen port
pub const DEFAULT_PORT: u16 = 4000;

/// Path prefix under which the identity service is mounted in proxy mode
pub const DEFAULT_PATH_PREFIX: &str = "/.ory";

/// Reserved JWKS path that is always served in proxy mode
pub const PROXY_JWKS_PATH: &str = "/proxy/jwks.json";

/// Operating mode of the proxy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyMode {
    /// Application traffic goes to the application upstream, identity
    /// service traffic is mounted under the path prefix
    Proxy,
    /// All traffic goes to the identity service
    Tunnel,
}

/// Immutable configuration shared by all request tasks
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub mode: ProxyMode,
    /// Port the listener binds to
    pub port: u16,
    /// Application upstream (proxy mode) or application URL (tunnel mode)
    pub upstream: Url,
    /// Domain written into rewritten `Set-Cookie` headers
    pub cookie_domain: String,
    /// URL the browser uses to reach the proxy
    pub public_url: Url,
    /// Base URL of the identity service
    pub identity_service_url: Url,
    /// Path prefix identity service traffic is mounted under
    pub path_prefix: String,
    /// Disable JWT minting entirely
    pub no_jwt: bool,
    /// Do not open the browser once the listener is up
    pub no_auto_open: bool,
    /// Target for identity-service "welcome" redirects
    pub default_redirect_url: Option<Url>,
    /// Timeout for the relay to an upstream
    pub upstream_timeout: Duration,
    /// Maximum number of session introspection attempts per request
    pub whoami_attempts: u32,
    /// Timeout for a single session introspection attempt
    pub whoami_timeout: Duration,
}

impl ProxyConfig {
    /// Start building a proxy-mode configuration
    pub fn proxy(upstream: Url, identity_service_url: Url) -> ProxyConfigBuilder {
        ProxyConfigBuilder::new(ProxyMode::Proxy, upstream, identity_service_url)
    }

    /// Start building a tunnel-mode configuration
    pub fn tunnel(application_url: Url, identity_service_url: Url) -> ProxyConfigBuilder {
        ProxyConfigBuilder::new(ProxyMode::Tunnel, application_url, identity_service_url)
    }

    pub fn is_tunnel(&self) -> bool {
        self.mode == ProxyMode::Tunnel
    }

    /// Paths answered with the JWKS document instead of being proxied
    pub fn jwks_paths(&self) -> Vec<String> {
        let mut paths = vec![format!("{}/jwks.json", self.path_prefix)];
        if self.mode == ProxyMode::Proxy {
            paths.push(PROXY_JWKS_PATH.to_string());
        }
        paths
    }

    pub fn is_jwks_path(&self, path: &str) -> bool {
        self.jwks_paths().iter().any(|p| p == path)
    }

    /// Whether a request path falls under the identity service prefix.
    ///
    /// Matching is segment-aware: `/.ory` matches `/.ory` and `/.ory/ui` but
    /// not `/.oryx`. An empty prefix matches every path.
    pub fn is_identity_path(&self, path: &str) -> bool {
        has_path_prefix(path, &self.path_prefix)
    }
}

pub(crate) fn has_path_prefix(path: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'),
        None => false,
    }
}

/// Builder applying defaults and validation for [`ProxyConfig`]
#[derive(Clone, Debug)]
pub struct ProxyConfigBuilder {
    mode: ProxyMode,
    upstream: Url,
    identity_service_url: Url,
    port: u16,
    public_url: Option<Url>,
    cookie_domain: Option<String>,
    path_prefix: Option<String>,
    no_jwt: bool,
    no_auto_open: bool,
    default_redirect_url: Option<Url>,
    upstream_timeout: Duration,
    whoami_attempts: u32,
    whoami_timeout: Duration,
}

impl ProxyConfigBuilder {
    fn new(mode: ProxyMode, upstream: Url, identity_service_url: Url) -> Self {
        Self {
            mode,
            upstream,
            identity_service_url,
            port: DEFAULT_PORT,
            public_url: None,
            cookie_domain: None,
            path_prefix: None,
            no_jwt: false,
            no_auto_open: true,
            default_redirect_url: None,
            upstream_timeout: Duration::from_secs(30),
            whoami_attempts: 5,
            whoami_timeout: Duration::from_secs(5),
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn public_url(mut self, url: Option<Url>) -> Self {
        self.public_url = url;
        self
    }

    pub fn cookie_domain(mut self, domain: Option<String>) -> Self {
        self.cookie_domain = domain.filter(|d| !d.is_empty());
        self
    }

    pub fn path_prefix(mut self, prefix: Option<String>) -> Self {
        self.path_prefix = prefix;
        self
    }

    pub fn no_jwt(mut self, no_jwt: bool) -> Self {
        self.no_jwt = no_jwt;
        self
    }

    pub fn auto_open(mut self, open: bool) -> Self {
        self.no_auto_open = !open;
        self
    }

    pub fn default_redirect_url(mut self, url: Option<Url>) -> Self {
        self.default_redirect_url = url;
        self
    }

    pub fn upstream_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_timeout = timeout;
        self
    }

    pub fn whoami_attempts(mut self, attempts: u32) -> Self {
        self.whoami_attempts = attempts;
        self
    }

    pub fn whoami_timeout(mut self, timeout: Duration) -> Self {
        self.whoami_timeout = timeout;
        self
    }

    /// Apply defaults and validate
    pub fn build(self) -> Result<ProxyConfig> {
        validate_url("upstream", &self.upstream)?;
        validate_url("identity service", &self.identity_service_url)?;

        let public_url = match self.public_url {
            Some(url) => url,
            None => {
                let raw = format!("http://localhost:{}", self.port);
                Url::parse(&raw).map_err(|e| CoreError::InvalidUrl {
                    url: raw,
                    reason: e.to_string(),
                })?
            }
        };
        validate_url("public", &public_url)?;

        let cookie_domain = match self.cookie_domain {
            Some(domain) => domain,
            // validate_url guarantees a host
            None => public_url.host_str().unwrap_or_default().to_string(),
        };

        let path_prefix = match (self.path_prefix, self.mode) {
            (Some(prefix), _) => prefix,
            (None, ProxyMode::Proxy) => DEFAULT_PATH_PREFIX.to_string(),
            (None, ProxyMode::Tunnel) => String::new(),
        };
        if !path_prefix.is_empty() && (!path_prefix.starts_with('/') || path_prefix.ends_with('/')) {
            return Err(CoreError::InvalidConfiguration(format!(
                "path prefix {:?} must start with '/' and must not end with '/'",
                path_prefix
            )));
        }
        if path_prefix.is_empty() && self.mode == ProxyMode::Proxy {
            return Err(CoreError::InvalidConfiguration(
                "proxy mode requires a non-empty path prefix".to_string(),
            ));
        }

        if self.whoami_attempts == 0 {
            return Err(CoreError::InvalidConfiguration(
                "at least one session check attempt is required".to_string(),
            ));
        }

        let default_redirect_url = match (self.default_redirect_url, self.mode) {
            (Some(url), _) => Some(url),
            (None, ProxyMode::Tunnel) => Some(self.upstream.clone()),
            (None, ProxyMode::Proxy) => None,
        };

        let config = ProxyConfig {
            mode: self.mode,
            port: self.port,
            upstream: self.upstream,
            cookie_domain,
            public_url,
            identity_service_url: self.identity_service_url,
            path_prefix,
            no_jwt: self.no_jwt,
            no_auto_open: self.no_auto_open,
            default_redirect_url,
            upstream_timeout: self.upstream_timeout,
            whoami_attempts: self.whoami_attempts,
            whoami_timeout: self.whoami_timeout,
        };
        debug!("Built proxy configuration: {:?}", config);
        Ok(config)
    }
}

fn validate_url(what: &str, url: &Url) -> Result<()> {
    if !matches!(url.scheme(), "http" | "https") {
        return Err(CoreError::InvalidUrl {
            url: url.to_string(),
            reason: format!("{} URL must use http or https", what),
        });
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(CoreError::InvalidUrl {
            url: url.to_string(),
            reason: format!("{} URL must have a host", what),
        });
    }
    Ok(())
}

/// Host and optional port of a URL, as used in `Host` headers
pub fn authority_of(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}
