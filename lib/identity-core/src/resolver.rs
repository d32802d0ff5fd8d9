//! Host resolution: which upstream serves a request and how it is rewritten

use crate::config::authority_of;
use crate::{CoreError, ProxyConfig, Result, TargetConfig};
use http::uri::Authority;
use std::sync::Arc;
use tracing::debug;

/// HostResolver maps an inbound host and path to a [`TargetConfig`].
///
/// Resolution is a pure function of its inputs and the immutable
/// [`ProxyConfig`], so a resolver can be shared freely between tasks.
#[derive(Clone, Debug)]
pub struct HostResolver {
    config: Arc<ProxyConfig>,
}

impl HostResolver {
    pub fn new(config: Arc<ProxyConfig>) -> Self {
        Self { config }
    }

    /// Get the proxy configuration
    pub fn config(&self) -> &Arc<ProxyConfig> {
        &self.config
    }

    /// Resolve the target for a request addressed to `host` at `path`
    pub fn resolve(&self, host: &str, path: &str) -> Result<TargetConfig> {
        let original_host = parse_host(host)?;
        let config = &self.config;

        let target = if config.is_tunnel() || config.is_identity_path(path) {
            let upstream = &config.identity_service_url;
            TargetConfig {
                cookie_domain: config.cookie_domain.clone(),
                upstream_host: authority_of(upstream),
                upstream_scheme: upstream.scheme().to_string(),
                target_host: authority_of(upstream),
                path_prefix: config.path_prefix.clone(),
                original_host,
                original_scheme: config.public_url.scheme().to_string(),
            }
        } else {
            let upstream = &config.upstream;
            TargetConfig {
                cookie_domain: config.cookie_domain.clone(),
                upstream_host: authority_of(upstream),
                upstream_scheme: upstream.scheme().to_string(),
                target_host: authority_of(upstream),
                path_prefix: String::new(),
                original_host,
                original_scheme: config.public_url.scheme().to_string(),
            }
        };

        debug!(
            "Resolved {}{} -> {}://{} (prefix {:?})",
            host, path, target.upstream_scheme, target.upstream_host, target.path_prefix
        );
        Ok(target)
    }
}

fn parse_host(host: &str) -> Result<String> {
    let host = host.trim();
    if host.is_empty() {
        return Err(CoreError::InvalidHost(host.to_string()));
    }
    let authority: Authority = host
        .parse()
        .map_err(|_| CoreError::InvalidHost(host.to_string()))?;
    if authority.as_str().contains('@') {
        return Err(CoreError::InvalidHost(host.to_string()));
    }
    Ok(authority.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn proxy_resolver() -> HostResolver {
        let config = ProxyConfig::proxy(
            Url::parse("http://localhost:3000").unwrap(),
            Url::parse("https://slug.projects.example.com").unwrap(),
        )
        .build()
        .unwrap();
        HostResolver::new(Arc::new(config))
    }

    fn tunnel_resolver() -> HostResolver {
        let config = ProxyConfig::tunnel(
            Url::parse("http://localhost:3000").unwrap(),
            Url::parse("https://slug.projects.example.com").unwrap(),
        )
        .build()
        .unwrap();
        HostResolver::new(Arc::new(config))
    }

    #[test]
    fn test_identity_paths_go_to_identity_service() {
        let target = proxy_resolver().resolve("localhost:4000", "/.ory/ui/login").unwrap();
        assert_eq!(target.upstream_host, "slug.projects.example.com");
        assert_eq!(target.upstream_scheme, "https");
        assert_eq!(target.target_host, "slug.projects.example.com");
        assert_eq!(target.path_prefix, "/.ory");
        assert_eq!(target.original_host, "localhost:4000");
        assert_eq!(target.original_scheme, "http");
        assert_eq!(target.cookie_domain, "localhost");
    }

    #[test]
    fn test_other_paths_go_to_application() {
        let target = proxy_resolver().resolve("localhost:4000", "/dashboard").unwrap();
        assert_eq!(target.upstream_host, "localhost:3000");
        assert_eq!(target.upstream_scheme, "http");
        assert_eq!(target.path_prefix, "");
    }

    #[test]
    fn test_tunnel_mode_routes_everything_to_identity_service() {
        let resolver = tunnel_resolver();
        for path in ["/", "/dashboard", "/.ory/ui/login", "/self-service/login/browser"] {
            let target = resolver.resolve("localhost:4000", path).unwrap();
            assert_eq!(target.upstream_host, "slug.projects.example.com");
        }
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let resolver = proxy_resolver();
        let a = resolver.resolve("localhost:4000", "/.ory/x").unwrap();
        let b = resolver.resolve("localhost:4000", "/.ory/x").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_invalid_host_is_an_error() {
        let resolver = proxy_resolver();
        assert!(matches!(resolver.resolve("", "/"), Err(CoreError::InvalidHost(_))));
        assert!(matches!(resolver.resolve("bad host", "/"), Err(CoreError::InvalidHost(_))));
        assert!(matches!(resolver.resolve("user@evil.com", "/"), Err(CoreError::InvalidHost(_))));
    }
}
