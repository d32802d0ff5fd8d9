//! Per-request rewrite target
use crate::config::has_path_prefix;
use serde::{Deserialize, Serialize};

/// Upstream and rewriting rules resolved for one request.
///
/// Exactly one is resolved per request and it determines how both the
/// request and its paired response are rewritten.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Domain written into rewritten cookies
    pub cookie_domain: String,
    /// Upstream authority (host and optional port)
    pub upstream_host: String,
    /// Upstream scheme, `http` or `https`
    pub upstream_scheme: String,
    /// Value of the `Host` header sent upstream
    pub target_host: String,
    /// Path prefix stripped on the way in and restored on the way out
    pub path_prefix: String,
    /// Authority the caller addressed the proxy as
    pub original_host: String,
    /// Scheme the caller addressed the proxy with
    pub original_scheme: String,
}

impl TargetConfig {
    /// Upstream host without the port, as it appears in cookie domains
    pub fn upstream_hostname(&self) -> &str {
        strip_port(&self.upstream_host)
    }

    /// Remove the path prefix from a path fragment without normalizing the
    /// remainder. Used for paths embedded in bodies.
    pub fn trim_prefix<'a>(&self, path: &'a str) -> &'a str {
        if self.path_prefix.is_empty() || !has_path_prefix(path, &self.path_prefix) {
            return path;
        }
        &path[self.path_prefix.len()..]
    }

    /// Remove the path prefix from a request path. An empty remainder
    /// becomes `/`.
    pub fn strip_prefix(&self, path: &str) -> String {
        let rest = self.trim_prefix(path);
        if rest.is_empty() || rest.starts_with('?') {
            format!("/{}", rest)
        } else {
            rest.to_string()
        }
    }

    /// Prepend the path prefix to a path
    pub fn prepend_prefix(&self, path: &str) -> String {
        format!("{}{}", self.path_prefix, path)
    }
}

fn strip_port(authority: &str) -> &str {
    // bracketed IPv6 literal
    if let Some(end) = authority.find(']') {
        return &authority[..=end];
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    }
}
