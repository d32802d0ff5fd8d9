//! Request header, redirect and cookie rewriting

use crate::{ProxyError, Result};
use cookie::Cookie;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, HOST, LOCATION, SET_COOKIE, USER_AGENT};
use hyper::http::{request, response, Uri};
use identity_core::TargetConfig;
use tracing::debug;
use url::Url;

const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Point a request at its upstream.
///
/// The path prefix is stripped, the URI is made absolute against the
/// upstream and the `Host` header is set to the target host. A missing
/// `User-Agent` is set to the empty string so the relay does not add one.
pub fn rewrite_request_headers(parts: &mut request::Parts, target: &TargetConfig) -> Result<()> {
    let path = target.strip_prefix(parts.uri.path());
    let path_and_query = match parts.uri.query() {
        Some(query) => format!("{}?{}", path, query),
        None => path,
    };
    let uri: Uri = format!(
        "{}://{}{}",
        target.upstream_scheme, target.upstream_host, path_and_query
    )
    .parse()?;
    debug!("Rewrote request URI {} -> {}", parts.uri, uri);
    parts.uri = uri;

    parts
        .headers
        .insert(HOST, HeaderValue::from_str(&target.target_host)?);
    parts
        .headers
        .insert(X_FORWARDED_HOST, HeaderValue::from_str(&target.original_host)?);
    parts
        .headers
        .insert(X_FORWARDED_PROTO, HeaderValue::from_str(&target.original_scheme)?);

    if !parts.headers.contains_key(USER_AGENT) {
        parts.headers.insert(USER_AGENT, HeaderValue::from_static(""));
    }
    Ok(())
}

/// Rewrite `Location` and `Set-Cookie` on a response coming back from the
/// upstream
pub fn rewrite_response_headers(parts: &mut response::Parts, target: &TargetConfig) -> Result<()> {
    rewrite_location(&mut parts.headers, target)?;
    rewrite_set_cookies(&mut parts.headers, target);
    Ok(())
}

fn rewrite_location(headers: &mut HeaderMap, target: &TargetConfig) -> Result<()> {
    let Some(value) = headers.get(LOCATION) else {
        return Ok(());
    };
    let location = value
        .to_str()
        .map_err(|_| ProxyError::Location(String::from_utf8_lossy(value.as_bytes()).into_owned()))?
        .to_string();

    let rewritten = match Url::parse(&location) {
        Ok(url) => {
            if url.host_str().is_none() || !same_authority(&url, &target.upstream_host) {
                debug!("Leaving foreign redirect untouched: {}", location);
                return Ok(());
            }
            let mut out = format!(
                "{}://{}{}",
                target.original_scheme,
                target.original_host,
                target.prepend_prefix(url.path())
            );
            if let Some(query) = url.query() {
                out.push('?');
                out.push_str(query);
            }
            if let Some(fragment) = url.fragment() {
                out.push('#');
                out.push_str(fragment);
            }
            out
        }
        Err(url::ParseError::RelativeUrlWithoutBase) if location.starts_with('/') && !location.starts_with("//") => {
            target.prepend_prefix(&location)
        }
        Err(url::ParseError::RelativeUrlWithoutBase) => return Ok(()),
        Err(_) => return Err(ProxyError::Location(location)),
    };

    debug!("Rewrote redirect {} -> {}", location, rewritten);
    headers.insert(LOCATION, HeaderValue::from_str(&rewritten)?);
    Ok(())
}

fn same_authority(url: &Url, authority: &str) -> bool {
    let host = url.host_str().unwrap_or_default();
    let candidate = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    candidate.eq_ignore_ascii_case(authority)
}

fn rewrite_set_cookies(headers: &mut HeaderMap, target: &TargetConfig) {
    let cookies: Vec<HeaderValue> = headers.get_all(SET_COOKIE).iter().cloned().collect();
    if cookies.is_empty() {
        return;
    }
    headers.remove(SET_COOKIE);

    for cookie in cookies {
        let rewritten = cookie
            .to_str()
            .ok()
            .and_then(|raw| rewrite_cookie_domain(raw, target.upstream_hostname(), &target.cookie_domain))
            .and_then(|raw| HeaderValue::from_str(&raw).ok());
        headers.append(SET_COOKIE, rewritten.unwrap_or(cookie));
    }
}

/// Rewrite the `Domain` attribute of a `Set-Cookie` value when it names the
/// upstream host. Returns `None` when the cookie is left as is, including
/// values that do not parse as a cookie.
pub fn rewrite_cookie_domain(raw: &str, upstream_host: &str, cookie_domain: &str) -> Option<String> {
    let mut cookie = Cookie::parse(raw).ok()?;
    let domain = cookie.domain()?.trim_start_matches('.');
    if !domain.eq_ignore_ascii_case(upstream_host) {
        return None;
    }
    cookie.set_domain(cookie_domain.to_string());
    debug!("Rewrote cookie domain {} -> {}", upstream_host, cookie_domain);
    Some(cookie.to_string())
}
