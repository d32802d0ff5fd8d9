//! Host and path rewriting of request and response bodies
//!
//! Bodies are decoded (gzip only), every occurrence of the old host followed
//! by a run of URL path characters is substituted, and the original
//! compression is reapplied so `Content-Encoding` stays truthful. Bodies in
//! any other encoding are left byte-for-byte untouched.

use crate::{ProxyError, Result};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use hyper::body::Bytes;
use hyper::header::{HeaderMap, CONTENT_ENCODING};
use identity_core::TargetConfig;
use lru::LruCache;
use regex::bytes::{Captures, Regex};
use std::borrow::Cow;
use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// RFC 3986 path characters (pchar, plus `/` and `%` for segments and
/// percent-encoding)
const PATH_CHARS: &str = r"[A-Za-z0-9\-._~!$&'()*+,;=:@/%]*";

/// Compiled patterns kept per host
const PATTERN_CACHE_SIZE: usize = 64;

/// Largest decompressed body that is buffered for rewriting
pub const MAX_DECODED_BODY: u64 = 16 * 1024 * 1024;

/// Hook applied to the path that follows a substituted host
pub type PathMutator = Arc<dyn Fn(&str, &TargetConfig) -> String + Send + Sync>;

/// Content coding of a body as far as rewriting is concerned
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyEncoding {
    Identity,
    Gzip,
    /// Any other coding; the body is never inspected
    Opaque,
}

impl BodyEncoding {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let Some(value) = headers.get(CONTENT_ENCODING) else {
            return BodyEncoding::Identity;
        };
        match value.to_str().map(|v| v.trim().to_ascii_lowercase()) {
            Ok(v) if v.is_empty() || v == "identity" => BodyEncoding::Identity,
            Ok(v) if v == "gzip" || v == "x-gzip" => BodyEncoding::Gzip,
            _ => BodyEncoding::Opaque,
        }
    }
}

/// A body with its content coding removed, ready for rewriting
#[derive(Clone, Debug)]
pub struct DecodedBody {
    encoding: BodyEncoding,
    raw: Bytes,
    content: Bytes,
    modified: bool,
}

impl DecodedBody {
    pub fn encoding(&self) -> BodyEncoding {
        self.encoding
    }

    /// Decoded content (raw bytes for opaque encodings)
    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Replace the decoded content
    pub fn replace(&mut self, content: Bytes) {
        if content != self.content {
            self.content = content;
            self.modified = true;
        }
    }

    /// Reapply the original content coding. Unmodified bodies are returned
    /// as received.
    pub fn encode(self) -> Result<Bytes> {
        if !self.modified {
            return Ok(self.raw);
        }
        match self.encoding {
            BodyEncoding::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder
                    .write_all(&self.content)
                    .map_err(ProxyError::Compress)?;
                let compressed = encoder.finish().map_err(ProxyError::Compress)?;
                Ok(Bytes::from(compressed))
            }
            BodyEncoding::Identity | BodyEncoding::Opaque => Ok(self.content),
        }
    }
}

/// Rewrites hosts and paths inside bodies
pub struct BodyRewriter {
    request_path: PathMutator,
    response_path: PathMutator,
    patterns: Mutex<LruCache<String, Regex>>,
}

impl BodyRewriter {
    /// Create a rewriter that leaves matched paths unchanged
    pub fn new() -> Self {
        let identity: PathMutator = Arc::new(|path: &str, _: &TargetConfig| path.to_string());
        Self::with_path_mutators(identity.clone(), identity)
    }

    /// Create a rewriter that strips the path prefix on requests and
    /// restores it on responses
    pub fn prefix_aware() -> Self {
        Self::with_path_mutators(
            Arc::new(|path: &str, target: &TargetConfig| target.trim_prefix(path).to_string()),
            Arc::new(|path: &str, target: &TargetConfig| target.prepend_prefix(path)),
        )
    }

    pub fn with_path_mutators(request_path: PathMutator, response_path: PathMutator) -> Self {
        let capacity = NonZeroUsize::new(PATTERN_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            request_path,
            response_path,
            patterns: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Strip the content coding named in `headers`
    pub fn decode(headers: &HeaderMap, body: Bytes) -> Result<DecodedBody> {
        Self::decode_with_limit(headers, body, MAX_DECODED_BODY)
    }

    /// Strip the content coding, giving up on bodies that decompress to more
    /// than `limit` bytes. Those are treated as opaque and forwarded as
    /// received.
    pub fn decode_with_limit(headers: &HeaderMap, body: Bytes, limit: u64) -> Result<DecodedBody> {
        let mut encoding = BodyEncoding::from_headers(headers);
        let content = match encoding {
            BodyEncoding::Gzip if !body.is_empty() => {
                let mut decoder = MultiGzDecoder::new(&body[..]).take(limit.saturating_add(1));
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .map_err(ProxyError::Decompress)?;
                if out.len() as u64 > limit {
                    warn!(
                        "Gzip body decompresses past {} bytes, forwarding it unmodified",
                        limit
                    );
                    encoding = BodyEncoding::Opaque;
                    body.clone()
                } else {
                    Bytes::from(out)
                }
            }
            _ => body.clone(),
        };
        Ok(DecodedBody {
            encoding,
            raw: body,
            content,
            modified: false,
        })
    }

    /// Public host to upstream host
    pub fn rewrite_request(&self, body: &mut DecodedBody, target: &TargetConfig) -> Result<()> {
        self.rewrite(
            body,
            &target.original_host,
            &target.upstream_host,
            target,
            &self.request_path,
        )
    }

    /// Upstream host to public host
    pub fn rewrite_response(&self, body: &mut DecodedBody, target: &TargetConfig) -> Result<()> {
        self.rewrite(
            body,
            &target.upstream_host,
            &target.original_host,
            target,
            &self.response_path,
        )
    }

    /// Decode, rewrite and re-encode a request body
    pub fn rewrite_request_body(
        &self,
        headers: &HeaderMap,
        body: Bytes,
        target: &TargetConfig,
    ) -> Result<Bytes> {
        if body.is_empty() {
            return Ok(body);
        }
        let mut decoded = Self::decode(headers, body)?;
        self.rewrite_request(&mut decoded, target)?;
        decoded.encode()
    }

    /// Decode, rewrite and re-encode a response body
    pub fn rewrite_response_body(
        &self,
        headers: &HeaderMap,
        body: Bytes,
        target: &TargetConfig,
    ) -> Result<Bytes> {
        if body.is_empty() {
            return Ok(body);
        }
        let mut decoded = Self::decode(headers, body)?;
        self.rewrite_response(&mut decoded, target)?;
        decoded.encode()
    }

    fn rewrite(
        &self,
        body: &mut DecodedBody,
        old_host: &str,
        new_host: &str,
        target: &TargetConfig,
        mutate: &PathMutator,
    ) -> Result<()> {
        if body.encoding == BodyEncoding::Opaque || body.content.is_empty() || old_host.is_empty() {
            return Ok(());
        }

        let pattern = self.pattern(old_host)?;
        let content = body.content.clone();
        let rewritten = pattern.replace_all(&content, |caps: &Captures| {
            let path = String::from_utf8_lossy(&caps[1]);
            let mut out = Vec::with_capacity(new_host.len() + path.len());
            out.extend_from_slice(new_host.as_bytes());
            out.extend_from_slice(mutate(&path, target).as_bytes());
            out
        });

        if let Cow::Owned(rewritten) = rewritten {
            debug!("Rewrote {} -> {} in body", old_host, new_host);
            body.replace(Bytes::from(rewritten));
        }
        Ok(())
    }

    fn pattern(&self, host: &str) -> Result<Regex> {
        if let Some(re) = self.patterns.lock().ok().and_then(|mut c| c.get(host).cloned()) {
            return Ok(re);
        }
        let re = Regex::new(&format!("{}({})", regex::escape(host), PATH_CHARS))?;
        if let Ok(mut cache) = self.patterns.lock() {
            cache.put(host.to_string(), re.clone());
        }
        Ok(re)
    }
}

impl Default for BodyRewriter {
    fn default() -> Self {
        Self::new()
    }
}
