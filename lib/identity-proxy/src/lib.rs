//! Identity-aware rewriting reverse proxy
//!
//! Rewrites hosts, paths, cookies and redirects between a public address and
//! an upstream, and bridges identity-service sessions into short-lived JWTs.
pub mod body;
pub mod bridge;
pub mod error;
pub mod forwarder;
pub mod headers;
pub mod jwt;
pub mod keys;
pub mod middleware;
pub mod policy;
pub mod proxy;
pub mod session;


pub use body::BodyRewriter;
pub use bridge::SessionJwtBridge;
pub use error::{ProxyError, Result};
pub use forwarder::RequestForwarder;
pub use jwt::MintedJwt;
pub use keys::{KeyManager, SigningKeySet};
pub use middleware::{LoggingMiddleware, Middleware, MiddlewareChain, WelcomeRedirectMiddleware};
pub use policy::RetryPolicy;
pub use proxy::{ErrorHook, RewritingProxy};
pub use session::{SessionCheck, SessionChecker, SessionDocument};
