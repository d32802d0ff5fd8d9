//! Claims of the token minted for an active session

use crate::session::SessionDocument;
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

/// Lifetime of a minted token, in seconds
pub const TOKEN_TTL_SECS: i64 = 60;

/// Claims carried by a minted token. The session document is embedded verbatim.
#[derive(Clone, Debug, Serialize)]
pub struct MintedJwt {
    pub iss: String,
    pub sub: String,
    pub exp: i64,
    pub nbf: i64,
    pub iat: i64,
    pub jti: String,
    pub session: SessionDocument,
}

impl MintedJwt {
    /// Build claims for `session`. Returns `None` when the document names no
    /// identity.
    pub fn new(issuer: &str, session: &SessionDocument) -> Option<Self> {
        let sub = session.identity_id()?.to_string();
        let now = Utc::now().timestamp();
        Some(Self {
            iss: issuer.to_string(),
            sub,
            exp: now + TOKEN_TTL_SECS,
            nbf: now,
            iat: now,
            jti: Uuid::new_v4().to_string(),
            session: session.clone(),
        })
    }
}
