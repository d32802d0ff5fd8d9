//! Process-lifetime signing key and its public JWKS projection

use crate::{ProxyError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hyper::body::Bytes;
use jsonwebtoken::jwk::{
    AlgorithmParameters, CommonParameters, EllipticCurve, EllipticCurveKeyParameters,
    EllipticCurveKeyType, Jwk, JwkSet, KeyAlgorithm, PublicKeyUse,
};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::EncodePrivateKey;
use p256::SecretKey;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// One ES256 key pair plus the public JWK Set describing it.
///
/// Immutable after construction. An empty set publishes no keys and refuses
/// to sign.
pub struct SigningKeySet {
    key_id: Option<String>,
    encoding_key: Option<EncodingKey>,
    jwks: JwkSet,
}

impl SigningKeySet {
    /// Generate a fresh P-256 key pair
    pub fn generate() -> Result<Self> {
        let secret = SecretKey::random(&mut rand::rngs::OsRng);

        let der = secret
            .to_pkcs8_der()
            .map_err(|e| ProxyError::KeyGeneration(e.to_string()))?;
        let encoding_key = EncodingKey::from_ec_der(der.as_bytes());

        let point = secret.public_key().to_encoded_point(false);
        let (Some(x), Some(y)) = (point.x(), point.y()) else {
            return Err(ProxyError::KeyGeneration(
                "public key has no affine coordinates".to_string(),
            ));
        };

        let key_id = Uuid::new_v4().to_string();
        let jwk = Jwk {
            common: CommonParameters {
                public_key_use: Some(PublicKeyUse::Signature),
                key_algorithm: Some(KeyAlgorithm::ES256),
                key_id: Some(key_id.clone()),
                ..Default::default()
            },
            algorithm: AlgorithmParameters::EllipticCurve(EllipticCurveKeyParameters {
                key_type: EllipticCurveKeyType::EC,
                curve: EllipticCurve::P256,
                x: URL_SAFE_NO_PAD.encode(x),
                y: URL_SAFE_NO_PAD.encode(y),
            }),
        };

        Ok(Self {
            key_id: Some(key_id),
            encoding_key: Some(encoding_key),
            jwks: JwkSet { keys: vec![jwk] },
        })
    }

    /// A set with no key, used when minting is disabled
    pub fn empty() -> Self {
        Self {
            key_id: None,
            encoding_key: None,
            jwks: JwkSet { keys: Vec::new() },
        }
    }

    pub fn key_id(&self) -> Option<&str> {
        self.key_id.as_deref()
    }

    pub fn jwks(&self) -> &JwkSet {
        &self.jwks
    }

    pub fn is_empty(&self) -> bool {
        self.encoding_key.is_none()
    }

    /// Sign `claims` with ES256. The header carries only `typ` and `alg`.
    pub fn sign<T: Serialize>(&self, claims: &T) -> Result<String> {
        let key = self
            .encoding_key
            .as_ref()
            .ok_or_else(|| ProxyError::Signing("no signing key available".to_string()))?;
        jsonwebtoken::encode(&Header::new(Algorithm::ES256), claims, key)
            .map_err(|e| ProxyError::Signing(e.to_string()))
    }

    /// The JWK Set serialized as a JSON document
    pub fn jwks_document(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(&self.jwks)?))
    }
}

/// Owns the signing key for the life of the process
pub struct KeyManager {
    keys: Arc<SigningKeySet>,
}

impl KeyManager {
    /// Generate the process key, or an empty set when minting is disabled
    pub fn new(no_jwt: bool) -> Result<Self> {
        let keys = if no_jwt {
            info!("JWT minting disabled, publishing an empty JWKS");
            SigningKeySet::empty()
        } else {
            let keys = SigningKeySet::generate()?;
            info!("Generated ES256 signing key {}", keys.key_id().unwrap_or_default());
            keys
        };
        Ok(Self {
            keys: Arc::new(keys),
        })
    }

    /// Read-only handle to the key set
    pub fn keys(&self) -> Arc<SigningKeySet> {
        Arc::clone(&self.keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
    use serde::Deserialize;
    use serde_json::Value;

    #[derive(Serialize, Deserialize)]
    struct Claims {
        sub: String,
        exp: i64,
    }

    #[test]
    fn test_generated_jwks_shape() {
        let keys = SigningKeySet::generate().unwrap();
        let doc: Value = serde_json::from_slice(&keys.jwks_document().unwrap()).unwrap();
        let key = &doc["keys"][0];
        assert_eq!(doc["keys"].as_array().unwrap().len(), 1);
        assert_eq!(key["kty"], "EC");
        assert_eq!(key["crv"], "P-256");
        assert_eq!(key["use"], "sig");
        assert_eq!(key["alg"], "ES256");
        assert_eq!(key["kid"], keys.key_id().unwrap());
        assert!(key.get("d").is_none());
    }

    #[test]
    fn test_sign_and_verify_against_jwks() {
        let keys = SigningKeySet::generate().unwrap();
        let claims = Claims {
            sub: "abc".to_string(),
            exp: chrono::Utc::now().timestamp() + 60,
        };
        let token = keys.sign(&claims).unwrap();

        let header = decode_header(&token).unwrap();
        assert_eq!(header.alg, Algorithm::ES256);
        assert_eq!(header.kid, None);

        let decoding = DecodingKey::from_jwk(&keys.jwks().keys[0]).unwrap();
        let data = decode::<Claims>(&token, &decoding, &Validation::new(Algorithm::ES256)).unwrap();
        assert_eq!(data.claims.sub, "abc");
    }

    #[test]
    fn test_each_key_is_fresh() {
        let a = SigningKeySet::generate().unwrap();
        let b = SigningKeySet::generate().unwrap();
        assert_ne!(a.key_id(), b.key_id());
        let a = serde_json::to_value(a.jwks()).unwrap();
        let b = serde_json::to_value(b.jwks()).unwrap();
        assert_ne!(a["keys"][0]["x"], b["keys"][0]["x"]);
    }

    #[test]
    fn test_disabled_manager_has_empty_set() {
        let manager = KeyManager::new(true).unwrap();
        let keys = manager.keys();
        assert!(keys.is_empty());
        assert_eq!(&keys.jwks_document().unwrap()[..], br#"{"keys":[]}"#);
        assert!(matches!(
            keys.sign(&Claims { sub: "x".into(), exp: 0 }),
            Err(ProxyError::Signing(_))
        ));
    }

    #[test]
    fn test_manager_shares_one_key() {
        let manager = KeyManager::new(false).unwrap();
        assert!(Arc::ptr_eq(&manager.keys(), &manager.keys()));
        assert!(!manager.keys().is_empty());
    }
}
