//! Structured JSON error responses

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use identity_proxy::ProxyError;
use serde_json::json;
use tracing::error;

/// Status code reported for a proxy failure
pub fn status_for(e: &ProxyError) -> StatusCode {
    match e {
        ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
        ProxyError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Render a proxy failure as `{"error":{"code","status","message"}}`
pub fn error_response(e: &ProxyError) -> Response<Full<Bytes>> {
    let status = status_for(e);
    error!("Request failed with {}: {}", status.as_u16(), e);

    let body = json!({
        "error": {
            "code": status.as_u16(),
            "status": status.canonical_reason().unwrap_or_default(),
            "message": e.to_string(),
        }
    });
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::time::Duration;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&ProxyError::UpstreamTimeout(Duration::from_secs(30))),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_for(&ProxyError::Signing("boom".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_for(&ProxyError::Location("::".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_error_body() {
        let response = error_response(&ProxyError::UpstreamTimeout(Duration::from_secs(1)));
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["code"], 504);
        assert_eq!(body["error"]["status"], "Gateway Timeout");
        assert_eq!(body["error"]["message"], "Upstream did not respond within 1s");
    }
}
