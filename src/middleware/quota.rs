use crate::identity::client_key;
use crate::quota::FixedWindowQuota;
use crate::{RejectReason, Rejection, UploadDecision, UploadGate};
use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, Response, StatusCode, header},
    middleware::Next,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// Shared state for the upload quota middleware
#[derive(Clone)]
pub struct QuotaState {
    pub gate: Arc<FixedWindowQuota>,
}

impl QuotaState {
    pub fn new(gate: Arc<FixedWindowQuota>) -> Self {
        Self { gate }
    }
}

/// Signed-in user identity, inserted into request extensions by the auth
/// layer. Absence means the request is anonymous.
#[derive(Clone, Debug)]
pub struct AuthUser {
    pub id: String,
}

/// Identity as resolved by the quota middleware, for downstream handlers
/// (the upload handler records it as the owner of the stored file).
#[derive(Clone, Debug)]
pub struct RequestIdentity {
    pub key: String,
    pub authenticated: bool,
}

/// Upload quota middleware
/// Charges the request against its identity's window before the handler
/// runs; rejected requests never reach the handler.
pub async fn upload_quota_middleware(
    State(state): State<QuotaState>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    let (user_id, origin) = request_identity(&request);
    let authenticated = user_id.is_some();
    let key = client_key(user_id.as_deref(), &origin);
    let bytes = content_length(&request);

    match state.gate.check_and_consume(&key, bytes, authenticated).await {
        UploadDecision::Admitted(admission) => {
            let mut request = request;
            request.extensions_mut().insert(admission);
            request.extensions_mut().insert(RequestIdentity {
                key,
                authenticated,
            });
            let mut response = next.run(request).await;

            // Add quota headers to response
            let headers = response.headers_mut();
            headers.insert(
                "X-RateLimit-Remaining",
                admission
                    .remaining_requests
                    .to_string()
                    .parse()
                    .expect("valid header"),
            );
            headers.insert(
                "X-RateLimit-Remaining-Bytes",
                admission
                    .remaining_bytes
                    .to_string()
                    .parse()
                    .expect("valid header"),
            );
            response
        }
        UploadDecision::Rejected(rejected) => {
            warn!(key = %key, reason = rejected.reason.code(), "upload rejected by quota");
            rejection_response(&rejected)
        }
    }
}

//JSON body for a 429, carrying the machine-readable reason code
#[derive(Serialize)]
struct QuotaErrorBody {
    error: &'static str,
    code: &'static str,
    retry_after_secs: u64,
    used_requests: u32,
    max_requests: u32,
    used_bytes: u64,
    max_bytes: u64,
}

fn rejection_response(rejected: &Rejection) -> Response<Body> {
    let retry_after_secs = rejected.retry_after.as_secs().max(1);
    let body = QuotaErrorBody {
        error: match rejected.reason {
            RejectReason::TooManyRequests => "Upload limit reached. Please try again later.",
            RejectReason::TooManyBytes => "Upload volume limit reached. Please try again later.",
        },
        code: rejected.reason.code(),
        retry_after_secs,
        used_requests: rejected.used_requests,
        max_requests: rejected.max_requests,
        used_bytes: rejected.used_bytes,
        max_bytes: rejected.max_bytes,
    };
    let mut response = Response::builder()
        .status(StatusCode::TOO_MANY_REQUESTS)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::to_string(&body).expect("serialize quota error"),
        ))
        .expect("response build");
    let headers = response.headers_mut();
    headers.insert(
        "Retry-After",
        retry_after_secs.to_string().parse().expect("valid header"),
    );
    headers.insert("X-RateLimit-Remaining", "0".parse().expect("valid header"));
    response
}

/// current usage for the requesting identity, without consuming anything
pub async fn quota_status_handler(
    State(state): State<QuotaState>,
    request: Request<Body>,
) -> Json<QuotaStatusBody> {
    let (user_id, origin) = request_identity(&request);
    let authenticated = user_id.is_some();
    let key = client_key(user_id.as_deref(), &origin);
    let status = state.gate.peek_status(&key, authenticated).await;
    Json(QuotaStatusBody {
        used_requests: status.used_requests,
        remaining_requests: status.remaining_requests,
        used_bytes: status.used_bytes,
        remaining_bytes: status.remaining_bytes,
        percent_used: status.percent_used,
        resets_in_secs: status
            .window_ends_at
            .saturating_duration_since(Instant::now())
            .as_secs(),
    })
}

#[derive(Serialize)]
pub struct QuotaStatusBody {
    pub used_requests: u32,
    pub remaining_requests: u32,
    pub used_bytes: u64,
    pub remaining_bytes: u64,
    pub percent_used: f64,
    pub resets_in_secs: u64,
}

/// Resolve the request's identity: signed-in user id from the auth layer's
/// extension, else the first X-Forwarded-For hop, else the peer address.
fn request_identity(request: &Request<Body>) -> (Option<String>, String) {
    let user_id = request
        .extensions()
        .get::<AuthUser>()
        .map(|user| user.id.clone());
    let origin = request
        .headers()
        .get("X-Forwarded-For")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|hop| hop.trim().to_string())
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string());
    (user_id, origin)
}

//candidate byte count for the prospective upload
fn content_length(request: &Request<Body>) -> u64 {
    request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request() -> Request<Body> {
        Request::builder().body(Body::empty()).unwrap()
    }

    #[test]
    fn identity_prefers_the_auth_extension() {
        let mut request = request();
        request.extensions_mut().insert(AuthUser {
            id: "u1".to_string(),
        });
        request
            .headers_mut()
            .insert("X-Forwarded-For", "1.2.3.4".parse().unwrap());
        let (user_id, _) = request_identity(&request);
        assert_eq!(user_id.as_deref(), Some("u1"));
    }

    #[test]
    fn identity_takes_the_first_forwarded_hop() {
        let mut request = request();
        request
            .headers_mut()
            .insert("X-Forwarded-For", "1.2.3.4, 10.0.0.1".parse().unwrap());
        let (user_id, origin) = request_identity(&request);
        assert!(user_id.is_none());
        assert_eq!(origin, "1.2.3.4");
    }

    #[test]
    fn identity_falls_back_to_the_peer_address() {
        let mut request = request();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([5, 6, 7, 8], 1234))));
        let (_, origin) = request_identity(&request);
        assert_eq!(origin, "5.6.7.8");
    }

    #[test]
    fn missing_content_length_counts_as_zero() {
        assert_eq!(content_length(&request()), 0);

        let mut with_length = request();
        with_length
            .headers_mut()
            .insert(header::CONTENT_LENGTH, "512".parse().unwrap());
        assert_eq!(content_length(&with_length), 512);
    }

    #[test]
    fn rejection_response_carries_retry_hints() {
        let response = rejection_response(&Rejection {
            reason: RejectReason::TooManyBytes,
            retry_after: Duration::from_secs(90),
            used_requests: 3,
            max_requests: 10,
            used_bytes: 990,
            max_bytes: 1000,
        });
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["Retry-After"], "90");
        assert_eq!(response.headers()["X-RateLimit-Remaining"], "0");
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
    }
}
