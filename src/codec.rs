//! Pure request/response translation between [`PushNotification`]/[`Response`]
//! and the HTTP/2 headers and body bytes APNs speaks on the wire (§4.1).
//!
//! Nothing here touches a socket or shared state; `encode_request` and
//! `decode_response` are plain functions so the connection state machine can
//! call them without holding anything but the bytes in front of it.

use http::{HeaderValue, Request};
use serde::Deserialize;
use uuid::Uuid;

use crate::notification::PushNotification;
use crate::response::{RejectionReason, Response};

/// A request ready to hand to the transport: headers plus a body.
pub struct EncodedRequest {
    pub request: Request<()>,
    pub body: Vec<u8>,
}

/// Encode `notification` as a request against `authority` (`host:port`).
///
/// `bearer_token` is `None` in mTLS mode, where client certificate
/// authentication stands in for the `authorization` header.
pub fn encode_request(
    notification: &PushNotification,
    authority: &str,
    bearer_token: Option<&str>,
) -> EncodedRequest {
    let path = format!("/3/device/{}", notification.device_token());
    let body = notification.payload().to_vec();

    let mut builder = Request::builder()
        .method("POST")
        .uri(format!("https://{authority}{path}"))
        .header("content-length", body.len());

    if let Some(topic) = notification.topic() {
        builder = builder.header("apns-topic", topic);
    }
    builder = builder.header("apns-push-type", notification.push_type().header_value());
    builder = builder.header("apns-priority", notification.priority().header_value());

    if let Some(expiration) = notification.expiration() {
        let secs = expiration
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        builder = builder.header("apns-expiration", secs.to_string());
    }
    if let Some(collapse_id) = notification.collapse_id() {
        builder = builder.header("apns-collapse-id", collapse_id);
    }
    if let Some(apns_id) = notification.apns_id() {
        builder = builder.header("apns-id", apns_id.to_string());
    }
    if let Some(token) = bearer_token {
        builder = builder.header(
            "authorization",
            HeaderValue::from_str(&format!("bearer {token}"))
                .unwrap_or_else(|_| HeaderValue::from_static("bearer")),
        );
    }

    let request = builder
        .body(())
        .expect("header values are all constructed from valid ASCII/UTF-8 inputs");

    EncodedRequest { request, body }
}

#[derive(Deserialize)]
struct ErrorBody {
    reason: String,
    timestamp: Option<u64>,
}

/// Decode a server response: status, headers, and the (possibly empty) body
/// already accumulated by the stream correlator.
pub fn decode_response(status: u16, apns_id_header: Option<&str>, body: &[u8]) -> Response {
    let apns_id = apns_id_header.and_then(|v| Uuid::parse_str(v).ok());

    if status == 200 {
        return Response::Accepted {
            apns_id: apns_id.unwrap_or_else(Uuid::nil),
        };
    }

    let parsed: Option<ErrorBody> = serde_json::from_slice(body).ok();
    let reason = match &parsed {
        Some(err) => RejectionReason::from_canonical_text(&err.reason, status),
        None => RejectionReason::Unknown {
            text: String::from_utf8_lossy(body).into_owned(),
            status,
        },
    };

    let token_invalidation_timestamp = if matches!(reason, RejectionReason::Unregistered) {
        parsed
            .and_then(|err| err.timestamp)
            .map(|secs| std::time::UNIX_EPOCH + std::time::Duration::from_secs(secs))
    } else {
        None
    };

    Response::Rejected {
        apns_id,
        reason,
        token_invalidation_timestamp,
    }
}

/// Validate a notification's payload size against the wire limit before it
/// ever reaches a stream, per §4.1 — a synthesized local rejection instead
/// of a round trip. `PushNotification::builder` already enforces this at
/// construction; this helper exists for callers (e.g. the connection state
/// machine) that re-check a notification pulled off a retry queue.
pub fn check_payload_size(notification: &PushNotification) -> Result<(), RejectionReason> {
    if notification.payload().len() > crate::notification::MAX_PAYLOAD_SIZE {
        return Err(RejectionReason::PayloadTooLarge);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::{Priority, PushType};

    fn token() -> String {
        "a".repeat(64)
    }

    #[test]
    fn encodes_headers_and_path() {
        let n = PushNotification::builder(token(), br#"{"aps":{}}"#.to_vec())
            .topic("com.example.app")
            .priority(Priority::ConservePower)
            .push_type(PushType::Background)
            .collapse_id("batch-1")
            .build()
            .unwrap();

        let encoded = encode_request(&n, "api.push.apple.com:443", Some("jwt-value"));

        assert_eq!(
            encoded.request.uri().path(),
            format!("/3/device/{}", token())
        );
        assert_eq!(
            encoded.request.headers().get("apns-topic").unwrap(),
            "com.example.app"
        );
        assert_eq!(
            encoded.request.headers().get("apns-push-type").unwrap(),
            "background"
        );
        assert_eq!(
            encoded.request.headers().get("apns-priority").unwrap(),
            "5"
        );
        assert_eq!(
            encoded.request.headers().get("apns-collapse-id").unwrap(),
            "batch-1"
        );
        assert_eq!(
            encoded.request.headers().get("authorization").unwrap(),
            "bearer jwt-value"
        );
        assert_eq!(encoded.body, br#"{"aps":{}}"#);
    }

    #[test]
    fn omits_authorization_header_in_mtls_mode() {
        let n = PushNotification::builder(token(), b"{}".to_vec())
            .build()
            .unwrap();
        let encoded = encode_request(&n, "api.push.apple.com:443", None);
        assert!(encoded.request.headers().get("authorization").is_none());
    }

    #[test]
    fn decodes_a_200_as_accepted() {
        let id = Uuid::new_v4();
        let response = decode_response(200, Some(&id.to_string()), b"");
        assert_eq!(response, Response::Accepted { apns_id: id });
    }

    #[test]
    fn decodes_an_unregistered_rejection_with_timestamp() {
        let body = br#"{"reason":"Unregistered","timestamp":1700000000}"#;
        let response = decode_response(410, None, body);
        match response {
            Response::Rejected {
                reason,
                token_invalidation_timestamp,
                ..
            } => {
                assert_eq!(reason, RejectionReason::Unregistered);
                assert!(token_invalidation_timestamp.is_some());
            }
            _ => panic!("expected a rejection"),
        }
    }

    #[test]
    fn decodes_an_unknown_reason_as_a_preserved_string() {
        let body = br#"{"reason":"SomethingNew"}"#;
        let response = decode_response(400, None, body);
        match response {
            Response::Rejected { reason, .. } => {
                assert_eq!(reason.canonical_text(), "SomethingNew");
            }
            _ => panic!("expected a rejection"),
        }
    }

    #[test]
    fn decodes_a_malformed_body_as_unknown() {
        let response = decode_response(500, None, b"not json");
        match response {
            Response::Rejected { reason, .. } => {
                assert_eq!(reason.status_code(), 500);
            }
            _ => panic!("expected a rejection"),
        }
    }
}
