//! Validation rules the server counterpart enforces (C6, §4.6) — the wire
//! contract mirror used by both the mock server and anyone asserting on
//! expected outcomes in tests.

use crate::response::RejectionReason;

/// One incoming request's relevant headers and body, already pulled off
/// the HTTP/2 frames by the mock server's transport handling.
pub struct IncomingRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub topic: Option<&'a str>,
    pub collapse_id: Option<&'a str>,
    pub priority: Option<&'a str>,
    pub apns_id: Option<&'a str>,
    pub body: &'a [u8],
}

/// What the credential presented with this request authorizes.
pub struct Authorization {
    /// Topics this credential may send to. A single-topic certificate
    /// authorizes exactly that topic; a team-scoped JWT may authorize many.
    pub authorized_topics: Vec<String>,
    pub auth_failure: Option<RejectionReason>,
}

/// Run the full rule set from §4.6 against one request. Returns the
/// extracted device token when every rule passes; the caller (mock server)
/// still needs to check its own token-invalidation registry for rule 9
/// separately, since that rule depends on state this function doesn't have.
pub fn validate(request: &IncomingRequest, auth: &Authorization) -> Result<String, RejectionReason> {
    if request.method != "POST" {
        return Err(RejectionReason::MethodNotAllowed);
    }

    let device_token = extract_device_token(request.path)?;

    if let Some(reason) = &auth.auth_failure {
        return Err(reason.clone());
    }

    match request.topic {
        Some(topic) => {
            if !auth.authorized_topics.is_empty() && !auth.authorized_topics.iter().any(|t| t == topic) {
                return Err(RejectionReason::TopicDisallowed);
            }
        }
        None => {
            if auth.authorized_topics.len() != 1 {
                return Err(RejectionReason::MissingTopic);
            }
        }
    }

    if let Some(collapse_id) = request.collapse_id {
        if collapse_id.len() > crate::notification::MAX_COLLAPSE_ID_SIZE {
            return Err(RejectionReason::BadCollapseId);
        }
    }

    if let Some(priority) = request.priority {
        if priority != "5" && priority != "10" {
            return Err(RejectionReason::BadPriority);
        }
    }

    if let Some(apns_id) = request.apns_id {
        if uuid::Uuid::parse_str(apns_id).is_err() {
            return Err(RejectionReason::BadMessageId);
        }
    }

    if request.body.is_empty() {
        return Err(RejectionReason::PayloadEmpty);
    }
    if request.body.len() > crate::notification::MAX_PAYLOAD_SIZE {
        return Err(RejectionReason::PayloadTooLarge);
    }

    Ok(device_token)
}

fn extract_device_token(path: &str) -> Result<String, RejectionReason> {
    let Some(token) = path.strip_prefix("/3/device/") else {
        return Err(RejectionReason::BadPath);
    };
    if token.is_empty() {
        return Err(RejectionReason::MissingDeviceToken);
    }
    if token.len() != 64 || !token.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(RejectionReason::BadDeviceToken);
    }
    Ok(token.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request<'a>(path: &'a str, topic: Option<&'a str>, body: &'a [u8]) -> IncomingRequest<'a> {
        IncomingRequest {
            method: "POST",
            path,
            topic,
            collapse_id: None,
            priority: None,
            apns_id: None,
            body,
        }
    }

    fn authorized(topics: &[&str]) -> Authorization {
        Authorization {
            authorized_topics: topics.iter().map(|s| s.to_string()).collect(),
            auth_failure: None,
        }
    }

    #[test]
    fn accepts_a_well_formed_request() {
        let path = format!("/3/device/{}", "a".repeat(64));
        let req = request(&path, Some("com.example.app"), b"{}");
        let auth = authorized(&["com.example.app"]);
        assert!(validate(&req, &auth).is_ok());
    }

    #[test]
    fn rejects_disallowed_topic() {
        let path = format!("/3/device/{}", "a".repeat(64));
        let req = request(&path, Some("com.example.other"), b"{}");
        let auth = authorized(&["com.example.app"]);
        assert_eq!(validate(&req, &auth).unwrap_err(), RejectionReason::TopicDisallowed);
    }

    #[test]
    fn rejects_malformed_device_token() {
        let req = request("/3/device/not-hex", Some("com.example.app"), b"{}");
        let auth = authorized(&["com.example.app"]);
        assert_eq!(validate(&req, &auth).unwrap_err(), RejectionReason::BadDeviceToken);
    }

    #[test]
    fn rejects_a_path_outside_the_device_namespace() {
        let req = request("/3/wrong-path", Some("com.example.app"), b"{}");
        let auth = authorized(&["com.example.app"]);
        assert_eq!(validate(&req, &auth).unwrap_err(), RejectionReason::BadPath);
    }

    #[test]
    fn rejects_empty_body() {
        let path = format!("/3/device/{}", "a".repeat(64));
        let req = request(&path, Some("com.example.app"), b"");
        let auth = authorized(&["com.example.app"]);
        assert_eq!(validate(&req, &auth).unwrap_err(), RejectionReason::PayloadEmpty);
    }

    #[test]
    fn missing_topic_is_fine_with_a_single_scoped_credential() {
        let path = format!("/3/device/{}", "a".repeat(64));
        let req = request(&path, None, b"{}");
        let auth = authorized(&["com.example.app"]);
        assert!(validate(&req, &auth).is_ok());
    }

    #[test]
    fn missing_topic_is_rejected_with_a_multi_scoped_credential() {
        let path = format!("/3/device/{}", "a".repeat(64));
        let req = request(&path, None, b"{}");
        let auth = authorized(&["com.example.app", "com.example.other"]);
        assert_eq!(validate(&req, &auth).unwrap_err(), RejectionReason::MissingTopic);
    }
}
