//! The outcome types the client reports per submission, and the rejection
//! taxonomy that mirrors the wire contract (§4.6, §6).

use std::time::SystemTime;
use uuid::Uuid;

/// The outcome of a single submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// The server accepted the notification. `apns_id` is the value the
    /// server returned in the `apns-id` header — not the caller's optional
    /// input (invariant I4).
    Accepted {
        /// The canonical notification id.
        apns_id: Uuid,
    },
    /// The server rejected the notification.
    Rejected {
        /// The id the server associated with the rejection, when present.
        apns_id: Option<Uuid>,
        /// Why the notification was rejected.
        reason: RejectionReason,
        /// Present only when `reason == Unregistered`: the instant the token
        /// was recorded as invalid. Callers should stop sending to this
        /// token unless it was re-registered after this instant.
        token_invalidation_timestamp: Option<SystemTime>,
    },
}

/// The closed set of rejection reasons APNs returns, each carrying its HTTP
/// status code and canonical wire text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    BadCollapseId,
    BadDeviceToken,
    BadExpirationDate,
    BadMessageId,
    BadPriority,
    BadTopic,
    DeviceTokenNotForTopic,
    DuplicateHeaders,
    IdleTimeout,
    MissingDeviceToken,
    MissingTopic,
    PayloadEmpty,
    TopicDisallowed,
    BadCertificate,
    BadCertificateEnvironment,
    ExpiredProviderToken,
    Forbidden,
    InvalidProviderToken,
    MissingProviderToken,
    BadPath,
    MethodNotAllowed,
    Unregistered,
    PayloadTooLarge,
    TooManyProviderTokenUpdates,
    TooManyRequests,
    InternalServerError,
    ServiceUnavailable,
    Shutdown,
    /// A reason text the server sent that isn't in the known set. The
    /// original string is preserved; the status code is used only to decide
    /// which bucket (`4xx` vs `5xx`) it behaves like.
    Unknown { text: String, status: u16 },
}

impl RejectionReason {
    /// The HTTP status code this reason is sent with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadCollapseId
            | Self::BadDeviceToken
            | Self::BadExpirationDate
            | Self::BadMessageId
            | Self::BadPriority
            | Self::BadTopic
            | Self::DeviceTokenNotForTopic
            | Self::DuplicateHeaders
            | Self::IdleTimeout
            | Self::MissingDeviceToken
            | Self::MissingTopic
            | Self::PayloadEmpty
            | Self::TopicDisallowed => 400,
            Self::BadCertificate
            | Self::BadCertificateEnvironment
            | Self::ExpiredProviderToken
            | Self::Forbidden
            | Self::InvalidProviderToken
            | Self::MissingProviderToken => 403,
            Self::BadPath => 404,
            Self::MethodNotAllowed => 405,
            Self::Unregistered => 410,
            Self::PayloadTooLarge => 413,
            Self::TooManyProviderTokenUpdates | Self::TooManyRequests => 429,
            Self::InternalServerError => 500,
            Self::ServiceUnavailable | Self::Shutdown => 503,
            Self::Unknown { status, .. } => *status,
        }
    }

    /// The canonical wire text, e.g. `"BadCollapseId"`.
    pub fn canonical_text(&self) -> &str {
        match self {
            Self::BadCollapseId => "BadCollapseId",
            Self::BadDeviceToken => "BadDeviceToken",
            Self::BadExpirationDate => "BadExpirationDate",
            Self::BadMessageId => "BadMessageId",
            Self::BadPriority => "BadPriority",
            Self::BadTopic => "BadTopic",
            Self::DeviceTokenNotForTopic => "DeviceTokenNotForTopic",
            Self::DuplicateHeaders => "DuplicateHeaders",
            Self::IdleTimeout => "IdleTimeout",
            Self::MissingDeviceToken => "MissingDeviceToken",
            Self::MissingTopic => "MissingTopic",
            Self::PayloadEmpty => "PayloadEmpty",
            Self::TopicDisallowed => "TopicDisallowed",
            Self::BadCertificate => "BadCertificate",
            Self::BadCertificateEnvironment => "BadCertificateEnvironment",
            Self::ExpiredProviderToken => "ExpiredProviderToken",
            Self::Forbidden => "Forbidden",
            Self::InvalidProviderToken => "InvalidProviderToken",
            Self::MissingProviderToken => "MissingProviderToken",
            Self::BadPath => "BadPath",
            Self::MethodNotAllowed => "MethodNotAllowed",
            Self::Unregistered => "Unregistered",
            Self::PayloadTooLarge => "PayloadTooLarge",
            Self::TooManyProviderTokenUpdates => "TooManyProviderTokenUpdates",
            Self::TooManyRequests => "TooManyRequests",
            Self::InternalServerError => "InternalServerError",
            Self::ServiceUnavailable => "ServiceUnavailable",
            Self::Shutdown => "Shutdown",
            Self::Unknown { text, .. } => text,
        }
    }

    /// Parse the canonical text back into a reason. Unknown text is kept
    /// verbatim and classified by `status` into the closest known family, per
    /// the open question in §9: 4xx behaves like a validation rejection,
    /// anything else like a server failure.
    pub fn from_canonical_text(text: &str, status: u16) -> Self {
        match text {
            "BadCollapseId" => Self::BadCollapseId,
            "BadDeviceToken" => Self::BadDeviceToken,
            "BadExpirationDate" => Self::BadExpirationDate,
            "BadMessageId" => Self::BadMessageId,
            "BadPriority" => Self::BadPriority,
            "BadTopic" => Self::BadTopic,
            "DeviceTokenNotForTopic" => Self::DeviceTokenNotForTopic,
            "DuplicateHeaders" => Self::DuplicateHeaders,
            "IdleTimeout" => Self::IdleTimeout,
            "MissingDeviceToken" => Self::MissingDeviceToken,
            "MissingTopic" => Self::MissingTopic,
            "PayloadEmpty" => Self::PayloadEmpty,
            "TopicDisallowed" => Self::TopicDisallowed,
            "BadCertificate" => Self::BadCertificate,
            "BadCertificateEnvironment" => Self::BadCertificateEnvironment,
            "ExpiredProviderToken" => Self::ExpiredProviderToken,
            "Forbidden" => Self::Forbidden,
            "InvalidProviderToken" => Self::InvalidProviderToken,
            "MissingProviderToken" => Self::MissingProviderToken,
            "BadPath" => Self::BadPath,
            "MethodNotAllowed" => Self::MethodNotAllowed,
            "Unregistered" => Self::Unregistered,
            "PayloadTooLarge" => Self::PayloadTooLarge,
            "TooManyProviderTokenUpdates" => Self::TooManyProviderTokenUpdates,
            "TooManyRequests" => Self::TooManyRequests,
            "InternalServerError" => Self::InternalServerError,
            "ServiceUnavailable" => Self::ServiceUnavailable,
            "Shutdown" => Self::Shutdown,
            other => Self::Unknown {
                text: other.to_string(),
                status,
            },
        }
    }

    /// Whether this reason indicates the device token is permanently dead
    /// and should be removed from the caller's store.
    pub fn should_remove_device(&self) -> bool {
        matches!(self, Self::Unregistered | Self::BadDeviceToken)
    }

    /// Whether this reason is one of the auth-rejection family that
    /// invalidates the cached bearer token (§7 kind 5).
    pub fn is_auth_rejection(&self) -> bool {
        matches!(
            self,
            Self::ExpiredProviderToken | Self::InvalidProviderToken | Self::MissingProviderToken
        )
    }
}

impl Response {
    /// Classify a rejection outcome per §7's taxonomy, mirroring
    /// [`crate::error::PushyError::classification`] for the half of the
    /// outcome space that arrives as `Ok(Response::Rejected{..})` rather than
    /// an `Err`. Returns `None` for `Accepted`, which isn't a failure.
    pub fn classification(&self) -> Option<crate::error::Classification> {
        use crate::error::Classification;
        match self {
            Self::Accepted { .. } => None,
            Self::Rejected { reason, .. } => Some(if reason.is_auth_rejection() {
                Classification::AuthRejection
            } else if reason.should_remove_device() {
                Classification::TokenInvalidated
            } else {
                Classification::ServerRejection
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_text_round_trips() {
        let reasons = [
            RejectionReason::BadCollapseId,
            RejectionReason::Unregistered,
            RejectionReason::PayloadTooLarge,
            RejectionReason::InternalServerError,
        ];
        for reason in reasons {
            let status = reason.status_code();
            let text = reason.canonical_text().to_string();
            assert_eq!(RejectionReason::from_canonical_text(&text, status), reason);
        }
    }

    #[test]
    fn unknown_reason_preserves_raw_text() {
        let reason = RejectionReason::from_canonical_text("SomeNewThing", 400);
        assert_eq!(reason.canonical_text(), "SomeNewThing");
        assert_eq!(reason.status_code(), 400);
    }

    #[test]
    fn classification_buckets_rejections_by_family() {
        use crate::error::Classification;

        let accepted = Response::Accepted { apns_id: Uuid::nil() };
        assert_eq!(accepted.classification(), None);

        let rejected = |reason| Response::Rejected {
            apns_id: None,
            reason,
            token_invalidation_timestamp: None,
        };
        assert_eq!(
            rejected(RejectionReason::ExpiredProviderToken).classification(),
            Some(Classification::AuthRejection)
        );
        assert_eq!(
            rejected(RejectionReason::Unregistered).classification(),
            Some(Classification::TokenInvalidated)
        );
        assert_eq!(
            rejected(RejectionReason::BadTopic).classification(),
            Some(Classification::ServerRejection)
        );
    }

    #[test]
    fn status_codes_match_the_wire_contract() {
        assert_eq!(RejectionReason::Unregistered.status_code(), 410);
        assert_eq!(RejectionReason::PayloadTooLarge.status_code(), 413);
        assert_eq!(RejectionReason::TooManyRequests.status_code(), 429);
        assert_eq!(RejectionReason::ServiceUnavailable.status_code(), 503);
    }
}
