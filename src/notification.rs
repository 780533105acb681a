//! The notification value type and its wire-facing enums.

use uuid::Uuid;

/// Maximum payload size APNs accepts, in bytes.
pub const MAX_PAYLOAD_SIZE: usize = 4096;

/// Maximum length of a collapse id, in UTF-8 bytes.
pub const MAX_COLLAPSE_ID_SIZE: usize = 64;

/// Delivery priority, sent as the numeric `apns-priority` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Deliver immediately. Required for alerts that must wake the device.
    Immediate = 10,
    /// Deliver at a time that conserves power on the receiving device.
    ConservePower = 5,
}

impl Priority {
    pub(crate) fn header_value(self) -> &'static str {
        match self {
            Self::Immediate => "10",
            Self::ConservePower => "5",
        }
    }
}

/// Notification kind, sent as the `apns-push-type` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushType {
    /// A user-visible alert.
    Alert,
    /// A silent, content-available background refresh.
    Background,
}

impl PushType {
    pub(crate) fn header_value(self) -> &'static str {
        match self {
            Self::Alert => "alert",
            Self::Background => "background",
        }
    }
}

/// A single push notification submission.
///
/// Immutable once constructed; build one with [`PushNotification::builder`].
#[derive(Debug, Clone)]
pub struct PushNotification {
    device_token: String,
    topic: Option<String>,
    payload: Vec<u8>,
    expiration: Option<std::time::SystemTime>,
    priority: Priority,
    push_type: PushType,
    collapse_id: Option<String>,
    apns_id: Option<Uuid>,
}

impl PushNotification {
    /// Start building a notification for `device_token` (case-insensitive
    /// hex; normalized to lowercase) carrying `payload` as the raw JSON body.
    pub fn builder(device_token: impl Into<String>, payload: impl Into<Vec<u8>>) -> Builder {
        Builder::new(device_token, payload)
    }

    /// The device token, already normalized to 64 lowercase hex characters.
    pub fn device_token(&self) -> &str {
        &self.device_token
    }

    /// The topic, if one was set explicitly (it may also be derivable from
    /// the credential used to send).
    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    /// The raw JSON payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The absolute expiration instant, if any.
    pub fn expiration(&self) -> Option<std::time::SystemTime> {
        self.expiration
    }

    /// The delivery priority.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// The push type.
    pub fn push_type(&self) -> PushType {
        self.push_type
    }

    /// The collapse id, if any.
    pub fn collapse_id(&self) -> Option<&str> {
        self.collapse_id.as_deref()
    }

    /// The caller-supplied `apns-id`, if any. The server assigns one when
    /// absent; see [`crate::response::Response::Accepted`].
    pub fn apns_id(&self) -> Option<Uuid> {
        self.apns_id
    }
}

/// Builder for [`PushNotification`].
///
/// Validation (payload size, collapse-id length, device-token shape) happens
/// once, in [`Builder::build`], rather than on every setter.
pub struct Builder {
    device_token: String,
    topic: Option<String>,
    payload: Vec<u8>,
    expiration: Option<std::time::SystemTime>,
    priority: Priority,
    push_type: PushType,
    collapse_id: Option<String>,
    apns_id: Option<Uuid>,
}

impl Builder {
    fn new(device_token: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            device_token: device_token.into(),
            topic: None,
            payload: payload.into(),
            expiration: None,
            priority: Priority::Immediate,
            push_type: PushType::Alert,
            collapse_id: None,
            apns_id: None,
        }
    }

    /// Set the topic (bundle id). Required unless the credential authorizes
    /// exactly one topic.
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Set the absolute expiration instant.
    pub fn expiration(mut self, expiration: std::time::SystemTime) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Set the delivery priority. Defaults to [`Priority::Immediate`].
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the push type. Defaults to [`PushType::Alert`].
    pub fn push_type(mut self, push_type: PushType) -> Self {
        self.push_type = push_type;
        self
    }

    /// Set the collapse id (at most 64 UTF-8 bytes).
    pub fn collapse_id(mut self, collapse_id: impl Into<String>) -> Self {
        self.collapse_id = Some(collapse_id.into());
        self
    }

    /// Set an explicit `apns-id`. Leave unset to let the server assign one.
    pub fn apns_id(mut self, apns_id: Uuid) -> Self {
        self.apns_id = Some(apns_id);
        self
    }

    /// Build the notification, running local validation.
    ///
    /// Returns `Err` with the [`crate::response::RejectionReason`] that the
    /// server would have returned for the same defect, so callers can
    /// synthesize a `Rejected` outcome without a round trip (§7 kind 1).
    pub fn build(self) -> Result<PushNotification, crate::response::RejectionReason> {
        use crate::response::RejectionReason;

        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(RejectionReason::PayloadTooLarge);
        }
        if self.payload.is_empty() {
            return Err(RejectionReason::PayloadEmpty);
        }
        if let Some(collapse_id) = &self.collapse_id {
            if collapse_id.len() > MAX_COLLAPSE_ID_SIZE {
                return Err(RejectionReason::BadCollapseId);
            }
        }

        let device_token = self.device_token.to_ascii_lowercase();
        if device_token.len() != 64 || !device_token.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(RejectionReason::BadDeviceToken);
        }

        Ok(PushNotification {
            device_token,
            topic: self.topic,
            payload: self.payload,
            expiration: self.expiration,
            priority: self.priority,
            push_type: self.push_type,
            collapse_id: self.collapse_id,
            apns_id: self.apns_id,
        })
    }
}
