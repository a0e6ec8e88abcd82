use bon::Builder;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Well-known event types exchanged with the realtime server.
///
/// The transport treats every type as an opaque routing key; only
/// [`PING`](event_types::PING) has sender-side behavior (the periodic
/// keep-alive). `pong` handling, if a consumer wants it, is an ordinary
/// subscription like any other.
pub mod event_types {
    /// Keep-alive request, sent automatically while connected.
    pub const PING: &str = "ping";
    /// Keep-alive acknowledgment from the server.
    pub const PONG: &str = "pong";
    /// A draw has completed and results are available.
    pub const DRAW_RESULT: &str = "draw_result";
    /// Account balance changed.
    pub const BALANCE_UPDATE: &str = "balance_update";
    /// A transaction changed state.
    pub const TRANSACTION_UPDATE: &str = "transaction_update";
    /// Reward granted or redeemed.
    pub const REWARD_UPDATE: &str = "reward_update";
    /// VIP tier or progress changed.
    pub const VIP_UPDATE: &str = "vip_update";
    /// Referral activity on the account.
    pub const REFERRAL_UPDATE: &str = "referral_update";
    /// Platform-wide announcement.
    pub const SYSTEM_ANNOUNCEMENT: &str = "system_announcement";
    /// Scheduled maintenance notice.
    pub const MAINTENANCE_NOTICE: &str = "maintenance_notice";
    /// Security-relevant event on the account.
    pub const SECURITY_ALERT: &str = "security_alert";
    /// User account status changed.
    pub const USER_STATUS: &str = "user_status";
    /// KYC verification status changed.
    pub const KYC_STATUS: &str = "kyc_status";
}

/// Wire envelope for every frame sent or received over the socket.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
pub struct Envelope {
    /// Routing key consumers subscribe on
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event-specific data, opaque to the transport
    pub data: Value,
    /// Unix timestamp in milliseconds, stamped by the sender at send time
    pub timestamp: i64,
    /// Originating user, when the server attributes the frame
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user_id: Option<String>,
}

impl Envelope {
    /// Create an envelope stamped with the current wall-clock time.
    #[must_use]
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            timestamp: Utc::now().timestamp_millis(),
            user_id: None,
        }
    }

    /// Create a keep-alive frame.
    #[must_use]
    pub fn ping() -> Self {
        Self::new(event_types::PING, Value::Object(serde_json::Map::new()))
    }

    /// Attribute this envelope to a user.
    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}
