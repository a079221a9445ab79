use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Signed headers attached to an operation (or carried in the handshake blob)
pub type Authorization = BTreeMap<String, String>;

/// Every frame exchanged with the relay is one of these, tagged by `type`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    /// Connection lifecycle
    ConnectionInit,
    ConnectionAck {
        #[serde(
            rename = "connectionTimeoutMs",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        connection_timeout_ms: Option<u64>,
    },
    ConnectionError {
        #[serde(default)]
        errors: Vec<RelayError>,
    },
    Ka,

    /// Subscriptions
    Subscribe {
        id: String,
        channel: String,
        authorization: Authorization,
    },
    SubscribeSuccess {
        id: String,
    },
    SubscribeError {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        errors: Vec<RelayError>,
    },
    Data {
        id: String,
        event: Value,
    },

    /// Publishing
    Publish {
        id: String,
        channel: String,
        events: Vec<String>,
        authorization: Authorization,
    },
    PublishSuccess {
        id: String,
        #[serde(default)]
        successful: Vec<Value>,
        #[serde(default)]
        failed: Vec<Value>,
    },
    PublishError {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        errors: Vec<RelayError>,
    },

    /// Unsubscribing
    Unsubscribe {
        id: String,
    },
    UnsubscribeSuccess {
        id: String,
    },
    UnsubscribeError {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        errors: Vec<RelayError>,
    },

    /// Errors not tied to a specific operation type
    Error {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        errors: Vec<RelayError>,
    },
}

impl RelayMessage {
    /// Wire name of the message type, used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            RelayMessage::ConnectionInit => "connection_init",
            RelayMessage::ConnectionAck { .. } => "connection_ack",
            RelayMessage::ConnectionError { .. } => "connection_error",
            RelayMessage::Ka => "ka",
            RelayMessage::Subscribe { .. } => "subscribe",
            RelayMessage::SubscribeSuccess { .. } => "subscribe_success",
            RelayMessage::SubscribeError { .. } => "subscribe_error",
            RelayMessage::Data { .. } => "data",
            RelayMessage::Publish { .. } => "publish",
            RelayMessage::PublishSuccess { .. } => "publish_success",
            RelayMessage::PublishError { .. } => "publish_error",
            RelayMessage::Unsubscribe { .. } => "unsubscribe",
            RelayMessage::UnsubscribeSuccess { .. } => "unsubscribe_success",
            RelayMessage::UnsubscribeError { .. } => "unsubscribe_error",
            RelayMessage::Error { .. } => "error",
        }
    }
}

/// Error entry reported by the relay in `*_error` frames
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RelayError {
    #[serde(default)]
    pub error_type: String,
    #[serde(default)]
    pub message: String,
}

/// Acknowledgment payload of a successful publish
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishAck {
    pub successful: Vec<Value>,
    pub failed: Vec<Value>,
}

impl PublishAck {
    /// True when the relay accepted every event
    pub fn all_accepted(&self) -> bool {
        self.failed.is_empty()
    }
}
