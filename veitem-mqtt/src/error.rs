//! Error types for the veitem-mqtt crate.

use veitem::TreeError;

/// Errors returned by the MQTT producer and its transport
#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error("item tree error: {0}")]
    Tree(#[from] TreeError),

    /// A notification payload was not the expected JSON object
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    /// The task driving the client is gone
    #[error("transport closed")]
    TransportClosed,

    #[error("MQTT client error: {0}")]
    Client(String),

    #[error("not connected")]
    NotConnected,
}

impl From<rumqttc::ClientError> for MqttError {
    fn from(err: rumqttc::ClientError) -> Self {
        MqttError::Client(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MqttError>;
