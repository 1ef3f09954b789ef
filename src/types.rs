use serde::{Deserialize, Serialize};

/// Connection lifecycle of a provider instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Pairing,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Pairing => "pairing",
            ConnectionState::Connected => "connected",
        }
    }

    pub fn parse(value: &str) -> Option<ConnectionState> {
        match value {
            "disconnected" => Some(ConnectionState::Disconnected),
            "pairing" => Some(ConnectionState::Pairing),
            "connected" => Some(ConnectionState::Connected),
            _ => None,
        }
    }

    /// Whether a provider-reported transition to `next` is legal.
    /// Anything may fall to `disconnected`; `connected` is only reachable
    /// from `pairing`.
    pub fn can_transition(&self, next: ConnectionState) -> bool {
        match next {
            ConnectionState::Disconnected => true,
            ConnectionState::Pairing => *self == ConnectionState::Disconnected,
            ConnectionState::Connected => *self == ConnectionState::Pairing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }

    pub fn parse(value: &str) -> Option<Direction> {
        match value {
            "inbound" => Some(Direction::Inbound),
            "outbound" => Some(Direction::Outbound),
            _ => None,
        }
    }
}

/// Delivery state of a message. Transitions move only forward through
/// queued -> sent -> delivered -> read; `failed` is terminal from any
/// non-terminal state. Receipts for an earlier state are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Queued,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Queued => "queued",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<MessageStatus> {
        match value {
            "queued" => Some(MessageStatus::Queued),
            "sent" => Some(MessageStatus::Sent),
            "delivered" => Some(MessageStatus::Delivered),
            "read" => Some(MessageStatus::Read),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Read | MessageStatus::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            MessageStatus::Queued => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::Read => 3,
            MessageStatus::Failed => 4,
        }
    }

    /// Forward-only advancement. A terminal status never changes, and a
    /// receipt reporting an earlier state than the current one is dropped.
    pub fn can_advance(&self, next: MessageStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() > self.rank()
    }
}

/// Media reference attached to a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRef {
    pub url: String,
    pub mime_type: Option<String>,
    pub filename: Option<String>,
}

/// Inbound message normalized from a provider webhook, before it reaches
/// the store writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub instance_id: String,
    pub provider_message_id: String,
    pub phone: String,
    pub sender_name: Option<String>,
    pub body: Option<String>,
    pub media: Option<MediaRef>,
    pub timestamp: Option<i64>,
}

/// Delivery receipt correlated by the provider's message id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub provider_message_id: String,
    pub status: MessageStatus,
}
