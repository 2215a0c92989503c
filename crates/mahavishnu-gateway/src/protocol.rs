//! Wire frame shapes for the subscription gateway (§6).
//!
//! Every frame is a single JSON object tagged by `type`. The axum
//! WebSocket transport already frames messages for us, so nothing here
//! does length-prefixing by hand — that concern is `tokio-tungstenite`'s
//! (via axum) job, not this module's.

use chrono::{DateTime, Utc};
use mahavishnu_core::{Channel, Event};
use serde::{Deserialize, Serialize};

/// Parse a wire channel name (`"global"` or `"pool:<pool-id>"`) into a
/// [`Channel`]. A subscribe naming a pool that doesn't exist yet is
/// accepted per §4.8 — it becomes active once the pool is spawned.
pub fn parse_channel(wire: &str) -> Channel {
    match wire.strip_prefix("pool:") {
        Some(pool_id) => Channel::Pool { pool_id: pool_id.to_string() },
        None => Channel::Global,
    }
}

pub const PROTOCOL_VERSION: &str = "1";

pub fn capabilities() -> Vec<String> {
    vec![
        "subscribe".to_string(),
        "unsubscribe".to_string(),
        "get_pool_status".to_string(),
        "get_worker_status".to_string(),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Welcome {
        version: String,
        capabilities: Vec<String>,
    },
    Request {
        event: String,
        #[serde(default)]
        data: serde_json::Value,
        id: String,
    },
    Response {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
    },
    Event {
        event: String,
        data: serde_json::Value,
        sequence: u64,
        channel: String,
        timestamp: DateTime<Utc>,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        error_code: String,
        error_message: String,
    },
    Ping {
        timestamp: DateTime<Utc>,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
}

impl Frame {
    pub fn welcome() -> Self {
        Frame::Welcome {
            version: PROTOCOL_VERSION.to_string(),
            capabilities: capabilities(),
        }
    }

    pub fn response(id: impl Into<String>, data: serde_json::Value) -> Self {
        Frame::Response {
            id: id.into(),
            data: Some(data),
            status: None,
            channel: None,
        }
    }

    pub fn subscribed(id: impl Into<String>, channel: impl Into<String>) -> Self {
        Frame::Response {
            id: id.into(),
            data: None,
            status: Some("subscribed".to_string()),
            channel: Some(channel.into()),
        }
    }

    pub fn unsubscribed(id: impl Into<String>, channel: impl Into<String>) -> Self {
        Frame::Response {
            id: id.into(),
            data: None,
            status: Some("unsubscribed".to_string()),
            channel: Some(channel.into()),
        }
    }

    pub fn error(id: Option<String>, error_code: impl Into<String>, error_message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            error_code: error_code.into(),
            error_message: error_message.into(),
        }
    }

    pub fn ping() -> Self {
        Frame::Ping { timestamp: Utc::now() }
    }

    /// The unsolicited "goodbye" notice sent once per session during
    /// graceful server shutdown. §4.8 calls this a distinct frame, but
    /// §6 enumerates no dedicated `goodbye` type, so it rides the
    /// generic `event` shape under a reserved event name.
    pub fn goodbye() -> Self {
        Frame::Event {
            event: "session.goodbye".to_string(),
            data: serde_json::json!({}),
            sequence: 0,
            channel: "session".to_string(),
            timestamp: Utc::now(),
        }
    }
}

impl From<Event> for Frame {
    fn from(event: Event) -> Self {
        Frame::Event {
            event: event.event_type,
            data: event.payload,
            sequence: event.sequence,
            channel: event.channel.to_string(),
            timestamp: event.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_round_trips_through_json() {
        let text = r#"{"type":"request","event":"subscribe","data":{"channels":["global"]},"id":"r1"}"#;
        let frame: Frame = serde_json::from_str(text).unwrap();
        match frame {
            Frame::Request { event, id, .. } => {
                assert_eq!(event, "subscribe");
                assert_eq!(id, "r1");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn welcome_frame_serializes_with_tag() {
        let json = serde_json::to_value(Frame::welcome()).unwrap();
        assert_eq!(json["type"], "welcome");
        assert_eq!(json["version"], PROTOCOL_VERSION);
    }

    #[test]
    fn subscribed_response_omits_data_field() {
        let json = serde_json::to_value(Frame::subscribed("r1", "global")).unwrap();
        assert_eq!(json["status"], "subscribed");
        assert_eq!(json["channel"], "global");
        assert!(json.get("data").is_none());
    }
}
