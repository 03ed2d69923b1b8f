use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Something a chat client wants to show the user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ChatEvent {
    Connected {
        display_name: String,
        users: Vec<String>,
    },
    UserJoined {
        name: String,
    },
    UserLeft {
        name: String,
    },
    MessageReceived {
        name: String,
        text: String,
    },
    SelfMessageSent {
        text: String,
    },
    Disconnected,
    HandshakeError {
        reason: String,
    },
}

impl ChatEvent {
    /// True for events after which the connection will not produce anything else.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChatEvent::Disconnected | ChatEvent::HandshakeError { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimedEvent {
    pub timestamp: String,
    #[serde(flatten)]
    pub event: ChatEvent,
}

impl TimedEvent {
    pub fn now(event: ChatEvent) -> Self {
        Self::at(Utc::now(), event)
    }

    pub fn at(at: DateTime<Utc>, event: ChatEvent) -> Self {
        Self {
            timestamp: at.to_rfc3339(),
            event,
        }
    }

    pub fn to_json_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_708_995_600_000)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn json_lines_carry_type_and_payload() {
        let line = TimedEvent::at(
            fixed_time(),
            ChatEvent::MessageReceived {
                name: "alice".to_string(),
                text: "hello".to_string(),
            },
        )
        .to_json_line()
        .expect("serialize");
        let value: serde_json::Value = serde_json::from_str(&line).expect("parse");
        assert_eq!(value["type"], "message_received");
        assert_eq!(value["payload"]["name"], "alice");
        assert_eq!(value["payload"]["text"], "hello");
        assert_eq!(value["timestamp"], "2024-02-27T01:00:00+00:00");

        let parsed: TimedEvent = serde_json::from_str(&line).expect("parse back");
        assert_eq!(
            parsed.event,
            ChatEvent::MessageReceived {
                name: "alice".to_string(),
                text: "hello".to_string(),
            }
        );
    }

    #[test]
    fn unit_variant_has_no_payload() {
        let line = TimedEvent::at(fixed_time(), ChatEvent::Disconnected)
            .to_json_line()
            .expect("serialize");
        let value: serde_json::Value = serde_json::from_str(&line).expect("parse");
        assert_eq!(value["type"], "disconnected");
        assert!(value.get("payload").is_none());
        assert!(ChatEvent::Disconnected.is_terminal());
        assert!(!ChatEvent::UserLeft {
            name: "bob".to_string()
        }
        .is_terminal());
    }
}
