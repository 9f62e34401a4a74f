use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::content::Content;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A message to or from an LLM.
///
/// Messages are append-only: once pushed onto an agent's history they are
/// never mutated. The `extra` map is populated at append time with
/// backend-specific metadata (parsed actions, turn cost, return codes) and
/// round-trips through the trajectory untouched.
pub struct Message {
    pub role: Role,
    pub created: i64,
    pub content: Vec<Content>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl Message {
    fn new(role: Role) -> Self {
        Message {
            role,
            created: Utc::now().timestamp(),
            content: Vec::new(),
            extra: Map::new(),
        }
    }

    /// Create a new system message with the current timestamp
    pub fn system() -> Self {
        Message::new(Role::System)
    }

    /// Create a new user message with the current timestamp
    pub fn user() -> Self {
        Message::new(Role::User)
    }

    /// Create a new assistant message with the current timestamp
    pub fn assistant() -> Self {
        Message::new(Role::Assistant)
    }

    /// Create a new tool message with the current timestamp
    pub fn tool() -> Self {
        Message::new(Role::Tool)
    }

    /// Add any Content segment to the message
    pub fn with_content(mut self, content: Content) -> Self {
        self.content.push(content);
        self
    }

    /// Add text content to the message
    pub fn with_text<S: Into<String>>(self, text: S) -> Self {
        self.with_content(Content::text(text))
    }

    /// Add image content to the message
    pub fn with_image<S: Into<String>, T: Into<String>>(self, data: S, mime_type: T) -> Self {
        self.with_content(Content::image(data, mime_type))
    }

    /// Attach a metadata entry to the `extra` map
    pub fn with_extra<S: Into<String>, V: Into<Value>>(mut self, key: S, value: V) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Concatenated text of all text segments
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(Content::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builders_set_role_and_text() {
        let message = Message::assistant().with_text("hello");
        assert_eq!(message.role, Role::Assistant);
        assert_eq!(message.text(), "hello");
        assert!(message.extra.is_empty());
    }

    #[test]
    fn test_text_joins_segments() {
        let message = Message::user()
            .with_text("first")
            .with_image("aGk=", "image/png")
            .with_text("second");
        assert_eq!(message.text(), "first\nsecond");
    }

    #[test]
    fn test_serde_round_trip_preserves_extra() {
        let message = Message::user()
            .with_text("observation")
            .with_extra("returncode", 0)
            .with_extra("actions", json!(["echo hi"]));

        let serialized = serde_json::to_string(&message).unwrap();
        let deserialized: Message = serde_json::from_str(&serialized).unwrap();
        assert_eq!(message, deserialized);
        assert_eq!(deserialized.extra["returncode"], json!(0));
    }

    #[test]
    fn test_empty_extra_is_not_serialized() {
        let message = Message::system().with_text("prompt");
        let value = serde_json::to_value(&message).unwrap();
        assert!(value.get("extra").is_none());
        assert_eq!(value["role"], json!("system"));
    }
}
