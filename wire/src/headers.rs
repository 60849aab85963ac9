/// Header keys carried by every broker message (spec §6). 32 hex-char UUIDs.
pub const SESSION_ID: &str = "SESSION_ID";
pub const MESSAGE_ID: &str = "MESSAGE_ID";

use std::collections::HashMap;

use uuid::Uuid;

/// Typed view over the header map every broker message carries alongside
/// its raw packet bytes.
#[derive(Debug, Clone, Default)]
pub struct MessageHeaders(pub HashMap<String, String>);

impl MessageHeaders {
    pub fn new(session_id: Uuid, message_id: Uuid) -> Self {
        let mut map = HashMap::new();
        map.insert(SESSION_ID.to_string(), session_id.simple().to_string());
        map.insert(MESSAGE_ID.to_string(), message_id.simple().to_string());
        Self(map)
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.0.get(SESSION_ID).and_then(|s| Uuid::parse_str(s).ok())
    }

    pub fn message_id(&self) -> Option<Uuid> {
        self.0.get(MESSAGE_ID).and_then(|s| Uuid::parse_str(s).ok())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }
}
