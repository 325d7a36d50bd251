use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity and credentials presented to every collector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub agent_id: String,
    pub agent_name: String,
    pub token: String,
    pub version: String,
    pub source: String, // random per process, tags outbound messages
}

impl ClientInfo {
    pub fn new(agent_id: String, agent_name: String, token: String) -> Self {
        Self {
            agent_id,
            agent_name,
            token,
            version: env!("CARGO_PKG_VERSION").to_string(),
            source: Uuid::new_v4().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Handshaking,
    Active,
    Closed,
}
