use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::domain::{Message, UserId};

/// One realtime change to a conversation's message records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum MessageEvent {
    Created { message: Message },
    Updated { message: Message },
    Deleted { message: Message },
}

impl MessageEvent {
    pub fn message(&self) -> &Message {
        match self {
            Self::Created { message } | Self::Updated { message } | Self::Deleted { message } => {
                message
            }
        }
    }
}

/// Full snapshot of who is typing right now. Each event replaces the
/// previous set; it is never a delta.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypingIndicator {
    pub typing_user_ids: HashSet<UserId>,
}

/// Outgoing typing presence published by the local user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypingActivity {
    Began,
    Paused,
    Finished,
}
