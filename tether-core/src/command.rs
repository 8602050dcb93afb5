//! Commands and their delivery lifecycle.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::Document;

/// Unique identifier for a queued command (the wire `CommandUUID`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(pub Uuid);

impl CommandId {
    /// Create a new random command ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Devices echo the identifier back verbatim; keep the canonical hyphenated form.
        write!(f, "{}", self.0.hyphenated())
    }
}

/// A named request plus its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub request_type: String,
    pub payload: Document,
}

impl Command {
    pub fn new(request_type: impl Into<String>, payload: Document) -> Self {
        Self {
            id: CommandId::new(),
            request_type: request_type.into(),
            payload,
        }
    }

    /// Render the outbound command document.
    ///
    /// ```text
    /// { "CommandUUID": "<id>", "Command": { "RequestType": "<type>", <payload...> } }
    /// ```
    pub fn to_document(&self) -> Document {
        let mut inner = self.payload.clone();
        inner.set("RequestType", self.request_type.clone());

        let mut doc = Document::new();
        doc.set("CommandUUID", self.id.to_string());
        doc.set_document("Command", inner);
        doc
    }
}

/// Delivery state of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    /// Waiting in the device's pending queue.
    Queued,
    /// Delivered in response to an idle poll; awaiting a report.
    Sent,
    /// Device reported success.
    Acknowledged,
    /// Device reported failure.
    Error,
    /// Device was busy; eligible for a retry but not re-queued.
    NotNow,
}

impl CommandState {
    /// Returns true if the command will never be delivered again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Acknowledged | Self::Error)
    }
}

/// Outcome a device reports for a delivered command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOutcome {
    Acknowledged,
    Error,
}

impl From<CommandOutcome> for CommandState {
    fn from(outcome: CommandOutcome) -> Self {
        match outcome {
            CommandOutcome::Acknowledged => Self::Acknowledged,
            CommandOutcome::Error => Self::Error,
        }
    }
}

/// A command together with its delivery history and result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command: Command,
    pub state: CommandState,
    pub queued_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Number of times the command was handed to the device.
    pub deliveries: u32,
    /// Document the device submitted with its report.
    pub result: Option<Document>,
}

impl CommandRecord {
    pub fn queued(command: Command, now: DateTime<Utc>) -> Self {
        Self {
            command,
            state: CommandState::Queued,
            queued_at: now,
            sent_at: None,
            completed_at: None,
            deliveries: 0,
            result: None,
        }
    }
}
