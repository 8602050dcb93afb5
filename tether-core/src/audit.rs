//! Transaction log records.
//!
//! Every checkin, rejection and queue change is written as one [`AuditEvent`]
//! line so an operator can reconstruct what a device was told and when.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::CommandId;
use crate::identity::DeviceId;

/// Action being recorded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    // Checkins
    /// A verified checkin was processed.
    CheckinReceived,
    /// A checkin failed verification or parsing.
    CheckinRejected,
    /// A device identified itself before enrollment.
    EnrollmentCheckin,

    // Device lifecycle
    /// TokenUpdate for a new or returning device.
    DeviceEnrolled,
    /// CheckOut received.
    DeviceDeparted,
    /// Operator changed display name, owner or location.
    MetadataUpdated,

    // Commands
    /// A command was added to a device queue.
    CommandQueued,
    /// A command was handed to a device.
    CommandDelivered,
    /// A device reported on a command.
    CommandResult,
    /// A report did not match any delivered command.
    CommandUnmatched,

    // Workflow
    /// The onboarding workflow changed stage.
    WorkflowAdvanced,
}

/// Target of an audit action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "id")]
pub enum AuditTarget {
    Device(DeviceId),
    Command(CommandId),
    /// A message whose sender could not be established.
    Unverified,
}

/// A single transaction log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred.
    pub ts: DateTime<Utc>,

    /// Device the event concerns (None for system-initiated).
    pub device: Option<DeviceId>,

    pub action: AuditAction,

    pub target: AuditTarget,

    /// Additional detail, ordered for deterministic output.
    pub metadata: BTreeMap<String, String>,
}

impl AuditEvent {
    /// Create a new audit event with the current timestamp.
    pub fn new(device: Option<DeviceId>, action: AuditAction, target: AuditTarget) -> Self {
        Self::with_timestamp(Utc::now(), device, action, target)
    }

    /// Create a new audit event with a specific timestamp.
    pub fn with_timestamp(
        ts: DateTime<Utc>,
        device: Option<DeviceId>,
        action: AuditAction,
        target: AuditTarget,
    ) -> Self {
        Self {
            ts,
            device,
            action,
            target,
            metadata: BTreeMap::new(),
        }
    }

    /// Add metadata to the event (builder pattern).
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
