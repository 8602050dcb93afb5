//! Device records tracked by the registry.

use std::collections::{BTreeMap, VecDeque};
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::{CommandId, CommandRecord};
use crate::identity::{DeviceId, PushToken, UnlockToken};
use crate::workflow::{WorkflowRecord, WorkflowStage};

/// Enrollment status of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    /// Seen only through a pre-enrollment checkin.
    Pending,
    /// Holds a push token and polls for commands.
    Enrolled,
    /// Sent CheckOut. The record is kept for audit.
    Departed,
}

/// Descriptive fields, set by operators or learned from query responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    // ── Operator supplied ─────────────────────────────────────────────────
    pub display_name: Option<String>,
    pub owner: Option<String>,
    pub location: Option<String>,

    // ── Reported by the device ────────────────────────────────────────────
    pub device_name: Option<String>,
    pub model_name: Option<String>,
    pub os_version: Option<String>,
    pub serial_number: Option<String>,
    pub product: Option<String>,
}

/// One managed device and its command history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    // ── Identity ──────────────────────────────────────────────────────────
    pub id: DeviceId,
    pub status: DeviceStatus,

    // ── Addressing (replaced on re-enrollment) ────────────────────────────
    pub push_token: Option<PushToken>,
    pub push_magic: Option<String>,
    pub unlock_token: Option<UnlockToken>,
    pub address: Option<IpAddr>,

    pub metadata: DeviceMetadata,

    // ── Lifecycle ─────────────────────────────────────────────────────────
    pub first_seen: DateTime<Utc>,
    pub enrolled_at: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    pub workflow: Option<WorkflowRecord>,

    // ── Command queue ─────────────────────────────────────────────────────
    pub(crate) pending: VecDeque<CommandId>,
    pub(crate) in_flight: Option<CommandId>,
    pub(crate) commands: BTreeMap<CommandId, CommandRecord>,
}

impl Device {
    /// A device seen for the first time at `now`.
    pub fn new(id: DeviceId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status: DeviceStatus::Pending,
            push_token: None,
            push_magic: None,
            unlock_token: None,
            address: None,
            metadata: DeviceMetadata::default(),
            first_seen: now,
            enrolled_at: None,
            last_activity: now,
            workflow: None,
            pending: VecDeque::new(),
            in_flight: None,
            commands: BTreeMap::new(),
        }
    }

    /// Record activity; never moves `last_activity` backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    pub fn is_departed(&self) -> bool {
        self.status == DeviceStatus::Departed
    }

    pub fn stage(&self) -> Option<WorkflowStage> {
        self.workflow.map(|w| w.stage)
    }

    pub fn set_stage(&mut self, stage: WorkflowStage, now: DateTime<Utc>) {
        self.workflow = Some(WorkflowRecord::new(stage, now));
    }

    /// True when the device is mid-onboarding.
    pub fn in_workflow(&self) -> bool {
        self.workflow.is_some_and(|w| !w.stage.is_terminal())
    }
}
