//! Post-enrollment onboarding workflow.
//!
//! A device that reports `AwaitingConfiguration` walks a fixed sequence:
//!
//! ```text
//! CheckinPost → AwaitingConfiguration → DeviceConfigured → InstallApplication → AllDone
//! ```
//!
//! Transitions are a declarative table of `(stage, trigger) → (next stage, action)`.
//! The same table is consulted when an acknowledgement arrives and when the
//! periodic sweep finds a device that has sat in a stage longer than
//! [`WorkflowPolicy::retry_after`]. Acknowledgements are authoritative; the
//! time-driven rows only re-issue the command the device is expected to answer.
//!
//! Evaluating the table has no side effects. Callers apply the returned
//! [`WorkflowStep`] under the device lock and must skip an enqueue when a
//! command of the same request type is already outstanding.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::names;

/// Position in the onboarding sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowStage {
    /// Device identified itself before enrollment.
    CheckinPost,
    /// Device is sitting in Setup Assistant waiting for `SetupConfiguration`.
    AwaitingConfiguration,
    /// Setup was applied; waiting for the `DeviceConfigured` marker to be acknowledged.
    DeviceConfigured,
    /// Waiting for the management tools install to be acknowledged.
    InstallApplication,
    /// Onboarding finished.
    AllDone,
}

impl WorkflowStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AllDone)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CheckinPost => "CheckinPost",
            Self::AwaitingConfiguration => "AwaitingConfiguration",
            Self::DeviceConfigured => "DeviceConfigured",
            Self::InstallApplication => "InstallApplication",
            Self::AllDone => "AllDone",
        }
    }
}

/// Current stage and when the device entered it (or was last nudged).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub stage: WorkflowStage,
    pub since: DateTime<Utc>,
}

impl WorkflowRecord {
    pub fn new(stage: WorkflowStage, since: DateTime<Utc>) -> Self {
        Self { stage, since }
    }

    /// Strictly more than `retry_after` has passed since the last transition.
    pub fn is_due(&self, now: DateTime<Utc>, policy: &WorkflowPolicy) -> bool {
        now.signed_duration_since(self.since) > policy.retry_after
    }
}

/// Timing knobs for the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkflowPolicy {
    /// Time a stage may go unanswered before its command is re-issued.
    pub retry_after: TimeDelta,
    /// Pause between the `DeviceConfigured` acknowledgement and the install command.
    pub install_delay: TimeDelta,
}

impl Default for WorkflowPolicy {
    fn default() -> Self {
        Self {
            retry_after: TimeDelta::seconds(5),
            install_delay: TimeDelta::seconds(5),
        }
    }
}

/// Event the table is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowTrigger<'a> {
    /// A command of this request type was acknowledged.
    Acknowledged(&'a str),
    /// The device answered a command with NotNow.
    NotNow,
    /// Periodic sweep.
    Elapsed,
}

/// Side effect of a transition. Templates are named in the command catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowAction {
    Enqueue(&'static str),
    EnqueueAfter {
        template: &'static str,
        delay: TimeDelta,
    },
}

/// Result of a matching table row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkflowStep {
    pub next: WorkflowStage,
    pub action: Option<WorkflowAction>,
}

impl WorkflowStep {
    /// True when the step moves the device to a new stage.
    pub fn advances_from(&self, current: WorkflowStage) -> bool {
        self.next != current
    }
}

// ============================================================================
// Transition table
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq)]
enum On {
    Ack(&'static str),
    NotNow,
    Elapsed,
}

#[derive(Clone, Copy)]
enum Act {
    None,
    Enqueue(&'static str),
    EnqueueAfterInstallDelay(&'static str),
}

struct Rule {
    stage: WorkflowStage,
    on: On,
    next: WorkflowStage,
    act: Act,
}

const RULES: &[Rule] = &[
    // ── Acknowledgements (authoritative) ───────────────────────────────────
    Rule {
        stage: WorkflowStage::AwaitingConfiguration,
        on: On::Ack(names::SETUP_CONFIGURATION),
        next: WorkflowStage::DeviceConfigured,
        act: Act::Enqueue(names::DEVICE_CONFIGURED),
    },
    Rule {
        stage: WorkflowStage::DeviceConfigured,
        on: On::Ack(names::DEVICE_CONFIGURED),
        next: WorkflowStage::InstallApplication,
        act: Act::EnqueueAfterInstallDelay(names::INSTALL_MANAGEMENT_TOOLS),
    },
    Rule {
        stage: WorkflowStage::InstallApplication,
        on: On::Ack(names::INSTALL_APPLICATION),
        next: WorkflowStage::AllDone,
        act: Act::None,
    },
    // ── Recovery (time-gated) ──────────────────────────────────────────────
    Rule {
        stage: WorkflowStage::AwaitingConfiguration,
        on: On::Elapsed,
        next: WorkflowStage::AwaitingConfiguration,
        act: Act::Enqueue(names::SETUP_CONFIGURATION),
    },
    Rule {
        stage: WorkflowStage::DeviceConfigured,
        on: On::Elapsed,
        next: WorkflowStage::DeviceConfigured,
        act: Act::Enqueue(names::DEVICE_CONFIGURED),
    },
    Rule {
        stage: WorkflowStage::InstallApplication,
        on: On::Elapsed,
        next: WorkflowStage::InstallApplication,
        act: Act::Enqueue(names::INSTALL_MANAGEMENT_TOOLS),
    },
    Rule {
        stage: WorkflowStage::InstallApplication,
        on: On::NotNow,
        next: WorkflowStage::InstallApplication,
        act: Act::Enqueue(names::INSTALL_MANAGEMENT_TOOLS),
    },
];

/// Evaluate the transition table.
///
/// Returns `None` when no row matches, including time-gated rows that are
/// not yet due.
pub fn on_event(
    record: &WorkflowRecord,
    trigger: WorkflowTrigger<'_>,
    policy: &WorkflowPolicy,
    now: DateTime<Utc>,
) -> Option<WorkflowStep> {
    let rule = RULES.iter().find(|rule| {
        rule.stage == record.stage
            && match (rule.on, trigger) {
                (On::Ack(expected), WorkflowTrigger::Acknowledged(request_type)) => {
                    expected == request_type
                }
                (On::NotNow, WorkflowTrigger::NotNow) | (On::Elapsed, WorkflowTrigger::Elapsed) => {
                    true
                }
                _ => false,
            }
    })?;

    if matches!(rule.on, On::NotNow | On::Elapsed) && !record.is_due(now, policy) {
        return None;
    }

    let action = match rule.act {
        Act::None => None,
        Act::Enqueue(template) => Some(WorkflowAction::Enqueue(template)),
        Act::EnqueueAfterInstallDelay(template) => Some(WorkflowAction::EnqueueAfter {
            template,
            delay: policy.install_delay,
        }),
    };

    Some(WorkflowStep {
        next: rule.next,
        action,
    })
}
