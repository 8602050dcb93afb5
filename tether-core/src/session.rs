//! Checkin session transitions.
//!
//! [`apply`] is the pure transition `(Device, Message) -> (Device', effects, response)`.
//! It mutates the device in place and describes everything that must happen
//! outside the device lock (push wakes, deferred enqueues) as [`Effect`]s. The
//! caller persists the device before acting on the transition.

use std::net::IpAddr;

use chrono::{DateTime, TimeDelta, Utc};

use crate::catalog::{names, CommandCatalog};
use crate::command::{Command, CommandId, CommandOutcome};
use crate::device::{Device, DeviceStatus};
use crate::message::{CheckinKind, CheckinMessage, CommandReport, EnrollmentCheckin, TokenUpdate};
use crate::queue::QueueError;
use crate::workflow::{self, WorkflowAction, WorkflowPolicy, WorkflowStage, WorkflowStep, WorkflowTrigger};

/// Inputs shared by every transition.
#[derive(Debug, Clone, Copy)]
pub struct SessionContext<'a> {
    pub now: DateTime<Utc>,
    pub remote_addr: Option<IpAddr>,
    pub catalog: &'a CommandCatalog,
    pub policy: &'a WorkflowPolicy,
}

/// What the device gets back.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// The next command to execute.
    Command(Command),
    /// Nothing queued for an idle poll. Rendered as an empty body.
    NoCommand,
    /// Empty result document acknowledging the checkin.
    Empty,
    /// The device checked out; only a new TokenUpdate is accepted.
    Departed,
}

/// Work to perform after the device state is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Wake the device so it polls for newly queued work.
    Push,
    /// Enqueue `template` after `delay`, provided the device is still in
    /// `expected_stage` and has no such command outstanding.
    EnqueueAfter {
        template: &'static str,
        delay: TimeDelta,
        expected_stage: WorkflowStage,
    },
}

/// A command added during a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueued {
    pub id: CommandId,
    pub request_type: String,
}

/// A workflow stage change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageChange {
    pub from: Option<WorkflowStage>,
    pub to: WorkflowStage,
}

/// Outcome of applying one message.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub response: Response,
    pub effects: Vec<Effect>,
    pub enqueued: Vec<Enqueued>,
    pub stage_change: Option<StageChange>,
    /// A command delivered by this transition.
    pub delivered: Option<CommandId>,
    /// Recoverable correlation problems, reported but not fatal.
    pub findings: Vec<QueueError>,
}

impl Transition {
    fn new(response: Response) -> Self {
        Self {
            response,
            effects: Vec::new(),
            enqueued: Vec::new(),
            stage_change: None,
            delivered: None,
            findings: Vec::new(),
        }
    }

    fn push(&mut self) {
        if !self.effects.contains(&Effect::Push) {
            self.effects.push(Effect::Push);
        }
    }

    pub fn wants_push(&self) -> bool {
        self.effects.contains(&Effect::Push)
    }
}

/// Apply a checkin to a device.
pub fn apply(device: &mut Device, message: &CheckinMessage, ctx: &SessionContext<'_>) -> Transition {
    if device.is_departed() && !matches!(message.kind, CheckinKind::TokenUpdate(_)) {
        return Transition::new(Response::Departed);
    }

    device.touch(ctx.now);

    match &message.kind {
        CheckinKind::Idle => idle(device, ctx),
        CheckinKind::TokenUpdate(update) => token_update(device, update, ctx),
        CheckinKind::Acknowledged(report) => {
            command_report(device, report, CommandOutcome::Acknowledged, ctx)
        }
        CheckinKind::Error(report) => command_report(device, report, CommandOutcome::Error, ctx),
        CheckinKind::NotNow(report) => not_now(device, report, ctx),
        CheckinKind::Authenticate => Transition::new(Response::Empty),
        CheckinKind::CheckOut => {
            device.status = DeviceStatus::Departed;
            Transition::new(Response::Empty)
        }
    }
}

/// Apply a pre-enrollment device identification.
pub fn apply_enrollment(
    device: &mut Device,
    checkin: &EnrollmentCheckin,
    ctx: &SessionContext<'_>,
) -> Transition {
    device.touch(ctx.now);
    if let Some(addr) = ctx.remote_addr {
        device.address = Some(addr);
    }
    if checkin.serial_number.is_some() {
        device.metadata.serial_number = checkin.serial_number.clone();
    }
    if checkin.product.is_some() {
        device.metadata.product = checkin.product.clone();
    }
    if checkin.os_version.is_some() {
        device.metadata.os_version = checkin.os_version.clone();
    }

    let mut transition = Transition::new(Response::Empty);
    if !device.in_workflow() {
        let from = device.stage();
        device.set_stage(WorkflowStage::CheckinPost, ctx.now);
        transition.stage_change = Some(StageChange {
            from,
            to: WorkflowStage::CheckinPost,
        });
    }
    transition
}

/// Evaluate the time-driven workflow rows for one device.
///
/// Used by the periodic sweep. Re-checks the stage and elapsed time against
/// the current device state, so a sweep that raced an acknowledgement is a
/// no-op.
pub fn sweep(device: &mut Device, ctx: &SessionContext<'_>) -> Transition {
    let mut transition = Transition::new(Response::Empty);
    if device.is_departed() {
        return transition;
    }
    if let Some(record) = device.workflow {
        if let Some(step) = workflow::on_event(&record, WorkflowTrigger::Elapsed, ctx.policy, ctx.now)
        {
            apply_step(device, step, ctx, &mut transition);
        }
    }
    transition
}

/// Run a deferred [`Effect::EnqueueAfter`].
///
/// Returns `None` without touching the device when the workflow has moved
/// on or a command of the same request type is already outstanding.
pub fn deferred_enqueue(
    device: &mut Device,
    template: &str,
    expected_stage: WorkflowStage,
    ctx: &SessionContext<'_>,
) -> Option<Enqueued> {
    if device.is_departed() || device.stage() != Some(expected_stage) {
        return None;
    }
    let enqueued = enqueue_once(device, template, ctx)?;
    device.set_stage(expected_stage, ctx.now);
    Some(enqueued)
}

/// Enqueue a catalog template. `None` if the template does not exist.
pub fn enqueue_template(device: &mut Device, template: &str, ctx: &SessionContext<'_>) -> Option<Enqueued> {
    let template = ctx.catalog.get(template)?;
    let id = device.enqueue(
        template.request_type.clone(),
        template.payload.clone(),
        ctx.now,
    );
    Some(Enqueued {
        id,
        request_type: template.request_type.clone(),
    })
}

/// Enqueue a catalog template unless one of its request type is outstanding.
pub fn enqueue_once(device: &mut Device, template: &str, ctx: &SessionContext<'_>) -> Option<Enqueued> {
    let request_type = &ctx.catalog.get(template)?.request_type;
    if device.has_outstanding(request_type) {
        return None;
    }
    enqueue_template(device, template, ctx)
}

// ============================================================================
// Message handlers
// ============================================================================

fn idle(device: &mut Device, ctx: &SessionContext<'_>) -> Transition {
    match device.dequeue_next(ctx.now) {
        Some(command) => {
            let mut transition = Transition::new(Response::Command(command.clone()));
            transition.delivered = Some(command.id);
            transition
        }
        None => Transition::new(Response::NoCommand),
    }
}

fn token_update(device: &mut Device, update: &TokenUpdate, ctx: &SessionContext<'_>) -> Transition {
    device.push_token = Some(update.push_token.clone());
    device.push_magic = Some(update.push_magic.clone());
    if update.unlock_token.is_some() {
        device.unlock_token = update.unlock_token.clone();
    }
    if let Some(addr) = ctx.remote_addr {
        device.address = Some(addr);
    }
    device.status = DeviceStatus::Enrolled;
    device.enrolled_at.get_or_insert(ctx.now);

    let mut transition = Transition::new(Response::Empty);
    if let Some(enqueued) = enqueue_template(device, names::DEVICE_INFORMATION, ctx) {
        transition.enqueued.push(enqueued);
        transition.push();
    }

    // A device already past AwaitingConfiguration keeps its place.
    if update.awaiting_configuration
        && matches!(
            device.stage(),
            None | Some(WorkflowStage::CheckinPost) | Some(WorkflowStage::AllDone)
        )
    {
        let from = device.stage();
        device.set_stage(WorkflowStage::AwaitingConfiguration, ctx.now);
        transition.stage_change = Some(StageChange {
            from,
            to: WorkflowStage::AwaitingConfiguration,
        });
    }

    transition
}

fn command_report(
    device: &mut Device,
    report: &CommandReport,
    outcome: CommandOutcome,
    ctx: &SessionContext<'_>,
) -> Transition {
    let mut transition = Transition::new(Response::Empty);

    let Some(id) = CommandId::parse(&report.command_uuid) else {
        transition
            .findings
            .push(QueueError::UnknownCommand(report.command_uuid.clone()));
        return transition;
    };

    let request_type = match device.record_result(id, outcome, report.document.clone(), ctx.now) {
        Ok(record) => record.command.request_type.clone(),
        Err(e) => {
            transition.findings.push(e);
            return transition;
        }
    };

    if let Some(q) = &report.query_responses {
        let meta = &mut device.metadata;
        if q.device_name.is_some() {
            meta.device_name = q.device_name.clone();
        }
        if q.model_name.is_some() {
            meta.model_name = q.model_name.clone();
        }
        if q.os_version.is_some() {
            meta.os_version = q.os_version.clone();
        }
        if q.serial_number.is_some() {
            meta.serial_number = q.serial_number.clone();
        }
    }

    if outcome == CommandOutcome::Acknowledged {
        if let Some(record) = device.workflow {
            let trigger = WorkflowTrigger::Acknowledged(&request_type);
            if let Some(step) = workflow::on_event(&record, trigger, ctx.policy, ctx.now) {
                apply_step(device, step, ctx, &mut transition);
            }
        }
    }

    transition
}

fn not_now(device: &mut Device, report: &CommandReport, ctx: &SessionContext<'_>) -> Transition {
    let mut transition = Transition::new(Response::Empty);

    match CommandId::parse(&report.command_uuid) {
        Some(id) => {
            if let Err(e) = device.record_not_now(id, ctx.now) {
                transition.findings.push(e);
            }
        }
        None => transition
            .findings
            .push(QueueError::UnknownCommand(report.command_uuid.clone())),
    }

    if let Some(enqueued) = enqueue_once(device, names::DEVICE_INFORMATION, ctx) {
        transition.enqueued.push(enqueued);
        transition.push();
    }

    if let Some(record) = device.workflow {
        if let Some(step) = workflow::on_event(&record, WorkflowTrigger::NotNow, ctx.policy, ctx.now)
        {
            apply_step(device, step, ctx, &mut transition);
        }
    }

    transition
}

/// Apply a matched workflow row.
///
/// Advancing rows always move the stage. Re-issue rows refresh `since` only
/// when they actually enqueue, so an outstanding command is never duplicated.
fn apply_step(
    device: &mut Device,
    step: WorkflowStep,
    ctx: &SessionContext<'_>,
    transition: &mut Transition,
) {
    let current = device.stage();
    let advancing = current.map_or(true, |stage| step.advances_from(stage));
    if advancing {
        device.set_stage(step.next, ctx.now);
        transition.stage_change = Some(StageChange {
            from: current,
            to: step.next,
        });
    }

    match step.action {
        None => {}
        Some(WorkflowAction::Enqueue(template)) => {
            if let Some(enqueued) = enqueue_once(device, template, ctx) {
                if !advancing {
                    device.set_stage(step.next, ctx.now);
                }
                transition.enqueued.push(enqueued);
                transition.push();
            }
        }
        Some(WorkflowAction::EnqueueAfter { template, delay }) => {
            transition.effects.push(Effect::EnqueueAfter {
                template,
                delay,
                expected_stage: step.next,
            });
        }
    }
}
