//! Per-device command queue.
//!
//! Commands are delivered strictly in enqueue order with at most one command
//! in flight. A delivered command stays in flight until the device reports
//! Acknowledged, Error or NotNow for it; an idle poll in the meantime gets the
//! same command again rather than the next one.

use chrono::{DateTime, Utc};

use crate::command::{Command, CommandId, CommandOutcome, CommandRecord, CommandState};
use crate::device::Device;
use crate::document::Document;

/// Error correlating a device report with a command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The command was never delivered to this device.
    #[error("unknown command {0}")]
    UnknownCommand(String),

    /// The command already reached a terminal state.
    #[error("command {id} already completed as {state:?}")]
    AlreadyCompleted { id: CommandId, state: CommandState },
}

impl Device {
    /// Append a new command to the pending queue.
    pub fn enqueue(
        &mut self,
        request_type: impl Into<String>,
        payload: Document,
        now: DateTime<Utc>,
    ) -> CommandId {
        self.enqueue_command(Command::new(request_type, payload), now)
    }

    /// Append a prepared command to the pending queue.
    pub fn enqueue_command(&mut self, command: Command, now: DateTime<Utc>) -> CommandId {
        let id = command.id;
        self.commands.insert(id, CommandRecord::queued(command, now));
        self.pending.push_back(id);
        id
    }

    /// Hand out the next command.
    ///
    /// An unanswered in-flight command is redelivered first. Otherwise the
    /// head of the pending queue becomes the in-flight command. Returns `None`
    /// when there is nothing to deliver.
    pub fn dequeue_next(&mut self, now: DateTime<Utc>) -> Option<Command> {
        let id = match self.in_flight {
            Some(id) => id,
            None => {
                let id = self.pending.pop_front()?;
                self.in_flight = Some(id);
                id
            }
        };

        let record = self.commands.get_mut(&id)?;
        record.state = CommandState::Sent;
        record.sent_at = Some(now);
        record.deliveries = record.deliveries.saturating_add(1);
        Some(record.command.clone())
    }

    /// Record an Acknowledged or Error report.
    ///
    /// Unknown or already-completed commands leave the device untouched.
    pub fn record_result(
        &mut self,
        id: CommandId,
        outcome: CommandOutcome,
        result: Document,
        now: DateTime<Utc>,
    ) -> Result<&CommandRecord, QueueError> {
        let record = self.delivered_mut(id)?;
        record.state = outcome.into();
        record.completed_at = Some(now);
        record.result = Some(result);

        self.release(id);
        self.commands
            .get(&id)
            .ok_or_else(|| QueueError::UnknownCommand(id.to_string()))
    }

    /// Record a NotNow report.
    ///
    /// The command becomes retry-eligible but is not put back on the queue.
    pub fn record_not_now(
        &mut self,
        id: CommandId,
        now: DateTime<Utc>,
    ) -> Result<&CommandRecord, QueueError> {
        let record = self.delivered_mut(id)?;
        record.state = CommandState::NotNow;
        record.completed_at = Some(now);

        self.release(id);
        self.commands
            .get(&id)
            .ok_or_else(|| QueueError::UnknownCommand(id.to_string()))
    }

    /// Result document recorded for a command.
    pub fn result(&self, id: &CommandId) -> Option<&Document> {
        self.commands.get(id).and_then(|r| r.result.as_ref())
    }

    pub fn command(&self, id: &CommandId) -> Option<&CommandRecord> {
        self.commands.get(id)
    }

    /// All command records, ordered by identifier.
    pub fn commands(&self) -> impl Iterator<Item = &CommandRecord> {
        self.commands.values()
    }

    pub fn in_flight(&self) -> Option<CommandId> {
        self.in_flight
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// True if a command of `request_type` is queued or in flight.
    pub fn has_outstanding(&self, request_type: &str) -> bool {
        self.pending
            .iter()
            .chain(self.in_flight.iter())
            .filter_map(|id| self.commands.get(id))
            .any(|r| r.command.request_type == request_type)
    }

    fn delivered_mut(&mut self, id: CommandId) -> Result<&mut CommandRecord, QueueError> {
        let record = self
            .commands
            .get_mut(&id)
            .ok_or_else(|| QueueError::UnknownCommand(id.to_string()))?;
        if record.state == CommandState::Queued {
            return Err(QueueError::UnknownCommand(id.to_string()));
        }
        if record.state.is_terminal() {
            return Err(QueueError::AlreadyCompleted {
                id,
                state: record.state,
            });
        }
        Ok(record)
    }

    fn release(&mut self, id: CommandId) {
        if self.in_flight == Some(id) {
            self.in_flight = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DeviceId;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn now() -> DateTime<Utc> {
        ts("2024-01-15T10:00:00Z")
    }

    fn device() -> Device {
        Device::new(DeviceId::new("D1"), now())
    }

    /// Deliver and acknowledge whatever is in flight.
    fn complete_next(device: &mut Device) -> Command {
        let command = device.dequeue_next(now()).unwrap();
        device
            .record_result(command.id, CommandOutcome::Acknowledged, Document::new(), now())
            .unwrap();
        command
    }

    // ── Ordering ──────────────────────────────────────────────────────────

    #[test]
    fn delivers_in_enqueue_order() {
        let mut device = device();
        let ids: Vec<_> = ["ProfileList", "DeviceLock", "SecurityInfo", "Restrictions"]
            .iter()
            .map(|t| device.enqueue(*t, Document::new(), now()))
            .collect();

        let delivered: Vec<_> = (0..ids.len()).map(|_| complete_next(&mut device).id).collect();
        assert_eq!(delivered, ids);
        assert!(device.dequeue_next(now()).is_none());
    }

    #[test]
    fn empty_queue_yields_none() {
        let mut device = device();
        assert!(device.dequeue_next(now()).is_none());
        assert_eq!(device.in_flight(), None);
    }

    #[test]
    fn dequeue_marks_sent_and_in_flight() {
        let mut device = device();
        let id = device.enqueue("SecurityInfo", Document::new(), now());
        assert_eq!(device.command(&id).unwrap().state, CommandState::Queued);

        let command = device.dequeue_next(ts("2024-01-15T10:00:01Z")).unwrap();
        assert_eq!(command.id, id);
        let record = device.command(&id).unwrap();
        assert_eq!(record.state, CommandState::Sent);
        assert_eq!(record.sent_at, Some(ts("2024-01-15T10:00:01Z")));
        assert_eq!(record.deliveries, 1);
        assert_eq!(device.in_flight(), Some(id));
        assert_eq!(device.pending_count(), 0);
    }

    #[test]
    fn unanswered_command_is_redelivered_before_next() {
        let mut device = device();
        let first = device.enqueue("ProfileList", Document::new(), now());
        let second = device.enqueue("DeviceLock", Document::new(), now());

        assert_eq!(device.dequeue_next(now()).unwrap().id, first);
        assert_eq!(device.dequeue_next(now()).unwrap().id, first);
        assert_eq!(device.command(&first).unwrap().deliveries, 2);
        assert_eq!(device.pending.iter().copied().collect::<Vec<_>>(), vec![second]);
    }

    // ── Correlation ───────────────────────────────────────────────────────

    #[test]
    fn result_is_stored_and_retrievable() {
        let mut device = device();
        let id = device.enqueue("SecurityInfo", Document::new(), now());
        device.dequeue_next(now());

        let report = Document::new().with("Status", "Acknowledged").with("X", 1);
        let record = device
            .record_result(id, CommandOutcome::Acknowledged, report.clone(), now())
            .unwrap();
        assert_eq!(record.state, CommandState::Acknowledged);
        assert_eq!(device.result(&id), Some(&report));
        assert_eq!(device.in_flight(), None);
    }

    #[test]
    fn error_outcome_is_terminal() {
        let mut device = device();
        let id = device.enqueue("ClearPasscode", Document::new(), now());
        device.dequeue_next(now());
        device
            .record_result(id, CommandOutcome::Error, Document::new(), now())
            .unwrap();

        assert_eq!(device.command(&id).unwrap().state, CommandState::Error);
        assert!(matches!(
            device.record_result(id, CommandOutcome::Acknowledged, Document::new(), now()),
            Err(QueueError::AlreadyCompleted { .. })
        ));
    }

    #[test]
    fn unknown_command_leaves_state_untouched() {
        let mut device = device();
        device.enqueue("ProfileList", Document::new(), now());
        device.dequeue_next(now());
        let before = device.clone();

        let err = device
            .record_result(CommandId::new(), CommandOutcome::Acknowledged, Document::new(), now())
            .unwrap_err();
        assert!(matches!(err, QueueError::UnknownCommand(_)));
        assert!(device.record_not_now(CommandId::new(), now()).is_err());
        assert_eq!(device, before);
    }

    #[test]
    fn undelivered_command_cannot_be_answered() {
        let mut device = device();
        let id = device.enqueue("ProfileList", Document::new(), now());
        let before = device.clone();

        assert!(matches!(
            device.record_result(id, CommandOutcome::Acknowledged, Document::new(), now()),
            Err(QueueError::UnknownCommand(_))
        ));
        assert_eq!(device, before);
    }

    #[test]
    fn not_now_releases_without_requeue() {
        let mut device = device();
        let id = device.enqueue("InstallApplication", Document::new(), now());
        let next = device.enqueue("ProfileList", Document::new(), now());
        device.dequeue_next(now());

        let record = device.record_not_now(id, now()).unwrap();
        assert_eq!(record.state, CommandState::NotNow);
        assert_eq!(device.in_flight(), None);
        assert_eq!(device.pending.iter().copied().collect::<Vec<_>>(), vec![next]);
        assert!(!device.has_outstanding("InstallApplication"));
    }

    #[test]
    fn outstanding_covers_queued_and_in_flight() {
        let mut device = device();
        assert!(!device.has_outstanding("DeviceInformation"));
        device.enqueue("DeviceInformation", Document::new(), now());
        assert!(device.has_outstanding("DeviceInformation"));
        device.dequeue_next(now());
        assert!(device.has_outstanding("DeviceInformation"));
        complete_next(&mut device);
        assert!(!device.has_outstanding("DeviceInformation"));
    }
}
