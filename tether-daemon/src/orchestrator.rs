//! Periodic workflow sweep.
//!
//! The sweep is the recovery path for onboarding: when an expected
//! acknowledgement never arrives, the stage's command is re-issued once the
//! stage has been idle longer than `retry_after`. Acknowledgements stay
//! authoritative; every sweep re-checks the device inside its lock and skips
//! devices that moved on or already have the command outstanding.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tether_core::session;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::engine::Shared;
use crate::registry::RegistryError;

/// Outcome of one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Devices whose workflow was due for a retry.
    pub examined: usize,
    pub enqueued: usize,
    pub store_failures: usize,
}

/// Drives time-based workflow rows for every device.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Evaluate every device as of `now`.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let shared = &self.shared;
        let mut report = SweepReport::default();

        let due: Vec<_> = shared
            .registry
            .all()
            .await
            .into_iter()
            .filter(|d| {
                !d.is_departed()
                    && d.in_workflow()
                    && d.workflow.is_some_and(|w| w.is_due(now, &shared.policy))
            })
            .map(|d| d.id)
            .collect();

        for udid in due {
            report.examined += 1;
            let ctx = shared.session_context(now, None);
            let result = shared
                .registry
                .update(&udid, |d| session::sweep(d, &ctx))
                .await;

            match result {
                Ok((device, transition)) => {
                    report.enqueued += transition.enqueued.len();
                    shared.after_commit(&device, &transition).await;
                }
                Err(RegistryError::NotFound(_)) => {}
                Err(e) => {
                    report.store_failures += 1;
                    tracing::warn!(udid = %udid, error = %e, "Sweep update not durable");
                }
            }
        }

        report
    }

    /// Sweep every `interval` until `shutdown` flips to true.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval = ?interval, "Workflow sweep started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep(Utc::now()).await;
                    if report.enqueued > 0 {
                        tracing::info!(
                            examined = report.examined,
                            enqueued = report.enqueued,
                            "Workflow sweep re-issued commands"
                        );
                    }
                    if report.store_failures > 0 {
                        tracing::warn!(failures = report.store_failures, "Workflow sweep hit store failures");
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Workflow sweep stopped");
    }
}
