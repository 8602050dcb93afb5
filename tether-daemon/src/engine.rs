//! Checkin engine.
//!
//! The engine is the only place where the pure session transitions meet
//! IO. Each checkin runs:
//!
//! 1. signature verification (blocking pool, bounded by `verify_timeout`)
//! 2. message classification
//! 3. [`session::apply`] under the device lock, persisted before release
//! 4. side effects: transaction log, push wakes, deferred enqueues
//!
//! Nothing a device sends can fail the engine; every outcome is a
//! [`CheckinReply`].

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tether_auth::{CertError, SignedMessage, TrustAnchors, VerifiedMessage, VerifyError};
use tether_core::session::{self, Enqueued, StageChange};
use tether_core::{
    AuditAction, AuditEvent, AuditTarget, CheckinKind, CheckinMessage, CommandCatalog, CommandId,
    Device, DeviceId, DeviceMetadata, DeviceStatus, Document, Effect, EnrollmentCheckin, Response,
    SessionContext, Transition, WorkflowPolicy, WorkflowStage,
};
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::audit_log::TransactionLog;
use crate::config::{ConfigError, DaemonConfig};
use crate::db::{DbService, StoreError};
use crate::orchestrator::Orchestrator;
use crate::push::{self, PushNotifier};
use crate::registry::{DeviceRegistry, RegistryError};

// ============================================================================
// Public types
// ============================================================================

/// A checkin as it arrives from the transport.
#[derive(Debug, Clone)]
pub struct RawCheckin {
    pub body: Vec<u8>,
    /// Signature header value.
    pub signature: String,
}

impl RawCheckin {
    pub fn new(body: impl Into<Vec<u8>>, signature: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            signature: signature.into(),
        }
    }
}

/// Connection facts supplied by the transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckinContext {
    pub remote_addr: Option<IpAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RejectReason {
    SignatureInvalid,
    MalformedMessage,
    UnknownDevice,
    Departed,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SignatureInvalid => "signature_invalid",
            Self::MalformedMessage => "malformed_message",
            Self::UnknownDevice => "unknown_device",
            Self::Departed => "departed",
        }
    }
}

/// Response to a checkin.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckinReply {
    /// Command document for the device to execute.
    Command(Document),
    /// Nothing queued. The transport sends an empty body.
    NoCommand,
    /// Empty result document.
    Empty(Document),
    Rejected(RejectReason),
    /// State could not be made durable. The transport answers with a
    /// retryable failure.
    Unavailable,
}

/// Per-device result of an operator queue request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    Queued(CommandId),
    UnknownDevice,
    Departed,
    /// The command is queued in memory, but not yet durable.
    StoreFailure,
}

/// Operator listing row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSummary {
    pub id: DeviceId,
    pub status: DeviceStatus,
    pub metadata: DeviceMetadata,
    pub stage: Option<WorkflowStage>,
    pub last_activity: DateTime<Utc>,
    pub pending: usize,
    pub has_push_token: bool,
    pub stale: bool,
}

/// Operator-supplied descriptive fields. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct MetadataUpdate {
    pub display_name: Option<String>,
    pub owner: Option<String>,
    pub location: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unknown command template: {0}")]
    UnknownTemplate(String),

    #[error("request type must not be empty")]
    EmptyRequestType,

    #[error("unknown device: {0}")]
    UnknownDevice(DeviceId),

    #[error("failed to read trust anchors from {path}: {source}")]
    TrustAnchorsRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid trust anchors: {0}")]
    TrustAnchors(#[from] CertError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Read a PEM bundle of trust anchors.
pub fn load_trust_anchors(path: &Path) -> Result<TrustAnchors, EngineError> {
    let pem = std::fs::read(path).map_err(|source| EngineError::TrustAnchorsRead {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(TrustAnchors::from_pem(&pem)?)
}

// ============================================================================
// Shared state
// ============================================================================

/// State shared by the engine, the orchestrator and deferred tasks.
pub(crate) struct Shared {
    pub(crate) registry: Arc<DeviceRegistry>,
    anchors: Arc<TrustAnchors>,
    catalog: CommandCatalog,
    pub(crate) policy: WorkflowPolicy,
    notifier: Arc<dyn PushNotifier>,
    log: TransactionLog,
    verify_timeout: Duration,
    push_timeout: Duration,
    deferred: Mutex<JoinSet<()>>,
}

enum VerifyFailure {
    Rejected(RejectReason, String),
    Timeout,
}

impl Shared {
    pub(crate) fn session_context(
        &self,
        now: DateTime<Utc>,
        remote_addr: Option<IpAddr>,
    ) -> SessionContext<'_> {
        SessionContext {
            now,
            remote_addr,
            catalog: &self.catalog,
            policy: &self.policy,
        }
    }

    pub(crate) async fn audit(&self, event: AuditEvent) {
        self.log.record(event).await;
    }

    async fn verify(
        &self,
        raw: &RawCheckin,
        now: DateTime<Utc>,
    ) -> Result<VerifiedMessage, VerifyFailure> {
        let message = SignedMessage::new(raw.body.clone(), raw.signature.clone());
        let anchors = Arc::clone(&self.anchors);
        let task = tokio::task::spawn_blocking(move || {
            tether_auth::verify(&message, &anchors, now.timestamp())
        });

        match tokio::time::timeout(self.verify_timeout, task).await {
            Ok(Ok(Ok(verified))) => Ok(verified),
            Ok(Ok(Err(VerifyError::SignatureInvalid(detail)))) => {
                Err(VerifyFailure::Rejected(RejectReason::SignatureInvalid, detail))
            }
            Ok(Ok(Err(VerifyError::MalformedMessage(detail)))) => {
                Err(VerifyFailure::Rejected(RejectReason::MalformedMessage, detail))
            }
            Ok(Ok(Err(other))) => Err(VerifyFailure::Rejected(
                RejectReason::SignatureInvalid,
                other.to_string(),
            )),
            Ok(Err(join)) => Err(VerifyFailure::Rejected(
                RejectReason::MalformedMessage,
                format!("verification aborted: {join}"),
            )),
            Err(_) => Err(VerifyFailure::Timeout),
        }
    }

    async fn reject(
        &self,
        udid: Option<&DeviceId>,
        reason: RejectReason,
        detail: &str,
    ) -> CheckinReply {
        match udid {
            Some(udid) => {
                tracing::warn!(udid = %udid, reason = reason.as_str(), detail = %detail, "Checkin rejected");
            }
            None => {
                tracing::warn!(reason = reason.as_str(), detail = %detail, "Checkin rejected");
            }
        }
        let target = match udid {
            Some(udid) => AuditTarget::Device(udid.clone()),
            None => AuditTarget::Unverified,
        };
        self.audit(
            AuditEvent::new(udid.cloned(), AuditAction::CheckinRejected, target)
                .with_metadata("reason", reason.as_str())
                .with_metadata("detail", detail),
        )
        .await;
        CheckinReply::Rejected(reason)
    }

    /// Run everything a committed transition asks for.
    pub(crate) async fn after_commit(self: &Arc<Self>, device: &Device, transition: &Transition) {
        let udid = &device.id;

        if let Some(id) = transition.delivered {
            tracing::debug!(udid = %udid, command_id = %id, "Command delivered");
            self.audit(
                AuditEvent::new(
                    Some(udid.clone()),
                    AuditAction::CommandDelivered,
                    AuditTarget::Command(id),
                )
                .with_metadata("deliveries", deliveries(device, &id).to_string()),
            )
            .await;
        }

        for finding in &transition.findings {
            tracing::warn!(udid = %udid, error = %finding, "Unmatched command report");
            self.audit(
                AuditEvent::new(
                    Some(udid.clone()),
                    AuditAction::CommandUnmatched,
                    AuditTarget::Device(udid.clone()),
                )
                .with_metadata("error", finding.to_string()),
            )
            .await;
        }

        for enqueued in &transition.enqueued {
            self.log_enqueued(udid, enqueued).await;
        }

        if let Some(change) = transition.stage_change {
            self.log_stage_change(udid, change).await;
        }

        for effect in &transition.effects {
            match *effect {
                Effect::Push => {
                    push::wake(self.notifier.as_ref(), device, self.push_timeout).await;
                }
                Effect::EnqueueAfter {
                    template,
                    delay,
                    expected_stage,
                } => self.schedule(udid.clone(), template, delay, expected_stage).await,
            }
        }
    }

    pub(crate) async fn log_enqueued(&self, udid: &DeviceId, enqueued: &Enqueued) {
        tracing::debug!(
            udid = %udid,
            command_id = %enqueued.id,
            request_type = %enqueued.request_type,
            "Command queued"
        );
        self.audit(
            AuditEvent::new(
                Some(udid.clone()),
                AuditAction::CommandQueued,
                AuditTarget::Command(enqueued.id),
            )
            .with_metadata("request_type", enqueued.request_type.clone()),
        )
        .await;
    }

    async fn log_stage_change(&self, udid: &DeviceId, change: StageChange) {
        let from = change.from.map_or("none", |s| s.as_str());
        tracing::info!(udid = %udid, from = from, to = change.to.as_str(), "Workflow advanced");
        self.audit(
            AuditEvent::new(
                Some(udid.clone()),
                AuditAction::WorkflowAdvanced,
                AuditTarget::Device(udid.clone()),
            )
            .with_metadata("from", from)
            .with_metadata("to", change.to.as_str()),
        )
        .await;
    }

    async fn schedule(
        self: &Arc<Self>,
        udid: DeviceId,
        template: &'static str,
        delay: TimeDelta,
        expected_stage: WorkflowStage,
    ) {
        let shared = Arc::clone(self);
        let sleep = delay.to_std().unwrap_or_default();
        tracing::debug!(
            udid = %udid,
            template = template,
            delay = ?sleep,
            "Deferred enqueue scheduled"
        );

        let mut deferred = self.deferred.lock().await;
        while deferred.try_join_next().is_some() {}
        deferred.spawn(async move {
            tokio::time::sleep(sleep).await;
            shared.run_deferred(udid, template, expected_stage).await;
        });
    }

    async fn run_deferred(
        self: &Arc<Self>,
        udid: DeviceId,
        template: &'static str,
        expected_stage: WorkflowStage,
    ) {
        let ctx = self.session_context(Utc::now(), None);
        let result = self
            .registry
            .update(&udid, |d| session::deferred_enqueue(d, template, expected_stage, &ctx))
            .await;

        match result {
            Ok((device, Some(enqueued))) => {
                self.log_enqueued(&udid, &enqueued).await;
                push::wake(self.notifier.as_ref(), &device, self.push_timeout).await;
            }
            Ok((_, None)) => {
                tracing::debug!(udid = %udid, template = template, "Deferred enqueue no longer needed");
            }
            Err(e) => {
                tracing::warn!(udid = %udid, template = template, error = %e, "Deferred enqueue failed");
            }
        }
    }
}

fn deliveries(device: &Device, id: &CommandId) -> u32 {
    device.command(id).map_or(0, |r| r.deliveries)
}

// ============================================================================
// Engine
// ============================================================================

/// Device checkin and operator API.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("devices", &self.shared.registry.len())
            .field("anchors", &self.shared.anchors.len())
            .finish()
    }
}

impl Engine {
    /// Open the store under the configured data directory and restore the
    /// registry from it.
    pub async fn open(
        config: &DaemonConfig,
        anchors: TrustAnchors,
        notifier: Arc<dyn PushNotifier>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let db_path = config.db_path();
        tracing::info!(path = %db_path.display(), "Opening database");
        let db = DbService::open(&db_path).await?;
        let registry = DeviceRegistry::restore(db, config.store_timeout()).await?;

        Ok(Self {
            shared: Arc::new(Shared {
                registry: Arc::new(registry),
                anchors: Arc::new(anchors),
                catalog: CommandCatalog::standard(&config.management_tools_manifest),
                policy: config.workflow_policy(),
                notifier,
                log: TransactionLog::new(config.transaction_log_path()),
                verify_timeout: config.verify_timeout(),
                push_timeout: config.push_timeout(),
                deferred: Mutex::new(JoinSet::new()),
            }),
        })
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.shared.registry
    }

    pub fn catalog(&self) -> &CommandCatalog {
        &self.shared.catalog
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(Arc::clone(&self.shared))
    }

    /// Handle a checkin at the current time.
    pub async fn handle_checkin(&self, raw: &RawCheckin, ctx: &CheckinContext) -> CheckinReply {
        self.handle_checkin_at(raw, ctx, Utc::now()).await
    }

    /// Handle a checkin as of `now`.
    pub async fn handle_checkin_at(
        &self,
        raw: &RawCheckin,
        ctx: &CheckinContext,
        now: DateTime<Utc>,
    ) -> CheckinReply {
        let shared = &self.shared;

        let verified = match shared.verify(raw, now).await {
            Ok(verified) => verified,
            Err(VerifyFailure::Rejected(reason, detail)) => {
                return shared.reject(None, reason, &detail).await
            }
            Err(VerifyFailure::Timeout) => {
                tracing::warn!("Signature verification timed out");
                return CheckinReply::Unavailable;
            }
        };

        let message = match CheckinMessage::from_document(&verified.document) {
            Ok(message) => message,
            Err(e) => {
                return shared
                    .reject(None, RejectReason::MalformedMessage, &e.to_string())
                    .await
            }
        };
        let udid = message.udid.clone();
        let kind = message.kind.name();

        if matches!(message.kind, CheckinKind::Idle) {
            tracing::debug!(udid = %udid, "Idle poll");
        } else {
            tracing::debug!(udid = %udid, kind = kind, signer = %verified.signer, "Checkin");
        }

        let sctx = shared.session_context(now, ctx.remote_addr);
        let result = match &message.kind {
            CheckinKind::TokenUpdate(_) => {
                shared
                    .registry
                    .upsert(&udid, now, |d| session::apply(d, &message, &sctx))
                    .await
            }
            CheckinKind::Authenticate if !shared.registry.contains(&udid) => {
                tracing::info!(udid = %udid, "Authenticate from new device");
                shared
                    .audit(
                        AuditEvent::new(
                            Some(udid.clone()),
                            AuditAction::CheckinReceived,
                            AuditTarget::Device(udid.clone()),
                        )
                        .with_metadata("kind", kind),
                    )
                    .await;
                return CheckinReply::Empty(Document::new());
            }
            _ => {
                shared
                    .registry
                    .update(&udid, |d| session::apply(d, &message, &sctx))
                    .await
            }
        };

        let (device, transition) = match result {
            Ok(committed) => committed,
            Err(RegistryError::NotFound(_)) => {
                return shared
                    .reject(Some(&udid), RejectReason::UnknownDevice, "device not registered")
                    .await
            }
            Err(e @ RegistryError::Persist { .. }) => {
                tracing::warn!(udid = %udid, kind = kind, error = %e, "Checkin not durable");
                return CheckinReply::Unavailable;
            }
        };

        if transition.response == Response::Departed {
            return shared
                .reject(Some(&udid), RejectReason::Departed, "device checked out")
                .await;
        }

        shared
            .audit(
                AuditEvent::new(
                    Some(udid.clone()),
                    AuditAction::CheckinReceived,
                    AuditTarget::Device(udid.clone()),
                )
                .with_metadata("kind", kind),
            )
            .await;

        match &message.kind {
            CheckinKind::TokenUpdate(_) => {
                tracing::info!(udid = %udid, "Device enrolled");
                shared
                    .audit(AuditEvent::new(
                        Some(udid.clone()),
                        AuditAction::DeviceEnrolled,
                        AuditTarget::Device(udid.clone()),
                    ))
                    .await;
            }
            CheckinKind::CheckOut => {
                tracing::info!(udid = %udid, "Device checked out");
                shared
                    .audit(AuditEvent::new(
                        Some(udid.clone()),
                        AuditAction::DeviceDeparted,
                        AuditTarget::Device(udid.clone()),
                    ))
                    .await;
            }
            CheckinKind::Acknowledged(report) | CheckinKind::Error(report)
                if transition.findings.is_empty() =>
            {
                if let Some(id) = CommandId::parse(&report.command_uuid) {
                    shared
                        .audit(
                            AuditEvent::new(
                                Some(udid.clone()),
                                AuditAction::CommandResult,
                                AuditTarget::Command(id),
                            )
                            .with_metadata("status", kind),
                        )
                        .await;
                }
            }
            CheckinKind::NotNow(report) if transition.findings.is_empty() => {
                if let Some(id) = CommandId::parse(&report.command_uuid) {
                    shared
                        .audit(
                            AuditEvent::new(
                                Some(udid.clone()),
                                AuditAction::CommandResult,
                                AuditTarget::Command(id),
                            )
                            .with_metadata("status", kind),
                        )
                        .await;
                }
            }
            _ => {}
        }

        shared.after_commit(&device, &transition).await;

        match transition.response {
            Response::Command(command) => CheckinReply::Command(command.to_document()),
            Response::NoCommand => CheckinReply::NoCommand,
            Response::Empty | Response::Departed => CheckinReply::Empty(Document::new()),
        }
    }

    /// Handle a pre-enrollment device identification at the current time.
    pub async fn handle_enrollment_checkin(
        &self,
        raw: &RawCheckin,
        ctx: &CheckinContext,
    ) -> CheckinReply {
        self.handle_enrollment_checkin_at(raw, ctx, Utc::now()).await
    }

    pub async fn handle_enrollment_checkin_at(
        &self,
        raw: &RawCheckin,
        ctx: &CheckinContext,
        now: DateTime<Utc>,
    ) -> CheckinReply {
        let shared = &self.shared;

        let verified = match shared.verify(raw, now).await {
            Ok(verified) => verified,
            Err(VerifyFailure::Rejected(reason, detail)) => {
                return shared.reject(None, reason, &detail).await
            }
            Err(VerifyFailure::Timeout) => return CheckinReply::Unavailable,
        };
        let checkin = match EnrollmentCheckin::from_document(&verified.document) {
            Ok(checkin) => checkin,
            Err(e) => {
                return shared
                    .reject(None, RejectReason::MalformedMessage, &e.to_string())
                    .await
            }
        };

        let sctx = shared.session_context(now, ctx.remote_addr);
        let result = shared
            .registry
            .upsert(&checkin.udid, now, |d| session::apply_enrollment(d, &checkin, &sctx))
            .await;
        let (device, transition) = match result {
            Ok(committed) => committed,
            Err(e) => {
                tracing::warn!(udid = %checkin.udid, error = %e, "Enrollment checkin not durable");
                return CheckinReply::Unavailable;
            }
        };

        tracing::info!(
            udid = %checkin.udid,
            serial = checkin.serial_number.as_deref().unwrap_or(""),
            product = checkin.product.as_deref().unwrap_or(""),
            "Enrollment checkin"
        );
        let mut event = AuditEvent::new(
            Some(checkin.udid.clone()),
            AuditAction::EnrollmentCheckin,
            AuditTarget::Device(checkin.udid.clone()),
        );
        if let Some(serial) = &checkin.serial_number {
            event = event.with_metadata("serial", serial.clone());
        }
        shared.audit(event).await;

        shared.after_commit(&device, &transition).await;
        CheckinReply::Empty(Document::new())
    }

    /// Queue a catalog template for each device.
    pub async fn queue_command(
        &self,
        template: &str,
        devices: &[DeviceId],
    ) -> Result<Vec<QueueOutcome>, EngineError> {
        let template = self
            .shared
            .catalog
            .get(template)
            .ok_or_else(|| EngineError::UnknownTemplate(template.to_string()))?
            .clone();
        Ok(self
            .enqueue_for(&template.request_type, &template.payload, devices)
            .await)
    }

    /// Queue an ad-hoc command for each device.
    pub async fn queue_raw(
        &self,
        request_type: &str,
        payload: Document,
        devices: &[DeviceId],
    ) -> Result<Vec<QueueOutcome>, EngineError> {
        if request_type.trim().is_empty() {
            return Err(EngineError::EmptyRequestType);
        }
        Ok(self.enqueue_for(request_type, &payload, devices).await)
    }

    async fn enqueue_for(
        &self,
        request_type: &str,
        payload: &Document,
        devices: &[DeviceId],
    ) -> Vec<QueueOutcome> {
        let shared = &self.shared;
        let mut outcomes = Vec::with_capacity(devices.len());

        for udid in devices {
            let now = Utc::now();
            let result = shared
                .registry
                .update(udid, |d| {
                    if d.is_departed() {
                        None
                    } else {
                        Some(d.enqueue(request_type, payload.clone(), now))
                    }
                })
                .await;

            let outcome = match result {
                Ok((device, Some(id))) => {
                    let enqueued = Enqueued {
                        id,
                        request_type: request_type.to_string(),
                    };
                    shared.log_enqueued(udid, &enqueued).await;
                    push::wake(shared.notifier.as_ref(), &device, shared.push_timeout).await;
                    QueueOutcome::Queued(id)
                }
                Ok((_, None)) => QueueOutcome::Departed,
                Err(RegistryError::NotFound(_)) => QueueOutcome::UnknownDevice,
                Err(RegistryError::Persist { .. }) => QueueOutcome::StoreFailure,
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Every device, sorted by identifier.
    pub async fn list_devices(&self) -> Vec<DeviceSummary> {
        let mut rows: Vec<DeviceSummary> = self
            .shared
            .registry
            .summaries()
            .await
            .into_iter()
            .map(|view| {
                let d = view.device;
                DeviceSummary {
                    stage: d.stage(),
                    pending: d.pending_count(),
                    has_push_token: d.push_token.is_some(),
                    id: d.id,
                    status: d.status,
                    metadata: d.metadata,
                    last_activity: d.last_activity,
                    stale: view.stale,
                }
            })
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }

    /// The recorded result document of a command.
    pub async fn command_result(&self, udid: &DeviceId, command: &CommandId) -> Option<Document> {
        self.shared
            .registry
            .get(udid)
            .await
            .and_then(|d| d.result(command).cloned())
    }

    /// Set operator metadata on a device.
    pub async fn update_metadata(
        &self,
        udid: &DeviceId,
        update: MetadataUpdate,
    ) -> Result<DeviceMetadata, EngineError> {
        let (device, ()) = self
            .shared
            .registry
            .update(udid, |d| {
                if let Some(name) = update.display_name.clone() {
                    d.metadata.display_name = Some(name);
                }
                if let Some(owner) = update.owner.clone() {
                    d.metadata.owner = Some(owner);
                }
                if let Some(location) = update.location.clone() {
                    d.metadata.location = Some(location);
                }
            })
            .await
            .map_err(|e| match e {
                RegistryError::NotFound(id) => EngineError::UnknownDevice(id),
                other => EngineError::Registry(other),
            })?;

        self.shared
            .audit(AuditEvent::new(
                Some(udid.clone()),
                AuditAction::MetadataUpdated,
                AuditTarget::Device(udid.clone()),
            ))
            .await;
        Ok(device.metadata)
    }

    /// Wait for every scheduled deferred enqueue to finish.
    pub async fn settle(&self) {
        loop {
            let mut batch = std::mem::take(&mut *self.shared.deferred.lock().await);
            if batch.is_empty() {
                return;
            }
            while let Some(result) = batch.join_next().await {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "Deferred task failed");
                }
            }
        }
    }

    /// Cancel pending deferred work and write a final snapshot.
    ///
    /// Cancelled enqueues are recovered by the next sweep after restart.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.shared.deferred.lock().await.abort_all();
        match self.shared.registry.persist().await {
            Ok(count) => {
                tracing::info!(devices = count, "Registry snapshot written");
                Ok(())
            }
            Err(e) => {
                let stale = self.shared.registry.stale_count().await;
                tracing::error!(error = %e, stale = stale, "Final snapshot failed");
                Err(e.into())
            }
        }
    }
}
