//! Tether daemon library.
//!
//! Wires the pure session logic in `tether-core` and the verifier in
//! `tether-auth` to durable storage, push wakes and the workflow sweep.
//!
//! - [`engine`] - Checkin handling and operator calls
//! - [`registry`] - Per-device locked state over [`db`]
//! - [`orchestrator`] - Periodic workflow retries
//! - [`push`] - Wake notifications
//! - [`audit_log`] - Transaction log
//! - [`config`] - Command line and environment settings

pub mod audit_log;
pub mod config;
pub mod db;
pub mod engine;
pub mod orchestrator;
pub mod push;
pub mod registry;

pub use config::{ConfigError, DaemonConfig};
pub use db::{DbService, StoreError};
pub use engine::{
    load_trust_anchors, CheckinContext, CheckinReply, DeviceSummary, Engine, EngineError,
    MetadataUpdate, QueueOutcome, RawCheckin, RejectReason,
};
pub use orchestrator::{Orchestrator, SweepReport};
pub use push::{LogNotifier, PushError, PushNotifier};
pub use registry::{DeviceRegistry, DeviceView, RegistryError};
