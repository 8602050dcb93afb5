//! # Tether Core
//!
//! Pure domain types and transition logic for the Tether device enrollment
//! and command-dispatch engine.
//!
//! ## Design Principles
//!
//! This crate is intentionally **IO-free**:
//! - No filesystem operations
//! - No network calls
//! - No database interactions
//! - No logging
//!
//! Time is always passed in. Every transition takes `now` explicitly, so
//! tests can drive the onboarding workflow without sleeping. Persistence,
//! push delivery and locking live in `tether-daemon`.
//!
//! ## Modules
//!
//! - [`document`] - Key-value documents exchanged with devices
//! - [`identity`] - Device identifiers and push addressing
//! - [`device`] - Device records
//! - [`command`] - Commands and their delivery states
//! - [`queue`] - Per-device FIFO command queue
//! - [`catalog`] - Named command templates
//! - [`workflow`] - Onboarding stages and transition table
//! - [`message`] - Inbound checkin classification
//! - [`session`] - Checkin transition function
//! - [`audit`] - Transaction log records

pub mod audit;
pub mod catalog;
pub mod command;
pub mod device;
pub mod document;
pub mod identity;
pub mod message;
pub mod queue;
pub mod session;
pub mod workflow;

pub use audit::{AuditAction, AuditEvent, AuditTarget};
pub use catalog::{CommandCatalog, CommandTemplate};
pub use command::{Command, CommandId, CommandOutcome, CommandRecord, CommandState};
pub use device::{Device, DeviceMetadata, DeviceStatus};
pub use document::{Document, DocumentError};
pub use identity::{DeviceId, PushToken, UnlockToken};
pub use message::{CheckinKind, CheckinMessage, EnrollmentCheckin, MessageError};
pub use queue::QueueError;
pub use session::{Effect, Response, SessionContext, Transition};
pub use workflow::{WorkflowPolicy, WorkflowRecord, WorkflowStage};
