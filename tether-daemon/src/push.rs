//! Push wake-ups.
//!
//! A push tells a device to poll sooner. It is never required for delivery:
//! anything queued is picked up on the device's next scheduled checkin.

use std::time::Duration;

use async_trait::async_trait;
use tether_core::{Device, DeviceId, PushToken};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    #[error("push rejected: {0}")]
    Rejected(String),

    #[error("push service unavailable: {0}")]
    Unavailable(String),

    #[error("push timed out")]
    Timeout,
}

/// Sends a wake notification to one device.
#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn notify(&self, token: &PushToken, magic: &str) -> Result<(), PushError>;
}

/// Notifier that records the wake in the log and succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl PushNotifier for LogNotifier {
    async fn notify(&self, token: &PushToken, magic: &str) -> Result<(), PushError> {
        tracing::info!(token = ?token, magic = %magic, "Push wake requested");
        Ok(())
    }
}

/// What [`wake`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeOutcome {
    Sent,
    /// The device has not registered a token yet.
    NoToken,
    Failed(PushError),
}

/// Push `device` under `timeout`. Failures are logged and returned.
pub async fn wake(notifier: &dyn PushNotifier, device: &Device, timeout: Duration) -> WakeOutcome {
    let (Some(token), Some(magic)) = (&device.push_token, &device.push_magic) else {
        tracing::debug!(udid = %device.id, "No push token; skipping wake");
        return WakeOutcome::NoToken;
    };

    let result = match tokio::time::timeout(timeout, notifier.notify(token, magic)).await {
        Ok(result) => result,
        Err(_) => Err(PushError::Timeout),
    };
    match result {
        Ok(()) => WakeOutcome::Sent,
        Err(e) => {
            log_failure(&device.id, &e);
            WakeOutcome::Failed(e)
        }
    }
}

fn log_failure(udid: &DeviceId, error: &PushError) {
    tracing::warn!(udid = %udid, error = %error, "Push failed; command stays queued");
}
