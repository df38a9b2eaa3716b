//! Notifier (C7): delivers a qualified signal to an external channel and
//! can edit or clear it later as a tracking resolves.

pub mod telegram;

use async_trait::async_trait;

use crate::models::{Signal, Tracking};

pub use telegram::TelegramNotifier;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send a new alert, returning an opaque message id the caller can
    /// later pass to `edit`/`remove_markup`.
    async fn send_alert(&self, signal: &Signal) -> anyhow::Result<String>;

    /// Update a previously sent alert in place once a tracking resolves.
    async fn edit(&self, message_id: &str, signal: &Signal, tracking: &Tracking) -> anyhow::Result<()>;

    /// Strip any interactive controls from a message once it's no longer
    /// actionable (converged, diverged, expired).
    async fn remove_markup(&self, message_id: &str) -> anyhow::Result<()>;
}

/// No-op notifier used in tests and when no delivery channel is configured.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn send_alert(&self, signal: &Signal) -> anyhow::Result<String> {
        Ok(format!("null:{}", signal.fingerprint))
    }

    async fn edit(&self, _message_id: &str, _signal: &Signal, _tracking: &Tracking) -> anyhow::Result<()> {
        Ok(())
    }

    async fn remove_markup(&self, _message_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
}
