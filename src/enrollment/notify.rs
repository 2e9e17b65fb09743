use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Message templates the enrollment flow sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKey {
    FormReceived,
    FormApproved,
    FormRejected,
    FormExpired,
}

impl TemplateKey {
    pub const fn key(self) -> &'static str {
        match self {
            TemplateKey::FormReceived => "form_received",
            TemplateKey::FormApproved => "form_approved",
            TemplateKey::FormRejected => "form_rejected",
            TemplateKey::FormExpired => "form_expired",
        }
    }
}

/// Outbound message, kept so adapters and tests can assert integration boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub email: String,
    pub template: TemplateKey,
    pub variables: BTreeMap<String, String>,
}

impl Notification {
    pub fn new(email: impl Into<String>, template: TemplateKey) -> Self {
        Self {
            email: email.into(),
            template,
            variables: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.variables.insert(key.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("notification transport unavailable: {0}")]
    Transport(String),
    #[error("recipient rejected: {0}")]
    Rejected(String),
    #[error("notification not acknowledged within {0:?}")]
    TimedOut(Duration),
}

/// Trait describing outbound message hooks (e-mail or similar adapters).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        email: &str,
        template: TemplateKey,
        variables: &BTreeMap<String, String>,
    ) -> Result<(), NotificationError>;
}

/// Best-effort delivery with bounded retries. Runs only after a commit and never reports failure upward.
///
/// Each attempt is cut off after `timeout`, so a stalled transport delays the
/// caller by at most `attempts * timeout` plus backoff.
pub struct NotificationDispatcher<N> {
    notifier: Arc<N>,
    attempts: u32,
    backoff: Duration,
    timeout: Duration,
}

impl<N> NotificationDispatcher<N>
where
    N: Notifier + 'static,
{
    pub fn new(notifier: Arc<N>, attempts: u32) -> Self {
        Self {
            notifier,
            attempts: attempts.max(1),
            backoff: Duration::from_millis(25),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Returns whether the message was delivered.
    pub async fn dispatch(&self, notification: Notification) -> bool {
        for attempt in 1..=self.attempts {
            let sent = tokio::time::timeout(
                self.timeout,
                self.notifier.send(
                    &notification.email,
                    notification.template,
                    &notification.variables,
                ),
            )
            .await;
            let err = match sent {
                Ok(Ok(())) => return true,
                Ok(Err(err)) => err,
                Err(_) => NotificationError::TimedOut(self.timeout),
            };
            warn!(
                template = notification.template.key(),
                attempt,
                attempts = self.attempts,
                error = %err,
                "notification failed"
            );
            if attempt < self.attempts {
                tokio::time::sleep(self.backoff * attempt).await;
            }
        }
        false
    }

    /// Skips silently when the guardian has no address on file.
    pub async fn dispatch_to<F>(&self, email: Option<&str>, build: F) -> bool
    where
        F: FnOnce(&str) -> Notification,
    {
        match email {
            Some(address) if !address.trim().is_empty() => self.dispatch(build(address)).await,
            _ => false,
        }
    }
}
