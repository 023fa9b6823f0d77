//! Mailer capability boundary. Provider integrations (SendGrid, SES, SMTP
//! relays) live behind this trait; the engine only sees acceptance, a
//! provider id for later callback correlation, or a classified error.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A fully rendered email ready for the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundEmail {
    pub contact_id: Uuid,
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// Provider acceptance of a single send. `provider_id` correlates later
/// delivery callbacks to the originating record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderReceipt {
    pub provider_id: String,
}

/// Mailer failures, classified for retry handling: transient errors are
/// retried with backoff, permanent ones never are.
#[derive(Error, Debug, Clone)]
pub enum MailerError {
    /// Provider timeout, rate limit, 5xx — retryable.
    #[error("Transient mailer error: {0}")]
    Transient(String),

    /// Invalid address, hard bounce, suppressed recipient — never retried.
    #[error("Permanent mailer error: {0}")]
    Permanent(String),
}

impl MailerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, MailerError::Transient(_))
    }
}

/// The provider boundary. One call per recipient; implementations must not
/// retry internally — classification drives the engine's retry policy.
#[async_trait::async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &OutboundEmail) -> Result<ProviderReceipt, MailerError>;
}

/// In-memory mailer for tests and dev wiring. Records every accepted send
/// and can be scripted to fail specific recipients.
#[derive(Default)]
pub struct MockMailer {
    sent: Mutex<Vec<OutboundEmail>>,
    scripted: Mutex<HashMap<String, Vec<MailerError>>>,
}

impl MockMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an error outcome for the next send to `to`. Outcomes are
    /// consumed in order; once the queue drains, sends succeed again.
    pub fn fail_next(&self, to: &str, error: MailerError) {
        self.scripted
            .lock()
            .entry(to.to_string())
            .or_default()
            .push(error);
    }

    pub fn sent(&self) -> Vec<OutboundEmail> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait::async_trait]
impl Mailer for MockMailer {
    async fn send(&self, message: &OutboundEmail) -> Result<ProviderReceipt, MailerError> {
        let scripted = {
            let mut map = self.scripted.lock();
            match map.get_mut(&message.to) {
                Some(queue) if !queue.is_empty() => Some(queue.remove(0)),
                _ => None,
            }
        };
        if let Some(error) = scripted {
            return Err(error);
        }

        self.sent.lock().push(message.clone());
        Ok(ProviderReceipt {
            provider_id: format!("mock-{}", Uuid::new_v4()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_mailer_records_sends() {
        let mailer = MockMailer::new();
        let message = OutboundEmail {
            contact_id: Uuid::new_v4(),
            to: "a@example.com".to_string(),
            subject: "Hello".to_string(),
            html: "<p>Hi</p>".to_string(),
            text: "Hi".to_string(),
        };

        let receipt = mailer.send(&message).await.unwrap();
        assert!(receipt.provider_id.starts_with("mock-"));
        assert_eq!(mailer.sent_count(), 1);
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let mailer = MockMailer::new();
        mailer.fail_next("b@example.com", MailerError::Transient("timeout".into()));

        let message = OutboundEmail {
            contact_id: Uuid::new_v4(),
            to: "b@example.com".to_string(),
            subject: "Hello".to_string(),
            html: "<p>Hi</p>".to_string(),
            text: "Hi".to_string(),
        };

        let err = mailer.send(&message).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(mailer.sent_count(), 0);

        // Queue drained; next send succeeds.
        mailer.send(&message).await.unwrap();
        assert_eq!(mailer.sent_count(), 1);
    }
}
