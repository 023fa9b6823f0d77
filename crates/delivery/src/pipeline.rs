//! Delivery pipeline — one `DeliveryRecord` per recipient, idempotent on the
//! dedup key, with throttling, per-attempt timeouts, and retry
//! classification. Emits `DeliverySent` / `DeliveryFailed` events.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use mailwright_contacts::ContactStore;
use mailwright_core::config::DeliveryConfig;
use mailwright_core::event_bus::{make_event, EventSink};
use mailwright_core::mailer::{Mailer, MailerError};
use mailwright_core::types::{Campaign, DeliveryRecord, EventType, SendRef};
use mailwright_core::{MailwrightError, MailwrightResult};

use crate::content;
use crate::retry::backoff_secs;
use crate::store::{CampaignStore, DeliveryStore};
use crate::throttle::SendThrottle;

/// What happened to a single dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Mailer accepted; record is `sent`.
    Sent,
    /// A record for this dedup key already completed — success-no-op.
    Duplicate,
    /// Recipient is unsubscribed or bounced; no record created.
    Blocked,
    /// Attempt failed. Transient failures leave the record queued for
    /// retry; permanent ones finalize it as failed.
    Failed { transient: bool },
}

/// Summary of a bulk campaign send.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CampaignSendSummary {
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct DeliveryPipeline {
    records: Arc<DeliveryStore>,
    campaigns: Arc<CampaignStore>,
    contacts: Arc<ContactStore>,
    mailer: Arc<dyn Mailer>,
    throttle: SendThrottle,
    event_sink: Arc<dyn EventSink>,
    config: DeliveryConfig,
}

impl DeliveryPipeline {
    pub fn new(
        records: Arc<DeliveryStore>,
        campaigns: Arc<CampaignStore>,
        contacts: Arc<ContactStore>,
        mailer: Arc<dyn Mailer>,
        config: DeliveryConfig,
    ) -> Self {
        info!(
            timeout_ms = config.send_timeout_ms,
            max_attempts = config.max_attempts,
            rate = config.max_sends_per_second,
            "Delivery pipeline initialized"
        );
        Self {
            records,
            campaigns,
            contacts,
            mailer,
            throttle: SendThrottle::new(config.max_sends_per_second),
            event_sink: mailwright_core::event_bus::noop_sink(),
            config,
        }
    }

    /// Attach an event sink for emitting analytics events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn records(&self) -> Arc<DeliveryStore> {
        Arc::clone(&self.records)
    }

    pub fn campaigns(&self) -> Arc<CampaignStore> {
        Arc::clone(&self.campaigns)
    }

    /// Dispatches one recipient. Idempotent: a dedup key whose record has
    /// already left `queued` is a success-no-op. A queued record is the
    /// retry path and is attempted again.
    pub async fn dispatch(
        &self,
        campaign: &Campaign,
        contact_id: Uuid,
        send_ref: SendRef,
        enrollment_id: Option<Uuid>,
    ) -> MailwrightResult<DispatchOutcome> {
        let contact = self
            .contacts
            .get(&contact_id)
            .ok_or_else(|| MailwrightError::NotFound(format!("contact {}", contact_id)))?;

        if !contact.is_subscribed() {
            debug!(contact_id = %contact_id, status = ?contact.status, "Recipient blocked");
            return Ok(DispatchOutcome::Blocked);
        }

        let key = send_ref.dedup_key(contact_id, enrollment_id);
        if let Some(existing) = self.records.get(&key) {
            if existing.status != mailwright_core::types::DeliveryStatus::Queued {
                metrics::counter!("delivery.duplicates").increment(1);
                debug!(key = %key, "Duplicate dispatch, skipping");
                return Ok(DispatchOutcome::Duplicate);
            }
        } else {
            let record = DeliveryRecord::new(send_ref.clone(), contact_id, campaign.id, Utc::now());
            self.records.insert_new(&key, record);
        }

        // Compliance gate: no mailer call without an unsubscribe link.
        let unsubscribe = content::unsubscribe_url(&self.config.unsubscribe_base_url, &contact);
        let message = match content::render(campaign, &contact, &unsubscribe) {
            Ok(message) => message,
            Err(e) => {
                self.records
                    .fail_permanently(&key, "rendered content missing unsubscribe link")?;
                self.emit_failed(&contact_id, campaign, enrollment_id);
                return Err(e);
            }
        };

        if !self.throttle.try_acquire() {
            self.records.note_attempt_failure(&key, "throttled")?;
            metrics::counter!("delivery.throttled").increment(1);
            return Ok(DispatchOutcome::Failed { transient: true });
        }

        metrics::counter!("delivery.dispatched").increment(1);
        let timeout = Duration::from_millis(self.config.send_timeout_ms);
        match tokio::time::timeout(timeout, self.mailer.send(&message)).await {
            Ok(Ok(receipt)) => {
                self.records
                    .mark_sent(&key, &receipt.provider_id, Utc::now())?;
                self.event_sink.emit(make_event(
                    EventType::DeliverySent,
                    Some(contact_id),
                    None,
                    Some(campaign.id),
                    enrollment_id,
                    None,
                ));
                Ok(DispatchOutcome::Sent)
            }
            Ok(Err(MailerError::Permanent(reason))) => {
                warn!(contact_id = %contact_id, %reason, "Permanent delivery failure");
                self.records.fail_permanently(&key, &reason)?;
                // Hard bounce: remove the contact from all future sends.
                self.contacts.mark_bounced(&contact_id)?;
                self.event_sink.emit(make_event(
                    EventType::ContactBounced,
                    Some(contact_id),
                    None,
                    Some(campaign.id),
                    None,
                    Some(reason),
                ));
                self.emit_failed(&contact_id, campaign, enrollment_id);
                Ok(DispatchOutcome::Failed { transient: false })
            }
            Ok(Err(MailerError::Transient(reason))) => {
                let attempts = self.records.note_attempt_failure(&key, &reason)?;
                debug!(contact_id = %contact_id, attempts, %reason, "Transient delivery failure");
                Ok(DispatchOutcome::Failed { transient: true })
            }
            Err(_) => {
                let attempts = self.records.note_attempt_failure(&key, "send timed out")?;
                debug!(contact_id = %contact_id, attempts, "Mailer call timed out");
                Ok(DispatchOutcome::Failed { transient: true })
            }
        }
    }

    /// Dispatch with in-call bounded retry, used by the bulk path. Journey
    /// step sends retry across scheduler ticks instead.
    pub async fn dispatch_with_retry(
        &self,
        campaign: &Campaign,
        contact_id: Uuid,
        send_ref: SendRef,
    ) -> MailwrightResult<DispatchOutcome> {
        let mut attempt = 1;
        loop {
            let outcome = self
                .dispatch(campaign, contact_id, send_ref.clone(), None)
                .await?;
            match outcome {
                DispatchOutcome::Failed { transient: true } if attempt < self.config.max_attempts => {
                    let delay = backoff_secs(self.config.retry_base_secs, attempt);
                    debug!(contact_id = %contact_id, attempt, delay_secs = delay, "Retrying send");
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                    attempt += 1;
                }
                DispatchOutcome::Failed { transient: true } => {
                    let key = send_ref.dedup_key(contact_id, None);
                    self.records.fail_permanently(&key, "retry attempts exhausted")?;
                    self.emit_failed(&contact_id, campaign, None);
                    return Ok(DispatchOutcome::Failed { transient: false });
                }
                other => return Ok(other),
            }
        }
    }

    /// Bulk campaign send: resolves the subscribed segment at send time and
    /// fans out through the per-recipient dedup path.
    pub async fn send_campaign(&self, campaign_id: &Uuid) -> MailwrightResult<CampaignSendSummary> {
        let campaign = self.campaigns.begin_send(campaign_id)?;
        self.event_sink.emit(make_event(
            EventType::CampaignSendStarted,
            None,
            None,
            Some(campaign.id),
            None,
            None,
        ));

        let recipients = self.contacts.subscribed_matching_tags(&campaign.tags);
        info!(
            campaign_id = %campaign.id,
            recipients = recipients.len(),
            "Bulk campaign send starting"
        );

        let send_ref = SendRef::Campaign {
            campaign_id: campaign.id,
        };
        let mut summary = CampaignSendSummary {
            total: recipients.len(),
            ..Default::default()
        };

        for contact in recipients {
            match self
                .dispatch_with_retry(&campaign, contact.id, send_ref.clone())
                .await
            {
                Ok(DispatchOutcome::Sent) => summary.sent += 1,
                Ok(DispatchOutcome::Duplicate) | Ok(DispatchOutcome::Blocked) => {
                    summary.skipped += 1
                }
                Ok(DispatchOutcome::Failed { .. }) => summary.failed += 1,
                Err(e) => {
                    warn!(contact_id = %contact.id, error = %e, "Recipient send errored");
                    summary.failed += 1;
                }
            }
        }

        self.campaigns.finish_send(campaign_id)?;
        self.event_sink.emit(make_event(
            EventType::CampaignSendCompleted,
            None,
            None,
            Some(campaign.id),
            None,
            Some(format!("sent {} of {}", summary.sent, summary.total)),
        ));
        Ok(summary)
    }

    fn emit_failed(&self, contact_id: &Uuid, campaign: &Campaign, enrollment_id: Option<Uuid>) {
        metrics::counter!("delivery.failed").increment(1);
        self.event_sink.emit(make_event(
            EventType::DeliveryFailed,
            Some(*contact_id),
            None,
            Some(campaign.id),
            enrollment_id,
            None,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailwright_core::config::DeliveryConfig;
    use mailwright_core::mailer::MockMailer;
    use mailwright_core::types::{CampaignStatus, ContactSource, DeliveryStatus};
    use std::collections::BTreeSet;

    fn test_campaign(tags: &[&str]) -> Campaign {
        let now = Utc::now();
        Campaign {
            id: Uuid::new_v4(),
            name: "Welcome".to_string(),
            subject: "Hi {{first_name}}".to_string(),
            html_content:
                "<p>Hello {{first_name}}</p><a href=\"{{unsubscribe_url}}\">unsubscribe</a>"
                    .to_string(),
            text_content: "Hello. Unsubscribe: {{unsubscribe_url}}".to_string(),
            status: CampaignStatus::Draft,
            tags: tags.iter().map(|t| t.to_string()).collect::<BTreeSet<_>>(),
            created_at: now,
            updated_at: now,
            sent_at: None,
        }
    }

    struct Fixture {
        pipeline: DeliveryPipeline,
        contacts: Arc<ContactStore>,
        mailer: Arc<MockMailer>,
    }

    fn fixture() -> Fixture {
        fixture_with_config(DeliveryConfig::default())
    }

    fn fixture_with_config(config: DeliveryConfig) -> Fixture {
        let contacts = Arc::new(ContactStore::new());
        let mailer = Arc::new(MockMailer::new());
        let pipeline = DeliveryPipeline::new(
            Arc::new(DeliveryStore::new()),
            Arc::new(CampaignStore::new()),
            Arc::clone(&contacts),
            Arc::clone(&mailer) as Arc<dyn Mailer>,
            config,
        );
        Fixture {
            pipeline,
            contacts,
            mailer,
        }
    }

    #[tokio::test]
    async fn dispatch_is_idempotent_per_dedup_key() {
        let f = fixture();
        let contact = f
            .contacts
            .create("ada@example.com", Some("Ada".into()), None, ContactSource::Form)
            .unwrap();
        let campaign = test_campaign(&[]);
        let send_ref = SendRef::JourneyStep {
            journey_id: Uuid::new_v4(),
            step_number: 1,
        };
        let enrollment = Some(Uuid::new_v4());

        let first = f
            .pipeline
            .dispatch(&campaign, contact.id, send_ref.clone(), enrollment)
            .await
            .unwrap();
        assert_eq!(first, DispatchOutcome::Sent);

        let second = f
            .pipeline
            .dispatch(&campaign, contact.id, send_ref.clone(), enrollment)
            .await
            .unwrap();
        assert_eq!(second, DispatchOutcome::Duplicate);

        assert_eq!(f.mailer.sent_count(), 1);
        assert_eq!(f.pipeline.records().len(), 1);
    }

    #[tokio::test]
    async fn unsubscribed_contact_is_never_dispatched() {
        let f = fixture();
        let contact = f
            .contacts
            .create("gone@example.com", None, None, ContactSource::Form)
            .unwrap();
        f.contacts.mark_unsubscribed(&contact.id).unwrap();

        let campaign = test_campaign(&[]);
        let outcome = f
            .pipeline
            .dispatch(
                &campaign,
                contact.id,
                SendRef::Campaign {
                    campaign_id: campaign.id,
                },
                None,
            )
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Blocked);
        assert_eq!(f.mailer.sent_count(), 0);
        assert!(f.pipeline.records().is_empty());
    }

    #[tokio::test]
    async fn permanent_failure_bounces_the_contact() {
        let f = fixture();
        let contact = f
            .contacts
            .create("bad@example.com", None, None, ContactSource::Form)
            .unwrap();
        f.mailer
            .fail_next("bad@example.com", MailerError::Permanent("invalid address".into()));

        let campaign = test_campaign(&[]);
        let send_ref = SendRef::Campaign {
            campaign_id: campaign.id,
        };
        let outcome = f
            .pipeline
            .dispatch(&campaign, contact.id, send_ref.clone(), None)
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Failed { transient: false });
        let record = f
            .pipeline
            .records()
            .find(&send_ref, &contact.id)
            .unwrap();
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert_eq!(
            f.contacts.get(&contact.id).unwrap().status,
            mailwright_core::types::SubscriptionStatus::Bounced
        );
    }

    #[tokio::test]
    async fn missing_unsubscribe_link_never_reaches_the_mailer() {
        let f = fixture();
        let contact = f
            .contacts
            .create("ada@example.com", None, None, ContactSource::Form)
            .unwrap();

        let mut campaign = test_campaign(&[]);
        campaign.html_content = "<p>No link here</p>".to_string();

        let err = f
            .pipeline
            .dispatch(
                &campaign,
                contact.id,
                SendRef::Campaign {
                    campaign_id: campaign.id,
                },
                None,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, MailwrightError::Validation(_)));
        assert_eq!(f.mailer.sent_count(), 0);
    }

    #[tokio::test]
    async fn bulk_send_targets_the_segment_at_send_time() {
        let f = fixture_with_config(DeliveryConfig {
            retry_base_secs: 0,
            ..DeliveryConfig::default()
        });
        let tagged = f
            .contacts
            .create("tagged@example.com", None, None, ContactSource::Form)
            .unwrap();
        f.contacts.add_tag(&tagged.id, "newsletter").unwrap();
        f.contacts
            .create("untagged@example.com", None, None, ContactSource::Form)
            .unwrap();

        let campaign = test_campaign(&["newsletter"]);
        let id = f.pipeline.campaigns().create(campaign).unwrap();

        let summary = f.pipeline.send_campaign(&id).await.unwrap();
        assert_eq!(summary.total, 1);
        assert_eq!(summary.sent, 1);
        assert_eq!(f.mailer.sent_count(), 1);
        assert_eq!(
            f.pipeline.campaigns().get(&id).unwrap().status,
            CampaignStatus::Sent
        );

        // A second bulk send of the same campaign is rejected.
        assert!(f.pipeline.send_campaign(&id).await.is_err());
    }

    #[tokio::test]
    async fn transient_failures_retry_then_exhaust() {
        let f = fixture_with_config(DeliveryConfig {
            retry_base_secs: 0,
            max_attempts: 3,
            ..DeliveryConfig::default()
        });
        let contact = f
            .contacts
            .create("flaky@example.com", None, None, ContactSource::Form)
            .unwrap();
        for _ in 0..3 {
            f.mailer
                .fail_next("flaky@example.com", MailerError::Transient("rate limited".into()));
        }

        let campaign = test_campaign(&[]);
        let send_ref = SendRef::Campaign {
            campaign_id: campaign.id,
        };
        let outcome = f
            .pipeline
            .dispatch_with_retry(&campaign, contact.id, send_ref.clone())
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Failed { transient: false });
        let record = f.pipeline.records().find(&send_ref, &contact.id).unwrap();
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert_eq!(record.attempts, 3);

        // Contact stays subscribed — exhaustion is not a hard bounce.
        assert!(f.contacts.get(&contact.id).unwrap().is_subscribed());
    }
}
