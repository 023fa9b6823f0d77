//! Provider webhook processing. Applies forward-only status transitions to
//! delivery records, flips contacts on unsubscribe/complaint/bounce, halts
//! the contact's journeys, and surfaces opens/clicks as trigger events.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use mailwright_contacts::ContactStore;
use mailwright_core::event_bus::{make_event, EventSink, TriggerSink};
use mailwright_core::types::{DeliveryStatus, EventType, TriggerEvent, TriggerEventType};
use mailwright_core::MailwrightResult;

use crate::store::DeliveryStore;

/// Provider callback event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailEventType {
    Delivered,
    Opened,
    Clicked,
    Bounced,
    Unsubscribed,
    Complained,
}

/// A delivery status callback from the mail provider, correlated to the
/// originating send by `provider_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailWebhookEvent {
    pub provider_id: String,
    pub event: EmailEventType,
    pub occurred_at: DateTime<Utc>,
}

/// Implemented by the enrollment store so an unsubscribing contact stops
/// receiving journey steps without this crate depending on the journey
/// engine.
pub trait EnrollmentHalt: Send + Sync {
    fn contact_unsubscribed(&self, contact_id: Uuid);
}

/// No-op halt for tests and standalone wiring.
pub struct NoOpHalt;

impl EnrollmentHalt for NoOpHalt {
    fn contact_unsubscribed(&self, _contact_id: Uuid) {}
}

pub struct WebhookProcessor {
    records: Arc<DeliveryStore>,
    contacts: Arc<ContactStore>,
    halt: Arc<dyn EnrollmentHalt>,
    triggers: Arc<dyn TriggerSink>,
    event_sink: Arc<dyn EventSink>,
}

impl WebhookProcessor {
    pub fn new(records: Arc<DeliveryStore>, contacts: Arc<ContactStore>) -> Self {
        Self {
            records,
            contacts,
            halt: Arc::new(NoOpHalt),
            triggers: mailwright_core::event_bus::noop_trigger_sink(),
            event_sink: mailwright_core::event_bus::noop_sink(),
        }
    }

    pub fn with_halt(mut self, halt: Arc<dyn EnrollmentHalt>) -> Self {
        self.halt = halt;
        self
    }

    pub fn with_trigger_sink(mut self, triggers: Arc<dyn TriggerSink>) -> Self {
        self.triggers = triggers;
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Applies one provider callback. Returns `true` when the record moved
    /// forward; unknown provider ids and out-of-order callbacks are skipped.
    pub fn process(&self, event: &EmailWebhookEvent) -> MailwrightResult<bool> {
        let Some(key) = self.records.key_for_provider(&event.provider_id) else {
            warn!(provider_id = %event.provider_id, "Webhook for unknown provider id, skipping");
            return Ok(false);
        };

        let status = match event.event {
            EmailEventType::Delivered => DeliveryStatus::Delivered,
            EmailEventType::Opened => DeliveryStatus::Opened,
            EmailEventType::Clicked => DeliveryStatus::Clicked,
            EmailEventType::Bounced => DeliveryStatus::Bounced,
            EmailEventType::Unsubscribed => DeliveryStatus::Unsubscribed,
            EmailEventType::Complained => DeliveryStatus::Complained,
        };

        metrics::counter!("webhook.events", "type" => format!("{:?}", event.event)).increment(1);

        let applied = self.records.transition(&key, status, event.occurred_at)?;
        if !applied {
            debug!(key = %key, event = ?event.event, "Stale webhook, status unchanged");
            return Ok(false);
        }

        let Some(record) = self.records.get(&key) else {
            return Ok(false);
        };
        let contact_id = record.contact_id;
        let campaign_id = record.campaign_id;

        match event.event {
            EmailEventType::Delivered => {
                self.event_sink.emit(make_event(
                    EventType::DeliveryDelivered,
                    Some(contact_id),
                    None,
                    Some(campaign_id),
                    None,
                    None,
                ));
            }
            EmailEventType::Opened => {
                self.event_sink.emit(make_event(
                    EventType::DeliveryOpened,
                    Some(contact_id),
                    None,
                    Some(campaign_id),
                    None,
                    None,
                ));
                self.triggers.push(TriggerEvent::new(
                    TriggerEventType::CampaignOpened { campaign_id },
                    contact_id,
                    serde_json::json!({ "provider_id": event.provider_id }),
                ));
            }
            EmailEventType::Clicked => {
                self.event_sink.emit(make_event(
                    EventType::DeliveryClicked,
                    Some(contact_id),
                    None,
                    Some(campaign_id),
                    None,
                    None,
                ));
                self.triggers.push(TriggerEvent::new(
                    TriggerEventType::CampaignClicked { campaign_id },
                    contact_id,
                    serde_json::json!({ "provider_id": event.provider_id }),
                ));
            }
            EmailEventType::Bounced => {
                info!(contact_id = %contact_id, "Hard bounce, contact removed from sends");
                self.contacts.mark_bounced(&contact_id)?;
                self.event_sink.emit(make_event(
                    EventType::ContactBounced,
                    Some(contact_id),
                    None,
                    Some(campaign_id),
                    None,
                    None,
                ));
            }
            EmailEventType::Unsubscribed | EmailEventType::Complained => {
                info!(contact_id = %contact_id, event = ?event.event, "Contact opted out");
                self.contacts.mark_unsubscribed(&contact_id)?;
                self.halt.contact_unsubscribed(contact_id);
                self.event_sink.emit(make_event(
                    EventType::ContactUnsubscribed,
                    Some(contact_id),
                    None,
                    Some(campaign_id),
                    None,
                    None,
                ));
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailwright_core::types::{ContactSource, DeliveryRecord, SendRef, SubscriptionStatus};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHalt {
        halted: Mutex<Vec<Uuid>>,
    }

    impl EnrollmentHalt for RecordingHalt {
        fn contact_unsubscribed(&self, contact_id: Uuid) {
            self.halted.lock().unwrap().push(contact_id);
        }
    }

    struct Fixture {
        records: Arc<DeliveryStore>,
        contacts: Arc<ContactStore>,
        halt: Arc<RecordingHalt>,
        processor: WebhookProcessor,
        contact_id: Uuid,
    }

    fn fixture() -> Fixture {
        let records = Arc::new(DeliveryStore::new());
        let contacts = Arc::new(ContactStore::new());
        let halt = Arc::new(RecordingHalt::default());
        let contact = contacts
            .create("ada@example.com", None, None, ContactSource::Form)
            .unwrap();

        let send_ref = SendRef::Campaign {
            campaign_id: Uuid::new_v4(),
        };
        let key = send_ref.dedup_key(contact.id, None);
        let record = DeliveryRecord::new(send_ref, contact.id, Uuid::new_v4(), Utc::now());
        records.insert_new(&key, record);
        records.mark_sent(&key, "prov-1", Utc::now()).unwrap();

        let processor = WebhookProcessor::new(Arc::clone(&records), Arc::clone(&contacts))
            .with_halt(Arc::clone(&halt) as Arc<dyn EnrollmentHalt>);

        Fixture {
            records,
            contacts,
            halt,
            processor,
            contact_id: contact.id,
        }
    }

    fn event(provider_id: &str, event: EmailEventType) -> EmailWebhookEvent {
        EmailWebhookEvent {
            provider_id: provider_id.to_string(),
            event,
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn callbacks_advance_the_record() {
        let f = fixture();
        assert!(f.processor.process(&event("prov-1", EmailEventType::Delivered)).unwrap());
        assert!(f.processor.process(&event("prov-1", EmailEventType::Opened)).unwrap());

        // Replayed callback is stale, not an error.
        assert!(!f.processor.process(&event("prov-1", EmailEventType::Delivered)).unwrap());

        let record = f.records.get(&f.records.key_for_provider("prov-1").unwrap()).unwrap();
        assert_eq!(record.status, DeliveryStatus::Opened);
    }

    #[test]
    fn unknown_provider_id_is_skipped() {
        let f = fixture();
        assert!(!f.processor.process(&event("prov-unknown", EmailEventType::Opened)).unwrap());
    }

    #[test]
    fn unsubscribe_flips_contact_and_halts_journeys() {
        let f = fixture();
        assert!(f
            .processor
            .process(&event("prov-1", EmailEventType::Unsubscribed))
            .unwrap());

        assert_eq!(
            f.contacts.get(&f.contact_id).unwrap().status,
            SubscriptionStatus::Unsubscribed
        );
        assert_eq!(f.halt.halted.lock().unwrap().as_slice(), &[f.contact_id]);
    }

    #[test]
    fn complaint_behaves_like_unsubscribe() {
        let f = fixture();
        f.processor
            .process(&event("prov-1", EmailEventType::Complained))
            .unwrap();
        assert_eq!(
            f.contacts.get(&f.contact_id).unwrap().status,
            SubscriptionStatus::Unsubscribed
        );
        assert_eq!(f.halt.halted.lock().unwrap().len(), 1);
    }

    #[test]
    fn bounce_callback_marks_contact_bounced() {
        let f = fixture();
        f.processor
            .process(&event("prov-1", EmailEventType::Bounced))
            .unwrap();
        assert_eq!(
            f.contacts.get(&f.contact_id).unwrap().status,
            SubscriptionStatus::Bounced
        );
        assert!(f.halt.halted.lock().unwrap().is_empty());
    }
}
