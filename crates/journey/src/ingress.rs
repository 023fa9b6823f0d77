//! Event ingress — the single entry point collaborators push domain events
//! through. Normalizes events, enforces the trigger-chain depth bound, and
//! hands them to the enrollment manager.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use mailwright_core::event_bus::TriggerSink;
use mailwright_core::types::TriggerEvent;
use mailwright_core::MailwrightResult;

use crate::enrollment::EnrollmentManager;

pub struct EventIngress {
    manager: Arc<EnrollmentManager>,
    max_trigger_depth: u8,
}

impl EventIngress {
    pub fn new(manager: Arc<EnrollmentManager>, max_trigger_depth: u8) -> Self {
        Self {
            manager,
            max_trigger_depth,
        }
    }

    /// Accepts one domain event. Events whose trigger chain is too deep are
    /// dropped with a warning — tag-triggered journeys tagging each other
    /// must terminate, not loop. Returns the enrollments created.
    pub fn ingest(&self, event: &TriggerEvent) -> MailwrightResult<Vec<Uuid>> {
        if event.chain_depth > self.max_trigger_depth {
            warn!(
                event_id = %event.id,
                contact_id = %event.contact_id,
                depth = event.chain_depth,
                max = self.max_trigger_depth,
                "Trigger chain too deep, dropping event"
            );
            metrics::counter!("ingress.dropped_deep_chains").increment(1);
            return Ok(Vec::new());
        }

        debug!(
            event_id = %event.id,
            event_type = ?event.event_type,
            contact_id = %event.contact_id,
            depth = event.chain_depth,
            "Ingesting trigger event"
        );
        metrics::counter!("ingress.events").increment(1);
        self.manager.handle_event(event, Utc::now())
    }
}

/// Lets the delivery layer and the scheduler push engagement- and
/// tag-derived events back through ingress without a crate cycle.
impl TriggerSink for EventIngress {
    fn push(&self, event: TriggerEvent) {
        if let Err(e) = self.ingest(&event) {
            warn!(event_id = %event.id, error = %e, "Pushed trigger event failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrollment::EnrollmentStore;
    use crate::registry::JourneyRegistry;
    use crate::types::{EntryTrigger, Journey, JourneyStatus, Step, StepAction, StepCondition};
    use mailwright_contacts::ContactStore;
    use mailwright_core::types::{ContactSource, TriggerEventType};

    fn ingress_with_tag_journey(max_depth: u8) -> (EventIngress, Arc<ContactStore>) {
        let enrollments = Arc::new(EnrollmentStore::new());
        let registry = Arc::new(JourneyRegistry::new(Arc::clone(&enrollments)));
        let contacts = Arc::new(ContactStore::new());

        let now = Utc::now();
        let id = registry
            .create(Journey {
                id: Uuid::new_v4(),
                name: "Tagged".to_string(),
                description: String::new(),
                status: JourneyStatus::Draft,
                entry_trigger: EntryTrigger::TagAdded { tag: None },
                allow_re_entry: true,
                steps: vec![Step {
                    step_number: 1,
                    delay_days: 0,
                    condition: StepCondition::Always,
                    action: StepAction::Wait,
                }],
                created_at: now,
                updated_at: now,
            })
            .unwrap();
        registry.activate(&id).unwrap();

        let manager = Arc::new(EnrollmentManager::new(
            registry,
            Arc::clone(&contacts),
            enrollments,
        ));
        (EventIngress::new(manager, max_depth), contacts)
    }

    #[test]
    fn events_within_depth_enroll() {
        let (ingress, contacts) = ingress_with_tag_journey(5);
        let contact = contacts
            .create("a@example.com", None, None, ContactSource::Form)
            .unwrap();

        let mut event = TriggerEvent::new(
            TriggerEventType::TagAdded { tag: "vip".into() },
            contact.id,
            serde_json::json!({}),
        );
        event.chain_depth = 5;
        assert_eq!(ingress.ingest(&event).unwrap().len(), 1);
    }

    #[test]
    fn deep_chains_are_dropped() {
        let (ingress, contacts) = ingress_with_tag_journey(5);
        let contact = contacts
            .create("a@example.com", None, None, ContactSource::Form)
            .unwrap();

        let mut event = TriggerEvent::new(
            TriggerEventType::TagAdded { tag: "vip".into() },
            contact.id,
            serde_json::json!({}),
        );
        event.chain_depth = 6;
        assert!(ingress.ingest(&event).unwrap().is_empty());
    }
}
