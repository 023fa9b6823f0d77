use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use mailwright_core::types::{DeliveryStatus, SendRef};
use mailwright_delivery::DeliveryStore;

/// Per-send-reference statistics. Counts are unique contacts reaching at
/// least the given status — a contact opening twice counts once. Rates are
/// percentages of `total`, zero when `total` is zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CampaignAnalytics {
    pub total: u64,
    pub delivered: u64,
    pub opened: u64,
    pub clicked: u64,
    pub bounced: u64,
    pub unsubscribed: u64,
    pub spam: u64,
    pub failed: u64,
    pub delivery_rate: f64,
    pub open_rate: f64,
    pub click_rate: f64,
}

/// Computes analytics over the delivery ledger. Shared with the step
/// scheduler, whose engagement conditions read the same view.
pub struct AnalyticsAggregator {
    records: Arc<DeliveryStore>,
}

impl AnalyticsAggregator {
    pub fn new(records: Arc<DeliveryStore>) -> Self {
        Self { records }
    }

    /// Aggregates all delivery records for one send reference — a bulk
    /// campaign or one journey step.
    pub fn campaign_analytics(&self, send_ref: &SendRef) -> CampaignAnalytics {
        let records = self.records.for_ref(send_ref);

        let mut delivered: HashSet<Uuid> = HashSet::new();
        let mut opened: HashSet<Uuid> = HashSet::new();
        let mut clicked: HashSet<Uuid> = HashSet::new();
        let mut bounced: HashSet<Uuid> = HashSet::new();
        let mut unsubscribed: HashSet<Uuid> = HashSet::new();
        let mut spam: HashSet<Uuid> = HashSet::new();
        let mut failed: HashSet<Uuid> = HashSet::new();

        for record in &records {
            let contact = record.contact_id;
            if record.reached(DeliveryStatus::Delivered) {
                delivered.insert(contact);
            }
            if record.reached(DeliveryStatus::Opened) {
                opened.insert(contact);
            }
            if record.reached(DeliveryStatus::Clicked) {
                clicked.insert(contact);
            }
            if record.reached(DeliveryStatus::Bounced) {
                bounced.insert(contact);
            }
            if record.reached(DeliveryStatus::Unsubscribed) {
                unsubscribed.insert(contact);
            }
            if record.reached(DeliveryStatus::Complained) {
                spam.insert(contact);
            }
            if record.reached(DeliveryStatus::Failed) {
                failed.insert(contact);
            }
        }

        let total = records.len() as u64;
        CampaignAnalytics {
            total,
            delivered: delivered.len() as u64,
            opened: opened.len() as u64,
            clicked: clicked.len() as u64,
            bounced: bounced.len() as u64,
            unsubscribed: unsubscribed.len() as u64,
            spam: spam.len() as u64,
            failed: failed.len() as u64,
            delivery_rate: rate(delivered.len() as u64, total),
            open_rate: rate(opened.len() as u64, total),
            click_rate: rate(clicked.len() as u64, total),
        }
    }

    /// Narrow query used by step-condition evaluation: has this contact's
    /// delivery for the given reference reached at least `status`?
    pub fn has_contact_reached_status(
        &self,
        contact_id: &Uuid,
        send_ref: &SendRef,
        status: DeliveryStatus,
    ) -> bool {
        self.records
            .for_ref(send_ref)
            .iter()
            .filter(|r| &r.contact_id == contact_id)
            .any(|r| r.reached(status))
    }

    /// Analytics per journey step, keyed by step number.
    pub fn journey_step_analytics(
        &self,
        journey_id: &Uuid,
        step_numbers: impl IntoIterator<Item = u32>,
    ) -> Vec<(u32, CampaignAnalytics)> {
        step_numbers
            .into_iter()
            .map(|step_number| {
                let send_ref = SendRef::JourneyStep {
                    journey_id: *journey_id,
                    step_number,
                };
                (step_number, self.campaign_analytics(&send_ref))
            })
            .collect()
    }
}

/// count / total as a percentage; 0 when total is 0.
fn rate(count: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mailwright_core::types::DeliveryRecord;

    fn seed(
        store: &DeliveryStore,
        send_ref: &SendRef,
        statuses: &[DeliveryStatus],
    ) -> Vec<Uuid> {
        let mut contacts = Vec::new();
        for status_path in statuses {
            let contact_id = Uuid::new_v4();
            let key = send_ref.dedup_key(contact_id, None);
            let record = DeliveryRecord::new(send_ref.clone(), contact_id, Uuid::new_v4(), Utc::now());
            store.insert_new(&key, record);
            store.mark_sent(&key, &format!("prov-{}", contact_id), Utc::now()).unwrap();
            // Walk the record up to its target status.
            for status in [
                DeliveryStatus::Delivered,
                DeliveryStatus::Opened,
                DeliveryStatus::Clicked,
            ] {
                if status.rank() <= status_path.rank() && !status_path.is_terminal() {
                    store.transition(&key, status, Utc::now()).unwrap();
                }
            }
            if status_path.is_terminal() {
                store.transition(&key, *status_path, Utc::now()).unwrap();
            }
            contacts.push(contact_id);
        }
        contacts
    }

    #[test]
    fn counts_and_rates_match_the_ledger() {
        let store = Arc::new(DeliveryStore::new());
        let send_ref = SendRef::Campaign {
            campaign_id: Uuid::new_v4(),
        };

        // 10 recipients: 4 bounce, 6 deliver of which 3 open, 1 clicks.
        let mut statuses = vec![DeliveryStatus::Bounced; 4];
        statuses.extend(vec![DeliveryStatus::Delivered; 3]);
        statuses.extend(vec![DeliveryStatus::Opened; 2]);
        statuses.push(DeliveryStatus::Clicked);
        seed(&store, &send_ref, &statuses);

        let aggregator = AnalyticsAggregator::new(store);
        let analytics = aggregator.campaign_analytics(&send_ref);

        assert_eq!(analytics.total, 10);
        assert_eq!(analytics.delivered, 6);
        assert_eq!(analytics.opened, 3);
        assert_eq!(analytics.clicked, 1);
        assert_eq!(analytics.bounced, 4);
        assert!((analytics.delivery_rate - 60.0).abs() < f64::EPSILON);
        assert!((analytics.open_rate - 30.0).abs() < f64::EPSILON);
        assert!((analytics.click_rate - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_ledger_yields_zero_rates() {
        let aggregator = AnalyticsAggregator::new(Arc::new(DeliveryStore::new()));
        let analytics = aggregator.campaign_analytics(&SendRef::Campaign {
            campaign_id: Uuid::new_v4(),
        });
        assert_eq!(analytics.total, 0);
        assert_eq!(analytics.delivery_rate, 0.0);
        assert_eq!(analytics.open_rate, 0.0);
        assert_eq!(analytics.click_rate, 0.0);
    }

    #[test]
    fn clicked_counts_as_opened_for_conditions() {
        let store = Arc::new(DeliveryStore::new());
        let send_ref = SendRef::JourneyStep {
            journey_id: Uuid::new_v4(),
            step_number: 1,
        };
        let contacts = seed(&store, &send_ref, &[DeliveryStatus::Clicked]);

        let aggregator = AnalyticsAggregator::new(store);
        assert!(aggregator.has_contact_reached_status(
            &contacts[0],
            &send_ref,
            DeliveryStatus::Opened
        ));
        assert!(!aggregator.has_contact_reached_status(
            &Uuid::new_v4(),
            &send_ref,
            DeliveryStatus::Opened
        ));
    }
}
