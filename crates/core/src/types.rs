use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Contacts ───────────────────────────────────────────────────────────

/// A marketing contact. Email is unique case-insensitively across the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub status: SubscriptionStatus,
    pub tags: BTreeSet<String>,
    pub source: ContactSource,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every mutation; backs compare-and-swap updates.
    pub version: u64,
}

impl Contact {
    pub fn is_subscribed(&self) -> bool {
        self.status == SubscriptionStatus::Subscribed
    }
}

/// Subscription state. `Unsubscribed` and `Bounced` are terminal — a contact
/// never transitions back to `Subscribed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Subscribed,
    Unsubscribed,
    Bounced,
}

/// Where a contact record originated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactSource {
    Form,
    Import,
    Booking,
    Admin,
    Api,
}

// ─── Campaigns ──────────────────────────────────────────────────────────

/// Reusable email content. Sent once as a bulk action, or repeatedly as the
/// payload of journey steps — each step execution is its own send event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    pub subject: String,
    pub html_content: String,
    pub text_content: String,
    pub status: CampaignStatus,
    /// Bulk sends target subscribed contacts carrying at least one of these
    /// tags; empty means all subscribed contacts.
    pub tags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// Bulk-send lifecycle of a campaign. Journey-step sends do not touch this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Sending,
    Sent,
}

// ─── Trigger events ─────────────────────────────────────────────────────

/// A normalized domain event pushed in by collaborators (CRUD layers,
/// booking system, delivery callbacks) that may enroll contacts in journeys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub id: Uuid,
    pub event_type: TriggerEventType,
    pub contact_id: Uuid,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
    /// Number of tag-triggered enrollment hops this event has already
    /// caused. Events past the configured depth are dropped, not looped.
    #[serde(default)]
    pub chain_depth: u8,
    /// The journey whose step action raised this event, if any. Used to
    /// stop a journey's own tag action from re-enrolling into itself.
    #[serde(default)]
    pub origin_journey: Option<Uuid>,
}

impl TriggerEvent {
    pub fn new(event_type: TriggerEventType, contact_id: Uuid, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            contact_id,
            payload,
            occurred_at: Utc::now(),
            chain_depth: 0,
            origin_journey: None,
        }
    }

    /// Derives a follow-up event one hop deeper in the trigger chain.
    pub fn chained(
        &self,
        event_type: TriggerEventType,
        payload: serde_json::Value,
        origin_journey: Uuid,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            contact_id: self.contact_id,
            payload,
            occurred_at: Utc::now(),
            chain_depth: self.chain_depth + 1,
            origin_journey: Some(origin_journey),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum TriggerEventType {
    ContactCreated,
    TagAdded { tag: String },
    CampaignOpened { campaign_id: Uuid },
    CampaignClicked { campaign_id: Uuid },
    BookingCreated,
    BookingConfirmed,
    Custom { name: String },
}

// ─── Delivery records ───────────────────────────────────────────────────

/// What a delivery record belongs to: a bulk campaign send, or one journey
/// step execution for one enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SendRef {
    Campaign {
        campaign_id: Uuid,
    },
    JourneyStep {
        journey_id: Uuid,
        step_number: u32,
    },
}

impl SendRef {
    /// Stable identifier preventing duplicate execution of the same logical
    /// send for the same recipient.
    pub fn dedup_key(&self, contact_id: Uuid, enrollment_id: Option<Uuid>) -> String {
        match self {
            SendRef::Campaign { campaign_id } => {
                format!("campaign:{}:{}", campaign_id, contact_id)
            }
            SendRef::JourneyStep {
                journey_id,
                step_number,
            } => match enrollment_id {
                Some(eid) => format!("step:{}:{}:{}", journey_id, step_number, eid),
                None => format!("step:{}:{}:{}", journey_id, step_number, contact_id),
            },
        }
    }
}

/// Per-recipient delivery status. Transitions are strictly forward along
/// `rank`; terminal branches never regress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Queued,
    Sent,
    Delivered,
    Opened,
    Clicked,
    Bounced,
    Unsubscribed,
    Complained,
    Failed,
}

impl DeliveryStatus {
    /// Position along the engagement ladder. Terminal branches rank above
    /// everything they can be reached from.
    pub fn rank(&self) -> u8 {
        match self {
            DeliveryStatus::Queued => 0,
            DeliveryStatus::Sent => 1,
            DeliveryStatus::Delivered => 2,
            DeliveryStatus::Opened => 3,
            DeliveryStatus::Clicked => 4,
            DeliveryStatus::Bounced => 5,
            DeliveryStatus::Failed => 5,
            DeliveryStatus::Unsubscribed => 6,
            DeliveryStatus::Complained => 6,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryStatus::Bounced
                | DeliveryStatus::Failed
                | DeliveryStatus::Unsubscribed
                | DeliveryStatus::Complained
        )
    }
}

/// One status transition on a delivery record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: DeliveryStatus,
    pub at: DateTime<Utc>,
}

/// Append-only per-recipient ledger entry. Analytics are computed from the
/// set of these; nothing else mutates them except forward transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: Uuid,
    pub send_ref: SendRef,
    pub contact_id: Uuid,
    /// The campaign whose content was sent. Step sends carry the step's
    /// campaign here so engagement callbacks can re-trigger journeys.
    pub campaign_id: Uuid,
    pub status: DeliveryStatus,
    pub provider_id: Option<String>,
    /// Mailer attempts made so far while still queued.
    pub attempts: u32,
    pub failure_reason: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub history: Vec<StatusChange>,
}

impl DeliveryRecord {
    pub fn new(
        send_ref: SendRef,
        contact_id: Uuid,
        campaign_id: Uuid,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            send_ref,
            contact_id,
            campaign_id,
            status: DeliveryStatus::Queued,
            provider_id: None,
            attempts: 0,
            failure_reason: None,
            queued_at: now,
            history: vec![StatusChange {
                status: DeliveryStatus::Queued,
                at: now,
            }],
        }
    }

    /// Whether this record has reached `status` or further along the
    /// engagement ladder. A clicked record counts as opened; terminal
    /// branches only count when they actually occurred.
    pub fn reached(&self, status: DeliveryStatus) -> bool {
        if status.is_terminal() {
            return self.history.iter().any(|c| c.status == status);
        }
        self.history
            .iter()
            .filter(|c| !c.status.is_terminal())
            .any(|c| c.status.rank() >= status.rank())
    }
}

// ─── Analytics events ───────────────────────────────────────────────────

/// Event logged to the analytics pipeline via the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub contact_id: Option<Uuid>,
    pub journey_id: Option<Uuid>,
    pub campaign_id: Option<Uuid>,
    pub enrollment_id: Option<Uuid>,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Journey events
    JourneyEntered,
    JourneyStepCompleted,
    JourneyCompleted,
    JourneyExited,
    // Delivery events
    DeliverySent,
    DeliveryDelivered,
    DeliveryFailed,
    DeliveryOpened,
    DeliveryClicked,
    // Contact events
    ContactUnsubscribed,
    ContactBounced,
    // Campaign events
    CampaignSendStarted,
    CampaignSendCompleted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_status_never_regresses_along_rank() {
        assert!(DeliveryStatus::Sent.rank() > DeliveryStatus::Queued.rank());
        assert!(DeliveryStatus::Opened.rank() > DeliveryStatus::Delivered.rank());
        assert!(DeliveryStatus::Clicked.rank() > DeliveryStatus::Opened.rank());
        assert!(DeliveryStatus::Bounced.rank() > DeliveryStatus::Sent.rank());
        assert!(DeliveryStatus::Complained.rank() > DeliveryStatus::Clicked.rank());
    }

    #[test]
    fn dedup_key_is_stable_per_enrollment_step() {
        let journey_id = Uuid::new_v4();
        let contact_id = Uuid::new_v4();
        let enrollment_id = Uuid::new_v4();
        let send_ref = SendRef::JourneyStep {
            journey_id,
            step_number: 2,
        };

        let a = send_ref.dedup_key(contact_id, Some(enrollment_id));
        let b = send_ref.dedup_key(contact_id, Some(enrollment_id));
        assert_eq!(a, b);

        let other = SendRef::JourneyStep {
            journey_id,
            step_number: 3,
        };
        assert_ne!(a, other.dedup_key(contact_id, Some(enrollment_id)));
    }

    #[test]
    fn chained_event_increments_depth() {
        let contact_id = Uuid::new_v4();
        let journey_id = Uuid::new_v4();
        let event = TriggerEvent::new(
            TriggerEventType::ContactCreated,
            contact_id,
            serde_json::json!({}),
        );
        let next = event.chained(
            TriggerEventType::TagAdded {
                tag: "vip".to_string(),
            },
            serde_json::json!({}),
            journey_id,
        );
        assert_eq!(next.chain_depth, 1);
        assert_eq!(next.origin_journey, Some(journey_id));
        assert_eq!(next.contact_id, contact_id);
    }
}
