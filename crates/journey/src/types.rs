use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use mailwright_core::types::TriggerEventType;

/// A journey definition describing a timed, multi-step contact
/// communication sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Journey {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub status: JourneyStatus,
    pub entry_trigger: EntryTrigger,
    /// Whether a contact whose prior enrollment completed or exited may be
    /// enrolled again.
    pub allow_re_entry: bool,
    /// Steps in execution order; step numbers are a dense 1..N sequence.
    pub steps: Vec<Step>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle status of a journey definition. `Archived` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JourneyStatus {
    Draft,
    Active,
    Paused,
    Archived,
}

impl JourneyStatus {
    /// The draft -> active <-> paused -> archived state machine. Archival
    /// is allowed from anywhere and never leaves.
    pub fn can_transition(&self, to: JourneyStatus) -> bool {
        use JourneyStatus::*;
        match (self, to) {
            (_, Archived) => *self != Archived,
            (Draft, Active) => true,
            (Active, Paused) => true,
            (Paused, Active) => true,
            _ => false,
        }
    }
}

/// What enrolls a contact into a journey. Variants with fields narrow the
/// match; `None` criteria match any event of that type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum EntryTrigger {
    /// Admin-invoked only; never matched against events.
    Manual,
    ContactCreated,
    TagAdded { tag: Option<String> },
    CampaignOpened { campaign_id: Option<Uuid> },
    CampaignClicked { campaign_id: Option<Uuid> },
    BookingCreated,
    BookingConfirmed,
    Custom { event_name: String },
}

impl EntryTrigger {
    /// Whether an incoming event satisfies this trigger and its criteria.
    pub fn matches(&self, event_type: &TriggerEventType) -> bool {
        match (self, event_type) {
            (EntryTrigger::Manual, _) => false,
            (EntryTrigger::ContactCreated, TriggerEventType::ContactCreated) => true,
            (EntryTrigger::TagAdded { tag }, TriggerEventType::TagAdded { tag: added }) => {
                tag.as_ref().map_or(true, |t| t == added)
            }
            (
                EntryTrigger::CampaignOpened { campaign_id },
                TriggerEventType::CampaignOpened { campaign_id: opened },
            ) => campaign_id.map_or(true, |c| c == *opened),
            (
                EntryTrigger::CampaignClicked { campaign_id },
                TriggerEventType::CampaignClicked { campaign_id: clicked },
            ) => campaign_id.map_or(true, |c| c == *clicked),
            (EntryTrigger::BookingCreated, TriggerEventType::BookingCreated) => true,
            (EntryTrigger::BookingConfirmed, TriggerEventType::BookingConfirmed) => true,
            (EntryTrigger::Custom { event_name }, TriggerEventType::Custom { name }) => {
                event_name == name
            }
            _ => false,
        }
    }
}

/// A single step within a journey.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// 1-based position; dense within the journey.
    pub step_number: u32,
    /// Days after enrollment (step 1) or after the previous step completed.
    pub delay_days: u32,
    pub condition: StepCondition,
    pub action: StepAction,
}

/// Predicate evaluated against the previous step's delivery record before
/// a step executes. A failed condition exits the enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepCondition {
    Always,
    IfOpenedPrevious,
    IfClickedPrevious,
    IfNotOpenedPrevious,
}

/// The work a step performs. Exhaustively matched by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StepAction {
    /// Send the campaign's content to the enrolled contact.
    Send { campaign_id: Uuid },
    /// Apply a tag to the contact; may trigger other journeys.
    AddTag { tag: String },
    /// No side effect; purely advances the schedule.
    Wait,
}

/// One contact's live progress through one journey.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: Uuid,
    pub journey_id: Uuid,
    pub contact_id: Uuid,
    pub status: EnrollmentStatus,
    /// Last executed step number; 0 means not yet started.
    pub current_step: u32,
    pub enrolled_at: DateTime<Utc>,
    /// When the next step becomes due. `None` once completed or exited.
    pub next_step_due_at: Option<DateTime<Utc>>,
    /// Set while a scheduler worker owns this enrollment. The conditional
    /// write that sets it is the serialization point preventing
    /// double-sends across overlapping ticks.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Failed send attempts for the step currently in flight.
    pub attempts: u32,
    /// Chain depth of the trigger event that created this enrollment.
    pub trigger_depth: u8,
    pub exit_reason: Option<ExitReason>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Completed,
    Exited,
}

/// Why an enrollment exited. Surfaced through the admin listing so there
/// is no silent failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    ConditionNotMet,
    Unsubscribed,
    JourneyArchived,
    DeliveryFailed,
    ContactRemoved,
    ManualExit,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            ExitReason::ConditionNotMet => "step condition not met",
            ExitReason::Unsubscribed => "contact unsubscribed",
            ExitReason::JourneyArchived => "journey archived",
            ExitReason::DeliveryFailed => "delivery failed after retries",
            ExitReason::ContactRemoved => "contact no longer exists",
            ExitReason::ManualExit => "removed by operator",
        };
        f.write_str(reason)
    }
}

/// Aggregate enrollment counts for a journey.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JourneyStats {
    pub journey_id: Uuid,
    pub total_entered: u64,
    pub active: u64,
    pub completed: u64,
    pub exited: u64,
}

/// Admin listing row: journey with step count and live enrollment count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneySummary {
    pub id: Uuid,
    pub name: String,
    pub status: JourneyStatus,
    pub entry_trigger: EntryTrigger,
    pub step_count: usize,
    pub active_enrollments: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_machine_permits_only_documented_transitions() {
        use JourneyStatus::*;
        assert!(Draft.can_transition(Active));
        assert!(Active.can_transition(Paused));
        assert!(Paused.can_transition(Active));
        assert!(Draft.can_transition(Archived));
        assert!(Active.can_transition(Archived));

        assert!(!Draft.can_transition(Paused));
        assert!(!Paused.can_transition(Draft));
        assert!(!Archived.can_transition(Active));
        assert!(!Archived.can_transition(Archived));
    }

    #[test]
    fn tag_trigger_criteria_narrow_the_match() {
        let any_tag = EntryTrigger::TagAdded { tag: None };
        let vip_only = EntryTrigger::TagAdded {
            tag: Some("vip".to_string()),
        };
        let event = TriggerEventType::TagAdded {
            tag: "vip".to_string(),
        };
        let other = TriggerEventType::TagAdded {
            tag: "newsletter".to_string(),
        };

        assert!(any_tag.matches(&event));
        assert!(any_tag.matches(&other));
        assert!(vip_only.matches(&event));
        assert!(!vip_only.matches(&other));
    }

    #[test]
    fn manual_trigger_never_matches_events() {
        assert!(!EntryTrigger::Manual.matches(&TriggerEventType::ContactCreated));
    }
}
