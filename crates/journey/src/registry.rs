//! Journey registry — CRUD and the draft/active/paused/archived state
//! machine for journey definitions.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tracing::info;
use uuid::Uuid;

use mailwright_core::types::TriggerEventType;
use mailwright_core::{MailwrightError, MailwrightResult};

use crate::enrollment::EnrollmentStore;
use crate::types::{ExitReason, Journey, JourneyStatus, JourneySummary, Step};

pub struct JourneyRegistry {
    journeys: Arc<DashMap<Uuid, Journey>>,
    enrollments: Arc<EnrollmentStore>,
}

impl JourneyRegistry {
    pub fn new(enrollments: Arc<EnrollmentStore>) -> Self {
        Self {
            journeys: Arc::new(DashMap::new()),
            enrollments,
        }
    }

    /// Stores a journey as a draft after validating its step sequence.
    pub fn create(&self, mut journey: Journey) -> MailwrightResult<Uuid> {
        if journey.name.trim().is_empty() {
            return Err(MailwrightError::Validation(
                "journey name must not be empty".to_string(),
            ));
        }
        validate_steps(&journey.steps)?;
        journey.status = JourneyStatus::Draft;
        let id = journey.id;
        info!(journey_id = %id, name = %journey.name, "Journey created");
        self.journeys.insert(id, journey);
        Ok(id)
    }

    pub fn get(&self, id: &Uuid) -> Option<Journey> {
        self.journeys.get(id).map(|j| j.clone())
    }

    pub fn list(&self) -> Vec<Journey> {
        self.journeys.iter().map(|j| j.clone()).collect()
    }

    /// Admin listing: journeys with step counts and live enrollment counts.
    pub fn list_summaries(&self) -> Vec<JourneySummary> {
        self.journeys
            .iter()
            .map(|j| JourneySummary {
                id: j.id,
                name: j.name.clone(),
                status: j.status,
                entry_trigger: j.entry_trigger.clone(),
                step_count: j.steps.len(),
                active_enrollments: self.enrollments.active_count(&j.id),
            })
            .collect()
    }

    /// Active journeys whose entry trigger matches the event.
    pub fn active_matching(&self, event_type: &TriggerEventType) -> Vec<Journey> {
        self.journeys
            .iter()
            .filter(|j| j.status == JourneyStatus::Active && j.entry_trigger.matches(event_type))
            .map(|j| j.clone())
            .collect()
    }

    pub fn activate(&self, id: &Uuid) -> MailwrightResult<()> {
        self.transition(id, JourneyStatus::Active)
    }

    pub fn pause(&self, id: &Uuid) -> MailwrightResult<()> {
        self.transition(id, JourneyStatus::Paused)
    }

    pub fn resume(&self, id: &Uuid) -> MailwrightResult<()> {
        self.transition(id, JourneyStatus::Active)
    }

    /// Terminal. Cancels every active enrollment; the scheduler also checks
    /// journey status at claim time, so in-flight ticks stop too.
    pub fn archive(&self, id: &Uuid) -> MailwrightResult<usize> {
        self.transition(id, JourneyStatus::Archived)?;
        let cancelled = self
            .enrollments
            .exit_all_for_journey(id, ExitReason::JourneyArchived);
        info!(journey_id = %id, cancelled, "Journey archived");
        Ok(cancelled)
    }

    /// Replaces the step list. Steps a live enrollment has already executed
    /// are immutable — edits must not retroactively replay.
    pub fn update_steps(&self, id: &Uuid, steps: Vec<Step>) -> MailwrightResult<()> {
        validate_steps(&steps)?;
        let mut entry = self
            .journeys
            .get_mut(id)
            .ok_or_else(|| MailwrightError::NotFound(format!("journey {}", id)))?;

        let frozen_through = self.enrollments.max_executed_step(id);
        for old in entry.steps.iter().filter(|s| s.step_number <= frozen_through) {
            match steps.iter().find(|s| s.step_number == old.step_number) {
                Some(new) if new == old => {}
                _ => {
                    return Err(MailwrightError::Validation(format!(
                        "step {} has already executed for live enrollments and cannot change",
                        old.step_number
                    )));
                }
            }
        }

        entry.steps = steps;
        entry.updated_at = Utc::now();
        Ok(())
    }

    fn transition(&self, id: &Uuid, to: JourneyStatus) -> MailwrightResult<()> {
        let mut entry = self
            .journeys
            .get_mut(id)
            .ok_or_else(|| MailwrightError::NotFound(format!("journey {}", id)))?;
        if !entry.status.can_transition(to) {
            return Err(MailwrightError::InvalidTransition(format!(
                "journey {} cannot go from {:?} to {:?}",
                id, entry.status, to
            )));
        }
        info!(journey_id = %id, from = ?entry.status, to = ?to, "Journey status changed");
        entry.status = to;
        entry.updated_at = Utc::now();
        Ok(())
    }
}

/// Step numbers must be a dense 1..N sequence and the journey non-empty.
fn validate_steps(steps: &[Step]) -> MailwrightResult<()> {
    if steps.is_empty() {
        return Err(MailwrightError::Validation(
            "journey must have at least one step".to_string(),
        ));
    }
    for (index, step) in steps.iter().enumerate() {
        let expected = index as u32 + 1;
        if step.step_number != expected {
            return Err(MailwrightError::Validation(format!(
                "step numbers must be dense starting at 1; position {} has number {}",
                expected, step.step_number
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntryTrigger, StepAction, StepCondition};

    fn step(step_number: u32) -> Step {
        Step {
            step_number,
            delay_days: 0,
            condition: StepCondition::Always,
            action: StepAction::Wait,
        }
    }

    fn journey(steps: Vec<Step>) -> Journey {
        let now = Utc::now();
        Journey {
            id: Uuid::new_v4(),
            name: "Onboarding".to_string(),
            description: String::new(),
            status: JourneyStatus::Draft,
            entry_trigger: EntryTrigger::ContactCreated,
            allow_re_entry: false,
            steps,
            created_at: now,
            updated_at: now,
        }
    }

    fn registry() -> (JourneyRegistry, Arc<EnrollmentStore>) {
        let enrollments = Arc::new(EnrollmentStore::new());
        (JourneyRegistry::new(Arc::clone(&enrollments)), enrollments)
    }

    #[test]
    fn sparse_step_numbers_are_rejected() {
        let (registry, _) = registry();
        let err = registry
            .create(journey(vec![step(1), step(3)]))
            .unwrap_err();
        assert!(matches!(err, MailwrightError::Validation(_)));

        let err = registry.create(journey(vec![])).unwrap_err();
        assert!(matches!(err, MailwrightError::Validation(_)));
    }

    #[test]
    fn lifecycle_transitions_are_enforced() {
        let (registry, _) = registry();
        let id = registry.create(journey(vec![step(1)])).unwrap();

        // Draft cannot pause.
        assert!(registry.pause(&id).is_err());

        registry.activate(&id).unwrap();
        registry.pause(&id).unwrap();
        registry.resume(&id).unwrap();
        registry.archive(&id).unwrap();

        // Archived is terminal.
        assert!(registry.activate(&id).is_err());
        assert!(registry.archive(&id).is_err());
    }

    #[test]
    fn archive_cancels_active_enrollments() {
        let (registry, enrollments) = registry();
        let id = registry.create(journey(vec![step(1)])).unwrap();
        registry.activate(&id).unwrap();

        let now = Utc::now();
        enrollments.insert(crate::types::Enrollment {
            id: Uuid::new_v4(),
            journey_id: id,
            contact_id: Uuid::new_v4(),
            status: crate::types::EnrollmentStatus::Active,
            current_step: 0,
            enrolled_at: now,
            next_step_due_at: Some(now),
            claimed_at: None,
            attempts: 0,
            trigger_depth: 0,
            exit_reason: None,
            updated_at: now,
        });

        let cancelled = registry.archive(&id).unwrap();
        assert_eq!(cancelled, 1);
        let all = enrollments.list_for_journey(&id);
        assert_eq!(all[0].status, crate::types::EnrollmentStatus::Exited);
        assert_eq!(all[0].exit_reason, Some(ExitReason::JourneyArchived));
    }

    #[test]
    fn executed_steps_are_immutable_under_live_enrollments() {
        let (registry, enrollments) = registry();
        let id = registry
            .create(journey(vec![step(1), step(2), step(3)]))
            .unwrap();
        registry.activate(&id).unwrap();

        let now = Utc::now();
        enrollments.insert(crate::types::Enrollment {
            id: Uuid::new_v4(),
            journey_id: id,
            contact_id: Uuid::new_v4(),
            status: crate::types::EnrollmentStatus::Active,
            current_step: 2,
            enrolled_at: now,
            next_step_due_at: Some(now),
            claimed_at: None,
            attempts: 0,
            trigger_depth: 0,
            exit_reason: None,
            updated_at: now,
        });

        // Changing step 2 (already executed) is refused.
        let mut changed = vec![step(1), step(2), step(3)];
        changed[1].delay_days = 7;
        assert!(registry.update_steps(&id, changed).is_err());

        // Changing step 3 (not yet executed) is fine.
        let mut tail_edit = vec![step(1), step(2), step(3)];
        tail_edit[2].condition = StepCondition::IfOpenedPrevious;
        registry.update_steps(&id, tail_edit).unwrap();
        assert_eq!(
            registry.get(&id).unwrap().steps[2].condition,
            StepCondition::IfOpenedPrevious
        );
    }
}
