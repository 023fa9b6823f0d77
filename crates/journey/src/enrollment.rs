//! Enrollment store and manager. The store owns every enrollment record and
//! the conditional updates the scheduler relies on; the manager matches
//! trigger events against active journeys and applies the dedup rules.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use mailwright_contacts::ContactStore;
use mailwright_core::event_bus::{make_event, EventSink};
use mailwright_core::types::{EventType, TriggerEvent};
use mailwright_core::{MailwrightError, MailwrightResult};
use mailwright_delivery::EnrollmentHalt;

use crate::registry::JourneyRegistry;
use crate::types::{
    Enrollment, EnrollmentStatus, ExitReason, Journey, JourneyStats, JourneyStatus,
};

// ─── Store ──────────────────────────────────────────────────────────────

/// Concurrent enrollment store. All scheduler-visible mutations happen
/// under the entry lock, so a claim is a single conditional write.
#[derive(Clone, Default)]
pub struct EnrollmentStore {
    enrollments: Arc<DashMap<Uuid, Enrollment>>,
}

impl EnrollmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, enrollment: Enrollment) {
        self.enrollments.insert(enrollment.id, enrollment);
    }

    pub fn get(&self, id: &Uuid) -> Option<Enrollment> {
        self.enrollments.get(id).map(|e| e.clone())
    }

    pub fn list_for_journey(&self, journey_id: &Uuid) -> Vec<Enrollment> {
        self.enrollments
            .iter()
            .filter(|e| &e.journey_id == journey_id)
            .map(|e| e.clone())
            .collect()
    }

    pub fn list_for_contact(&self, contact_id: &Uuid) -> Vec<Enrollment> {
        self.enrollments
            .iter()
            .filter(|e| &e.contact_id == contact_id)
            .map(|e| e.clone())
            .collect()
    }

    /// Whether an active enrollment exists for (journey, contact) — the
    /// no-double-enrollment invariant.
    pub fn active_exists(&self, journey_id: &Uuid, contact_id: &Uuid) -> bool {
        self.enrollments.iter().any(|e| {
            &e.journey_id == journey_id
                && &e.contact_id == contact_id
                && e.status == EnrollmentStatus::Active
        })
    }

    /// Whether any prior enrollment (in any status) exists for the pair.
    pub fn any_exists(&self, journey_id: &Uuid, contact_id: &Uuid) -> bool {
        self.enrollments
            .iter()
            .any(|e| &e.journey_id == journey_id && &e.contact_id == contact_id)
    }

    /// Ids of active enrollments due at `now` and not currently claimed.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        self.enrollments
            .iter()
            .filter(|e| {
                e.status == EnrollmentStatus::Active
                    && e.claimed_at.is_none()
                    && e.next_step_due_at.map_or(false, |due| due <= now)
            })
            .map(|e| e.id)
            .collect()
    }

    /// The atomic claim: one conditional write flips `claimed_at` if and
    /// only if the enrollment is still active, unclaimed, and due. A lost
    /// claim returns `false` — some other tick owns the enrollment.
    pub fn try_claim(&self, id: &Uuid, now: DateTime<Utc>) -> bool {
        let Some(mut entry) = self.enrollments.get_mut(id) else {
            return false;
        };
        let due = entry.next_step_due_at.map_or(false, |d| d <= now);
        if entry.status != EnrollmentStatus::Active || entry.claimed_at.is_some() || !due {
            return false;
        }
        entry.claimed_at = Some(now);
        entry.updated_at = now;
        true
    }

    /// Releases a claim without executing (journey paused, for example).
    pub fn release_claim(&self, id: &Uuid) {
        if let Some(mut entry) = self.enrollments.get_mut(id) {
            entry.claimed_at = None;
            entry.updated_at = Utc::now();
        }
    }

    /// Records successful execution of `step` and schedules the next one,
    /// or completes the enrollment when no step follows.
    pub fn advance(
        &self,
        id: &Uuid,
        executed_step: u32,
        next_due: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> MailwrightResult<()> {
        let mut entry = self
            .enrollments
            .get_mut(id)
            .ok_or_else(|| MailwrightError::NotFound(format!("enrollment {}", id)))?;
        entry.current_step = executed_step;
        entry.attempts = 0;
        entry.claimed_at = None;
        entry.updated_at = now;
        match next_due {
            Some(due) => entry.next_step_due_at = Some(due),
            None => {
                entry.status = EnrollmentStatus::Completed;
                entry.next_step_due_at = None;
            }
        }
        Ok(())
    }

    /// Books a failed attempt and re-schedules the same step.
    pub fn schedule_retry(
        &self,
        id: &Uuid,
        due: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> MailwrightResult<u32> {
        let mut entry = self
            .enrollments
            .get_mut(id)
            .ok_or_else(|| MailwrightError::NotFound(format!("enrollment {}", id)))?;
        entry.attempts += 1;
        entry.claimed_at = None;
        entry.next_step_due_at = Some(due);
        entry.updated_at = now;
        Ok(entry.attempts)
    }

    /// Terminal exit with a recorded reason.
    pub fn exit(&self, id: &Uuid, reason: ExitReason, now: DateTime<Utc>) {
        if let Some(mut entry) = self.enrollments.get_mut(id) {
            if entry.status == EnrollmentStatus::Active {
                entry.status = EnrollmentStatus::Exited;
                entry.exit_reason = Some(reason);
                entry.next_step_due_at = None;
                entry.claimed_at = None;
                entry.updated_at = now;
            }
        }
    }

    /// Exits every active enrollment of a journey (archival).
    pub fn exit_all_for_journey(&self, journey_id: &Uuid, reason: ExitReason) -> usize {
        let ids: Vec<Uuid> = self
            .enrollments
            .iter()
            .filter(|e| &e.journey_id == journey_id && e.status == EnrollmentStatus::Active)
            .map(|e| e.id)
            .collect();
        let now = Utc::now();
        for id in &ids {
            self.exit(id, reason, now);
        }
        ids.len()
    }

    /// Exits every active enrollment of a contact, across all journeys.
    pub fn exit_all_for_contact(&self, contact_id: &Uuid, reason: ExitReason) -> usize {
        let ids: Vec<Uuid> = self
            .enrollments
            .iter()
            .filter(|e| &e.contact_id == contact_id && e.status == EnrollmentStatus::Active)
            .map(|e| e.id)
            .collect();
        let now = Utc::now();
        for id in &ids {
            self.exit(id, reason, now);
        }
        ids.len()
    }

    /// Highest step number any active enrollment of the journey has
    /// executed. Steps at or below this are immutable.
    pub fn max_executed_step(&self, journey_id: &Uuid) -> u32 {
        self.enrollments
            .iter()
            .filter(|e| &e.journey_id == journey_id && e.status == EnrollmentStatus::Active)
            .map(|e| e.current_step)
            .max()
            .unwrap_or(0)
    }

    pub fn stats_for_journey(&self, journey_id: &Uuid) -> JourneyStats {
        let mut stats = JourneyStats {
            journey_id: *journey_id,
            ..Default::default()
        };
        for entry in self.enrollments.iter() {
            if &entry.journey_id != journey_id {
                continue;
            }
            stats.total_entered += 1;
            match entry.status {
                EnrollmentStatus::Active => stats.active += 1,
                EnrollmentStatus::Completed => stats.completed += 1,
                EnrollmentStatus::Exited => stats.exited += 1,
            }
        }
        stats
    }

    pub fn active_count(&self, journey_id: &Uuid) -> u64 {
        self.enrollments
            .iter()
            .filter(|e| &e.journey_id == journey_id && e.status == EnrollmentStatus::Active)
            .count() as u64
    }
}

/// Unsubscribe callbacks from the delivery layer halt the contact's
/// journeys immediately.
impl EnrollmentHalt for EnrollmentStore {
    fn contact_unsubscribed(&self, contact_id: Uuid) {
        let exited = self.exit_all_for_contact(&contact_id, ExitReason::Unsubscribed);
        if exited > 0 {
            info!(contact_id = %contact_id, exited, "Unsubscribe halted enrollments");
        }
    }
}

// ─── Manager ────────────────────────────────────────────────────────────

/// Matches trigger events against active journeys and creates enrollments.
/// Execution is deferred to the scheduler — creation is one cheap insert.
pub struct EnrollmentManager {
    registry: Arc<JourneyRegistry>,
    contacts: Arc<ContactStore>,
    enrollments: Arc<EnrollmentStore>,
    event_sink: Arc<dyn EventSink>,
}

impl EnrollmentManager {
    pub fn new(
        registry: Arc<JourneyRegistry>,
        contacts: Arc<ContactStore>,
        enrollments: Arc<EnrollmentStore>,
    ) -> Self {
        Self {
            registry,
            contacts,
            enrollments,
            event_sink: mailwright_core::event_bus::noop_sink(),
        }
    }

    /// Attach an event sink for emitting analytics events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn enrollments(&self) -> Arc<EnrollmentStore> {
        Arc::clone(&self.enrollments)
    }

    /// Enrolls the event's contact into every active journey whose entry
    /// trigger matches. Returns the ids of the enrollments created.
    pub fn handle_event(
        &self,
        event: &TriggerEvent,
        now: DateTime<Utc>,
    ) -> MailwrightResult<Vec<Uuid>> {
        let Some(contact) = self.contacts.get(&event.contact_id) else {
            warn!(contact_id = %event.contact_id, "Trigger event for unknown contact, skipping");
            return Ok(Vec::new());
        };
        if !contact.is_subscribed() {
            debug!(contact_id = %contact.id, "Contact not subscribed, no enrollment");
            return Ok(Vec::new());
        }

        let mut created = Vec::new();
        for journey in self.registry.active_matching(&event.event_type) {
            // A journey's own tag action must not re-enroll into itself.
            if event.origin_journey == Some(journey.id) {
                debug!(journey_id = %journey.id, "Skipping self-triggered journey");
                continue;
            }
            match self.try_enroll(&journey, event.contact_id, event.chain_depth, now) {
                Ok(Some(id)) => created.push(id),
                Ok(None) => {}
                Err(e) => warn!(journey_id = %journey.id, error = %e, "Enrollment failed"),
            }
        }
        Ok(created)
    }

    /// Manual admin enrollment. Bypasses trigger matching; the same dedup
    /// rule applies, but here a duplicate is a visible conflict.
    pub fn enroll(
        &self,
        journey_id: &Uuid,
        contact_id: &Uuid,
        now: DateTime<Utc>,
    ) -> MailwrightResult<Uuid> {
        let journey = self
            .registry
            .get(journey_id)
            .ok_or_else(|| MailwrightError::NotFound(format!("journey {}", journey_id)))?;
        if journey.status != JourneyStatus::Active {
            return Err(MailwrightError::InvalidTransition(format!(
                "journey {} is {:?}, only active journeys accept enrollments",
                journey_id, journey.status
            )));
        }
        let contact = self
            .contacts
            .get(contact_id)
            .ok_or_else(|| MailwrightError::NotFound(format!("contact {}", contact_id)))?;
        if !contact.is_subscribed() {
            return Err(MailwrightError::Validation(format!(
                "contact {} is not subscribed",
                contact_id
            )));
        }

        match self.try_enroll(&journey, *contact_id, 0, now)? {
            Some(id) => Ok(id),
            None => Err(MailwrightError::Conflict(format!(
                "contact {} already enrolled in journey {}",
                contact_id, journey_id
            ))),
        }
    }

    /// Applies the dedup/re-entry rules and inserts the enrollment. `None`
    /// means the rules said no — not an error on the event path.
    fn try_enroll(
        &self,
        journey: &Journey,
        contact_id: Uuid,
        trigger_depth: u8,
        now: DateTime<Utc>,
    ) -> MailwrightResult<Option<Uuid>> {
        if self.enrollments.active_exists(&journey.id, &contact_id) {
            debug!(journey_id = %journey.id, contact_id = %contact_id, "Already enrolled");
            return Ok(None);
        }
        if !journey.allow_re_entry && self.enrollments.any_exists(&journey.id, &contact_id) {
            debug!(journey_id = %journey.id, contact_id = %contact_id, "Re-entry disabled");
            return Ok(None);
        }

        let first_step = journey.steps.first().ok_or_else(|| {
            MailwrightError::Validation(format!("journey {} has no steps", journey.id))
        })?;

        let id = Uuid::new_v4();
        let enrollment = Enrollment {
            id,
            journey_id: journey.id,
            contact_id,
            status: EnrollmentStatus::Active,
            current_step: 0,
            enrolled_at: now,
            // Step 1's delay is relative to enrollment time.
            next_step_due_at: Some(now + Duration::days(i64::from(first_step.delay_days))),
            claimed_at: None,
            attempts: 0,
            trigger_depth,
            exit_reason: None,
            updated_at: now,
        };

        info!(
            enrollment_id = %id,
            journey_id = %journey.id,
            contact_id = %contact_id,
            "Contact enrolled"
        );
        metrics::counter!("journey.enrollments").increment(1);
        self.event_sink.emit(make_event(
            EventType::JourneyEntered,
            Some(contact_id),
            Some(journey.id),
            None,
            Some(id),
            None,
        ));
        self.enrollments.insert(enrollment);
        Ok(Some(id))
    }
}
