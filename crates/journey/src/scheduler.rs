//! Step scheduler — the clock-driven loop that claims due enrollments,
//! evaluates step conditions against prior engagement, executes step
//! actions, and advances or exits each enrollment.
//!
//! Correctness does not depend on single-threaded execution: overlapping
//! `tick` invocations serialize on the per-enrollment claim, and everything
//! after a won claim runs independently per enrollment on the runtime,
//! bounded by a semaphore.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use mailwright_analytics::AnalyticsAggregator;
use mailwright_contacts::ContactStore;
use mailwright_core::config::SchedulerConfig;
use mailwright_core::event_bus::{make_event, EventSink, TriggerSink};
use mailwright_core::types::{
    Contact, DeliveryStatus, EventType, SendRef, TriggerEvent, TriggerEventType,
};
use mailwright_delivery::retry::backoff_secs;
use mailwright_delivery::{DeliveryPipeline, DispatchOutcome};

use crate::enrollment::EnrollmentStore;
use crate::registry::JourneyRegistry;
use crate::types::{Enrollment, ExitReason, Journey, JourneyStatus, Step, StepAction, StepCondition};

/// What happened to one claimed enrollment during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A step executed and a later step was scheduled.
    Executed,
    /// The journey finished for this contact.
    Completed,
    /// The enrollment exited; the reason is recorded on it.
    Exited(ExitReason),
    /// A transient send failure was re-scheduled with backoff.
    Retried,
    /// The claim was released without executing (journey paused).
    Released,
}

/// Aggregate result of one `tick` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub claimed: usize,
    /// Enrollments that were due but claimed by a concurrent tick — a
    /// normal "someone else is handling this" signal, not an error.
    pub lost_claims: usize,
    pub executed: usize,
    pub completed: usize,
    pub exited: usize,
    pub retried: usize,
    pub released: usize,
}

impl TickSummary {
    fn record(&mut self, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Executed => self.executed += 1,
            StepOutcome::Completed => self.completed += 1,
            StepOutcome::Exited(_) => self.exited += 1,
            StepOutcome::Retried => self.retried += 1,
            StepOutcome::Released => self.released += 1,
        }
    }
}

#[derive(Clone)]
pub struct StepScheduler {
    registry: Arc<JourneyRegistry>,
    contacts: Arc<ContactStore>,
    enrollments: Arc<EnrollmentStore>,
    pipeline: Arc<DeliveryPipeline>,
    analytics: Arc<AnalyticsAggregator>,
    triggers: Arc<dyn TriggerSink>,
    event_sink: Arc<dyn EventSink>,
    semaphore: Arc<Semaphore>,
    config: SchedulerConfig,
}

impl StepScheduler {
    pub fn new(
        registry: Arc<JourneyRegistry>,
        contacts: Arc<ContactStore>,
        enrollments: Arc<EnrollmentStore>,
        pipeline: Arc<DeliveryPipeline>,
        analytics: Arc<AnalyticsAggregator>,
        config: SchedulerConfig,
    ) -> Self {
        info!(
            max_concurrent = config.max_concurrent,
            max_attempts = config.max_attempts,
            "Step scheduler initialized"
        );
        Self {
            registry,
            contacts,
            enrollments,
            pipeline,
            analytics,
            triggers: mailwright_core::event_bus::noop_trigger_sink(),
            event_sink: mailwright_core::event_bus::noop_sink(),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
        }
    }

    /// Attach a trigger sink so tag actions can enroll into other journeys.
    pub fn with_trigger_sink(mut self, triggers: Arc<dyn TriggerSink>) -> Self {
        self.triggers = triggers;
        self
    }

    /// Attach an event sink for emitting analytics events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// One scheduler pass at `now`: claim every due enrollment and process
    /// the claims concurrently. Safe to call from overlapping drivers.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickSummary {
        let due = self.enrollments.due(now);
        let mut summary = TickSummary::default();
        let mut handles = Vec::new();

        for enrollment_id in due {
            if !self.enrollments.try_claim(&enrollment_id, now) {
                summary.lost_claims += 1;
                continue;
            }
            summary.claimed += 1;

            let scheduler = self.clone();
            let permit = Arc::clone(&self.semaphore)
                .acquire_owned()
                .await
                .expect("scheduler semaphore closed");
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                scheduler.process_claimed(enrollment_id, now).await
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(outcome) => summary.record(outcome),
                Err(e) => error!(error = %e, "Enrollment worker panicked"),
            }
        }

        if summary.claimed > 0 {
            debug!(?summary, "Tick finished");
        }
        metrics::counter!("scheduler.ticks").increment(1);
        summary
    }

    /// Processes one enrollment this scheduler already claimed.
    async fn process_claimed(&self, enrollment_id: Uuid, now: DateTime<Utc>) -> StepOutcome {
        let Some(enrollment) = self.enrollments.get(&enrollment_id) else {
            return StepOutcome::Released;
        };

        // Claim-time re-checks: archival and unsubscribes must stop
        // enrollments even when they happened after the enrollment was due.
        let Some(journey) = self.registry.get(&enrollment.journey_id) else {
            return self.exit(&enrollment, ExitReason::JourneyArchived, now);
        };
        match journey.status {
            JourneyStatus::Archived => {
                return self.exit(&enrollment, ExitReason::JourneyArchived, now);
            }
            JourneyStatus::Paused | JourneyStatus::Draft => {
                self.enrollments.release_claim(&enrollment_id);
                return StepOutcome::Released;
            }
            JourneyStatus::Active => {}
        }

        let Some(contact) = self.contacts.get(&enrollment.contact_id) else {
            return self.exit(&enrollment, ExitReason::ContactRemoved, now);
        };
        if !contact.is_subscribed() {
            return self.exit(&enrollment, ExitReason::Unsubscribed, now);
        }

        let next_number = enrollment.current_step + 1;
        let Some(step) = journey.steps.iter().find(|s| s.step_number == next_number) else {
            return self.complete(&enrollment, enrollment.current_step, now);
        };

        if !self.condition_holds(&journey, &enrollment, step.condition) {
            debug!(
                enrollment_id = %enrollment.id,
                step = step.step_number,
                condition = ?step.condition,
                "Step condition failed"
            );
            return self.exit(&enrollment, ExitReason::ConditionNotMet, now);
        }

        match self.execute_action(&journey, step, &enrollment, &contact, now).await {
            ActionResult::Done => {}
            ActionResult::Retry => return StepOutcome::Retried,
            ActionResult::Exit(reason) => return self.exit(&enrollment, reason, now),
        }

        // Durably record the executed step, then schedule the next one.
        let next_step = journey.steps.iter().find(|s| s.step_number == next_number + 1);
        match next_step {
            Some(next) => {
                let due = now + Duration::days(i64::from(next.delay_days));
                if let Err(e) = self.enrollments.advance(&enrollment.id, next_number, Some(due), now)
                {
                    error!(enrollment_id = %enrollment.id, error = %e, "Advance failed");
                    return StepOutcome::Released;
                }
                metrics::counter!("scheduler.steps_executed").increment(1);
                self.event_sink.emit(make_event(
                    EventType::JourneyStepCompleted,
                    Some(enrollment.contact_id),
                    Some(journey.id),
                    None,
                    Some(enrollment.id),
                    Some(format!("step {}", next_number)),
                ));
                StepOutcome::Executed
            }
            None => self.complete(&enrollment, next_number, now),
        }
    }

    /// Evaluates a step condition against the previous step's delivery
    /// record. With no previous send there is nothing opened or clicked.
    fn condition_holds(
        &self,
        journey: &Journey,
        enrollment: &Enrollment,
        condition: StepCondition,
    ) -> bool {
        if condition == StepCondition::Always {
            return true;
        }
        let previous_ref = SendRef::JourneyStep {
            journey_id: journey.id,
            step_number: enrollment.current_step,
        };
        let reached = |status: DeliveryStatus| {
            enrollment.current_step > 0
                && self.analytics.has_contact_reached_status(
                    &enrollment.contact_id,
                    &previous_ref,
                    status,
                )
        };
        match condition {
            StepCondition::Always => true,
            StepCondition::IfOpenedPrevious => reached(DeliveryStatus::Opened),
            StepCondition::IfClickedPrevious => reached(DeliveryStatus::Clicked),
            StepCondition::IfNotOpenedPrevious => !reached(DeliveryStatus::Opened),
        }
    }

    async fn execute_action(
        &self,
        journey: &Journey,
        step: &Step,
        enrollment: &Enrollment,
        contact: &Contact,
        now: DateTime<Utc>,
    ) -> ActionResult {
        match &step.action {
            StepAction::Send { campaign_id } => {
                self.execute_send(journey, step, enrollment, contact, *campaign_id, now)
                    .await
            }
            StepAction::AddTag { tag } => {
                match self.contacts.add_tag(&contact.id, tag) {
                    Ok(true) => {
                        // The tag change is itself a trigger; carry the
                        // chain depth so loops stay bounded.
                        let event = TriggerEvent {
                            chain_depth: enrollment.trigger_depth + 1,
                            origin_journey: Some(journey.id),
                            ..TriggerEvent::new(
                                TriggerEventType::TagAdded { tag: tag.clone() },
                                contact.id,
                                serde_json::json!({ "journey_id": journey.id }),
                            )
                        };
                        self.triggers.push(event);
                        ActionResult::Done
                    }
                    Ok(false) => ActionResult::Done,
                    Err(e) => {
                        warn!(contact_id = %contact.id, error = %e, "Tag action failed");
                        ActionResult::Exit(ExitReason::ContactRemoved)
                    }
                }
            }
            StepAction::Wait => ActionResult::Done,
        }
    }

    async fn execute_send(
        &self,
        journey: &Journey,
        step: &Step,
        enrollment: &Enrollment,
        contact: &Contact,
        campaign_id: Uuid,
        now: DateTime<Utc>,
    ) -> ActionResult {
        let Some(campaign) = self.pipeline.campaigns().get(&campaign_id) else {
            warn!(
                journey_id = %journey.id,
                campaign_id = %campaign_id,
                "Step references a missing campaign"
            );
            return ActionResult::Exit(ExitReason::DeliveryFailed);
        };

        let send_ref = SendRef::JourneyStep {
            journey_id: journey.id,
            step_number: step.step_number,
        };
        let outcome = self
            .pipeline
            .dispatch(&campaign, contact.id, send_ref.clone(), Some(enrollment.id))
            .await;

        match outcome {
            Ok(DispatchOutcome::Sent) | Ok(DispatchOutcome::Duplicate) => ActionResult::Done,
            Ok(DispatchOutcome::Blocked) => ActionResult::Exit(ExitReason::Unsubscribed),
            Ok(DispatchOutcome::Failed { transient: true }) => {
                let attempts = enrollment.attempts + 1;
                if attempts >= self.config.max_attempts {
                    let key = send_ref.dedup_key(contact.id, Some(enrollment.id));
                    if let Err(e) = self
                        .pipeline
                        .records()
                        .fail_permanently(&key, "retry attempts exhausted")
                    {
                        warn!(key = %key, error = %e, "Could not finalize failed record");
                    }
                    return ActionResult::Exit(ExitReason::DeliveryFailed);
                }
                let delay = backoff_secs(self.config.retry_base_secs, attempts);
                let due = now + Duration::seconds(delay as i64);
                match self.enrollments.schedule_retry(&enrollment.id, due, now) {
                    Ok(booked) => {
                        debug!(
                            enrollment_id = %enrollment.id,
                            attempts = booked,
                            delay_secs = delay,
                            "Send re-scheduled"
                        );
                        ActionResult::Retry
                    }
                    Err(_) => ActionResult::Exit(ExitReason::DeliveryFailed),
                }
            }
            Ok(DispatchOutcome::Failed { transient: false }) => {
                ActionResult::Exit(ExitReason::DeliveryFailed)
            }
            Err(e) => {
                warn!(enrollment_id = %enrollment.id, error = %e, "Dispatch errored");
                ActionResult::Exit(ExitReason::DeliveryFailed)
            }
        }
    }

    fn complete(
        &self,
        enrollment: &Enrollment,
        executed_step: u32,
        now: DateTime<Utc>,
    ) -> StepOutcome {
        if let Err(e) = self
            .enrollments
            .advance(&enrollment.id, executed_step, None, now)
        {
            error!(enrollment_id = %enrollment.id, error = %e, "Completion failed");
            return StepOutcome::Released;
        }
        info!(
            enrollment_id = %enrollment.id,
            journey_id = %enrollment.journey_id,
            "Journey completed"
        );
        metrics::counter!("scheduler.completions").increment(1);
        self.event_sink.emit(make_event(
            EventType::JourneyCompleted,
            Some(enrollment.contact_id),
            Some(enrollment.journey_id),
            None,
            Some(enrollment.id),
            None,
        ));
        StepOutcome::Completed
    }

    fn exit(&self, enrollment: &Enrollment, reason: ExitReason, now: DateTime<Utc>) -> StepOutcome {
        self.enrollments.exit(&enrollment.id, reason, now);
        info!(
            enrollment_id = %enrollment.id,
            journey_id = %enrollment.journey_id,
            reason = %reason,
            "Enrollment exited"
        );
        metrics::counter!("scheduler.exits", "reason" => format!("{:?}", reason)).increment(1);
        self.event_sink.emit(make_event(
            EventType::JourneyExited,
            Some(enrollment.contact_id),
            Some(enrollment.journey_id),
            None,
            Some(enrollment.id),
            Some(reason.to_string()),
        ));
        StepOutcome::Exited(reason)
    }
}

enum ActionResult {
    Done,
    Retry,
    Exit(ExitReason),
}
