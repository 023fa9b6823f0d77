//! REST surface for the admin UI and collaborator event sources. Handlers
//! validate at the boundary and delegate to the engines; no business logic
//! lives here.

pub mod rest;
pub mod server;

use std::sync::Arc;
use std::time::Instant;

use mailwright_analytics::AnalyticsAggregator;
use mailwright_contacts::ContactStore;
use mailwright_delivery::{CampaignStore, DeliveryPipeline, WebhookProcessor};
use mailwright_journey::{EnrollmentManager, EnrollmentStore, EventIngress, JourneyRegistry};

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<JourneyRegistry>,
    pub contacts: Arc<ContactStore>,
    pub enrollments: Arc<EnrollmentStore>,
    pub campaigns: Arc<CampaignStore>,
    pub manager: Arc<EnrollmentManager>,
    pub ingress: Arc<EventIngress>,
    pub pipeline: Arc<DeliveryPipeline>,
    pub webhooks: Arc<WebhookProcessor>,
    pub analytics: Arc<AnalyticsAggregator>,
    pub node_id: String,
    pub start_time: Instant,
}
