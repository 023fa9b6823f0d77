//! Delivery pipeline — turns send actions into per-recipient delivery
//! records, calls the mailer capability with dedup/retry/throttle handling,
//! and processes provider callbacks for tracking: delivered, opened,
//! clicked, bounced, unsubscribed, complained.

pub mod content;
pub mod pipeline;
pub mod retry;
pub mod store;
pub mod throttle;
pub mod webhook;

pub use pipeline::{DeliveryPipeline, DispatchOutcome};
pub use store::{CampaignStore, DeliveryStore};
pub use throttle::SendThrottle;
pub use webhook::{EmailEventType, EmailWebhookEvent, EnrollmentHalt, WebhookProcessor};
