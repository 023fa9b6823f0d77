//! Delivery and engagement analytics computed on demand from the delivery
//! record ledger.

pub mod aggregator;

pub use aggregator::{AnalyticsAggregator, CampaignAnalytics};
