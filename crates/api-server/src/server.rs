//! HTTP server assembly: route table, trace layer, and the serve loop.

use axum::routing::{get, post, put};
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{rest, AppState};

/// Builds the full route table over the shared state.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(rest::health_check))
        .route("/v1/events", post(rest::ingest_event))
        .route("/v1/webhooks/email", post(rest::email_webhook))
        .route("/v1/journeys", get(rest::list_journeys).post(rest::create_journey))
        .route("/v1/journeys/:id/activate", post(rest::activate_journey))
        .route("/v1/journeys/:id/pause", post(rest::pause_journey))
        .route("/v1/journeys/:id/resume", post(rest::resume_journey))
        .route("/v1/journeys/:id/archive", post(rest::archive_journey))
        .route("/v1/journeys/:id/steps", put(rest::update_journey_steps))
        .route("/v1/journeys/:id/enrollments", get(rest::list_enrollments))
        .route("/v1/journeys/:id/stats", get(rest::journey_stats))
        .route("/v1/journeys/:id/enroll", post(rest::enroll_contact))
        .route("/v1/campaigns", get(rest::list_campaigns).post(rest::create_campaign))
        .route("/v1/campaigns/:id/send", post(rest::send_campaign))
        .route("/v1/campaigns/:id/analytics", get(rest::campaign_analytics))
        .route("/v1/contacts", get(rest::list_contacts).post(rest::create_contact))
        .route("/v1/contacts/:id/tags", post(rest::add_contact_tag))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds and serves until the process exits.
pub async fn run(state: AppState, host: &str, port: u16) -> anyhow::Result<()> {
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "HTTP API listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
