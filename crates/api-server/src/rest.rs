//! REST API handlers for journeys, campaigns, contacts, event ingress, and
//! provider webhooks.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use mailwright_analytics::CampaignAnalytics;
use mailwright_core::types::{
    Campaign, CampaignStatus, Contact, ContactSource, SendRef, TriggerEvent, TriggerEventType,
};
use mailwright_core::MailwrightError;
use mailwright_delivery::pipeline::CampaignSendSummary;
use mailwright_delivery::EmailWebhookEvent;
use mailwright_journey::types::{
    Enrollment, EntryTrigger, Journey, JourneyStats, JourneyStatus, JourneySummary, Step,
};

use crate::AppState;

/// Maximum string field length (names, subjects, tags).
const MAX_FIELD_LEN: usize = 256;

type ApiResult<T> = Result<T, (StatusCode, Json<ErrorResponse>)>;

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

fn api_error(e: MailwrightError) -> (StatusCode, Json<ErrorResponse>) {
    let (status, error) = match &e {
        MailwrightError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_failed"),
        MailwrightError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        MailwrightError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
        MailwrightError::InvalidTransition(_) => (StatusCode::CONFLICT, "invalid_transition"),
        _ => {
            warn!(error = %e, "Internal error on API boundary");
            metrics::counter!("api.errors").increment(1);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "internal".to_string(),
                    message: "Internal processing error".to_string(),
                }),
            );
        }
    };
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            message: e.to_string(),
        }),
    )
}

fn bad_request(message: &str) -> (StatusCode, Json<ErrorResponse>) {
    metrics::counter!("api.validation_errors").increment(1);
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: "validation_failed".to_string(),
            message: message.to_string(),
        }),
    )
}

// ─── Health ─────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

// ─── Event ingress & webhooks ───────────────────────────────────────────

#[derive(Deserialize)]
pub struct IngestRequest {
    pub contact_id: Uuid,
    pub event_type: TriggerEventType,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Serialize)]
pub struct IngestResponse {
    pub enrollments: Vec<Uuid>,
}

/// POST /v1/events — collaborator event ingress.
pub async fn ingest_event(
    State(state): State<AppState>,
    Json(request): Json<IngestRequest>,
) -> ApiResult<Json<IngestResponse>> {
    let event = TriggerEvent::new(request.event_type, request.contact_id, request.payload);
    let enrollments = state.ingress.ingest(&event).map_err(api_error)?;
    Ok(Json(IngestResponse { enrollments }))
}

#[derive(Serialize)]
pub struct WebhookResponse {
    pub applied: bool,
}

/// POST /v1/webhooks/email — provider delivery callbacks.
pub async fn email_webhook(
    State(state): State<AppState>,
    Json(event): Json<EmailWebhookEvent>,
) -> ApiResult<Json<WebhookResponse>> {
    let applied = state.webhooks.process(&event).map_err(api_error)?;
    Ok(Json(WebhookResponse { applied }))
}

// ─── Journeys ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateJourneyRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub entry_trigger: EntryTrigger,
    #[serde(default)]
    pub allow_re_entry: bool,
    pub steps: Vec<Step>,
}

#[derive(Serialize)]
pub struct CreatedResponse {
    pub id: Uuid,
}

/// GET /v1/journeys — journeys with step counts and status.
pub async fn list_journeys(State(state): State<AppState>) -> Json<Vec<JourneySummary>> {
    Json(state.registry.list_summaries())
}

/// POST /v1/journeys
pub async fn create_journey(
    State(state): State<AppState>,
    Json(request): Json<CreateJourneyRequest>,
) -> ApiResult<(StatusCode, Json<CreatedResponse>)> {
    if request.name.len() > MAX_FIELD_LEN {
        return Err(bad_request("journey 'name' exceeds maximum length"));
    }
    let now = Utc::now();
    let journey = Journey {
        id: Uuid::new_v4(),
        name: request.name,
        description: request.description,
        status: JourneyStatus::Draft,
        entry_trigger: request.entry_trigger,
        allow_re_entry: request.allow_re_entry,
        steps: request.steps,
        created_at: now,
        updated_at: now,
    };
    let id = state.registry.create(journey).map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(CreatedResponse { id })))
}

/// POST /v1/journeys/:id/activate
pub async fn activate_journey(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.registry.activate(&id).map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/journeys/:id/pause
pub async fn pause_journey(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.registry.pause(&id).map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/journeys/:id/resume
pub async fn resume_journey(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.registry.resume(&id).map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
pub struct ArchiveResponse {
    pub cancelled_enrollments: usize,
}

/// POST /v1/journeys/:id/archive
pub async fn archive_journey(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ArchiveResponse>> {
    let cancelled_enrollments = state.registry.archive(&id).map_err(api_error)?;
    Ok(Json(ArchiveResponse {
        cancelled_enrollments,
    }))
}

/// PUT /v1/journeys/:id/steps
pub async fn update_journey_steps(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(steps): Json<Vec<Step>>,
) -> ApiResult<StatusCode> {
    state.registry.update_steps(&id, steps).map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /v1/journeys/:id/enrollments
pub async fn list_enrollments(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<Enrollment>>> {
    if state.registry.get(&id).is_none() {
        return Err(api_error(MailwrightError::NotFound(format!("journey {}", id))));
    }
    Ok(Json(state.enrollments.list_for_journey(&id)))
}

#[derive(Serialize)]
pub struct JourneyStatsResponse {
    pub stats: JourneyStats,
    pub steps: Vec<StepAnalytics>,
}

#[derive(Serialize)]
pub struct StepAnalytics {
    pub step_number: u32,
    pub analytics: CampaignAnalytics,
}

/// GET /v1/journeys/:id/stats
pub async fn journey_stats(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<JourneyStatsResponse>> {
    let journey = state
        .registry
        .get(&id)
        .ok_or_else(|| api_error(MailwrightError::NotFound(format!("journey {}", id))))?;

    let steps = state
        .analytics
        .journey_step_analytics(&id, journey.steps.iter().map(|s| s.step_number))
        .into_iter()
        .map(|(step_number, analytics)| StepAnalytics {
            step_number,
            analytics,
        })
        .collect();

    Ok(Json(JourneyStatsResponse {
        stats: state.enrollments.stats_for_journey(&id),
        steps,
    }))
}

#[derive(Deserialize)]
pub struct EnrollRequest {
    pub contact_id: Uuid,
}

/// POST /v1/journeys/:id/enroll — manual enrollment.
pub async fn enroll_contact(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<EnrollRequest>,
) -> ApiResult<(StatusCode, Json<CreatedResponse>)> {
    let enrollment_id = state
        .manager
        .enroll(&id, &request.contact_id, Utc::now())
        .map_err(api_error)?;
    Ok((
        StatusCode::CREATED,
        Json(CreatedResponse { id: enrollment_id }),
    ))
}

// ─── Campaigns ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateCampaignRequest {
    pub name: String,
    pub subject: String,
    pub html_content: String,
    #[serde(default)]
    pub text_content: String,
    #[serde(default)]
    pub tags: std::collections::BTreeSet<String>,
}

#[derive(Serialize)]
pub struct CampaignWithAnalytics {
    #[serde(flatten)]
    pub campaign: Campaign,
    pub analytics: CampaignAnalytics,
}

/// GET /v1/campaigns — campaigns with per-campaign analytics.
pub async fn list_campaigns(State(state): State<AppState>) -> Json<Vec<CampaignWithAnalytics>> {
    let campaigns = state
        .campaigns
        .list()
        .into_iter()
        .map(|campaign| {
            let analytics = state.analytics.campaign_analytics(&SendRef::Campaign {
                campaign_id: campaign.id,
            });
            CampaignWithAnalytics {
                campaign,
                analytics,
            }
        })
        .collect();
    Json(campaigns)
}

/// POST /v1/campaigns
pub async fn create_campaign(
    State(state): State<AppState>,
    Json(request): Json<CreateCampaignRequest>,
) -> ApiResult<(StatusCode, Json<CreatedResponse>)> {
    if request.name.len() > MAX_FIELD_LEN || request.subject.len() > MAX_FIELD_LEN {
        return Err(bad_request("campaign field exceeds maximum length"));
    }
    let now = Utc::now();
    let campaign = Campaign {
        id: Uuid::new_v4(),
        name: request.name,
        subject: request.subject,
        html_content: request.html_content,
        text_content: request.text_content,
        status: CampaignStatus::Draft,
        tags: request.tags,
        created_at: now,
        updated_at: now,
        sent_at: None,
    };
    let id = state.campaigns.create(campaign).map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(CreatedResponse { id })))
}

/// POST /v1/campaigns/:id/send — bulk send to the tag-matched segment.
pub async fn send_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CampaignSendSummary>> {
    let summary = state.pipeline.send_campaign(&id).await.map_err(api_error)?;
    Ok(Json(summary))
}

/// GET /v1/campaigns/:id/analytics
pub async fn campaign_analytics(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CampaignAnalytics>> {
    if state.campaigns.get(&id).is_none() {
        return Err(api_error(MailwrightError::NotFound(format!(
            "campaign {}",
            id
        ))));
    }
    Ok(Json(
        state
            .analytics
            .campaign_analytics(&SendRef::Campaign { campaign_id: id }),
    ))
}

// ─── Contacts ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateContactRequest {
    pub email: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

/// GET /v1/contacts
pub async fn list_contacts(State(state): State<AppState>) -> Json<Vec<Contact>> {
    Json(state.contacts.list())
}

/// POST /v1/contacts — creation raises a `ContactCreated` trigger event.
pub async fn create_contact(
    State(state): State<AppState>,
    Json(request): Json<CreateContactRequest>,
) -> ApiResult<(StatusCode, Json<Contact>)> {
    if request.email.len() > MAX_FIELD_LEN {
        return Err(bad_request("contact 'email' exceeds maximum length"));
    }
    let contact = state
        .contacts
        .create(
            &request.email,
            request.first_name,
            request.last_name,
            ContactSource::Admin,
        )
        .map_err(api_error)?;

    let event = TriggerEvent::new(
        TriggerEventType::ContactCreated,
        contact.id,
        serde_json::json!({ "email": contact.email }),
    );
    state.ingress.ingest(&event).map_err(api_error)?;

    Ok((StatusCode::CREATED, Json(contact)))
}

#[derive(Deserialize)]
pub struct AddTagRequest {
    pub tag: String,
}

/// POST /v1/contacts/:id/tags — tagging raises a `TagAdded` trigger event.
pub async fn add_contact_tag(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<AddTagRequest>,
) -> ApiResult<StatusCode> {
    if request.tag.len() > MAX_FIELD_LEN {
        return Err(bad_request("'tag' exceeds maximum length"));
    }
    let added = state.contacts.add_tag(&id, &request.tag).map_err(api_error)?;
    if added {
        let event = TriggerEvent::new(
            TriggerEventType::TagAdded { tag: request.tag },
            id,
            serde_json::json!({}),
        );
        state.ingress.ingest(&event).map_err(api_error)?;
    }
    Ok(StatusCode::NO_CONTENT)
}
