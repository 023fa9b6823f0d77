//! Mailwright — email marketing automation engine: trigger-driven journeys,
//! idempotent delivery, and engagement analytics.
//!
//! Main entry point that wires the stores and engines together, starts the
//! recurring scheduler tick, and serves the admin/ingress API.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use clap::Parser;
use tracing::{error, info};

use mailwright_analytics::AnalyticsAggregator;
use mailwright_api::AppState;
use mailwright_contacts::ContactStore;
use mailwright_core::config::AppConfig;
use mailwright_core::event_bus::TriggerSink;
use mailwright_core::mailer::{Mailer, MockMailer};
use mailwright_delivery::{
    CampaignStore, DeliveryPipeline, DeliveryStore, EnrollmentHalt, WebhookProcessor,
};
use mailwright_journey::{
    EnrollmentManager, EnrollmentStore, EventIngress, JourneyRegistry, StepScheduler,
};

#[derive(Parser, Debug)]
#[command(name = "mailwright")]
#[command(about = "Email marketing automation engine")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "MAILWRIGHT__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "MAILWRIGHT__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Seconds between scheduler ticks (overrides config)
    #[arg(long, env = "MAILWRIGHT__SCHEDULER__TICK_INTERVAL_SECS")]
    tick_interval: Option<u64>,

    /// Serve the API without the scheduler loop
    #[arg(long, default_value_t = false)]
    api_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mailwright=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Mailwright starting up");

    // Load configuration
    let mut config = AppConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(interval) = cli.tick_interval {
        config.scheduler.tick_interval_secs = interval;
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        tick_interval_secs = config.scheduler.tick_interval_secs,
        "Configuration loaded"
    );

    // Stores
    let contacts = Arc::new(ContactStore::new());
    let enrollments = Arc::new(EnrollmentStore::new());
    let records = Arc::new(DeliveryStore::new());
    let campaigns = Arc::new(CampaignStore::new());
    let registry = Arc::new(JourneyRegistry::new(Arc::clone(&enrollments)));

    // The mailer capability. Swap in a real provider adapter in production;
    // the mock accepts everything and logs.
    let mailer: Arc<dyn Mailer> = Arc::new(MockMailer::new());

    // Engines
    let pipeline = Arc::new(DeliveryPipeline::new(
        Arc::clone(&records),
        Arc::clone(&campaigns),
        Arc::clone(&contacts),
        mailer,
        config.delivery.clone(),
    ));
    let analytics = Arc::new(AnalyticsAggregator::new(Arc::clone(&records)));
    let manager = Arc::new(EnrollmentManager::new(
        Arc::clone(&registry),
        Arc::clone(&contacts),
        Arc::clone(&enrollments),
    ));
    let ingress = Arc::new(EventIngress::new(
        Arc::clone(&manager),
        config.ingress.max_trigger_depth,
    ));
    let webhooks = Arc::new(
        WebhookProcessor::new(Arc::clone(&records), Arc::clone(&contacts))
            .with_halt(Arc::clone(&enrollments) as Arc<dyn EnrollmentHalt>)
            .with_trigger_sink(Arc::clone(&ingress) as Arc<dyn TriggerSink>),
    );
    let scheduler = StepScheduler::new(
        Arc::clone(&registry),
        Arc::clone(&contacts),
        Arc::clone(&enrollments),
        Arc::clone(&pipeline),
        Arc::clone(&analytics),
        config.scheduler.clone(),
    )
    .with_trigger_sink(Arc::clone(&ingress) as Arc<dyn TriggerSink>);

    // Recurring scheduler driver. Overlap with other drivers is safe — the
    // per-enrollment claim serializes them.
    if !cli.api_only {
        let interval_secs = config.scheduler.tick_interval_secs;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            loop {
                interval.tick().await;
                let summary = scheduler.tick(Utc::now()).await;
                if summary.claimed > 0 {
                    info!(?summary, "Scheduler tick");
                }
            }
        });
        info!(interval_secs, "Scheduler loop started");
    }

    let state = AppState {
        registry,
        contacts,
        enrollments,
        campaigns,
        manager,
        ingress,
        pipeline,
        webhooks,
        analytics,
        node_id: config.node_id.clone(),
        start_time: Instant::now(),
    };

    if let Err(e) = mailwright_api::server::run(state, &config.api.host, config.api.http_port).await
    {
        error!(error = %e, "HTTP server exited");
        return Err(e);
    }
    Ok(())
}
