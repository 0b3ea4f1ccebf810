use axum::{http::Method, routing::get, Router};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod automation;
mod capabilities;
mod config;
mod database;
mod error;
mod handlers;
mod jobs;
mod pagination;

pub use error::{ApiError, ApiResult, AppError};
pub use pagination::{PaginatedResponse, PaginationMeta, PaginationParams};

use automation::{
    ActionDispatcher, AutomationStore, EnrollmentEngine, PgStore, RetryPolicy, StatsAggregator,
    TriggerDispatcher,
};
use capabilities::{Capabilities, RestCapabilities};

#[cfg(test)]
mod tests;

pub struct AppState {
    pub db_pool: sqlx::PgPool,
    pub store: Arc<dyn AutomationStore>,
    pub triggers: Arc<TriggerDispatcher>,
    pub stats: StatsAggregator,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::from_env()?;
    let db_pool = database::create_pool(&config.database_url).await?;

    database::migrate(&db_pool).await?;

    let store: Arc<dyn AutomationStore> = Arc::new(PgStore::new(db_pool.clone()));
    let capabilities: Arc<dyn Capabilities> = Arc::new(RestCapabilities::new(
        &config.capabilities.base_url,
        Duration::from_secs(config.capabilities.dispatch_timeout_secs),
    )?);
    let dispatcher = ActionDispatcher::new(
        capabilities.clone(),
        Duration::from_secs(config.capabilities.dispatch_timeout_secs),
    );
    let retry = RetryPolicy {
        max_attempts: config.retry.max_attempts,
        base_delay_secs: config.retry.base_delay_secs,
        max_delay_secs: config.retry.max_delay_secs,
    };
    let stats = StatsAggregator::new(store.clone());
    let engine = Arc::new(EnrollmentEngine::new(
        store.clone(),
        capabilities,
        dispatcher,
        retry,
        stats.clone(),
    ));
    let triggers = Arc::new(TriggerDispatcher::new(
        store.clone(),
        engine.clone(),
        stats.clone(),
    ));
    triggers.rebuild_index().await?;

    let scheduler = jobs::ResumeScheduler::new(
        store.clone(),
        engine.clone(),
        jobs::SchedulerConfig {
            poll_interval_secs: config.scheduler.poll_interval_secs,
            batch_size: config.scheduler.batch_size,
        },
    )
    .await?;
    scheduler.start().await?;

    let app_state = Arc::new(AppState {
        db_pool,
        store,
        triggers,
        stats,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(|| async { "Nurture Automation Engine v1.0.0" }))
        .merge(handlers::health_routes())
        .nest("/api/v1/workflows", handlers::workflow_routes())
        .nest("/api/v1/events", handlers::event_routes())
        .nest("/api/v1/enrollments", handlers::enrollment_routes())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    tracing::info!("Server running on {}", config.server_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
