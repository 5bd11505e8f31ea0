use axum::{http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod completions;
mod config;
mod db;
mod email;
mod engine;
mod models;
mod orchestrator;
mod realtime;
mod requirements;
mod synthesis;
#[cfg(test)]
mod testing;
mod web;

use completions::HttpCompletions;
use config::AppConfig;
use db::{setup_db, DBConnection, DBError};
use email::{EmailDispatcher, ResendMailer};
use engine::{ConversationEngine, EngineError};
use models::plans::PlanError;
use models::sessions::SessionError;
use orchestrator::{spawn_plan_worker, PlanJobQueue, PlanOrchestrator};
use realtime::RealtimeNotifier;
use synthesis::PlanSynthesizer;
use web::sessions::SessionLocks;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid invite code")]
    InvalidInvite,

    #[error("{0}")]
    ValidationError(String),

    #[error("Conversation has already started")]
    ConversationAlreadyStarted,

    #[error("Session is not in a state that accepts this operation")]
    SessionNotActive,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Resource not found")]
    NotFound,

    #[error("Upstream generation failed")]
    UpstreamGenerationError,

    #[error("Internal server error")]
    InternalServerError,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub status: u16,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match self {
            ApiError::InvalidInvite => StatusCode::UNAUTHORIZED,
            ApiError::ValidationError(_) => StatusCode::BAD_REQUEST,
            ApiError::ConversationAlreadyStarted => StatusCode::BAD_REQUEST,
            ApiError::SessionNotActive => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::UpstreamGenerationError => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorResponse {
                status: status.as_u16(),
                message: self.to_string(),
            }),
        )
            .into_response()
    }
}

impl From<DBError> for ApiError {
    fn from(err: DBError) -> Self {
        match &err {
            DBError::SessionError(SessionError::NotFound) => ApiError::NotFound,
            DBError::SessionError(SessionError::StatusConflict { .. }) => ApiError::SessionNotActive,
            DBError::PlanError(PlanError::NotFound) => ApiError::NotFound,
            DBError::InviteCodeError(_) => ApiError::InvalidInvite,
            _ => {
                error!("Database error: {:?}", err);
                ApiError::InternalServerError
            }
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::SessionNotActive => ApiError::SessionNotActive,
            EngineError::ValidationError(msg) => ApiError::ValidationError(msg),
            EngineError::ConversationAlreadyStarted => ApiError::ConversationAlreadyStarted,
            EngineError::Upstream(e) => {
                error!("Upstream generation error: {:?}", e);
                ApiError::UpstreamGenerationError
            }
            EngineError::Database(e) => e.into(),
        }
    }
}

pub struct AppState {
    pub db: Arc<dyn DBConnection>,
    pub engine: ConversationEngine,
    pub realtime: Arc<RealtimeNotifier>,
    pub plan_queue: PlanJobQueue,
    pub session_locks: SessionLocks,
}

async fn health_check() -> &'static str {
    "ok"
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AppConfig::from_env();
    info!("Starting discovery orchestrator on {}", config.bind_addr);

    let db: Arc<dyn DBConnection> = Arc::new(setup_db(config.database_url.clone()));
    let completions = Arc::new(HttpCompletions::new(config.completions.clone()));

    let engine = ConversationEngine::new(db.clone(), completions.clone(), config.engine.clone());
    let synthesizer = Arc::new(PlanSynthesizer::new(
        completions.clone(),
        config.engine.model.clone(),
    ));
    let realtime = Arc::new(RealtimeNotifier::new());
    let mailer = Arc::new(ResendMailer::new(config.email.clone()));
    let notifications = Arc::new(EmailDispatcher::new(db.clone(), mailer));

    let orchestrator = Arc::new(PlanOrchestrator::new(
        db.clone(),
        synthesizer,
        realtime.clone(),
        notifications,
        config.retry,
    ));
    let plan_queue = spawn_plan_worker(orchestrator);

    let state = Arc::new(AppState {
        db,
        engine,
        realtime,
        plan_queue,
        session_locks: SessionLocks::default(),
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .merge(web::sessions::router(state))
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Could not bind listener");
    axum::serve(listener, app)
        .await
        .expect("Server error");
}
