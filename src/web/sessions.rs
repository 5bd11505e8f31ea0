//! HTTP surface for the discovery session pipeline. Session creation is
//! public (gated by the invite code); every other route requires the
//! session's bearer token. Turn processing is serialized per session.

use crate::engine::{ConversationState, TurnPhase};
use crate::models::plans::PlanStatus;
use crate::models::sessions::{NewSession, Session, SessionStatus};
use crate::models::turns::Turn;
use crate::realtime::SessionEvent;
use crate::{ApiError, AppState};
use axum::{
    extract::{Path, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{from_fn_with_state, Next},
    response::sse::{Event, KeepAlive, Sse},
    response::Response,
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const SESSION_TOKEN_BYTES: usize = 32;

/// Registry of per-session locks. A session must never process two turns
/// concurrently; the message handler holds the session's lock across the
/// whole engine call.
#[derive(Default)]
pub struct SessionLocks {
    inner: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    pub fn for_session(&self, session_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.inner.lock().expect("session lock registry poisoned");
        // Evict entries with no live holders or waiters, so the registry
        // tracks only sessions with in-flight turns.
        locks.retain(|id, lock| *id == session_id || Arc::strong_count(lock) > 1);
        locks
            .entry(session_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().expect("session lock registry poisoned").len()
    }
}

fn generate_session_token() -> Result<String, ApiError> {
    let mut bytes = [0u8; SESSION_TOKEN_BYTES];
    getrandom::getrandom(&mut bytes).map_err(|e| {
        error!("Failed to generate session token: {}", e);
        ApiError::InternalServerError
    })?;
    Ok(hex::encode(bytes))
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub invite_code: String,
    #[serde(default)]
    pub contact_email: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionCreatedResponse {
    pub session_id: Uuid,
    pub session_token: String,
    pub status: SessionStatus,
    pub turn_count: i32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub turn_count: i32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Session> for SessionResponse {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.id,
            status: session.status,
            turn_count: session.turn_count,
            started_at: session.started_at,
            completed_at: session.completed_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TurnResponse {
    pub turn_number: i32,
    pub user_message: String,
    pub assistant_message: String,
    pub interaction_mode: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub message: String,
    #[serde(default = "default_interaction_mode")]
    pub interaction_mode: String,
}

fn default_interaction_mode() -> String {
    "text".to_string()
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
    pub turn_number: i32,
    pub turn_status: TurnPhase,
    pub should_generate_plan: bool,
    pub bot_offered_summary: bool,
}

#[derive(Debug, Serialize)]
pub struct GreetingResponse {
    pub message: String,
    pub turn_number: i32,
}

#[derive(Debug, Serialize)]
pub struct PlanResponse {
    pub plan_id: Uuid,
    pub status: PlanStatus,
    pub user_summary: Option<String>,
    pub cost_estimate: Option<String>,
    pub timeline_estimate: Option<String>,
    pub generated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub status: &'static str,
    pub session_id: Uuid,
}

pub fn router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/v1/sessions/:id", get(get_session))
        .route("/v1/sessions/:id/history", get(get_history))
        .route("/v1/sessions/:id/start", post(start_session))
        .route("/v1/sessions/:id/message", post(post_message))
        .route("/v1/sessions/:id/generate-plan", post(generate_plan))
        .route("/v1/sessions/:id/plan", get(get_plan))
        .route("/v1/sessions/:id/events", get(session_events))
        .layer(from_fn_with_state(state.clone(), require_session_token));

    Router::new()
        .route("/v1/sessions", post(create_session))
        .merge(protected)
        .with_state(state)
}

/// Loads the session for `:id`, checks the bearer token against its
/// credential, and injects the session into request extensions.
async fn require_session_token(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    let session = state.db.get_session_by_id(id)?;
    if session.client_token != token {
        warn!("Rejected request with bad token for session {}", id);
        return Err(ApiError::Unauthorized);
    }

    request.extensions_mut().insert(session);
    Ok(next.run(request).await)
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionCreatedResponse>), ApiError> {
    // Atomic redemption: the invite's usage counter only moves when the code
    // is still usable, so a code with max_uses=1 creates exactly one session
    // even under concurrent requests.
    let invite = state.db.redeem_invite_code(&body.invite_code).map_err(|e| {
        debug!("Invite redemption failed: {:?}", e);
        ApiError::InvalidInvite
    })?;

    let contact_email = body.contact_email.or_else(|| invite.bound_email.clone());

    let session = state.db.create_session(NewSession {
        id: Uuid::new_v4(),
        client_token: generate_session_token()?,
        invite_code_id: invite.id,
        contact_email,
        status: SessionStatus::Active,
        turn_count: 0,
        conversation_state: ConversationState::default().to_value(),
    })?;

    info!("Created session {} from invite {}", session.id, invite.id);

    Ok((
        StatusCode::CREATED,
        Json(SessionCreatedResponse {
            session_id: session.id,
            session_token: session.client_token.clone(),
            status: session.status,
            turn_count: session.turn_count,
            started_at: session.started_at,
        }),
    ))
}

async fn get_session(
    Extension(session): Extension<Session>,
) -> Result<Json<SessionResponse>, ApiError> {
    Ok(Json(SessionResponse::from(&session)))
}

async fn get_history(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
) -> Result<Json<Vec<TurnResponse>>, ApiError> {
    let turns = state.db.get_session_turns(session.id)?;
    Ok(Json(turns.iter().map(turn_response).collect()))
}

fn turn_response(turn: &Turn) -> TurnResponse {
    TurnResponse {
        turn_number: turn.turn_number,
        user_message: turn.user_message.clone(),
        assistant_message: turn.assistant_message.clone(),
        interaction_mode: turn.interaction_mode.clone(),
        created_at: turn.created_at,
    }
}

async fn start_session(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
) -> Result<Json<GreetingResponse>, ApiError> {
    let lock = state.session_locks.for_session(session.id);
    let _guard = lock.lock().await;

    let session = state.db.get_session_by_id(session.id)?;
    let greeting = state.engine.generate_greeting(&session).await?;

    state.realtime.publish(
        session.id,
        SessionEvent::assistant_message(
            greeting.assistant_text.clone(),
            greeting.turn_number,
            TurnPhase::Discovery,
        ),
    );

    Ok(Json(GreetingResponse {
        message: greeting.assistant_text,
        turn_number: greeting.turn_number,
    }))
}

async fn post_message(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Json(body): Json<MessageRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    if body.interaction_mode != "text" && body.interaction_mode != "voice" {
        return Err(ApiError::ValidationError(
            "interaction_mode must be 'text' or 'voice'".to_string(),
        ));
    }

    // One turn at a time per session; concurrent calls queue up here.
    let lock = state.session_locks.for_session(session.id);
    let _guard = lock.lock().await;

    // Re-read inside the lock so the engine sees the latest turn count.
    let session = state.db.get_session_by_id(session.id)?;
    let turn = state
        .engine
        .process_message(&session, &body.message, &body.interaction_mode)
        .await?;

    state.realtime.publish(
        session.id,
        SessionEvent::assistant_message(
            turn.assistant_text.clone(),
            turn.turn_number,
            turn.turn_status,
        ),
    );

    if turn.should_generate_plan {
        debug!(
            "Engine requested plan generation for session {} at turn {}",
            session.id, turn.turn_number
        );
        state.plan_queue.enqueue(session.id);
    }

    Ok(Json(MessageResponse {
        message: turn.assistant_text,
        turn_number: turn.turn_number,
        turn_status: turn.turn_status,
        should_generate_plan: turn.should_generate_plan,
        bot_offered_summary: turn.bot_offered_summary,
    }))
}

async fn generate_plan(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let session = state.db.get_session_by_id(session.id)?;

    // Defense in depth: the engine enforces the minimum too, but this
    // endpoint can be called directly.
    if session.turn_count < state.engine.config().min_turns_for_plan {
        return Err(ApiError::ValidationError(format!(
            "at least {} turns are required before generating a plan",
            state.engine.config().min_turns_for_plan
        )));
    }

    if session.status == SessionStatus::Abandoned {
        return Err(ApiError::SessionNotActive);
    }

    // Duplicate triggers while generating or completed are absorbed by the
    // orchestrator's idempotency gate; accepting them here keeps the
    // endpoint safe to retry.
    state.plan_queue.enqueue(session.id);

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            status: "accepted",
            session_id: session.id,
        }),
    ))
}

async fn get_plan(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
) -> Result<Json<PlanResponse>, ApiError> {
    let plan = state.db.get_plan_by_session(session.id).map_err(|e| {
        debug!("No plan for session {}: {:?}", session.id, e);
        ApiError::NotFound
    })?;

    Ok(Json(PlanResponse {
        plan_id: plan.id,
        status: plan.status,
        user_summary: plan.user_summary,
        cost_estimate: plan.cost_estimate,
        timeline_estimate: plan.timeline_estimate,
        generated_at: plan.generated_at,
    }))
}

async fn session_events(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let mut rx = state.realtime.subscribe(session.id);
    debug!(
        "Client subscribed to {}",
        crate::realtime::RealtimeNotifier::topic_name(session.id)
    );

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    yield Ok(Event::default()
                        .event(event.event_name())
                        .data(event.to_json().to_string()));
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    // The client fell behind; it must resynchronize through
                    // the history and plan endpoints.
                    warn!("SSE subscriber lagged, skipped {} events", skipped);
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
