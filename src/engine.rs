//! Per-turn dialogue state machine. Stateless per call: given a session and a
//! new user utterance it builds the full prompt from persisted turns, calls
//! the completions backend, classifies the interview phase, and records
//! exactly one immutable turn on success. A failed upstream call mutates
//! nothing.

use crate::completions::{ChatMessage, ChatRequest, CompletionBackend, CompletionError, ChatCompletion};
use crate::config::EngineConfig;
use crate::db::{DBConnection, DBError};
use crate::models::sessions::Session;
use crate::models::turns::{NewTurn, Turn};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

const GREETING_TEMPERATURE: f32 = 0.8;
const TURN_TEMPERATURE: f32 = 0.7;

const BASE_SYSTEM_PROMPT: &str = "You are a friendly discovery consultant interviewing a visitor \
about a software project they want built. Ask one focused question at a time. Keep replies short \
and conversational.";

const SOFT_NUDGE_INSTRUCTION: &str = "The interview is running long. Begin steering toward \
closure: consolidate what you have learned and ask only clarifying questions.";

const FORCE_SUMMARY_INSTRUCTION: &str = "The interview has reached its length limit. Do not ask \
any further open-ended questions. Briefly recap what you have learned and explicitly offer to \
put together a project plan and summary now.";

const GREETING_PROMPT: &str = "Open the discovery interview: welcome the visitor warmly, explain \
that you will ask a few questions about their project, and ask what they would like to build.";

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Session is not accepting turns")]
    SessionNotActive,
    #[error("Invalid message: {0}")]
    ValidationError(String),
    #[error("Conversation has already started")]
    ConversationAlreadyStarted,
    #[error("Upstream generation failed: {0}")]
    Upstream(#[from] CompletionError),
    #[error("Database error: {0}")]
    Database(#[from] DBError),
}

/// Urgency classification for a turn, driven by how many turns have elapsed
/// against the configured soft and hard caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    Discovery,
    SoftNudge,
    ForceSummary,
}

impl TurnPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnPhase::Discovery => "discovery",
            TurnPhase::SoftNudge => "soft_nudge",
            TurnPhase::ForceSummary => "force_summary",
        }
    }
}

/// Rolling interview memory persisted on the session between turns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationState {
    #[serde(default)]
    pub bot_offered_summary: bool,
    #[serde(default)]
    pub last_phase: Option<String>,
}

impl ConversationState {
    pub fn from_value(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessedTurn {
    pub assistant_text: String,
    pub turn_number: i32,
    pub turn_status: TurnPhase,
    pub should_generate_plan: bool,
    pub bot_offered_summary: bool,
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct GreetingTurn {
    pub assistant_text: String,
    pub turn_number: i32,
}

lazy_static! {
    static ref OFFER_RE: Regex = Regex::new(
        r"(?i)(put together|generate|prepare|draft|create)\s+(a|the|your)\s+(project\s+)?(plan|summary|proposal)"
    )
    .expect("offer regex compiles");
    static ref ACCEPT_RE: Regex = Regex::new(
        r"(?i)^\s*(yes|yeah|yep|sure|ok(ay)?|sounds good|please do|go ahead|let's do it|do it|absolutely|that works)\b"
    )
    .expect("acceptance regex compiles");
}

/// Classifies the interview phase from the number of completed turns.
pub fn classify_phase(elapsed_turns: i32, config: &EngineConfig) -> TurnPhase {
    if elapsed_turns >= config.hard_cap {
        TurnPhase::ForceSummary
    } else if elapsed_turns >= config.soft_cap {
        TurnPhase::SoftNudge
    } else {
        TurnPhase::Discovery
    }
}

/// True when the assistant's reply explicitly offers to synthesize the plan.
pub fn detect_summary_offer(assistant_text: &str) -> bool {
    OFFER_RE.is_match(assistant_text)
}

/// True when the visitor's message reads as an affirmative response.
pub fn detect_acceptance(user_text: &str) -> bool {
    ACCEPT_RE.is_match(user_text)
}

pub struct ConversationEngine {
    db: Arc<dyn DBConnection>,
    completions: Arc<dyn CompletionBackend>,
    config: EngineConfig,
}

impl ConversationEngine {
    pub fn new(
        db: Arc<dyn DBConnection>,
        completions: Arc<dyn CompletionBackend>,
        config: EngineConfig,
    ) -> Self {
        Self {
            db,
            completions,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Processes one conversational turn. Callers must hold the per-session
    /// lock; the engine itself does not serialize concurrent calls.
    pub async fn process_message(
        &self,
        session: &Session,
        user_text: &str,
        interaction_mode: &str,
    ) -> Result<ProcessedTurn, EngineError> {
        if !session.status.accepts_turns() {
            return Err(EngineError::SessionNotActive);
        }

        let trimmed = user_text.trim();
        if trimmed.is_empty() {
            return Err(EngineError::ValidationError("message must not be empty".to_string()));
        }
        if trimmed.chars().count() > self.config.max_message_len {
            return Err(EngineError::ValidationError(format!(
                "message exceeds maximum length of {} characters",
                self.config.max_message_len
            )));
        }

        let state = ConversationState::from_value(&session.conversation_state);
        let phase = classify_phase(session.turn_count, &self.config);
        let history = self.db.get_session_turns(session.id)?;

        let messages = self.build_turn_prompt(phase, &history, trimmed);
        let completion = self
            .completions
            .complete(ChatRequest {
                model: self.config.model.clone(),
                messages,
                temperature: TURN_TEMPERATURE,
                max_tokens: None,
            })
            .await?;

        // The offer is sticky once made; the forced-summary prompt mandates it.
        let bot_offered_summary = state.bot_offered_summary
            || phase == TurnPhase::ForceSummary
            || detect_summary_offer(&completion.content);

        // Acceptance only counts against an offer the visitor has already seen.
        let accepted = state.bot_offered_summary && detect_acceptance(trimmed);

        let turn_number = session.turn_count + 1;
        let should_generate_plan = accepted && turn_number >= self.config.min_turns_for_plan;
        if accepted && !should_generate_plan {
            warn!(
                "Session {} accepted summary offer at turn {} but is under the minimum of {}",
                session.id, turn_number, self.config.min_turns_for_plan
            );
        }

        let new_state = ConversationState {
            bot_offered_summary,
            last_phase: Some(phase.as_str().to_string()),
        };

        let turn = self.persist_turn(
            session,
            turn_number,
            trimmed,
            interaction_mode,
            phase,
            &completion,
            &new_state,
        )?;

        debug!(
            "Session {} turn {} recorded (phase={}, should_generate_plan={})",
            session.id,
            turn.turn_number,
            phase.as_str(),
            should_generate_plan
        );

        Ok(ProcessedTurn {
            assistant_text: completion.content,
            turn_number: turn.turn_number,
            turn_status: phase,
            should_generate_plan,
            bot_offered_summary,
            prompt_tokens: completion.prompt_tokens,
            completion_tokens: completion.completion_tokens,
        })
    }

    /// Produces the opening turn. Only valid while no turn has been recorded.
    pub async fn generate_greeting(&self, session: &Session) -> Result<GreetingTurn, EngineError> {
        if session.turn_count != 0 {
            return Err(EngineError::ConversationAlreadyStarted);
        }
        if !session.status.accepts_turns() {
            return Err(EngineError::SessionNotActive);
        }

        let completion = self
            .completions
            .complete(ChatRequest {
                model: self.config.model.clone(),
                messages: vec![
                    ChatMessage::system(BASE_SYSTEM_PROMPT),
                    ChatMessage::user(GREETING_PROMPT),
                ],
                temperature: GREETING_TEMPERATURE,
                max_tokens: None,
            })
            .await?;

        let state = ConversationState {
            bot_offered_summary: false,
            last_phase: Some(TurnPhase::Discovery.as_str().to_string()),
        };

        let turn = self.persist_turn(
            session,
            1,
            "",
            "text",
            TurnPhase::Discovery,
            &completion,
            &state,
        )?;

        info!("Session {} opened with greeting turn", session.id);

        Ok(GreetingTurn {
            assistant_text: completion.content,
            turn_number: turn.turn_number,
        })
    }

    fn build_turn_prompt(
        &self,
        phase: TurnPhase,
        history: &[Turn],
        user_text: &str,
    ) -> Vec<ChatMessage> {
        let system = match phase {
            TurnPhase::Discovery => BASE_SYSTEM_PROMPT.to_string(),
            TurnPhase::SoftNudge => format!("{} {}", BASE_SYSTEM_PROMPT, SOFT_NUDGE_INSTRUCTION),
            TurnPhase::ForceSummary => {
                format!("{} {}", BASE_SYSTEM_PROMPT, FORCE_SUMMARY_INSTRUCTION)
            }
        };

        let mut messages = vec![ChatMessage::system(system)];
        for turn in history {
            if !turn.user_message.is_empty() {
                messages.push(ChatMessage::user(turn.user_message.clone()));
            }
            messages.push(ChatMessage::assistant(turn.assistant_message.clone()));
        }
        messages.push(ChatMessage::user(user_text));
        messages
    }

    #[allow(clippy::too_many_arguments)]
    fn persist_turn(
        &self,
        session: &Session,
        turn_number: i32,
        user_text: &str,
        interaction_mode: &str,
        phase: TurnPhase,
        completion: &ChatCompletion,
        state: &ConversationState,
    ) -> Result<Turn, DBError> {
        let new_turn = NewTurn {
            session_id: session.id,
            turn_number,
            user_message: user_text.to_string(),
            assistant_message: completion.content.clone(),
            interaction_mode: interaction_mode.to_string(),
            prompt_tokens: completion.prompt_tokens,
            completion_tokens: completion.completion_tokens,
            turn_context: json!({
                "phase": phase.as_str(),
                "bot_offered_summary": state.bot_offered_summary,
            }),
        };
        self.db.record_turn(new_turn, state.to_value())
    }
}
