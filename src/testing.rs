//! In-memory doubles for the storage, completions, synthesis, and
//! notification seams. Test-only.

use crate::completions::{ChatCompletion, ChatRequest, CompletionBackend, CompletionError};
use crate::db::{DBConnection, DBError};
use crate::email::{EmailError, MailSender, Notifications};
use crate::models::invite_codes::{InviteCode, InviteCodeError};
use crate::models::plans::{NewPlanOutput, Plan, PlanArtifacts, PlanError, PlanOutput, PlanStatus};
use crate::models::sessions::{NewSession, Session, SessionError, SessionStatus};
use crate::models::turns::{NewTurn, Turn};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
struct MockDbInner {
    sessions: HashMap<Uuid, Session>,
    turns: Vec<Turn>,
    plans: HashMap<Uuid, Plan>,
    outputs: Vec<PlanOutput>,
    invites: HashMap<i32, InviteCode>,
    next_turn_id: i64,
    next_output_id: i64,
}

pub struct MockDb {
    inner: Mutex<MockDbInner>,
}

impl MockDb {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(MockDbInner::default()),
        })
    }

    pub fn seed_invite(
        self: &Arc<Self>,
        id: i32,
        max_uses: i32,
        bound_email: Option<&str>,
    ) -> InviteCode {
        let invite = InviteCode {
            id,
            code: format!("code-{}", id),
            admin_email: "admin@example.com".to_string(),
            bound_email: bound_email.map(|e| e.to_string()),
            max_uses,
            current_uses: 0,
            expires_at: Utc::now() + ChronoDuration::hours(24),
            active: true,
            created_at: Utc::now(),
        };
        self.inner
            .lock()
            .unwrap()
            .invites
            .insert(id, invite.clone());
        invite
    }

    pub fn seed_session(self: &Arc<Self>, status: SessionStatus) -> Session {
        self.seed_session_with(status, 0, false)
    }

    /// Seeds a session with `turn_count` filler turns and an optional
    /// already-made summary offer in its conversation state.
    pub fn seed_session_with(
        self: &Arc<Self>,
        status: SessionStatus,
        turn_count: i32,
        bot_offered_summary: bool,
    ) -> Session {
        self.seed_invite(1, 10, None);
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            client_token: "f".repeat(64),
            invite_code_id: 1,
            contact_email: Some("visitor@example.com".to_string()),
            status,
            turn_count,
            conversation_state: json!({ "bot_offered_summary": bot_offered_summary }),
            extracted_requirements: None,
            started_at: now,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };

        let mut inner = self.inner.lock().unwrap();
        for n in 1..=turn_count {
            inner.next_turn_id += 1;
            let turn_id = inner.next_turn_id;
            inner.turns.push(Turn {
                id: turn_id,
                session_id: session.id,
                turn_number: n,
                user_message: format!("answer {}", n),
                assistant_message: format!("question {}", n),
                interaction_mode: "text".to_string(),
                prompt_tokens: 0,
                completion_tokens: 0,
                turn_context: json!({}),
                created_at: now,
            });
        }
        inner.sessions.insert(session.id, session.clone());
        session
    }

    pub fn seed_failed_plan(self: &Arc<Self>, session_id: Uuid) -> Plan {
        let plan = Plan {
            id: Uuid::new_v4(),
            session_id,
            status: PlanStatus::Failed,
            structured_requirements: None,
            user_summary: None,
            technical_plan: None,
            cost_estimate: None,
            timeline_estimate: None,
            generated_at: None,
            created_at: Utc::now(),
        };
        self.inner
            .lock()
            .unwrap()
            .plans
            .insert(plan.id, plan.clone());
        plan
    }

    pub fn plan_count(&self) -> usize {
        self.inner.lock().unwrap().plans.len()
    }

    pub fn output_count(&self) -> usize {
        self.inner.lock().unwrap().outputs.len()
    }
}

impl DBConnection for MockDb {
    fn redeem_invite_code(&self, code: &str) -> Result<InviteCode, DBError> {
        let mut inner = self.inner.lock().unwrap();
        let invite = inner
            .invites
            .values_mut()
            .find(|i| i.code == code)
            .ok_or(DBError::InviteCodeError(InviteCodeError::NotFound))?;

        if !invite.active {
            return Err(DBError::InviteCodeError(InviteCodeError::Inactive));
        }
        if invite.expires_at <= Utc::now() {
            return Err(DBError::InviteCodeError(InviteCodeError::Expired));
        }
        if invite.current_uses >= invite.max_uses {
            return Err(DBError::InviteCodeError(InviteCodeError::Exhausted));
        }
        invite.current_uses += 1;
        Ok(invite.clone())
    }

    fn get_invite_code_by_id(&self, id: i32) -> Result<InviteCode, DBError> {
        self.inner
            .lock()
            .unwrap()
            .invites
            .get(&id)
            .cloned()
            .ok_or(DBError::InviteCodeError(InviteCodeError::NotFound))
    }

    fn create_session(&self, new_session: NewSession) -> Result<Session, DBError> {
        let now = Utc::now();
        let session = Session {
            id: new_session.id,
            client_token: new_session.client_token,
            invite_code_id: new_session.invite_code_id,
            contact_email: new_session.contact_email,
            status: new_session.status,
            turn_count: new_session.turn_count,
            conversation_state: new_session.conversation_state,
            extracted_requirements: None,
            started_at: now,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        self.inner
            .lock()
            .unwrap()
            .sessions
            .insert(session.id, session.clone());
        Ok(session)
    }

    fn get_session_by_id(&self, id: Uuid) -> Result<Session, DBError> {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .get(&id)
            .cloned()
            .ok_or(DBError::SessionError(SessionError::NotFound))
    }

    fn transition_session_status(
        &self,
        id: Uuid,
        expected: &[SessionStatus],
        to: SessionStatus,
    ) -> Result<Session, DBError> {
        let mut inner = self.inner.lock().unwrap();
        let session = inner
            .sessions
            .get_mut(&id)
            .ok_or(DBError::SessionError(SessionError::NotFound))?;

        if !expected.contains(&session.status) {
            return Err(DBError::SessionError(SessionError::StatusConflict {
                expected: expected.to_vec(),
                found: session.status,
            }));
        }
        session.status = to;
        session.completed_at = if to.is_terminal() {
            Some(Utc::now())
        } else {
            None
        };
        session.updated_at = Utc::now();
        Ok(session.clone())
    }

    fn update_extracted_requirements(
        &self,
        id: Uuid,
        requirements: serde_json::Value,
    ) -> Result<(), DBError> {
        let mut inner = self.inner.lock().unwrap();
        let session = inner
            .sessions
            .get_mut(&id)
            .ok_or(DBError::SessionError(SessionError::NotFound))?;
        session.extracted_requirements = Some(requirements);
        Ok(())
    }

    fn get_session_turns(&self, session_id: Uuid) -> Result<Vec<Turn>, DBError> {
        let mut turns: Vec<Turn> = self
            .inner
            .lock()
            .unwrap()
            .turns
            .iter()
            .filter(|t| t.session_id == session_id)
            .cloned()
            .collect();
        turns.sort_by_key(|t| t.turn_number);
        Ok(turns)
    }

    fn record_turn(
        &self,
        new_turn: NewTurn,
        conversation_state: serde_json::Value,
    ) -> Result<Turn, DBError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_turn_id += 1;
        let turn = Turn {
            id: inner.next_turn_id,
            session_id: new_turn.session_id,
            turn_number: new_turn.turn_number,
            user_message: new_turn.user_message,
            assistant_message: new_turn.assistant_message,
            interaction_mode: new_turn.interaction_mode,
            prompt_tokens: new_turn.prompt_tokens,
            completion_tokens: new_turn.completion_tokens,
            turn_context: new_turn.turn_context,
            created_at: Utc::now(),
        };
        inner.turns.push(turn.clone());

        let session = inner
            .sessions
            .get_mut(&new_turn.session_id)
            .ok_or(DBError::SessionError(SessionError::NotFound))?;
        session.turn_count += 1;
        session.conversation_state = conversation_state;
        session.updated_at = Utc::now();
        Ok(turn)
    }

    fn begin_plan_generation(&self, session_id: Uuid) -> Result<Plan, DBError> {
        let mut inner = self.inner.lock().unwrap();
        let existing = inner
            .plans
            .values()
            .find(|p| p.session_id == session_id)
            .cloned();

        match existing {
            Some(plan) if plan.status == PlanStatus::Completed => {
                Err(DBError::PlanError(PlanError::AlreadyCompleted))
            }
            Some(mut plan) => {
                plan.status = PlanStatus::Generating;
                inner.plans.insert(plan.id, plan.clone());
                Ok(plan)
            }
            None => {
                let plan = Plan {
                    id: Uuid::new_v4(),
                    session_id,
                    status: PlanStatus::Generating,
                    structured_requirements: None,
                    user_summary: None,
                    technical_plan: None,
                    cost_estimate: None,
                    timeline_estimate: None,
                    generated_at: None,
                    created_at: Utc::now(),
                };
                inner.plans.insert(plan.id, plan.clone());
                Ok(plan)
            }
        }
    }

    fn complete_plan(&self, plan_id: Uuid, artifacts: &PlanArtifacts) -> Result<Plan, DBError> {
        let mut inner = self.inner.lock().unwrap();
        let plan = inner
            .plans
            .get_mut(&plan_id)
            .ok_or(DBError::PlanError(PlanError::NotFound))?;
        plan.status = PlanStatus::Completed;
        plan.structured_requirements = Some(artifacts.structured_requirements.clone());
        plan.user_summary = Some(artifacts.user_summary.clone());
        plan.technical_plan = Some(artifacts.technical_plan.clone());
        plan.cost_estimate = artifacts.cost_estimate.clone();
        plan.timeline_estimate = artifacts.timeline_estimate.clone();
        plan.generated_at = Some(Utc::now());
        Ok(plan.clone())
    }

    fn mark_plan_failed(&self, plan_id: Uuid) -> Result<(), DBError> {
        let mut inner = self.inner.lock().unwrap();
        let plan = inner
            .plans
            .get_mut(&plan_id)
            .ok_or(DBError::PlanError(PlanError::NotFound))?;
        plan.status = PlanStatus::Failed;
        Ok(())
    }

    fn get_plan_by_session(&self, session_id: Uuid) -> Result<Plan, DBError> {
        self.inner
            .lock()
            .unwrap()
            .plans
            .values()
            .find(|p| p.session_id == session_id)
            .cloned()
            .ok_or(DBError::PlanError(PlanError::NotFound))
    }

    fn record_plan_output(&self, output: NewPlanOutput) -> Result<(), DBError> {
        let mut inner = self.inner.lock().unwrap();
        let duplicate = inner
            .outputs
            .iter()
            .any(|o| o.plan_id == output.plan_id && o.channel == output.channel);
        if duplicate {
            return Ok(());
        }
        inner.next_output_id += 1;
        let record = PlanOutput {
            id: inner.next_output_id,
            plan_id: output.plan_id,
            channel: output.channel,
            recipient: output.recipient,
            sent_at: Utc::now(),
        };
        inner.outputs.push(record);
        Ok(())
    }

    fn get_plan_outputs(&self, plan_id: Uuid) -> Result<Vec<PlanOutput>, DBError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .outputs
            .iter()
            .filter(|o| o.plan_id == plan_id)
            .cloned()
            .collect())
    }
}

pub struct ScriptedBackend {
    replies: Mutex<VecDeque<Result<ChatCompletion, CompletionError>>>,
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn complete(&self, _request: ChatRequest) -> Result<ChatCompletion, CompletionError> {
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(CompletionError::Http("script exhausted".to_string())))
    }
}

pub fn scripted_backend(
    replies: Vec<Result<ChatCompletion, CompletionError>>,
) -> Arc<ScriptedBackend> {
    Arc::new(ScriptedBackend {
        replies: Mutex::new(replies.into()),
    })
}

pub fn make_turn(turn_number: i32, user: &str, assistant: &str) -> Turn {
    Turn {
        id: turn_number as i64,
        session_id: Uuid::nil(),
        turn_number,
        user_message: user.to_string(),
        assistant_message: assistant.to_string(),
        interaction_mode: "text".to_string(),
        prompt_tokens: 0,
        completion_tokens: 0,
        turn_context: json!({}),
        created_at: Utc::now(),
    }
}

pub fn artifacts() -> PlanArtifacts {
    PlanArtifacts {
        structured_requirements: json!({
            "schema_version": 1,
            "project_name": "Bakery Online Ordering",
            "goals": ["Take orders online"],
            "features": ["Catalog", "Checkout"],
        }),
        user_summary: "An online ordering site for your bakery.".to_string(),
        technical_plan: "Rust backend, Postgres, hosted checkout.".to_string(),
        cost_estimate: Some("$20k".to_string()),
        timeline_estimate: Some("8 weeks".to_string()),
    }
}

pub struct ScriptedSynthesizer {
    results: Mutex<VecDeque<Result<PlanArtifacts, crate::synthesis::SynthesisError>>>,
    first_call_delay: Option<Duration>,
    calls: AtomicU32,
}

impl ScriptedSynthesizer {
    pub fn with_results(
        results: Vec<Result<PlanArtifacts, crate::synthesis::SynthesisError>>,
    ) -> Self {
        Self {
            results: Mutex::new(results.into()),
            first_call_delay: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn with_first_call_delay(mut self, delay: Duration) -> Self {
        self.first_call_delay = Some(delay);
        self
    }
}

#[async_trait]
impl crate::synthesis::PlanSynthesis for ScriptedSynthesizer {
    async fn generate_final_outputs(
        &self,
        _turns: &[Turn],
    ) -> Result<PlanArtifacts, crate::synthesis::SynthesisError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call == 0 {
            if let Some(delay) = self.first_call_delay {
                tokio::time::sleep(delay).await;
            }
        }
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(crate::synthesis::SynthesisError::EmptyTranscript))
    }
}

/// Always-successful transport capturing (recipient, subject) pairs in order.
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailSender for RecordingMailer {
    async fn send(&self, to: &str, subject: &str, _html: &str) -> Result<(), EmailError> {
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), subject.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifications {
    completed: Mutex<Vec<Uuid>>,
    failed: Mutex<Vec<String>>,
}

impl RecordingNotifications {
    pub fn completed_count(&self) -> usize {
        self.completed.lock().unwrap().len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.lock().unwrap().len()
    }

    pub fn failures(&self) -> Vec<String> {
        self.failed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifications for RecordingNotifications {
    async fn plan_completed(&self, _session: &Session, plan: &Plan) {
        self.completed.lock().unwrap().push(plan.id);
    }

    async fn synthesis_failed(&self, _session: &Session, error_detail: &str) {
        self.failed.lock().unwrap().push(error_detail.to_string());
    }
}
