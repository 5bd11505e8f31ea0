//! Retryable background job that drives plan synthesis and its side effects.
//! Side effects are deliberately ordered: persistence, then realtime
//! broadcast, then email, so a crash between steps never leaves a broadcast
//! or mail referencing a plan that does not exist in storage.

use crate::config::RetryPolicy;
use crate::db::{DBConnection, DBError};
use crate::email::Notifications;
use crate::models::sessions::{SessionError, SessionStatus};
use crate::models::plans::PlanError;
use crate::realtime::{RealtimeNotifier, SessionEvent};
use crate::synthesis::PlanSynthesis;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct PlanJob {
    pub session_id: Uuid,
}

/// Enqueue side of the worker. The HTTP path pushes a job and returns
/// immediately (202 semantics); the worker owns everything after that.
#[derive(Clone)]
pub struct PlanJobQueue {
    tx: mpsc::UnboundedSender<PlanJob>,
}

impl PlanJobQueue {
    pub fn enqueue(&self, session_id: Uuid) {
        if self.tx.send(PlanJob { session_id }).is_err() {
            // Only happens during shutdown when the worker is gone.
            error!("Plan worker is not running, dropping job for {}", session_id);
        }
    }
}

/// Outcome of one orchestrator run, mostly for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// Another run owns this session, or it is already terminal.
    Skipped,
    /// Retry budget exhausted; session is terminally failed.
    Failed,
}

pub struct PlanOrchestrator {
    db: Arc<dyn DBConnection>,
    synthesizer: Arc<dyn PlanSynthesis>,
    realtime: Arc<RealtimeNotifier>,
    notifications: Arc<dyn Notifications>,
    policy: RetryPolicy,
}

impl PlanOrchestrator {
    pub fn new(
        db: Arc<dyn DBConnection>,
        synthesizer: Arc<dyn PlanSynthesis>,
        realtime: Arc<RealtimeNotifier>,
        notifications: Arc<dyn Notifications>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            db,
            synthesizer,
            realtime,
            notifications,
            policy,
        }
    }

    /// Runs one plan-generation job to a terminal outcome. Duplicate triggers
    /// are absorbed here, not by callers: the compare-and-set transition into
    /// `Generating` is the idempotency gate, and the unique plan row per
    /// session backstops it.
    pub async fn run(&self, session_id: Uuid) -> Result<RunOutcome, DBError> {
        // Terminal sessions (Failed included) never re-enter generation;
        // the retry loop below is the only retry mechanism.
        let claimed = self.db.transition_session_status(
            session_id,
            &[SessionStatus::Active, SessionStatus::Paused],
            SessionStatus::Generating,
        );

        let session = match claimed {
            Ok(session) => session,
            Err(DBError::SessionError(SessionError::StatusConflict { found, .. })) => {
                info!(
                    "Skipping plan generation for {}: session is {:?}",
                    session_id, found
                );
                return Ok(RunOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        let plan = match self.db.begin_plan_generation(session_id) {
            Ok(plan) => plan,
            Err(DBError::PlanError(PlanError::AlreadyCompleted)) => {
                info!("Skipping plan generation for {}: plan already completed", session_id);
                return Ok(RunOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        let turns = self.db.get_session_turns(session_id)?;

        let mut last_error = String::new();
        for attempt in 1..=self.policy.max_attempts {
            info!(
                "Plan synthesis attempt {}/{} for session {}",
                attempt, self.policy.max_attempts, session_id
            );

            let result = timeout(
                self.policy.attempt_timeout,
                self.synthesizer.generate_final_outputs(&turns),
            )
            .await;

            match result {
                Ok(Ok(artifacts)) => {
                    // Persist before broadcast before email.
                    let completed_plan = self.db.complete_plan(plan.id, &artifacts)?;
                    self.db.update_extracted_requirements(
                        session_id,
                        artifacts.structured_requirements.clone(),
                    )?;
                    let session = self.db.transition_session_status(
                        session_id,
                        &[SessionStatus::Generating],
                        SessionStatus::Completed,
                    )?;

                    self.realtime.publish(
                        session_id,
                        SessionEvent::plan_ready(
                            completed_plan.id,
                            completed_plan.user_summary.clone().unwrap_or_default(),
                        ),
                    );

                    self.notifications
                        .plan_completed(&session, &completed_plan)
                        .await;
                    self.realtime.close_topic(session_id);

                    info!(
                        "Plan {} completed for session {} on attempt {}",
                        completed_plan.id, session_id, attempt
                    );
                    return Ok(RunOutcome::Completed);
                }
                Ok(Err(e)) => {
                    last_error = e.to_string();
                    warn!(
                        "Plan synthesis attempt {}/{} failed for session {}: {}",
                        attempt, self.policy.max_attempts, session_id, last_error
                    );
                }
                Err(_) => {
                    last_error = format!(
                        "synthesis timed out after {}s",
                        self.policy.attempt_timeout.as_secs()
                    );
                    warn!(
                        "Plan synthesis attempt {}/{} timed out for session {}",
                        attempt, self.policy.max_attempts, session_id
                    );
                }
            }
            // Session stays Generating between attempts; the retry loop is
            // invisible to the visitor polling the plan endpoint.
        }

        // Retry budget exhausted: terminal failure. The admin gets the final
        // attempt's error and then the terminal alert; the duplicate is
        // accepted on this best-effort channel.
        self.notifications.synthesis_failed(&session, &last_error).await;

        if let Err(e) = self.db.mark_plan_failed(plan.id) {
            error!("Failed to mark plan {} failed: {:?}", plan.id, e);
        }
        let session = self.db.transition_session_status(
            session_id,
            &[SessionStatus::Generating],
            SessionStatus::Failed,
        )?;

        self.notifications
            .synthesis_failed(
                &session,
                &format!("plan generation permanently failed: {}", last_error),
            )
            .await;
        self.realtime.close_topic(session_id);

        error!(
            "Plan generation permanently failed for session {}: {}",
            session_id, last_error
        );
        Ok(RunOutcome::Failed)
    }
}

/// Spawns the worker task draining the plan job queue. One job runs at a
/// time; duplicate triggers for the same session fall out of the queue as
/// no-ops via the orchestrator's idempotency gate.
pub fn spawn_plan_worker(orchestrator: Arc<PlanOrchestrator>) -> PlanJobQueue {
    let (tx, mut rx) = mpsc::unbounded_channel::<PlanJob>();

    tokio::spawn(async move {
        info!("Plan generation worker started");
        while let Some(job) = rx.recv().await {
            if let Err(e) = orchestrator.run(job.session_id).await {
                error!(
                    "Plan generation job for {} aborted with database error: {:?}",
                    job.session_id, e
                );
            }
        }
        info!("Plan generation worker stopped");
    });

    PlanJobQueue { tx }
}
