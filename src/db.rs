use crate::models::invite_codes::{InviteCode, InviteCodeError};
use crate::models::plans::{NewPlanOutput, Plan, PlanArtifacts, PlanError, PlanOutput};
use crate::models::sessions::{NewSession, Session, SessionError, SessionStatus};
use crate::models::turns::{NewTurn, Turn, TurnError};
use diesel::pg::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DBError {
    #[error("Connection pool error: {0}")]
    PoolError(#[from] diesel::r2d2::PoolError),
    #[error("Session error: {0}")]
    SessionError(#[from] SessionError),
    #[error("Turn error: {0}")]
    TurnError(#[from] TurnError),
    #[error("Plan error: {0}")]
    PlanError(#[from] PlanError),
    #[error("Invite code error: {0}")]
    InviteCodeError(#[from] InviteCodeError),
}

/// Storage seam for the discovery pipeline. Everything that touches Postgres
/// goes through this trait so the engine and orchestrator can run against an
/// in-memory double in tests.
pub trait DBConnection: Send + Sync {
    fn redeem_invite_code(&self, code: &str) -> Result<InviteCode, DBError>;
    fn get_invite_code_by_id(&self, id: i32) -> Result<InviteCode, DBError>;

    fn create_session(&self, new_session: NewSession) -> Result<Session, DBError>;
    fn get_session_by_id(&self, id: Uuid) -> Result<Session, DBError>;
    fn transition_session_status(
        &self,
        id: Uuid,
        expected: &[SessionStatus],
        to: SessionStatus,
    ) -> Result<Session, DBError>;
    fn update_extracted_requirements(
        &self,
        id: Uuid,
        requirements: serde_json::Value,
    ) -> Result<(), DBError>;

    fn get_session_turns(&self, session_id: Uuid) -> Result<Vec<Turn>, DBError>;
    fn record_turn(
        &self,
        new_turn: NewTurn,
        conversation_state: serde_json::Value,
    ) -> Result<Turn, DBError>;

    fn begin_plan_generation(&self, session_id: Uuid) -> Result<Plan, DBError>;
    fn complete_plan(&self, plan_id: Uuid, artifacts: &PlanArtifacts) -> Result<Plan, DBError>;
    fn mark_plan_failed(&self, plan_id: Uuid) -> Result<(), DBError>;
    fn get_plan_by_session(&self, session_id: Uuid) -> Result<Plan, DBError>;

    fn record_plan_output(&self, output: NewPlanOutput) -> Result<(), DBError>;
    fn get_plan_outputs(&self, plan_id: Uuid) -> Result<Vec<PlanOutput>, DBError>;
}

pub struct PostgresConnection {
    pool: Pool<ConnectionManager<PgConnection>>,
}

pub fn setup_db(url: String) -> PostgresConnection {
    let manager = ConnectionManager::<PgConnection>::new(url);
    let pool = Pool::builder()
        .build(manager)
        .expect("Could not build connection pool");
    info!("Database pool initialized");
    PostgresConnection { pool }
}

impl PostgresConnection {
    fn get(
        &self,
    ) -> Result<diesel::r2d2::PooledConnection<ConnectionManager<PgConnection>>, DBError> {
        self.pool.get().map_err(DBError::PoolError)
    }
}

impl DBConnection for PostgresConnection {
    fn redeem_invite_code(&self, code: &str) -> Result<InviteCode, DBError> {
        let mut conn = self.get()?;
        InviteCode::redeem(&mut conn, code).map_err(DBError::InviteCodeError)
    }

    fn get_invite_code_by_id(&self, id: i32) -> Result<InviteCode, DBError> {
        let mut conn = self.get()?;
        InviteCode::get_by_id(&mut conn, id).map_err(DBError::InviteCodeError)
    }

    fn create_session(&self, new_session: NewSession) -> Result<Session, DBError> {
        let mut conn = self.get()?;
        Session::create(&mut conn, new_session).map_err(DBError::SessionError)
    }

    fn get_session_by_id(&self, id: Uuid) -> Result<Session, DBError> {
        let mut conn = self.get()?;
        Session::get_by_id(&mut conn, id).map_err(DBError::SessionError)
    }

    fn transition_session_status(
        &self,
        id: Uuid,
        expected: &[SessionStatus],
        to: SessionStatus,
    ) -> Result<Session, DBError> {
        let mut conn = self.get()?;
        Session::transition_status(&mut conn, id, expected, to).map_err(DBError::SessionError)
    }

    fn update_extracted_requirements(
        &self,
        id: Uuid,
        requirements: serde_json::Value,
    ) -> Result<(), DBError> {
        let mut conn = self.get()?;
        Session::update_extracted_requirements(&mut conn, id, requirements)
            .map_err(DBError::SessionError)
    }

    fn get_session_turns(&self, session_id: Uuid) -> Result<Vec<Turn>, DBError> {
        let mut conn = self.get()?;
        Turn::get_for_session(&mut conn, session_id).map_err(DBError::TurnError)
    }

    fn record_turn(
        &self,
        new_turn: NewTurn,
        conversation_state: serde_json::Value,
    ) -> Result<Turn, DBError> {
        let mut conn = self.get()?;
        Turn::record(&mut conn, new_turn, conversation_state).map_err(DBError::TurnError)
    }

    fn begin_plan_generation(&self, session_id: Uuid) -> Result<Plan, DBError> {
        let mut conn = self.get()?;
        Plan::begin_generation(&mut conn, session_id).map_err(DBError::PlanError)
    }

    fn complete_plan(&self, plan_id: Uuid, artifacts: &PlanArtifacts) -> Result<Plan, DBError> {
        let mut conn = self.get()?;
        Plan::complete(&mut conn, plan_id, artifacts).map_err(DBError::PlanError)
    }

    fn mark_plan_failed(&self, plan_id: Uuid) -> Result<(), DBError> {
        let mut conn = self.get()?;
        Plan::mark_failed(&mut conn, plan_id).map_err(DBError::PlanError)
    }

    fn get_plan_by_session(&self, session_id: Uuid) -> Result<Plan, DBError> {
        let mut conn = self.get()?;
        Plan::get_by_session(&mut conn, session_id).map_err(DBError::PlanError)
    }

    fn record_plan_output(&self, output: NewPlanOutput) -> Result<(), DBError> {
        let mut conn = self.get()?;
        PlanOutput::record(&mut conn, output).map_err(DBError::PlanError)
    }

    fn get_plan_outputs(&self, plan_id: Uuid) -> Result<Vec<PlanOutput>, DBError> {
        let mut conn = self.get()?;
        PlanOutput::get_for_plan(&mut conn, plan_id).map_err(DBError::PlanError)
    }
}
