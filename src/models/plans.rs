use crate::models::schema::{plan_outputs, plans};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_derive_enum::DbEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] diesel::result::Error),
    #[error("Plan not found")]
    NotFound,
    #[error("Plan already completed")]
    AlreadyCompleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, DbEnum)]
#[ExistingTypePath = "crate::models::schema::sql_types::PlanStatus"]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Generating,
    Completed,
    Failed,
}

/// Delivery channels recorded per plan, used to audit notification fan-out
/// and prevent re-sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, DbEnum)]
#[ExistingTypePath = "crate::models::schema::sql_types::OutputChannel"]
#[serde(rename_all = "snake_case")]
pub enum OutputChannel {
    UserSummary,
    AdminFull,
    EmailSent,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone, Serialize, Deserialize)]
#[diesel(table_name = plans)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Plan {
    pub id: Uuid,
    pub session_id: Uuid,
    pub status: PlanStatus,
    pub structured_requirements: Option<serde_json::Value>,
    pub user_summary: Option<String>,
    pub technical_plan: Option<String>,
    pub cost_estimate: Option<String>,
    pub timeline_estimate: Option<String>,
    pub generated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Synthesis artifacts persisted onto a plan when generation succeeds.
#[derive(Debug, Clone)]
pub struct PlanArtifacts {
    pub structured_requirements: serde_json::Value,
    pub user_summary: String,
    pub technical_plan: String,
    pub cost_estimate: Option<String>,
    pub timeline_estimate: Option<String>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = plan_outputs)]
pub struct NewPlanOutput {
    pub plan_id: Uuid,
    pub channel: OutputChannel,
    pub recipient: String,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone, Serialize, Deserialize)]
#[diesel(table_name = plan_outputs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct PlanOutput {
    pub id: i64,
    pub plan_id: Uuid,
    pub channel: OutputChannel,
    pub recipient: String,
    pub sent_at: DateTime<Utc>,
}

impl Plan {
    /// Creates the plan row in `generating` state, or resets an existing
    /// non-completed row back to `generating` for a retry attempt. The unique
    /// constraint on `session_id` guarantees at most one plan per session even
    /// under duplicate generation triggers; a completed plan is never
    /// overwritten.
    pub fn begin_generation(conn: &mut PgConnection, session_id: Uuid) -> Result<Plan, PlanError> {
        conn.transaction(|conn| {
            let existing = plans::table
                .filter(plans::session_id.eq(session_id))
                .first::<Plan>(conn)
                .optional()?;

            match existing {
                Some(plan) if plan.status == PlanStatus::Completed => {
                    Err(PlanError::AlreadyCompleted)
                }
                Some(plan) => diesel::update(plans::table.find(plan.id))
                    .set(plans::status.eq(PlanStatus::Generating))
                    .get_result(conn)
                    .map_err(PlanError::DatabaseError),
                None => diesel::insert_into(plans::table)
                    .values((
                        plans::id.eq(Uuid::new_v4()),
                        plans::session_id.eq(session_id),
                        plans::status.eq(PlanStatus::Generating),
                    ))
                    .get_result(conn)
                    .map_err(PlanError::DatabaseError),
            }
        })
    }

    pub fn complete(
        conn: &mut PgConnection,
        plan_id: Uuid,
        artifacts: &PlanArtifacts,
    ) -> Result<Plan, PlanError> {
        diesel::update(plans::table.find(plan_id))
            .set((
                plans::status.eq(PlanStatus::Completed),
                plans::structured_requirements.eq(Some(artifacts.structured_requirements.clone())),
                plans::user_summary.eq(Some(artifacts.user_summary.clone())),
                plans::technical_plan.eq(Some(artifacts.technical_plan.clone())),
                plans::cost_estimate.eq(artifacts.cost_estimate.clone()),
                plans::timeline_estimate.eq(artifacts.timeline_estimate.clone()),
                plans::generated_at.eq(Some(Utc::now())),
            ))
            .get_result(conn)
            .map_err(PlanError::DatabaseError)
    }

    pub fn mark_failed(conn: &mut PgConnection, plan_id: Uuid) -> Result<(), PlanError> {
        diesel::update(plans::table.find(plan_id))
            .set(plans::status.eq(PlanStatus::Failed))
            .execute(conn)
            .map(|_| ())
            .map_err(PlanError::DatabaseError)
    }

    pub fn get_by_session(conn: &mut PgConnection, session_id: Uuid) -> Result<Plan, PlanError> {
        plans::table
            .filter(plans::session_id.eq(session_id))
            .first::<Plan>(conn)
            .map_err(|e| match e {
                diesel::result::Error::NotFound => PlanError::NotFound,
                _ => PlanError::DatabaseError(e),
            })
    }
}

impl PlanOutput {
    /// Records a delivery. `ON CONFLICT DO NOTHING` on (plan_id, channel)
    /// makes repeated fan-out attempts idempotent.
    pub fn record(conn: &mut PgConnection, output: NewPlanOutput) -> Result<(), PlanError> {
        diesel::insert_into(plan_outputs::table)
            .values(&output)
            .on_conflict((plan_outputs::plan_id, plan_outputs::channel))
            .do_nothing()
            .execute(conn)
            .map(|_| ())
            .map_err(PlanError::DatabaseError)
    }

    pub fn get_for_plan(conn: &mut PgConnection, plan_id: Uuid) -> Result<Vec<PlanOutput>, PlanError> {
        plan_outputs::table
            .filter(plan_outputs::plan_id.eq(plan_id))
            .order(plan_outputs::sent_at.asc())
            .load::<PlanOutput>(conn)
            .map_err(PlanError::DatabaseError)
    }
}
