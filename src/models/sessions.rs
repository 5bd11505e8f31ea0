use crate::models::schema::sessions;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_derive_enum::DbEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] diesel::result::Error),
    #[error("Session not found")]
    NotFound,
    #[error("Session status transition rejected (expected {expected:?}, found {found:?})")]
    StatusConflict {
        expected: Vec<SessionStatus>,
        found: SessionStatus,
    },
}

/// Session lifecycle: Active -> {Paused, Generating} -> Completed | Failed.
/// Abandoned is set by an external timeout policy. Completed, Failed, and
/// Abandoned are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, DbEnum)]
#[ExistingTypePath = "crate::models::schema::sql_types::SessionStatus"]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Paused,
    Generating,
    Completed,
    Failed,
    Abandoned,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Abandoned
        )
    }

    /// States in which the conversation may still accept turns.
    pub fn accepts_turns(&self) -> bool {
        matches!(self, SessionStatus::Active | SessionStatus::Paused)
    }
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone, Serialize, Deserialize)]
#[diesel(table_name = sessions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Session {
    pub id: Uuid,
    pub client_token: String,
    pub invite_code_id: i32,
    pub contact_email: Option<String>,
    pub status: SessionStatus,
    pub turn_count: i32,
    pub conversation_state: serde_json::Value,
    pub extracted_requirements: Option<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = sessions)]
pub struct NewSession {
    pub id: Uuid,
    pub client_token: String,
    pub invite_code_id: i32,
    pub contact_email: Option<String>,
    pub status: SessionStatus,
    pub turn_count: i32,
    pub conversation_state: serde_json::Value,
}

impl Session {
    pub fn create(conn: &mut PgConnection, new_session: NewSession) -> Result<Session, SessionError> {
        diesel::insert_into(sessions::table)
            .values(&new_session)
            .get_result(conn)
            .map_err(SessionError::DatabaseError)
    }

    pub fn get_by_id(conn: &mut PgConnection, id: Uuid) -> Result<Session, SessionError> {
        sessions::table
            .find(id)
            .first::<Session>(conn)
            .map_err(|e| match e {
                diesel::result::Error::NotFound => SessionError::NotFound,
                _ => SessionError::DatabaseError(e),
            })
    }

    /// Compare-and-set status transition. The update only lands when the
    /// current status is one of `expected`, which keeps the synchronous turn
    /// path and the background orchestrator from resurrecting each other's
    /// terminal states.
    pub fn transition_status(
        conn: &mut PgConnection,
        id: Uuid,
        expected: &[SessionStatus],
        to: SessionStatus,
    ) -> Result<Session, SessionError> {
        let completed_at = if to.is_terminal() {
            Some(Utc::now())
        } else {
            None
        };

        let updated = diesel::update(
            sessions::table
                .filter(sessions::id.eq(id))
                .filter(sessions::status.eq_any(expected.to_vec())),
        )
        .set((
            sessions::status.eq(to),
            sessions::completed_at.eq(completed_at),
            sessions::updated_at.eq(diesel::dsl::now),
        ))
        .get_result::<Session>(conn)
        .optional()?;

        match updated {
            Some(session) => Ok(session),
            None => {
                let current = Self::get_by_id(conn, id)?;
                Err(SessionError::StatusConflict {
                    expected: expected.to_vec(),
                    found: current.status,
                })
            }
        }
    }

    pub fn update_extracted_requirements(
        conn: &mut PgConnection,
        id: Uuid,
        requirements: serde_json::Value,
    ) -> Result<(), SessionError> {
        diesel::update(sessions::table.find(id))
            .set((
                sessions::extracted_requirements.eq(Some(requirements)),
                sessions::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)
            .map(|_| ())
            .map_err(SessionError::DatabaseError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(SessionStatus::Abandoned.is_terminal());
        assert!(!SessionStatus::Active.is_terminal());
        assert!(!SessionStatus::Generating.is_terminal());
    }

    #[test]
    fn turn_accepting_states() {
        assert!(SessionStatus::Active.accepts_turns());
        assert!(SessionStatus::Paused.accepts_turns());
        assert!(!SessionStatus::Generating.accepts_turns());
        assert!(!SessionStatus::Completed.accepts_turns());
    }
}
