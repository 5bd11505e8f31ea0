use crate::models::schema::{sessions, turns};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum TurnError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] diesel::result::Error),
}

/// One immutable conversational exchange. Ordering by `turn_number` is the
/// sole source of truth for conversation replay.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone, Serialize, Deserialize)]
#[diesel(table_name = turns)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Turn {
    pub id: i64,
    pub session_id: Uuid,
    pub turn_number: i32,
    pub user_message: String,
    pub assistant_message: String,
    pub interaction_mode: String,
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
    pub turn_context: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = turns)]
pub struct NewTurn {
    pub session_id: Uuid,
    pub turn_number: i32,
    pub user_message: String,
    pub assistant_message: String,
    pub interaction_mode: String,
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
    pub turn_context: serde_json::Value,
}

impl Turn {
    pub fn get_for_session(
        conn: &mut PgConnection,
        session_id: Uuid,
    ) -> Result<Vec<Turn>, TurnError> {
        turns::table
            .filter(turns::session_id.eq(session_id))
            .order(turns::turn_number.asc())
            .load::<Turn>(conn)
            .map_err(TurnError::DatabaseError)
    }

    /// Inserts the turn and bumps the session's turn counter and rolling
    /// conversation state in one transaction, so a partial turn can never be
    /// observed.
    pub fn record(
        conn: &mut PgConnection,
        new_turn: NewTurn,
        conversation_state: serde_json::Value,
    ) -> Result<Turn, TurnError> {
        conn.transaction(|conn| {
            let turn: Turn = diesel::insert_into(turns::table)
                .values(&new_turn)
                .get_result(conn)?;

            diesel::update(sessions::table.find(new_turn.session_id))
                .set((
                    sessions::turn_count.eq(sessions::turn_count + 1),
                    sessions::conversation_state.eq(conversation_state),
                    sessions::updated_at.eq(diesel::dsl::now),
                ))
                .execute(conn)?;

            Ok(turn)
        })
        .map_err(TurnError::DatabaseError)
    }
}
