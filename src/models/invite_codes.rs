use crate::models::schema::invite_codes;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InviteCodeError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] diesel::result::Error),
    #[error("Invite code not found")]
    NotFound,
    #[error("Invite code has expired")]
    Expired,
    #[error("Invite code has been deactivated")]
    Inactive,
    #[error("Invite code has no remaining uses")]
    Exhausted,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone, Serialize, Deserialize)]
#[diesel(table_name = invite_codes)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct InviteCode {
    pub id: i32,
    pub code: String,
    pub admin_email: String,
    pub bound_email: Option<String>,
    pub max_uses: i32,
    pub current_uses: i32,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl InviteCode {
    pub fn get_by_id(conn: &mut PgConnection, id: i32) -> Result<InviteCode, InviteCodeError> {
        invite_codes::table
            .find(id)
            .first::<InviteCode>(conn)
            .map_err(|e| match e {
                diesel::result::Error::NotFound => InviteCodeError::NotFound,
                _ => InviteCodeError::DatabaseError(e),
            })
    }

    /// Redeems an invite code with a single conditional UPDATE. The usage
    /// counter only moves when the code is active, unexpired, and still has
    /// budget, so concurrent redemptions of a nearly exhausted code cannot
    /// push `current_uses` past `max_uses`.
    pub fn redeem(conn: &mut PgConnection, code: &str) -> Result<InviteCode, InviteCodeError> {
        let redeemed = diesel::update(
            invite_codes::table
                .filter(invite_codes::code.eq(code))
                .filter(invite_codes::active.eq(true))
                .filter(invite_codes::expires_at.gt(diesel::dsl::now))
                .filter(invite_codes::current_uses.lt(invite_codes::max_uses)),
        )
        .set(invite_codes::current_uses.eq(invite_codes::current_uses + 1))
        .get_result::<InviteCode>(conn)
        .optional()?;

        match redeemed {
            Some(invite) => Ok(invite),
            // The guarded update matched nothing. Re-read the row so the
            // caller gets a precise rejection reason.
            None => {
                let invite = invite_codes::table
                    .filter(invite_codes::code.eq(code))
                    .first::<InviteCode>(conn)
                    .map_err(|e| match e {
                        diesel::result::Error::NotFound => InviteCodeError::NotFound,
                        _ => InviteCodeError::DatabaseError(e),
                    })?;

                Err(invite.unusable_reason())
            }
        }
    }

    /// Rejection reason for a code the guarded update refused to touch. A
    /// code is usable iff active, unexpired, and under its usage budget;
    /// checks mirror the update's filters in order of precedence.
    fn unusable_reason(&self) -> InviteCodeError {
        if !self.active {
            InviteCodeError::Inactive
        } else if self.expires_at <= Utc::now() {
            InviteCodeError::Expired
        } else {
            InviteCodeError::Exhausted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn invite(max_uses: i32, current_uses: i32, active: bool, expired: bool) -> InviteCode {
        let now = Utc::now();
        InviteCode {
            id: 1,
            code: "welcome-2026".to_string(),
            admin_email: "admin@example.com".to_string(),
            bound_email: None,
            max_uses,
            current_uses,
            expires_at: if expired {
                now - Duration::hours(1)
            } else {
                now + Duration::hours(24)
            },
            active,
            created_at: now,
        }
    }

    #[test]
    fn exhausted_code_is_rejected_as_exhausted() {
        assert!(matches!(
            invite(1, 1, true, false).unusable_reason(),
            InviteCodeError::Exhausted
        ));
        assert!(matches!(
            invite(5, 5, true, false).unusable_reason(),
            InviteCodeError::Exhausted
        ));
    }

    #[test]
    fn inactive_wins_over_other_reasons() {
        assert!(matches!(
            invite(1, 1, false, true).unusable_reason(),
            InviteCodeError::Inactive
        ));
    }

    #[test]
    fn expired_code_is_rejected_as_expired() {
        assert!(matches!(
            invite(1, 0, true, true).unusable_reason(),
            InviteCodeError::Expired
        ));
    }
}
