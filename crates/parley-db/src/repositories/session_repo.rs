//! Session repository implementation
//!
//! Every state transition is a compare-and-update on `status`, which is what
//! lets a manual end and a billing-driven end race without double effects.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_core::{
    models::{EndReason, InteractionKind, Participant, Role, Session, SessionStatus},
    traits::SessionRepository,
    AppError, AppResult,
};
use sqlx::PgPool;
use tracing::{debug, error, instrument};
use uuid::Uuid;

/// PostgreSQL implementation of SessionRepository
pub struct PgSessionRepository {
    pool: PgPool,
}

impl PgSessionRepository {
    /// Create a new session repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Database row representation
#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    id: Uuid,
    participant_a_id: String,
    participant_a_role: String,
    participant_b_id: String,
    participant_b_role: String,
    kind: String,
    status: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    duration_seconds: Option<i64>,
    end_reason: Option<String>,
}

fn corrupt(id: Uuid, field: &str, value: &str) -> AppError {
    error!("Session {} has invalid {}: {}", id, field, value);
    AppError::Database(format!("Session {} has invalid {}: {}", id, field, value))
}

impl TryFrom<SessionRow> for Session {
    type Error = AppError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let role_a = Role::from_str(&row.participant_a_role)
            .ok_or_else(|| corrupt(row.id, "participant_a_role", &row.participant_a_role))?;
        let role_b = Role::from_str(&row.participant_b_role)
            .ok_or_else(|| corrupt(row.id, "participant_b_role", &row.participant_b_role))?;
        let kind = InteractionKind::from_str(&row.kind)
            .ok_or_else(|| corrupt(row.id, "kind", &row.kind))?;
        let status = SessionStatus::from_str(&row.status)
            .ok_or_else(|| corrupt(row.id, "status", &row.status))?;
        let end_reason = match row.end_reason.as_deref() {
            Some(s) => Some(EndReason::from_str(s).ok_or_else(|| corrupt(row.id, "end_reason", s))?),
            None => None,
        };

        Ok(Session {
            id: row.id,
            participant_a: Participant::new(row.participant_a_id, role_a),
            participant_b: Participant::new(row.participant_b_id, role_b),
            kind,
            status,
            created_at: row.created_at,
            started_at: row.started_at,
            ended_at: row.ended_at,
            duration_seconds: row.duration_seconds,
            end_reason,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, participant_a_id, participant_a_role, participant_b_id, participant_b_role,
           kind, status, created_at, started_at, ended_at, duration_seconds, end_reason
    FROM sessions
"#;

fn into_sessions(rows: Vec<SessionRow>) -> AppResult<Vec<Session>> {
    rows.into_iter().map(Session::try_from).collect()
}

#[async_trait]
impl SessionRepository for PgSessionRepository {
    #[instrument(skip(self, session), fields(session_id = %session.id))]
    async fn insert(&self, session: &Session) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, participant_a_id, participant_a_role, participant_b_id, participant_b_role,
                kind, status, created_at, started_at, ended_at, duration_seconds, end_reason
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(session.id)
        .bind(&session.participant_a.id)
        .bind(session.participant_a.role.to_string())
        .bind(&session.participant_b.id)
        .bind(session.participant_b.role.to_string())
        .bind(session.kind.to_string())
        .bind(session.status.to_string())
        .bind(session.created_at)
        .bind(session.started_at)
        .bind(session.ended_at)
        .bind(session.duration_seconds)
        .bind(session.end_reason.map(|r| r.to_string()))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error inserting session {}: {}", session.id, e);
            AppError::Database(format!("Failed to insert session: {}", e))
        })?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<Session>> {
        let row = sqlx::query_as::<_, SessionRow>(&format!("{} WHERE id = $1", SELECT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error finding session {}: {}", id, e);
                AppError::Database(format!("Failed to find session: {}", e))
            })?;

        row.map(Session::try_from).transpose()
    }

    #[instrument(skip(self, session), fields(session_id = %session.id, to = %session.status))]
    async fn compare_and_update(
        &self,
        session: &Session,
        expected: SessionStatus,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET status = $2,
                started_at = $3,
                ended_at = $4,
                duration_seconds = $5,
                end_reason = $6
            WHERE id = $1 AND status = $7
            "#,
        )
        .bind(session.id)
        .bind(session.status.to_string())
        .bind(session.started_at)
        .bind(session.ended_at)
        .bind(session.duration_seconds)
        .bind(session.end_reason.map(|r| r.to_string()))
        .bind(expected.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error updating session {}: {}", session.id, e);
            AppError::Database(format!("Failed to update session: {}", e))
        })?;

        let applied = result.rows_affected() == 1;
        if !applied {
            debug!("Session {} was no longer {}", session.id, expected);
        }
        Ok(applied)
    }

    #[instrument(skip(self))]
    async fn find_open_by_participant(&self, participant_id: &str) -> AppResult<Vec<Session>> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "{} WHERE status <> 'ended' AND (participant_a_id = $1 OR participant_b_id = $1) ORDER BY created_at",
            SELECT_COLUMNS
        ))
        .bind(participant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error listing sessions of {}: {}", participant_id, e);
            AppError::Database(format!("Failed to list sessions: {}", e))
        })?;

        into_sessions(rows)
    }

    #[instrument(skip(self))]
    async fn find_by_status(&self, status: SessionStatus) -> AppResult<Vec<Session>> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "{} WHERE status = $1 ORDER BY created_at",
            SELECT_COLUMNS
        ))
        .bind(status.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error listing {} sessions: {}", status, e);
            AppError::Database(format!("Failed to list sessions: {}", e))
        })?;

        into_sessions(rows)
    }
}
