//! Collaborator traits
//!
//! The engine talks to the account owner, the session store, the dashboard
//! mirror and the push gateway only through these abstractions.

use crate::error::AppError;
use crate::models::{ChargeRates, Decrement, PushAlert, Session, SessionStatus};
use async_trait::async_trait;
use uuid::Uuid;

/// Balance ledger owned by the account collaborator
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Current balance of a requester
    ///
    /// Returns `AppError::AccountNotFound` for unknown ids.
    async fn get_balance(&self, account_id: &str) -> Result<i64, AppError>;

    /// Atomically take `amount` if the balance covers it
    async fn decrement_balance(&self, account_id: &str, amount: i64)
        -> Result<Decrement, AppError>;

    /// Per-interval charges of an expert
    async fn get_charge_rates(&self, expert_id: &str) -> Result<ChargeRates, AppError>;
}

/// Durable session records
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Persist a new session
    async fn insert(&self, session: &Session) -> Result<(), AppError>;

    /// Find session by ID
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Session>, AppError>;

    /// Overwrite the stored session only if its status is still `expected`
    ///
    /// Returns `false` when another writer got there first.
    async fn compare_and_update(
        &self,
        session: &Session,
        expected: SessionStatus,
    ) -> Result<bool, AppError>;

    /// Sessions not yet ended in which the entity participates
    async fn find_open_by_participant(&self, participant_id: &str)
        -> Result<Vec<Session>, AppError>;

    /// All sessions in a given status
    async fn find_by_status(&self, status: SessionStatus) -> Result<Vec<Session>, AppError>;
}

/// Read-only projection of expert state for dashboards
///
/// Never consulted for admission decisions.
#[async_trait]
pub trait StatusMirror: Send + Sync {
    async fn expert_busy(&self, expert_id: &str, session_id: Option<Uuid>)
        -> Result<(), AppError>;

    async fn expert_free(&self, expert_id: &str) -> Result<(), AppError>;

    async fn remaining_intervals(&self, expert_id: &str, remaining: i64)
        -> Result<(), AppError>;
}

/// Mirror used when no dashboard store is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMirror;

#[async_trait]
impl StatusMirror for NoopMirror {
    async fn expert_busy(&self, _: &str, _: Option<Uuid>) -> Result<(), AppError> {
        Ok(())
    }

    async fn expert_free(&self, _: &str) -> Result<(), AppError> {
        Ok(())
    }

    async fn remaining_intervals(&self, _: &str, _: i64) -> Result<(), AppError> {
        Ok(())
    }
}

/// Best-effort push channel for entities without a live connection
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn push_alert(&self, alert: &PushAlert) -> Result<(), AppError>;
}
