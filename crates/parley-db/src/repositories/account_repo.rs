//! Account store implementation
//!
//! PostgreSQL-backed balance ledger. Decrements are a single conditional
//! UPDATE, so concurrent billing ticks and top-ups never interleave badly.

use async_trait::async_trait;
use parley_core::{
    models::{ChargeRates, Decrement},
    traits::AccountStore,
    AppError, AppResult,
};
use sqlx::PgPool;
use tracing::{debug, error, instrument};

/// PostgreSQL implementation of AccountStore
pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    /// Create a new account store
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountStore for PgAccountStore {
    #[instrument(skip(self))]
    async fn get_balance(&self, account_id: &str) -> AppResult<i64> {
        let balance = sqlx::query_scalar::<_, i64>("SELECT balance FROM accounts WHERE id = $1")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error reading balance of {}: {}", account_id, e);
                AppError::Database(format!("Failed to read balance: {}", e))
            })?;

        balance.ok_or_else(|| AppError::AccountNotFound(account_id.to_string()))
    }

    #[instrument(skip(self))]
    async fn decrement_balance(&self, account_id: &str, amount: i64) -> AppResult<Decrement> {
        let updated = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE accounts
            SET balance = balance - $2,
                updated_at = NOW()
            WHERE id = $1 AND balance >= $2
            RETURNING balance
            "#,
        )
        .bind(account_id)
        .bind(amount)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error decrementing balance of {}: {}", account_id, e);
            AppError::Database(format!("Failed to decrement balance: {}", e))
        })?;

        match updated {
            Some(new_balance) => {
                debug!(account_id, amount, new_balance, "Balance decremented");
                Ok(Decrement::Applied { new_balance })
            }
            None => {
                // Either the row is missing or the guard failed; tell them apart.
                let available = self.get_balance(account_id).await?;
                Ok(Decrement::Insufficient { available })
            }
        }
    }

    #[instrument(skip(self))]
    async fn get_charge_rates(&self, expert_id: &str) -> AppResult<ChargeRates> {
        let row = sqlx::query_as::<_, (i64, i64, i64)>(
            r#"
            SELECT chat_rate, audio_rate, video_rate
            FROM accounts
            WHERE id = $1 AND role = 'expert'
            "#,
        )
        .bind(expert_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error reading rates of {}: {}", expert_id, e);
            AppError::Database(format!("Failed to read charge rates: {}", e))
        })?;

        row.map(|(chat, audio, video)| ChargeRates::new(chat, audio, video))
            .ok_or_else(|| AppError::AccountNotFound(expert_id.to_string()))
    }
}
