//! In-memory stores
//!
//! Used when no database URL is configured, and by the engine tests.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use parley_core::{
    models::{Account, ChargeRates, Decrement, Role, Session, SessionStatus},
    traits::{AccountStore, SessionRepository},
    AppError, AppResult,
};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

/// Account ledger held in a single map
#[derive(Default)]
pub struct InMemoryAccountStore {
    accounts: Mutex<HashMap<String, Account>>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_accounts(accounts: impl IntoIterator<Item = Account>) -> Self {
        let store = Self::new();
        for account in accounts {
            store.insert(account);
        }
        store
    }

    /// Load a JSON array of accounts
    pub fn from_seed_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let accounts: Vec<Account> = serde_json::from_str(&raw)?;
        info!("Seeded {} accounts from {}", accounts.len(), path.display());
        Ok(Self::from_accounts(accounts))
    }

    /// Insert or replace an account
    pub fn insert(&self, account: Account) {
        self.accounts.lock().insert(account.id.clone(), account);
    }

    /// Top up a balance; the only way money comes back in
    pub fn credit(&self, account_id: &str, amount: i64) -> AppResult<i64> {
        let mut accounts = self.accounts.lock();
        let account = accounts
            .get_mut(account_id)
            .ok_or_else(|| AppError::AccountNotFound(account_id.to_string()))?;
        account.balance += amount;
        Ok(account.balance)
    }

    pub fn balance_of(&self, account_id: &str) -> Option<i64> {
        self.accounts.lock().get(account_id).map(|a| a.balance)
    }

    pub fn len(&self) -> usize {
        self.accounts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.lock().is_empty()
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn get_balance(&self, account_id: &str) -> AppResult<i64> {
        self.balance_of(account_id)
            .ok_or_else(|| AppError::AccountNotFound(account_id.to_string()))
    }

    async fn decrement_balance(&self, account_id: &str, amount: i64) -> AppResult<Decrement> {
        let mut accounts = self.accounts.lock();
        let account = accounts
            .get_mut(account_id)
            .ok_or_else(|| AppError::AccountNotFound(account_id.to_string()))?;

        if account.balance < amount {
            return Ok(Decrement::Insufficient {
                available: account.balance,
            });
        }

        account.balance -= amount;
        debug!(account_id, amount, new_balance = account.balance, "Balance decremented");
        Ok(Decrement::Applied {
            new_balance: account.balance,
        })
    }

    async fn get_charge_rates(&self, expert_id: &str) -> AppResult<ChargeRates> {
        self.accounts
            .lock()
            .get(expert_id)
            .filter(|a| a.role == Role::Expert)
            .map(|a| a.charge_rates)
            .ok_or_else(|| AppError::AccountNotFound(expert_id.to_string()))
    }
}

/// Session records keyed by id
#[derive(Default)]
pub struct InMemorySessionRepository {
    sessions: RwLock<HashMap<Uuid, Session>>,
}

impl InMemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn insert(&self, session: &Session) -> AppResult<()> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&session.id) {
            return Err(AppError::Conflict(format!(
                "session {} already exists",
                session.id
            )));
        }
        sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<Session>> {
        Ok(self.sessions.read().get(&id).cloned())
    }

    async fn compare_and_update(
        &self,
        session: &Session,
        expected: SessionStatus,
    ) -> AppResult<bool> {
        let mut sessions = self.sessions.write();
        match sessions.get_mut(&session.id) {
            Some(stored) if stored.status == expected => {
                *stored = session.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(AppError::SessionNotFound(session.id.to_string())),
        }
    }

    async fn find_open_by_participant(&self, participant_id: &str) -> AppResult<Vec<Session>> {
        let mut open: Vec<Session> = self
            .sessions
            .read()
            .values()
            .filter(|s| !s.is_ended() && s.involves(participant_id))
            .cloned()
            .collect();
        open.sort_by_key(|s| s.created_at);
        Ok(open)
    }

    async fn find_by_status(&self, status: SessionStatus) -> AppResult<Vec<Session>> {
        let mut found: Vec<Session> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect();
        found.sort_by_key(|s| s.created_at);
        Ok(found)
    }
}
