//! Account models
//!
//! Accounts are owned by the account collaborator. The engine only reads
//! balances and asks for decrements; it never credits anything.

use crate::models::session::{InteractionKind, Role};
use serde::{Deserialize, Serialize};

/// Per-interval charge of an expert, by interaction kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChargeRates {
    pub chat: i64,
    pub audio: i64,
    pub video: i64,
}

impl ChargeRates {
    pub fn new(chat: i64, audio: i64, video: i64) -> Self {
        Self { chat, audio, video }
    }

    /// A single rate applied to every kind
    pub fn flat(rate: i64) -> Self {
        Self::new(rate, rate, rate)
    }

    pub fn for_kind(&self, kind: InteractionKind) -> i64 {
        match kind {
            InteractionKind::Chat => self.chat,
            InteractionKind::Audio => self.audio,
            InteractionKind::Video => self.video,
        }
    }
}

/// Account record as seen by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub role: Role,
    /// Prepaid balance in integer monetary units
    pub balance: i64,
    /// Only meaningful for experts
    pub charge_rates: ChargeRates,
}

impl Account {
    pub fn requester(id: impl Into<String>, balance: i64) -> Self {
        Self {
            id: id.into(),
            role: Role::Requester,
            balance,
            charge_rates: ChargeRates::default(),
        }
    }

    pub fn expert(id: impl Into<String>, charge_rates: ChargeRates) -> Self {
        Self {
            id: id.into(),
            role: Role::Expert,
            balance: 0,
            charge_rates,
        }
    }
}

/// Result of an atomic balance decrement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decrement {
    /// The amount was taken
    Applied { new_balance: i64 },
    /// Nothing was taken; the balance is below the amount
    Insufficient { available: i64 },
}

/// Whole intervals a balance still covers
///
/// A zero or negative charge means the session is unmetered, which covers
/// zero intervals by definition.
pub fn remaining_intervals(balance: i64, charge_per_interval: i64) -> i64 {
    if charge_per_interval <= 0 || balance <= 0 {
        return 0;
    }
    balance / charge_per_interval
}
