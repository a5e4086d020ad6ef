//! Billing scheduler
//!
//! One recurring job per active session. Every interval the job re-reads the
//! payer's balance, takes one interval's charge with a single conditional
//! decrement and recomputes how many whole intervals are left. The job ends
//! itself when the balance can no longer cover an interval.
//!
//! Jobs live in a registry owned by the scheduler and are only reachable
//! through `start`, `stop`, `is_running` and `state`.

use crate::notifier::Notifier;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use parley_core::{
    models::{remaining_intervals, Decrement, OutboundEvent},
    traits::{AccountStore, StatusMirror},
    AppError, AppResult,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// What to bill and whom
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingPlan {
    pub session_id: Uuid,
    pub payer_id: String,
    pub expert_id: String,
    pub charge_per_interval: i64,
}

/// Result of `BillingScheduler::start`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingStart {
    Started { balance: i64, remaining_intervals: i64 },
    /// Zero or negative charge: no job is scheduled
    Unmetered,
    /// The balance does not cover a single interval
    Insufficient { balance: i64 },
}

/// Result of one billing tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Charged { new_balance: i64, remaining_intervals: i64 },
    /// Charged, and the payer was warned
    LowBalance { new_balance: i64, remaining_intervals: i64 },
    /// Terminal. `charged` tells whether this tick still took a charge.
    Exhausted { balance: i64, charged: bool },
    /// The ledger could not be read; retried next interval
    Skipped,
}

/// Receives terminal notifications from billing jobs
#[async_trait]
pub trait BillingObserver: Send + Sync {
    async fn on_exhausted(&self, session_id: Uuid);
}

/// Snapshot of a running job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingState {
    pub session_id: Uuid,
    pub payer_id: String,
    pub expert_id: String,
    pub charge_per_interval: i64,
    pub interval_started_at: DateTime<Utc>,
    pub balance_snapshot: i64,
    pub remaining_intervals: i64,
    pub ticks: u64,
}

impl BillingState {
    fn apply(&mut self, outcome: TickOutcome) {
        match outcome {
            TickOutcome::Charged {
                new_balance,
                remaining_intervals,
            }
            | TickOutcome::LowBalance {
                new_balance,
                remaining_intervals,
            } => {
                self.ticks += 1;
                self.balance_snapshot = new_balance;
                self.remaining_intervals = remaining_intervals;
            }
            TickOutcome::Exhausted { balance, charged } => {
                if charged {
                    self.ticks += 1;
                }
                self.balance_snapshot = balance;
                self.remaining_intervals = 0;
            }
            TickOutcome::Skipped => {}
        }
        self.interval_started_at = Utc::now();
    }
}

/// Per-tick billing logic, independent of scheduling
pub struct Meter {
    accounts: Arc<dyn AccountStore>,
    notifier: Arc<Notifier>,
    mirror: Arc<dyn StatusMirror>,
    low_balance_threshold: i64,
}

impl Meter {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        notifier: Arc<Notifier>,
        mirror: Arc<dyn StatusMirror>,
        low_balance_threshold: i64,
    ) -> Self {
        Self {
            accounts,
            notifier,
            mirror,
            low_balance_threshold,
        }
    }

    /// Bill one interval
    ///
    /// The balance is never driven below zero: when it cannot cover the
    /// charge nothing is taken and the outcome is `Exhausted`.
    #[instrument(skip(self, plan), fields(session_id = %plan.session_id, payer = %plan.payer_id))]
    pub async fn tick(&self, plan: &BillingPlan) -> TickOutcome {
        let rate = plan.charge_per_interval;

        let balance = match self.accounts.get_balance(&plan.payer_id).await {
            Ok(balance) => balance,
            Err(e) if e.is_not_found() => {
                warn!("Payer account vanished, ending session");
                return TickOutcome::Exhausted {
                    balance: 0,
                    charged: false,
                };
            }
            Err(e) => {
                warn!("Balance read failed, skipping this interval: {}", e);
                return TickOutcome::Skipped;
            }
        };

        if balance < rate {
            info!(balance, rate, "Balance below one interval");
            return TickOutcome::Exhausted {
                balance,
                charged: false,
            };
        }

        let new_balance = match self.accounts.decrement_balance(&plan.payer_id, rate).await {
            Ok(Decrement::Applied { new_balance }) => new_balance,
            Ok(Decrement::Insufficient { available }) => {
                // A concurrent debit got there between the read and the decrement.
                info!(available, rate, "Decrement refused");
                return TickOutcome::Exhausted {
                    balance: available,
                    charged: false,
                };
            }
            Err(e) if e.is_not_found() => {
                warn!("Payer account vanished, ending session");
                return TickOutcome::Exhausted {
                    balance: 0,
                    charged: false,
                };
            }
            Err(e) => {
                warn!("Decrement failed, skipping this interval: {}", e);
                return TickOutcome::Skipped;
            }
        };

        let remaining = remaining_intervals(new_balance, rate);
        if let Err(e) = self
            .mirror
            .remaining_intervals(&plan.expert_id, remaining)
            .await
        {
            debug!("Status mirror update failed: {}", e);
        }

        if remaining == 0 {
            info!(new_balance, "Balance exhausted");
            return TickOutcome::Exhausted {
                balance: new_balance,
                charged: true,
            };
        }

        if remaining <= self.low_balance_threshold {
            self.notifier.send(
                &plan.payer_id,
                OutboundEvent::LowBalanceAlert {
                    session_id: plan.session_id,
                    remaining_intervals: remaining,
                    balance: new_balance,
                },
            );
            return TickOutcome::LowBalance {
                new_balance,
                remaining_intervals: remaining,
            };
        }

        debug!(new_balance, remaining, "Interval charged");
        TickOutcome::Charged {
            new_balance,
            remaining_intervals: remaining,
        }
    }
}

struct BillingJob {
    generation: u64,
    cancel: CancellationToken,
    state: Arc<Mutex<BillingState>>,
    handle: JoinHandle<()>,
}

type JobRegistry = Arc<Mutex<HashMap<Uuid, BillingJob>>>;

pub struct BillingScheduler {
    meter: Arc<Meter>,
    period: Duration,
    jobs: JobRegistry,
    generations: AtomicU64,
}

impl BillingScheduler {
    pub fn new(meter: Meter, period: Duration) -> Self {
        Self {
            meter: Arc::new(meter),
            period,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            generations: AtomicU64::new(0),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Schedule the recurring job for a session
    ///
    /// The first charge falls one full interval after the start. Starting a
    /// session that already has a job is a `Conflict`.
    #[instrument(skip(self, plan, observer), fields(session_id = %plan.session_id))]
    pub async fn start(
        &self,
        plan: BillingPlan,
        observer: Arc<dyn BillingObserver>,
    ) -> AppResult<BillingStart> {
        if plan.charge_per_interval <= 0 {
            info!("Unmetered session, billing not scheduled");
            return Ok(BillingStart::Unmetered);
        }
        if self.is_running(plan.session_id) {
            return Err(duplicate(plan.session_id));
        }

        let balance = self.meter.accounts.get_balance(&plan.payer_id).await?;
        if balance < plan.charge_per_interval {
            info!(balance, rate = plan.charge_per_interval, "Balance below one interval at start");
            return Ok(BillingStart::Insufficient { balance });
        }
        let remaining = remaining_intervals(balance, plan.charge_per_interval);

        {
            let mut jobs = self.jobs.lock();
            if jobs.contains_key(&plan.session_id) {
                return Err(duplicate(plan.session_id));
            }

            let state = Arc::new(Mutex::new(BillingState {
                session_id: plan.session_id,
                payer_id: plan.payer_id.clone(),
                expert_id: plan.expert_id.clone(),
                charge_per_interval: plan.charge_per_interval,
                interval_started_at: Utc::now(),
                balance_snapshot: balance,
                remaining_intervals: remaining,
                ticks: 0,
            }));
            let cancel = CancellationToken::new();
            let generation = self.generations.fetch_add(1, Ordering::Relaxed);

            let handle = tokio::spawn(run_job(
                Arc::clone(&self.meter),
                Arc::clone(&self.jobs),
                plan.clone(),
                Arc::clone(&state),
                cancel.clone(),
                generation,
                self.period,
                observer,
            ));

            jobs.insert(
                plan.session_id,
                BillingJob {
                    generation,
                    cancel,
                    state,
                    handle,
                },
            );
        }

        if let Err(e) = self
            .meter
            .mirror
            .remaining_intervals(&plan.expert_id, remaining)
            .await
        {
            debug!("Status mirror update failed: {}", e);
        }

        info!(balance, remaining, "Billing started");
        Ok(BillingStart::Started {
            balance,
            remaining_intervals: remaining,
        })
    }

    /// Cancel a session's job and wait for it to exit
    ///
    /// A tick already in flight finishes before this returns, so no charge
    /// lands afterwards. Must not be awaited from inside the job itself.
    pub async fn stop(&self, session_id: Uuid) -> bool {
        let job = self.jobs.lock().remove(&session_id);
        let Some(job) = job else {
            return false;
        };
        job.cancel.cancel();
        if let Err(e) = job.handle.await {
            warn!(session_id = %session_id, "Billing job did not exit cleanly: {}", e);
        }
        debug!(session_id = %session_id, "Billing stopped");
        true
    }

    pub fn is_running(&self, session_id: Uuid) -> bool {
        self.jobs.lock().contains_key(&session_id)
    }

    pub fn state(&self, session_id: Uuid) -> Option<BillingState> {
        self.jobs
            .lock()
            .get(&session_id)
            .map(|job| job.state.lock().clone())
    }

    /// Remaining intervals of the job billing against an expert
    pub fn remaining_for_expert(&self, expert_id: &str) -> Option<i64> {
        self.jobs.lock().values().find_map(|job| {
            let state = job.state.lock();
            (state.expert_id == expert_id).then_some(state.remaining_intervals)
        })
    }

    pub fn running(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Cancel every job
    pub fn shutdown(&self) {
        let mut jobs = self.jobs.lock();
        for (_, job) in jobs.drain() {
            job.cancel.cancel();
        }
    }
}

fn duplicate(session_id: Uuid) -> AppError {
    AppError::Conflict(format!("billing already running for session {}", session_id))
}

#[allow(clippy::too_many_arguments)]
async fn run_job(
    meter: Arc<Meter>,
    jobs: JobRegistry,
    plan: BillingPlan,
    state: Arc<Mutex<BillingState>>,
    cancel: CancellationToken,
    generation: u64,
    period: Duration,
    observer: Arc<dyn BillingObserver>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(session_id = %plan.session_id, "Billing job cancelled");
                break;
            }
            _ = ticker.tick() => {
                let outcome = meter.tick(&plan).await;
                state.lock().apply(outcome);

                if let TickOutcome::Exhausted { .. } = outcome {
                    {
                        let mut jobs = jobs.lock();
                        if jobs.get(&plan.session_id).map(|j| j.generation) == Some(generation) {
                            jobs.remove(&plan.session_id);
                        }
                    }
                    observer.on_exhausted(plan.session_id).await;
                    break;
                }
            }
        }
    }
}
