//! End-to-end engine tests over the in-memory stores

use async_trait::async_trait;
use parking_lot::Mutex;
use parley_core::models::{
    duration_seconds, Account, ChargeRates, Decrement, EndReason, InteractionKind,
    OutboundEvent, Participant, PushAlert, Session, SessionStatus,
};
use parley_core::traits::{AccountStore, NoopMirror, NotificationGateway, SessionRepository};
use parley_core::{AppError, AppResult};
use parley_db::{InMemoryAccountStore, InMemorySessionRepository};
use parley_services::{
    ChannelHandle, EndOutcome, EngineSettings, EventReceiver, InitiateOutcome, PresenceRegistry,
    SessionManager, SessionRequest,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Default)]
struct RecordingGateway {
    alerts: Mutex<Vec<PushAlert>>,
}

#[async_trait]
impl NotificationGateway for RecordingGateway {
    async fn push_alert(&self, alert: &PushAlert) -> AppResult<()> {
        self.alerts.lock().push(alert.clone());
        Ok(())
    }
}

impl RecordingGateway {
    fn targets(&self) -> Vec<String> {
        self.alerts.lock().iter().map(|a| a.target_id.clone()).collect()
    }
}

/// Account store whose next balance read parks until released
struct GatedAccounts {
    inner: InMemoryAccountStore,
    armed: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl GatedAccounts {
    fn new(accounts: Vec<Account>) -> Self {
        Self {
            inner: InMemoryAccountStore::from_accounts(accounts),
            armed: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }

    fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl AccountStore for GatedAccounts {
    async fn get_balance(&self, account_id: &str) -> AppResult<i64> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.get_balance(account_id).await
    }

    async fn decrement_balance(&self, account_id: &str, amount: i64) -> AppResult<Decrement> {
        self.inner.decrement_balance(account_id, amount).await
    }

    async fn get_charge_rates(&self, expert_id: &str) -> AppResult<ChargeRates> {
        self.inner.get_charge_rates(expert_id).await
    }
}

struct Harness {
    accounts: Arc<InMemoryAccountStore>,
    sessions: Arc<InMemorySessionRepository>,
    gateway: Arc<RecordingGateway>,
    manager: Arc<SessionManager>,
}

fn settings() -> EngineSettings {
    EngineSettings {
        billing_interval: Duration::from_secs(60),
        low_balance_threshold: 2,
        minimum_required_intervals: 1,
        disconnect_grace: Duration::from_secs(30),
    }
}

fn harness(accounts: Vec<Account>) -> Harness {
    harness_with_sessions(accounts, Arc::new(InMemorySessionRepository::new()))
}

fn harness_with_sessions(
    accounts: Vec<Account>,
    sessions: Arc<InMemorySessionRepository>,
) -> Harness {
    harness_with(accounts, sessions, settings())
}

fn harness_with(
    accounts: Vec<Account>,
    sessions: Arc<InMemorySessionRepository>,
    settings: EngineSettings,
) -> Harness {
    let accounts = Arc::new(InMemoryAccountStore::from_accounts(accounts));
    let gateway = Arc::new(RecordingGateway::default());
    let manager = SessionManager::new(
        accounts.clone(),
        sessions.clone(),
        Arc::new(PresenceRegistry::new()),
        gateway.clone(),
        Arc::new(NoopMirror),
        settings,
    );
    Harness {
        accounts,
        sessions,
        gateway,
        manager,
    }
}

fn default_accounts() -> Vec<Account> {
    vec![
        Account::requester("u1", 100),
        Account::requester("u2", 1000),
        Account::requester("u3", 1000),
        Account::expert("e1", ChargeRates::new(30, 40, 50)),
    ]
}

impl Harness {
    fn connect(&self, entity_id: &str) -> (ChannelHandle, EventReceiver) {
        let (handle, rx) = ChannelHandle::open();
        self.manager.on_connect(entity_id, handle.clone());
        (handle, rx)
    }

    async fn open_active(&self, requester: &str, expert: &str, kind: InteractionKind) -> Session {
        let session = match self
            .manager
            .initiate(request(requester, expert, kind))
            .await
            .unwrap()
        {
            InitiateOutcome::Invited(session) => session,
            other => panic!("expected an invitation, got {:?}", other),
        };
        self.manager.accept(session.id, expert).await.unwrap()
    }
}

fn request(requester: &str, expert: &str, kind: InteractionKind) -> SessionRequest {
    SessionRequest {
        initiator: Participant::requester(requester),
        target: Participant::expert(expert),
        kind,
    }
}

fn drain(rx: &mut EventReceiver) -> Vec<OutboundEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn ended_events(events: &[OutboundEvent]) -> Vec<EndReason> {
    events
        .iter()
        .filter_map(|e| match e {
            OutboundEvent::SessionEnded { reason, .. } => Some(*reason),
            _ => None,
        })
        .collect()
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn balance_runs_out_after_three_intervals() {
    let h = harness(default_accounts());
    let (_u1, mut u1_rx) = h.connect("u1");
    let (_e1, mut e1_rx) = h.connect("e1");

    let session = h.open_active("u1", "e1", InteractionKind::Chat).await;
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(
        h.manager.billing().state(session.id).unwrap().remaining_intervals,
        3
    );
    drain(&mut u1_rx);

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(h.accounts.balance_of("u1"), Some(70));
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.accounts.balance_of("u1"), Some(40));
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.accounts.balance_of("u1"), Some(10));

    let stored = h.manager.get_session(session.id).await.unwrap();
    assert_eq!(stored.status, SessionStatus::Ended);
    assert_eq!(stored.end_reason, Some(EndReason::LowBalance));
    assert!(!h.manager.billing().is_running(session.id));
    assert!(!h.manager.expert_status("e1").busy);

    let events = drain(&mut u1_rx);
    let warnings: Vec<i64> = events
        .iter()
        .filter_map(|e| match e {
            OutboundEvent::LowBalanceAlert {
                remaining_intervals,
                ..
            } => Some(*remaining_intervals),
            _ => None,
        })
        .collect();
    assert_eq!(warnings, vec![2, 1]);
    assert_eq!(ended_events(&events), vec![EndReason::LowBalance]);
    assert_eq!(ended_events(&drain(&mut e1_rx)), vec![EndReason::LowBalance]);

    // No further deduction once the job is gone.
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(h.accounts.balance_of("u1"), Some(10));
}

#[tokio::test]
async fn queued_requester_gets_its_turn() {
    let h = harness(default_accounts());
    let (_u1, mut u1_rx) = h.connect("u1");
    let (_u2, _u2_rx) = h.connect("u2");
    let (_e1, mut e1_rx) = h.connect("e1");

    let current = h.open_active("u2", "e1", InteractionKind::Video).await;

    let outcome = h
        .manager
        .initiate(request("u1", "e1", InteractionKind::Chat))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        InitiateOutcome::Queued {
            expert_id: "e1".to_string(),
            position: 1
        }
    );
    assert!(drain(&mut u1_rx)
        .iter()
        .any(|e| matches!(e, OutboundEvent::Queued { position: 1, .. })));
    drain(&mut e1_rx);

    h.manager.end_by(current.id, "e1").await.unwrap();

    let events = drain(&mut u1_rx);
    assert_eq!(
        events,
        vec![OutboundEvent::YourTurn {
            expert_id: "e1".to_string(),
            kind: InteractionKind::Chat
        }]
    );
    assert!(h.manager.queue_for("e1").is_empty());

    let snapshot = drain(&mut e1_rx)
        .into_iter()
        .find_map(|e| match e {
            OutboundEvent::QueueSnapshot { entries, .. } => Some(entries),
            _ => None,
        })
        .unwrap();
    assert!(snapshot.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_admit_exactly_one() {
    let h = harness(default_accounts());
    let _conns: Vec<_> = ["u2", "u3", "e1"].iter().map(|id| h.connect(id)).collect();

    let a = {
        let manager = h.manager.clone();
        tokio::spawn(async move { manager.initiate(request("u2", "e1", InteractionKind::Chat)).await })
    };
    let b = {
        let manager = h.manager.clone();
        tokio::spawn(async move { manager.initiate(request("u3", "e1", InteractionKind::Chat)).await })
    };

    let outcomes = [a.await.unwrap().unwrap(), b.await.unwrap().unwrap()];
    let invited = outcomes
        .iter()
        .filter(|o| matches!(o, InitiateOutcome::Invited(_)))
        .count();
    let queued = outcomes
        .iter()
        .filter(|o| matches!(o, InitiateOutcome::Queued { position: 1, .. }))
        .count();

    assert_eq!(invited, 1);
    assert_eq!(queued, 1);
    assert_eq!(h.manager.queue_for("e1").len(), 1);
    assert!(h.manager.expert_status("e1").busy);
}

#[tokio::test(start_paused = true)]
async fn zero_rate_is_never_billed() {
    let h = harness(vec![
        Account::requester("u1", 100),
        Account::expert("e1", ChargeRates::new(0, 40, 50)),
    ]);
    let (_u1, _u1_rx) = h.connect("u1");
    let (_e1, _e1_rx) = h.connect("e1");

    let session = h.open_active("u1", "e1", InteractionKind::Chat).await;
    assert!(!h.manager.billing().is_running(session.id));

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(h.accounts.balance_of("u1"), Some(100));
    assert_eq!(
        h.manager.get_session(session.id).await.unwrap().status,
        SessionStatus::Active
    );

    let ended = h.manager.end_by(session.id, "u1").await.unwrap();
    assert_eq!(ended.session().end_reason, Some(EndReason::Manual));
}

#[tokio::test]
async fn at_most_one_active_session_per_expert() {
    let h = harness(default_accounts());
    let _conns: Vec<_> = ["u1", "u2", "u3", "e1"].iter().map(|id| h.connect(id)).collect();

    let first = h.open_active("u2", "e1", InteractionKind::Audio).await;
    for requester in ["u1", "u3"] {
        let outcome = h
            .manager
            .initiate(request(requester, "e1", InteractionKind::Audio))
            .await
            .unwrap();
        assert!(matches!(outcome, InitiateOutcome::Queued { .. }));
    }

    let active = h.sessions.find_by_status(SessionStatus::Active).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, first.id);

    // The expert cannot start a second session on its own either.
    let err = h
        .manager
        .initiate(SessionRequest {
            initiator: Participant::expert("e1"),
            target: Participant::requester("u3"),
            kind: InteractionKind::Chat,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
}

#[tokio::test]
async fn requeueing_does_not_duplicate() {
    let h = harness(default_accounts());
    let _conns: Vec<_> = ["u1", "u2", "e1"].iter().map(|id| h.connect(id)).collect();
    h.open_active("u2", "e1", InteractionKind::Chat).await;

    for _ in 0..3 {
        let outcome = h
            .manager
            .initiate(request("u1", "e1", InteractionKind::Chat))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            InitiateOutcome::Queued {
                expert_id: "e1".to_string(),
                position: 1
            }
        );
    }
    assert_eq!(h.manager.queue_for("e1").len(), 1);
    assert_eq!(h.manager.expert_status("e1").queue_length, 1);
}

#[tokio::test(start_paused = true)]
async fn balance_decreases_by_rate_each_interval_and_never_below_zero() {
    let h = harness(vec![
        Account::requester("u1", 250),
        Account::expert("e1", ChargeRates::flat(40)),
    ]);
    let (_u1, _u1_rx) = h.connect("u1");
    let (_e1, _e1_rx) = h.connect("e1");
    let session = h.open_active("u1", "e1", InteractionKind::Audio).await;

    // Stay one second behind each tick.
    tokio::time::sleep(Duration::from_secs(1)).await;
    for n in 1..=5 {
        tokio::time::sleep(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(h.accounts.balance_of("u1"), Some(250 - n * 40));
    }

    // 50 left: the sixth interval takes 40 and leaves less than one interval.
    tokio::time::sleep(Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(h.accounts.balance_of("u1"), Some(10));
    let stored = h.manager.get_session(session.id).await.unwrap();
    assert_eq!(stored.end_reason, Some(EndReason::LowBalance));

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(h.accounts.balance_of("u1"), Some(10));
}

#[tokio::test]
async fn duration_is_fixed_once() {
    let h = harness(default_accounts());
    let (_u1, mut u1_rx) = h.connect("u1");
    let (_e1, _e1_rx) = h.connect("e1");

    let session = h.open_active("u1", "e1", InteractionKind::Chat).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    let first = h.manager.end_by(session.id, "u1").await.unwrap();
    let ended = first.session().clone();
    let expected = duration_seconds(ended.started_at.unwrap(), ended.ended_at.unwrap());
    assert_eq!(ended.duration_seconds, Some(expected));

    let second = h.manager.end(session.id, EndReason::LowBalance).await.unwrap();
    assert!(matches!(second, EndOutcome::AlreadyEnded(_)));
    assert_eq!(second.session().duration_seconds, Some(expected));
    assert_eq!(second.session().end_reason, Some(EndReason::Manual));

    assert_eq!(ended_events(&drain(&mut u1_rx)), vec![EndReason::Manual]);
}

#[tokio::test]
async fn exactly_one_promotion_per_freed_slot() {
    let h = harness(default_accounts());
    let (_u1, mut u1_rx) = h.connect("u1");
    let (_u2, _u2_rx) = h.connect("u2");
    let (_u3, mut u3_rx) = h.connect("u3");
    let (_e1, _e1_rx) = h.connect("e1");

    let current = h.open_active("u2", "e1", InteractionKind::Chat).await;
    h.manager
        .initiate(request("u1", "e1", InteractionKind::Video))
        .await
        .unwrap();
    h.manager
        .initiate(request("u3", "e1", InteractionKind::Audio))
        .await
        .unwrap();
    drain(&mut u1_rx);
    drain(&mut u3_rx);

    h.manager.end(current.id, EndReason::Manual).await.unwrap();
    h.manager.end(current.id, EndReason::Manual).await.unwrap();

    let turns = |events: Vec<OutboundEvent>| {
        events
            .into_iter()
            .filter(|e| matches!(e, OutboundEvent::YourTurn { .. }))
            .count()
    };
    assert_eq!(turns(drain(&mut u1_rx)), 1);
    assert_eq!(turns(drain(&mut u3_rx)), 0);

    let queue = h.manager.queue_for("e1");
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].requester_id, "u3");
}

#[tokio::test]
async fn promoted_requester_offline_is_dropped_and_alerted() {
    let h = harness(default_accounts());
    let (_u2, _u2_rx) = h.connect("u2");
    let (_e1, _e1_rx) = h.connect("e1");
    let (_u1, u1_rx) = h.connect("u1");

    let current = h.open_active("u2", "e1", InteractionKind::Chat).await;
    h.manager
        .initiate(request("u1", "e1", InteractionKind::Chat))
        .await
        .unwrap();
    drop(u1_rx);

    h.manager.end(current.id, EndReason::Manual).await.unwrap();
    settle().await;

    assert!(h.manager.queue_for("e1").is_empty());
    assert!(h.gateway.targets().contains(&"u1".to_string()));
}

#[tokio::test]
async fn minimum_balance_gate_has_no_side_effects() {
    let h = harness(vec![
        Account::requester("u1", 10),
        Account::expert("e1", ChargeRates::flat(30)),
    ]);
    let (_u1, _u1_rx) = h.connect("u1");
    let (_e1, _e1_rx) = h.connect("e1");

    let err = h
        .manager
        .initiate(request("u1", "e1", InteractionKind::Chat))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::InsufficientBalance {
            required: 30,
            available: 10
        }
    ));
    assert!(!h.manager.expert_status("e1").busy);
    assert!(h.sessions.is_empty());
}

#[tokio::test]
async fn invalid_requests_are_rejected_up_front() {
    let h = harness(default_accounts());

    let same_role = SessionRequest {
        initiator: Participant::requester("u1"),
        target: Participant::requester("u2"),
        kind: InteractionKind::Chat,
    };
    assert!(matches!(
        h.manager.initiate(same_role).await,
        Err(AppError::Validation(_))
    ));

    assert!(matches!(
        h.manager
            .initiate(request("u1", "nobody", InteractionKind::Chat))
            .await,
        Err(AppError::AccountNotFound(_))
    ));
    assert!(h.sessions.is_empty());
}

#[tokio::test]
async fn offline_receiver_closes_the_invitation() {
    let h = harness(default_accounts());
    let (_u1, mut u1_rx) = h.connect("u1");

    let outcome = h
        .manager
        .initiate(request("u1", "e1", InteractionKind::Chat))
        .await
        .unwrap();
    let session = match outcome {
        InitiateOutcome::ReceiverOffline(session) => session,
        other => panic!("expected receiver offline, got {:?}", other),
    };

    assert_eq!(session.status, SessionStatus::Ended);
    assert_eq!(session.end_reason, Some(EndReason::Unreachable));
    assert_eq!(session.duration_seconds, Some(0));
    assert!(!h.manager.expert_status("e1").busy);
    assert_eq!(ended_events(&drain(&mut u1_rx)), vec![EndReason::Unreachable]);

    settle().await;
    assert!(h.gateway.targets().contains(&"e1".to_string()));
}

#[tokio::test]
async fn reject_only_applies_to_invitations() {
    let h = harness(default_accounts());
    let _conns: Vec<_> = ["u1", "u2", "e1"].iter().map(|id| h.connect(id)).collect();

    let invited = match h
        .manager
        .initiate(request("u1", "e1", InteractionKind::Chat))
        .await
        .unwrap()
    {
        InitiateOutcome::Invited(s) => s,
        other => panic!("unexpected {:?}", other),
    };

    assert!(matches!(
        h.manager.reject(invited.id, "u1").await,
        Err(AppError::Validation(_))
    ));
    let rejected = h.manager.reject(invited.id, "e1").await.unwrap();
    assert_eq!(rejected.end_reason, Some(EndReason::Rejected));
    assert_eq!(rejected.duration_seconds, Some(0));
    assert!(rejected.started_at.is_none());

    let active = h.open_active("u2", "e1", InteractionKind::Chat).await;
    assert!(matches!(
        h.manager.reject(active.id, "e1").await,
        Err(AppError::Conflict(_))
    ));
    assert!(matches!(
        h.manager.accept(active.id, "e1").await,
        Err(AppError::Conflict(_))
    ));
}

#[tokio::test]
async fn accept_with_drained_balance_ends_immediately() {
    let h = harness(vec![
        Account::requester("u1", 30),
        Account::expert("e1", ChargeRates::flat(30)),
    ]);
    let (_u1, _u1_rx) = h.connect("u1");
    let (_e1, _e1_rx) = h.connect("e1");

    let invited = match h
        .manager
        .initiate(request("u1", "e1", InteractionKind::Chat))
        .await
        .unwrap()
    {
        InitiateOutcome::Invited(s) => s,
        other => panic!("unexpected {:?}", other),
    };

    h.accounts.decrement_balance("u1", 20).await.unwrap();

    let session = h.manager.accept(invited.id, "e1").await.unwrap();
    assert_eq!(session.status, SessionStatus::Ended);
    assert_eq!(session.end_reason, Some(EndReason::LowBalance));
    assert!(!h.manager.billing().is_running(invited.id));
    assert_eq!(h.accounts.balance_of("u1"), Some(10));
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let h = harness(default_accounts());
    let missing = Uuid::new_v4();

    assert!(matches!(
        h.manager.end(missing, EndReason::Manual).await,
        Err(AppError::SessionNotFound(_))
    ));
    assert!(matches!(
        h.manager.accept(missing, "e1").await,
        Err(AppError::SessionNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn disconnect_ends_sessions_after_grace() {
    let h = harness(default_accounts());
    let (u1, u1_rx) = h.connect("u1");
    let (_e1, mut e1_rx) = h.connect("e1");
    let session = h.open_active("u1", "e1", InteractionKind::Chat).await;
    drain(&mut e1_rx);

    drop(u1_rx);
    let grace = h.manager.on_disconnect(u1.connection_id()).unwrap();
    grace.await.unwrap();

    let stored = h.manager.get_session(session.id).await.unwrap();
    assert_eq!(stored.end_reason, Some(EndReason::Unreachable));
    assert_eq!(ended_events(&drain(&mut e1_rx)), vec![EndReason::Unreachable]);
    assert!(!h.manager.expert_status("e1").busy);
}

#[tokio::test(start_paused = true)]
async fn reconnect_within_grace_keeps_the_session() {
    let h = harness(default_accounts());
    let (u1, u1_rx) = h.connect("u1");
    let (_e1, _e1_rx) = h.connect("e1");
    let session = h.open_active("u1", "e1", InteractionKind::Chat).await;

    drop(u1_rx);
    let grace = h.manager.on_disconnect(u1.connection_id()).unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    let (_u1_again, _u1_rx_again) = h.connect("u1");
    grace.await.unwrap();

    assert_eq!(
        h.manager.get_session(session.id).await.unwrap().status,
        SessionStatus::Active
    );
    assert!(h.manager.on_disconnect(u1.connection_id()).is_none());
}

async fn stored_active_session(sessions: &InMemorySessionRepository) -> Session {
    let active = Session::new(
        Participant::requester("u2"),
        Participant::expert("e1"),
        InteractionKind::Chat,
    )
    .unwrap()
    .to_started(chrono::Utc::now())
    .unwrap();
    sessions.insert(&active).await.unwrap();
    active
}

#[tokio::test(start_paused = true)]
async fn recover_rebuilds_slots_and_billing() {
    let sessions = Arc::new(InMemorySessionRepository::new());
    let active = stored_active_session(&sessions).await;

    let pending = Session::new(
        Participant::expert("e2"),
        Participant::requester("u3"),
        InteractionKind::Audio,
    )
    .unwrap();
    sessions.insert(&pending).await.unwrap();

    let mut accounts = default_accounts();
    accounts.push(Account::expert("e2", ChargeRates::flat(10)));
    let h = harness_with_sessions(accounts, sessions);

    let report = h.manager.recover().await.unwrap();
    assert_eq!(report.resumed, 1);
    assert_eq!(report.ended, 1);
    assert_eq!(report.awaiting_reconnect, 2);

    let status = h.manager.expert_status("e1");
    assert!(status.busy);
    assert_eq!(status.session_id, Some(active.id));
    assert!(h.manager.billing().is_running(active.id));
    assert!(!h.manager.expert_status("e2").busy);

    let closed = h.manager.get_session(pending.id).await.unwrap();
    assert_eq!(closed.end_reason, Some(EndReason::Unreachable));

    // Both parties come back within the grace period.
    tokio::time::sleep(Duration::from_secs(5)).await;
    let (_u2, _u2_rx) = h.connect("u2");
    let (_e1, _e1_rx) = h.connect("e1");

    // Billing resumes on a fresh interval from the recovery point.
    tokio::time::sleep(Duration::from_secs(56)).await;
    settle().await;
    assert_eq!(h.accounts.balance_of("u2"), Some(970));
    assert_eq!(
        h.manager.get_session(active.id).await.unwrap().status,
        SessionStatus::Active
    );
    h.manager.shutdown();
}

#[tokio::test(start_paused = true)]
async fn recovered_session_nobody_returns_to_ends_after_grace() {
    let sessions = Arc::new(InMemorySessionRepository::new());
    let active = stored_active_session(&sessions).await;
    let h = harness_with_sessions(default_accounts(), sessions);

    let report = h.manager.recover().await.unwrap();
    assert_eq!(report.resumed, 1);
    assert!(h.manager.billing().is_running(active.id));

    tokio::time::sleep(Duration::from_secs(31)).await;
    settle().await;

    let stored = h.manager.get_session(active.id).await.unwrap();
    assert_eq!(stored.status, SessionStatus::Ended);
    assert_eq!(stored.end_reason, Some(EndReason::Unreachable));
    assert!(!h.manager.billing().is_running(active.id));
    assert!(!h.manager.expert_status("e1").busy);

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(h.accounts.balance_of("u2"), Some(1000));
}

#[tokio::test(start_paused = true)]
async fn recovered_session_ends_when_only_one_party_returns() {
    let sessions = Arc::new(InMemorySessionRepository::new());
    let active = stored_active_session(&sessions).await;
    let h = harness_with_sessions(default_accounts(), sessions);

    h.manager.recover().await.unwrap();
    let (_u2, mut u2_rx) = h.connect("u2");

    tokio::time::sleep(Duration::from_secs(31)).await;
    settle().await;

    let stored = h.manager.get_session(active.id).await.unwrap();
    assert_eq!(stored.end_reason, Some(EndReason::Unreachable));
    assert_eq!(ended_events(&drain(&mut u2_rx)), vec![EndReason::Unreachable]);
}

#[tokio::test(start_paused = true)]
async fn end_during_accept_leaves_no_billing_behind() {
    let accounts = Arc::new(GatedAccounts::new(default_accounts()));
    let manager = SessionManager::new(
        accounts.clone(),
        Arc::new(InMemorySessionRepository::new()),
        Arc::new(PresenceRegistry::new()),
        Arc::new(RecordingGateway::default()),
        Arc::new(NoopMirror),
        settings(),
    );
    let (u1, mut u1_rx) = ChannelHandle::open();
    manager.on_connect("u1", u1);
    let (e1, mut e1_rx) = ChannelHandle::open();
    manager.on_connect("e1", e1);

    let session = match manager
        .initiate(request("u1", "e1", InteractionKind::Chat))
        .await
        .unwrap()
    {
        InitiateOutcome::Invited(session) => session,
        other => panic!("expected an invitation, got {:?}", other),
    };

    // Accept parks on the balance read that precedes job registration.
    accounts.arm();
    let accepting = tokio::spawn({
        let manager = manager.clone();
        async move { manager.accept(session.id, "e1").await }
    });
    accounts.entered.notified().await;

    assert!(matches!(
        manager.end_by(session.id, "u1").await.unwrap(),
        EndOutcome::Ended(_)
    ));
    accounts.release.notify_one();

    assert!(matches!(
        accepting.await.unwrap(),
        Err(AppError::Conflict(_))
    ));
    assert!(!manager.billing().is_running(session.id));
    assert_eq!(manager.billing().running(), 0);
    assert!(!manager.expert_status("e1").busy);

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(accounts.inner.balance_of("u1"), Some(100));

    for rx in [&mut u1_rx, &mut e1_rx] {
        let events = drain(rx);
        assert_eq!(ended_events(&events), vec![EndReason::Manual]);
        assert!(!events
            .iter()
            .any(|e| matches!(e, OutboundEvent::SessionAccepted { .. })));
    }
}

fn fast_settings() -> EngineSettings {
    EngineSettings {
        billing_interval: Duration::from_millis(20),
        low_balance_threshold: 1,
        minimum_required_intervals: 1,
        disconnect_grace: Duration::from_secs(60),
    }
}

fn one_interval_accounts() -> Vec<Account> {
    vec![
        Account::requester("u1", 30),
        Account::expert("e1", ChargeRates::new(30, 40, 50)),
    ]
}

/// Checks that hold however an end race was decided
async fn assert_single_end(
    h: &Harness,
    session_id: Uuid,
    receivers: [&mut EventReceiver; 2],
) {
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stored = h.manager.get_session(session_id).await.unwrap();
    assert_eq!(stored.status, SessionStatus::Ended);
    assert!(!h.manager.billing().is_running(session_id));
    assert!(!h.manager.expert_status("e1").busy);

    for rx in receivers {
        let ended = ended_events(&drain(rx));
        assert_eq!(ended.len(), 1, "one end notice per party, got {:?}", ended);
        assert_eq!(Some(ended[0]), stored.end_reason);
    }

    let balance = h.accounts.balance_of("u1").unwrap();
    assert!(balance == 0 || balance == 30, "unexpected balance {}", balance);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.accounts.balance_of("u1"), Some(balance));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn manual_end_racing_exhaustion_ends_once() {
    for round in 0..20u64 {
        let h = harness_with(
            one_interval_accounts(),
            Arc::new(InMemorySessionRepository::new()),
            fast_settings(),
        );
        let (_u1, mut u1_rx) = h.connect("u1");
        let (_e1, mut e1_rx) = h.connect("e1");
        let session = h.open_active("u1", "e1", InteractionKind::Chat).await;

        // Land the manual end around the first (and only payable) tick.
        let delay = Duration::from_millis(15 + round % 10);
        let ending = tokio::spawn({
            let manager = h.manager.clone();
            async move {
                tokio::time::sleep(delay).await;
                manager.end_by(session.id, "u1").await
            }
        });
        ending.await.unwrap().unwrap();

        assert_single_end(&h, session.id, [&mut u1_rx, &mut e1_rx]).await;
        let reason = h.manager.get_session(session.id).await.unwrap().end_reason;
        assert!(matches!(
            reason,
            Some(EndReason::Manual) | Some(EndReason::LowBalance)
        ));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn manual_end_racing_accept_ends_once() {
    for _ in 0..20 {
        let h = harness_with(
            one_interval_accounts(),
            Arc::new(InMemorySessionRepository::new()),
            fast_settings(),
        );
        let (_u1, mut u1_rx) = h.connect("u1");
        let (_e1, mut e1_rx) = h.connect("e1");

        let session = match h
            .manager
            .initiate(request("u1", "e1", InteractionKind::Chat))
            .await
            .unwrap()
        {
            InitiateOutcome::Invited(session) => session,
            other => panic!("expected an invitation, got {:?}", other),
        };

        let accepting = tokio::spawn({
            let manager = h.manager.clone();
            async move { manager.accept(session.id, "e1").await }
        });
        let ending = tokio::spawn({
            let manager = h.manager.clone();
            async move { manager.end_by(session.id, "u1").await }
        });

        // Either side may win; a losing accept reports a conflict.
        if let Err(e) = accepting.await.unwrap() {
            assert!(matches!(e, AppError::Conflict(_)), "unexpected error {}", e);
        }
        ending.await.unwrap().unwrap();

        assert_single_end(&h, session.id, [&mut u1_rx, &mut e1_rx]).await;
    }
}
