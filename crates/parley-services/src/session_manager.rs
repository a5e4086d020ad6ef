//! Session lifecycle manager
//!
//! Drives sessions through `created -> active -> ended` and coordinates the
//! busy slot, the wait queue and the billing job around each transition.
//! Every transition is a compare-and-update on the stored status; when a
//! manual end races a billing-driven end, the loser sees an ended session and
//! does nothing.

use crate::admission::{Admission, AdmissionController};
use crate::billing::{BillingObserver, BillingPlan, BillingScheduler, BillingStart, Meter};
use crate::notifier::{Delivery, Notifier};
use crate::presence::{ChannelHandle, PresenceRegistry};
use crate::wait_queue::{PushOutcome, WaitQueue};
use async_trait::async_trait;
use chrono::Utc;
use parley_core::{
    config::BillingConfig,
    models::{
        remaining_intervals, EndReason, InteractionKind, OutboundEvent, Participant, QueueEntry,
        Role, Session, SessionStatus,
    },
    traits::{AccountStore, NotificationGateway, SessionRepository, StatusMirror},
    AppError, AppResult,
};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Engine tunables
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub billing_interval: Duration,
    pub low_balance_threshold: i64,
    pub minimum_required_intervals: i64,
    pub disconnect_grace: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&BillingConfig::default())
    }
}

impl From<&BillingConfig> for EngineSettings {
    fn from(config: &BillingConfig) -> Self {
        Self {
            billing_interval: config.interval(),
            low_balance_threshold: config.low_balance_threshold,
            minimum_required_intervals: config.minimum_required_intervals,
            disconnect_grace: config.disconnect_grace(),
        }
    }
}

/// A request to open a session
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub initiator: Participant,
    pub target: Participant,
    pub kind: InteractionKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InitiateOutcome {
    /// Session created; the callee has been invited
    Invited(Session),
    /// The expert is busy; no session was created
    Queued { expert_id: String, position: usize },
    /// A party had no live channel; the session was created and ended at once
    ReceiverOffline(Session),
}

#[derive(Debug, Clone, PartialEq)]
pub enum EndOutcome {
    Ended(Session),
    /// Someone else ended it first
    AlreadyEnded(Session),
}

impl EndOutcome {
    pub fn session(&self) -> &Session {
        match self {
            EndOutcome::Ended(s) | EndOutcome::AlreadyEnded(s) => s,
        }
    }

    pub fn into_session(self) -> Session {
        match self {
            EndOutcome::Ended(s) | EndOutcome::AlreadyEnded(s) => s,
        }
    }
}

/// Dashboard view of an expert
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpertStatus {
    pub expert_id: String,
    pub busy: bool,
    pub session_id: Option<Uuid>,
    pub remaining_intervals: Option<i64>,
    pub queue_length: usize,
}

/// What `recover` did at boot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub resumed: usize,
    pub ended: usize,
    /// Participants given the disconnect grace period to reconnect
    pub awaiting_reconnect: usize,
}

pub struct SessionManager {
    accounts: Arc<dyn AccountStore>,
    sessions: Arc<dyn SessionRepository>,
    presence: Arc<PresenceRegistry>,
    notifier: Arc<Notifier>,
    mirror: Arc<dyn StatusMirror>,
    admission: AdmissionController,
    queue: WaitQueue,
    billing: BillingScheduler,
    settings: EngineSettings,
}

impl SessionManager {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        sessions: Arc<dyn SessionRepository>,
        presence: Arc<PresenceRegistry>,
        gateway: Arc<dyn NotificationGateway>,
        mirror: Arc<dyn StatusMirror>,
        settings: EngineSettings,
    ) -> Arc<Self> {
        let notifier = Arc::new(Notifier::new(Arc::clone(&presence), gateway));
        let meter = Meter::new(
            Arc::clone(&accounts),
            Arc::clone(&notifier),
            Arc::clone(&mirror),
            settings.low_balance_threshold,
        );
        let billing = BillingScheduler::new(meter, settings.billing_interval);

        Arc::new(Self {
            accounts,
            sessions,
            presence,
            notifier,
            mirror,
            admission: AdmissionController::new(),
            queue: WaitQueue::new(),
            billing,
            settings,
        })
    }

    pub fn presence(&self) -> &Arc<PresenceRegistry> {
        &self.presence
    }

    pub fn billing(&self) -> &BillingScheduler {
        &self.billing
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Open a session, or queue the requester when the expert is busy
    #[instrument(skip(self, request), fields(initiator = %request.initiator.id, target = %request.target.id, kind = %request.kind))]
    pub async fn initiate(&self, request: SessionRequest) -> AppResult<InitiateOutcome> {
        let draft = Session::new(request.initiator, request.target, request.kind)?;
        let expert_id = draft.expert_id().to_string();
        let requester_id = draft.requester_id().to_string();

        let rate = self
            .accounts
            .get_charge_rates(&expert_id)
            .await?
            .for_kind(draft.kind);
        let balance = self.accounts.get_balance(&requester_id).await?;

        let minimum = self.settings.minimum_required_intervals;
        if rate > 0 && remaining_intervals(balance, rate) < minimum {
            info!(balance, rate, minimum, "Balance below the admission minimum");
            return Err(AppError::InsufficientBalance {
                required: rate.saturating_mul(minimum),
                available: balance,
            });
        }

        loop {
            if self.admission.try_acquire(&expert_id).is_granted() {
                break;
            }

            if draft.initiator().role == Role::Expert {
                return Err(AppError::Conflict(format!(
                    "expert {} already has a session",
                    expert_id
                )));
            }

            let entry = QueueEntry::new(requester_id.clone(), draft.kind);
            match self
                .queue
                .push_unless_free(&expert_id, entry, || self.admission.is_busy(&expert_id))
            {
                PushOutcome::Enqueued { position } | PushOutcome::AlreadyQueued { position } => {
                    self.notifier.send(
                        &requester_id,
                        OutboundEvent::Queued {
                            expert_id: expert_id.clone(),
                            position,
                        },
                    );
                    self.send_queue_snapshot(&expert_id);
                    return Ok(InitiateOutcome::Queued {
                        expert_id,
                        position,
                    });
                }
                PushOutcome::SlotFreed => {
                    debug!("Slot freed while queueing, retrying admission");
                }
            }
        }

        if self.queue.remove(&expert_id, &requester_id) {
            self.send_queue_snapshot(&expert_id);
        }

        if let Err(e) = self.sessions.insert(&draft).await {
            self.admission.release(&expert_id);
            return Err(e);
        }
        self.admission.bind(&expert_id, draft.id);
        self.mirror_busy(&expert_id, Some(draft.id)).await;

        let initiator = draft.initiator().clone();
        let callee = draft.callee().clone();
        let incoming = OutboundEvent::IncomingSession {
            session_id: draft.id,
            kind: draft.kind,
            from_id: initiator.id.clone(),
            from_role: initiator.role,
        };

        if !self.presence.is_online(&callee.id) || !self.presence.is_online(&initiator.id) {
            info!(session_id = %draft.id, "Party unreachable, closing invitation");
            self.notifier.send_or_alert(&callee.id, incoming);
            let ended = self.end(draft.id, EndReason::Unreachable).await?;
            return Ok(InitiateOutcome::ReceiverOffline(ended.into_session()));
        }

        self.notifier.send(&callee.id, incoming);
        self.notifier.send(
            &initiator.id,
            OutboundEvent::SessionInitiated {
                session_id: draft.id,
                kind: draft.kind,
                to_id: callee.id.clone(),
            },
        );

        info!(session_id = %draft.id, "Session created");
        Ok(InitiateOutcome::Invited(draft))
    }

    /// Callee accepts: the session becomes active and billing starts
    #[instrument(skip(self))]
    pub async fn accept(self: &Arc<Self>, session_id: Uuid, entity_id: &str) -> AppResult<Session> {
        let session = self.load(session_id).await?;
        if session.callee().id != entity_id {
            return Err(AppError::Validation(format!(
                "only {} can accept session {}",
                session.callee().id,
                session_id
            )));
        }

        let rate = self
            .accounts
            .get_charge_rates(session.expert_id())
            .await?
            .for_kind(session.kind);

        let started = session.to_started(Utc::now())?;
        if !self
            .sessions
            .compare_and_update(&started, SessionStatus::Created)
            .await?
        {
            return Err(AppError::Conflict(format!(
                "session {} changed before it could be accepted",
                session_id
            )));
        }

        let plan = BillingPlan {
            session_id,
            payer_id: started.requester_id().to_string(),
            expert_id: started.expert_id().to_string(),
            charge_per_interval: rate,
        };
        let observer: Arc<dyn BillingObserver> = Arc::clone(self) as Arc<dyn BillingObserver>;

        match self.billing.start(plan, observer).await {
            Ok(BillingStart::Started {
                remaining_intervals,
                ..
            }) => {
                debug!(remaining_intervals, "Billing running");
            }
            Ok(BillingStart::Unmetered) => {}
            Ok(BillingStart::Insufficient { balance }) => {
                info!(balance, "Balance exhausted before the first interval");
                return Ok(self.end(session_id, EndReason::LowBalance).await?.into_session());
            }
            Err(e) => {
                error!("Billing could not start: {}", e);
                let reason = if e.is_not_found() {
                    EndReason::LowBalance
                } else {
                    EndReason::Unreachable
                };
                self.end(session_id, reason).await?;
                return Err(e);
            }
        }

        // An end that won the status race before the job was registered found
        // nothing to stop; the job is cancelled here instead.
        let current = self.load(session_id).await?;
        if current.status != SessionStatus::Active {
            if self.billing.stop(session_id).await && !self.admission.is_busy(current.expert_id()) {
                if let Err(e) = self.mirror.expert_free(current.expert_id()).await {
                    debug!("Status mirror update failed: {}", e);
                }
            }
            info!(status = %current.status, "Session ended while it was being accepted");
            return Err(AppError::Conflict(format!(
                "session {} ended before it could be accepted",
                session_id
            )));
        }

        let accepted = OutboundEvent::SessionAccepted { session_id };
        self.notifier.send(&started.participant_a.id, accepted.clone());
        self.notifier.send(&started.participant_b.id, accepted);

        info!("Session active");
        Ok(started)
    }

    /// Callee declines an invitation
    #[instrument(skip(self))]
    pub async fn reject(&self, session_id: Uuid, entity_id: &str) -> AppResult<Session> {
        let session = self.load(session_id).await?;
        if session.callee().id != entity_id {
            return Err(AppError::Validation(format!(
                "only {} can reject session {}",
                session.callee().id,
                session_id
            )));
        }
        if session.status != SessionStatus::Created {
            return Err(AppError::Conflict(format!(
                "session {} is {}, only invitations can be rejected",
                session_id, session.status
            )));
        }

        Ok(self.end(session_id, EndReason::Rejected).await?.into_session())
    }

    /// A participant hangs up
    #[instrument(skip(self))]
    pub async fn end_by(&self, session_id: Uuid, entity_id: &str) -> AppResult<EndOutcome> {
        let session = self.load(session_id).await?;
        if !session.involves(entity_id) {
            return Err(AppError::Validation(format!(
                "{} is not a participant of session {}",
                entity_id, session_id
            )));
        }
        self.end(session_id, EndReason::Manual).await
    }

    /// Terminal transition; idempotent
    ///
    /// Only the caller that wins the status transition releases the slot,
    /// notifies both parties and promotes the next waiter.
    #[instrument(skip(self), fields(reason = %reason))]
    pub async fn end(&self, session_id: Uuid, reason: EndReason) -> AppResult<EndOutcome> {
        let ended = loop {
            let current = self.load(session_id).await?;
            let Some(next) = current.to_ended(Utc::now(), reason) else {
                debug!("Session already ended");
                return Ok(EndOutcome::AlreadyEnded(current));
            };
            if self
                .sessions
                .compare_and_update(&next, current.status)
                .await?
            {
                break next;
            }
            debug!("Session changed concurrently, reloading");
        };

        self.billing.stop(session_id).await;

        let expert_id = ended.expert_id().to_string();
        let freed = self.admission.release_held_by(&expert_id, session_id);
        if freed {
            if let Err(e) = self.mirror.expert_free(&expert_id).await {
                debug!("Status mirror update failed: {}", e);
            }
        }

        let event = OutboundEvent::SessionEnded {
            session_id,
            reason,
            duration_seconds: ended.duration_seconds,
        };
        self.notifier.send_or_alert(&ended.participant_a.id, event.clone());
        self.notifier.send_or_alert(&ended.participant_b.id, event);

        info!(
            duration_seconds = ended.duration_seconds.unwrap_or(0),
            "Session ended"
        );

        if freed {
            self.promote_next(&expert_id);
        }
        self.send_queue_snapshot(&expert_id);

        Ok(EndOutcome::Ended(ended))
    }

    /// Tell the head of the queue that the expert is free
    ///
    /// The entry leaves the queue when selected. A requester who cannot be
    /// reached gets a push alert and has to request again.
    fn promote_next(&self, expert_id: &str) {
        if self.admission.is_busy(expert_id) {
            debug!(expert_id, "Slot taken again before promotion");
            return;
        }
        let Some(entry) = self.queue.pop_front(expert_id) else {
            return;
        };

        let delivery = self.notifier.send_or_alert(
            &entry.requester_id,
            OutboundEvent::YourTurn {
                expert_id: expert_id.to_string(),
                kind: entry.kind,
            },
        );
        match delivery {
            Delivery::Delivered => info!(expert_id, requester_id = %entry.requester_id, "Promoted next requester"),
            _ => info!(
                expert_id,
                requester_id = %entry.requester_id,
                "Promoted requester offline, dropped from queue"
            ),
        }
    }

    fn send_queue_snapshot(&self, expert_id: &str) {
        self.notifier.send(
            expert_id,
            OutboundEvent::QueueSnapshot {
                expert_id: expert_id.to_string(),
                entries: self.queue.list_all(expert_id),
            },
        );
    }

    async fn mirror_busy(&self, expert_id: &str, session_id: Option<Uuid>) {
        if let Err(e) = self.mirror.expert_busy(expert_id, session_id).await {
            debug!("Status mirror update failed: {}", e);
        }
    }

    async fn load(&self, session_id: Uuid) -> AppResult<Session> {
        self.sessions
            .find_by_id(session_id)
            .await?
            .ok_or_else(|| AppError::SessionNotFound(session_id.to_string()))
    }

    pub async fn get_session(&self, session_id: Uuid) -> AppResult<Session> {
        self.load(session_id).await
    }

    pub fn queue_for(&self, expert_id: &str) -> Vec<QueueEntry> {
        self.queue.list_all(expert_id)
    }

    pub fn expert_status(&self, expert_id: &str) -> ExpertStatus {
        ExpertStatus {
            expert_id: expert_id.to_string(),
            busy: self.admission.is_busy(expert_id),
            session_id: self.admission.holder(expert_id),
            remaining_intervals: self.billing.remaining_for_expert(expert_id),
            queue_length: self.queue.len(expert_id),
        }
    }

    pub fn online_entities(&self) -> Vec<String> {
        self.presence.list_online()
    }

    /// Transport connect hook
    pub fn on_connect(&self, entity_id: &str, channel: ChannelHandle) {
        if let Some(previous) = self.presence.register(entity_id, channel.clone()) {
            debug!(entity_id, old = %previous.connection_id(), "Replaced existing channel");
        }
        channel.send(OutboundEvent::OnlineEntities {
            ids: self.presence.list_online(),
        });
        if self.queue.len(entity_id) > 0 {
            self.send_queue_snapshot(entity_id);
        }
        info!(entity_id, "Entity connected");
    }

    /// Transport disconnect hook; resolves the entity from its connection
    pub fn on_disconnect(self: &Arc<Self>, connection_id: Uuid) -> Option<JoinHandle<()>> {
        let entity_id = self.presence.unregister_channel(connection_id)?;
        info!(entity_id = %entity_id, "Entity disconnected");
        Some(self.handle_disconnect(entity_id))
    }

    /// End the entity's open sessions unless it reconnects within the grace period
    pub fn handle_disconnect(self: &Arc<Self>, entity_id: String) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(manager.settings.disconnect_grace).await;
            if manager.presence.is_online(&entity_id) {
                debug!(entity_id = %entity_id, "Reconnected within grace period");
                return;
            }

            let open = match manager.sessions.find_open_by_participant(&entity_id).await {
                Ok(open) => open,
                Err(e) => {
                    warn!(entity_id = %entity_id, "Could not list open sessions: {}", e);
                    return;
                }
            };

            for session in open {
                if let Err(e) = manager.end(session.id, EndReason::Unreachable).await {
                    warn!(session_id = %session.id, "Failed to end session of departed entity: {}", e);
                }
            }
        })
    }

    /// Rebuild slots and billing jobs from stored sessions after a restart
    ///
    /// Active sessions get their slot back and a fresh billing interval
    /// starting now; their participants then have the disconnect grace period
    /// to reconnect. Pending invitations died with the old process and are
    /// closed.
    #[instrument(skip(self))]
    pub async fn recover(self: &Arc<Self>) -> AppResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let mut participants = BTreeSet::new();

        for session in self.sessions.find_by_status(SessionStatus::Active).await? {
            let expert_id = session.expert_id().to_string();

            if let Admission::Denied { held_by } = self.admission.try_acquire(&expert_id) {
                warn!(
                    session_id = %session.id,
                    ?held_by,
                    "Second active session for expert {}, closing it",
                    expert_id
                );
                self.end(session.id, EndReason::Unreachable).await?;
                report.ended += 1;
                continue;
            }
            self.admission.bind(&expert_id, session.id);
            self.mirror_busy(&expert_id, Some(session.id)).await;

            let rate = match self.accounts.get_charge_rates(&expert_id).await {
                Ok(rates) => rates.for_kind(session.kind),
                Err(e) => {
                    warn!(session_id = %session.id, "Rates unavailable, closing session: {}", e);
                    self.end(session.id, EndReason::Unreachable).await?;
                    report.ended += 1;
                    continue;
                }
            };

            let plan = BillingPlan {
                session_id: session.id,
                payer_id: session.requester_id().to_string(),
                expert_id,
                charge_per_interval: rate,
            };
            let observer: Arc<dyn BillingObserver> = Arc::clone(self) as Arc<dyn BillingObserver>;
            match self.billing.start(plan, observer).await {
                Ok(BillingStart::Started { .. }) | Ok(BillingStart::Unmetered) => {
                    participants.insert(session.participant_a.id.clone());
                    participants.insert(session.participant_b.id.clone());
                    report.resumed += 1;
                }
                Ok(BillingStart::Insufficient { .. }) => {
                    self.end(session.id, EndReason::LowBalance).await?;
                    report.ended += 1;
                }
                Err(e) => {
                    warn!(session_id = %session.id, "Billing could not resume: {}", e);
                    let reason = if e.is_not_found() {
                        EndReason::LowBalance
                    } else {
                        EndReason::Unreachable
                    };
                    self.end(session.id, reason).await?;
                    report.ended += 1;
                }
            }
        }

        for session in self.sessions.find_by_status(SessionStatus::Created).await? {
            self.end(session.id, EndReason::Unreachable).await?;
            report.ended += 1;
        }

        // No channel survived the restart: every resumed participant is
        // treated as just disconnected.
        for entity_id in participants {
            self.handle_disconnect(entity_id);
            report.awaiting_reconnect += 1;
        }

        info!(
            resumed = report.resumed,
            ended = report.ended,
            awaiting_reconnect = report.awaiting_reconnect,
            "Recovery finished"
        );
        Ok(report)
    }

    /// Cancel all billing jobs
    pub fn shutdown(&self) {
        self.billing.shutdown();
    }
}

#[async_trait]
impl BillingObserver for SessionManager {
    async fn on_exhausted(&self, session_id: Uuid) {
        if let Err(e) = self.end(session_id, EndReason::LowBalance).await {
            error!(session_id = %session_id, "Failed to end exhausted session: {}", e);
        }
    }
}
