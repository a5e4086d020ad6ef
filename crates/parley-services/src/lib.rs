//! Parley engine
//!
//! The metered-session broker: who is online, which expert is busy, who is
//! waiting, and what each running session costs.
//!
//! # Components
//!
//! - `PresenceRegistry` - entity id to live channel, self-healing on lookup
//! - `Notifier` - channel delivery with push-alert fallback
//! - `AdmissionController` - one exclusive slot per expert
//! - `WaitQueue` - per-expert FIFO of waiting requesters, deduplicated
//! - `BillingScheduler` - per-session recurring charge with auto-termination
//! - `SessionManager` - lifecycle orchestration, disconnect handling, recovery
//!
//! All components are shared behind `Arc` and safe to call from any task.

pub mod admission;
pub mod billing;
pub mod gateway;
pub mod notifier;
pub mod presence;
pub mod session_manager;
pub mod wait_queue;

pub use admission::{Admission, AdmissionController};
pub use billing::{
    BillingObserver, BillingPlan, BillingScheduler, BillingStart, BillingState, Meter, TickOutcome,
};
pub use gateway::{LogGateway, WebhookGateway};
pub use notifier::{Delivery, Notifier};
pub use presence::{ChannelHandle, EventReceiver, EventSender, PresenceRegistry};
pub use session_manager::{
    EndOutcome, EngineSettings, ExpertStatus, InitiateOutcome, RecoveryReport, SessionManager,
    SessionRequest,
};
pub use wait_queue::{PushOutcome, WaitQueue};
