//! Domain models for Parley
//!
//! This module contains all the core domain models used throughout the application.

pub mod account;
pub mod events;
pub mod queue;
pub mod session;

pub use account::{remaining_intervals, Account, ChargeRates, Decrement};
pub use events::{OutboundEvent, PushAlert};
pub use queue::QueueEntry;
pub use session::{
    duration_seconds, EndReason, InteractionKind, Participant, Role, Session, SessionStatus,
};
