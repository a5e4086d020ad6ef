//! Data Transfer Objects (DTOs) for API requests and responses

pub mod common;
pub mod expert;
pub mod session;

pub use common::*;
pub use expert::*;
pub use session::*;
