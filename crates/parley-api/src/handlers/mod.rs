//! HTTP and WebSocket request handlers

pub mod expert;
pub mod presence;
pub mod session;
pub mod ws;

pub use expert::configure as configure_experts;
pub use presence::configure as configure_presence;
pub use session::configure as configure_sessions;
pub use ws::ws_handler;
