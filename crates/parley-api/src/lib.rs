//! API layer for Parley
//!
//! REST endpoints for the session lifecycle and expert status, plus the
//! WebSocket transport that carries engine events to connected entities.

#![forbid(unsafe_code)]

pub mod dto;
pub mod handlers;

use actix_web::web;

pub use dto::ApiResponse;
pub use handlers::{configure_experts, configure_presence, configure_sessions, ws_handler};

/// Mount every REST route under `/api/v1`
pub fn configure_api(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .configure(configure_presence)
            .configure(configure_sessions)
            .configure(configure_experts),
    );
}
