//! Presence and health handlers

use crate::dto::{ApiResponse, HealthResponse, OnlineResponse};
use actix_web::{web, HttpResponse};
use parley_services::SessionManager;

/// GET /api/v1/presence/online
pub async fn list_online(manager: web::Data<SessionManager>) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::success(OnlineResponse::from(
        manager.online_entities(),
    )))
}

/// GET /api/v1/health
pub async fn health_check(manager: web::Data<SessionManager>) -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "healthy",
        service: "parley",
        version: env!("CARGO_PKG_VERSION"),
        online: manager.presence().len(),
        billing_jobs: manager.billing().running(),
    })
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .route("/presence/online", web::get().to(list_online));
}
