//! Expert handlers

use crate::dto::{ApiResponse, QueueResponse};
use actix_web::{web, HttpResponse};
use parley_core::AppError;
use parley_services::SessionManager;
use tracing::instrument;

/// Waiting requesters, head first
///
/// GET /api/v1/experts/{id}/queue
#[instrument(skip(manager))]
pub async fn get_queue(
    manager: web::Data<SessionManager>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let expert_id = path.into_inner();
    let entries = manager.queue_for(&expert_id);
    Ok(HttpResponse::Ok().json(ApiResponse::success(QueueResponse::new(expert_id, entries))))
}

/// Busy flag, bound session, remaining intervals and queue length
///
/// GET /api/v1/experts/{id}/status
#[instrument(skip(manager))]
pub async fn get_status(
    manager: web::Data<SessionManager>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let status = manager.expert_status(&path.into_inner());
    Ok(HttpResponse::Ok().json(ApiResponse::success(status)))
}

/// Configure expert routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/experts")
            .route("/{id}/queue", web::get().to(get_queue))
            .route("/{id}/status", web::get().to(get_status)),
    );
}
