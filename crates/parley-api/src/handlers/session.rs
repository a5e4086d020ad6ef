//! Session handlers
//!
//! HTTP handlers for the session lifecycle endpoints.

use crate::dto::{ApiResponse, CreateSessionRequest, InitiateResponse, InitiateStatus, SessionActionRequest};
use actix_web::{web, HttpResponse};
use parley_core::AppError;
use parley_services::SessionManager;
use tracing::{debug, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// Request a session
///
/// POST /api/v1/sessions
#[instrument(skip(manager, req))]
pub async fn create_session(
    manager: web::Data<SessionManager>,
    req: web::Json<CreateSessionRequest>,
) -> Result<HttpResponse, AppError> {
    req.validate().map_err(|e| {
        warn!("Session request validation failed: {}", e);
        AppError::Validation(e.to_string())
    })?;

    debug!(initiator = %req.initiator_id, target = %req.target_id, "Session requested");

    let outcome = manager.initiate(req.into_inner().into_request()).await?;
    let response = InitiateResponse::from(outcome);

    Ok(match response.status {
        InitiateStatus::Invited => HttpResponse::Created().json(ApiResponse::success(response)),
        InitiateStatus::Queued => HttpResponse::Accepted()
            .json(ApiResponse::with_message(response, "Expert is busy, request queued")),
        InitiateStatus::ReceiverOffline => HttpResponse::Ok()
            .json(ApiResponse::with_message(response, "Receiver offline")),
    })
}

/// Get a session
///
/// GET /api/v1/sessions/{id}
#[instrument(skip(manager))]
pub async fn get_session(
    manager: web::Data<SessionManager>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let session = manager.get_session(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(session)))
}

/// Callee accepts
///
/// POST /api/v1/sessions/{id}/accept
#[instrument(skip(manager, req))]
pub async fn accept_session(
    manager: web::Data<SessionManager>,
    path: web::Path<Uuid>,
    req: web::Json<SessionActionRequest>,
) -> Result<HttpResponse, AppError> {
    req.validate()?;
    let session = manager.accept(path.into_inner(), &req.entity_id).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(session)))
}

/// Callee declines
///
/// POST /api/v1/sessions/{id}/reject
#[instrument(skip(manager, req))]
pub async fn reject_session(
    manager: web::Data<SessionManager>,
    path: web::Path<Uuid>,
    req: web::Json<SessionActionRequest>,
) -> Result<HttpResponse, AppError> {
    req.validate()?;
    let session = manager.reject(path.into_inner(), &req.entity_id).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(session)))
}

/// Either participant ends the session
///
/// POST /api/v1/sessions/{id}/end
#[instrument(skip(manager, req))]
pub async fn end_session(
    manager: web::Data<SessionManager>,
    path: web::Path<Uuid>,
    req: web::Json<SessionActionRequest>,
) -> Result<HttpResponse, AppError> {
    req.validate()?;
    let outcome = manager.end_by(path.into_inner(), &req.entity_id).await?;
    Ok(match outcome {
        parley_services::EndOutcome::Ended(session) => {
            HttpResponse::Ok().json(ApiResponse::success(session))
        }
        parley_services::EndOutcome::AlreadyEnded(session) => {
            HttpResponse::Ok().json(ApiResponse::with_message(session, "Session was already ended"))
        }
    })
}

/// Configure session routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/sessions")
            .route("", web::post().to(create_session))
            .route("/{id}", web::get().to(get_session))
            .route("/{id}/accept", web::post().to(accept_session))
            .route("/{id}/reject", web::post().to(reject_session))
            .route("/{id}/end", web::post().to(end_session)),
    );
}
