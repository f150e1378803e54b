//! Call session inspection and termination.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

/// `GET /api/v1/sessions/{id}`: call state and pipeline counters.
pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    let session = state
        .registry
        .get(&session_id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("Session '{}' not found", session_id)))?;

    Ok(HttpResponse::Ok().json(session.info()))
}

/// `DELETE /api/v1/sessions/{id}`: close the call and release its resources.
pub async fn delete_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();

    if !state.registry.terminate(&session_id).await {
        return Err(AppError::NotFound(format!("Session '{}' not found", session_id)));
    }

    info!(session_id = %session_id, "Session terminated via API");
    Ok(HttpResponse::Ok().json(json!({
        "status": "terminated",
        "session_id": session_id,
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}
