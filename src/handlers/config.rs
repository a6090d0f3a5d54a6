use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "server": {
                "host": config.server.host,
                "port": config.server.port
            },
            "transcribe": {
                "region": config.transcribe.region,
                "default_language_code": config.transcribe.default_language_code,
                "default_sample_rate_hertz": config.transcribe.default_sample_rate_hertz,
                "presign_expiry_seconds": config.transcribe.presign_expiry_seconds
            },
            "performance": {
                "max_concurrent_sessions": config.performance.max_concurrent_sessions
            }
        }
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": {
            "server": {
                "host": current_config.server.host,
                "port": current_config.server.port
            },
            "transcribe": {
                "region": current_config.transcribe.region,
                "default_language_code": current_config.transcribe.default_language_code,
                "default_sample_rate_hertz": current_config.transcribe.default_sample_rate_hertz,
                "presign_expiry_seconds": current_config.transcribe.presign_expiry_seconds
            },
            "performance": {
                "max_concurrent_sessions": current_config.performance.max_concurrent_sessions
            }
        }
    })))
}
