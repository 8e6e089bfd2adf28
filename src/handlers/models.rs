//! # Model Handlers
//!
//! `GET /api/v1/models` - the model this process serves, the state of every
//! registry slot and which compute devices are present.

use crate::device::DeviceSummary;
use crate::state::AppState;
use crate::transcription::whisper::ModelSize;
use actix_web::{web, HttpResponse};
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub size: String,
    pub repo: &'static str,
    pub size_mb: u32,
    pub description: &'static str,
    pub active: bool,
}

pub async fn list_models(state: web::Data<AppState>) -> HttpResponse {
    let summary = state.pipeline.registry().summary();
    let configured = state.config.model_size().ok();
    let devices = state.config.devices().unwrap_or_default();

    let models: Vec<ModelInfo> = ModelSize::ALL
        .iter()
        .map(|size| ModelInfo {
            size: size.to_string(),
            repo: size.repo_name(),
            size_mb: size.size_mb(),
            description: size.description(),
            active: Some(*size) == configured,
        })
        .collect();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "models": models,
        "registry": summary,
        "devices": DeviceSummary::detect(&devices),
    }))
}
