//! # Model Catalogue and Service Info Handlers
//!
//! ## Available Endpoints:
//! - `GET /models` - Model catalogue with live registry status
//! - `GET /` - Service name, version and endpoint map

use crate::error::AppResult;
use crate::protocol::ModelInfo;
use crate::state::AppState;
use crate::transcription::model::ModelSize;
use actix_web::{web, HttpResponse};
use serde::Serialize;
use serde_json::json;

/// One row of `GET /models`.
#[derive(Debug, Serialize)]
pub struct ModelListing {
    #[serde(flatten)]
    pub info: ModelInfo,
    /// Resident memory estimate (MB)
    pub memory_mb: u32,
    pub status: String,
    pub loaded: bool,
    pub requests: u64,
}

/// List all Whisper models with their current status.
///
/// ## Endpoint: `GET /models`
///
/// ## Response:
/// ```json
/// {
///   "models": [
///     {"name": "tiny", "speed": "fastest", "accuracy": "basic", "vram": "1GB",
///      "size_mb": 39, "repo": "openai/whisper-tiny", "memory_mb": 156,
///      "status": "Not loaded", "loaded": false, "requests": 0}
///   ],
///   "default": "base",
///   "current_device": "cpu",
///   "loaded_models": [],
///   "registry": {...}
/// }
/// ```
pub async fn list_models(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let engine = state.engine();
    let registry = engine.registry();

    let models: Vec<ModelListing> = registry
        .list_models()
        .await
        .into_iter()
        .map(|entry| ModelListing {
            memory_mb: entry.size.memory_mb(),
            status: entry.status.description(),
            loaded: entry.status.is_loaded(),
            requests: entry.metrics.total_requests,
            info: entry.info,
        })
        .collect();
    let summary = registry.summary().await;

    Ok(HttpResponse::Ok().json(json!({
        "models": models,
        "default": state.config.default_model()?.to_string(),
        "current_device": engine.device_name(),
        "loaded_models": summary.loaded_models,
        "registry": summary,
    })))
}

/// Service information.
///
/// ## Endpoint: `GET /`
pub async fn service_info(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let default_model = state.config.default_model()?;
    let models: Vec<String> = ModelSize::ALL.iter().map(|size| size.to_string()).collect();

    Ok(HttpResponse::Ok().json(json!({
        "service": "Ramble",
        "version": env!("CARGO_PKG_VERSION"),
        "model": format!("whisper-{}", default_model),
        "models": models,
        "endpoints": {
            "/transcribe": "POST - Transcribe audio file (select model)",
            "/translate": "POST - Translate to English",
            "/models": "GET - List available models",
            "/health": "GET - Health check",
            "/metrics": "GET - Request and model metrics"
        },
        "features": [
            "Multi-language support",
            "Speaker detection",
            "Translation to English",
            "Segment-level timestamps",
            "Selectable model size"
        ],
        "status": "operational"
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::transcription::registry::ModelStatus;
    use crate::transcription::service::tests::StubEngine;
    use crate::transcription::SpeechEngine;
    use actix_web::{test, App};
    use std::sync::Arc;

    #[actix_web::test]
    async fn test_list_models() {
        let engine = Arc::new(StubEngine::conversation());
        engine
            .registry()
            .update_model_status(
                ModelSize::Tiny,
                ModelStatus::Loaded {
                    loaded_at: 0,
                    memory_mb: ModelSize::Tiny.memory_mb(),
                },
            )
            .await;
        let state = web::Data::new(AppState::new(AppConfig::default(), engine));
        let app = test::init_service(
            App::new()
                .app_data(state)
                .route("/models", web::get().to(list_models)),
        )
        .await;

        let req = test::TestRequest::get().uri("/models").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        let models = body["models"].as_array().unwrap();
        assert_eq!(models.len(), 5);
        let tiny = models.iter().find(|m| m["name"] == "tiny").unwrap();
        assert_eq!(tiny["loaded"], true);
        assert_eq!(tiny["speed"], "fastest");
        assert_eq!(body["default"], "base");
        assert_eq!(body["current_device"], "cpu");
        assert_eq!(body["loaded_models"], json!(["tiny"]));
    }

    #[actix_web::test]
    async fn test_service_info() {
        let state = web::Data::new(AppState::new(
            AppConfig::default(),
            Arc::new(StubEngine::conversation()),
        ));
        let app = test::init_service(
            App::new()
                .app_data(state)
                .route("/", web::get().to(service_info)),
        )
        .await;

        let req = test::TestRequest::get().uri("/").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["model"], "whisper-base");
        assert_eq!(body["models"].as_array().unwrap().len(), 5);
        assert!(body["endpoints"]["/translate"].is_string());
    }
}
