use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

/// `GET /health`
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let engine = state.engine();
    let loaded_models: Vec<String> = engine
        .registry()
        .loaded_models()
        .await
        .iter()
        .map(|size| size.to_string())
        .collect();
    let default_model = match state.config.default_model() {
        Ok(size) => size.to_string(),
        Err(_) => state.config.models.default_model.clone(),
    };

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "model": format!("whisper-{}", default_model),
        "device": engine.device_name(),
        "gpu_available": engine.gpu_available(),
        "uptime_seconds": state.get_uptime_seconds(),
        "loaded_models": loaded_models,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// `GET /metrics`
pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let registry = state.engine().registry();
    let summary = registry.summary().await;

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms,
            "upload_bytes": metric.upload_bytes,
            "rejected_uploads": metric.rejected_uploads
        }));
    }
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    let mut model_stats = Vec::new();
    for entry in registry.list_models().await {
        if entry.metrics.total_requests == 0 {
            continue;
        }
        model_stats.push(json!({
            "model": entry.size.to_string(),
            "requests": entry.metrics.total_requests,
            "failed": entry.metrics.failed_requests,
            "success_rate": entry.metrics.success_rate(),
            "audio_seconds": entry.metrics.total_audio_seconds,
            "realtime_factor": entry.metrics.realtime_factor(),
        }));
    }

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "active_transcriptions": metrics.active_transcriptions,
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "models": {
            "summary": summary,
            "per_model": model_stats,
        },
        "memory": get_memory_info(),
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        let pid = process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let mut vm_rss = 0;
            let mut vm_size = 0;

            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_rss = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                } else if line.starts_with("VmSize:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_size = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                }
            }

            return json!({
                "resident_memory_bytes": vm_rss,
                "virtual_memory_bytes": vm_size,
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": format!("Memory info not available for pid {} on this platform", process::id())
    })
}
