//! # Health and Metrics Endpoints
//!
//! `/health` reports whether the pipeline can take and finish work:
//!
//! ## Status levels:
//! - **healthy**: queue open, every worker alive, no failed model slots
//! - **degraded**: still serving, but a slot failed to load or a worker is restarting
//! - **unhealthy**: queue closed, no live workers, or no model slot can ever load
//!
//! `/api/v1/metrics` adds per-endpoint HTTP metrics and pipeline statistics.

use crate::pipeline::PipelineHealth;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn assess(health: &PipelineHealth) -> Self {
        let registry = &health.registry;
        if !health.accepting
            || registry.failed >= registry.total
            || (health.workers_total > 0 && health.workers_active == 0)
        {
            HealthStatus::Unhealthy
        } else if registry.failed > 0 || health.workers_active < health.workers_total {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let health = state.pipeline.health();
    let status = HealthStatus::assess(&health);
    let metrics = state.get_metrics_snapshot();
    let registry = &health.registry;

    let body = json!({
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
        "workers": {
            "active": health.workers_active,
            "total": health.workers_total,
        },
        "models": {
            "model": registry.model_id,
            "total": registry.total,
            "loaded": registry.loaded,
            "busy": registry.busy,
            "available": registry.available,
            "degraded": registry.failed,
            "slots": registry.slots,
        },
        "queue": {
            "depth": health.queue_depth,
            "capacity": health.queue_capacity,
            "accepting": health.accepting,
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
        },
        "memory": memory_info(),
    });

    match status {
        HealthStatus::Unhealthy => HttpResponse::ServiceUnavailable().json(body),
        _ => HttpResponse::Ok().json(body),
    }
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let endpoints: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
            })
        })
        .collect();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            },
        },
        "endpoints": endpoints,
        "pipeline": state.pipeline.stats(),
        "models": state.pipeline.registry().summary(),
        "memory": memory_info(),
    }))
}

/// Resident and virtual memory of this process, from /proc on Linux.
fn memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let field = |name: &str| -> u64 {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .map(|kb| kb * 1024)
                    .unwrap_or(0)
            };
            return json!({
                "resident_memory_bytes": field("VmRSS:"),
                "virtual_memory_bytes": field("VmSize:"),
                "available": true
            });
        }
    }
    json!({ "available": false })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcription::registry::RegistrySummary;

    fn health(accepting: bool, active: usize, failed: usize) -> PipelineHealth {
        PipelineHealth {
            accepting,
            workers_active: active,
            workers_total: 2,
            queue_depth: 0,
            queue_capacity: 10,
            registry: RegistrySummary {
                model_id: "test".into(),
                total: 2,
                loaded: 0,
                busy: 0,
                loading: 0,
                failed,
                available: 2 - failed,
                slots: Vec::new(),
            },
        }
    }

    #[test]
    fn test_health_levels() {
        assert_eq!(HealthStatus::assess(&health(true, 2, 0)), HealthStatus::Healthy);
        assert_eq!(HealthStatus::assess(&health(true, 2, 1)), HealthStatus::Degraded);
        assert_eq!(HealthStatus::assess(&health(true, 1, 0)), HealthStatus::Degraded);
        assert_eq!(HealthStatus::assess(&health(true, 2, 2)), HealthStatus::Unhealthy);
        assert_eq!(HealthStatus::assess(&health(true, 0, 0)), HealthStatus::Unhealthy);
        assert_eq!(HealthStatus::assess(&health(false, 2, 0)), HealthStatus::Unhealthy);
    }
}
