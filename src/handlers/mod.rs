pub mod config;
pub mod info;
pub mod jobs;
pub mod models;
pub mod transcribe;

use crate::health;
use actix_web::web;

/// Register every route. Used by `main` and by the handler tests.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(info::index))
        .route("/docs", web::get().to(info::docs))
        .route("/health", web::get().to(health::health_check))
        .route("/transcribe", web::post().to(transcribe::transcribe))
        .service(
            web::scope("/api/v1")
                .route("/health", web::get().to(health::health_check))
                .route("/metrics", web::get().to(health::detailed_metrics))
                .route("/config", web::get().to(config::get_config))
                .route("/models", web::get().to(models::list_models))
                .route("/transcribe", web::post().to(transcribe::transcribe))
                .route("/queue", web::get().to(jobs::queue_stats))
                .route("/jobs", web::get().to(jobs::list_jobs))
                .route("/jobs/{id}", web::get().to(jobs::get_job))
                .route("/jobs/{id}", web::delete().to(jobs::cancel_job))
                .route("/jobs/{id}/result", web::get().to(jobs::get_result))
                .route("/admin/cleanup", web::post().to(jobs::run_cleanup)),
        );
}
