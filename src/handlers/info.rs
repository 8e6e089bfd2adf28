//! Service info (`GET /`) and the static API reference page (`GET /docs`).

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn index(state: web::Data<AppState>) -> HttpResponse {
    let config = &state.config;
    HttpResponse::Ok().json(json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "model": config.models.whisper_model,
        "workers": config.pipeline.workers,
        "default_mode": config.api.default_mode,
        "supported_formats": config.storage.allowed_extensions,
        "max_file_size_mb": config.storage.max_artifact_bytes / (1024 * 1024),
        "docs": "/docs",
        "health": "/health",
    }))
}

pub async fn docs() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(DOCS_HTML)
}

const DOCS_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Whisper Queue API</title>
<style>
body { font-family: sans-serif; max-width: 880px; margin: 2em auto; line-height: 1.5; }
code { background: #f2f2f2; padding: 0 4px; }
table { border-collapse: collapse; width: 100%; }
td, th { border: 1px solid #ddd; padding: 6px; text-align: left; vertical-align: top; }
</style>
</head>
<body>
<h1>Whisper Queue API</h1>
<p>Upload audio, receive a job id, collect the transcript when it is ready.</p>
<table>
<tr><th>Method</th><th>Path</th><th>Description</th></tr>
<tr><td>GET</td><td><code>/</code></td><td>Service information</td></tr>
<tr><td>GET</td><td><code>/health</code></td><td>Workers, model slots and queue depth. 503 when unhealthy.</td></tr>
<tr><td>POST</td><td><code>/transcribe</code></td><td>Multipart upload. Fields: <code>file</code> (or <code>audio</code>), optional <code>language</code>, optional <code>task</code> (<code>transcribe</code> | <code>translate</code>). Query <code>?wait=true</code> blocks for the result; otherwise 202 with a job id. 503 with <code>Retry-After</code> when the queue is full, 413 when the file is too large.</td></tr>
<tr><td>GET</td><td><code>/api/v1/jobs</code></td><td>Recent jobs. Query: <code>status</code>, <code>limit</code>.</td></tr>
<tr><td>GET</td><td><code>/api/v1/jobs/{id}</code></td><td>Job status and queue position.</td></tr>
<tr><td>GET</td><td><code>/api/v1/jobs/{id}/result</code></td><td>200 transcript, 202 pending, 422 failed, 503 with <code>Retry-After</code> when no model instance freed up in time, 410 cancelled, 404 unknown or expired.</td></tr>
<tr><td>DELETE</td><td><code>/api/v1/jobs/{id}</code></td><td>Cancel. Queued jobs never run; running jobs have their result discarded.</td></tr>
<tr><td>GET</td><td><code>/api/v1/queue</code></td><td>Queue statistics.</td></tr>
<tr><td>GET</td><td><code>/api/v1/models</code></td><td>Model sizes, registry slots and devices.</td></tr>
<tr><td>GET</td><td><code>/api/v1/metrics</code></td><td>HTTP and pipeline metrics.</td></tr>
<tr><td>GET</td><td><code>/api/v1/config</code></td><td>Effective configuration.</td></tr>
<tr><td>POST</td><td><code>/api/v1/admin/cleanup</code></td><td>Run one cleanup pass now.</td></tr>
</table>
<h2>Errors</h2>
<pre>{"error": {"type": "overloaded", "message": "job queue is full", "timestamp": "..."}}</pre>
</body>
</html>
"#;
