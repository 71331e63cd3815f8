pub mod wsroute;

use crate::metrics::metrics_handler;
use actix_web::{web, HttpResponse};
use serde_json::json;

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/metrics", web::get().to(metrics_handler))
        .service(wsroute::ws_handler);
}
