//! StateSet Cart Library
//!
//! Shopping-cart core for the StateSet commerce API: cart lifecycle, pricing,
//! coupons, checkout validation and abandonment tracking, served over HTTP.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod migrator;
pub mod repositories;
pub mod services;
pub mod tracing;

use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::AppConfig>,
    pub event_sender: Arc<events::EventSender>,
    pub services: handlers::AppServices,
    pub storage: repositories::Storage,
}

impl AppState {
    /// Wires services over `storage` and `catalog`.
    pub fn new(
        config: config::AppConfig,
        storage: repositories::Storage,
        catalog: Arc<dyn services::commerce::CatalogLookup>,
        event_sender: Arc<events::EventSender>,
    ) -> Self {
        let services = handlers::AppServices::new(
            &config,
            storage.carts.clone(),
            storage.tracking.clone(),
            catalog,
            event_sender.clone(),
        );
        Self {
            config: Arc::new(config),
            event_sender,
            services,
            storage,
        }
    }
}

// Common response wrappers
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub errors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Debug, Serialize)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            request_id: crate::tracing::current_request_id().map(|rid| rid.as_str().to_string()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            errors: None,
            meta: Some(ResponseMeta::capture()),
        }
    }

    /// Failure that still carries a payload, e.g. a validation report.
    pub fn rejected(data: T, message: impl Into<String>, errors: Vec<String>) -> Self {
        Self {
            success: false,
            data: Some(data),
            message: Some(message.into()),
            errors: Some(errors),
            meta: Some(ResponseMeta::capture()),
        }
    }
}


/// Versioned API routes
pub fn api_v1_routes() -> Router<Arc<AppState>> {
    use handlers::commerce;

    Router::new()
        .nest(
            "/carts",
            commerce::carts_routes().merge(commerce::cart_abandonment_routes()),
        )
        .nest("/abandoned-carts", commerce::abandoned_carts_routes())
        .nest("/maintenance", commerce::maintenance_routes())
}

/// Full HTTP application: health, `/api/v1`, request ids and request tracing.
pub fn build_router(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api_v1_routes())
        .layer(TraceLayer::new_for_http().make_span_with(crate::tracing::RequestSpanMaker))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT));

    if !state.config.is_production() {
        app = app.layer(CorsLayer::permissive());
    }

    app.layer(axum::middleware::from_fn(
        crate::tracing::request_id_middleware,
    ))
    .with_state(state)
}

async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<ApiResponse<Value>>) {
    let database = match &state.storage.db {
        Some(db) => match db.ping().await {
            Ok(()) => "healthy",
            Err(e) => {
                ::tracing::warn!(error = %e, "database ping failed");
                "unhealthy"
            }
        },
        None => "not_configured",
    };
    let healthy = database != "unhealthy";

    let body = json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "service": "stateset-cart",
        "version": env!("CARGO_PKG_VERSION"),
        "storage_backend": state.config.storage_backend,
        "checks": { "database": database },
    });
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ApiResponse::success(body)))
}
