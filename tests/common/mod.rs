#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::{self, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use rust_decimal::Decimal;
use serde_json::Value;
use stateset_cart::{
    build_router,
    config::AppConfig,
    events::{self, EventSender},
    handlers::AppServices,
    repositories::Storage,
    services::commerce::{CatalogProduct, InMemoryCatalog},
    AppState,
};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

/// Helper harness for spinning up an application over in-memory storage and catalog.
pub struct TestApp {
    router: Router,
    pub state: Arc<AppState>,
    pub catalog: Arc<InMemoryCatalog>,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    /// Construct a new test application with default configuration.
    pub async fn new() -> Self {
        Self::with_config(AppConfig::default()).await
    }

    pub async fn with_config(cfg: AppConfig) -> Self {
        Self::with_storage(cfg, Storage::in_memory()).await
    }

    pub async fn with_storage(cfg: AppConfig, storage: Storage) -> Self {
        let catalog = Arc::new(InMemoryCatalog::new());

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = Arc::new(EventSender::new(event_tx));
        let event_task = tokio::spawn(events::process_events(event_rx));

        let state = Arc::new(AppState::new(cfg, storage, catalog.clone(), event_sender));
        let router = build_router(state.clone());

        Self {
            router,
            state,
            catalog,
            _event_task: event_task,
        }
    }

    pub fn services(&self) -> &AppServices {
        &self.state.services
    }

    /// Registers an active, in-stock USD product with its own vendor.
    pub fn add_product(&self, name: &str, price: Decimal) -> CatalogProduct {
        self.add_product_from(name, price, Uuid::new_v4(), None)
    }

    pub fn add_product_from(
        &self,
        name: &str,
        price: Decimal,
        vendor_id: Uuid,
        category: Option<&str>,
    ) -> CatalogProduct {
        let product = CatalogProduct {
            id: Uuid::new_v4(),
            name: name.to_string(),
            price,
            currency: "USD".to_string(),
            active: true,
            stock_quantity: 100,
            tracks_inventory: true,
            allows_backorder: false,
            category: category.map(str::to_string),
            vendor_id,
            image_url: None,
        };
        self.catalog.upsert(product.clone());
        product
    }

    pub async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        self.router
            .clone()
            .oneshot(builder.body(body).expect("request"))
            .await
            .expect("router response")
    }
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}

/// Reads a serialized decimal (string or number) for scale-insensitive comparison.
pub fn money(value: &Value) -> Decimal {
    match value {
        Value::String(s) => s.parse().expect("decimal string"),
        Value::Number(n) => n.to_string().parse().expect("decimal number"),
        other => panic!("expected a money value, got {other}"),
    }
}
