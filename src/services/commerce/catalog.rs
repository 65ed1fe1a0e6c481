//! Product lookups against the catalog collaborator.
//!
//! The cart core never owns product data; it asks a [`CatalogLookup`] for the
//! current price, availability and display fields of a product and snapshots
//! what it needs onto the cart line.

use crate::{config::AppConfig, errors::ServiceError};
use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Catalog view of a product
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogProduct {
    pub id: Uuid,
    pub name: String,
    pub price: Decimal,
    pub currency: String,
    pub active: bool,
    pub stock_quantity: i32,
    #[serde(default = "default_true")]
    pub tracks_inventory: bool,
    #[serde(default)]
    pub allows_backorder: bool,
    #[serde(default)]
    pub category: Option<String>,
    pub vendor_id: Uuid,
    #[serde(default)]
    pub image_url: Option<String>,
}

fn default_true() -> bool {
    true
}

impl CatalogProduct {
    pub fn in_stock(&self) -> bool {
        !self.tracks_inventory || self.allows_backorder || self.stock_quantity > 0
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CatalogLookup: Send + Sync {
    /// `Ok(None)` when the catalog does not know the product.
    async fn get_product(&self, product_id: Uuid) -> Result<Option<CatalogProduct>, ServiceError>;
}

/// Process-local catalog, used by default and in tests
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    products: DashMap<Uuid, CatalogProduct>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, product: CatalogProduct) {
        self.products.insert(product.id, product);
    }
}

#[async_trait]
impl CatalogLookup for InMemoryCatalog {
    async fn get_product(&self, product_id: Uuid) -> Result<Option<CatalogProduct>, ServiceError> {
        Ok(self.products.get(&product_id).map(|entry| entry.value().clone()))
    }
}

/// Catalog reached over HTTP: `GET {base_url}/products/{id}`
#[derive(Clone, Debug)]
pub struct HttpCatalogClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCatalogClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("failed to build catalog client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl CatalogLookup for HttpCatalogClient {
    #[instrument(skip(self))]
    async fn get_product(&self, product_id: Uuid) -> Result<Option<CatalogProduct>, ServiceError> {
        let url = format!("{}/products/{}", self.base_url, product_id);
        let response = self.client.get(&url).send().await.map_err(|e| {
            warn!(error = %e, "catalog request failed");
            ServiceError::Catalog(format!("catalog request failed: {}", e))
        })?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response
                .json::<CatalogProduct>()
                .await
                .map(Some)
                .map_err(|e| ServiceError::Catalog(format!("invalid catalog response: {}", e))),
            status => {
                warn!(%status, "catalog returned an error status");
                Err(ServiceError::Catalog(format!(
                    "catalog returned {} for product {}",
                    status, product_id
                )))
            }
        }
    }
}

/// HTTP catalog when `catalog_base_url` is set, otherwise an empty in-memory one.
pub fn catalog_from_config(cfg: &AppConfig) -> Result<Arc<dyn CatalogLookup>, ServiceError> {
    match cfg.catalog_base_url.as_deref().filter(|url| !url.trim().is_empty()) {
        Some(url) => {
            info!(base_url = url, "Using HTTP catalog");
            let timeout = Duration::from_secs(cfg.catalog_timeout_secs);
            Ok(Arc::new(HttpCatalogClient::new(url, timeout)?))
        }
        None => {
            warn!("catalog_base_url is not set; using an empty in-memory catalog");
            Ok(Arc::new(InMemoryCatalog::new()))
        }
    }
}
