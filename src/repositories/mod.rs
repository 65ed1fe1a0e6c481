//! Persistence seams for the cart aggregate and abandonment tracking.
//!
//! Each trait has an in-memory implementation (default backend, tests) and a
//! SeaORM one selected with `storage_backend = "database"`.

pub mod abandonment_repository;
pub mod cart_repository;

pub use abandonment_repository::{
    AbandonmentFilter, AbandonmentRepository, InMemoryAbandonmentRepository,
    SeaOrmAbandonmentRepository,
};
pub use cart_repository::{CartRepository, InMemoryCartRepository, SeaOrmCartRepository};

use crate::{config::AppConfig, db, errors::ServiceError};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tracing::info;

/// The repository pair behind the services, plus the pool when database-backed
#[derive(Clone)]
pub struct Storage {
    pub carts: Arc<dyn CartRepository>,
    pub tracking: Arc<dyn AbandonmentRepository>,
    pub db: Option<Arc<DatabaseConnection>>,
}

impl Storage {
    pub fn in_memory() -> Self {
        Self {
            carts: Arc::new(InMemoryCartRepository::new()),
            tracking: Arc::new(InMemoryAbandonmentRepository::new()),
            db: None,
        }
    }

    pub fn database(db: Arc<DatabaseConnection>) -> Self {
        Self {
            carts: Arc::new(SeaOrmCartRepository::new(db.clone())),
            tracking: Arc::new(SeaOrmAbandonmentRepository::new(db.clone())),
            db: Some(db),
        }
    }

    /// Builds the backend named by `storage_backend`, migrating when configured.
    pub async fn from_config(cfg: &AppConfig) -> Result<Self, ServiceError> {
        if !cfg.uses_database() {
            info!("Using in-memory cart storage");
            return Ok(Self::in_memory());
        }

        let pool = db::establish_connection_from_app_config(cfg).await?;
        if cfg.auto_migrate {
            db::run_migrations(&pool).await?;
        }
        info!("Using database cart storage");
        Ok(Self::database(Arc::new(pool)))
    }
}
