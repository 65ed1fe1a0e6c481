use crate::{
    entities::commerce::{cart_abandonment, CartAbandonment, CartAbandonmentModel},
    errors::ServiceError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

/// Selection over tracking rows
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AbandonmentFilter {
    /// Minimum cart value (inclusive)
    pub min_value: Option<Decimal>,
    /// Abandoned at or after
    pub from: Option<DateTime<Utc>>,
    /// Abandoned strictly before
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub include_recovered: bool,
}

impl AbandonmentFilter {
    pub fn matches(&self, row: &CartAbandonmentModel) -> bool {
        (self.include_recovered || !row.recovered)
            && self.min_value.map_or(true, |min| row.cart_value >= min)
            && self.from.map_or(true, |from| row.abandoned_at >= from)
            && self.to.map_or(true, |to| row.abandoned_at < to)
    }
}

#[async_trait]
pub trait AbandonmentRepository: Send + Sync {
    async fn find_by_cart(&self, cart_id: Uuid)
        -> Result<Option<CartAbandonmentModel>, ServiceError>;

    async fn insert(&self, row: CartAbandonmentModel) -> Result<CartAbandonmentModel, ServiceError>;

    async fn update(&self, row: CartAbandonmentModel) -> Result<CartAbandonmentModel, ServiceError>;

    /// Rows matching `filter`, oldest abandonment first.
    async fn list(
        &self,
        filter: &AbandonmentFilter,
    ) -> Result<Vec<CartAbandonmentModel>, ServiceError>;
}

/// Tracking rows keyed by cart id
#[derive(Debug, Default)]
pub struct InMemoryAbandonmentRepository {
    rows: DashMap<Uuid, CartAbandonmentModel>,
}

impl InMemoryAbandonmentRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AbandonmentRepository for InMemoryAbandonmentRepository {
    async fn find_by_cart(
        &self,
        cart_id: Uuid,
    ) -> Result<Option<CartAbandonmentModel>, ServiceError> {
        Ok(self.rows.get(&cart_id).map(|row| row.value().clone()))
    }

    async fn insert(&self, row: CartAbandonmentModel) -> Result<CartAbandonmentModel, ServiceError> {
        use dashmap::mapref::entry::Entry;

        match self.rows.entry(row.cart_id) {
            Entry::Occupied(_) => Err(ServiceError::InvalidOperation(format!(
                "Cart {} is already tracked",
                row.cart_id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(row.clone());
                Ok(row)
            }
        }
    }

    async fn update(&self, row: CartAbandonmentModel) -> Result<CartAbandonmentModel, ServiceError> {
        match self.rows.get_mut(&row.cart_id) {
            Some(mut existing) => {
                *existing = row.clone();
                Ok(row)
            }
            None => Err(ServiceError::NotFound(format!(
                "No abandonment tracking for cart {}",
                row.cart_id
            ))),
        }
    }

    async fn list(
        &self,
        filter: &AbandonmentFilter,
    ) -> Result<Vec<CartAbandonmentModel>, ServiceError> {
        let mut rows: Vec<_> = self
            .rows
            .iter()
            .filter(|row| filter.matches(row.value()))
            .map(|row| row.value().clone())
            .collect();
        rows.sort_by_key(|row| row.abandoned_at);
        Ok(rows)
    }
}

#[derive(Clone, Debug)]
pub struct SeaOrmAbandonmentRepository {
    db: Arc<DatabaseConnection>,
}

impl SeaOrmAbandonmentRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AbandonmentRepository for SeaOrmAbandonmentRepository {
    async fn find_by_cart(
        &self,
        cart_id: Uuid,
    ) -> Result<Option<CartAbandonmentModel>, ServiceError> {
        Ok(CartAbandonment::find()
            .filter(cart_abandonment::Column::CartId.eq(cart_id))
            .one(&*self.db)
            .await?)
    }

    async fn insert(&self, row: CartAbandonmentModel) -> Result<CartAbandonmentModel, ServiceError> {
        Ok(row.into_active_model().reset_all().insert(&*self.db).await?)
    }

    async fn update(&self, row: CartAbandonmentModel) -> Result<CartAbandonmentModel, ServiceError> {
        Ok(row.into_active_model().reset_all().update(&*self.db).await?)
    }

    async fn list(
        &self,
        filter: &AbandonmentFilter,
    ) -> Result<Vec<CartAbandonmentModel>, ServiceError> {
        let mut query = CartAbandonment::find();
        if !filter.include_recovered {
            query = query.filter(cart_abandonment::Column::Recovered.eq(false));
        }
        if let Some(min) = filter.min_value {
            query = query.filter(cart_abandonment::Column::CartValue.gte(min));
        }
        if let Some(from) = filter.from {
            query = query.filter(cart_abandonment::Column::AbandonedAt.gte(from));
        }
        if let Some(to) = filter.to {
            query = query.filter(cart_abandonment::Column::AbandonedAt.lt(to));
        }

        Ok(query
            .order_by_asc(cart_abandonment::Column::AbandonedAt)
            .all(&*self.db)
            .await?)
    }
}
