use crate::{
    db::transaction::with_transaction,
    entities::commerce::{cart, cart_item, Cart, CartItem, CartStatus},
    errors::ServiceError,
    services::commerce::cart_service::CartWithItems,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, IntoActiveModel, QueryFilter, QueryOrder, Set,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Whole-aggregate persistence for carts.
///
/// `save` is version-checked: a cart whose `version` is 0 is inserted, any
/// other version must match the stored one or the write is rejected with
/// `ConcurrentModification`. The returned aggregate carries the bumped version.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CartRepository: Send + Sync {
    async fn load(&self, cart_id: Uuid) -> Result<Option<CartWithItems>, ServiceError>;

    async fn find_active_by_user(&self, user_id: Uuid)
        -> Result<Option<CartWithItems>, ServiceError>;

    async fn find_active_by_session(
        &self,
        session_id: &str,
    ) -> Result<Option<CartWithItems>, ServiceError>;

    async fn save(&self, cart: CartWithItems) -> Result<CartWithItems, ServiceError>;

    async fn delete(&self, cart_id: Uuid) -> Result<bool, ServiceError>;

    /// Writes `target` and deletes the source cart as one all-or-nothing unit.
    async fn save_merged(
        &self,
        target: CartWithItems,
        source_cart_id: Uuid,
        source_version: i32,
    ) -> Result<CartWithItems, ServiceError>;

    /// Marks Active guest carts whose expiry is at or before `now` as Expired.
    async fn expire_guest_carts(&self, now: DateTime<Utc>) -> Result<u64, ServiceError>;
}

fn bump_version(mut cart: CartWithItems) -> CartWithItems {
    cart.cart.version += 1;
    cart
}

#[derive(Debug, Default)]
pub struct InMemoryCartRepository {
    carts: RwLock<HashMap<Uuid, CartWithItems>>,
}

impl InMemoryCartRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_version(
        stored: Option<&CartWithItems>,
        cart_id: Uuid,
        expected: i32,
    ) -> Result<(), ServiceError> {
        match (stored, expected) {
            (None, 0) => Ok(()),
            (None, _) => Err(ServiceError::cart_not_found(cart_id)),
            (Some(current), v) if current.cart.version == v => Ok(()),
            (Some(_), _) => Err(ServiceError::ConcurrentModification(cart_id)),
        }
    }

    fn find_active<F>(carts: &HashMap<Uuid, CartWithItems>, owner: F) -> Option<CartWithItems>
    where
        F: Fn(&cart::Model) -> bool,
    {
        carts
            .values()
            .filter(|c| c.cart.status == CartStatus::Active && owner(&c.cart))
            .max_by_key(|c| c.cart.updated_at)
            .cloned()
    }
}

#[async_trait]
impl CartRepository for InMemoryCartRepository {
    async fn load(&self, cart_id: Uuid) -> Result<Option<CartWithItems>, ServiceError> {
        Ok(self.carts.read().await.get(&cart_id).cloned())
    }

    async fn find_active_by_user(
        &self,
        user_id: Uuid,
    ) -> Result<Option<CartWithItems>, ServiceError> {
        let carts = self.carts.read().await;
        Ok(Self::find_active(&carts, |c| c.user_id == Some(user_id)))
    }

    async fn find_active_by_session(
        &self,
        session_id: &str,
    ) -> Result<Option<CartWithItems>, ServiceError> {
        let carts = self.carts.read().await;
        Ok(Self::find_active(&carts, |c| {
            c.user_id.is_none() && c.session_id.as_deref() == Some(session_id)
        }))
    }

    async fn save(&self, cart: CartWithItems) -> Result<CartWithItems, ServiceError> {
        let mut carts = self.carts.write().await;
        let cart_id = cart.cart.id;
        Self::check_version(carts.get(&cart_id), cart_id, cart.cart.version)?;

        let saved = bump_version(cart);
        carts.insert(cart_id, saved.clone());
        Ok(saved)
    }

    async fn delete(&self, cart_id: Uuid) -> Result<bool, ServiceError> {
        Ok(self.carts.write().await.remove(&cart_id).is_some())
    }

    async fn save_merged(
        &self,
        target: CartWithItems,
        source_cart_id: Uuid,
        source_version: i32,
    ) -> Result<CartWithItems, ServiceError> {
        let mut carts = self.carts.write().await;
        let target_id = target.cart.id;
        // check both before touching either
        Self::check_version(carts.get(&target_id), target_id, target.cart.version)?;
        match carts.get(&source_cart_id) {
            Some(source) if source.cart.version == source_version => {}
            Some(_) => return Err(ServiceError::ConcurrentModification(source_cart_id)),
            None => return Err(ServiceError::cart_not_found(source_cart_id)),
        }

        let saved = bump_version(target);
        carts.insert(target_id, saved.clone());
        carts.remove(&source_cart_id);
        Ok(saved)
    }

    async fn expire_guest_carts(&self, now: DateTime<Utc>) -> Result<u64, ServiceError> {
        let mut carts = self.carts.write().await;
        let mut expired = 0;
        for cart in carts.values_mut().map(|c| &mut c.cart) {
            let due = cart.expires_at.map(|at| at <= now).unwrap_or(false);
            if cart.status == CartStatus::Active && cart.user_id.is_none() && due {
                cart.status = CartStatus::Expired;
                cart.updated_at = now;
                cart.version += 1;
                expired += 1;
            }
        }
        Ok(expired)
    }
}

/// SeaORM-backed cart store
#[derive(Clone, Debug)]
pub struct SeaOrmCartRepository {
    db: Arc<DatabaseConnection>,
}

impl SeaOrmCartRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    async fn with_items<C: ConnectionTrait>(
        conn: &C,
        cart: Option<cart::Model>,
    ) -> Result<Option<CartWithItems>, ServiceError> {
        let Some(cart) = cart else {
            return Ok(None);
        };
        let items = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .order_by_asc(cart_item::Column::Position)
            .all(conn)
            .await?;
        Ok(Some(CartWithItems { cart, items }))
    }

    async fn write_aggregate<C: ConnectionTrait>(
        conn: &C,
        cart: CartWithItems,
    ) -> Result<CartWithItems, ServiceError> {
        let cart_id = cart.cart.id;
        let expected = cart.cart.version;
        let saved = bump_version(cart);
        let row = saved.cart.clone().into_active_model().reset_all();

        if expected == 0 {
            row.insert(conn).await?;
        } else {
            let result = Cart::update_many()
                .set(row)
                .filter(cart::Column::Id.eq(cart_id))
                .filter(cart::Column::Version.eq(expected))
                .exec(conn)
                .await?;

            if result.rows_affected == 0 {
                let exists = Cart::find_by_id(cart_id).one(conn).await?.is_some();
                return Err(if exists {
                    ServiceError::ConcurrentModification(cart_id)
                } else {
                    ServiceError::cart_not_found(cart_id)
                });
            }

            CartItem::delete_many()
                .filter(cart_item::Column::CartId.eq(cart_id))
                .exec(conn)
                .await?;
        }

        if !saved.items.is_empty() {
            CartItem::insert_many(
                saved
                    .items
                    .iter()
                    .cloned()
                    .map(|item| item.into_active_model().reset_all()),
            )
            .exec(conn)
            .await?;
        }

        debug!(%cart_id, version = saved.cart.version, "cart aggregate written");
        Ok(saved)
    }

    async fn delete_aggregate<C: ConnectionTrait>(
        conn: &C,
        cart_id: Uuid,
        expected_version: Option<i32>,
    ) -> Result<u64, ServiceError> {
        let mut delete = Cart::delete_many().filter(cart::Column::Id.eq(cart_id));
        if let Some(version) = expected_version {
            delete = delete.filter(cart::Column::Version.eq(version));
        }

        CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .exec(conn)
            .await?;
        Ok(delete.exec(conn).await?.rows_affected)
    }
}

#[async_trait]
impl CartRepository for SeaOrmCartRepository {
    async fn load(&self, cart_id: Uuid) -> Result<Option<CartWithItems>, ServiceError> {
        let db = &*self.db;
        let cart = Cart::find_by_id(cart_id).one(db).await?;
        Self::with_items(db, cart).await
    }

    async fn find_active_by_user(
        &self,
        user_id: Uuid,
    ) -> Result<Option<CartWithItems>, ServiceError> {
        let db = &*self.db;
        let cart = Cart::find()
            .filter(cart::Column::UserId.eq(user_id))
            .filter(cart::Column::Status.eq(CartStatus::Active))
            .order_by_desc(cart::Column::UpdatedAt)
            .one(db)
            .await?;
        Self::with_items(db, cart).await
    }

    async fn find_active_by_session(
        &self,
        session_id: &str,
    ) -> Result<Option<CartWithItems>, ServiceError> {
        let db = &*self.db;
        let cart = Cart::find()
            .filter(cart::Column::SessionId.eq(session_id))
            .filter(cart::Column::UserId.is_null())
            .filter(cart::Column::Status.eq(CartStatus::Active))
            .order_by_desc(cart::Column::UpdatedAt)
            .one(db)
            .await?;
        Self::with_items(db, cart).await
    }

    async fn save(&self, cart: CartWithItems) -> Result<CartWithItems, ServiceError> {
        with_transaction(&self.db, move |txn| {
            Box::pin(async move { Self::write_aggregate(txn, cart).await })
        })
        .await
    }

    async fn delete(&self, cart_id: Uuid) -> Result<bool, ServiceError> {
        let deleted = with_transaction(&self.db, move |txn| {
            Box::pin(async move { Self::delete_aggregate(txn, cart_id, None).await })
        })
        .await?;
        Ok(deleted > 0)
    }

    async fn save_merged(
        &self,
        target: CartWithItems,
        source_cart_id: Uuid,
        source_version: i32,
    ) -> Result<CartWithItems, ServiceError> {
        with_transaction(&self.db, move |txn| {
            Box::pin(async move {
                let saved = Self::write_aggregate(txn, target).await?;
                let deleted =
                    Self::delete_aggregate(txn, source_cart_id, Some(source_version)).await?;
                if deleted == 0 {
                    return Err(ServiceError::ConcurrentModification(source_cart_id));
                }
                Ok(saved)
            })
        })
        .await
    }

    async fn expire_guest_carts(&self, now: DateTime<Utc>) -> Result<u64, ServiceError> {
        let result = Cart::update_many()
            .set(cart::ActiveModel {
                status: Set(CartStatus::Expired),
                updated_at: Set(now),
                ..Default::default()
            })
            .col_expr(
                cart::Column::Version,
                Expr::col(cart::Column::Version).add(1),
            )
            .filter(cart::Column::Status.eq(CartStatus::Active))
            .filter(cart::Column::UserId.is_null())
            .filter(cart::Column::ExpiresAt.lte(now))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected)
    }
}
