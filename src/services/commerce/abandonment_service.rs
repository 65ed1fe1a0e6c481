use crate::{
    entities::commerce::{AbandonmentStage, CartAbandonmentModel},
    errors::ServiceError,
    events::{Event, EventSender},
    repositories::{AbandonmentFilter, AbandonmentRepository, CartRepository},
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Bookkeeping for abandoned carts and their recovery.
///
/// Never changes a cart's status; that belongs to [`super::CartService`].
#[derive(Clone)]
pub struct AbandonmentService {
    tracking: Arc<dyn AbandonmentRepository>,
    carts: Arc<dyn CartRepository>,
    event_sender: Arc<EventSender>,
}

impl AbandonmentService {
    pub fn new(
        tracking: Arc<dyn AbandonmentRepository>,
        carts: Arc<dyn CartRepository>,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            tracking,
            carts,
            event_sender,
        }
    }

    /// Records an abandonment signal, updating the cart's row in place when one
    /// already exists.
    ///
    /// # Arguments
    ///
    /// * `cart_id` - The tracked cart; must exist
    /// * `stage` - Checkout phase the shopper left from
    /// * `last_page` - Last page visited, if known
    ///
    /// # Returns
    ///
    /// * `Ok(Model)` - The created or updated row, with the cart's current total
    /// * `Err(ServiceError::NotFound)` - Unknown cart
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let row = abandonment
    ///     .track_abandonment(cart_id, AbandonmentStage::Payment, Some("/checkout/pay".into()))
    ///     .await?;
    /// assert!(!row.recovered);
    /// ```
    #[instrument(skip(self))]
    pub async fn track_abandonment(
        &self,
        cart_id: Uuid,
        stage: AbandonmentStage,
        last_page: Option<String>,
    ) -> Result<CartAbandonmentModel, ServiceError> {
        let cart = self
            .carts
            .load(cart_id)
            .await?
            .ok_or_else(|| ServiceError::cart_not_found(cart_id))?;
        let now = Utc::now();

        let row = match self.tracking.find_by_cart(cart_id).await? {
            Some(existing) => {
                self.tracking
                    .update(CartAbandonmentModel {
                        stage,
                        last_page,
                        cart_value: cart.cart.total,
                        updated_at: now,
                        ..existing
                    })
                    .await?
            }
            None => {
                let fresh = CartAbandonmentModel {
                    id: Uuid::new_v4(),
                    cart_id,
                    stage,
                    last_page: last_page.clone(),
                    cart_value: cart.cart.total,
                    abandoned_at: now,
                    emails_sent: 0,
                    clicks: 0,
                    last_email_at: None,
                    recovered: false,
                    recovered_at: None,
                    recovered_order_id: None,
                    created_at: now,
                    updated_at: now,
                };
                match self.tracking.insert(fresh).await {
                    Ok(row) => row,
                    // lost an insert race: fall back to the in-place update
                    Err(err) => match self.tracking.find_by_cart(cart_id).await? {
                        Some(existing) => {
                            self.tracking
                                .update(CartAbandonmentModel {
                                    stage,
                                    last_page,
                                    cart_value: cart.cart.total,
                                    updated_at: now,
                                    ..existing
                                })
                                .await?
                        }
                        None => return Err(err),
                    },
                }
            }
        };

        self.event_sender.send_or_log(Event::AbandonmentTracked {
            cart_id,
            stage: stage.as_str().to_string(),
        });
        info!(%cart_id, stage = stage.as_str(), "Tracked cart abandonment");
        Ok(row)
    }

    /// Marks the cart's tracking row recovered. `Ok(None)` when the cart was
    /// never tracked.
    #[instrument(skip(self))]
    pub async fn mark_recovered(
        &self,
        cart_id: Uuid,
        order_id: Uuid,
    ) -> Result<Option<CartAbandonmentModel>, ServiceError> {
        let Some(row) = self.tracking.find_by_cart(cart_id).await? else {
            return Ok(None);
        };
        if row.recovered {
            return Ok(Some(row));
        }

        let now = Utc::now();
        let row = self
            .tracking
            .update(CartAbandonmentModel {
                recovered: true,
                recovered_at: Some(now),
                recovered_order_id: Some(order_id),
                updated_at: now,
                ..row
            })
            .await?;

        self.event_sender
            .send_or_log(Event::CartRecovered { cart_id, order_id });
        info!(%cart_id, %order_id, "Abandoned cart recovered");
        Ok(Some(row))
    }

    /// Unrecovered rows abandoned strictly before `older_than`.
    pub async fn get_unrecovered(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<CartAbandonmentModel>, ServiceError> {
        let filter = AbandonmentFilter {
            to: Some(older_than),
            include_recovered: false,
            ..Default::default()
        };
        let mut rows = self.tracking.list(&filter).await?;
        rows.retain(|row| !row.recovered);
        Ok(rows)
    }

    /// Rows matching `filter`: minimum cart value, `[from, to)` window on
    /// `abandoned_at`, and optionally recovered rows too.
    pub async fn list_abandoned(
        &self,
        filter: &AbandonmentFilter,
    ) -> Result<Vec<CartAbandonmentModel>, ServiceError> {
        if let (Some(from), Some(to)) = (filter.from, filter.to) {
            if from > to {
                return Err(ServiceError::InvalidInput(
                    "`from` must not be after `to`".to_string(),
                ));
            }
        }
        self.tracking.list(filter).await
    }

    #[instrument(skip(self))]
    pub async fn record_recovery_email(
        &self,
        cart_id: Uuid,
    ) -> Result<CartAbandonmentModel, ServiceError> {
        let row = self.tracked_unrecovered(cart_id).await?;
        let now = Utc::now();
        self.tracking
            .update(CartAbandonmentModel {
                emails_sent: row.emails_sent + 1,
                last_email_at: Some(now),
                updated_at: now,
                ..row
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn record_recovery_click(
        &self,
        cart_id: Uuid,
    ) -> Result<CartAbandonmentModel, ServiceError> {
        let row = self.tracked_unrecovered(cart_id).await?;
        self.tracking
            .update(CartAbandonmentModel {
                clicks: row.clicks + 1,
                updated_at: Utc::now(),
                ..row
            })
            .await
    }

    async fn tracked_unrecovered(&self, cart_id: Uuid) -> Result<CartAbandonmentModel, ServiceError> {
        let row = self.tracking.find_by_cart(cart_id).await?.ok_or_else(|| {
            ServiceError::NotFound(format!("No abandonment tracking for cart {}", cart_id))
        })?;
        if row.recovered {
            warn!(%cart_id, "recovery activity on an already recovered cart");
            return Err(ServiceError::InvalidOperation(format!(
                "Cart {} has already been recovered",
                cart_id
            )));
        }
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::{InMemoryAbandonmentRepository, InMemoryCartRepository};
    use crate::services::commerce::cart_service::tests::guest_cart;
    use assert_matches::assert_matches;
    use chrono::Duration;
    use tokio::sync::mpsc;

    async fn service() -> (AbandonmentService, Arc<InMemoryCartRepository>, Uuid) {
        let carts = Arc::new(InMemoryCartRepository::new());
        let cart = carts.save(guest_cart("sess")).await.unwrap();
        let (tx, _rx) = mpsc::channel(16);
        let service = AbandonmentService::new(
            Arc::new(InMemoryAbandonmentRepository::new()),
            carts.clone(),
            Arc::new(EventSender::new(tx)),
        );
        (service, carts, cart.cart.id)
    }

    #[tokio::test]
    async fn tracking_upserts_one_row_per_cart() {
        let (service, _, cart_id) = service().await;

        let first = service
            .track_abandonment(cart_id, AbandonmentStage::Cart, Some("/cart".into()))
            .await
            .unwrap();
        let second = service
            .track_abandonment(cart_id, AbandonmentStage::Payment, Some("/pay".into()))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.stage, AbandonmentStage::Payment);
        assert_eq!(second.last_page.as_deref(), Some("/pay"));
        assert_eq!(second.abandoned_at, first.abandoned_at);

        let all = service
            .list_abandoned(&AbandonmentFilter {
                include_recovered: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn unknown_cart_cannot_be_tracked() {
        let (service, _, _) = service().await;
        assert_matches!(
            service
                .track_abandonment(Uuid::new_v4(), AbandonmentStage::Cart, None)
                .await,
            Err(ServiceError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn recovered_rows_are_never_unrecovered() {
        let (service, _, cart_id) = service().await;
        service
            .track_abandonment(cart_id, AbandonmentStage::Checkout, None)
            .await
            .unwrap();

        let future = Utc::now() + Duration::hours(1);
        assert_eq!(service.get_unrecovered(future).await.unwrap().len(), 1);
        // strict cutoff
        let past = Utc::now() - Duration::hours(1);
        assert!(service.get_unrecovered(past).await.unwrap().is_empty());

        let order_id = Uuid::new_v4();
        let row = service.mark_recovered(cart_id, order_id).await.unwrap().unwrap();
        assert!(row.recovered);
        assert_eq!(row.recovered_order_id, Some(order_id));
        assert!(service.get_unrecovered(future).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mark_recovered_without_row_is_a_no_op() {
        let (service, _, cart_id) = service().await;
        assert!(service
            .mark_recovered(cart_id, Uuid::new_v4())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn recovery_counters_increment() {
        let (service, _, cart_id) = service().await;
        service
            .track_abandonment(cart_id, AbandonmentStage::Cart, None)
            .await
            .unwrap();

        service.record_recovery_email(cart_id).await.unwrap();
        let row = service.record_recovery_email(cart_id).await.unwrap();
        assert_eq!(row.emails_sent, 2);
        assert!(row.last_email_at.is_some());

        let row = service.record_recovery_click(cart_id).await.unwrap();
        assert_eq!(row.clicks, 1);

        service.mark_recovered(cart_id, Uuid::new_v4()).await.unwrap();
        assert_matches!(
            service.record_recovery_click(cart_id).await,
            Err(ServiceError::InvalidOperation(_))
        );
    }

    #[tokio::test]
    async fn list_rejects_inverted_range() {
        let (service, _, _) = service().await;
        let now = Utc::now();
        let filter = AbandonmentFilter {
            from: Some(now),
            to: Some(now - Duration::days(1)),
            ..Default::default()
        };
        assert_matches!(
            service.list_abandoned(&filter).await,
            Err(ServiceError::InvalidInput(_))
        );
    }
}
