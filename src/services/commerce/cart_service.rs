use crate::{
    config::CartConfig,
    entities::commerce::{CartItemModel, CartModel, CartStatus, ShippingAddress},
    errors::ServiceError,
    events::{Event, EventSender},
    repositories::CartRepository,
    services::commerce::{
        abandonment_service::AbandonmentService,
        catalog::{CatalogLookup, CatalogProduct},
        coupon_service::CouponEvaluator,
        pricing_service::{apply_line_allocations, PricingEngine},
    },
};
use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// Largest quantity a single line may hold.
pub const MAX_LINE_QUANTITY: i32 = 9_999;

/// Largest number of priced units across all lines of one cart.
pub const MAX_CART_QUANTITY: i64 = 99_999;

/// Cart lifecycle manager.
///
/// Every mutation follows the same path: load the aggregate, apply the change,
/// reprice (re-evaluating the coupon when configured), then write items and
/// totals back as one version-checked save. Events are emitted best-effort
/// after the write succeeds.
///
/// The service owns:
/// - Cart lookup/creation keyed by user or guest session
/// - Line mutations, save-for-later and merge of a guest cart into a user cart
/// - Coupon application and removal
/// - Status transitions (Converted, Abandoned, Expired)
///
/// # Examples
///
/// ```ignore
/// use stateset_cart::services::commerce::{AddItemInput, CartOwner};
///
/// let (cart, _created) = cart_service
///     .get_or_create(CartOwner { user_id: None, session_id: Some("sess-42".into()) }, None)
///     .await?;
///
/// let cart = cart_service
///     .add_item(cart.cart.id, AddItemInput {
///         product_id,
///         variant_id: None,
///         quantity: 2,
///         is_gift: false,
///         gift_message: None,
///     })
///     .await?;
/// assert_eq!(cart.cart.item_count, 2);
/// ```
#[derive(Clone)]
pub struct CartService {
    carts: Arc<dyn CartRepository>,
    catalog: Arc<dyn CatalogLookup>,
    pricing: Arc<PricingEngine>,
    coupons: Arc<CouponEvaluator>,
    abandonment: Arc<AbandonmentService>,
    event_sender: Arc<EventSender>,
    settings: CartConfig,
}

impl CartService {
    /// Creates a new `CartService`.
    ///
    /// # Arguments
    ///
    /// * `carts` - Cart aggregate store
    /// * `catalog` - Product lookup used to snapshot price and display fields
    /// * `pricing` - Tax and shipping engine
    /// * `coupons` - Coupon rule table
    /// * `abandonment` - Tracker marked recovered on conversion
    /// * `event_sender` - Best-effort event channel
    /// * `settings` - Currency, guest TTL and coupon revalidation switch
    pub fn new(
        carts: Arc<dyn CartRepository>,
        catalog: Arc<dyn CatalogLookup>,
        pricing: Arc<PricingEngine>,
        coupons: Arc<CouponEvaluator>,
        abandonment: Arc<AbandonmentService>,
        event_sender: Arc<EventSender>,
        settings: CartConfig,
    ) -> Self {
        Self {
            carts,
            catalog,
            pricing,
            coupons,
            abandonment,
            event_sender,
            settings,
        }
    }

    /// Finds the owner's Active cart (user first, then session) or creates one.
    ///
    /// Guest carts expire after `guest_cart_ttl_days`; user carts never do.
    /// Publishes `CartCreated` when a cart is created.
    ///
    /// # Arguments
    ///
    /// * `owner` - User id and/or guest session id; at least one is required
    /// * `currency` - ISO 4217 code for a new cart; defaults to `default_currency`
    ///
    /// # Returns
    ///
    /// * `Ok((cart, created))` - The cart and whether it was newly created
    /// * `Err(ServiceError::InvalidInput)` - No owner key, or a malformed currency
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let (cart, created) = cart_service
    ///     .get_or_create(CartOwner { user_id: Some(user_id), session_id: None }, Some("eur".into()))
    ///     .await?;
    /// assert_eq!(cart.cart.currency, "EUR");
    /// ```
    #[instrument(skip(self))]
    pub async fn get_or_create(
        &self,
        owner: CartOwner,
        currency: Option<String>,
    ) -> Result<(CartWithItems, bool), ServiceError> {
        let session_id = owner
            .session_id
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        if let Some(user_id) = owner.user_id {
            if let Some(cart) = self.carts.find_active_by_user(user_id).await? {
                return Ok((cart, false));
            }
        }
        if let Some(session) = session_id.as_deref() {
            if let Some(cart) = self.carts.find_active_by_session(session).await? {
                return Ok((cart, false));
            }
        }
        if owner.user_id.is_none() && session_id.is_none() {
            return Err(ServiceError::InvalidInput(
                "Either user_id or session_id is required".to_string(),
            ));
        }

        let currency = match currency.map(|c| c.trim().to_ascii_uppercase()) {
            Some(c) if c.len() == 3 && c.chars().all(|ch| ch.is_ascii_alphabetic()) => c,
            Some(c) => {
                return Err(ServiceError::InvalidInput(format!(
                    "Invalid currency code: {}",
                    c
                )))
            }
            None => self.settings.default_currency.clone(),
        };

        let now = Utc::now();
        let (session_id, expires_at) = match owner.user_id {
            Some(_) => (None, None),
            None => (
                session_id,
                Some(now + Duration::days(self.settings.guest_cart_ttl_days)),
            ),
        };

        let cart = CartWithItems {
            cart: CartModel {
                id: Uuid::new_v4(),
                user_id: owner.user_id,
                session_id,
                status: CartStatus::Active,
                currency,
                item_count: 0,
                vendor_count: 0,
                subtotal: Decimal::ZERO,
                tax_total: Decimal::ZERO,
                shipping_total: Decimal::ZERO,
                discount_total: Decimal::ZERO,
                total: Decimal::ZERO,
                shipping_address: None,
                coupon_code: None,
                expires_at,
                last_activity_at: now,
                converted_order_id: None,
                version: 0,
                created_at: now,
                updated_at: now,
            },
            items: Vec::new(),
        };

        let cart_id = cart.cart.id;
        let saved = self.carts.save(cart).await?;
        self.event_sender.send_or_log(Event::CartCreated(cart_id));

        info!(%cart_id, guest = saved.cart.is_guest(), "Created cart");
        Ok((saved, true))
    }

    /// Loads a cart with its lines in any status.
    ///
    /// # Returns
    ///
    /// * `Ok(CartWithItems)` - The aggregate
    /// * `Err(ServiceError::NotFound)` - Unknown cart id
    #[instrument(skip(self))]
    pub async fn get_cart(&self, cart_id: Uuid) -> Result<CartWithItems, ServiceError> {
        self.carts
            .load(cart_id)
            .await?
            .ok_or_else(|| ServiceError::cart_not_found(cart_id))
    }

    /// Adds `quantity` of a product, merging into an existing line with the
    /// same (product, variant) key. Price and display fields are snapshotted
    /// from the catalog.
    ///
    /// Stock is not checked here; the validator reports it at checkout.
    ///
    /// # Arguments
    ///
    /// * `cart_id` - Target Active cart
    /// * `input` - Product, optional variant, quantity (1..=9999) and gift flags
    ///
    /// # Returns
    ///
    /// * `Ok(CartWithItems)` - The repriced cart
    /// * `Err(ServiceError::NotFound)` - Cart or product not found
    /// * `Err(ServiceError::InvalidOperation)` - Cart not Active, product inactive
    ///   or priced in another currency
    /// * `Err(ServiceError::InvalidInput)` - Quantity out of range, or the cart
    ///   would exceed [`MAX_LINE_QUANTITY`] / [`MAX_CART_QUANTITY`]
    /// * `Err(ServiceError::ConcurrentModification)` - Another writer saved first
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let cart = cart_service
    ///     .add_item(cart_id, AddItemInput {
    ///         product_id,
    ///         variant_id: Some(variant_id),
    ///         quantity: 1,
    ///         is_gift: true,
    ///         gift_message: Some("Happy birthday".into()),
    ///     })
    ///     .await?;
    /// ```
    #[instrument(skip(self))]
    pub async fn add_item(
        &self,
        cart_id: Uuid,
        input: AddItemInput,
    ) -> Result<CartWithItems, ServiceError> {
        input.validate()?;

        let mut cart = self.load_mutable(cart_id).await?;
        let product = self
            .purchasable_product(input.product_id, &cart.cart.currency)
            .await?;
        let now = Utc::now();

        match cart.find_line(input.product_id, input.variant_id) {
            Some(idx) => {
                let line = &mut cart.items[idx];
                line.quantity = line
                    .quantity
                    .checked_add(input.quantity)
                    .ok_or_else(|| ServiceError::InvalidInput("Quantity is too large".into()))?;
                line.saved_for_later = false;
                line.is_gift |= input.is_gift;
                if input.gift_message.is_some() {
                    line.gift_message = input.gift_message.clone();
                }
                refresh_snapshot(line, &product, now);
            }
            None => {
                let position = cart.next_position();
                let mut line = CartItemModel {
                    id: Uuid::new_v4(),
                    cart_id,
                    product_id: input.product_id,
                    variant_id: input.variant_id,
                    vendor_id: product.vendor_id,
                    quantity: input.quantity,
                    unit_price: product.price,
                    line_total: Decimal::ZERO,
                    currency: cart.cart.currency.clone(),
                    discount_amount: Decimal::ZERO,
                    tax_amount: Decimal::ZERO,
                    product_name: product.name.clone(),
                    image_url: None,
                    category: None,
                    saved_for_later: false,
                    is_gift: input.is_gift,
                    gift_message: input.gift_message.clone(),
                    in_stock: true,
                    stock_quantity: None,
                    position,
                    created_at: now,
                    updated_at: now,
                };
                refresh_snapshot(&mut line, &product, now);
                cart.items.push(line);
            }
        }

        let mut events = self.reprice(&mut cart, self.settings.revalidate_coupons)?;
        events.push(Event::CartItemAdded {
            cart_id,
            product_id: input.product_id,
            quantity: input.quantity,
        });
        let saved = self.persist(cart, events).await?;

        info!(
            "Added item to cart {}: product {} x{}",
            cart_id, input.product_id, input.quantity
        );
        Ok(saved)
    }

    /// Patches a line. A quantity of zero or less removes it.
    #[instrument(skip(self))]
    pub async fn update_item(
        &self,
        cart_id: Uuid,
        product_id: Uuid,
        variant_id: Option<Uuid>,
        input: UpdateItemInput,
    ) -> Result<CartWithItems, ServiceError> {
        input.validate()?;
        if matches!(input.quantity, Some(q) if q <= 0) {
            return self.remove_item(cart_id, product_id, variant_id).await;
        }

        let mut cart = self.load_mutable(cart_id).await?;
        let idx = cart
            .find_line(product_id, variant_id)
            .ok_or_else(|| line_not_found(cart_id, product_id))?;
        let now = Utc::now();

        if let Some(quantity) = input.quantity {
            // refresh the snapshot when the catalog still sells the product;
            // otherwise keep the old one and let validation surface it
            let product = self
                .catalog
                .get_product(product_id)
                .await?
                .filter(|p| p.active && p.currency.eq_ignore_ascii_case(&cart.cart.currency));
            let line = &mut cart.items[idx];
            line.quantity = quantity;
            match product {
                Some(product) => refresh_snapshot(line, &product, now),
                None => {
                    line.line_total = line.unit_price * Decimal::from(quantity);
                    line.updated_at = now;
                }
            }
        }

        let line = &mut cart.items[idx];
        if let Some(is_gift) = input.is_gift {
            line.is_gift = is_gift;
            if !is_gift {
                line.gift_message = None;
            }
        }
        if let Some(message) = input.gift_message {
            line.gift_message = Some(message).filter(|m| !m.trim().is_empty());
        }
        line.updated_at = now;
        let quantity = line.quantity;

        let mut events = self.reprice(&mut cart, self.settings.revalidate_coupons)?;
        events.push(Event::CartItemUpdated {
            cart_id,
            product_id,
            quantity,
        });
        self.persist(cart, events).await
    }

    /// Deletes a line and reprices.
    #[instrument(skip(self))]
    pub async fn remove_item(
        &self,
        cart_id: Uuid,
        product_id: Uuid,
        variant_id: Option<Uuid>,
    ) -> Result<CartWithItems, ServiceError> {
        let mut cart = self.load_mutable(cart_id).await?;
        let idx = cart
            .find_line(product_id, variant_id)
            .ok_or_else(|| line_not_found(cart_id, product_id))?;
        cart.items.remove(idx);

        let mut events = self.reprice(&mut cart, self.settings.revalidate_coupons)?;
        events.push(Event::CartItemRemoved {
            cart_id,
            product_id,
        });
        let saved = self.persist(cart, events).await?;

        info!("Removed product {} from cart {}", product_id, cart_id);
        Ok(saved)
    }

    /// Empties the cart and zeroes every money field, coupon included.
    #[instrument(skip(self))]
    pub async fn clear_cart(&self, cart_id: Uuid) -> Result<CartWithItems, ServiceError> {
        let mut cart = self.load_mutable(cart_id).await?;
        cart.items.clear();
        cart.cart.coupon_code = None;
        cart.cart.discount_total = Decimal::ZERO;

        let mut events = self.reprice(&mut cart, false)?;
        events.push(Event::CartCleared(cart_id));
        let saved = self.persist(cart, events).await?;

        info!("Cleared cart: {}", cart_id);
        Ok(saved)
    }

    /// Folds the guest cart into `target_cart_id` and deletes the guest cart.
    ///
    /// Quantities are summed per (product, variant). The write of the target
    /// and the delete of the guest cart commit together or not at all.
    ///
    /// # Arguments
    ///
    /// * `target_cart_id` - Cart that survives, usually the signed-in user's
    /// * `guest_cart_id` - Cart that is folded in and deleted
    ///
    /// # Returns
    ///
    /// * `Ok(CartWithItems)` - The repriced target cart
    /// * `Err(ServiceError::InvalidOperation)` - Same cart twice, a non-Active
    ///   cart, or mismatched currencies
    /// * `Err(ServiceError::ConcurrentModification)` - Either cart changed since
    ///   it was read
    /// * `Err(ServiceError::TransactionFailure)` - The store rolled back; retry
    ///   the whole merge
    #[instrument(skip(self))]
    pub async fn merge_carts(
        &self,
        target_cart_id: Uuid,
        guest_cart_id: Uuid,
    ) -> Result<CartWithItems, ServiceError> {
        if target_cart_id == guest_cart_id {
            return Err(ServiceError::InvalidOperation(
                "Cannot merge a cart into itself".to_string(),
            ));
        }

        let mut target = self.load_mutable(target_cart_id).await?;
        let guest = self.load_mutable(guest_cart_id).await?;
        if !target.cart.currency.eq_ignore_ascii_case(&guest.cart.currency) {
            return Err(ServiceError::InvalidOperation(format!(
                "Cannot merge a {} cart into a {} cart",
                guest.cart.currency, target.cart.currency
            )));
        }

        let now = Utc::now();
        let mut next_position = target.next_position();
        for line in &guest.items {
            match target.find_line(line.product_id, line.variant_id) {
                Some(idx) => {
                    let existing = &mut target.items[idx];
                    existing.quantity = existing
                        .quantity
                        .checked_add(line.quantity)
                        .ok_or_else(|| ServiceError::InvalidInput("Quantity is too large".into()))?;
                    existing.line_total = existing.unit_price * Decimal::from(existing.quantity);
                    existing.is_gift |= line.is_gift;
                    if existing.gift_message.is_none() {
                        existing.gift_message = line.gift_message.clone();
                    }
                    existing.updated_at = now;
                }
                None => {
                    target.items.push(CartItemModel {
                        id: Uuid::new_v4(),
                        cart_id: target_cart_id,
                        position: next_position,
                        updated_at: now,
                        ..line.clone()
                    });
                    next_position += 1;
                }
            }
        }

        if target.cart.session_id.is_none() {
            target.cart.session_id = guest.cart.session_id.clone();
        }
        if target.cart.shipping_address.is_none() {
            target.cart.shipping_address = guest.cart.shipping_address.clone();
        }
        let carried_coupon = target.cart.coupon_code.is_none() && guest.cart.coupon_code.is_some();
        if carried_coupon {
            target.cart.coupon_code = guest.cart.coupon_code.clone();
        }

        let mut events =
            self.reprice(&mut target, self.settings.revalidate_coupons || carried_coupon)?;
        events.push(Event::CartsMerged {
            source_cart_id: guest_cart_id,
            target_cart_id,
        });

        target.cart.last_activity_at = now;
        target.cart.updated_at = now;
        let saved = self
            .carts
            .save_merged(target, guest_cart_id, guest.cart.version)
            .await
            .map_err(|err| match err {
                ServiceError::DatabaseError(db_err) => {
                    error!(error = %db_err, "cart merge rolled back");
                    ServiceError::TransactionFailure(db_err.to_string())
                }
                other => other,
            })?;
        self.emit(events);

        info!("Merged guest cart {} into {}", guest_cart_id, target_cart_id);
        Ok(saved)
    }

    /// Applies a coupon, replacing any coupon already on the cart.
    ///
    /// On failure the cart is left untouched.
    ///
    /// # Returns
    ///
    /// * `Ok(CartWithItems)` - Cart with the discount applied
    /// * `Err(ServiceError::InvalidCoupon)` - Unknown or inactive code
    /// * `Err(ServiceError::MinimumOrderNotMet)` - Subtotal below the code's minimum
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let cart = cart_service.apply_coupon(cart_id, "SAVE10").await?;
    /// assert_eq!(cart.cart.coupon_code.as_deref(), Some("SAVE10"));
    /// ```
    #[instrument(skip(self))]
    pub async fn apply_coupon(
        &self,
        cart_id: Uuid,
        code: &str,
    ) -> Result<CartWithItems, ServiceError> {
        if code.trim().is_empty() {
            return Err(ServiceError::InvalidInput("Coupon code is required".into()));
        }

        let mut cart = self.load_mutable(cart_id).await?;
        let subtotal = cart.active_subtotal();
        let discount = self.coupons.evaluate(code, subtotal).map_err(|err| {
            counter!("cart.coupon.rejected", 1);
            warn!(%cart_id, code, error = %err, "Coupon rejected");
            err
        })?;

        let previous = cart.cart.coupon_code.replace(discount.code.clone());
        cart.cart.discount_total = discount.amount;

        let mut events = self.reprice(&mut cart, true)?;
        if let Some(previous) = previous.filter(|p| *p != discount.code) {
            events.push(Event::CouponRemoved {
                cart_id,
                code: previous,
                reason: "replaced".to_string(),
            });
        }
        events.push(Event::CouponApplied {
            cart_id,
            code: discount.code.clone(),
        });
        let saved = self.persist(cart, events).await?;

        info!(%cart_id, code = %discount.code, discount = %discount.amount, "Applied coupon");
        Ok(saved)
    }

    /// Drops the coupon; discount goes back to exactly zero.
    #[instrument(skip(self))]
    pub async fn remove_coupon(&self, cart_id: Uuid) -> Result<CartWithItems, ServiceError> {
        let mut cart = self.load_mutable(cart_id).await?;
        let removed = cart.cart.coupon_code.take();
        cart.cart.discount_total = Decimal::ZERO;

        let mut events = self.reprice(&mut cart, false)?;
        if let Some(code) = removed {
            events.push(Event::CouponRemoved {
                cart_id,
                code,
                reason: "removed".to_string(),
            });
        }
        self.persist(cart, events).await
    }

    /// Sets the destination used for tax, shipping and validation.
    ///
    /// The country is normalized to an upper-case ISO 3166-1 alpha-2 code.
    #[instrument(skip(self, address))]
    pub async fn set_shipping_address(
        &self,
        cart_id: Uuid,
        mut address: ShippingAddress,
    ) -> Result<CartWithItems, ServiceError> {
        address.country = address.country.trim().to_ascii_uppercase();
        if address.country.len() != 2 || !address.country.chars().all(|c| c.is_ascii_alphabetic())
        {
            return Err(ServiceError::InvalidInput(
                "country must be an ISO 3166-1 alpha-2 code".to_string(),
            ));
        }

        let mut cart = self.load_mutable(cart_id).await?;
        cart.cart.shipping_address = Some(address);
        let events = self.reprice(&mut cart, self.settings.revalidate_coupons)?;
        self.persist(cart, events).await
    }

    /// Parks a line outside the priced cart.
    #[instrument(skip(self))]
    pub async fn save_for_later(
        &self,
        cart_id: Uuid,
        product_id: Uuid,
        variant_id: Option<Uuid>,
    ) -> Result<CartWithItems, ServiceError> {
        self.set_saved_flag(cart_id, product_id, variant_id, true)
            .await
    }

    /// Returns a saved line to the priced cart.
    #[instrument(skip(self))]
    pub async fn move_to_cart(
        &self,
        cart_id: Uuid,
        product_id: Uuid,
        variant_id: Option<Uuid>,
    ) -> Result<CartWithItems, ServiceError> {
        self.set_saved_flag(cart_id, product_id, variant_id, false)
            .await
    }

    /// Lines parked with [`CartService::save_for_later`], in cart order.
    pub async fn list_saved_items(&self, cart_id: Uuid) -> Result<Vec<CartItemModel>, ServiceError> {
        Ok(self.get_cart(cart_id).await?.saved_items().cloned().collect())
    }

    /// Counts, money fields and the amount left before shipping is free.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let summary = cart_service.get_summary(cart_id).await?;
    /// if summary.free_shipping_remaining > Decimal::ZERO {
    ///     println!("Add {} more for free shipping", summary.free_shipping_remaining);
    /// }
    /// ```
    pub async fn get_summary(&self, cart_id: Uuid) -> Result<CartSummary, ServiceError> {
        let cart = self.get_cart(cart_id).await?;
        let c = &cart.cart;
        Ok(CartSummary {
            cart_id: c.id,
            status: c.status,
            currency: c.currency.clone(),
            line_count: cart.active_items().count(),
            item_count: c.item_count,
            vendor_count: c.vendor_count,
            saved_item_count: cart.saved_items().count(),
            subtotal: c.subtotal,
            tax_total: c.tax_total,
            shipping_total: c.shipping_total,
            discount_total: c.discount_total,
            total: c.total,
            coupon_code: c.coupon_code.clone(),
            free_shipping_remaining: self.pricing.free_shipping_remaining(c.subtotal),
            expires_at: c.expires_at,
        })
    }

    /// Marks the cart Converted. Converting again with the same order is a
    /// no-op; any abandonment row for the cart is marked recovered.
    ///
    /// # Arguments
    ///
    /// * `cart_id` - Cart the order was created from
    /// * `order_id` - The created order
    ///
    /// # Returns
    ///
    /// * `Ok(CartWithItems)` - The Converted cart
    /// * `Err(ServiceError::InvalidOperation)` - Cart empty, not Active, or
    ///   already converted into a different order
    #[instrument(skip(self))]
    pub async fn convert_to_order(
        &self,
        cart_id: Uuid,
        order_id: Uuid,
    ) -> Result<CartWithItems, ServiceError> {
        let mut cart = self.get_cart(cart_id).await?;
        match cart.cart.status {
            CartStatus::Converted if cart.cart.converted_order_id == Some(order_id) => {
                return Ok(cart)
            }
            CartStatus::Converted | CartStatus::Expired => {
                return Err(not_mutable(&cart.cart));
            }
            CartStatus::Active | CartStatus::Abandoned => {}
        }
        if cart.is_empty() {
            return Err(ServiceError::InvalidOperation(
                "Cannot convert an empty cart".to_string(),
            ));
        }

        cart.cart.status = CartStatus::Converted;
        cart.cart.converted_order_id = Some(order_id);
        let saved = self
            .persist(cart, vec![Event::CartConverted { cart_id, order_id }])
            .await?;

        if let Err(err) = self.abandonment.mark_recovered(cart_id, order_id).await {
            warn!(%cart_id, error = %err, "Failed to mark abandonment tracking recovered");
        }

        info!("Converted cart {} into order {}", cart_id, order_id);
        Ok(saved)
    }

    /// Active -> Abandoned, driven by an external sweep.
    #[instrument(skip(self))]
    pub async fn abandon_cart(&self, cart_id: Uuid) -> Result<CartWithItems, ServiceError> {
        let mut cart = self.load_mutable(cart_id).await?;
        cart.cart.status = CartStatus::Abandoned;
        cart.cart.updated_at = Utc::now();

        let saved = self.carts.save(cart).await?;
        self.event_sender.send_or_log(Event::CartAbandoned(cart_id));
        Ok(saved)
    }

    /// Expires Active guest carts whose expiry is at or before `now`.
    #[instrument(skip(self))]
    pub async fn cleanup_expired_carts(&self, now: DateTime<Utc>) -> Result<u64, ServiceError> {
        let expired = self.carts.expire_guest_carts(now).await?;
        if expired > 0 {
            self.event_sender.send_or_log(Event::CartsExpired(expired));
        }
        info!(expired, "Expired guest carts");
        Ok(expired)
    }

    async fn set_saved_flag(
        &self,
        cart_id: Uuid,
        product_id: Uuid,
        variant_id: Option<Uuid>,
        saved: bool,
    ) -> Result<CartWithItems, ServiceError> {
        let mut cart = self.load_mutable(cart_id).await?;
        let idx = cart
            .find_line(product_id, variant_id)
            .ok_or_else(|| line_not_found(cart_id, product_id))?;
        let line = &mut cart.items[idx];
        line.saved_for_later = saved;
        line.updated_at = Utc::now();

        let events = self.reprice(&mut cart, self.settings.revalidate_coupons)?;
        self.persist(cart, events).await
    }

    async fn load_mutable(&self, cart_id: Uuid) -> Result<CartWithItems, ServiceError> {
        let cart = self.get_cart(cart_id).await?;
        if cart.cart.status != CartStatus::Active {
            return Err(not_mutable(&cart.cart));
        }
        Ok(cart)
    }

    async fn purchasable_product(
        &self,
        product_id: Uuid,
        currency: &str,
    ) -> Result<CatalogProduct, ServiceError> {
        let product = self
            .catalog
            .get_product(product_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))?;

        if !product.active {
            return Err(ServiceError::InvalidOperation(format!(
                "Product {} is not available",
                product_id
            )));
        }
        if !product.currency.eq_ignore_ascii_case(currency) {
            return Err(ServiceError::InvalidOperation(format!(
                "Product {} is priced in {} but the cart uses {}",
                product_id, product.currency, currency
            )));
        }
        Ok(product)
    }

    /// Recomputes discount, totals, counters and per-line allocations.
    /// Returns the events caused by a coupon that stopped qualifying.
    fn reprice(
        &self,
        cart: &mut CartWithItems,
        revalidate_coupon: bool,
    ) -> Result<Vec<Event>, ServiceError> {
        ensure_quantity_limits(cart)?;

        let mut events = Vec::new();
        let subtotal = cart.active_subtotal();

        let discount = match cart.cart.coupon_code.clone() {
            None => Decimal::ZERO,
            Some(code) if revalidate_coupon => match self.coupons.evaluate(&code, subtotal) {
                Ok(discount) => discount.amount,
                Err(err) => {
                    warn!(cart_id = %cart.cart.id, code = %code, error = %err, "Coupon no longer applies; removing it");
                    cart.cart.coupon_code = None;
                    events.push(Event::CouponRemoved {
                        cart_id: cart.cart.id,
                        code,
                        reason: err.to_string(),
                    });
                    Decimal::ZERO
                }
            },
            Some(_) => cart.cart.discount_total.min(subtotal),
        };

        let destination = cart.cart.destination_country();
        let breakdown = self
            .pricing
            .price(&cart.items, destination.as_deref(), discount);
        apply_line_allocations(&mut cart.items, &breakdown);

        let c = &mut cart.cart;
        c.subtotal = breakdown.subtotal;
        c.tax_total = breakdown.tax;
        c.shipping_total = breakdown.shipping;
        c.discount_total = breakdown.discount;
        c.total = breakdown.total;
        c.item_count = breakdown.item_count;
        c.vendor_count = breakdown.vendor_count;
        Ok(events)
    }

    async fn persist(
        &self,
        mut cart: CartWithItems,
        events: Vec<Event>,
    ) -> Result<CartWithItems, ServiceError> {
        let now = Utc::now();
        cart.cart.last_activity_at = now;
        cart.cart.updated_at = now;

        let saved = self.carts.save(cart).await?;
        self.emit(events);
        Ok(saved)
    }

    fn emit(&self, events: Vec<Event>) {
        for event in events {
            self.event_sender.send_or_log(event);
        }
    }
}

fn refresh_snapshot(line: &mut CartItemModel, product: &CatalogProduct, now: DateTime<Utc>) {
    line.unit_price = product.price;
    line.line_total = product.price * Decimal::from(line.quantity);
    line.vendor_id = product.vendor_id;
    line.product_name = product.name.clone();
    line.image_url = product.image_url.clone();
    line.category = product.category.clone();
    line.in_stock = product.in_stock();
    line.stock_quantity = Some(product.stock_quantity);
    line.updated_at = now;
}

fn line_not_found(cart_id: Uuid, product_id: Uuid) -> ServiceError {
    ServiceError::NotFound(format!(
        "Product {} is not in cart {}",
        product_id, cart_id
    ))
}

fn not_mutable(cart: &CartModel) -> ServiceError {
    match cart.status {
        CartStatus::Converted => ServiceError::InvalidOperation(format!(
            "Cart {} has been converted to an order and can no longer be modified",
            cart.id
        )),
        status => ServiceError::InvalidOperation(format!(
            "Cart {} is {} and can no longer be modified",
            cart.id,
            status.as_str()
        )),
    }
}

fn ensure_quantity_limits(cart: &CartWithItems) -> Result<(), ServiceError> {
    if let Some(line) = cart
        .items
        .iter()
        .find(|item| item.quantity > MAX_LINE_QUANTITY)
    {
        return Err(ServiceError::InvalidInput(format!(
            "Quantity {} for product {} exceeds the limit of {} per line",
            line.quantity, line.product_id, MAX_LINE_QUANTITY
        )));
    }

    let units: i64 = cart.active_items().map(|item| i64::from(item.quantity)).sum();
    if units > MAX_CART_QUANTITY {
        return Err(ServiceError::InvalidInput(format!(
            "Cart would hold {} units; the limit is {}",
            units, MAX_CART_QUANTITY
        )));
    }
    Ok(())
}

/// Who a cart belongs to: a signed-in user or a guest session
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CartOwner {
    pub user_id: Option<Uuid>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AddItemInput {
    pub product_id: Uuid,
    #[serde(default)]
    pub variant_id: Option<Uuid>,
    #[validate(range(min = 1, max = 9999))]
    pub quantity: i32,
    #[serde(default)]
    pub is_gift: bool,
    #[serde(default)]
    #[validate(length(max = 500))]
    pub gift_message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct UpdateItemInput {
    #[validate(range(max = 9999))]
    pub quantity: Option<i32>,
    pub is_gift: Option<bool>,
    #[validate(length(max = 500))]
    pub gift_message: Option<String>,
}

/// Cart aggregate: the cart row plus its lines ordered by position
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CartWithItems {
    pub cart: CartModel,
    pub items: Vec<CartItemModel>,
}

impl CartWithItems {
    /// Lines that are priced (not saved for later)
    pub fn active_items(&self) -> impl Iterator<Item = &CartItemModel> {
        self.items.iter().filter(|item| !item.saved_for_later)
    }

    pub fn saved_items(&self) -> impl Iterator<Item = &CartItemModel> {
        self.items.iter().filter(|item| item.saved_for_later)
    }

    /// True when nothing would be priced or shipped
    pub fn is_empty(&self) -> bool {
        self.active_items().next().is_none()
    }

    pub fn active_subtotal(&self) -> Decimal {
        self.active_items().map(|item| item.line_total).sum()
    }

    pub fn find_line(&self, product_id: Uuid, variant_id: Option<Uuid>) -> Option<usize> {
        self.items
            .iter()
            .position(|item| item.matches(product_id, variant_id))
    }

    fn next_position(&self) -> i32 {
        self.items
            .iter()
            .map(|item| item.position)
            .max()
            .map_or(0, |p| p + 1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CartSummary {
    pub cart_id: Uuid,
    pub status: CartStatus,
    pub currency: String,
    pub line_count: usize,
    pub item_count: i32,
    pub vendor_count: i32,
    pub saved_item_count: usize,
    pub subtotal: Decimal,
    pub tax_total: Decimal,
    pub shipping_total: Decimal,
    pub discount_total: Decimal,
    pub total: Decimal,
    pub coupon_code: Option<String>,
    pub free_shipping_remaining: Decimal,
    pub expires_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{default_coupons, AppConfig};
    use crate::repositories::{
        cart_repository::MockCartRepository, InMemoryAbandonmentRepository, InMemoryCartRepository,
    };
    use crate::services::commerce::catalog::MockCatalogLookup;
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc;

    /// Unsaved guest cart with no lines
    pub(crate) fn guest_cart(session: &str) -> CartWithItems {
        let now = Utc::now();
        CartWithItems {
            cart: CartModel {
                id: Uuid::new_v4(),
                user_id: None,
                session_id: Some(session.to_string()),
                status: CartStatus::Active,
                currency: "USD".into(),
                item_count: 0,
                vendor_count: 0,
                subtotal: Decimal::ZERO,
                tax_total: Decimal::ZERO,
                shipping_total: Decimal::ZERO,
                discount_total: Decimal::ZERO,
                total: Decimal::ZERO,
                shipping_address: None,
                coupon_code: None,
                expires_at: Some(now + Duration::days(7)),
                last_activity_at: now,
                converted_order_id: None,
                version: 0,
                created_at: now,
                updated_at: now,
            },
            items: Vec::new(),
        }
    }

    /// Two units at 25.00 of a fresh product
    pub(crate) fn sample_item(cart_id: Uuid) -> CartItemModel {
        let mut item = crate::services::commerce::pricing_service::tests::line(
            dec!(25.00),
            2,
            Uuid::new_v4(),
        );
        item.cart_id = cart_id;
        item
    }

    fn service_with(catalog: MockCatalogLookup) -> (CartService, mpsc::Receiver<Event>) {
        service_over(Arc::new(InMemoryCartRepository::new()), catalog)
    }

    fn service_over(
        carts: Arc<dyn CartRepository>,
        catalog: MockCatalogLookup,
    ) -> (CartService, mpsc::Receiver<Event>) {
        let config = AppConfig::default();
        let (tx, rx) = mpsc::channel(64);
        let sender = Arc::new(EventSender::new(tx));
        let abandonment = Arc::new(AbandonmentService::new(
            Arc::new(InMemoryAbandonmentRepository::new()),
            carts.clone(),
            sender.clone(),
        ));
        let service = CartService::new(
            carts,
            Arc::new(catalog),
            Arc::new(PricingEngine::new(&config.pricing)),
            Arc::new(CouponEvaluator::new(&default_coupons())),
            abandonment,
            sender,
            config.cart,
        );
        (service, rx)
    }

    fn product(id: Uuid, price: Decimal) -> CatalogProduct {
        CatalogProduct {
            id,
            name: "Desk Lamp".into(),
            price,
            currency: "USD".into(),
            active: true,
            stock_quantity: 10,
            tracks_inventory: true,
            allows_backorder: false,
            category: Some("home".into()),
            vendor_id: Uuid::from_u128(7),
            image_url: Some("https://img.example/lamp.png".into()),
        }
    }

    fn add(product_id: Uuid, quantity: i32) -> AddItemInput {
        AddItemInput {
            product_id,
            variant_id: None,
            quantity,
            is_gift: false,
            gift_message: None,
        }
    }

    async fn guest(service: &CartService) -> Uuid {
        service
            .get_or_create(
                CartOwner {
                    user_id: None,
                    session_id: Some("sess-1".into()),
                },
                None,
            )
            .await
            .unwrap()
            .0
            .cart
            .id
    }

    #[tokio::test]
    async fn add_item_snapshots_catalog_fields() {
        let product_id = Uuid::new_v4();
        let mut catalog = MockCatalogLookup::new();
        catalog
            .expect_get_product()
            .returning(move |id| Ok(Some(product(id, dec!(40.00)))));
        let (service, _rx) = service_with(catalog);
        let cart_id = guest(&service).await;

        service.add_item(cart_id, add(product_id, 1)).await.unwrap();
        let cart = service.add_item(cart_id, add(product_id, 2)).await.unwrap();

        assert_eq!(cart.items.len(), 1);
        let line = &cart.items[0];
        assert_eq!(line.quantity, 3);
        assert_eq!(line.line_total, dec!(120.00));
        assert_eq!(line.product_name, "Desk Lamp");
        assert_eq!(line.category.as_deref(), Some("home"));
        assert_eq!(cart.cart.subtotal, dec!(120.00));
        assert_eq!(cart.cart.item_count, 3);
        // no destination: default 10% tax, free shipping above 100
        assert_eq!(cart.cart.tax_total, dec!(12.00));
        assert_eq!(cart.cart.shipping_total, Decimal::ZERO);
        assert_eq!(cart.cart.total, dec!(132.00));
    }

    #[tokio::test]
    async fn unknown_product_is_not_found() {
        let mut catalog = MockCatalogLookup::new();
        catalog.expect_get_product().returning(|_| Ok(None));
        let (service, _rx) = service_with(catalog);
        let cart_id = guest(&service).await;

        assert_matches!(
            service.add_item(cart_id, add(Uuid::new_v4(), 1)).await,
            Err(ServiceError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn catalog_failure_leaves_cart_untouched() {
        let mut catalog = MockCatalogLookup::new();
        catalog
            .expect_get_product()
            .returning(|_| Err(ServiceError::Catalog("connection reset".into())));
        let (service, _rx) = service_with(catalog);
        let cart_id = guest(&service).await;

        assert_matches!(
            service.add_item(cart_id, add(Uuid::new_v4(), 1)).await,
            Err(ServiceError::Catalog(_))
        );
        let cart = service.get_cart(cart_id).await.unwrap();
        assert!(cart.items.is_empty());
        assert_eq!(cart.cart.version, 1);
    }

    #[tokio::test]
    async fn zero_quantity_is_rejected_on_add() {
        let (service, _rx) = service_with(MockCatalogLookup::new());
        let cart_id = guest(&service).await;
        assert_matches!(
            service.add_item(cart_id, add(Uuid::new_v4(), 0)).await,
            Err(ServiceError::InvalidInput(_))
        );
    }

    #[tokio::test]
    async fn oversized_quantities_are_rejected_without_touching_the_cart() {
        let mut catalog = MockCatalogLookup::new();
        catalog
            .expect_get_product()
            .returning(|id| Ok(Some(product(id, dec!(0.50)))));
        let (service, _rx) = service_with(catalog);
        let cart_id = guest(&service).await;

        assert_matches!(
            service.add_item(cart_id, add(Uuid::new_v4(), i32::MAX)).await,
            Err(ServiceError::InvalidInput(_))
        );

        let lamp = Uuid::new_v4();
        service
            .add_item(cart_id, add(lamp, MAX_LINE_QUANTITY))
            .await
            .unwrap();
        assert_matches!(
            service.add_item(cart_id, add(lamp, 1)).await,
            Err(ServiceError::InvalidInput(_))
        );

        for _ in 1..10 {
            service
                .add_item(cart_id, add(Uuid::new_v4(), MAX_LINE_QUANTITY))
                .await
                .unwrap();
        }
        assert_matches!(
            service.add_item(cart_id, add(Uuid::new_v4(), 10)).await,
            Err(ServiceError::InvalidInput(_))
        );

        let cart = service.get_cart(cart_id).await.unwrap();
        assert_eq!(cart.items.len(), 10);
        assert_eq!(cart.cart.item_count, 10 * MAX_LINE_QUANTITY);
    }

    #[tokio::test]
    async fn database_failure_during_merge_is_a_transaction_failure() {
        let mut target = guest_cart("user-cart");
        target.cart.user_id = Some(Uuid::new_v4());
        target.cart.version = 3;
        let mut guest = guest_cart("guest-cart");
        guest.items.push(sample_item(guest.cart.id));
        guest.cart.version = 2;

        let (target_id, guest_id) = (target.cart.id, guest.cart.id);
        let stored = [target.clone(), guest.clone()];
        let mut carts = MockCartRepository::new();
        carts.expect_load().returning(move |id| {
            Ok(stored.iter().find(|cart| cart.cart.id == id).cloned())
        });
        carts
            .expect_save_merged()
            .withf(move |merged, source, version| {
                merged.cart.id == target_id && *source == guest_id && *version == 2
            })
            .times(1)
            .returning(|_, _, _| {
                Err(ServiceError::DatabaseError(sea_orm::DbErr::Custom(
                    "connection lost mid-transaction".into(),
                )))
            });
        carts.expect_save().never();
        carts.expect_delete().never();

        let (service, mut rx) = service_over(Arc::new(carts), MockCatalogLookup::new());

        assert_matches!(
            service.merge_carts(target_id, guest_id).await,
            Err(ServiceError::TransactionFailure(_))
        );
        assert_eq!(service.get_cart(target_id).await.unwrap(), target);
        assert_eq!(service.get_cart(guest_id).await.unwrap(), guest);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn coupon_is_dropped_when_subtotal_falls_below_minimum() {
        let expensive = Uuid::new_v4();
        let cheap = Uuid::new_v4();
        let mut catalog = MockCatalogLookup::new();
        catalog.expect_get_product().returning(move |id| {
            let price = if id == expensive { dec!(60) } else { dec!(10) };
            Ok(Some(product(id, price)))
        });
        let (service, mut rx) = service_with(catalog);
        let cart_id = guest(&service).await;

        service.add_item(cart_id, add(expensive, 1)).await.unwrap();
        service.add_item(cart_id, add(cheap, 1)).await.unwrap();
        let cart = service.apply_coupon(cart_id, "save10").await.unwrap();
        assert_eq!(cart.cart.coupon_code.as_deref(), Some("SAVE10"));
        assert_eq!(cart.cart.discount_total, dec!(7.00));

        let cart = service.remove_item(cart_id, expensive, None).await.unwrap();
        assert_eq!(cart.cart.coupon_code, None);
        assert_eq!(cart.cart.discount_total, Decimal::ZERO);

        let mut saw_removal = false;
        while let Ok(event) = rx.try_recv() {
            if let Event::CouponRemoved { code, .. } = event {
                assert_eq!(code, "SAVE10");
                saw_removal = true;
            }
        }
        assert!(saw_removal);
    }

    #[tokio::test]
    async fn converted_cart_rejects_mutation() {
        let product_id = Uuid::new_v4();
        let mut catalog = MockCatalogLookup::new();
        catalog
            .expect_get_product()
            .returning(move |id| Ok(Some(product(id, dec!(15)))));
        let (service, _rx) = service_with(catalog);
        let cart_id = guest(&service).await;
        service.add_item(cart_id, add(product_id, 1)).await.unwrap();

        let order_id = Uuid::new_v4();
        let cart = service.convert_to_order(cart_id, order_id).await.unwrap();
        assert_eq!(cart.cart.status, CartStatus::Converted);
        assert_eq!(cart.cart.converted_order_id, Some(order_id));

        // same order again is a no-op
        service.convert_to_order(cart_id, order_id).await.unwrap();
        assert_matches!(
            service.convert_to_order(cart_id, Uuid::new_v4()).await,
            Err(ServiceError::InvalidOperation(_))
        );
        assert_matches!(
            service.add_item(cart_id, add(product_id, 1)).await,
            Err(ServiceError::InvalidOperation(_))
        );
    }

    #[tokio::test]
    async fn abandon_then_sweep_expired() {
        let (service, _rx) = service_with(MockCatalogLookup::new());
        let abandoned = guest(&service).await;
        let cart = service.abandon_cart(abandoned).await.unwrap();
        assert_eq!(cart.cart.status, CartStatus::Abandoned);

        let (fresh, _) = service
            .get_or_create(
                CartOwner {
                    user_id: None,
                    session_id: Some("sess-2".into()),
                },
                None,
            )
            .await
            .unwrap();

        let expired = service
            .cleanup_expired_carts(Utc::now() + Duration::days(8))
            .await
            .unwrap();
        assert_eq!(expired, 1);
        assert_eq!(
            service.get_cart(fresh.cart.id).await.unwrap().cart.status,
            CartStatus::Expired
        );
    }

    #[tokio::test]
    async fn user_carts_do_not_expire() {
        let (service, _rx) = service_with(MockCatalogLookup::new());
        let (cart, created) = service
            .get_or_create(
                CartOwner {
                    user_id: Some(Uuid::new_v4()),
                    session_id: Some("ignored".into()),
                },
                Some("eur".into()),
            )
            .await
            .unwrap();
        assert!(created);
        assert_eq!(cart.cart.currency, "EUR");
        assert!(cart.cart.expires_at.is_none());
        assert!(cart.cart.session_id.is_none());
    }
}
