pub mod commerce;
pub mod common;

use crate::{
    config::AppConfig,
    events::EventSender,
    repositories::{AbandonmentRepository, CartRepository},
    services::commerce::{
        AbandonmentService, CartService, CartValidationService, CatalogLookup, CouponEvaluator,
        PricingEngine,
    },
};
use std::sync::Arc;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub carts: Arc<CartService>,
    pub validation: Arc<CartValidationService>,
    pub abandonment: Arc<AbandonmentService>,
}

impl AppServices {
    /// Wires the cart services over the given storage and catalog.
    pub fn new(
        config: &AppConfig,
        carts: Arc<dyn CartRepository>,
        tracking: Arc<dyn AbandonmentRepository>,
        catalog: Arc<dyn CatalogLookup>,
        event_sender: Arc<EventSender>,
    ) -> Self {
        let pricing = Arc::new(PricingEngine::new(&config.pricing));
        let coupons = Arc::new(CouponEvaluator::new(&config.coupons));

        let abandonment = Arc::new(AbandonmentService::new(
            tracking,
            carts.clone(),
            event_sender.clone(),
        ));
        let validation = Arc::new(CartValidationService::new(
            carts.clone(),
            catalog.clone(),
            pricing.clone(),
            &config.validation,
        ));
        let cart_service = Arc::new(CartService::new(
            carts,
            catalog,
            pricing,
            coupons,
            abandonment.clone(),
            event_sender,
            config.cart.clone(),
        ));

        Self {
            carts: cart_service,
            validation,
            abandonment,
        }
    }
}
