/// Commerce services module - cart lifecycle, pricing and recovery
pub mod abandonment_service;
pub mod cart_service;
pub mod cart_validation_service;
pub mod catalog;
pub mod coupon_service;
pub mod pricing_service;

// Re-export services for convenience
pub use abandonment_service::AbandonmentService;
pub use cart_service::{
    AddItemInput, CartOwner, CartService, CartSummary, CartWithItems, UpdateItemInput,
};
pub use cart_validation_service::{CartValidationService, ValidationReport};
pub use catalog::{CatalogLookup, CatalogProduct, HttpCatalogClient, InMemoryCatalog};
pub use coupon_service::CouponEvaluator;
pub use pricing_service::{PriceBreakdown, PricingEngine};
