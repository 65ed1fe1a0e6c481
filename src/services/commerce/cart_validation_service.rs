use crate::{
    config::ValidationConfig,
    errors::ServiceError,
    repositories::CartRepository,
    services::commerce::{
        cart_service::CartWithItems,
        catalog::CatalogLookup,
        pricing_service::{PriceBreakdown, PricingEngine},
    },
};
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Error,
    Warning,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    EmptyCart,
    ShippingRestriction,
    ProductUnavailable,
    InsufficientStock,
    PriceChanged,
    MinimumOrderNotMet,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    #[serde(rename = "type")]
    pub issue_type: IssueType,
    pub severity: IssueSeverity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<Uuid>,
}

impl ValidationIssue {
    fn error(issue_type: IssueType, message: impl Into<String>) -> Self {
        Self {
            issue_type,
            severity: IssueSeverity::Error,
            message: message.into(),
            product_id: None,
            variant_id: None,
        }
    }

    fn warning(issue_type: IssueType, message: impl Into<String>) -> Self {
        Self {
            severity: IssueSeverity::Warning,
            ..Self::error(issue_type, message)
        }
    }

    fn for_line(mut self, product_id: Uuid, variant_id: Option<Uuid>) -> Self {
        self.product_id = Some(product_id);
        self.variant_id = variant_id;
        self
    }
}

/// Outcome of a checkout consistency check
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub cart_id: Uuid,
    pub is_valid: bool,
    pub issues: Vec<ValidationIssue>,
    pub estimates: PriceBreakdown,
}

impl ValidationReport {
    fn new(cart_id: Uuid, issues: Vec<ValidationIssue>, estimates: PriceBreakdown) -> Self {
        let is_valid = !issues
            .iter()
            .any(|issue| issue.severity == IssueSeverity::Error);
        Self {
            cart_id,
            is_valid,
            issues,
            estimates,
        }
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues
            .iter()
            .filter(|issue| issue.severity == IssueSeverity::Error)
    }
}

/// Forbids shipping a product category to the listed destinations
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingRestriction {
    pub category: String,
    pub countries: Vec<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ShippingRestriction {
    pub fn forbids(&self, category: &str, country: &str) -> bool {
        self.category.eq_ignore_ascii_case(category.trim())
            && self
                .countries
                .iter()
                .any(|c| c.trim().eq_ignore_ascii_case(country))
    }
}

/// Read-only checkout checks over a cart snapshot.
#[derive(Clone)]
pub struct CartValidationService {
    carts: Arc<dyn CartRepository>,
    catalog: Arc<dyn CatalogLookup>,
    pricing: Arc<PricingEngine>,
    allowed_countries: HashSet<String>,
    minimum_order_amount: Decimal,
    price_drift_tolerance: Decimal,
    restrictions: Vec<ShippingRestriction>,
}

impl CartValidationService {
    pub fn new(
        carts: Arc<dyn CartRepository>,
        catalog: Arc<dyn CatalogLookup>,
        pricing: Arc<PricingEngine>,
        config: &ValidationConfig,
    ) -> Self {
        Self {
            carts,
            catalog,
            pricing,
            allowed_countries: config
                .allowed_countries
                .iter()
                .map(|c| c.trim().to_ascii_uppercase())
                .collect(),
            minimum_order_amount: config.minimum_order_amount,
            price_drift_tolerance: config.price_drift_tolerance,
            restrictions: config.shipping_restrictions.clone(),
        }
    }

    /// Loads and validates a cart.
    pub async fn validate_cart(&self, cart_id: Uuid) -> Result<ValidationReport, ServiceError> {
        let cart = self
            .carts
            .load(cart_id)
            .await?
            .ok_or_else(|| ServiceError::cart_not_found(cart_id))?;
        self.validate(&cart).await
    }

    /// Runs every check against `cart` without modifying it.
    ///
    /// Errors flip `is_valid` to false; warnings (price drift, backorderable
    /// stock shortfalls) never do.
    ///
    /// # Returns
    ///
    /// * `Ok(ValidationReport)` - Issues in check order plus price estimates
    /// * `Err(ServiceError::Catalog)` - The catalog could not be reached
    #[instrument(skip(self, cart), fields(cart_id = %cart.cart.id))]
    pub async fn validate(&self, cart: &CartWithItems) -> Result<ValidationReport, ServiceError> {
        let cart_id = cart.cart.id;
        let destination = cart.cart.destination_country();
        let estimates = self.pricing.price(
            &cart.items,
            destination.as_deref(),
            cart.cart.discount_total,
        );

        if cart.is_empty() {
            counter!("cart.validation.failed", 1);
            return Ok(ValidationReport::new(
                cart_id,
                vec![ValidationIssue::error(IssueType::EmptyCart, "Cart is empty")],
                estimates,
            ));
        }

        let mut issues = Vec::new();

        match destination.as_deref() {
            None => issues.push(ValidationIssue::error(
                IssueType::ShippingRestriction,
                "A shipping address is required",
            )),
            Some(country) if !self.allowed_countries.contains(country) => {
                issues.push(ValidationIssue::error(
                    IssueType::ShippingRestriction,
                    format!("Shipping to {} is not supported", country),
                ))
            }
            Some(_) => {}
        }

        for item in cart.active_items() {
            let line = |issue: ValidationIssue| issue.for_line(item.product_id, item.variant_id);

            let product = match self.catalog.get_product(item.product_id).await? {
                Some(product) if product.active => product,
                _ => {
                    issues.push(line(ValidationIssue::error(
                        IssueType::ProductUnavailable,
                        format!("{} is no longer available", item.product_name),
                    )));
                    continue;
                }
            };

            if product.tracks_inventory && item.quantity > product.stock_quantity {
                let message = format!(
                    "Only {} of {} in stock ({} requested)",
                    product.stock_quantity.max(0),
                    item.product_name,
                    item.quantity
                );
                issues.push(line(if product.allows_backorder {
                    ValidationIssue::warning(IssueType::InsufficientStock, message)
                } else {
                    ValidationIssue::error(IssueType::InsufficientStock, message)
                }));
            }

            if (product.price - item.unit_price).abs() > self.price_drift_tolerance {
                issues.push(line(ValidationIssue::warning(
                    IssueType::PriceChanged,
                    format!(
                        "Price of {} changed from {} to {}",
                        item.product_name, item.unit_price, product.price
                    ),
                )));
            }

            let category = item.category.as_deref().or(product.category.as_deref());
            if let (Some(category), Some(country)) = (category, destination.as_deref()) {
                if let Some(rule) = self.restrictions.iter().find(|r| r.forbids(category, country)) {
                    let message = rule.reason.clone().unwrap_or_else(|| {
                        format!("{} cannot be shipped to {}", item.product_name, country)
                    });
                    issues.push(line(ValidationIssue::error(
                        IssueType::ShippingRestriction,
                        message,
                    )));
                }
            }
        }

        if estimates.subtotal < self.minimum_order_amount {
            issues.push(ValidationIssue::error(
                IssueType::MinimumOrderNotMet,
                format!(
                    "Minimum order amount is {} (cart subtotal is {})",
                    self.minimum_order_amount, estimates.subtotal
                ),
            ));
        }

        let report = ValidationReport::new(cart_id, issues, estimates);
        if !report.is_valid {
            counter!("cart.validation.failed", 1);
        }
        info!(
            is_valid = report.is_valid,
            issues = report.issues.len(),
            "Validated cart"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PricingConfig, ValidationConfig};
    use crate::entities::commerce::ShippingAddress;
    use crate::repositories::InMemoryCartRepository;
    use crate::services::commerce::cart_service::tests::{guest_cart, sample_item};
    use crate::services::commerce::catalog::{CatalogProduct, MockCatalogLookup};
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;

    fn address(country: &str) -> ShippingAddress {
        ShippingAddress {
            line1: "1 Main St".into(),
            line2: None,
            city: "Springfield".into(),
            region: None,
            postal_code: "12345".into(),
            country: country.into(),
        }
    }

    fn catalog_entry(item: &crate::entities::commerce::CartItemModel) -> CatalogProduct {
        CatalogProduct {
            id: item.product_id,
            name: item.product_name.clone(),
            price: item.unit_price,
            currency: "USD".into(),
            active: true,
            stock_quantity: 100,
            tracks_inventory: true,
            allows_backorder: false,
            category: item.category.clone(),
            vendor_id: item.vendor_id,
            image_url: None,
        }
    }

    fn validator(catalog: MockCatalogLookup) -> CartValidationService {
        CartValidationService::new(
            Arc::new(InMemoryCartRepository::new()),
            Arc::new(catalog),
            Arc::new(PricingEngine::new(&PricingConfig::default())),
            &ValidationConfig::default(),
        )
    }

    fn cart_with(country: Option<&str>, items: usize) -> CartWithItems {
        let mut cart = guest_cart("s");
        cart.cart.shipping_address = country.map(address);
        for _ in 0..items {
            let item = sample_item(cart.cart.id);
            cart.items.push(item);
        }
        cart
    }

    fn catalog_for(cart: &CartWithItems, tweak: impl Fn(&mut CatalogProduct)) -> MockCatalogLookup {
        let products: Vec<CatalogProduct> = cart
            .items
            .iter()
            .map(|item| {
                let mut product = catalog_entry(item);
                tweak(&mut product);
                product
            })
            .collect();
        let mut catalog = MockCatalogLookup::new();
        catalog.expect_get_product().returning(move |id| {
            Ok(products.iter().find(|p| p.id == id).cloned())
        });
        catalog
    }

    #[tokio::test]
    async fn empty_cart_yields_exactly_one_error() {
        let cart = cart_with(Some("ZZ"), 0);
        let report = validator(MockCatalogLookup::new()).validate(&cart).await.unwrap();

        assert!(!report.is_valid);
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].issue_type, IssueType::EmptyCart);
        assert_eq!(report.issues[0].severity, IssueSeverity::Error);
    }

    #[tokio::test]
    async fn clean_cart_is_valid() {
        let cart = cart_with(Some("US"), 2);
        let report = validator(catalog_for(&cart, |_| {})).validate(&cart).await.unwrap();
        assert!(report.is_valid, "{:?}", report.issues);
        assert!(report.issues.is_empty());
    }

    #[tokio::test]
    async fn disallowed_destination_is_a_shipping_restriction() {
        let cart = cart_with(Some("BR"), 1);
        let report = validator(catalog_for(&cart, |_| {})).validate(&cart).await.unwrap();
        assert!(!report.is_valid);
        assert!(report
            .errors()
            .any(|i| i.issue_type == IssueType::ShippingRestriction));
    }

    #[tokio::test]
    async fn missing_destination_is_an_error() {
        let cart = cart_with(None, 1);
        let report = validator(catalog_for(&cart, |_| {})).validate(&cart).await.unwrap();
        assert!(report
            .errors()
            .any(|i| i.issue_type == IssueType::ShippingRestriction));
    }

    #[tokio::test]
    async fn price_drift_is_only_a_warning() {
        let cart = cart_with(Some("US"), 1);
        let report = validator(catalog_for(&cart, |p| p.price += dec!(2.00)))
            .validate(&cart)
            .await
            .unwrap();
        assert!(report.is_valid);
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].issue_type, IssueType::PriceChanged);
        assert_eq!(report.issues[0].severity, IssueSeverity::Warning);
    }

    #[tokio::test]
    async fn drift_within_tolerance_is_ignored() {
        let cart = cart_with(Some("US"), 1);
        let report = validator(catalog_for(&cart, |p| p.price += dec!(0.01)))
            .validate(&cart)
            .await
            .unwrap();
        assert!(report.issues.is_empty());
    }

    #[tokio::test]
    async fn stock_shortfall_severity_depends_on_backorders() {
        let cart = cart_with(Some("US"), 1);
        let report = validator(catalog_for(&cart, |p| p.stock_quantity = 0))
            .validate(&cart)
            .await
            .unwrap();
        assert!(!report.is_valid);
        assert_eq!(report.issues[0].issue_type, IssueType::InsufficientStock);

        let report = validator(catalog_for(&cart, |p| {
            p.stock_quantity = 0;
            p.allows_backorder = true;
        }))
        .validate(&cart)
        .await
        .unwrap();
        assert!(report.is_valid);
        assert_eq!(report.issues[0].severity, IssueSeverity::Warning);
    }

    #[tokio::test]
    async fn inactive_or_missing_products_are_unavailable() {
        let cart = cart_with(Some("US"), 2);
        let first = cart.items[0].product_id;
        let mut catalog = MockCatalogLookup::new();
        let entry = catalog_entry(&cart.items[1]);
        catalog.expect_get_product().returning(move |id| {
            if id == first {
                Ok(None)
            } else {
                Ok(Some(CatalogProduct {
                    active: false,
                    ..entry.clone()
                }))
            }
        });

        let report = validator(catalog).validate(&cart).await.unwrap();
        let unavailable = report
            .errors()
            .filter(|i| i.issue_type == IssueType::ProductUnavailable)
            .count();
        assert_eq!(unavailable, 2);
    }

    #[tokio::test]
    async fn category_restriction_table_applies() {
        let mut cart = cart_with(Some("CA"), 1);
        cart.items[0].category = Some("Alcohol".into());
        let report = validator(catalog_for(&cart, |_| {})).validate(&cart).await.unwrap();

        let issue = report.errors().next().unwrap();
        assert_eq!(issue.issue_type, IssueType::ShippingRestriction);
        assert_eq!(issue.product_id, Some(cart.items[0].product_id));
    }

    #[tokio::test]
    async fn below_minimum_order_is_an_error() {
        let mut cart = cart_with(Some("US"), 1);
        cart.items[0].unit_price = dec!(2.50);
        cart.items[0].quantity = 1;
        cart.items[0].line_total = dec!(2.50);
        let report = validator(catalog_for(&cart, |_| {})).validate(&cart).await.unwrap();
        assert!(report
            .errors()
            .any(|i| i.issue_type == IssueType::MinimumOrderNotMet));
    }

    #[tokio::test]
    async fn saved_items_are_not_validated() {
        let mut cart = cart_with(Some("US"), 2);
        cart.items[1].saved_for_later = true;
        let live = catalog_entry(&cart.items[0]);
        let mut catalog = MockCatalogLookup::new();
        catalog
            .expect_get_product()
            .times(1)
            .returning(move |_| Ok(Some(live.clone())));

        let report = validator(catalog).validate(&cart).await.unwrap();
        assert!(report.is_valid);
    }

    #[tokio::test]
    async fn catalog_failure_propagates() {
        let cart = cart_with(Some("US"), 1);
        let mut catalog = MockCatalogLookup::new();
        catalog
            .expect_get_product()
            .returning(|_| Err(ServiceError::Catalog("timeout".into())));

        assert_matches!(
            validator(catalog).validate(&cart).await,
            Err(ServiceError::Catalog(_))
        );
    }
}
