use crate::services::commerce::{
    cart_validation_service::ShippingRestriction,
    coupon_service::{CouponRule, DiscountType},
};
use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_STORAGE_BACKEND: &str = "in-memory";
const DEFAULT_CURRENCY: &str = "USD";
const DEFAULT_GUEST_CART_TTL_DAYS: i64 = 7;

/// Cart lifecycle settings
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CartConfig {
    /// Currency assigned to newly created carts
    pub default_currency: String,
    /// Lifetime of a guest (session-keyed) cart
    pub guest_cart_ttl_days: i64,
    /// Re-run the coupon evaluator after every mutation, dropping coupons that
    /// no longer qualify
    pub revalidate_coupons: bool,
}

impl Default for CartConfig {
    fn default() -> Self {
        Self {
            default_currency: DEFAULT_CURRENCY.to_string(),
            guest_cart_ttl_days: DEFAULT_GUEST_CART_TTL_DAYS,
            revalidate_coupons: true,
        }
    }
}

/// Rate tables and surcharges consumed by the pricing engine
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PricingConfig {
    /// Country code -> tax rate (0.08 = 8%). Configured entries are layered
    /// over the built-in table.
    #[serde(deserialize_with = "tax_rates_over_defaults")]
    pub tax_rates: HashMap<String, Decimal>,
    /// Rate used when the destination is unknown or missing from `tax_rates`
    pub default_tax_rate: Decimal,
    /// Country code -> base shipping rate, layered like `tax_rates`
    #[serde(deserialize_with = "shipping_rates_over_defaults")]
    pub shipping_rates: HashMap<String, Decimal>,
    /// Base rate used when the destination is unknown or missing from `shipping_rates`
    pub default_shipping_rate: Decimal,
    /// Subtotal at or above which shipping is free
    pub free_shipping_threshold: Decimal,
    /// Share of the base rate added for every vendor beyond the first
    pub multi_vendor_surcharge_ratio: Decimal,
    /// Units in the cart before the bulk surcharge applies
    pub bulk_item_threshold: u32,
    /// Surcharge per unit beyond `bulk_item_threshold`
    pub bulk_item_surcharge: Decimal,
}

impl Default for PricingConfig {
    fn default() -> Self {
        let tax_rates = [
            ("US", dec!(0.08)),
            ("CA", dec!(0.13)),
            ("GB", dec!(0.20)),
            ("DE", dec!(0.19)),
            ("FR", dec!(0.20)),
            ("AU", dec!(0.10)),
        ];
        let shipping_rates = [
            ("US", dec!(5.99)),
            ("CA", dec!(12.99)),
            ("GB", dec!(14.99)),
            ("DE", dec!(14.99)),
            ("FR", dec!(14.99)),
            ("AU", dec!(19.99)),
        ];

        Self {
            tax_rates: tax_rates
                .into_iter()
                .map(|(country, rate)| (country.to_string(), rate))
                .collect(),
            default_tax_rate: dec!(0.10),
            shipping_rates: shipping_rates
                .into_iter()
                .map(|(country, rate)| (country.to_string(), rate))
                .collect(),
            default_shipping_rate: dec!(24.99),
            free_shipping_threshold: dec!(100.00),
            multi_vendor_surcharge_ratio: dec!(0.5),
            bulk_item_threshold: 5,
            bulk_item_surcharge: dec!(1.50),
        }
    }
}

/// Upper-cases country keys and lays `overrides` over `base`.
fn merge_rates(
    mut base: HashMap<String, Decimal>,
    overrides: HashMap<String, Decimal>,
) -> HashMap<String, Decimal> {
    for (country, rate) in overrides {
        base.insert(country.trim().to_ascii_uppercase(), rate);
    }
    base
}

fn tax_rates_over_defaults<'de, D>(deserializer: D) -> Result<HashMap<String, Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    let overrides = HashMap::<String, Decimal>::deserialize(deserializer)?;
    Ok(merge_rates(PricingConfig::default().tax_rates, overrides))
}

fn shipping_rates_over_defaults<'de, D>(
    deserializer: D,
) -> Result<HashMap<String, Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    let overrides = HashMap::<String, Decimal>::deserialize(deserializer)?;
    Ok(merge_rates(PricingConfig::default().shipping_rates, overrides))
}

/// Checkout consistency rules applied by the cart validator
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ValidationConfig {
    /// Destination countries the platform ships to
    pub allowed_countries: Vec<String>,
    /// Absolute floor for the cart subtotal at checkout
    pub minimum_order_amount: Decimal,
    /// Unit price divergence tolerated before a price-drift warning
    pub price_drift_tolerance: Decimal,
    /// Declarative (category, destination) restrictions
    pub shipping_restrictions: Vec<ShippingRestriction>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            allowed_countries: ["US", "CA", "GB", "DE", "FR", "AU"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            minimum_order_amount: dec!(10.00),
            price_drift_tolerance: dec!(0.01),
            shipping_restrictions: vec![
                ShippingRestriction {
                    category: "alcohol".to_string(),
                    countries: vec!["CA".to_string(), "AU".to_string()],
                    reason: Some("Alcohol cannot be shipped across this border".to_string()),
                },
                ShippingRestriction {
                    category: "lithium-batteries".to_string(),
                    countries: vec!["AU".to_string()],
                    reason: None,
                },
            ],
        }
    }
}

pub fn default_coupons() -> Vec<CouponRule> {
    vec![
        CouponRule {
            code: "SAVE10".to_string(),
            discount_type: DiscountType::Percentage,
            value: dec!(0.10),
            minimum_order: dec!(50),
            maximum_discount: Some(dec!(20)),
            active: true,
        },
        CouponRule {
            code: "WELCOME5".to_string(),
            discount_type: DiscountType::Fixed,
            value: dec!(5),
            minimum_order: dec!(25),
            maximum_discount: None,
            active: true,
        },
        CouponRule {
            code: "BIGSPENDER".to_string(),
            discount_type: DiscountType::Percentage,
            value: dec!(0.15),
            minimum_order: dec!(200),
            maximum_discount: None,
            active: true,
        },
        CouponRule {
            code: "EXPIRED20".to_string(),
            discount_type: DiscountType::Percentage,
            value: dec!(0.20),
            minimum_order: Decimal::ZERO,
            maximum_discount: None,
            active: false,
        },
    ]
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Where carts and abandonment rows live: "in-memory" or "database"
    #[serde(default = "default_storage_backend")]
    #[validate(custom = "validate_storage_backend")]
    pub storage_backend: String,

    /// Database connection URL (required for the "database" backend)
    #[serde(default)]
    pub database_url: Option<String>,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Event channel capacity for async event processing
    #[serde(default = "default_event_channel_capacity")]
    #[validate(custom = "validate_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Base URL of the catalog service; unset means the in-process catalog
    #[serde(default)]
    pub catalog_base_url: Option<String>,

    /// Timeout applied to each catalog lookup
    #[serde(default = "default_catalog_timeout_secs")]
    pub catalog_timeout_secs: u64,

    #[serde(default)]
    pub cart: CartConfig,

    #[serde(default)]
    pub pricing: PricingConfig,

    #[serde(default)]
    pub validation: ValidationConfig,

    #[serde(default = "default_coupons")]
    pub coupons: Vec<CouponRule>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: default_port(),
            environment: DEFAULT_ENV.to_string(),
            log_level: default_log_level(),
            log_json: false,
            storage_backend: default_storage_backend(),
            database_url: None,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            catalog_base_url: None,
            catalog_timeout_secs: default_catalog_timeout_secs(),
            cart: CartConfig::default(),
            pricing: PricingConfig::default(),
            validation: ValidationConfig::default(),
            coupons: default_coupons(),
        }
    }
}

impl AppConfig {
    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    /// Checks if running in production environment
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// True when carts are persisted through SeaORM
    pub fn uses_database(&self) -> bool {
        self.storage_backend.eq_ignore_ascii_case("database")
    }

    /// Cross-field and table checks that the derive cannot express
    pub fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.uses_database()
            && self
                .database_url
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .is_empty()
        {
            errors.add(
                "database_url",
                config_error(
                    "database_url_required",
                    "APP__DATABASE_URL must be set when storage_backend is \"database\"",
                ),
            );
        }

        let pricing = &self.pricing;
        let rate_out_of_range = |rate: &Decimal| *rate < Decimal::ZERO || *rate > Decimal::ONE;
        if pricing.tax_rates.values().any(rate_out_of_range)
            || rate_out_of_range(&pricing.default_tax_rate)
        {
            errors.add(
                "pricing",
                config_error("tax_rate_range", "tax rates must be between 0.0 and 1.0"),
            );
        }
        if pricing
            .shipping_rates
            .values()
            .any(|rate| rate.is_sign_negative())
            || pricing.default_shipping_rate.is_sign_negative()
            || pricing.bulk_item_surcharge.is_sign_negative()
            || pricing.multi_vendor_surcharge_ratio.is_sign_negative()
            || pricing.free_shipping_threshold.is_sign_negative()
        {
            errors.add(
                "pricing",
                config_error(
                    "negative_shipping",
                    "shipping rates, surcharges and thresholds must not be negative",
                ),
            );
        }

        if self.validation.price_drift_tolerance.is_sign_negative()
            || self.validation.minimum_order_amount.is_sign_negative()
        {
            errors.add(
                "validation",
                config_error(
                    "negative_threshold",
                    "price_drift_tolerance and minimum_order_amount must not be negative",
                ),
            );
        }

        if self.cart.guest_cart_ttl_days <= 0 {
            errors.add(
                "cart",
                config_error("guest_cart_ttl_days", "guest_cart_ttl_days must be positive"),
            );
        }

        for coupon in &self.coupons {
            let valid = match coupon.discount_type {
                DiscountType::Percentage => {
                    coupon.value > Decimal::ZERO && coupon.value <= Decimal::ONE
                }
                DiscountType::Fixed => coupon.value > Decimal::ZERO,
            };
            if !valid || coupon.code.trim().is_empty() {
                errors.add(
                    "coupons",
                    config_error(
                        "coupon_rule",
                        "coupon codes must be non-empty; percentages in (0, 1], fixed amounts positive",
                    ),
                );
                break;
            }
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn config_error(code: &'static str, message: &'static str) -> ValidationError {
    let mut err = ValidationError::new(code);
    err.message = Some(message.into());
    err
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_storage_backend() -> String {
    DEFAULT_STORAGE_BACKEND.to_string()
}

fn default_db_max_connections() -> u32 {
    16
}
fn default_db_min_connections() -> u32 {
    2
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_catalog_timeout_secs() -> u64 {
    5
}

fn validate_storage_backend(value: &str) -> Result<(), ValidationError> {
    match value.to_ascii_lowercase().as_str() {
        "in-memory" | "database" => Ok(()),
        _ => {
            let mut err = ValidationError::new("storage_backend");
            err.message = Some("Must be one of: in-memory, database".into());
            Err(err)
        }
    }
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_event_channel_capacity(capacity: usize) -> Result<(), ValidationError> {
    if capacity == 0 {
        let mut err = ValidationError::new("event_channel_capacity");
        err.message = Some("event_channel_capacity must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("stateset_cart={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let builder = fmt().with_env_filter(EnvFilter::new(filter_directive));
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if let Err(err) = installed {
        eprintln!("tracing subscriber already installed: {}", err);
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    load_config_from(CONFIG_DIR)
}

/// Same as [`load_config`] but reading TOML files from `config_dir`.
pub fn load_config_from(config_dir: &str) -> Result<AppConfig, AppConfigError> {
    // Support both RUN_ENV and APP_ENV for selecting config profile
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(config_dir).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            config_dir
        );
    }

    let config = Config::builder()
        .set_default("host", "0.0.0.0")?
        .set_default("port", i64::from(DEFAULT_PORT))?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", config_dir)).required(false))
        .add_source(File::with_name(&format!("{}/{}", config_dir, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
