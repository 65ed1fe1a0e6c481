use crate::{config::PricingConfig, entities::commerce::CartItemModel};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Rounds a money amount to cents, half away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Computed totals for a cart snapshot
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub shipping: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
    pub tax_rate: Decimal,
    pub item_count: i32,
    pub vendor_count: i32,
}

/// Tax and shipping calculator over injected rate tables.
///
/// Pure: the same items, destination and discount always produce the same
/// breakdown.
#[derive(Clone, Debug)]
pub struct PricingEngine {
    tax_rates: HashMap<String, Decimal>,
    default_tax_rate: Decimal,
    shipping_rates: HashMap<String, Decimal>,
    default_shipping_rate: Decimal,
    free_shipping_threshold: Decimal,
    multi_vendor_surcharge_ratio: Decimal,
    bulk_item_threshold: u32,
    bulk_item_surcharge: Decimal,
}

fn normalize_keys(rates: &HashMap<String, Decimal>) -> HashMap<String, Decimal> {
    rates
        .iter()
        .map(|(country, rate)| (country.trim().to_ascii_uppercase(), *rate))
        .collect()
}

impl PricingEngine {
    pub fn new(config: &PricingConfig) -> Self {
        Self {
            tax_rates: normalize_keys(&config.tax_rates),
            default_tax_rate: config.default_tax_rate,
            shipping_rates: normalize_keys(&config.shipping_rates),
            default_shipping_rate: config.default_shipping_rate,
            free_shipping_threshold: config.free_shipping_threshold,
            multi_vendor_surcharge_ratio: config.multi_vendor_surcharge_ratio,
            bulk_item_threshold: config.bulk_item_threshold,
            bulk_item_surcharge: config.bulk_item_surcharge,
        }
    }

    pub fn tax_rate(&self, country: Option<&str>) -> Decimal {
        country
            .and_then(|c| self.tax_rates.get(&c.trim().to_ascii_uppercase()))
            .copied()
            .unwrap_or(self.default_tax_rate)
    }

    pub fn base_shipping_rate(&self, country: Option<&str>) -> Decimal {
        country
            .and_then(|c| self.shipping_rates.get(&c.trim().to_ascii_uppercase()))
            .copied()
            .unwrap_or(self.default_shipping_rate)
    }

    pub fn free_shipping_threshold(&self) -> Decimal {
        self.free_shipping_threshold
    }

    /// Amount still needed to qualify for free shipping
    pub fn free_shipping_remaining(&self, subtotal: Decimal) -> Decimal {
        (self.free_shipping_threshold - subtotal).max(Decimal::ZERO)
    }

    /// Shipping for a cart with the given subtotal and counters.
    pub fn shipping(
        &self,
        subtotal: Decimal,
        country: Option<&str>,
        vendor_count: i32,
        item_count: i32,
    ) -> Decimal {
        if item_count <= 0 || subtotal >= self.free_shipping_threshold {
            return Decimal::ZERO;
        }

        let base = self.base_shipping_rate(country);
        let extra_vendors = Decimal::from((vendor_count - 1).max(0));
        let vendor_surcharge = base * self.multi_vendor_surcharge_ratio * extra_vendors;

        let threshold = i64::from(self.bulk_item_threshold);
        let bulk_units = Decimal::from((i64::from(item_count) - threshold).max(0));
        let bulk_surcharge = self.bulk_item_surcharge * bulk_units;

        round_money(base + vendor_surcharge + bulk_surcharge)
    }

    /// Prices the non-saved lines of a cart.
    pub fn price(
        &self,
        items: &[CartItemModel],
        country: Option<&str>,
        discount: Decimal,
    ) -> PriceBreakdown {
        let active: Vec<&CartItemModel> = items.iter().filter(|i| !i.saved_for_later).collect();

        let subtotal: Decimal = active.iter().map(|item| item.line_total).sum();
        let units: i64 = active.iter().map(|item| i64::from(item.quantity)).sum();
        let item_count = i32::try_from(units).unwrap_or(i32::MAX);
        let vendor_count = active
            .iter()
            .map(|item| item.vendor_id)
            .collect::<HashSet<_>>()
            .len() as i32;

        let tax_rate = self.tax_rate(country);
        let tax = if active.is_empty() {
            Decimal::ZERO
        } else {
            round_money(subtotal * tax_rate)
        };
        let shipping = self.shipping(subtotal, country, vendor_count, item_count);

        PriceBreakdown {
            subtotal,
            tax,
            shipping,
            discount,
            total: subtotal + tax + shipping - discount,
            tax_rate,
            item_count,
            vendor_count,
        }
    }
}

/// Splits `amount` across `weights` proportionally; rounding remainder lands on
/// the last share so the shares always sum to `amount`.
pub fn allocate(amount: Decimal, weights: &[Decimal]) -> Vec<Decimal> {
    let total_weight: Decimal = weights.iter().copied().sum();
    if weights.is_empty() {
        return Vec::new();
    }
    if total_weight.is_zero() || amount.is_zero() {
        return vec![Decimal::ZERO; weights.len()];
    }

    let mut shares = Vec::with_capacity(weights.len());
    let mut allocated = Decimal::ZERO;
    for weight in &weights[..weights.len() - 1] {
        let share = round_money(amount * *weight / total_weight);
        allocated += share;
        shares.push(share);
    }
    shares.push(amount - allocated);
    shares
}

/// Writes per-line tax and discount shares onto the items; saved lines get zero.
pub fn apply_line_allocations(items: &mut [CartItemModel], breakdown: &PriceBreakdown) {
    let weights: Vec<Decimal> = items
        .iter()
        .filter(|i| !i.saved_for_later)
        .map(|i| i.line_total)
        .collect();
    let mut taxes = allocate(breakdown.tax, &weights).into_iter();
    let mut discounts = allocate(breakdown.discount, &weights).into_iter();

    for item in items.iter_mut() {
        if item.saved_for_later {
            item.tax_amount = Decimal::ZERO;
            item.discount_amount = Decimal::ZERO;
        } else {
            item.tax_amount = taxes.next().unwrap_or_default();
            item.discount_amount = discounts.next().unwrap_or_default();
        }
    }
}
