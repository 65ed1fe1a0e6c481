use crate::{errors::ServiceError, services::commerce::pricing_service::round_money};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscountType {
    /// `value` is a fraction of the subtotal (0.10 = 10%)
    Percentage,
    /// `value` is a flat amount
    Fixed,
}

/// One entry of the coupon catalog
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponRule {
    pub code: String,
    pub discount_type: DiscountType,
    pub value: Decimal,
    #[serde(default)]
    pub minimum_order: Decimal,
    #[serde(default)]
    pub maximum_discount: Option<Decimal>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Result of a successful evaluation
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CouponDiscount {
    /// Canonical (upper-case) coupon code
    pub code: String,
    pub amount: Decimal,
}

/// Validates coupon codes against an injected rule table.
#[derive(Clone, Debug, Default)]
pub struct CouponEvaluator {
    rules: HashMap<String, CouponRule>,
}

fn canonical(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

impl CouponEvaluator {
    pub fn new(rules: &[CouponRule]) -> Self {
        Self {
            rules: rules
                .iter()
                .map(|rule| (canonical(&rule.code), rule.clone()))
                .collect(),
        }
    }

    pub fn rule(&self, code: &str) -> Option<&CouponRule> {
        self.rules.get(&canonical(code))
    }

    /// Computes the discount `code` grants on `subtotal`.
    ///
    /// Unknown or inactive codes fail with `InvalidCoupon`; a subtotal below the
    /// rule's minimum fails with `MinimumOrderNotMet`.
    pub fn evaluate(&self, code: &str, subtotal: Decimal) -> Result<CouponDiscount, ServiceError> {
        let rule = self
            .rule(code)
            .filter(|rule| rule.active)
            .ok_or_else(|| ServiceError::InvalidCoupon(format!("Coupon code {} is not valid", code.trim())))?;

        if subtotal < rule.minimum_order {
            return Err(ServiceError::MinimumOrderNotMet {
                code: canonical(&rule.code),
                minimum: rule.minimum_order,
                subtotal,
            });
        }

        let amount = match rule.discount_type {
            DiscountType::Percentage => {
                let raw = round_money(subtotal * rule.value);
                match rule.maximum_discount {
                    Some(cap) => raw.min(cap),
                    None => raw,
                }
            }
            DiscountType::Fixed => rule.value.min(subtotal),
        };

        Ok(CouponDiscount {
            code: canonical(&rule.code),
            amount,
        })
    }
}
