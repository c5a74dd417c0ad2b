//! Quota computation for asynchronous video and image work.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::app::config::BillingConfig;

/// Duration assumed when a request or result carries none.
pub const DEFAULT_VIDEO_DURATION_SECS: u32 = 5;

/// USD price used when neither a rule nor a model default applies.
const FLOOR_PRICE_USD: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingType {
    PerSecond,
    Fixed,
}

/// A pricing rule. Empty or `*` fields match anything, a trailing `*` is a
/// case-insensitive prefix match, and the highest priority match wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoPricingRule {
    pub model: String,
    #[serde(rename = "type", default)]
    pub request_type: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub duration: String,
    #[serde(default)]
    pub resolution: String,
    pub pricing_type: PricingType,
    pub price: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub priority: i32,
}

fn default_currency() -> String {
    "USD".to_string()
}

#[derive(Debug, Clone, Copy)]
pub struct PricingInput<'a> {
    pub model: &'a str,
    pub request_type: &'a str,
    pub mode: &'a str,
    pub duration_secs: u32,
    pub resolution: &'a str,
}

#[derive(Debug, Clone)]
pub struct Pricing {
    rules: Vec<VideoPricingRule>,
    default_model_price: HashMap<String, f64>,
    quota_per_unit: Decimal,
    cny_to_usd_rate: Decimal,
}

impl Pricing {
    pub fn from_config(config: &BillingConfig) -> Self {
        Self {
            rules: config.video_pricing_rules.clone(),
            default_model_price: config.default_model_price.clone(),
            quota_per_unit: decimal(config.quota_per_unit),
            cny_to_usd_rate: decimal(config.cny_to_usd_rate),
        }
    }

    pub fn matching_rule(&self, input: &PricingInput<'_>) -> Option<&VideoPricingRule> {
        let duration = input.duration_secs.to_string();
        self.rules
            .iter()
            .filter(|rule| {
                match_pattern(&rule.model, input.model)
                    && match_pattern(&rule.request_type, input.request_type)
                    && match_pattern(&rule.mode, input.mode)
                    && match_pattern(&rule.duration, &duration)
                    && match_pattern(&rule.resolution, input.resolution)
            })
            .fold(None, |best: Option<&VideoPricingRule>, rule| match best {
                Some(current) if current.priority >= rule.priority => Some(current),
                _ => Some(rule),
            })
    }

    pub fn video_quota(&self, input: &PricingInput<'_>) -> i64 {
        let duration = if input.duration_secs == 0 {
            DEFAULT_VIDEO_DURATION_SECS
        } else {
            input.duration_secs
        };
        let input = PricingInput {
            duration_secs: duration,
            ..*input
        };

        let usd = match self.matching_rule(&input) {
            Some(rule) => {
                let mut price = decimal(rule.price);
                if rule.currency.eq_ignore_ascii_case("CNY") {
                    price *= self.cny_to_usd_rate;
                }
                match rule.pricing_type {
                    PricingType::PerSecond => price * Decimal::from(duration),
                    PricingType::Fixed => price,
                }
            }
            None => decimal(self.model_price(input.model)),
        };

        let quota = self.usd_to_quota(usd);
        debug!(
            "Video quota for model={} type={} mode={} duration={}s: {}",
            input.model, input.request_type, input.mode, duration, quota
        );
        quota
    }

    pub fn image_quota(&self, model: &str, count: u32) -> i64 {
        let count = count.max(1);
        self.usd_to_quota(decimal(self.model_price(model)) * Decimal::from(count))
    }

    /// Converts a provider-reported CNY charge into quota. Returns `None` for
    /// unparsable or non-positive amounts.
    pub fn quota_from_cny(&self, amount: &str) -> Option<i64> {
        let cny: Decimal = amount.trim().parse().ok()?;
        if cny <= Decimal::ZERO {
            return None;
        }
        Some(self.usd_to_quota(cny * self.cny_to_usd_rate))
    }

    fn model_price(&self, model: &str) -> f64 {
        self.default_model_price.get(model).copied().unwrap_or(FLOOR_PRICE_USD)
    }

    fn usd_to_quota(&self, usd: Decimal) -> i64 {
        (usd * self.quota_per_unit).trunc().to_i64().unwrap_or(i64::MAX)
    }
}

/// Goes through the shortest decimal text form so 0.028 stays exactly 0.028.
fn decimal(value: f64) -> Decimal {
    value.to_string().parse().unwrap_or(Decimal::ZERO)
}

fn match_pattern(pattern: &str, value: &str) -> bool {
    if pattern.is_empty() || pattern == "*" {
        return true;
    }
    if value.is_empty() {
        return false;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => value.to_lowercase().starts_with(&prefix.to_lowercase()),
        None => pattern.eq_ignore_ascii_case(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pricing() -> Pricing {
        Pricing::from_config(&BillingConfig::default())
    }

    fn input<'a>(model: &'a str, mode: &'a str, duration_secs: u32) -> PricingInput<'a> {
        PricingInput {
            model,
            request_type: "text2video",
            mode,
            duration_secs,
            resolution: "",
        }
    }

    #[test]
    fn test_match_pattern() {
        assert!(match_pattern("*", "anything"));
        assert!(match_pattern("", ""));
        assert!(match_pattern("kling*", "Kling-V1-6"));
        assert!(match_pattern("STD", "std"));
        assert!(!match_pattern("std", ""));
        assert!(!match_pattern("pro", "std"));
    }

    #[test]
    fn test_per_second_pricing_follows_duration() {
        let pricing = pricing();
        let ten = pricing.video_quota(&input("kling-v1", "std", 10));
        let seven = pricing.video_quota(&input("kling-v1", "std", 7));

        // 0.028 USD/s * 500000 quota per USD
        assert_eq!(ten, 140_000);
        assert_eq!(seven, 98_000);
        assert!(seven < ten);
    }

    #[test]
    fn test_zero_duration_uses_default() {
        let pricing = pricing();
        assert_eq!(
            pricing.video_quota(&input("kling-v1", "std", 0)),
            pricing.video_quota(&input("kling-v1", "std", DEFAULT_VIDEO_DURATION_SECS))
        );
    }

    #[test]
    fn test_priority_and_fallbacks() {
        let mut config = BillingConfig::default();
        config.video_pricing_rules.push(VideoPricingRule {
            model: "kling-v1".to_string(),
            request_type: "*".to_string(),
            mode: "std".to_string(),
            duration: "5".to_string(),
            resolution: String::new(),
            pricing_type: PricingType::Fixed,
            price: 1.0,
            currency: "CNY".to_string(),
            priority: 50,
        });
        let pricing = Pricing::from_config(&config);

        // fixed 1 CNY * 0.14 rate * 500000
        assert_eq!(pricing.video_quota(&input("kling-v1", "std", 5)), 70_000);
        // falls back to model default price
        assert_eq!(pricing.video_quota(&input("kling-v1-6", "turbo", 5)), 140_000);
        // unknown model uses the floor price
        assert_eq!(pricing.video_quota(&input("mystery", "std", 5)), 50_000);
    }

    #[test]
    fn test_cny_and_image_quota() {
        let pricing = pricing();
        assert_eq!(pricing.quota_from_cny("2"), Some(140_000));
        assert_eq!(pricing.quota_from_cny("0"), None);
        assert_eq!(pricing.quota_from_cny("abc"), None);

        assert_eq!(pricing.image_quota("kling-image", 2), 3_500);
        assert_eq!(pricing.image_quota("kling-image", 0), 1_750);
    }
}
