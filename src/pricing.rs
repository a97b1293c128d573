//! Capability catalog and credit pricing.
//!
//! Every [`Capability`] has a [`Pricing`] rule in the [`PriceTable`]: flat,
//! per-unit (e.g. training steps) or duration-scaled (video and music seconds).
//! Discounts from the on-chain lookup are applied on top by [`Discount::apply`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::decoder::MediaKind;

/// A kind of generation work a user can pay for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Image,
    Video,
    Model3d,
    Music,
    Training,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::Image,
        Capability::Video,
        Capability::Model3d,
        Capability::Music,
        Capability::Training,
    ];

    /// Media type the decoder should look for in a finished job.
    pub fn media_kind(self) -> MediaKind {
        match self {
            Capability::Image => MediaKind::Image,
            Capability::Video => MediaKind::Video,
            Capability::Model3d => MediaKind::Model3d,
            Capability::Music => MediaKind::Audio,
            Capability::Training => MediaKind::Weights,
        }
    }

    /// Default wall-clock polling budget for this workload.
    pub fn default_poll_budget(self) -> Duration {
        let minutes = match self {
            Capability::Image | Capability::Music => 8,
            Capability::Model3d => 10,
            Capability::Video | Capability::Training => 15,
        };
        Duration::from_secs(minutes * 60)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Image => write!(f, "image"),
            Capability::Video => write!(f, "video"),
            Capability::Model3d => write!(f, "model3d"),
            Capability::Music => write!(f, "music"),
            Capability::Training => write!(f, "training"),
        }
    }
}

impl FromStr for Capability {
    type Err = PricingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .into_iter()
            .find(|c| c.to_string().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PricingError::UnknownCapability(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PricingError {
    #[error("unknown capability: {0}")]
    UnknownCapability(String),

    #[error("invalid parameter `{param}`: {reason}")]
    InvalidParam { param: String, reason: String },
}

/// How a capability is priced, in credits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Pricing {
    /// Same price for every request.
    Flat { credits: Decimal },
    /// Price per unit read from an integer request parameter.
    PerUnit {
        credits_per_unit: Decimal,
        unit_param: String,
        default_units: u64,
    },
    /// Price per second read from a duration parameter (`8`, `8.5` or `"8s"`).
    PerSecond {
        credits_per_second: Decimal,
        duration_param: String,
        default_seconds: Decimal,
        minimum: Decimal,
    },
}

impl Pricing {
    pub fn resolve(&self, params: &Value) -> Result<Decimal, PricingError> {
        let price = match self {
            Pricing::Flat { credits } => *credits,
            Pricing::PerUnit {
                credits_per_unit,
                unit_param,
                default_units,
            } => {
                let units = match params.get(unit_param) {
                    None | Some(Value::Null) => *default_units,
                    Some(v) => v.as_u64().ok_or_else(|| PricingError::InvalidParam {
                        param: unit_param.clone(),
                        reason: "expected a non-negative integer".into(),
                    })?,
                };
                if units == 0 {
                    return Err(PricingError::InvalidParam {
                        param: unit_param.clone(),
                        reason: "must be at least 1".into(),
                    });
                }
                credits_per_unit
                    .checked_mul(Decimal::from(units))
                    .ok_or_else(|| PricingError::InvalidParam {
                        param: unit_param.clone(),
                        reason: "price out of range".into(),
                    })?
            }
            Pricing::PerSecond {
                credits_per_second,
                duration_param,
                default_seconds,
                minimum,
            } => {
                let seconds = match params.get(duration_param) {
                    None | Some(Value::Null) => *default_seconds,
                    Some(v) => parse_seconds(v).ok_or_else(|| PricingError::InvalidParam {
                        param: duration_param.clone(),
                        reason: "expected a positive duration in seconds".into(),
                    })?,
                };
                credits_per_second
                    .checked_mul(seconds)
                    .ok_or_else(|| PricingError::InvalidParam {
                        param: duration_param.clone(),
                        reason: "price out of range".into(),
                    })?
                    .max(*minimum)
            }
        };
        Ok(price.round_dp(2))
    }
}

// Accepts JSON numbers and strings like "8" or "8s".
fn parse_seconds(value: &Value) -> Option<Decimal> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().trim_end_matches('s').to_string(),
        _ => return None,
    };
    Decimal::from_str(&text)
        .ok()
        .filter(|d| *d > Decimal::ZERO)
}

/// Price rules per capability.
#[derive(Debug, Clone)]
pub struct PriceTable {
    prices: HashMap<Capability, Pricing>,
}

impl Default for PriceTable {
    fn default() -> Self {
        let mut prices = HashMap::new();
        prices.insert(Capability::Image, Pricing::Flat { credits: dec!(1) });
        prices.insert(
            Capability::Video,
            Pricing::PerSecond {
                credits_per_second: dec!(0.5),
                duration_param: "duration".into(),
                default_seconds: dec!(5),
                minimum: dec!(2),
            },
        );
        prices.insert(Capability::Model3d, Pricing::Flat { credits: dec!(5) });
        prices.insert(
            Capability::Music,
            Pricing::PerSecond {
                credits_per_second: dec!(0.1),
                duration_param: "duration".into(),
                default_seconds: dec!(30),
                minimum: dec!(1),
            },
        );
        prices.insert(
            Capability::Training,
            Pricing::PerUnit {
                credits_per_unit: dec!(0.01),
                unit_param: "steps".into(),
                default_units: 1000,
            },
        );
        Self { prices }
    }
}

impl PriceTable {
    /// Default table with the given per-capability overrides applied.
    pub fn with_overrides(overrides: &HashMap<Capability, Pricing>) -> Self {
        let mut table = Self::default();
        for (capability, pricing) in overrides {
            table.prices.insert(*capability, pricing.clone());
        }
        table
    }

    pub fn pricing(&self, capability: Capability) -> Option<&Pricing> {
        self.prices.get(&capability)
    }

    pub fn resolve(&self, capability: Capability, params: &Value) -> Result<Decimal, PricingError> {
        self.pricing(capability)
            .ok_or_else(|| PricingError::UnknownCapability(capability.to_string()))?
            .resolve(params)
    }
}

/// Result of the (expensive) discount / free-tier lookup for an actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Discount {
    /// Percentage taken off the price, clamped to 0..=100.
    pub percent_off: u8,
    /// Free-tier actors pay nothing for this capability.
    pub free_tier: bool,
}

impl Discount {
    pub fn apply(&self, price: Decimal) -> Decimal {
        if self.free_tier {
            return Decimal::ZERO;
        }
        let pct = Decimal::from(self.percent_off.min(100));
        (price * (dec!(100) - pct) / dec!(100)).round_dp(2)
    }
}
