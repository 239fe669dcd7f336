//! Pricing/quota tiers and tier detection.

use std::collections::BTreeMap;

use llmrouter_config::TierConfig;
use serde::{Deserialize, Serialize};

/// Quota class assigned to a principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Basic,
    Pro,
    Enterprise,
    Admin,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Basic => "basic",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
            Self::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "free" => Some(Self::Free),
            "basic" => Some(Self::Basic),
            "pro" => Some(Self::Pro),
            "enterprise" => Some(Self::Enterprise),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    /// Detection order: admin role → API-key tier → user tier → free.
    pub fn detect(is_admin: bool, key_tier: Option<Tier>, user_tier: Option<Tier>) -> Tier {
        if is_admin {
            return Tier::Admin;
        }
        key_tier.or(user_tier).unwrap_or(Tier::Free)
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quota numbers for one tier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierLimits {
    pub requests_per_minute: i64,
    pub requests_per_hour: i64,
    pub concurrent: i64,
    pub daily_tokens: i64,
    pub monthly_requests: i64,
    pub cost_multiplier: f64,
}

/// The tier → limits table. Built-in defaults, overridable via config.
#[derive(Debug, Clone)]
pub struct TierTable {
    limits: BTreeMap<Tier, TierLimits>,
}

impl TierTable {
    /// Built-in defaults.
    pub fn builtin() -> Self {
        let mut limits = BTreeMap::new();
        limits.insert(
            Tier::Free,
            TierLimits {
                requests_per_minute: 10,
                requests_per_hour: 100,
                concurrent: 2,
                daily_tokens: 50_000,
                monthly_requests: 2_000,
                cost_multiplier: 1.0,
            },
        );
        limits.insert(
            Tier::Basic,
            TierLimits {
                requests_per_minute: 60,
                requests_per_hour: 1_000,
                concurrent: 5,
                daily_tokens: 500_000,
                monthly_requests: 20_000,
                cost_multiplier: 1.0,
            },
        );
        limits.insert(
            Tier::Pro,
            TierLimits {
                requests_per_minute: 300,
                requests_per_hour: 10_000,
                concurrent: 20,
                daily_tokens: 5_000_000,
                monthly_requests: 200_000,
                cost_multiplier: 0.9,
            },
        );
        limits.insert(
            Tier::Enterprise,
            TierLimits {
                requests_per_minute: 1_000,
                requests_per_hour: 50_000,
                concurrent: 100,
                daily_tokens: 50_000_000,
                monthly_requests: 2_000_000,
                cost_multiplier: 0.8,
            },
        );
        limits.insert(
            Tier::Admin,
            TierLimits {
                requests_per_minute: 10_000,
                requests_per_hour: 500_000,
                concurrent: 500,
                daily_tokens: i64::MAX,
                monthly_requests: i64::MAX,
                cost_multiplier: 0.0,
            },
        );
        Self { limits }
    }

    /// Built-ins with config overrides applied on top.
    pub fn from_config(overrides: &BTreeMap<String, TierConfig>) -> Self {
        let mut table = Self::builtin();
        for (name, cfg) in overrides {
            if let Some(tier) = Tier::parse(name) {
                table.limits.insert(
                    tier,
                    TierLimits {
                        requests_per_minute: cfg.requests_per_minute as i64,
                        requests_per_hour: cfg.requests_per_hour as i64,
                        concurrent: cfg.concurrent as i64,
                        daily_tokens: cfg.daily_tokens as i64,
                        monthly_requests: cfg.monthly_requests as i64,
                        cost_multiplier: cfg.cost_multiplier,
                    },
                );
            } else {
                tracing::warn!(tier = %name, "Ignoring limits for unknown tier");
            }
        }
        table
    }

    pub fn get(&self, tier: Tier) -> TierLimits {
        // Every tier is present by construction
        self.limits[&tier]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_order() {
        assert_eq!(Tier::detect(true, Some(Tier::Free), None), Tier::Admin);
        assert_eq!(
            Tier::detect(false, Some(Tier::Pro), Some(Tier::Basic)),
            Tier::Pro
        );
        assert_eq!(Tier::detect(false, None, Some(Tier::Basic)), Tier::Basic);
        assert_eq!(Tier::detect(false, None, None), Tier::Free);
    }

    #[test]
    fn builtin_tiers_are_monotonic() {
        let table = TierTable::builtin();
        assert!(
            table.get(Tier::Free).requests_per_minute
                < table.get(Tier::Basic).requests_per_minute
        );
        assert!(
            table.get(Tier::Basic).requests_per_minute
                < table.get(Tier::Pro).requests_per_minute
        );
    }

    #[test]
    fn config_overrides_apply() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "basic".to_string(),
            TierConfig {
                requests_per_minute: 2,
                requests_per_hour: 10,
                concurrent: 1,
                daily_tokens: 100,
                monthly_requests: 100,
                cost_multiplier: 2.0,
            },
        );
        let table = TierTable::from_config(&overrides);
        assert_eq!(table.get(Tier::Basic).requests_per_minute, 2);
        // Other tiers keep built-ins
        assert_eq!(table.get(Tier::Free).requests_per_minute, 10);
    }

    #[test]
    fn tier_parse_round_trip() {
        for tier in [Tier::Free, Tier::Basic, Tier::Pro, Tier::Enterprise, Tier::Admin] {
            assert_eq!(Tier::parse(tier.as_str()), Some(tier));
        }
        assert_eq!(Tier::parse("platinum"), None);
    }
}
