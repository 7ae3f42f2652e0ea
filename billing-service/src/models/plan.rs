//! Plan catalog model.

use crate::error::BillingError;
use serde::{Deserialize, Serialize};

/// Subscription plan tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionPlan {
    Starter,
    Growth,
    Enterprise,
    Custom,
}

impl SubscriptionPlan {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionPlan::Starter => "starter",
            SubscriptionPlan::Growth => "growth",
            SubscriptionPlan::Enterprise => "enterprise",
            SubscriptionPlan::Custom => "custom",
        }
    }

    /// Parse a plan name, case-insensitively. Unknown names yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "starter" => Some(SubscriptionPlan::Starter),
            "growth" => Some(SubscriptionPlan::Growth),
            "enterprise" => Some(SubscriptionPlan::Enterprise),
            "custom" => Some(SubscriptionPlan::Custom),
            _ => None,
        }
    }
}

/// Billing interval for subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingInterval {
    Monthly,
    Yearly,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Monthly => "monthly",
            BillingInterval::Yearly => "yearly",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "yearly" => BillingInterval::Yearly,
            _ => BillingInterval::Monthly,
        }
    }

    /// Calendar months covered by one period.
    pub fn months(&self) -> u32 {
        match self {
            BillingInterval::Monthly => 1,
            BillingInterval::Yearly => 12,
        }
    }
}

/// Static pricing for one plan. Prices are in minor currency units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanDefinition {
    pub plan: SubscriptionPlan,
    pub monthly_price_minor_units: i64,
    pub yearly_price_minor_units: i64,
    pub monthly_hours: i32,
    /// The catalog price is a sentinel; activation needs a negotiated amount.
    pub requires_custom_price: bool,
}

impl PlanDefinition {
    pub fn price_for(&self, interval: BillingInterval) -> i64 {
        match interval {
            BillingInterval::Monthly => self.monthly_price_minor_units,
            BillingInterval::Yearly => self.yearly_price_minor_units,
        }
    }
}

/// Immutable plan pricing table, built once at startup and shared by the services.
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    plans: Vec<PlanDefinition>,
}

impl PlanCatalog {
    pub fn new(plans: Vec<PlanDefinition>) -> Self {
        Self { plans }
    }

    /// Look up a plan's pricing. `None` when the plan is not offered by this catalog.
    pub fn get(&self, plan: SubscriptionPlan) -> Option<&PlanDefinition> {
        self.plans.iter().find(|p| p.plan == plan)
    }

    /// Resolve a plan by name, failing with `UnknownPlan` for anything not in the catalog.
    pub fn plan_config(&self, name: &str) -> Result<&PlanDefinition, BillingError> {
        SubscriptionPlan::parse(name)
            .and_then(|plan| self.get(plan))
            .ok_or_else(|| BillingError::UnknownPlan(name.to_string()))
    }
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self::new(vec![
            PlanDefinition {
                plan: SubscriptionPlan::Starter,
                monthly_price_minor_units: 125_000,
                yearly_price_minor_units: 1_250_000,
                monthly_hours: 200,
                requires_custom_price: false,
            },
            PlanDefinition {
                plan: SubscriptionPlan::Growth,
                monthly_price_minor_units: 250_000,
                yearly_price_minor_units: 2_500_000,
                monthly_hours: 450,
                requires_custom_price: false,
            },
            PlanDefinition {
                plan: SubscriptionPlan::Enterprise,
                monthly_price_minor_units: 0,
                yearly_price_minor_units: 0,
                monthly_hours: 0,
                requires_custom_price: true,
            },
            PlanDefinition {
                plan: SubscriptionPlan::Custom,
                monthly_price_minor_units: 0,
                yearly_price_minor_units: 0,
                monthly_hours: 0,
                requires_custom_price: false,
            },
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(SubscriptionPlan::parse("STARTER"), Some(SubscriptionPlan::Starter));
        assert_eq!(SubscriptionPlan::parse("growth"), Some(SubscriptionPlan::Growth));
        assert_eq!(SubscriptionPlan::parse("platinum"), None);
    }

    #[test]
    fn yearly_interval_spans_twelve_months() {
        assert_eq!(BillingInterval::Yearly.months(), 12);
        assert_eq!(BillingInterval::from_string("unknown"), BillingInterval::Monthly);
    }

    #[test]
    fn plan_config_rejects_unknown_names() {
        let catalog = PlanCatalog::default();
        assert_eq!(catalog.plan_config("growth").unwrap().monthly_hours, 450);
        assert!(matches!(
            catalog.plan_config("platinum"),
            Err(BillingError::UnknownPlan(name)) if name == "platinum"
        ));
    }

    #[test]
    fn default_catalog_flags_enterprise_as_custom_priced() {
        let catalog = PlanCatalog::default();
        let enterprise = catalog.get(SubscriptionPlan::Enterprise).unwrap();
        assert!(enterprise.requires_custom_price);
        assert_eq!(enterprise.monthly_price_minor_units, 0);
        assert_eq!(enterprise.monthly_hours, 0);
    }
}
