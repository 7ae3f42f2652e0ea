//! Pluggable usage and rollover rules for the hours ledger.

use crate::models::{percentage_of, HoursBalance};
use rust_decimal::{Decimal, RoundingStrategy};

/// What happens when recorded usage approaches or passes the allowance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsagePolicy {
    /// Usage is always recorded; crossing the threshold raises a low-balance warning.
    SoftLimit { warning_threshold_percent: Decimal },
    /// Usage that would exceed the hours remaining is rejected.
    HardCap,
}

impl Default for UsagePolicy {
    fn default() -> Self {
        UsagePolicy::SoftLimit {
            warning_threshold_percent: Decimal::from(80),
        }
    }
}

/// Outcome of checking a usage increment against the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageDecision {
    Accept,
    AcceptWithWarning { usage_percentage: Decimal },
    Reject { remaining: Decimal },
}

impl UsagePolicy {
    pub fn parse(name: &str, warning_threshold_percent: Decimal) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "soft" | "soft_limit" => Some(UsagePolicy::SoftLimit {
                warning_threshold_percent,
            }),
            "hard" | "hard_cap" => Some(UsagePolicy::HardCap),
            _ => None,
        }
    }

    /// Whether usage writes must fit in the minutes remaining.
    pub fn caps_usage(&self) -> bool {
        matches!(self, UsagePolicy::HardCap)
    }

    /// Decide whether `additional_minutes` may be added to `balance`.
    pub fn evaluate(&self, balance: &HoursBalance, additional_minutes: i64) -> UsageDecision {
        match self {
            UsagePolicy::HardCap => {
                if Decimal::from(additional_minutes) > balance.minutes_remaining() {
                    UsageDecision::Reject {
                        remaining: balance.hours_remaining(),
                    }
                } else {
                    UsageDecision::Accept
                }
            }
            UsagePolicy::SoftLimit {
                warning_threshold_percent,
            } => {
                let available = balance.available_minutes();
                if available.is_zero() {
                    return UsageDecision::Accept;
                }
                let used = balance.minutes_used;
                let before = percentage_of(Decimal::from(used), available);
                let after = percentage_of(Decimal::from(used + additional_minutes), available);
                if before < *warning_threshold_percent && after >= *warning_threshold_percent {
                    UsageDecision::AcceptWithWarning {
                        usage_percentage: after.round_dp(1),
                    }
                } else {
                    UsageDecision::Accept
                }
            }
        }
    }
}

/// How unused hours move into the next period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RolloverPolicy {
    /// Unused hours expire with the period.
    #[default]
    ForfeitUnused,
    /// Unused hours are carried into `rollover_hours`, optionally capped.
    CarryForwardUnused { cap_hours: Option<Decimal> },
}

impl RolloverPolicy {
    pub fn parse(name: &str, cap_hours: Option<Decimal>) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "forfeit" | "forfeit_unused" => Some(RolloverPolicy::ForfeitUnused),
            "carry_forward" | "carry_forward_unused" => {
                Some(RolloverPolicy::CarryForwardUnused { cap_hours })
            }
            _ => None,
        }
    }

    /// Hours to seed the next period's `rollover_hours` with.
    ///
    /// Unused minutes are truncated to hundredths of an hour so a carry never exceeds what
    /// was actually left.
    pub fn rollover_hours(&self, previous: &HoursBalance) -> Decimal {
        match self {
            RolloverPolicy::ForfeitUnused => Decimal::ZERO,
            RolloverPolicy::CarryForwardUnused { cap_hours } => {
                let unused = (previous.minutes_remaining().max(Decimal::ZERO)
                    / Decimal::from(60))
                .round_dp_with_strategy(2, RoundingStrategy::ToZero);
                match cap_hours {
                    Some(cap) => unused.min(*cap),
                    None => unused,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn balance(allocated: i32, used_hours: i64) -> HoursBalance {
        let now = Utc::now();
        HoursBalance {
            balance_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            subscription_id: None,
            period_start: now,
            period_end: now,
            allocated_hours: allocated,
            bonus_hours: 0,
            extra_purchased_hours: 0,
            rollover_hours: Decimal::ZERO,
            minutes_used: used_hours * 60,
            created_utc: now,
            updated_utc: now,
        }
    }

    #[test]
    fn soft_limit_warns_once_when_threshold_is_crossed() {
        let policy = UsagePolicy::default();
        let b = balance(100, 75);
        assert_eq!(
            policy.evaluate(&b, 600),
            UsageDecision::AcceptWithWarning {
                usage_percentage: Decimal::from(85)
            }
        );
        let already_over = balance(100, 90);
        assert_eq!(policy.evaluate(&already_over, 300), UsageDecision::Accept);
    }

    #[test]
    fn hard_cap_rejects_over_allowance() {
        let b = balance(10, 8);
        assert_eq!(
            UsagePolicy::HardCap.evaluate(&b, 121),
            UsageDecision::Reject {
                remaining: Decimal::from(2)
            }
        );
        assert_eq!(UsagePolicy::HardCap.evaluate(&b, 120), UsageDecision::Accept);
    }

    #[test]
    fn forfeit_discards_unused_hours() {
        assert_eq!(RolloverPolicy::ForfeitUnused.rollover_hours(&balance(200, 50)), Decimal::ZERO);
    }

    #[test]
    fn carry_forward_respects_cap_and_never_goes_negative() {
        let capped = RolloverPolicy::CarryForwardUnused {
            cap_hours: Some(Decimal::from(40)),
        };
        assert_eq!(capped.rollover_hours(&balance(200, 50)), Decimal::from(40));
        assert_eq!(capped.rollover_hours(&balance(10, 20)), Decimal::ZERO);
    }

    #[test]
    fn carried_minutes_are_truncated_not_rounded_up() {
        let carry = RolloverPolicy::CarryForwardUnused { cap_hours: None };
        let mut b = balance(1, 0);
        b.minutes_used = 59;
        assert_eq!(carry.rollover_hours(&b), "0.01".parse::<Decimal>().unwrap());
    }
}
