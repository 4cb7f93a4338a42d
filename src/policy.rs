//! Spend Policies
//!
//! Pure evaluation of whether a proposed payment is allowed. A wallet holds
//! an ordered list of policies; all must approve (logical AND), and the
//! first denial wins so diagnostics name the exact bound that was violated.
//! Evaluation never mutates anything; counters advance only after a real
//! settlement, so denied attempts cannot starve the rate limit.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};

/// Closed set of policy kinds. Adding a variant forces every match in this
/// module to be revisited, so no policy kind can be silently skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Policy {
    /// Spending ceilings, in the smallest currency unit. Both bounds are
    /// inclusive: a payment landing exactly on the cap is allowed.
    Budget { daily_cap: u64, max_per_request: u64 },
    /// Endpoint allow-list. `"*"` matches everything, `"*.suffix"` matches
    /// the host suffix, anything else is an exact host match.
    VendorAcl { allowed_vendors: Vec<String> },
    /// Sliding-window settlement rate ceilings.
    RateLimit { max_per_minute: u32, max_per_hour: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DenialReason {
    #[error("amount {amount} exceeds per-request cap {max_per_request}")]
    PerRequestCap { amount: u64, max_per_request: u64 },

    #[error("amount {amount} would push today's spend {spent_today} past daily cap {daily_cap}")]
    DailyCap {
        amount: u64,
        spent_today: u64,
        daily_cap: u64,
    },

    #[error("vendor {vendor:?} matches no allowed pattern")]
    VendorNotAllowed { vendor: String },

    #[error("rate limit reached: {count} settlements in the last minute (max {max_per_minute})")]
    PerMinuteRate { count: u32, max_per_minute: u32 },

    #[error("rate limit reached: {count} settlements in the last hour (max {max_per_hour})")]
    PerHourRate { count: u32, max_per_hour: u32 },
}

/// Per-wallet spend accumulator. Read by policy evaluation, advanced only
/// by the orchestrator after a successful settlement.
#[derive(Debug, Clone)]
pub struct SpendState {
    day: NaiveDate,
    spent_today: u64,
    /// Timestamps of successful settlements within the last hour,
    /// oldest first. Pruned lazily on read and write.
    settlements: VecDeque<DateTime<Utc>>,
}

impl SpendState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            day: now.date_naive(),
            spent_today: 0,
            settlements: VecDeque::new(),
        }
    }

    /// Amount spent during the current UTC calendar day. A day rollover
    /// observed here resets the counter to zero.
    pub fn spent_today(&self, now: DateTime<Utc>) -> u64 {
        if now.date_naive() == self.day {
            self.spent_today
        } else {
            0
        }
    }

    /// Settlements within the trailing window ending at `now`.
    pub fn settlements_within(&self, window: Duration, now: DateTime<Utc>) -> u32 {
        let cutoff = now - window;
        self.settlements.iter().filter(|t| **t > cutoff).count() as u32
    }

    /// Record a successful settlement. Called by the orchestrator only,
    /// atomically with the ledger append.
    pub fn record_settlement(&mut self, amount: u64, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today != self.day {
            self.day = today;
            self.spent_today = 0;
        }
        self.spent_today = self.spent_today.saturating_add(amount);
        self.settlements.push_back(now);
        let cutoff = now - Duration::hours(1);
        while matches!(self.settlements.front(), Some(t) if *t <= cutoff) {
            self.settlements.pop_front();
        }
    }
}

/// Evaluate an ordered policy list against a proposed payment.
///
/// Deterministic and side-effect-free; returns the first denial in
/// policy-list order, or `Ok(())` when every policy approves.
pub fn evaluate(
    policies: &[Policy],
    amount: u64,
    endpoint: &Url,
    state: &SpendState,
    now: DateTime<Utc>,
) -> Result<(), DenialReason> {
    for policy in policies {
        match policy {
            Policy::Budget {
                daily_cap,
                max_per_request,
            } => {
                if amount > *max_per_request {
                    return Err(DenialReason::PerRequestCap {
                        amount,
                        max_per_request: *max_per_request,
                    });
                }
                let spent_today = state.spent_today(now);
                if spent_today.saturating_add(amount) > *daily_cap {
                    return Err(DenialReason::DailyCap {
                        amount,
                        spent_today,
                        daily_cap: *daily_cap,
                    });
                }
            }
            Policy::VendorAcl { allowed_vendors } => {
                let vendor = endpoint.host_str().unwrap_or("").to_ascii_lowercase();
                let allowed = allowed_vendors
                    .iter()
                    .any(|pattern| vendor_matches(pattern, &vendor));
                if !allowed {
                    return Err(DenialReason::VendorNotAllowed { vendor });
                }
            }
            Policy::RateLimit {
                max_per_minute,
                max_per_hour,
            } => {
                let last_minute = state.settlements_within(Duration::minutes(1), now);
                if last_minute + 1 > *max_per_minute {
                    return Err(DenialReason::PerMinuteRate {
                        count: last_minute,
                        max_per_minute: *max_per_minute,
                    });
                }
                let last_hour = state.settlements_within(Duration::hours(1), now);
                if last_hour + 1 > *max_per_hour {
                    return Err(DenialReason::PerHourRate {
                        count: last_hour,
                        max_per_hour: *max_per_hour,
                    });
                }
            }
        }
    }
    Ok(())
}

fn vendor_matches(pattern: &str, vendor: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    if pattern == "*" {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return vendor == suffix || vendor.ends_with(&format!(".{}", suffix));
    }
    vendor == pattern
}

/// Policy descriptor as accepted on the configuration surface. A kind not
/// listed here fails deserialization, so unrecognized policies are a
/// configuration error rather than silently ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum PolicyDescriptor {
    Budget {
        #[serde(rename = "dailyCap")]
        daily_cap: u64,
        #[serde(rename = "maxPerRequest")]
        max_per_request: u64,
    },
    VendorAcl {
        #[serde(rename = "allowedVendors")]
        allowed_vendors: Vec<String>,
    },
    RateLimit {
        #[serde(rename = "maxPerMinute")]
        max_per_minute: u32,
        #[serde(rename = "maxPerHour")]
        max_per_hour: u32,
    },
}

impl PolicyDescriptor {
    /// Validate the descriptor and produce the runtime policy.
    pub fn build(&self) -> Result<Policy, String> {
        match self {
            PolicyDescriptor::Budget {
                daily_cap,
                max_per_request,
            } => {
                if *daily_cap == 0 || *max_per_request == 0 {
                    return Err("budget policy caps must be nonzero".to_string());
                }
                if max_per_request > daily_cap {
                    return Err("budget maxPerRequest exceeds dailyCap".to_string());
                }
                Ok(Policy::Budget {
                    daily_cap: *daily_cap,
                    max_per_request: *max_per_request,
                })
            }
            PolicyDescriptor::VendorAcl { allowed_vendors } => {
                if allowed_vendors.is_empty() {
                    return Err("vendor_acl policy needs at least one pattern".to_string());
                }
                Ok(Policy::VendorAcl {
                    allowed_vendors: allowed_vendors.clone(),
                })
            }
            PolicyDescriptor::RateLimit {
                max_per_minute,
                max_per_hour,
            } => {
                if *max_per_minute == 0 || *max_per_hour == 0 {
                    return Err("rate_limit policy ceilings must be nonzero".to_string());
                }
                Ok(Policy::RateLimit {
                    max_per_minute: *max_per_minute,
                    max_per_hour: *max_per_hour,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn budget(daily_cap: u64, max_per_request: u64) -> Vec<Policy> {
        vec![Policy::Budget {
            daily_cap,
            max_per_request,
        }]
    }

    #[test]
    fn test_budget_allows_up_to_caps_inclusive() {
        let state = SpendState::new(at(0));
        let endpoint = url("https://api.example.com/weather");

        // Exactly the per-request cap is allowed.
        assert!(evaluate(&budget(1_000_000, 50_000), 50_000, &endpoint, &state, at(0)).is_ok());
        // One over is denied.
        let err = evaluate(&budget(1_000_000, 50_000), 50_001, &endpoint, &state, at(0));
        assert!(matches!(err, Err(DenialReason::PerRequestCap { .. })));
    }

    #[test]
    fn test_budget_daily_cap_is_inclusive_ceiling() {
        let mut state = SpendState::new(at(0));
        state.record_settlement(990_000, at(0));
        let endpoint = url("https://api.example.com/weather");

        // Landing exactly on the cap is allowed.
        assert!(evaluate(&budget(1_000_000, 50_000), 10_000, &endpoint, &state, at(1)).is_ok());
        // Going past it is denied with the live numbers in the reason.
        match evaluate(&budget(1_000_000, 50_000), 10_001, &endpoint, &state, at(1)) {
            Err(DenialReason::DailyCap {
                spent_today,
                daily_cap,
                ..
            }) => {
                assert_eq!(spent_today, 990_000);
                assert_eq!(daily_cap, 1_000_000);
            }
            other => panic!("expected daily cap denial, got {:?}", other),
        }
    }

    #[test]
    fn test_budget_resets_on_utc_day_rollover() {
        let mut state = SpendState::new(at(0));
        state.record_settlement(1_000_000, at(0));
        let endpoint = url("https://api.example.com/weather");

        // Same day: capped out.
        assert!(evaluate(&budget(1_000_000, 50_000), 1, &endpoint, &state, at(60)).is_err());
        // Next UTC day: counter reads as zero.
        let next_day = at(86_400);
        assert_eq!(state.spent_today(next_day), 0);
        assert!(evaluate(&budget(1_000_000, 50_000), 50_000, &endpoint, &state, next_day).is_ok());
    }

    #[test]
    fn test_vendor_acl_wildcard_and_exact() {
        let state = SpendState::new(at(0));
        let wildcard = vec![Policy::VendorAcl {
            allowed_vendors: vec!["*".to_string()],
        }];
        assert!(evaluate(&wildcard, 1, &url("https://anything.example"), &state, at(0)).is_ok());

        let exact = vec![Policy::VendorAcl {
            allowed_vendors: vec!["api.example.com".to_string()],
        }];
        assert!(evaluate(&exact, 1, &url("https://api.example.com/x"), &state, at(0)).is_ok());
        let err = evaluate(&exact, 1, &url("https://evil.example.com/x"), &state, at(0));
        assert!(matches!(err, Err(DenialReason::VendorNotAllowed { .. })));
    }

    #[test]
    fn test_vendor_acl_suffix_pattern() {
        let state = SpendState::new(at(0));
        let acl = vec![Policy::VendorAcl {
            allowed_vendors: vec!["*.example.com".to_string()],
        }];
        assert!(evaluate(&acl, 1, &url("https://api.example.com/x"), &state, at(0)).is_ok());
        assert!(evaluate(&acl, 1, &url("https://example.com/x"), &state, at(0)).is_ok());
        assert!(evaluate(&acl, 1, &url("https://notexample.com/x"), &state, at(0)).is_err());
    }

    #[test]
    fn test_rate_limit_sliding_window() {
        let mut state = SpendState::new(at(0));
        let policies = vec![Policy::RateLimit {
            max_per_minute: 3,
            max_per_hour: 100,
        }];
        let endpoint = url("https://api.example.com/x");

        for i in 0..3 {
            assert!(evaluate(&policies, 1, &endpoint, &state, at(i)).is_ok());
            state.record_settlement(1, at(i));
        }
        // Fourth inside the same minute is denied.
        let err = evaluate(&policies, 1, &endpoint, &state, at(3));
        assert!(matches!(err, Err(DenialReason::PerMinuteRate { count: 3, .. })));
        // The window slides: 61s after the first settlement there is room.
        assert!(evaluate(&policies, 1, &endpoint, &state, at(61)).is_ok());
    }

    #[test]
    fn test_rate_limit_hourly_ceiling() {
        let mut state = SpendState::new(at(0));
        let policies = vec![Policy::RateLimit {
            max_per_minute: 10,
            max_per_hour: 5,
        }];
        let endpoint = url("https://api.example.com/x");

        // Spread settlements out so the minute window never trips.
        for i in 0..5 {
            let t = at(i * 120);
            assert!(evaluate(&policies, 1, &endpoint, &state, t).is_ok());
            state.record_settlement(1, t);
        }
        let err = evaluate(&policies, 1, &endpoint, &state, at(5 * 120));
        assert!(matches!(err, Err(DenialReason::PerHourRate { count: 5, .. })));
    }

    #[test]
    fn test_denial_does_not_advance_counters() {
        let mut state = SpendState::new(at(0));
        let policies = vec![Policy::RateLimit {
            max_per_minute: 1,
            max_per_hour: 10,
        }];
        let endpoint = url("https://api.example.com/x");

        state.record_settlement(1, at(0));
        // Repeated denied evaluations leave the state untouched.
        for _ in 0..5 {
            assert!(evaluate(&policies, 1, &endpoint, &state, at(1)).is_err());
        }
        assert_eq!(state.settlements_within(Duration::minutes(1), at(1)), 1);
    }

    #[test]
    fn test_first_denial_wins_in_list_order() {
        let state = SpendState::new(at(0));
        let policies = vec![
            Policy::VendorAcl {
                allowed_vendors: vec!["other.example".to_string()],
            },
            Policy::Budget {
                daily_cap: 1,
                max_per_request: 1,
            },
        ];
        // Both would deny; the ACL comes first in the list.
        let err = evaluate(&policies, 100, &url("https://api.example.com"), &state, at(0));
        assert!(matches!(err, Err(DenialReason::VendorNotAllowed { .. })));
    }

    #[test]
    fn test_descriptor_validation() {
        let bad: Result<PolicyDescriptor, _> =
            serde_json::from_str(r#"{"type":"allowance","limit":5}"#);
        assert!(bad.is_err());

        let desc: PolicyDescriptor =
            serde_json::from_str(r#"{"type":"budget","dailyCap":1000000,"maxPerRequest":50000}"#)
                .unwrap();
        assert_eq!(
            desc.build().unwrap(),
            Policy::Budget {
                daily_cap: 1_000_000,
                max_per_request: 50_000
            }
        );

        let inverted = PolicyDescriptor::Budget {
            daily_cap: 10,
            max_per_request: 20,
        };
        assert!(inverted.build().is_err());

        let empty_acl = PolicyDescriptor::VendorAcl {
            allowed_vendors: vec![],
        };
        assert!(empty_acl.build().is_err());
    }
}
