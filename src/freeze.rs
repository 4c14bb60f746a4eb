//! Freeze Registry (§4.10): in-memory scoped freeze rules consulted by
//! the pre-trade gate. `apply()` here intentionally differs from the
//! distilled original's return-value quirk — see DESIGN.md's open-question
//! decisions for why `applied` tracks real state changes instead.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezeScope {
    Global,
    Venue,
    Symbol,
    Strategy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FreezeRule {
    pub reason: String,
    pub scope: FreezeScope,
    pub ts: f64,
}

impl FreezeRule {
    pub fn new(reason: impl Into<String>, scope: FreezeScope) -> Self {
        Self {
            reason: reason.into(),
            scope,
            ts: now_s(),
        }
    }
}

fn now_s() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

fn normalise_reason(reason: &str) -> String {
    let trimmed = reason.trim();
    if trimmed.is_empty() {
        "UNKNOWN_FREEZE".to_string()
    } else {
        trimmed.to_string()
    }
}

fn extract_tag(reason: &str, key: &str) -> Option<String> {
    let prefix = format!("{key}=");
    for part in reason.split("::").skip(1) {
        let text = part.trim();
        if text.is_empty() || !text.contains('=') {
            continue;
        }
        if let Some(value) = text.strip_prefix(&prefix) {
            return Some(value.to_string());
        }
    }
    None
}

/// Process-wide registry of freeze rules keyed by `reason`. Scope matching
/// reads tags (`key=value`) embedded in `::`-delimited reason strings,
/// falling back to the reason's trailing segment when no tag is present.
pub struct FreezeRegistry {
    rules: Mutex<HashMap<String, FreezeRule>>,
}

impl Default for FreezeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FreezeRegistry {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(HashMap::new()),
        }
    }

    /// Upserts `rule`; returns `true` when a new rule was registered or an
    /// existing one advanced to a newer timestamp, `false` for a stale or
    /// duplicate re-application.
    pub fn apply(&self, rule: FreezeRule) -> bool {
        let normalised = FreezeRule {
            reason: normalise_reason(&rule.reason),
            scope: rule.scope,
            ts: rule.ts,
        };
        let mut rules = self.rules.lock();
        match rules.get(&normalised.reason) {
            Some(existing) if existing.scope == normalised.scope => {
                if existing.ts < normalised.ts {
                    rules.insert(normalised.reason.clone(), normalised);
                    true
                } else {
                    false
                }
            }
            _ => {
                rules.insert(normalised.reason.clone(), normalised);
                true
            }
        }
    }

    /// Removes rules whose reason starts with `prefix` (or all rules when
    /// `prefix` is `None`/empty). Returns the count cleared.
    pub fn clear(&self, prefix: Option<&str>) -> usize {
        let mut rules = self.rules.lock();
        match prefix {
            None => {
                let count = rules.len();
                rules.clear();
                count
            }
            Some(p) if p.is_empty() => {
                let count = rules.len();
                rules.clear();
                count
            }
            Some(p) => {
                let keys: Vec<String> = rules.keys().filter(|k| k.starts_with(p)).cloned().collect();
                for key in &keys {
                    rules.remove(key);
                }
                keys.len()
            }
        }
    }

    pub fn is_frozen(&self, strategy: Option<&str>, venue: Option<&str>, symbol: Option<&str>) -> bool {
        let rules = self.rules.lock();
        rules.values().any(|rule| Self::matches(rule, strategy, venue, symbol))
    }

    pub fn list_rules(&self) -> Vec<FreezeRule> {
        let rules = self.rules.lock();
        let mut out: Vec<FreezeRule> = rules.values().cloned().collect();
        out.sort_by(|a, b| b.ts.partial_cmp(&a.ts).unwrap());
        out
    }

    fn matches(rule: &FreezeRule, strategy: Option<&str>, venue: Option<&str>, symbol: Option<&str>) -> bool {
        match rule.scope {
            FreezeScope::Global => true,
            FreezeScope::Strategy => Self::match_strategy(&rule.reason, strategy),
            FreezeScope::Venue => Self::match_venue(&rule.reason, venue),
            FreezeScope::Symbol => Self::match_symbol(&rule.reason, venue, symbol),
        }
    }

    fn match_strategy(reason: &str, candidate: Option<&str>) -> bool {
        let Some(candidate) = candidate.filter(|c| !c.is_empty()) else {
            return false;
        };
        if let Some(expected) = extract_tag(reason, "strategy") {
            return candidate.trim().eq_ignore_ascii_case(expected.trim());
        }
        let suffix = reason.rsplit("::").next().unwrap_or(reason);
        suffix.trim().eq_ignore_ascii_case(candidate.trim())
    }

    fn match_venue(reason: &str, candidate: Option<&str>) -> bool {
        let Some(candidate) = candidate else { return false };
        let value = candidate.trim().to_lowercase();
        if value.is_empty() {
            return false;
        }
        if let Some(expected) = extract_tag(reason, "venue") {
            let expected = expected.to_lowercase();
            return value == expected || value.starts_with(&format!("{expected}-"));
        }
        let suffix = reason.rsplit("::").next().unwrap_or(reason).trim().to_lowercase();
        if suffix.is_empty() {
            return false;
        }
        value == suffix || value.starts_with(&format!("{suffix}-"))
    }

    fn match_symbol(reason: &str, venue: Option<&str>, symbol: Option<&str>) -> bool {
        let candidate_symbol = symbol.unwrap_or("").trim().to_uppercase();
        if candidate_symbol.is_empty() {
            return false;
        }
        let expected_symbol = extract_tag(reason, "symbol");
        let expected_venue = extract_tag(reason, "venue");

        if let Some(expected_symbol) = expected_symbol {
            if let (Some(expected_venue), Some(venue)) = (&expected_venue, venue) {
                let venue_value = venue.trim().to_lowercase();
                let expected_value = expected_venue.to_lowercase();
                if !(venue_value == expected_value || venue_value.starts_with(&format!("{expected_value}-"))) {
                    return false;
                }
            }
            return candidate_symbol == expected_symbol.to_uppercase();
        }

        let suffix = reason.rsplit("::").next().unwrap_or(reason);
        let suffix_symbol = if let Some((venue_part, symbol_part)) = suffix.split_once(':') {
            if !venue_part.trim().is_empty() {
                if let Some(venue) = venue {
                    let expected_venue = venue_part.trim().to_lowercase();
                    let venue_value = venue.trim().to_lowercase();
                    if !(venue_value == expected_venue || venue_value.starts_with(&format!("{expected_venue}-"))) {
                        return false;
                    }
                }
            }
            symbol_part
        } else {
            suffix
        };
        candidate_symbol == suffix_symbol.trim().to_uppercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_is_true_for_new_rule_false_for_stale_reapply() {
        let registry = FreezeRegistry::new();
        let rule = FreezeRule { reason: "RISK_GOVERNOR".into(), scope: FreezeScope::Global, ts: 100.0 };
        assert!(registry.apply(rule.clone()));
        let stale = FreezeRule { ts: 50.0, ..rule };
        assert!(!registry.apply(stale));
    }

    #[test]
    fn test_apply_returns_true_when_ts_advances() {
        let registry = FreezeRegistry::new();
        registry.apply(FreezeRule { reason: "X".into(), scope: FreezeScope::Global, ts: 1.0 });
        assert!(registry.apply(FreezeRule { reason: "X".into(), scope: FreezeScope::Global, ts: 2.0 }));
    }

    #[test]
    fn test_venue_scope_matches_prefix() {
        let registry = FreezeRegistry::new();
        registry.apply(FreezeRule::new("watchdog::venue=binance", FreezeScope::Venue));
        assert!(registry.is_frozen(None, Some("binance-futures"), None));
        assert!(!registry.is_frozen(None, Some("okx"), None));
    }

    #[test]
    fn test_symbol_scope_with_venue_tag() {
        let registry = FreezeRegistry::new();
        registry.apply(FreezeRule::new("manual::venue=okx::symbol=BTCUSDT", FreezeScope::Symbol));
        assert!(registry.is_frozen(None, Some("okx"), Some("btcusdt")));
        assert!(!registry.is_frozen(None, Some("binance"), Some("btcusdt")));
    }

    #[test]
    fn test_clear_by_prefix() {
        let registry = FreezeRegistry::new();
        registry.apply(FreezeRule::new("manual::venue=okx", FreezeScope::Venue));
        registry.apply(FreezeRule::new("watchdog::venue=binance", FreezeScope::Venue));
        assert_eq!(registry.clear(Some("manual")), 1);
        assert!(registry.is_frozen(None, Some("binance"), None));
    }
}
