//! Route rules configuration and matching.
//!
//! A rule names a policy and the route prefixes it protects. Each inbound route
//! is matched against every prefix; the longest matching prefix wins, and routes
//! no rule covers are not throttled.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

use super::policy::{Policy, TimeUnit};
use crate::error::{Result, TurnstileError};

/// A complete set of route rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRules {
    /// Rules, each backed by its own controller
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

/// A named policy and the routes it applies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Unique rule name, e.g. `orders`
    pub name: String,
    /// Admissions allowed per window
    pub max_requests: u32,
    /// Window unit
    pub unit: TimeUnit,
    /// Window length in `unit`s
    #[serde(default = "default_units")]
    pub units: u32,
    /// Route prefixes protected by this rule
    #[serde(default)]
    pub routes: Vec<String>,
}

fn default_units() -> u32 {
    1
}

impl PolicyRule {
    /// Create a rule.
    pub fn new(name: &str, max_requests: u32, units: u32, unit: TimeUnit, routes: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            max_requests,
            unit,
            units,
            routes: routes.iter().map(|r| r.to_string()).collect(),
        }
    }

    /// The validated policy this rule describes.
    pub fn policy(&self) -> Result<Policy> {
        Policy::per(self.max_requests, self.units, self.unit).map_err(|e| {
            TurnstileError::Config(format!("rule '{}': {}", self.name, e))
        })
    }

    /// Length of the longest of this rule's prefixes matching `route`.
    fn match_len(&self, route: &str) -> Option<usize> {
        self.routes
            .iter()
            .filter(|prefix| prefix_matches(prefix, route))
            .map(|prefix| prefix.len())
            .max()
    }
}

/// `prefix` matches `route` on a path segment boundary: `/orders` matches
/// `/orders` and `/orders/place` but not `/ordersx`.
fn prefix_matches(prefix: &str, route: &str) -> bool {
    let Some(rest) = route.strip_prefix(prefix) else {
        return false;
    };
    rest.is_empty()
        || prefix.ends_with('/')
        || rest.starts_with('/')
        || rest.starts_with('?')
}

impl Default for RouteRules {
    /// The storefront's stock policies: general browsing traffic, order placement
    /// and the CPU stress endpoint.
    fn default() -> Self {
        Self {
            rules: vec![
                PolicyRule::new(
                    "general",
                    100,
                    15,
                    TimeUnit::Minute,
                    &["/products", "/shop", "/cart", "/api/ai"],
                ),
                PolicyRule::new("orders", 10, 15, TimeUnit::Minute, &["/orders"]),
                PolicyRule::new("stress", 200, 1, TimeUnit::Minute, &["/stress"]),
            ],
        }
    }
}

impl RouteRules {
    /// Create an empty rule set.
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading route rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    ///
    /// Accepts either a `rules:` mapping or a bare list of rules.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules = match serde_yaml::from_str::<Vec<PolicyRule>>(yaml) {
            Ok(rules) => Self { rules },
            Err(_) => serde_yaml::from_str::<RouteRules>(yaml)?,
        };
        rules.validate()?;
        Ok(rules)
    }

    /// Check names are unique and every rule has a valid policy.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for rule in &self.rules {
            if rule.name.trim().is_empty() {
                return Err(TurnstileError::Config("rule name must not be empty".to_string()));
            }
            if !names.insert(rule.name.as_str()) {
                return Err(TurnstileError::Config(format!(
                    "duplicate rule name '{}'",
                    rule.name
                )));
            }
            if let Some(route) = rule.routes.iter().find(|r| !r.starts_with('/')) {
                return Err(TurnstileError::Config(format!(
                    "rule '{}': route '{}' must start with '/'",
                    rule.name, route
                )));
            }
            rule.policy()?;
        }
        Ok(())
    }

    /// Get a rule by name.
    pub fn get(&self, name: &str) -> Option<&PolicyRule> {
        self.rules.iter().find(|rule| rule.name == name)
    }

    /// Find the rule protecting `route`.
    ///
    /// The longest matching prefix wins; on a tie the rule listed first wins.
    pub fn find_rule(&self, route: &str) -> Option<&PolicyRule> {
        let mut best: Option<(&PolicyRule, usize)> = None;
        for rule in &self.rules {
            if let Some(len) = rule.match_len(route) {
                if best.map_or(true, |(_, best_len)| len > best_len) {
                    best = Some((rule, len));
                }
            }
        }
        best.map(|(rule, _)| rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_parse_simple_rules() {
        let yaml = r#"
rules:
  - name: api
    max_requests: 200
    unit: minute
    routes: ["/api"]
"#;
        let rules = RouteRules::from_yaml(yaml).unwrap();
        assert_eq!(rules.rules.len(), 1);

        let rule = rules.get("api").unwrap();
        assert_eq!(rule.units, 1);
        let policy = rule.policy().unwrap();
        assert_eq!(policy.max_requests(), 200);
        assert_eq!(policy.window(), Duration::from_secs(60));
    }

    #[test]
    fn test_parse_bare_list() {
        let yaml = r#"
- name: orders
  max_requests: 10
  unit: minute
  units: 15
  routes:
    - /orders
"#;
        let rules = RouteRules::from_yaml(yaml).unwrap();
        let policy = rules.get("orders").unwrap().policy().unwrap();
        assert_eq!(policy.window(), Duration::from_secs(900));
    }

    #[test]
    fn test_reject_invalid_rules() {
        let zero_limit = r#"
- name: broken
  max_requests: 0
  unit: second
"#;
        assert!(matches!(
            RouteRules::from_yaml(zero_limit),
            Err(TurnstileError::Config(_))
        ));

        let duplicate = r#"
- name: twice
  max_requests: 1
  unit: second
- name: twice
  max_requests: 2
  unit: second
"#;
        assert!(RouteRules::from_yaml(duplicate).is_err());

        let relative_route = r#"
- name: relative
  max_requests: 1
  unit: second
  routes: ["orders"]
"#;
        assert!(RouteRules::from_yaml(relative_route).is_err());

        assert!(matches!(
            RouteRules::from_yaml("rules: 12"),
            Err(TurnstileError::Yaml(_))
        ));
    }

    #[test]
    fn test_default_rules() {
        let rules = RouteRules::default();
        rules.validate().unwrap();

        assert_eq!(rules.find_rule("/products/3").unwrap().name, "general");
        assert_eq!(rules.find_rule("/shop").unwrap().name, "general");
        assert_eq!(rules.find_rule("/api/ai/chat").unwrap().name, "general");
        assert_eq!(rules.find_rule("/orders/place").unwrap().name, "orders");
        assert_eq!(rules.find_rule("/stress").unwrap().name, "stress");
        assert!(rules.find_rule("/health").is_none());

        let orders = rules.get("orders").unwrap().policy().unwrap();
        assert_eq!(orders.max_requests(), 10);
        assert_eq!(orders.window(), Duration::from_secs(15 * 60));

        let stress = rules.get("stress").unwrap().policy().unwrap();
        assert_eq!(stress.max_requests(), 200);
        assert_eq!(stress.window(), Duration::from_secs(60));
    }

    #[test]
    fn test_find_rule_longest_prefix_wins() {
        let mut rules = RouteRules::new();
        rules
            .rules
            .push(PolicyRule::new("api", 100, 1, TimeUnit::Minute, &["/api"]));
        rules
            .rules
            .push(PolicyRule::new("ai", 5, 1, TimeUnit::Minute, &["/api/ai"]));

        assert_eq!(rules.find_rule("/api/products").unwrap().name, "api");
        assert_eq!(rules.find_rule("/api/ai").unwrap().name, "ai");
        assert_eq!(rules.find_rule("/api/ai/ask").unwrap().name, "ai");
    }

    #[test]
    fn test_find_rule_segment_boundary() {
        let rules = RouteRules::default();

        assert!(rules.find_rule("/ordersx").is_none());
        assert!(rules.find_rule("/cartography").is_none());
        assert_eq!(rules.find_rule("/cart?item=4").unwrap().name, "general");
    }

    #[test]
    fn test_prefix_with_trailing_slash() {
        assert!(prefix_matches("/", "/anything"));
        assert!(prefix_matches("/static/", "/static/app.js"));
        assert!(!prefix_matches("/static/", "/static"));
    }
}
