//! Route-aware front for a set of admission controllers.
//!
//! Each route rule gets its own [`AdmissionController`], so the order endpoint,
//! general browsing and the stress endpoint are throttled independently and
//! never share a lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::clock::{Clock, MonotonicClock};
use super::controller::{AdmissionController, ControllerOptions, Decision};
use super::purge::PurgeTask;
use super::rules::RouteRules;
use crate::error::Result;

/// Outcome of checking a route through the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayDecision {
    /// No rule covers the route
    Unthrottled,
    /// The route is covered by `policy`
    Checked {
        /// Name of the matching rule
        policy: String,
        /// The controller's decision
        decision: Decision,
    },
}

impl GatewayDecision {
    /// Whether the request may proceed.
    pub fn is_admitted(&self) -> bool {
        match self {
            GatewayDecision::Unthrottled => true,
            GatewayDecision::Checked { decision, .. } => decision.is_admitted(),
        }
    }
}

/// Routes requests to the controller of the matching rule.
pub struct AdmissionGateway {
    rules: RouteRules,
    controllers: HashMap<String, Arc<AdmissionController>>,
}

impl AdmissionGateway {
    /// Build one controller per rule with a monotonic clock.
    pub fn new(rules: RouteRules, options: ControllerOptions) -> Result<Self> {
        Self::with_clock(rules, options, MonotonicClock::default())
    }

    /// Build one controller per rule, all reading `clock`.
    pub fn with_clock(
        rules: RouteRules,
        options: ControllerOptions,
        clock: impl Clock + 'static,
    ) -> Result<Self> {
        rules.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(clock);

        let mut controllers = HashMap::with_capacity(rules.rules.len());
        for rule in &rules.rules {
            let policy = rule.policy()?;
            let options = ControllerOptions {
                clock: clock.clone(),
                ..options.clone()
            };
            let controller = AdmissionController::new(policy, options)?.with_name(rule.name.as_str());

            info!(
                policy = %rule.name,
                limit = %policy,
                routes = ?rule.routes,
                "Admission controller initialized"
            );
            controllers.insert(rule.name.clone(), Arc::new(controller));
        }

        Ok(Self { rules, controllers })
    }

    /// Check a request for `route` from `key`.
    pub fn admit(&self, route: &str, key: &str) -> GatewayDecision {
        let Some(controller) = self.controller_for(route) else {
            debug!(route = %route, "Route is not throttled");
            return GatewayDecision::Unthrottled;
        };

        GatewayDecision::Checked {
            policy: controller.name().to_string(),
            decision: controller.admit(key),
        }
    }

    /// The controller protecting `route`, if any.
    pub fn controller_for(&self, route: &str) -> Option<&Arc<AdmissionController>> {
        let rule = self.rules.find_rule(route)?;
        self.controllers.get(&rule.name)
    }

    /// Get a controller by rule name.
    pub fn controller(&self, name: &str) -> Option<&Arc<AdmissionController>> {
        self.controllers.get(name)
    }

    /// The rules this gateway enforces.
    pub fn rules(&self) -> &RouteRules {
        &self.rules
    }

    /// Purge every controller. Returns the total number of forgotten clients.
    pub fn purge(&self) -> usize {
        self.controllers.values().map(|c| c.purge()).sum()
    }

    /// Start one periodic purge task per controller.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn_purge_tasks(&self, interval: Duration) -> Vec<PurgeTask> {
        self.controllers
            .values()
            .map(|controller| controller.spawn_purge_task(interval))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::controller::Code;
    use crate::ratelimit::policy::TimeUnit;
    use crate::ratelimit::rules::PolicyRule;

    fn create_gateway(clock: &ManualClock) -> AdmissionGateway {
        let options = ControllerOptions::default().with_purge_probability(0.0);
        AdmissionGateway::with_clock(RouteRules::default(), options, clock.clone()).unwrap()
    }

    #[test]
    fn test_gateway_builds_controller_per_rule() {
        let gateway = create_gateway(&ManualClock::new(0));

        for name in ["general", "orders", "stress"] {
            let controller = gateway.controller(name).unwrap();
            assert_eq!(controller.name(), name);
        }
        assert!(gateway.controller("missing").is_none());
    }

    #[test]
    fn test_gateway_unthrottled_route() {
        let gateway = create_gateway(&ManualClock::new(0));

        let decision = gateway.admit("/health", "10.0.0.1");
        assert_eq!(decision, GatewayDecision::Unthrottled);
        assert!(decision.is_admitted());
    }

    #[test]
    fn test_gateway_order_limit() {
        let clock = ManualClock::new(0);
        let gateway = create_gateway(&clock);

        for _ in 0..10 {
            assert!(gateway.admit("/orders/place", "10.0.0.1").is_admitted());
        }

        match gateway.admit("/orders/place", "10.0.0.1") {
            GatewayDecision::Checked { policy, decision } => {
                assert_eq!(policy, "orders");
                assert_eq!(decision.code, Code::OverLimit);
                assert_eq!(decision.retry_after, Duration::from_secs(15 * 60));
            }
            other => panic!("unexpected decision: {:?}", other),
        }

        // Browsing is tracked separately
        assert!(gateway.admit("/products", "10.0.0.1").is_admitted());

        clock.advance(Duration::from_secs(15 * 60));
        assert!(gateway.admit("/orders", "10.0.0.1").is_admitted());
    }

    #[test]
    fn test_gateway_shares_controller_across_routes() {
        let rules = RouteRules {
            rules: vec![PolicyRule::new(
                "browse",
                2,
                1,
                TimeUnit::Minute,
                &["/products", "/cart"],
            )],
        };
        let options = ControllerOptions::default().with_purge_probability(0.0);
        let gateway = AdmissionGateway::with_clock(rules, options, ManualClock::new(0)).unwrap();

        assert!(gateway.admit("/products", "client").is_admitted());
        assert!(gateway.admit("/cart", "client").is_admitted());
        assert!(!gateway.admit("/products/1", "client").is_admitted());
    }

    #[test]
    fn test_gateway_purge() {
        let clock = ManualClock::new(0);
        let gateway = create_gateway(&clock);

        gateway.admit("/stress", "a");
        gateway.admit("/orders", "b");
        clock.advance(Duration::from_secs(61));

        assert_eq!(gateway.purge(), 1);
        assert_eq!(gateway.controller("stress").unwrap().tracked_clients(), 0);
        assert_eq!(gateway.controller("orders").unwrap().tracked_clients(), 1);
    }
}
