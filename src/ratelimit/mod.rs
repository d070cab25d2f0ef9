//! Admission control logic and state management.

pub mod clock;
mod controller;
mod gateway;
mod key;
mod policy;
mod purge;
mod registry;
mod rules;
mod window;

pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use controller::{
    AdmissionController, Code, ControllerOptions, ControllerStats, Decision,
    DEFAULT_MAX_TRACKED_CLIENTS, DEFAULT_PURGE_PROBABILITY,
};
pub use gateway::{AdmissionGateway, GatewayDecision};
pub use key::{ClientKey, InvalidKey, MAX_KEY_LEN};
pub use policy::{Policy, TimeUnit};
pub use purge::PurgeTask;
pub use rules::{PolicyRule, RouteRules};
