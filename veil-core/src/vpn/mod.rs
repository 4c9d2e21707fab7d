//! VPN connection module
//!
//! Endpoint selection, entitlement gating, tunnel session adaptation and the
//! orchestration state machine that ties them together.

pub mod entitlement;
pub mod orchestrator;
pub mod selector;
pub mod state;
pub mod tunnel;

// Tunnel primitives and presentation
pub mod command_tunnel;
pub mod output_parser;
pub mod render;
pub mod simulated;

// Public re-exports
pub use entitlement::{Decision, EntitlementChecker, EntitlementSource};
pub use orchestrator::{Orchestrator, OrchestratorHandle};
pub use selector::{EndpointDirectory, EndpointSelector, StaticDirectory};
pub use state::{ConnectionState, RetryReason, StateChange};
pub use tunnel::{StatusSink, TunnelFactory, TunnelPrimitive, TunnelStatus};
