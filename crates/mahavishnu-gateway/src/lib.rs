//! The subscription gateway: a single WebSocket endpoint that fronts the
//! dependency manager, pool registry, dead-letter queue, and event bus
//! with the wire protocol described in the control plane's external
//! interfaces section.

pub mod protocol;
pub mod server;
pub mod session;

pub use server::{GatewayState, build_router, run_gateway};
