pub mod auth;
pub mod client;
pub mod compat;
pub mod diagnostics;
pub mod event_bridge;
pub mod handlers;
pub mod ledger;
pub mod orchestrator;
pub mod protocol;
pub mod server;

#[cfg(test)]
mod testing;

pub use orchestrator::{Accepted, EngineOrchestrator, TurnOrchestrator};
pub use server::{start, GatewayServices, ServerConfig, ServerHandle};
