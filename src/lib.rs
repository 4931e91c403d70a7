//! Agent Relay: worker dispatch and reliable reply delivery for chat agents.

pub mod agent;
pub mod bridge;
pub mod config;
pub mod delivery;
pub mod diagnostics;
pub mod error;
pub mod http;
pub mod store;
pub mod voice;
pub mod worker;
