//! # CDP Bridge Relay
//!
//! Bridges an automation driver to a browser tab controlled through an
//! extension agent. The driver connects to one WebSocket endpoint, the
//! extension to the other, and the relay in between makes the remote tab
//! look like a locally attached debugging target.
//!
//! ## Architecture
//!
//! ```text
//! Driver ──WS /cdp──► Relay ◄──WS /extension── Extension ── Tab
//! ```
//!
//! ## Modules
//!
//! - [`relay`]  — shared relay state, pending-request table, lifecycle
//! - `agent`    — extension endpoint: connection_info, responses, events
//! - `driver`   — driver endpoint: dispatch and synthesized handlers
//! - `web`      — axum router and WebSocket upgrade admission
//! - [`config`] — TOML configuration loading

pub mod config;
pub mod relay;

mod agent;
mod driver;
mod web;

pub use relay::Relay;
