//! Rust SDK for browser-style IoT chat sessions over a managed MQTT broker.
//!
//! The crate is organized by concern:
//! - `config`: environment-sourced session settings.
//! - `identity`: temporary credentials from an identity pool.
//! - `broker`: MQTT-over-WebSocket connection with reconnect handling.
//! - `session`: the session manager tying credentials, topic, and observer together.
//! - `retry`: shared retry, backoff, and timeout utilities.

/// Message broker seam and websocket transport.
pub mod broker;
/// Session configuration.
pub mod config;
/// Identity provider client and credential types.
pub mod identity;
/// Retry and timeout helpers used across the SDK.
pub mod retry;
/// Session lifecycle, subscription, and message handling.
pub mod session;

pub use config::SessionConfig;
pub use session::{SessionError, SessionEvent, SessionManager, SessionState};
