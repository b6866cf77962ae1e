//! User-facing Rust SDK for the HubLink realtime and API services.
//!
//! The crate is organized by transport surface:
//! - `api`: HTTP adapters for reads, writes, and progress-tracked uploads.
//! - `client`: top-level client facade and options.
//! - `credentials`: bearer-token cache with single-flight refresh.
//! - `realtime`: realtime session manager and transport contract.
//! - `retry`: authorization-failure retry helper shared by all transports.

/// HTTP adapters and response types.
pub mod api;
/// Client facade and configuration options.
pub mod client;
/// Token cache and refresh coordination.
pub mod credentials;
/// Realtime session manager, transport contract, and lifecycle events.
pub mod realtime;
/// Retry-on-authorization-failure helper used across the SDK.
pub mod retry;
