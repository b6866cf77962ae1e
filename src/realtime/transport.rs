//! Contract for the underlying realtime transport.
//!
//! The SDK does not implement the realtime wire protocol; it drives a
//! supplied connection through this trait and consumes the typed events the
//! transport reports over a `tokio::sync::mpsc` channel handed to the
//! session at construction.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::credentials::CredentialError;

/// Events reported by a realtime transport.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// The connection closed and will not recover on its own.
    Closed {
        /// Transport-reported reason, when one exists.
        error: Option<String>,
    },
    /// The transport lost the connection and is retrying internally.
    Reconnecting {
        /// Transport-reported reason, when one exists.
        error: Option<String>,
    },
    /// The transport re-established the connection.
    ///
    /// Server-side subscription state is lost across a reconnect; the session
    /// replays its subscriptions when it sees this event.
    Reconnected {
        /// New connection identifier, when the transport assigns one.
        connection_id: Option<String>,
    },
    /// A message arrived for a subscription key.
    Event {
        /// Composite subscription key the message was published under.
        key: String,
        /// Message payload.
        payload: Value,
    },
}

/// Errors reported by a realtime transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection could not be started.
    #[error("connection start failed: {0}")]
    Start(String),

    /// A server-side invocation failed.
    #[error("invoke {method} failed: {reason}")]
    Invoke {
        /// Invoked method name.
        method: String,
        /// Transport-reported reason.
        reason: String,
    },

    /// The transport's authentication hook could not obtain a token.
    #[error(transparent)]
    Credential(#[from] CredentialError),
}

/// A supplied realtime connection.
///
/// Implementations own framing, heartbeats, and automatic reconnect backoff.
/// They authenticate through a [`CredentialBroker`], and must forward the
/// `force_token_refresh` flag given to [`start`] into that token request so a
/// stale cached token cannot wedge the initial connect.
///
/// [`CredentialBroker`]: crate::credentials::CredentialBroker
/// [`start`]: RealtimeTransport::start
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Starts the connection, authenticating with a token from the broker.
    ///
    /// `force_token_refresh` applies to this attempt's authentication only.
    async fn start(&self, force_token_refresh: bool) -> Result<(), TransportError>;

    /// Stops the connection. No events are reported afterward.
    async fn stop(&self);

    /// Invokes a server-side method with a single string argument.
    async fn invoke(&self, method: &str, arg: &str) -> Result<(), TransportError>;
}
