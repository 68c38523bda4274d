//! Error types for wsbridge.

use thiserror::Error;

use crate::connection::ConnectionId;
use crate::engine::EngineError;
use crate::event::EventKind;

/// Main error type for context construction and lifecycle operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// I/O error outside the engine (service thread spawn, etc.).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol table rejected at construction (over the cap, name too long,
    /// duplicate name).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Engine failed to start (bad bind address, TLS material missing or
    /// invalid).
    #[error("Engine init error: {0}")]
    EngineInit(#[source] EngineError),

    /// Engine failed while servicing events.
    #[error("Engine error: {0}")]
    Engine(#[source] EngineError),

    /// Operation attempted on a destroyed context.
    #[error("Context destroyed")]
    ContextDestroyed,
}

/// Result type alias using BridgeError.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Error type protocol handlers may return.
///
/// Converted to the reject decision at the bridge boundary; never propagates
/// into the engine.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Record of a handler failure contained at the bridge.
///
/// Faults are logged, converted to the reject decision, and queued for the
/// embedding layer to drain via
/// [`Context::take_faults`](crate::Context::take_faults).
#[derive(Debug, Clone)]
pub struct HandlerFault {
    /// Name of the protocol whose handler failed.
    pub protocol: String,
    /// Connection the event belonged to.
    pub connection: ConnectionId,
    /// Kind of event being dispatched when the handler failed.
    pub kind: EventKind,
    /// Handler error message.
    pub message: String,
}
