//! Engine seam: the boundary between the bridge and reactor implementations.
//!
//! Engines own sockets, framing, and the poll loop; the bridge owns handler
//! dispatch and connection lifetime. An engine calls
//! [`EventSink::dispatch`] for every event it produces, round-trips the
//! per-connection [`SessionSlot`] it allocated, and honors the returned
//! [`Decision`] for reasons that support rejection.
//!
//! Two implementations ship with the crate:
//!
//! - [`scripted::ScriptedEngine`] replays a queued event sequence, for tests
//!   and handler development without sockets.
//! - [`poll::PollEngine`] (unix) serves real WebSocket connections on a mio
//!   poll loop with tungstenite framing and optional rustls TLS.

pub mod scripted;

#[cfg(unix)]
pub mod poll;

use std::time::Duration;

use thiserror::Error;

use crate::config::ContextConfig;
use crate::connection::ConnectionId;
use crate::event::{Decision, Event};
use crate::protocol::ProtocolId;
use crate::registry::SessionSlot;

/// Descriptor for one protocol slot handed to an engine at start.
///
/// Carries the table index as the opaque user data the engine round-trips
/// on every event for connections negotiated onto this protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolDesc {
    /// Protocol name, used for subprotocol negotiation.
    pub name: String,
    /// Table slot to round-trip on dispatch.
    pub id: ProtocolId,
}

/// Receiver side of the engine callback boundary.
///
/// Implemented by the event bridge; engines only ever see this trait.
pub trait EventSink {
    /// Dispatch one engine event and return the control decision.
    fn dispatch(
        &mut self,
        id: ConnectionId,
        slot: &mut SessionSlot,
        protocol: ProtocolId,
        event: Event,
    ) -> Decision;
}

/// A reactor engine drivable by a context.
///
/// Implementations deliver events one at a time from whichever thread calls
/// [`service`](Self::service); nothing here is called concurrently.
pub trait Engine {
    /// Bind and initialize per the config with the given protocol slots.
    ///
    /// # Errors
    ///
    /// Engine-specific init failures (bad bind address, TLS material,
    /// unsupported protocol set). Starting twice is
    /// [`EngineError::AlreadyStarted`].
    fn start(
        &mut self,
        config: &ContextConfig,
        protocols: &[ProtocolDesc],
    ) -> Result<(), EngineError>;

    /// Run one pass of the event loop, dispatching pending events through
    /// the sink. Returns the number of events dispatched.
    ///
    /// `timeout` bounds the wait for I/O; `None` may block until something
    /// happens.
    fn service(
        &mut self,
        sink: &mut dyn EventSink,
        timeout: Option<Duration>,
    ) -> Result<usize, EngineError>;

    /// Tear down, delivering closed events for connections still open
    /// through the sink before resources are dropped.
    fn shutdown(&mut self, sink: &mut dyn EventSink);
}

/// Errors produced by engine implementations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// I/O failure in the poll loop or on a socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to bind the listen address.
    #[error("Bind failed on {addr}: {source}")]
    Bind {
        /// Address the bind was attempted on.
        addr: String,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// TLS material missing or invalid.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Configuration this engine cannot serve.
    #[error("Unsupported configuration: {0}")]
    Unsupported(String),

    /// start() called on a started engine.
    #[error("Engine already started")]
    AlreadyStarted,

    /// Operation attempted before a successful start().
    #[error("Engine not started")]
    NotStarted,
}
