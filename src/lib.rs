//! # wsbridge
//!
//! Event-dispatch bridge and connection-lifetime registry for
//! reactor-based WebSocket/HTTP engines.
//!
//! An engine owns the sockets, framing and poll loop; this crate translates
//! every engine event (established, data received, poll-fd churn, closed)
//! into an invocation of a registered protocol handler, and the handler's
//! result back into an engine control decision. The hard part it owns is
//! lifetime: exactly one managed [`Connection`](connection::Connection)
//! handle exists per open native connection, created on establishment and
//! released on close, across arbitrary event orderings.
//!
//! ## Architecture
//!
//! - **Handle Registry** (`registry`): strong reference per open connection,
//!   stored in the engine-round-tripped session slot
//! - **Protocol Table** (`protocol`): fixed-capacity ordered name → handler
//!   table, immutable after construction
//! - **Event Bridge** (`bridge`): the single dispatch entry point engines
//!   call; contains handler failures, defaults to reject
//! - **Context** (`context`): lifecycle (build, run/fork service loop,
//!   idempotent destroy)
//! - **Engines** (`engine`): the reactor seam, with a scripted in-memory
//!   engine and a mio/tungstenite poll engine (unix)
//!
//! ## Example
//!
//! ```no_run
//! use wsbridge::engine::poll::PollEngine;
//! use wsbridge::event::{Decision, Event};
//! use wsbridge::ContextBuilder;
//!
//! let mut context = ContextBuilder::new()
//!     .port(9001)
//!     .protocol("echo", |conn, event| {
//!         if let (Some(conn), Event::Receive(payload)) = (conn, event) {
//!             tracing::info!(connection = %conn.id(), len = payload.len(), "data");
//!         }
//!         Ok(Decision::Continue)
//!     })
//!     .build(PollEngine::new())?;
//!
//! // Drive the engine; each pass dispatches pending events synchronously.
//! let dispatched = context.run_iteration(Some(std::time::Duration::from_millis(50)))?;
//! tracing::debug!(dispatched, "service pass done");
//! context.destroy();
//! # Ok::<(), wsbridge::BridgeError>(())
//! ```

pub mod bridge;
pub mod config;
pub mod connection;
pub mod context;
pub mod engine;
pub mod error;
pub mod event;
pub mod protocol;
pub mod registry;

pub use config::{ContextConfig, TlsConfig};
pub use connection::{ConnectionHandle, ConnectionId};
pub use context::{Context, ContextBuilder, ServiceLoop};
pub use error::{BridgeError, HandlerFault, Result};
pub use event::{Decision, Event, EventKind};
pub use protocol::{HandlerResult, ProtocolHandler, ProtocolId, ProtocolTable};
