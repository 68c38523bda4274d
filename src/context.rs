//! Context construction and lifecycle.
//!
//! The [`ContextBuilder`] provides a fluent API for configuring the listen
//! socket and registering protocols; [`build`](ContextBuilder::build) hands
//! the assembled protocol descriptors to an engine and yields a [`Context`].
//! The [`Context`] manages the lifecycle:
//!
//! 1. Drive the engine one pass at a time with `run_iteration`, or move it
//!    onto a background thread with `fork_service_loop`.
//! 2. Events dispatched by the engine flow through the bridge into the
//!    registered handlers.
//! 3. `destroy()` (also on drop) tears the engine down, lets it deliver
//!    closes for anything still open, then releases the handler references.
//!
//! # Example
//!
//! ```
//! use wsbridge::engine::scripted::ScriptedEngine;
//! use wsbridge::event::{Decision, Event};
//! use wsbridge::{ConnectionId, ContextBuilder, ProtocolId};
//!
//! let mut engine = ScriptedEngine::new();
//! engine.enqueue(ConnectionId::new(1), ProtocolId::new(0), Event::Established);
//!
//! let mut context = ContextBuilder::new()
//!     .protocol("echo", |_conn, _event| Ok(Decision::Continue))
//!     .build(engine)
//!     .unwrap();
//!
//! let dispatched = context.run_iteration(None).unwrap();
//! assert_eq!(dispatched, 1);
//! assert_eq!(context.live_connections(), 1);
//! context.destroy();
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::bridge::EventBridge;
use crate::config::{ContextConfig, TlsConfig};
use crate::connection::ConnectionHandle;
use crate::engine::Engine;
use crate::error::{BridgeError, HandlerFault, Result};
use crate::event::Event;
use crate::protocol::{HandlerResult, ProtocolHandler, ProtocolTable};
use crate::registry::HandleRegistry;

/// Poll wait used by the forked service loop between stop-flag checks.
const SERVICE_LOOP_TIMEOUT: Duration = Duration::from_millis(50);

/// Builder for configuring and creating a [`Context`].
///
/// Protocol registration order fixes the table slots: the first registered
/// protocol gets slot 0, which engines also use as the negotiation default.
pub struct ContextBuilder {
    config: ContextConfig,
    protocols: Vec<(String, Arc<dyn ProtocolHandler>)>,
}

impl ContextBuilder {
    /// Create a builder with the default configuration (port 0, all
    /// interfaces, no TLS).
    pub fn new() -> Self {
        Self {
            config: ContextConfig::default(),
            protocols: Vec::new(),
        }
    }

    /// Start from an existing configuration (e.g. deserialized from a
    /// file).
    pub fn with_config(config: ContextConfig) -> Self {
        Self {
            config,
            protocols: Vec::new(),
        }
    }

    /// Listen port; 0 picks an ephemeral port.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Bind interface; unset binds all interfaces.
    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.config.interface = Some(interface.into());
        self
    }

    /// Serve TLS using the given PEM certificate chain and private key.
    pub fn tls(
        mut self,
        cert_path: impl Into<std::path::PathBuf>,
        key_path: impl Into<std::path::PathBuf>,
    ) -> Self {
        self.config.tls = Some(TlsConfig {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        });
        self
    }

    /// Drop to this group id after binding (unix engines only).
    pub fn gid(mut self, gid: u32) -> Self {
        self.config.gid = Some(gid);
        self
    }

    /// Drop to this user id after binding (unix engines only).
    pub fn uid(mut self, uid: u32) -> Self {
        self.config.uid = Some(uid);
        self
    }

    /// Engine option bits (see [`crate::config::options`]).
    pub fn options(mut self, options: u32) -> Self {
        self.config.options = options;
        self
    }

    /// Request an extension from the engine; engines ignore names they do
    /// not support.
    pub fn extension(mut self, name: impl Into<String>) -> Self {
        self.config.extensions.push(name.into());
        self
    }

    /// Register a protocol handler under the next table slot.
    ///
    /// Accepts closures directly; use [`protocol_handler`](Self::protocol_handler)
    /// to register a shared [`ProtocolHandler`] instance.
    pub fn protocol<F>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Option<&ConnectionHandle>, &Event) -> HandlerResult + Send + Sync + 'static,
    {
        self.protocol_handler(name, Arc::new(handler))
    }

    /// Register a protocol with an already-constructed handler reference.
    pub fn protocol_handler(
        mut self,
        name: impl Into<String>,
        handler: Arc<dyn ProtocolHandler>,
    ) -> Self {
        self.protocols.push((name.into(), handler));
        self
    }

    /// Validate the protocol table, start the engine, and return the
    /// context.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Configuration`] for an over-limit or malformed
    /// protocol list, [`BridgeError::EngineInit`] when the engine fails to
    /// start. In both cases no handler reference outlives this call.
    pub fn build<E: Engine>(self, mut engine: E) -> Result<Context<E>> {
        let table = ProtocolTable::build(self.protocols)?;
        engine
            .start(&self.config, &table.descriptors())
            .map_err(BridgeError::EngineInit)?;

        tracing::debug!(
            port = self.config.port,
            protocols = table.len(),
            "context created"
        );
        Ok(Context {
            engine,
            config: self.config,
            table,
            registry: HandleRegistry::new(),
            faults: Vec::new(),
            destroyed: false,
        })
    }
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running bridge context: one engine, one protocol table, one registry.
///
/// Not `Sync`; the bridge never executes concurrently with itself, which the
/// `&mut self` lifecycle methods enforce. The context may move to another
/// thread wholesale (see [`fork_service_loop`](Self::fork_service_loop)).
#[derive(Debug)]
pub struct Context<E: Engine> {
    engine: E,
    config: ContextConfig,
    table: ProtocolTable,
    registry: HandleRegistry,
    faults: Vec<HandlerFault>,
    destroyed: bool,
}

impl<E: Engine> Context<E> {
    /// Run one pass of the engine's event loop, dispatching pending events
    /// through the bridge. Returns the number of events dispatched.
    ///
    /// `timeout` bounds the wait for I/O; `None` lets the engine block
    /// until something happens.
    ///
    /// # Errors
    ///
    /// [`BridgeError::ContextDestroyed`] after [`destroy`](Self::destroy);
    /// [`BridgeError::Engine`] when the engine fails mid-pass.
    pub fn run_iteration(&mut self, timeout: Option<Duration>) -> Result<usize> {
        if self.destroyed {
            return Err(BridgeError::ContextDestroyed);
        }
        let mut bridge = EventBridge::new(&self.table, &mut self.registry, &mut self.faults);
        self.engine
            .service(&mut bridge, timeout)
            .map_err(BridgeError::Engine)
    }

    /// Move the context onto a dedicated service thread.
    ///
    /// The thread calls [`run_iteration`](Self::run_iteration) until
    /// [`ServiceLoop::stop`] is called; [`ServiceLoop::join`] yields the
    /// context back.
    ///
    /// # Errors
    ///
    /// [`BridgeError::ContextDestroyed`] after destroy; `Io` if the thread
    /// cannot be spawned.
    pub fn fork_service_loop(self) -> Result<ServiceLoop<E>>
    where
        E: Send + 'static,
    {
        if self.destroyed {
            return Err(BridgeError::ContextDestroyed);
        }
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let mut context = self;
        let handle = thread::Builder::new()
            .name("wsbridge-service".to_string())
            .spawn(move || {
                while !thread_stop.load(Ordering::Acquire) {
                    match context.run_iteration(Some(SERVICE_LOOP_TIMEOUT)) {
                        Ok(_) => {}
                        Err(err) => {
                            tracing::error!(error = %err, "service loop stopping");
                            break;
                        }
                    }
                }
                context
            })?;
        Ok(ServiceLoop { stop, handle })
    }

    /// Tear the context down. Idempotent; a second call is a no-op.
    ///
    /// Ordering: signal engine teardown (which delivers closed events for
    /// open connections through the bridge), then release the handler
    /// references, then mark destroyed.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        {
            let mut bridge = EventBridge::new(&self.table, &mut self.registry, &mut self.faults);
            self.engine.shutdown(&mut bridge);
        }
        if self.registry.live() > 0 {
            tracing::warn!(
                live = self.registry.live(),
                "context destroyed with connections still registered"
            );
        }
        self.table.release_handlers();
        self.destroyed = true;
        tracing::debug!("context destroyed");
    }

    /// Whether [`destroy`](Self::destroy) has run.
    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Number of currently registered connection handles.
    #[inline]
    pub fn live_connections(&self) -> usize {
        self.registry.live()
    }

    /// The protocol table built at construction.
    ///
    /// Empty after destroy (handler references are gone).
    #[inline]
    pub fn protocols(&self) -> &ProtocolTable {
        &self.table
    }

    /// The configuration the context was built with.
    #[inline]
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Drain handler faults recorded since the last call.
    pub fn take_faults(&mut self) -> Vec<HandlerFault> {
        std::mem::take(&mut self.faults)
    }

    /// The underlying engine.
    #[inline]
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Mutable access to the underlying engine (e.g. to queue events on a
    /// scripted engine between iterations).
    #[inline]
    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }
}

impl<E: Engine> Drop for Context<E> {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Handle to a context running on a background service thread.
pub struct ServiceLoop<E: Engine> {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<Context<E>>,
}

impl<E: Engine> ServiceLoop<E> {
    /// Ask the service thread to stop after its current iteration.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Stop the thread and take the context back.
    ///
    /// # Errors
    ///
    /// `Io` when the service thread panicked.
    pub fn join(self) -> Result<Context<E>> {
        self.stop();
        self.handle.join().map_err(|_| {
            BridgeError::Io(std::io::Error::other("service thread panicked"))
        })
    }
}
