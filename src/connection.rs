//! Managed connection handles.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Opaque native connection identity supplied by the engine.
///
/// The bridge never interprets the value; it only keys logs and fault
/// records. Engines allocate identities however they like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wrap an engine-supplied raw identity.
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The engine's raw identity value.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Managed object representing one native connection to handler code.
///
/// Created by the registry on the established event. The registry holds the
/// only long-lived strong reference and drops it on the closed event;
/// handlers may clone the handle to retain the object past close, but a
/// retained handle reports `is_open() == false` once the connection is gone.
///
/// Carries no I/O operations; sending belongs to a layer above the bridge.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    protocol: Arc<str>,
    open: AtomicBool,
}

/// Shared reference to a [`Connection`].
pub type ConnectionHandle = Arc<Connection>;

impl Connection {
    pub(crate) fn create(id: ConnectionId, protocol: Arc<str>) -> ConnectionHandle {
        Arc::new(Self {
            id,
            protocol,
            open: AtomicBool::new(true),
        })
    }

    /// Native identity of this connection.
    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Name of the protocol the connection was negotiated onto.
    #[inline]
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Whether the connection is still registered (no closed event yet).
    #[inline]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_connection_is_open() {
        let handle = Connection::create(ConnectionId::new(7), Arc::from("echo"));
        assert_eq!(handle.id(), ConnectionId::new(7));
        assert_eq!(handle.protocol(), "echo");
        assert!(handle.is_open());
    }

    #[test]
    fn test_retained_handle_observes_close() {
        let handle = Connection::create(ConnectionId::new(1), Arc::from("echo"));
        let retained = handle.clone();
        handle.mark_closed();
        assert!(!retained.is_open());
    }

    #[test]
    fn test_connection_id_roundtrip() {
        let id = ConnectionId::new(u64::MAX);
        assert_eq!(id.raw(), u64::MAX);
        assert_eq!(format!("{}", ConnectionId::new(42)), "42");
    }
}
