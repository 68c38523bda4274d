//! Connection-lifetime registry.
//!
//! Single source of truth for "is there a live managed object for native
//! connection X". The strong reference lives in a per-connection
//! [`SessionSlot`] the engine allocates and round-trips on every event for
//! that connection; there is deliberately no global id-to-handle map that
//! could go stale, because the engine already knows which connection an
//! event belongs to.
//!
//! Lifecycle of one slot:
//!
//! ```text
//! empty ──establish──▶ registered ──release──▶ empty
//!   ▲                                            │
//!   └──────────── release is a no-op ◀───────────┘
//! ```

use std::sync::Arc;

use crate::connection::{Connection, ConnectionHandle, ConnectionId};

/// Fixed-size per-connection storage round-tripped by the engine.
///
/// Holds the registry's strong reference while the connection is registered.
/// Engines treat the contents as opaque: they allocate a default slot per
/// connection and hand it back on every event for that connection.
#[derive(Debug, Default)]
pub struct SessionSlot {
    retained: Option<ConnectionHandle>,
}

impl SessionSlot {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a handle is currently registered in this slot.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.retained.is_none()
    }

    /// The registered handle, if any.
    #[inline]
    pub fn handle(&self) -> Option<&ConnectionHandle> {
        self.retained.as_ref()
    }
}

/// Reference-keeping registry over engine-owned session slots.
///
/// Creation and release are driven only by the established/closed reasons;
/// every other reason reads via [`lookup`](Self::lookup).
#[derive(Debug, Default)]
pub struct HandleRegistry {
    live: usize,
}

impl HandleRegistry {
    /// Create a registry with no live handles.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection: create the managed handle and store the
    /// strong reference in the slot. Returns the handle for the first
    /// handler invocation.
    ///
    /// A slot that already holds a handle means the engine delivered two
    /// established events without a closed between them; the stale handle is
    /// released first so the at-most-one invariant holds.
    pub fn establish(
        &mut self,
        slot: &mut SessionSlot,
        id: ConnectionId,
        protocol: Arc<str>,
    ) -> ConnectionHandle {
        if let Some(stale) = slot.retained.take() {
            tracing::warn!(
                connection = %stale.id(),
                "established on an occupied slot, releasing stale handle"
            );
            stale.mark_closed();
            self.live -= 1;
        }
        let handle = Connection::create(id, protocol);
        slot.retained = Some(handle.clone());
        self.live += 1;
        handle
    }

    /// Release the slot's strong reference and mark the handle closed.
    ///
    /// Releasing an empty slot is a no-op: some engines signal close without
    /// a prior established event (failed handshake).
    pub fn release(&mut self, slot: &mut SessionSlot) {
        if let Some(handle) = slot.retained.take() {
            handle.mark_closed();
            self.live -= 1;
        }
    }

    /// The registered handle for this slot, if any.
    ///
    /// Events that arrive before establishment or after close resolve to
    /// `None`; the bridge passes the absence through to the handler rather
    /// than failing.
    pub fn lookup(&self, slot: &SessionSlot) -> Option<ConnectionHandle> {
        slot.retained.clone()
    }

    /// Number of currently registered handles.
    #[inline]
    pub fn live(&self) -> usize {
        self.live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_and_slot() -> (HandleRegistry, SessionSlot) {
        (HandleRegistry::new(), SessionSlot::new())
    }

    #[test]
    fn test_establish_then_release_cycle() {
        let (mut registry, mut slot) = registry_and_slot();
        assert_eq!(registry.live(), 0);
        assert!(slot.is_empty());

        let handle = registry.establish(&mut slot, ConnectionId::new(7), Arc::from("echo"));
        assert_eq!(registry.live(), 1);
        assert!(!slot.is_empty());
        assert!(handle.is_open());

        registry.release(&mut slot);
        assert_eq!(registry.live(), 0);
        assert!(slot.is_empty());
        assert!(!handle.is_open());
    }

    #[test]
    fn test_release_empty_slot_is_noop() {
        let (mut registry, mut slot) = registry_and_slot();
        registry.release(&mut slot);
        registry.release(&mut slot);
        assert_eq!(registry.live(), 0);
        assert!(slot.is_empty());
    }

    #[test]
    fn test_lookup_follows_registration() {
        let (mut registry, mut slot) = registry_and_slot();
        assert!(registry.lookup(&slot).is_none());

        let handle = registry.establish(&mut slot, ConnectionId::new(3), Arc::from("echo"));
        let looked_up = registry.lookup(&slot).unwrap();
        assert!(Arc::ptr_eq(&handle, &looked_up));

        registry.release(&mut slot);
        assert!(registry.lookup(&slot).is_none());
    }

    #[test]
    fn test_lookup_empty_after_close_despite_retained_handle() {
        let (mut registry, mut slot) = registry_and_slot();
        let retained = registry.establish(&mut slot, ConnectionId::new(9), Arc::from("echo"));
        registry.release(&mut slot);

        // The handler kept a clone; the registry still reports nothing.
        assert!(registry.lookup(&slot).is_none());
        assert!(!retained.is_open());
        assert_eq!(retained.id(), ConnectionId::new(9));
    }

    #[test]
    fn test_double_establish_replaces_stale_handle() {
        let (mut registry, mut slot) = registry_and_slot();
        let first = registry.establish(&mut slot, ConnectionId::new(1), Arc::from("echo"));
        let second = registry.establish(&mut slot, ConnectionId::new(2), Arc::from("echo"));

        assert_eq!(registry.live(), 1);
        assert!(!first.is_open());
        assert!(second.is_open());
        assert_eq!(registry.lookup(&slot).unwrap().id(), ConnectionId::new(2));
    }

    #[test]
    fn test_independent_slots() {
        let mut registry = HandleRegistry::new();
        let mut a = SessionSlot::new();
        let mut b = SessionSlot::new();

        registry.establish(&mut a, ConnectionId::new(1), Arc::from("echo"));
        registry.establish(&mut b, ConnectionId::new(2), Arc::from("chat"));
        assert_eq!(registry.live(), 2);

        registry.release(&mut a);
        assert_eq!(registry.live(), 1);
        assert!(registry.lookup(&a).is_none());
        assert_eq!(registry.lookup(&b).unwrap().protocol(), "chat");
    }
}
