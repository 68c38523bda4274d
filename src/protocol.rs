//! Protocol handlers and the dispatch table.
//!
//! Protocols are registered once at context construction as an ordered
//! (name, handler) list mirroring the slot array handed to the engine; each
//! engine protocol slot carries its table index back on every event. The
//! table is immutable after construction and retains every handler reference
//! until context destruction.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use wsbridge::connection::ConnectionHandle;
//! use wsbridge::event::{Decision, Event};
//! use wsbridge::protocol::{HandlerResult, ProtocolHandler, ProtocolTable};
//!
//! fn echo(_conn: Option<&ConnectionHandle>, _event: &Event) -> HandlerResult {
//!     Ok(Decision::Continue)
//! }
//!
//! let table = ProtocolTable::build(vec![(
//!     "echo".to_string(),
//!     Arc::new(echo) as Arc<dyn ProtocolHandler>,
//! )])
//! .unwrap();
//!
//! assert_eq!(table.len(), 1);
//! assert_eq!(table.entries()[0].name(), "echo");
//! ```

use std::fmt;
use std::sync::Arc;

use crate::connection::ConnectionHandle;
use crate::engine::ProtocolDesc;
use crate::error::{BridgeError, HandlerError, Result};
use crate::event::{Decision, Event};

/// Maximum number of protocols per context.
pub const MAX_PROTOCOLS: usize = 4;

/// Maximum protocol name length in bytes.
pub const MAX_PROTOCOL_NAME_LEN: usize = 99;

/// Result type for protocol handlers.
pub type HandlerResult = std::result::Result<Decision, HandlerError>;

/// Per-protocol event handler.
///
/// Invoked synchronously for every event on a connection negotiated onto
/// this protocol. `connection` is `None` when no handle is registered for
/// the event's connection (before establishment, on and after close).
///
/// Returning `Err` never reaches the engine: the bridge logs the failure,
/// records a fault, and reports the reject decision in its place.
pub trait ProtocolHandler: Send + Sync + 'static {
    /// Handle one event and decide whether the engine may proceed.
    fn on_event(&self, connection: Option<&ConnectionHandle>, event: &Event) -> HandlerResult;
}

impl<F> ProtocolHandler for F
where
    F: Fn(Option<&ConnectionHandle>, &Event) -> HandlerResult + Send + Sync + 'static,
{
    fn on_event(&self, connection: Option<&ConnectionHandle>, event: &Event) -> HandlerResult {
        self(connection, event)
    }
}

/// Index of a protocol in its context's table.
///
/// Registered with the engine as opaque per-slot user data and round-tripped
/// on every event for connections on that protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ProtocolId(u16);

impl ProtocolId {
    /// Create an id for a table slot.
    #[inline]
    pub const fn new(index: u16) -> Self {
        Self(index)
    }

    /// The table slot as a usize.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One registered protocol: name, handler reference, table slot.
pub struct ProtocolEntry {
    name: Arc<str>,
    handler: Arc<dyn ProtocolHandler>,
    id: ProtocolId,
}

impl ProtocolEntry {
    /// Protocol name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Table slot of this protocol.
    #[inline]
    pub fn id(&self) -> ProtocolId {
        self.id
    }

    pub(crate) fn handler(&self) -> &dyn ProtocolHandler {
        self.handler.as_ref()
    }

    pub(crate) fn name_arc(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }
}

impl fmt::Debug for ProtocolEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolEntry")
            .field("name", &self.name)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Fixed-capacity ordered protocol table, immutable after construction.
///
/// Handler references are retained here from construction until the owning
/// context destroys itself.
#[derive(Debug, Default)]
pub struct ProtocolTable {
    entries: Vec<ProtocolEntry>,
}

impl ProtocolTable {
    /// Build a table from an ordered (name, handler) list.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Configuration`] when the list exceeds
    /// [`MAX_PROTOCOLS`], a name exceeds [`MAX_PROTOCOL_NAME_LEN`] bytes, or
    /// a name repeats. No handler reference is retained on failure.
    pub fn build(protocols: Vec<(String, Arc<dyn ProtocolHandler>)>) -> Result<Self> {
        if protocols.len() > MAX_PROTOCOLS {
            return Err(BridgeError::Configuration(format!(
                "{} protocols exceed the maximum of {}",
                protocols.len(),
                MAX_PROTOCOLS
            )));
        }
        let mut entries: Vec<ProtocolEntry> = Vec::with_capacity(protocols.len());
        for (index, (name, handler)) in protocols.into_iter().enumerate() {
            if name.len() > MAX_PROTOCOL_NAME_LEN {
                return Err(BridgeError::Configuration(format!(
                    "protocol name of {} bytes exceeds the {}-byte maximum",
                    name.len(),
                    MAX_PROTOCOL_NAME_LEN
                )));
            }
            if entries.iter().any(|entry| entry.name() == name) {
                return Err(BridgeError::Configuration(format!(
                    "duplicate protocol name {name:?}"
                )));
            }
            entries.push(ProtocolEntry {
                name: name.into(),
                handler,
                id: ProtocolId::new(index as u16),
            });
        }
        Ok(Self { entries })
    }

    /// Entry at a table slot.
    pub fn get(&self, id: ProtocolId) -> Option<&ProtocolEntry> {
        self.entries.get(id.index())
    }

    /// Entry by protocol name.
    pub fn find(&self, name: &str) -> Option<&ProtocolEntry> {
        self.entries.iter().find(|entry| entry.name() == name)
    }

    /// All entries in registration order.
    #[inline]
    pub fn entries(&self) -> &[ProtocolEntry] {
        &self.entries
    }

    /// Number of registered protocols.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no protocols.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Descriptors for handing to an engine at start.
    pub fn descriptors(&self) -> Vec<ProtocolDesc> {
        self.entries
            .iter()
            .map(|entry| ProtocolDesc {
                name: entry.name().to_string(),
                id: entry.id(),
            })
            .collect()
    }

    /// Drop every retained handler reference. Idempotent.
    pub(crate) fn release_handlers(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn ProtocolHandler> {
        Arc::new(|_: Option<&ConnectionHandle>, _: &Event| -> HandlerResult {
            Ok(Decision::Continue)
        })
    }

    fn named(names: &[&str]) -> Vec<(String, Arc<dyn ProtocolHandler>)> {
        names.iter().map(|n| (n.to_string(), noop())).collect()
    }

    #[test]
    fn test_build_assigns_sequential_slots() {
        let table = ProtocolTable::build(named(&["echo", "chat", "feed"])).unwrap();
        assert_eq!(table.len(), 3);
        for (index, entry) in table.entries().iter().enumerate() {
            assert_eq!(entry.id().index(), index);
        }
        assert_eq!(table.get(ProtocolId::new(1)).unwrap().name(), "chat");
        assert_eq!(table.find("feed").unwrap().id(), ProtocolId::new(2));
    }

    #[test]
    fn test_build_rejects_duplicate_names() {
        let err = ProtocolTable::build(named(&["echo", "echo"])).unwrap_err();
        assert!(matches!(err, BridgeError::Configuration(_)));
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_build_rejects_over_capacity() {
        let over: Vec<String> = (0..=MAX_PROTOCOLS).map(|i| format!("p{i}")).collect();
        let names: Vec<&str> = over.iter().map(String::as_str).collect();
        let err = ProtocolTable::build(named(&names)).unwrap_err();
        assert!(matches!(err, BridgeError::Configuration(_)));
    }

    #[test]
    fn test_build_accepts_exact_capacity() {
        let exact: Vec<String> = (0..MAX_PROTOCOLS).map(|i| format!("p{i}")).collect();
        let names: Vec<&str> = exact.iter().map(String::as_str).collect();
        let table = ProtocolTable::build(named(&names)).unwrap();
        assert_eq!(table.len(), MAX_PROTOCOLS);
    }

    #[test]
    fn test_build_rejects_long_name() {
        let long = "x".repeat(MAX_PROTOCOL_NAME_LEN + 1);
        let err = ProtocolTable::build(named(&[long.as_str()])).unwrap_err();
        assert!(matches!(err, BridgeError::Configuration(_)));

        let max = "x".repeat(MAX_PROTOCOL_NAME_LEN);
        assert!(ProtocolTable::build(named(&[max.as_str()])).is_ok());
    }

    #[test]
    fn test_get_out_of_range_is_none() {
        let table = ProtocolTable::build(named(&["echo"])).unwrap();
        assert!(table.get(ProtocolId::new(1)).is_none());
        assert!(table.find("chat").is_none());
    }

    #[test]
    fn test_release_handlers_drops_references() {
        let handler = noop();
        let before = Arc::strong_count(&handler);
        let mut table =
            ProtocolTable::build(vec![("echo".to_string(), Arc::clone(&handler))]).unwrap();
        assert_eq!(Arc::strong_count(&handler), before + 1);

        table.release_handlers();
        assert_eq!(Arc::strong_count(&handler), before);
        assert!(table.is_empty());

        // Second release is a no-op.
        table.release_handlers();
        assert_eq!(Arc::strong_count(&handler), before);
    }

    #[test]
    fn test_descriptors_match_table_order() {
        let table = ProtocolTable::build(named(&["echo", "chat"])).unwrap();
        let descs = table.descriptors();
        assert_eq!(descs.len(), 2);
        assert_eq!(descs[0].name, "echo");
        assert_eq!(descs[0].id, ProtocolId::new(0));
        assert_eq!(descs[1].name, "chat");
        assert_eq!(descs[1].id, ProtocolId::new(1));
    }
}
