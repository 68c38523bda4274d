//! The event bridge: engine events in, handler decisions out.
//!
//! [`EventBridge`] is the single [`EventSink`] implementation the engine
//! ever calls. It is a stateless translator; all state lives in the
//! [`ProtocolTable`], the [`HandleRegistry`] and the fault queue it borrows
//! from the owning context for the duration of one service pass.
//!
//! Per event it resolves the protocol entry from the round-tripped table
//! index, performs the registry action the reason demands, invokes the
//! handler, and converts the handler's result into the engine's integer
//! decision convention. Handler failures stop here: logged, recorded as a
//! [`HandlerFault`], reported to the engine as reject.

use crate::connection::ConnectionId;
use crate::engine::EventSink;
use crate::error::HandlerFault;
use crate::event::{Decision, Event};
use crate::protocol::{ProtocolId, ProtocolTable};
use crate::registry::{HandleRegistry, SessionSlot};

/// Faults kept before the oldest is dropped; the embedding layer is
/// expected to drain via `Context::take_faults` between service passes.
pub(crate) const MAX_PENDING_FAULTS: usize = 64;

/// Dispatch state machine for one service pass.
pub struct EventBridge<'a> {
    table: &'a ProtocolTable,
    registry: &'a mut HandleRegistry,
    faults: &'a mut Vec<HandlerFault>,
}

impl<'a> EventBridge<'a> {
    pub(crate) fn new(
        table: &'a ProtocolTable,
        registry: &'a mut HandleRegistry,
        faults: &'a mut Vec<HandlerFault>,
    ) -> Self {
        Self {
            table,
            registry,
            faults,
        }
    }

    fn record_fault(&mut self, fault: HandlerFault) {
        if self.faults.len() >= MAX_PENDING_FAULTS {
            tracing::warn!(
                dropped = %self.faults[0].kind,
                "fault queue full, dropping oldest fault"
            );
            self.faults.remove(0);
        }
        self.faults.push(fault);
    }
}

impl EventSink for EventBridge<'_> {
    fn dispatch(
        &mut self,
        id: ConnectionId,
        slot: &mut SessionSlot,
        protocol: ProtocolId,
        event: Event,
    ) -> Decision {
        // An index outside the table is an engine bug, not a handler
        // failure; there is no handler to blame, so just reject.
        let Some(entry) = self.table.get(protocol) else {
            tracing::error!(
                connection = %id,
                protocol = %protocol,
                "event for unknown protocol slot"
            );
            return Decision::Reject;
        };

        let handle = match &event {
            Event::Established | Event::ClientEstablished => {
                Some(self.registry.establish(slot, id, entry.name_arc()))
            }
            // Release before the handler runs: it observes a connection
            // already deregistered, so a reentrant lookup yields empty.
            Event::Closed => {
                self.registry.release(slot);
                None
            }
            _ => self.registry.lookup(slot),
        };

        match entry.handler().on_event(handle.as_ref(), &event) {
            Ok(decision) => decision,
            Err(err) => {
                tracing::error!(
                    connection = %id,
                    protocol = entry.name(),
                    kind = %event.kind(),
                    error = %err,
                    "handler failed, rejecting"
                );
                let fault = HandlerFault {
                    protocol: entry.name().to_string(),
                    connection: id,
                    kind: event.kind(),
                    message: err.to_string(),
                };
                self.record_fault(fault);
                Decision::Reject
            }
        }
    }
}
