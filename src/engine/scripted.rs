//! Deterministic in-memory engine.
//!
//! [`ScriptedEngine`] replays a queued sequence of events through the sink,
//! owning per-connection session slots exactly the way a socket engine
//! would round-trip them. Tests and embedders use it to exercise handlers
//! and bridge semantics without opening a socket.
//!
//! Every decision the sink returns is recorded; `shutdown` delivers a
//! closed event for every connection the script opened and never closed,
//! mirroring a real engine's teardown close delivery.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::config::ContextConfig;
use crate::connection::ConnectionId;
use crate::engine::{Engine, EngineError, EventSink, ProtocolDesc};
use crate::event::{Decision, Event, EventKind};
use crate::protocol::ProtocolId;
use crate::registry::SessionSlot;

/// One scripted engine event, queued for the next service pass.
#[derive(Debug, Clone)]
struct Step {
    id: ConnectionId,
    protocol: ProtocolId,
    event: Event,
}

/// Record of one dispatch and the decision the sink returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionRecord {
    /// Connection the event was dispatched for.
    pub connection: ConnectionId,
    /// Kind of the dispatched event.
    pub kind: EventKind,
    /// Decision the sink returned.
    pub decision: Decision,
}

/// In-memory engine replaying scripted events.
#[derive(Debug, Default)]
pub struct ScriptedEngine {
    script: VecDeque<Step>,
    slots: HashMap<ConnectionId, Session>,
    decisions: Vec<DecisionRecord>,
    protocols: Vec<ProtocolDesc>,
    started: bool,
}

/// Per-connection state the engine owns: the round-tripped slot plus the
/// protocol the connection last dispatched under (used for teardown closes).
#[derive(Debug, Default)]
struct Session {
    protocol: ProtocolId,
    slot: SessionSlot,
}

impl ScriptedEngine {
    /// Create an engine with an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an event for the next service pass.
    ///
    /// Events are replayed in queue order; per-connection ordering is
    /// whatever the script says, exactly like a real engine's poll order.
    pub fn enqueue(&mut self, id: ConnectionId, protocol: ProtocolId, event: Event) {
        self.script.push_back(Step {
            id,
            protocol,
            event,
        });
    }

    /// Decisions recorded so far, in dispatch order.
    pub fn decisions(&self) -> &[DecisionRecord] {
        &self.decisions
    }

    /// Drain the recorded decisions.
    pub fn take_decisions(&mut self) -> Vec<DecisionRecord> {
        std::mem::take(&mut self.decisions)
    }

    /// Protocol descriptors the engine was started with.
    pub fn protocols(&self) -> &[ProtocolDesc] {
        &self.protocols
    }

    /// Connections whose slot currently holds a registered handle.
    pub fn open_connections(&self) -> Vec<ConnectionId> {
        let mut open: Vec<ConnectionId> = self
            .slots
            .iter()
            .filter(|(_, session)| !session.slot.is_empty())
            .map(|(id, _)| *id)
            .collect();
        open.sort();
        open
    }

    fn replay(&mut self, step: Step, sink: &mut dyn EventSink) {
        let session = self.slots.entry(step.id).or_default();
        session.protocol = step.protocol;
        let kind = step.event.kind();
        let decision = sink.dispatch(step.id, &mut session.slot, step.protocol, step.event);
        self.decisions.push(DecisionRecord {
            connection: step.id,
            kind,
            decision,
        });
    }
}

impl Engine for ScriptedEngine {
    fn start(
        &mut self,
        _config: &ContextConfig,
        protocols: &[ProtocolDesc],
    ) -> Result<(), EngineError> {
        if self.started {
            return Err(EngineError::AlreadyStarted);
        }
        self.protocols = protocols.to_vec();
        self.started = true;
        Ok(())
    }

    fn service(
        &mut self,
        sink: &mut dyn EventSink,
        _timeout: Option<Duration>,
    ) -> Result<usize, EngineError> {
        if !self.started {
            return Err(EngineError::NotStarted);
        }
        let mut dispatched = 0;
        while let Some(step) = self.script.pop_front() {
            self.replay(step, sink);
            dispatched += 1;
        }
        Ok(dispatched)
    }

    fn shutdown(&mut self, sink: &mut dyn EventSink) {
        // Whatever the script never closed gets a closed event now, the
        // way a real engine delivers closes during teardown.
        for id in self.open_connections() {
            let protocol = self.slots[&id].protocol;
            self.replay(
                Step {
                    id,
                    protocol,
                    event: Event::Closed,
                },
                sink,
            );
        }
        self.script.clear();
        self.slots.clear();
        self.started = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sink that continues on everything and counts dispatches.
    #[derive(Default)]
    struct CountingSink {
        seen: Vec<EventKind>,
    }

    impl EventSink for CountingSink {
        fn dispatch(
            &mut self,
            _id: ConnectionId,
            _slot: &mut SessionSlot,
            _protocol: ProtocolId,
            event: Event,
        ) -> Decision {
            self.seen.push(event.kind());
            Decision::Continue
        }
    }

    fn started() -> ScriptedEngine {
        let mut engine = ScriptedEngine::new();
        engine
            .start(
                &ContextConfig::default(),
                &[ProtocolDesc {
                    name: "echo".to_string(),
                    id: ProtocolId::new(0),
                }],
            )
            .unwrap();
        engine
    }

    #[test]
    fn test_service_before_start_fails() {
        let mut engine = ScriptedEngine::new();
        let mut sink = CountingSink::default();
        assert!(matches!(
            engine.service(&mut sink, None),
            Err(EngineError::NotStarted)
        ));
    }

    #[test]
    fn test_double_start_fails() {
        let mut engine = started();
        assert!(matches!(
            engine.start(&ContextConfig::default(), &[]),
            Err(EngineError::AlreadyStarted)
        ));
    }

    #[test]
    fn test_service_drains_script_in_order() {
        let mut engine = started();
        let id = ConnectionId::new(1);
        engine.enqueue(id, ProtocolId::new(0), Event::Established);
        engine.enqueue(id, ProtocolId::new(0), Event::Receive("hi".into()));
        engine.enqueue(id, ProtocolId::new(0), Event::Closed);

        let mut sink = CountingSink::default();
        let dispatched = engine.service(&mut sink, None).unwrap();
        assert_eq!(dispatched, 3);
        assert_eq!(
            sink.seen,
            vec![EventKind::Established, EventKind::Receive, EventKind::Closed]
        );

        // Nothing left for the next pass.
        assert_eq!(engine.service(&mut sink, None).unwrap(), 0);
    }

    #[test]
    fn test_decisions_recorded() {
        let mut engine = started();
        engine.enqueue(ConnectionId::new(9), ProtocolId::new(0), Event::Established);
        let mut sink = CountingSink::default();
        engine.service(&mut sink, None).unwrap();

        let records = engine.take_decisions();
        assert_eq!(
            records,
            vec![DecisionRecord {
                connection: ConnectionId::new(9),
                kind: EventKind::Established,
                decision: Decision::Continue,
            }]
        );
        assert!(engine.decisions().is_empty());
    }

    #[test]
    fn test_slots_round_trip_per_connection() {
        // The sink registers into the slot on established; the engine must
        // hand the same slot back on the next event for that connection.
        struct RegisteringSink;
        impl EventSink for RegisteringSink {
            fn dispatch(
                &mut self,
                id: ConnectionId,
                slot: &mut SessionSlot,
                _protocol: ProtocolId,
                event: Event,
            ) -> Decision {
                match event {
                    Event::Established => {
                        let mut registry = crate::registry::HandleRegistry::new();
                        registry.establish(slot, id, "echo".into());
                    }
                    Event::Receive(_) => {
                        assert!(!slot.is_empty(), "slot lost between events");
                    }
                    _ => {}
                }
                Decision::Continue
            }
        }

        let mut engine = started();
        let id = ConnectionId::new(3);
        engine.enqueue(id, ProtocolId::new(0), Event::Established);
        engine.enqueue(id, ProtocolId::new(0), Event::Receive("x".into()));
        engine.service(&mut RegisteringSink, None).unwrap();
        assert_eq!(engine.open_connections(), vec![id]);
    }

    #[test]
    fn test_shutdown_closes_open_connections() {
        struct TrackingSink {
            registry: crate::registry::HandleRegistry,
            closed: Vec<ConnectionId>,
        }
        impl EventSink for TrackingSink {
            fn dispatch(
                &mut self,
                id: ConnectionId,
                slot: &mut SessionSlot,
                _protocol: ProtocolId,
                event: Event,
            ) -> Decision {
                match event {
                    Event::Established => {
                        self.registry.establish(slot, id, "echo".into());
                    }
                    Event::Closed => {
                        self.registry.release(slot);
                        self.closed.push(id);
                    }
                    _ => {}
                }
                Decision::Continue
            }
        }

        let mut engine = started();
        engine.enqueue(ConnectionId::new(1), ProtocolId::new(0), Event::Established);
        engine.enqueue(ConnectionId::new(2), ProtocolId::new(0), Event::Established);
        engine.enqueue(ConnectionId::new(1), ProtocolId::new(0), Event::Closed);

        let mut sink = TrackingSink {
            registry: crate::registry::HandleRegistry::new(),
            closed: Vec::new(),
        };
        engine.service(&mut sink, None).unwrap();
        assert_eq!(engine.open_connections(), vec![ConnectionId::new(2)]);

        engine.shutdown(&mut sink);
        assert_eq!(sink.closed, vec![ConnectionId::new(1), ConnectionId::new(2)]);
        assert_eq!(sink.registry.live(), 0);
        assert!(engine.open_connections().is_empty());
    }
}
