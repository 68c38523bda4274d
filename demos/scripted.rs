//! Bridge walkthrough without sockets.
//!
//! Queues a connection lifecycle on the scripted engine and prints the
//! decision the bridge returned for every event, including a handler
//! failure contained as a reject.

use bytes::Bytes;
use wsbridge::engine::scripted::ScriptedEngine;
use wsbridge::event::{Decision, Event};
use wsbridge::{ConnectionId, ContextBuilder, ProtocolId};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().init();

    let mut engine = ScriptedEngine::new();
    let id = ConnectionId::new(7);
    let slot = ProtocolId::new(0);
    engine.enqueue(id, slot, Event::Established);
    engine.enqueue(id, slot, Event::Receive(Bytes::from_static(b"ping")));
    engine.enqueue(id, slot, Event::Receive(Bytes::from_static(b"fail")));
    engine.enqueue(id, slot, Event::Closed);

    let mut context = ContextBuilder::new()
        .protocol("echo", |conn, event| {
            if let Event::Receive(payload) = event {
                if payload.as_ref() == b"fail" {
                    return Err("simulated handler failure".into());
                }
                let conn = conn.map(|c| c.id().to_string());
                println!(
                    "handler: receive {:?} on {}",
                    String::from_utf8_lossy(payload),
                    conn.as_deref().unwrap_or("<empty>")
                );
            }
            Ok(Decision::Continue)
        })
        .build(engine)?;

    let dispatched = context.run_iteration(None)?;
    println!("dispatched {dispatched} events");

    for record in context.engine_mut().take_decisions() {
        println!(
            "engine saw: {} on connection {} -> {:?}",
            record.kind, record.connection, record.decision
        );
    }
    for fault in context.take_faults() {
        println!(
            "fault: protocol={} kind={} message={}",
            fault.protocol, fault.kind, fault.message
        );
    }

    println!("live connections: {}", context.live_connections());
    context.destroy();
    Ok(())
}
