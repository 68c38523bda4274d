//! Echo protocol server on the poll engine.
//!
//! Serves plaintext WebSocket connections and logs every event the bridge
//! dispatches. Connect with any WebSocket client offering the `echo`
//! subprotocol, e.g.:
//!
//! ```text
//! websocat -H='Sec-WebSocket-Protocol: echo' ws://127.0.0.1:9001/
//! ```
//!
//! The bridge layer carries no send API, so this demo observes rather than
//! echoes payloads back; it rejects any payload starting with `quit` to
//! show decision gating (the engine closes that connection).

use wsbridge::engine::poll::PollEngine;
use wsbridge::event::{Decision, Event};
use wsbridge::ContextBuilder;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .init();

    let port = std::env::args()
        .nth(1)
        .map(|arg| arg.parse())
        .transpose()?
        .unwrap_or(9001);

    let mut context = ContextBuilder::new()
        .port(port)
        .protocol("echo", |conn, event| {
            match (conn, event) {
                (Some(conn), Event::Established) => {
                    tracing::info!(connection = %conn.id(), "established");
                }
                (Some(conn), Event::Receive(payload)) => {
                    tracing::info!(
                        connection = %conn.id(),
                        payload = %String::from_utf8_lossy(payload),
                        "receive"
                    );
                    if payload.starts_with(b"quit") {
                        return Ok(Decision::Reject);
                    }
                }
                (_, Event::Closed) => {
                    tracing::info!("closed");
                }
                _ => {}
            }
            Ok(Decision::Continue)
        })
        .build(PollEngine::new())?;

    tracing::info!(
        addr = %context.engine().local_addr().expect("engine started"),
        "serving"
    );
    loop {
        context.run_iteration(None)?;
        for fault in context.take_faults() {
            tracing::warn!(?fault, "handler fault");
        }
    }
}
