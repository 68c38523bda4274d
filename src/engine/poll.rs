//! Real server engine: mio poll loop, tungstenite framing, optional rustls.
//!
//! The poll engine accepts WebSocket connections on a nonblocking listener,
//! drives handshakes and reads from poll readiness, and reports everything
//! it learns through the sink: `Established` once the handshake completes,
//! `Receive` per data message, `Closed` when the peer goes away, plus
//! `PollAdd`/`PollRemove`/`PollSetMode`/`PollClearMode` mirroring its own
//! poll-set churn so handlers observe descriptor bookkeeping.
//!
//! Subprotocol negotiation picks the first `Sec-WebSocket-Protocol` offer
//! matching the table; a connection that offers nothing usable lands on
//! slot 0. Ping frames are answered with Pong at this layer; handlers never
//! see them.
//!
//! Connections the sink rejects (on `Established` or `Receive`) are closed.
//! Outbound connects are not provided; this engine only serves.

use std::collections::HashMap;
use std::fs;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use rustls::{ServerConfig, ServerConnection, StreamOwned};
use tungstenite::handshake::server::{ErrorResponse, Request, Response, ServerHandshake};
use tungstenite::handshake::{HandshakeError, MidHandshake};
use tungstenite::http::HeaderValue;
use tungstenite::{Message, WebSocket};

use crate::config::{options, ContextConfig, TlsConfig};
use crate::connection::ConnectionId;
use crate::engine::{Engine, EngineError, EventSink, ProtocolDesc};
use crate::event::{poll_mask, Event};
use crate::protocol::ProtocolId;
use crate::registry::SessionSlot;

const LISTENER: Token = Token(0);
const EVENTS_CAPACITY: usize = 128;
const LISTEN_BACKLOG: i32 = 128;

/// Byte stream under the WebSocket layer: plain TCP or TLS-wrapped.
enum Transport {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ServerConnection, TcpStream>>),
}

impl Transport {
    fn socket_mut(&mut self) -> &mut TcpStream {
        match self {
            Transport::Plain(stream) => stream,
            Transport::Tls(tls) => &mut tls.sock,
        }
    }

    fn raw_fd(&self) -> i32 {
        match self {
            Transport::Plain(stream) => stream.as_raw_fd(),
            Transport::Tls(tls) => tls.sock.as_raw_fd(),
        }
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.read(buf),
            Transport::Tls(tls) => tls.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.write(buf),
            Transport::Tls(tls) => tls.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(stream) => stream.flush(),
            Transport::Tls(tls) => tls.flush(),
        }
    }
}

/// Handshake callback matching client subprotocol offers against the table.
///
/// The selection is reported through a shared cell because the callback is
/// consumed by the handshake machine while the session keeps dispatching.
struct Negotiation {
    protocols: Arc<[ProtocolDesc]>,
    selected: Arc<Mutex<Option<ProtocolId>>>,
}

impl tungstenite::handshake::server::Callback for Negotiation {
    fn on_request(
        self,
        request: &Request,
        mut response: Response,
    ) -> std::result::Result<Response, ErrorResponse> {
        let offer = request
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|value| value.to_str().ok());
        if let Some(offer) = offer {
            for name in offer.split(',').map(str::trim) {
                if let Some(desc) = self.protocols.iter().find(|desc| desc.name == name) {
                    if let Ok(value) = HeaderValue::from_str(name) {
                        *self.selected.lock().unwrap() = Some(desc.id);
                        response
                            .headers_mut()
                            .append("Sec-WebSocket-Protocol", value);
                    }
                    break;
                }
            }
        }
        Ok(response)
    }
}

enum SessionState {
    Handshaking(MidHandshake<ServerHandshake<Transport, Negotiation>>),
    Open(WebSocket<Transport>),
    /// Stream consumed by a failed handshake; nothing left to deregister.
    Gone,
}

struct Session {
    id: ConnectionId,
    fd: i32,
    protocol: ProtocolId,
    selected: Arc<Mutex<Option<ProtocolId>>>,
    slot: SessionSlot,
    /// Poll interest currently includes WRITABLE (a flush is pending).
    write_interest: bool,
    state: SessionState,
}

/// mio + tungstenite server engine. Unix only.
pub struct PollEngine {
    poll: Option<Poll>,
    events: Events,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    tls: Option<Arc<ServerConfig>>,
    protocols: Arc<[ProtocolDesc]>,
    nodelay: bool,
    sessions: HashMap<Token, Session>,
    next_token: usize,
    next_id: u64,
    dispatched: usize,
}

impl PollEngine {
    /// Create an engine; it binds nothing until `start`.
    pub fn new() -> Self {
        Self {
            poll: None,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listener: None,
            local_addr: None,
            tls: None,
            protocols: Arc::from(Vec::new()),
            nodelay: false,
            sessions: HashMap::new(),
            next_token: 1,
            next_id: 1,
            dispatched: 0,
        }
    }

    /// The bound listen address, once started. With port 0 this reports
    /// the ephemeral port the kernel picked.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of sessions currently tracked (handshaking or open).
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn bind_listener(config: &ContextConfig) -> Result<TcpListener, EngineError> {
        let interface = config.interface.as_deref().unwrap_or("0.0.0.0");
        let addr: SocketAddr = format!("{}:{}", interface, config.port)
            .parse()
            .map_err(|_| EngineError::Unsupported(format!("bad bind interface {interface:?}")))?;

        let socket = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        if options::has(config.options, options::REUSE_ADDR) {
            socket.set_reuse_address(true)?;
        }
        socket
            .bind(&addr.into())
            .map_err(|source| EngineError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        socket.listen(LISTEN_BACKLOG)?;
        socket.set_nonblocking(true)?;

        Ok(TcpListener::from_std(socket.into()))
    }

    fn load_tls(tls: &TlsConfig) -> Result<Arc<ServerConfig>, EngineError> {
        let cert_pem = fs::read(&tls.cert_path)
            .map_err(|err| EngineError::Tls(format!("read {}: {err}", tls.cert_path.display())))?;
        let key_pem = fs::read(&tls.key_path)
            .map_err(|err| EngineError::Tls(format!("read {}: {err}", tls.key_path.display())))?;

        let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|err| EngineError::Tls(format!("parse certificate PEM: {err}")))?;
        if certs.is_empty() {
            return Err(EngineError::Tls("no certificates in PEM".to_string()));
        }
        let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
            .map_err(|err| EngineError::Tls(format!("parse private key PEM: {err}")))?
            .ok_or_else(|| EngineError::Tls("no private key in PEM".to_string()))?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|err| EngineError::Tls(err.to_string()))?;
        Ok(Arc::new(config))
    }

    #[allow(unsafe_code)]
    fn drop_privileges(config: &ContextConfig) -> Result<(), EngineError> {
        // Group first; dropping uid first would lose the right to setgid.
        if let Some(gid) = config.gid {
            // SAFETY: plain syscall, no pointers involved.
            if unsafe { libc::setgid(gid) } != 0 {
                return Err(EngineError::Io(io::Error::last_os_error()));
            }
        }
        if let Some(uid) = config.uid {
            // SAFETY: plain syscall, no pointers involved.
            if unsafe { libc::setuid(uid) } != 0 {
                return Err(EngineError::Io(io::Error::last_os_error()));
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, sink: &mut dyn EventSink, token: Token, event: Event) {
        if let Some(session) = self.sessions.get_mut(&token) {
            self.dispatched += 1;
            sink.dispatch(session.id, &mut session.slot, session.protocol, event);
        }
    }

    /// Dispatch and honor the decision: true means the engine may proceed.
    fn dispatch_gated(&mut self, sink: &mut dyn EventSink, token: Token, event: Event) -> bool {
        match self.sessions.get_mut(&token) {
            Some(session) => {
                self.dispatched += 1;
                sink.dispatch(session.id, &mut session.slot, session.protocol, event)
                    .is_continue()
            }
            None => false,
        }
    }

    fn accept_pending(&mut self, sink: &mut dyn EventSink) {
        loop {
            let accepted = match self.listener.as_ref() {
                Some(listener) => listener.accept(),
                None => return,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    return;
                }
            };
            if self.nodelay {
                if let Err(err) = stream.set_nodelay(true) {
                    tracing::warn!(error = %err, "set_nodelay failed");
                }
            }

            let token = Token(self.next_token);
            self.next_token += 1;
            let id = ConnectionId::new(self.next_id);
            self.next_id += 1;

            let mut transport = match &self.tls {
                Some(config) => match ServerConnection::new(config.clone()) {
                    Ok(conn) => Transport::Tls(Box::new(StreamOwned::new(conn, stream))),
                    Err(err) => {
                        tracing::warn!(error = %err, "TLS session setup failed");
                        continue;
                    }
                },
                None => Transport::Plain(stream),
            };
            let fd = transport.raw_fd();

            let registered = match self.poll.as_ref() {
                Some(poll) => {
                    poll.registry()
                        .register(transport.socket_mut(), token, Interest::READABLE)
                }
                None => return,
            };
            if let Err(err) = registered {
                tracing::warn!(error = %err, "poll register failed");
                continue;
            }

            tracing::debug!(connection = %id, peer = %peer, fd, "accepted");

            let selected = Arc::new(Mutex::new(None));
            let callback = Negotiation {
                protocols: self.protocols.clone(),
                selected: selected.clone(),
            };
            let state = match tungstenite::accept_hdr(transport, callback) {
                Ok(ws) => SessionState::Open(ws),
                Err(HandshakeError::Interrupted(mid)) => SessionState::Handshaking(mid),
                Err(HandshakeError::Failure(err)) => {
                    tracing::debug!(connection = %id, error = %err, "handshake failed");
                    continue;
                }
            };
            let completed = matches!(state, SessionState::Open(_));

            self.sessions.insert(
                token,
                Session {
                    id,
                    fd,
                    protocol: ProtocolId::new(0),
                    selected,
                    slot: SessionSlot::new(),
                    write_interest: false,
                    state,
                },
            );

            self.dispatch(sink, token, Event::PollAdd { fd });
            if completed {
                self.on_established(sink, token);
            }
        }
    }

    fn on_established(&mut self, sink: &mut dyn EventSink, token: Token) {
        if let Some(session) = self.sessions.get_mut(&token) {
            if let Some(selected) = *session.selected.lock().unwrap() {
                session.protocol = selected;
            }
        }
        if !self.dispatch_gated(sink, token, Event::Established) {
            tracing::debug!("connection rejected at establishment");
            self.start_close(sink, token);
        }
    }

    fn drive_session(&mut self, sink: &mut dyn EventSink, token: Token, writable: bool) {
        let Some(session) = self.sessions.get_mut(&token) else {
            return;
        };

        match std::mem::replace(&mut session.state, SessionState::Gone) {
            SessionState::Handshaking(mid) => match mid.handshake() {
                Ok(ws) => {
                    session.state = SessionState::Open(ws);
                    self.on_established(sink, token);
                    // Drain anything the handshake left buffered.
                    self.read_session(sink, token, false);
                }
                Err(HandshakeError::Interrupted(mid)) => {
                    session.state = SessionState::Handshaking(mid);
                }
                Err(HandshakeError::Failure(err)) => {
                    tracing::debug!(connection = %session.id, error = %err, "handshake failed");
                    self.close_session(sink, token, true);
                }
            },
            SessionState::Open(ws) => {
                session.state = SessionState::Open(ws);
                self.read_session(sink, token, writable);
            }
            SessionState::Gone => {}
        }
    }

    fn read_session(&mut self, sink: &mut dyn EventSink, token: Token, writable: bool) {
        if writable {
            self.flush_session(sink, token);
        }
        loop {
            let Some(session) = self.sessions.get_mut(&token) else {
                return;
            };
            let SessionState::Open(ws) = &mut session.state else {
                return;
            };

            match ws.read() {
                Ok(Message::Binary(payload)) => {
                    if !self.dispatch_gated(sink, token, Event::Receive(payload)) {
                        self.start_close(sink, token);
                        return;
                    }
                }
                Ok(Message::Text(text)) => {
                    let payload = bytes::Bytes::from(text);
                    if !self.dispatch_gated(sink, token, Event::Receive(payload)) {
                        self.start_close(sink, token);
                        return;
                    }
                }
                Ok(Message::Ping(payload)) => {
                    if let Err(err) = ws.send(Message::Pong(payload)) {
                        if is_would_block(&err) {
                            self.want_write(sink, token);
                        } else {
                            tracing::debug!(error = %err, "pong failed");
                            self.close_session(sink, token, true);
                            return;
                        }
                    }
                }
                Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
                Ok(Message::Close(_)) => {
                    self.close_session(sink, token, true);
                    return;
                }
                Err(tungstenite::Error::Io(err)) if err.kind() == ErrorKind::WouldBlock => {
                    return;
                }
                Err(tungstenite::Error::ConnectionClosed)
                | Err(tungstenite::Error::AlreadyClosed) => {
                    self.close_session(sink, token, true);
                    return;
                }
                Err(err) => {
                    tracing::debug!(error = %err, "read failed");
                    self.close_session(sink, token, true);
                    return;
                }
            }
        }
    }

    /// Engine-initiated close of a rejected connection: best-effort close
    /// frame, then teardown.
    fn start_close(&mut self, sink: &mut dyn EventSink, token: Token) {
        if let Some(session) = self.sessions.get_mut(&token) {
            if let SessionState::Open(ws) = &mut session.state {
                let _ = ws.close(None);
                let _ = ws.flush();
            }
        }
        self.close_session(sink, token, true);
    }

    /// Flush pending writes; clears WRITABLE interest once drained.
    fn flush_session(&mut self, sink: &mut dyn EventSink, token: Token) {
        let Some(session) = self.sessions.get_mut(&token) else {
            return;
        };
        if !session.write_interest {
            return;
        }
        let fd = session.fd;
        let SessionState::Open(ws) = &mut session.state else {
            return;
        };
        match ws.flush() {
            Ok(()) => {
                session.write_interest = false;
                if let Some(poll) = self.poll.as_ref() {
                    if let Err(err) = poll.registry().reregister(
                        ws.get_mut().socket_mut(),
                        token,
                        Interest::READABLE,
                    ) {
                        tracing::warn!(error = %err, "reregister failed");
                    }
                }
                self.dispatch(
                    sink,
                    token,
                    Event::PollClearMode {
                        fd,
                        mask: poll_mask::OUT,
                    },
                );
            }
            Err(tungstenite::Error::Io(err)) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) => {
                tracing::debug!(error = %err, "flush failed");
                self.close_session(sink, token, true);
            }
        }
    }

    /// Add WRITABLE interest so a pending write can complete later.
    fn want_write(&mut self, sink: &mut dyn EventSink, token: Token) {
        let Some(session) = self.sessions.get_mut(&token) else {
            return;
        };
        if session.write_interest {
            return;
        }
        session.write_interest = true;
        let fd = session.fd;
        let SessionState::Open(ws) = &mut session.state else {
            return;
        };
        if let Some(poll) = self.poll.as_ref() {
            if let Err(err) = poll.registry().reregister(
                ws.get_mut().socket_mut(),
                token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                tracing::warn!(error = %err, "reregister failed");
            }
        }
        self.dispatch(
            sink,
            token,
            Event::PollSetMode {
                fd,
                mask: poll_mask::OUT,
            },
        );
    }

    /// Tear one session down: report poll removal (and the close, unless
    /// the handshake never completed into a stream), deregister, drop.
    fn close_session(&mut self, sink: &mut dyn EventSink, token: Token, report_close: bool) {
        if !self.sessions.contains_key(&token) {
            return;
        }
        let fd = self.sessions[&token].fd;
        let id = self.sessions[&token].id;
        self.dispatch(sink, token, Event::PollRemove { fd });
        if report_close {
            self.dispatch(sink, token, Event::Closed);
        }

        let Some(mut session) = self.sessions.remove(&token) else {
            return;
        };
        let socket = match &mut session.state {
            SessionState::Open(ws) => Some(ws.get_mut().socket_mut()),
            SessionState::Handshaking(mid) => Some(mid.get_mut().get_mut().socket_mut()),
            SessionState::Gone => None,
        };
        if let (Some(poll), Some(socket)) = (self.poll.as_ref(), socket) {
            if let Err(err) = poll.registry().deregister(socket) {
                tracing::debug!(error = %err, "deregister failed");
            }
        }
        tracing::debug!(connection = %id, fd, "session closed");
    }
}

impl Default for PollEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for PollEngine {
    fn start(
        &mut self,
        config: &ContextConfig,
        protocols: &[ProtocolDesc],
    ) -> Result<(), EngineError> {
        if self.poll.is_some() {
            return Err(EngineError::AlreadyStarted);
        }
        if !config.extensions.is_empty() {
            tracing::debug!(
                extensions = ?config.extensions,
                "extensions not supported by the poll engine, ignoring"
            );
        }

        let tls = config.tls.as_ref().map(Self::load_tls).transpose()?;
        let mut listener = Self::bind_listener(config)?;
        let local_addr = listener.local_addr()?;
        Self::drop_privileges(config)?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        tracing::debug!(addr = %local_addr, tls = tls.is_some(), "listening");
        self.tls = tls;
        self.listener = Some(listener);
        self.local_addr = Some(local_addr);
        self.protocols = Arc::from(protocols.to_vec());
        self.nodelay = options::has(config.options, options::TCP_NODELAY);
        self.poll = Some(poll);
        Ok(())
    }

    fn service(
        &mut self,
        sink: &mut dyn EventSink,
        timeout: Option<Duration>,
    ) -> Result<usize, EngineError> {
        let Some(poll) = self.poll.as_mut() else {
            return Err(EngineError::NotStarted);
        };
        match poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => return Ok(0),
            Err(err) => return Err(EngineError::Io(err)),
        }

        let ready: Vec<(Token, bool)> = self
            .events
            .iter()
            .map(|event| (event.token(), event.is_writable()))
            .collect();

        self.dispatched = 0;
        for (token, writable) in ready {
            if token == LISTENER {
                self.accept_pending(sink);
            } else {
                self.drive_session(sink, token, writable);
            }
        }
        Ok(self.dispatched)
    }

    fn shutdown(&mut self, sink: &mut dyn EventSink) {
        let tokens: Vec<Token> = self.sessions.keys().copied().collect();
        for token in tokens {
            self.start_close(sink, token);
        }
        if let (Some(poll), Some(listener)) = (self.poll.as_ref(), self.listener.as_mut()) {
            let _ = poll.registry().deregister(listener);
        }
        self.listener = None;
        self.local_addr = None;
        self.tls = None;
        self.poll = None;
        tracing::debug!("poll engine shut down");
    }
}

fn is_would_block(err: &tungstenite::Error) -> bool {
    matches!(err, tungstenite::Error::Io(io) if io.kind() == ErrorKind::WouldBlock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Decision;

    struct NullSink;

    impl EventSink for NullSink {
        fn dispatch(
            &mut self,
            _id: ConnectionId,
            _slot: &mut SessionSlot,
            _protocol: ProtocolId,
            _event: Event,
        ) -> Decision {
            Decision::Continue
        }
    }

    fn descs() -> Vec<ProtocolDesc> {
        vec![ProtocolDesc {
            name: "echo".to_string(),
            id: ProtocolId::new(0),
        }]
    }

    #[test]
    fn test_start_binds_ephemeral_port() {
        let mut engine = PollEngine::new();
        engine.start(&ContextConfig::default(), &descs()).unwrap();
        let addr = engine.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(matches!(
            engine.start(&ContextConfig::default(), &descs()),
            Err(EngineError::AlreadyStarted)
        ));
        engine.shutdown(&mut NullSink);
        assert!(engine.local_addr().is_none());
    }

    #[test]
    fn test_bad_interface_is_unsupported() {
        let mut engine = PollEngine::new();
        let config = ContextConfig {
            interface: Some("not-an-address".to_string()),
            ..ContextConfig::default()
        };
        assert!(matches!(
            engine.start(&config, &descs()),
            Err(EngineError::Unsupported(_))
        ));
    }

    #[test]
    fn test_missing_tls_material_fails() {
        let mut engine = PollEngine::new();
        let config = ContextConfig {
            tls: Some(TlsConfig {
                cert_path: "/nonexistent/cert.pem".into(),
                key_path: "/nonexistent/key.pem".into(),
            }),
            ..ContextConfig::default()
        };
        assert!(matches!(
            engine.start(&config, &descs()),
            Err(EngineError::Tls(_))
        ));
    }

    #[test]
    fn test_service_before_start_fails() {
        let mut engine = PollEngine::new();
        assert!(matches!(
            engine.service(&mut NullSink, Some(Duration::from_millis(1))),
            Err(EngineError::NotStarted)
        ));
    }

    #[test]
    fn test_empty_service_pass_dispatches_nothing() {
        let mut engine = PollEngine::new();
        engine.start(&ContextConfig::default(), &descs()).unwrap();
        let dispatched = engine
            .service(&mut NullSink, Some(Duration::from_millis(1)))
            .unwrap();
        assert_eq!(dispatched, 0);
        assert_eq!(engine.session_count(), 0);
    }
}
