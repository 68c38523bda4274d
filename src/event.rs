//! Engine event reasons and control decisions.
//!
//! Every callback the engine delivers is one [`Event`]: a closed union over
//! reason kinds, each variant carrying exactly the payload fields that
//! reason produces. The bridge answers each dispatch with a [`Decision`]:
//!
//! ```text
//! engine ──(ConnectionId, &mut SessionSlot, ProtocolId, Event)──▶ bridge
//! bridge ◀──────────────────── Decision ────────────────────────
//! ```
//!
//! The integer convention at the engine boundary is 0 = continue, nonzero =
//! reject, and reject is the default whenever a handler fails.

use std::fmt;

use bytes::Bytes;

/// Poll-mask bits for [`Event::PollSetMode`] / [`Event::PollClearMode`].
///
/// Values match the POSIX `POLLIN`/`POLLOUT` bits engines typically report.
pub mod poll_mask {
    /// Readable interest (POLLIN).
    pub const IN: u32 = 0x001;
    /// Writable interest (POLLOUT).
    pub const OUT: u32 = 0x004;

    /// Check if a specific bit is set in a mask.
    #[inline]
    pub fn has(mask: u32, bit: u32) -> bool {
        mask & bit != 0
    }
}

/// One engine event, tagged by reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Server-side connection fully established.
    Established,
    /// Client-side connection fully established.
    ClientEstablished,
    /// Payload received on a server-side connection. Empty bytes mean the
    /// engine reported the reason without payload.
    Receive(Bytes),
    /// Payload received on a client-side connection.
    ClientReceive(Bytes),
    /// HTTP request payload received.
    Http(Bytes),
    /// Connection closed. The registry slot is released before the handler
    /// runs, so the handler observes the connection already deregistered.
    Closed,
    /// Descriptor added to the engine's poll set.
    PollAdd { fd: i32 },
    /// Descriptor removed from the engine's poll set.
    PollRemove { fd: i32 },
    /// Poll interest bits set on a descriptor (see [`poll_mask`]).
    PollSetMode { fd: i32, mask: u32 },
    /// Poll interest bits cleared on a descriptor.
    PollClearMode { fd: i32, mask: u32 },
    /// Any other engine reason, carried by its raw code.
    Other(u32),
}

impl Event {
    /// The fieldless kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Established => EventKind::Established,
            Event::ClientEstablished => EventKind::ClientEstablished,
            Event::Receive(_) => EventKind::Receive,
            Event::ClientReceive(_) => EventKind::ClientReceive,
            Event::Http(_) => EventKind::Http,
            Event::Closed => EventKind::Closed,
            Event::PollAdd { .. } => EventKind::PollAdd,
            Event::PollRemove { .. } => EventKind::PollRemove,
            Event::PollSetMode { .. } => EventKind::PollSetMode,
            Event::PollClearMode { .. } => EventKind::PollClearMode,
            Event::Other(_) => EventKind::Other,
        }
    }

    /// Payload bytes for data-bearing kinds, if non-empty.
    pub fn payload(&self) -> Option<&Bytes> {
        match self {
            Event::Receive(payload) | Event::ClientReceive(payload) | Event::Http(payload)
                if !payload.is_empty() =>
            {
                Some(payload)
            }
            _ => None,
        }
    }
}

/// Fieldless event discriminant, used in logs and fault records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Established,
    ClientEstablished,
    Receive,
    ClientReceive,
    Http,
    Closed,
    PollAdd,
    PollRemove,
    PollSetMode,
    PollClearMode,
    Other,
}

impl EventKind {
    /// Diagnostic code for this kind (0 is reserved for `Other`).
    pub fn code(self) -> u32 {
        match self {
            EventKind::Established => 1,
            EventKind::ClientEstablished => 2,
            EventKind::Receive => 3,
            EventKind::ClientReceive => 4,
            EventKind::Http => 5,
            EventKind::Closed => 6,
            EventKind::PollAdd => 7,
            EventKind::PollRemove => 8,
            EventKind::PollSetMode => 9,
            EventKind::PollClearMode => 10,
            EventKind::Other => 0,
        }
    }

    /// Human-readable kind name.
    pub fn name(self) -> &'static str {
        match self {
            EventKind::Established => "established",
            EventKind::ClientEstablished => "client_established",
            EventKind::Receive => "receive",
            EventKind::ClientReceive => "client_receive",
            EventKind::Http => "http",
            EventKind::Closed => "closed",
            EventKind::PollAdd => "poll_add",
            EventKind::PollRemove => "poll_remove",
            EventKind::PollSetMode => "poll_set_mode",
            EventKind::PollClearMode => "poll_clear_mode",
            EventKind::Other => "other",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Control decision returned to the engine for each dispatched event.
///
/// For reasons that support rejection (connection establishment, data
/// receipt) the engine aborts the operation on [`Decision::Reject`],
/// typically by closing the connection. An explicit [`Decision::Continue`]
/// is the only way to let the operation proceed; handler failures default
/// to reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Allow the operation to proceed.
    Continue,
    /// Abort the operation.
    Reject,
}

impl Decision {
    /// Decode from the engine's integer convention (0 = continue).
    #[inline]
    pub fn from_raw(raw: i32) -> Self {
        if raw == 0 {
            Decision::Continue
        } else {
            Decision::Reject
        }
    }

    /// Encode to the engine's integer convention.
    #[inline]
    pub fn as_raw(self) -> i32 {
        match self {
            Decision::Continue => 0,
            Decision::Reject => 1,
        }
    }

    /// Check if this is the continue decision.
    #[inline]
    pub fn is_continue(self) -> bool {
        matches!(self, Decision::Continue)
    }

    /// Check if this is the reject decision.
    #[inline]
    pub fn is_reject(self) -> bool {
        matches!(self, Decision::Reject)
    }
}
