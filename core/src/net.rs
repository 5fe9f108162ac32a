//! Network layer seam
//!
//! The router core does not send or receive messages itself. It asks the
//! surrounding transport to resolve peers, bind receive buffers to an event
//! queue, issue one-shot GETs and unlink buffers; completions come back as
//! [`NetEvent`]s on an [`EventSink`].

use crate::nid::Nid;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetError {
    #[error("Peer unreachable")]
    Unreachable,
    #[error("Out of network resources")]
    NoResources,
    #[error("Invalid buffer handle")]
    InvalidHandle,
    #[error("Network operation failed: {0}")]
    Failed(i32),
}

/// Opaque handle of a receive buffer bound to an event queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u64);

impl std::fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "md#{}", self.0)
    }
}

// ============================================================================
// EVENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetEventKind {
    /// The GET request left (or failed to leave) this node
    Send,
    /// A reply landed in the bound buffer
    Reply,
    /// The buffer is no longer bound; no further events will reference it
    Unlink,
}

/// Completion delivered for a bound buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetEvent {
    pub handle: BufferHandle,
    pub kind: NetEventKind,
    /// Target of the request the event belongs to
    pub peer: Nid,
    pub status: Result<(), NetError>,
    /// Received bytes; empty for anything but a reply
    pub payload: Vec<u8>,
}

impl NetEvent {
    pub fn sent(handle: BufferHandle, peer: Nid, status: Result<(), NetError>) -> Self {
        Self {
            handle,
            kind: NetEventKind::Send,
            peer,
            status,
            payload: Vec::new(),
        }
    }

    pub fn reply(handle: BufferHandle, peer: Nid, payload: Vec<u8>) -> Self {
        Self {
            handle,
            kind: NetEventKind::Reply,
            peer,
            status: Ok(()),
            payload,
        }
    }

    pub fn unlinked(handle: BufferHandle) -> Self {
        Self {
            handle,
            kind: NetEventKind::Unlink,
            peer: Nid::ANY,
            status: Ok(()),
            payload: Vec::new(),
        }
    }
}

/// Event queue a bound buffer reports into
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<NetEvent>,
}

impl EventSink {
    /// Create a sink and the receiving end drained by the router checker
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<NetEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue an event. Returns false once the queue has been torn down.
    pub fn deliver(&self, event: NetEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

// ============================================================================
// COLLABORATOR TRAITS
// ============================================================================

/// Interface driver callback for peer liveness changes
#[cfg_attr(test, mockall::automock)]
pub trait InterfaceDriver: Send + Sync {
    /// `peer`, reached through local interface `ni`, is now `alive`
    fn notify(&self, ni: Nid, peer: Nid, alive: bool);
}

/// Operations the router core needs from the transport
pub trait NetworkLayer: Send + Sync {
    /// NIDs of the local interfaces
    fn interfaces(&self) -> Vec<Nid>;

    /// Local interface through which `peer` is reached, `None` if unreachable
    fn resolve(&self, peer: Nid) -> Option<Nid>;

    /// Driver owning local interface `ni`
    fn driver(&self, ni: Nid) -> Option<Arc<dyn InterfaceDriver>>;

    /// Bind a `len`-byte receive buffer whose completions go to `sink`
    fn bind(&self, len: usize, sink: EventSink) -> Result<BufferHandle, NetError>;

    /// Request unlink; completion arrives later as an [`NetEventKind::Unlink`] event
    fn unlink(&self, handle: BufferHandle) -> Result<(), NetError>;

    /// Issue an unreliable one-shot GET from `target` into the buffer
    fn get(&self, handle: BufferHandle, target: Nid) -> Result<(), NetError>;
}
