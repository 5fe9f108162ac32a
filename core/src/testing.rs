//! Test doubles for the network layer and interface drivers

use crate::net::{BufferHandle, EventSink, InterfaceDriver, NetError, NetEvent, NetworkLayer};
use crate::nid::Nid;
use crate::ping::{ByteOrder, NiState, NiStatus, PingInfo, PING_VERSION_2};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub use crate::clock::ManualClock;

/// How the fake network answers a GET to one target
#[derive(Debug, Clone)]
pub enum ReplyMode {
    /// Reply with this ping info
    Ping(PingInfo),
    /// Reply with raw bytes
    Payload(Vec<u8>),
    /// Send completes, no reply ever arrives
    Silent,
    /// The send itself fails
    SendFails,
    /// `get` returns an error, no events
    GetFails,
}

#[derive(Default)]
struct FakeState {
    interfaces: Vec<Nid>,
    unreachable: HashSet<Nid>,
    drivers: HashMap<Nid, Arc<dyn InterfaceDriver>>,
    replies: HashMap<Nid, ReplyMode>,
    bound: HashMap<BufferHandle, EventSink>,
    next_handle: u64,
    defer_unlinks: bool,
    fail_unlinks: bool,
    deferred: Vec<BufferHandle>,
    hold_events: bool,
    held: Vec<(EventSink, NetEvent)>,
    gets: Vec<(BufferHandle, Nid)>,
}

/// Scriptable in-memory network layer
///
/// Peers are reachable through the local interface on their network.
/// Events are delivered synchronously from within `get` and `unlink`, unless
/// send and reply completions are being held.
pub struct FakeNetwork {
    state: Mutex<FakeState>,
}

impl FakeNetwork {
    pub fn new(interfaces: &[Nid]) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState {
                interfaces: interfaces.to_vec(),
                next_handle: 1,
                ..Default::default()
            }),
        })
    }

    pub fn set_driver(&self, ni: Nid, driver: Arc<dyn InterfaceDriver>) {
        self.state.lock().drivers.insert(ni, driver);
    }

    pub fn set_reply(&self, target: Nid, mode: ReplyMode) {
        self.state.lock().replies.insert(target, mode);
    }

    pub fn set_unreachable(&self, peer: Nid) {
        self.state.lock().unreachable.insert(peer);
    }

    /// Hold unlink completions until [`FakeNetwork::complete_unlinks`]
    pub fn defer_unlinks(&self, defer: bool) {
        self.state.lock().defer_unlinks = defer;
    }

    /// Make `unlink` fail outright
    pub fn fail_unlinks(&self, fail: bool) {
        self.state.lock().fail_unlinks = fail;
    }

    /// Hold send and reply completions until [`FakeNetwork::release_events`]
    pub fn hold_events(&self, hold: bool) {
        self.state.lock().hold_events = hold;
    }

    /// Deliver every held send and reply completion, even to buffers that
    /// have since been unlinked
    pub fn release_events(&self) {
        let held = std::mem::take(&mut self.state.lock().held);
        for (sink, event) in held {
            sink.deliver(event);
        }
    }

    /// Deliver every held unlink completion
    pub fn complete_unlinks(&self) {
        let mut state = self.state.lock();
        let deferred = std::mem::take(&mut state.deferred);
        for handle in deferred {
            if let Some(sink) = state.bound.remove(&handle) {
                sink.deliver(NetEvent::unlinked(handle));
            }
        }
    }

    /// GETs issued so far
    pub fn gets(&self) -> Vec<(BufferHandle, Nid)> {
        self.state.lock().gets.clone()
    }

    /// GETs issued to `target`
    pub fn gets_to(&self, target: Nid) -> usize {
        self.state.lock().gets.iter().filter(|(_, t)| *t == target).count()
    }

    /// Buffers still bound
    pub fn bound_count(&self) -> usize {
        self.state.lock().bound.len()
    }

    /// Default answer: the target reports its own interface up
    fn default_reply(target: Nid) -> PingInfo {
        PingInfo::new(PING_VERSION_2, 1, vec![NiStatus::new(target, NiState::Up)])
    }
}

impl NetworkLayer for FakeNetwork {
    fn interfaces(&self) -> Vec<Nid> {
        self.state.lock().interfaces.clone()
    }

    fn resolve(&self, peer: Nid) -> Option<Nid> {
        let state = self.state.lock();
        if state.unreachable.contains(&peer) {
            return None;
        }
        state.interfaces.iter().copied().find(|ni| ni.net() == peer.net())
    }

    fn driver(&self, ni: Nid) -> Option<Arc<dyn InterfaceDriver>> {
        self.state.lock().drivers.get(&ni).cloned()
    }

    fn bind(&self, _len: usize, sink: EventSink) -> Result<BufferHandle, NetError> {
        let mut state = self.state.lock();
        let handle = BufferHandle(state.next_handle);
        state.next_handle += 1;
        state.bound.insert(handle, sink);
        Ok(handle)
    }

    fn unlink(&self, handle: BufferHandle) -> Result<(), NetError> {
        let mut state = self.state.lock();
        if state.fail_unlinks {
            state.bound.remove(&handle);
            return Err(NetError::InvalidHandle);
        }
        if !state.bound.contains_key(&handle) {
            return Err(NetError::InvalidHandle);
        }
        if state.defer_unlinks {
            state.deferred.push(handle);
            return Ok(());
        }
        if let Some(sink) = state.bound.remove(&handle) {
            sink.deliver(NetEvent::unlinked(handle));
        }
        Ok(())
    }

    fn get(&self, handle: BufferHandle, target: Nid) -> Result<(), NetError> {
        let mut state = self.state.lock();
        state.gets.push((handle, target));

        let mode = state
            .replies
            .get(&target)
            .cloned()
            .unwrap_or_else(|| ReplyMode::Ping(Self::default_reply(target)));
        if let ReplyMode::GetFails = mode {
            return Err(NetError::Unreachable);
        }
        let sink = state.bound.get(&handle).cloned().ok_or(NetError::InvalidHandle)?;

        let events = match mode {
            ReplyMode::Ping(info) => vec![
                NetEvent::sent(handle, target, Ok(())),
                NetEvent::reply(handle, target, info.to_bytes(ByteOrder::Native)),
            ],
            ReplyMode::Payload(bytes) => vec![
                NetEvent::sent(handle, target, Ok(())),
                NetEvent::reply(handle, target, bytes),
            ],
            ReplyMode::Silent => vec![NetEvent::sent(handle, target, Ok(()))],
            ReplyMode::SendFails => vec![NetEvent::sent(handle, target, Err(NetError::Unreachable))],
            ReplyMode::GetFails => Vec::new(),
        };
        for event in events {
            if state.hold_events {
                state.held.push((sink.clone(), event));
            } else {
                sink.deliver(event);
            }
        }
        Ok(())
    }
}

/// Interface driver that records every notification
#[derive(Default)]
pub struct RecordingDriver {
    calls: Mutex<Vec<(Nid, Nid, bool)>>,
}

impl RecordingDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `(ni, peer, alive)` in delivery order
    pub fn calls(&self) -> Vec<(Nid, Nid, bool)> {
        self.calls.lock().clone()
    }

    /// Notifications about `peer`
    pub fn calls_for(&self, peer: Nid) -> Vec<bool> {
        self.calls
            .lock()
            .iter()
            .filter(|(_, p, _)| *p == peer)
            .map(|(_, _, alive)| *alive)
            .collect()
    }
}

impl InterfaceDriver for RecordingDriver {
    fn notify(&self, ni: Nid, peer: Nid, alive: bool) {
        self.calls.lock().push((ni, peer, alive));
    }
}
