//! Routing view of a peer
//!
//! A [`Peer`] is the immutable identity shared by every route through a
//! gateway (one `Arc` clone per route). Its mutable routing fields live in
//! [`PeerRouterState`], owned by the router state and only touched under the
//! router lock.

use crate::clock::Timestamp;
use crate::net::BufferHandle;
use crate::nid::Nid;
use crate::ping::PingInfo;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Peer identity
#[derive(Debug, PartialEq, Eq)]
pub struct Peer {
    /// Peer address
    pub nid: Nid,
    /// Local interface the peer is reached through
    pub ni: Nid,
}

impl Peer {
    pub fn new(nid: Nid, ni: Nid) -> Arc<Self> {
        Arc::new(Self { nid, ni })
    }
}

/// Per-router ping buffer and the last reply it received
#[derive(Debug, Clone, Default)]
pub struct RouterCheckData {
    /// Bound receive buffer; `None` once its unlink has completed
    pub(crate) handle: Option<BufferHandle>,
    /// Most recent successfully parsed reply
    pub ping_info: Option<PingInfo>,
}

impl RouterCheckData {
    pub(crate) fn new(handle: BufferHandle) -> Self {
        Self {
            handle: Some(handle),
            ping_info: None,
        }
    }

    pub fn handle(&self) -> Option<BufferHandle> {
        self.handle
    }

    /// True once the network layer confirmed the unlink
    pub fn is_unlinked(&self) -> bool {
        self.handle.is_none()
    }
}

/// Routing fields of a peer
#[derive(Debug, Clone, Default)]
pub struct PeerRouterState {
    pub alive: bool,
    /// Accepted liveness determinations; 0 means "never determined"
    pub alive_count: u32,
    /// A determination is waiting for delivery to the driver
    pub notify_pending: bool,
    /// The pending determination must reach the driver
    pub notify_to_driver: bool,
    /// A delivery loop is running for this peer
    pub notifying: bool,
    /// Last time traffic was seen from the peer
    pub last_alive: Timestamp,
    /// Timestamp of the newest accepted report
    pub timestamp: Timestamp,
    /// When the last ping was issued
    pub ping_timestamp: Timestamp,
    /// Reply deadline of the outstanding ping, 0 if none
    pub ping_deadline: Timestamp,
    /// A ping was issued and its send completion is still pending
    pub ping_not_sent: bool,
    /// Routes using this peer as their gateway
    pub router_refcount: u32,
    pub rcd: Option<RouterCheckData>,
}

impl PeerRouterState {
    /// Fresh state; `alive` is the assumed initial liveness
    pub fn new(alive: bool, now: Timestamp) -> Self {
        Self {
            alive,
            last_alive: now,
            ..Default::default()
        }
    }

    /// Record a liveness report observed at `when`
    ///
    /// Reports older than the newest accepted one are dropped, as is a repeat
    /// of the current state once it has been determined. Returns true when the
    /// report changed the state and a notification is now pending.
    pub(crate) fn record_liveness(&mut self, nid: Nid, notify_driver: bool, alive: bool, when: Timestamp) -> bool {
        if when < self.timestamp {
            debug!(
                "Out of date report for {}: {} at {} < {}",
                nid,
                if alive { "up" } else { "down" },
                when,
                self.timestamp
            );
            return false;
        }

        self.timestamp = when;
        self.ping_deadline = 0;

        if self.alive_count != 0 && self.alive == alive {
            return false;
        }

        self.alive_count += 1;
        self.alive = alive;
        self.notify_pending = true;
        self.notify_to_driver |= notify_driver;

        // Interface status in the cached reply predates this transition
        if alive {
            if let Some(rcd) = self.rcd.as_mut() {
                rcd.ping_info = None;
            }
        }

        debug!("{} is {} (determination {})", nid, if alive { "up" } else { "down" }, self.alive_count);
        true
    }

    pub fn is_router(&self) -> bool {
        self.router_refcount > 0
    }

    /// Forget the outstanding ping; its completions will be ignored
    pub(crate) fn clear_ping(&mut self) {
        self.ping_not_sent = false;
        self.ping_deadline = 0;
        self.ping_timestamp = 0;
    }
}

/// Peer table entry
#[derive(Debug, Clone)]
pub(crate) struct PeerEntry {
    pub(crate) peer: Arc<Peer>,
    pub(crate) state: PeerRouterState,
}

/// Snapshot of one gateway for listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouterInfo {
    pub nid: Nid,
    pub ni: Nid,
    pub refcount: u32,
    pub alive: bool,
    pub alive_count: u32,
    pub ping_not_sent: bool,
    pub ping_deadline: Timestamp,
    pub has_check_data: bool,
}

impl RouterInfo {
    pub(crate) fn from_entry(entry: &PeerEntry) -> Self {
        Self {
            nid: entry.peer.nid,
            ni: entry.peer.ni,
            refcount: entry.state.router_refcount,
            alive: entry.state.alive,
            alive_count: entry.state.alive_count,
            ping_not_sent: entry.state.ping_not_sent,
            ping_deadline: entry.state.ping_deadline,
            has_check_data: entry.state.rcd.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gw() -> Nid {
        "10.0.0.1@tcp".parse().unwrap()
    }

    #[test]
    fn test_first_report_always_counts() {
        let mut state = PeerRouterState::new(true, 0);
        // same state as assumed, but nothing was determined yet
        assert!(state.record_liveness(gw(), true, true, 10));
        assert_eq!(state.alive_count, 1);
        assert!(state.notify_pending);
        assert!(state.notify_to_driver);
    }

    #[test]
    fn test_out_of_order_report_dropped() {
        let mut state = PeerRouterState::new(true, 0);
        assert!(state.record_liveness(gw(), true, false, 5));
        assert!(!state.record_liveness(gw(), true, true, 3));
        assert!(!state.alive);
        assert_eq!(state.timestamp, 5);
    }

    #[test]
    fn test_repeat_report_refreshes_timestamp_only() {
        let mut state = PeerRouterState::new(true, 0);
        state.record_liveness(gw(), false, false, 5);
        state.notify_pending = false;
        state.ping_deadline = 99;

        assert!(!state.record_liveness(gw(), false, false, 8));
        assert_eq!(state.timestamp, 8);
        assert_eq!(state.ping_deadline, 0);
        assert_eq!(state.alive_count, 1);
        assert!(!state.notify_pending);
    }

    #[test]
    fn test_driver_flag_accumulates() {
        let mut state = PeerRouterState::new(false, 0);
        state.record_liveness(gw(), true, true, 1);
        state.record_liveness(gw(), false, false, 2);
        assert!(state.notify_to_driver);
    }

    #[test]
    fn test_coming_up_invalidates_cached_reply() {
        let mut state = PeerRouterState::new(false, 0);
        state.record_liveness(gw(), true, false, 1);
        state.rcd = Some(RouterCheckData {
            handle: Some(BufferHandle(3)),
            ping_info: Some(PingInfo::new(2, 1, vec![])),
        });

        state.record_liveness(gw(), true, true, 2);
        let rcd = state.rcd.as_ref().unwrap();
        assert!(rcd.ping_info.is_none());
        assert_eq!(rcd.handle(), Some(BufferHandle(3)));
    }
}
