//! Remote network table and router list
//!
//! Both collections carry a version counter bumped on every structural
//! change, so a walk that had to drop the router lock can tell whether its
//! position is still meaningful.

use crate::nid::{NetId, Nid};
use crate::peer::Peer;
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A gateway and its hop count to one remote network
#[derive(Debug, Clone)]
pub struct Route {
    pub gateway: Arc<Peer>,
    pub hops: u32,
}

/// Routes to one remote network
#[derive(Debug, Clone)]
pub struct RemoteNet {
    pub net: NetId,
    pub routes: Vec<Route>,
}

impl RemoteNet {
    fn new(net: NetId) -> Self {
        Self {
            net,
            routes: Vec::new(),
        }
    }

    pub fn has_gateway(&self, gateway: Nid) -> bool {
        self.routes.iter().any(|r| r.gateway.nid == gateway)
    }
}

/// Flattened route for listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteRecord {
    pub net: NetId,
    pub hops: u32,
    pub gateway: Nid,
    pub alive: bool,
}

// ============================================================================
// ROUTE TABLE
// ============================================================================

/// Remote network id -> routes
#[derive(Debug, Default)]
pub struct RouteTable {
    nets: BTreeMap<NetId, RemoteNet>,
    version: u64,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, net: NetId) -> Option<&RemoteNet> {
        self.nets.get(&net)
    }

    pub fn nets(&self) -> impl Iterator<Item = &RemoteNet> {
        self.nets.values()
    }

    pub fn len(&self) -> usize {
        self.nets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    /// Add `route` to `net` at a random position among its routes
    ///
    /// Returns false, leaving the table untouched, when the gateway already
    /// routes to `net`.
    pub fn insert<R: Rng>(&mut self, net: NetId, route: Route, rng: &mut R) -> bool {
        if self.nets.get(&net).is_some_and(|rnet| rnet.has_gateway(route.gateway.nid)) {
            return false;
        }

        let rnet = self.nets.entry(net).or_insert_with(|| RemoteNet::new(net));
        let offset = rng.gen_range(0..=rnet.routes.len());
        rnet.routes.insert(offset, route);
        self.version += 1;
        true
    }

    /// Remove every route matching `net` and `gateway`; either may be a
    /// wildcard. Emptied networks are dropped.
    pub fn remove_matching(&mut self, net: NetId, gateway: Nid) -> Vec<(NetId, Route)> {
        let mut removed = Vec::new();

        for rnet in self.nets.values_mut() {
            if !net.is_any() && rnet.net != net {
                continue;
            }
            let mut i = 0;
            while i < rnet.routes.len() {
                if gateway.is_any() || rnet.routes[i].gateway.nid == gateway {
                    removed.push((rnet.net, rnet.routes.remove(i)));
                    self.version += 1;
                } else {
                    i += 1;
                }
            }
        }

        let before = self.nets.len();
        self.nets.retain(|_, rnet| !rnet.routes.is_empty());
        self.version += (before - self.nets.len()) as u64;

        removed
    }

    /// Route at position `index` of a walk over every network's routes
    pub fn nth(&self, index: usize) -> Option<(NetId, &Route)> {
        self.nets
            .values()
            .flat_map(|rnet| rnet.routes.iter().map(move |r| (rnet.net, r)))
            .nth(index)
    }
}

// ============================================================================
// ROUTER LIST
// ============================================================================

/// Gateways in use by at least one route, sorted by NID
#[derive(Debug, Default)]
pub struct RouterList {
    routers: Vec<Arc<Peer>>,
    version: u64,
}

impl RouterList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.routers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Peer>> {
        self.routers.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Peer>> {
        self.routers.iter()
    }

    pub fn contains(&self, nid: Nid) -> bool {
        self.routers.iter().any(|p| p.nid == nid)
    }

    /// Insert keeping NID order
    pub fn insert(&mut self, peer: Arc<Peer>) {
        let pos = self
            .routers
            .iter()
            .position(|p| p.nid > peer.nid)
            .unwrap_or(self.routers.len());
        self.routers.insert(pos, peer);
        self.version += 1;
    }

    pub fn remove(&mut self, nid: Nid) -> Option<Arc<Peer>> {
        let pos = self.routers.iter().position(|p| p.nid == nid)?;
        self.version += 1;
        Some(self.routers.remove(pos))
    }
}
