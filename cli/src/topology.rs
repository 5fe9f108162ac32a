// Static topology for offline route-table validation
//
// A topology file lists the local interfaces and the routes to apply:
//
// {
//   "interfaces": ["10.0.0.100@tcp", "10.1.0.100@tcp1"],
//   "routes": [{ "net": "o2ib", "hops": 1, "gateway": "10.0.0.1@tcp" }],
//   "unreachable": ["10.0.0.9@tcp"]
// }

use anyhow::{Context, Result};
use netrouter_core::{
    BufferHandle, EventSink, InterfaceDriver, NetError, NetId, NetworkLayer, Nid, Router, RouterConfig,
};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct Topology {
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub routes: Vec<RouteEntry>,
    /// Gateways no local interface can reach
    #[serde(default)]
    pub unreachable: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct RouteEntry {
    pub net: String,
    pub hops: u32,
    pub gateway: String,
}

impl Topology {
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&contents).context("Failed to parse topology")
    }
}

/// Network layer with fixed interfaces and no traffic
///
/// Peers resolve to the local interface on their network. Nothing is ever
/// sent; buffers bind and unlink without completions.
pub struct StaticNetwork {
    interfaces: Vec<Nid>,
    unreachable: HashSet<Nid>,
    next_handle: AtomicU64,
}

impl StaticNetwork {
    pub fn new(interfaces: Vec<Nid>, unreachable: HashSet<Nid>) -> Self {
        Self {
            interfaces,
            unreachable,
            next_handle: AtomicU64::new(1),
        }
    }
}

impl NetworkLayer for StaticNetwork {
    fn interfaces(&self) -> Vec<Nid> {
        self.interfaces.clone()
    }

    fn resolve(&self, peer: Nid) -> Option<Nid> {
        if self.unreachable.contains(&peer) {
            return None;
        }
        self.interfaces.iter().copied().find(|ni| ni.net() == peer.net())
    }

    fn driver(&self, _ni: Nid) -> Option<Arc<dyn InterfaceDriver>> {
        None
    }

    fn bind(&self, _len: usize, _sink: EventSink) -> Result<BufferHandle, NetError> {
        Ok(BufferHandle(self.next_handle.fetch_add(1, Ordering::Relaxed)))
    }

    fn unlink(&self, _handle: BufferHandle) -> Result<(), NetError> {
        Ok(())
    }

    fn get(&self, _handle: BufferHandle, _target: Nid) -> Result<(), NetError> {
        Err(NetError::Unreachable)
    }
}

/// Outcome of applying one route
#[derive(Debug)]
pub struct Applied {
    pub description: String,
    pub result: Result<(), String>,
}

/// Build a router over `topology` and apply every route in order
pub fn build(topology: &Topology, config: RouterConfig) -> Result<(Router, Vec<Applied>)> {
    let interfaces = topology
        .interfaces
        .iter()
        .map(|s| s.parse::<Nid>().with_context(|| format!("Bad interface {}", s)))
        .collect::<Result<Vec<_>>>()?;
    let unreachable = topology
        .unreachable
        .iter()
        .map(|s| s.parse::<Nid>().with_context(|| format!("Bad gateway {}", s)))
        .collect::<Result<HashSet<_>>>()?;

    let router = Router::with_system_clock(config, Arc::new(StaticNetwork::new(interfaces, unreachable)));

    let mut applied = Vec::with_capacity(topology.routes.len());
    for route in &topology.routes {
        let net: NetId = route.net.parse().with_context(|| format!("Bad network {}", route.net))?;
        let gateway: Nid = route
            .gateway
            .parse()
            .with_context(|| format!("Bad gateway {}", route.gateway))?;
        let result = router.add_route(net, route.hops, gateway).map_err(|e| e.to_string());
        applied.push(Applied {
            description: format!("{} via {} ({} hops)", net, gateway, route.hops),
            result,
        });
    }
    Ok((router, applied))
}
