//! Route table, router list and forwarding state behind one lock
//!
//! - `table`: remote networks and their gateways
//! - `notify`: liveness reports and their delivery to interface drivers
//! - `health`: asymmetric router failure detection and route selection
//!
//! Every mutation happens under `Router::state`. The lock is dropped around
//! driver callbacks, network requests and buffer allocation.

pub mod health;
pub mod notify;
pub mod table;

pub use table::{RemoteNet, Route, RouteRecord, RouteTable, RouterList};

use crate::checker::CheckerState;
use crate::clock::{secs_to_ms, Clock, SystemClock, Timestamp};
use crate::config::{ForwardingMode, RouterConfig};
use crate::net::{BufferHandle, NetworkLayer};
use crate::nid::{NetId, Nid};
use crate::peer::{Peer, PeerEntry, PeerRouterState, RouterCheckData, RouterInfo};
use crate::ping::{NiState, NiStatus, PingInfo, PING_VERSION_2};
use crate::pool::{Admission, ForwardId, PoolClass, PoolStats, RouterBuffer, RouterPools};
use crate::RouterError;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Local network interface as seen by the router
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalInterface {
    pub nid: Nid,
    pub status: NiState,
    /// Last time traffic arrived on the interface
    pub last_alive: Timestamp,
}

/// Everything guarded by the router lock
#[derive(Debug)]
pub(crate) struct RouterState {
    pub(crate) peers: HashMap<Nid, PeerEntry>,
    pub(crate) table: RouteTable,
    pub(crate) routers: RouterList,
    /// Check data of former routers waiting for their unlink to complete
    pub(crate) zombies: Vec<RouterCheckData>,
    pub(crate) interfaces: BTreeMap<Nid, LocalInterface>,
    pub(crate) pools: RouterPools,
    /// This node forwards for other networks
    pub(crate) routing: bool,
    pub(crate) checker: CheckerState,
    /// Shared ping buffer of the running checker
    pub(crate) default_handle: Option<BufferHandle>,
}

impl RouterState {
    /// Drop one router reference of `nid`. On the last one the peer leaves
    /// the router list and its check data becomes a zombie; the handle still
    /// to unlink is returned.
    pub(crate) fn router_decref(&mut self, nid: Nid) -> Option<BufferHandle> {
        let entry = self.peers.get_mut(&nid)?;
        entry.state.router_refcount = entry.state.router_refcount.saturating_sub(1);
        if entry.state.router_refcount > 0 {
            return None;
        }

        let rcd = entry.state.rcd.take();
        entry.state.clear_ping();
        self.routers.remove(nid);
        info!("{} is no longer a router", nid);

        let rcd = rcd?;
        let handle = rcd.handle;
        self.zombies.push(rcd);
        handle
    }

    /// Move every router's check data to the zombie list and drop
    /// outstanding pings
    pub(crate) fn retire_all_check_data(&mut self) -> Vec<BufferHandle> {
        let mut handles = Vec::new();
        for entry in self.peers.values_mut() {
            entry.state.clear_ping();
            if let Some(rcd) = entry.state.rcd.take() {
                handles.extend(rcd.handle);
                self.zombies.push(rcd);
            }
        }
        handles
    }
}

/// Routing core of one node
pub struct Router {
    config: RouterConfig,
    net: Arc<dyn NetworkLayer>,
    clock: Arc<dyn Clock>,
    pub(crate) state: RwLock<RouterState>,
    /// Serializes forwarding setup and teardown
    forwarding_setup: Mutex<()>,
}

impl Router {
    pub fn new(config: RouterConfig, net: Arc<dyn NetworkLayer>, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        let interfaces = net
            .interfaces()
            .into_iter()
            .map(|nid| {
                (
                    nid,
                    LocalInterface {
                        nid,
                        status: NiState::Up,
                        last_alive: now,
                    },
                )
            })
            .collect();

        Self {
            config,
            net,
            clock,
            state: RwLock::new(RouterState {
                peers: HashMap::new(),
                table: RouteTable::new(),
                routers: RouterList::new(),
                zombies: Vec::new(),
                interfaces,
                pools: RouterPools::default(),
                routing: false,
                checker: CheckerState::Shutdown,
                default_handle: None,
            }),
            forwarding_setup: Mutex::new(()),
        }
    }

    /// Router on wall-clock time
    pub fn with_system_clock(config: RouterConfig, net: Arc<dyn NetworkLayer>) -> Self {
        Self::new(config, net, Arc::new(SystemClock))
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub(crate) fn net(&self) -> &Arc<dyn NetworkLayer> {
        &self.net
    }

    pub fn checker_state(&self) -> CheckerState {
        self.state.read().checker
    }

    /// Whether `net` is one of this node's own networks
    pub fn is_local_net(&self, net: NetId) -> bool {
        self.state.read().interfaces.keys().any(|ni| ni.net() == net)
    }

    // ========================================================================
    // ROUTES
    // ========================================================================

    /// Add a route to `net` through `gateway`
    ///
    /// Routes to a local network, and routes whose gateway this node cannot
    /// reach, are accepted and ignored.
    pub fn add_route(&self, net: NetId, hops: u32, gateway: Nid) -> Result<(), RouterError> {
        debug!("Add route: net {} hops {} gw {}", net, hops, gateway);

        if net.is_any()
            || net.is_loopback()
            || gateway.is_any()
            || gateway.net().is_loopback()
            || gateway.net() == net
            || !(1..=255).contains(&hops)
        {
            return Err(RouterError::InvalidArgument(format!(
                "route to {} via {} with {} hops",
                net, gateway, hops
            )));
        }

        if self.is_local_net(net) {
            debug!("Ignoring route to local net {}", net);
            return Ok(());
        }

        let Some(ni) = self.net.resolve(gateway) else {
            debug!("Ignoring route to {} via unreachable gateway {}", net, gateway);
            return Ok(());
        };

        let now = self.clock.now();
        let mut state = self.state.write();
        if state.checker.is_stopping() {
            return Err(RouterError::ShuttingDown);
        }

        let RouterState {
            peers,
            table,
            routers,
            ..
        } = &mut *state;

        let entry = peers.entry(gateway).or_insert_with(|| PeerEntry {
            peer: Peer::new(gateway, ni),
            state: PeerRouterState::new(!self.config.check_routers_before_use, now),
        });
        let peer = Arc::clone(&entry.peer);

        let route = Route {
            gateway: Arc::clone(&peer),
            hops,
        };
        if !table.insert(net, route, &mut rand::thread_rng()) {
            debug!("Route to {} via {} already present", net, gateway);
            return Ok(());
        }

        entry.state.router_refcount += 1;
        if entry.state.router_refcount > 1 {
            return Ok(());
        }
        routers.insert(Arc::clone(&peer));
        info!("Added router {} for {}", gateway, net);
        drop(state);

        // Assume a new router is alive
        if let Some(driver) = self.net.driver(peer.ni) {
            driver.notify(peer.ni, peer.nid, true);
        }
        Ok(())
    }

    /// Remove every route matching `net` and `gateway`, either of which may
    /// be a wildcard. Returns how many routes went away.
    pub fn del_route(&self, net: NetId, gateway: Nid) -> Result<usize, RouterError> {
        debug!("Del route: net {} gw {}", net, gateway);

        let mut state = self.state.write();
        let removed = state.table.remove_matching(net, gateway);
        if removed.is_empty() {
            return Err(RouterError::NotFound);
        }

        let unlink: Vec<BufferHandle> = removed
            .iter()
            .filter_map(|(_, route)| state.router_decref(route.gateway.nid))
            .collect();
        drop(state);

        for handle in unlink {
            self.unlink_check_data(handle);
        }
        Ok(removed.len())
    }

    /// Request unlink of a zombie's ping buffer
    pub(crate) fn unlink_check_data(&self, handle: BufferHandle) {
        if let Err(e) = self.net.unlink(handle) {
            // No completion will follow; release the zombie now
            warn!("Unlink of {} failed: {}", handle, e);
            let mut state = self.state.write();
            for rcd in state.zombies.iter_mut().filter(|z| z.handle == Some(handle)) {
                rcd.handle = None;
            }
        }
    }

    /// Fail if any remote network is reached through more than one local
    /// interface
    pub fn check_routes(&self) -> Result<(), RouterError> {
        let state = self.state.read();

        for rnet in state.table.nets() {
            let Some(first) = rnet.routes.first() else {
                continue;
            };
            if let Some(other) = rnet.routes.iter().find(|r| r.gateway.ni != first.gateway.ni) {
                error!(
                    "Routes to {} via {} and {} not supported",
                    rnet.net, first.gateway.nid, other.gateway.nid
                );
                return Err(RouterError::ConfigurationConflict(format!(
                    "routes to {} via {} and {} use different interfaces",
                    rnet.net, first.gateway.nid, other.gateway.nid
                )));
            }
        }
        Ok(())
    }

    /// Snapshot of the routes to `net`
    pub fn find_net(&self, net: NetId) -> Option<RemoteNet> {
        self.state.read().table.get(net).cloned()
    }

    /// Route at position `index` of the table
    pub fn get_route(&self, index: usize) -> Option<RouteRecord> {
        let state = self.state.read();
        let (net, route) = state.table.nth(index)?;
        Some(RouteRecord {
            net,
            hops: route.hops,
            gateway: route.gateway.nid,
            alive: state
                .peers
                .get(&route.gateway.nid)
                .is_some_and(|e| e.state.alive),
        })
    }

    /// Every route, in table order
    pub fn routes(&self) -> Vec<RouteRecord> {
        (0..).map_while(|i| self.get_route(i)).collect()
    }

    pub fn table_version(&self) -> u64 {
        self.state.read().table.version()
    }

    pub fn routers_version(&self) -> u64 {
        self.state.read().routers.version()
    }

    /// Gateways currently in the router list
    pub fn routers(&self) -> Vec<RouterInfo> {
        let state = self.state.read();
        state
            .routers
            .iter()
            .filter_map(|p| state.peers.get(&p.nid))
            .map(RouterInfo::from_entry)
            .collect()
    }

    /// Routing state of a known peer
    pub fn peer(&self, nid: Nid) -> Option<PeerRouterState> {
        self.state.read().peers.get(&nid).map(|e| e.state.clone())
    }

    /// Check data waiting for unlink completion
    pub fn zombie_count(&self) -> usize {
        self.state.read().zombies.len()
    }

    // ========================================================================
    // ACTIVITY
    // ========================================================================

    /// Traffic arrived from `nid` at `when`
    pub fn record_peer_activity(&self, nid: Nid, when: Timestamp) {
        if let Some(entry) = self.state.write().peers.get_mut(&nid) {
            entry.state.last_alive = entry.state.last_alive.max(when);
        }
    }

    /// Traffic arrived on local interface `ni` at `when`
    pub fn record_interface_activity(&self, ni: Nid, when: Timestamp) {
        if let Some(iface) = self.state.write().interfaces.get_mut(&ni) {
            iface.last_alive = iface.last_alive.max(when);
            if iface.status != NiState::Up {
                debug!("NI {} status changed to up", ni);
                iface.status = NiState::Up;
            }
        }
    }

    pub fn interfaces(&self) -> Vec<LocalInterface> {
        self.state.read().interfaces.values().cloned().collect()
    }

    /// Mark local interfaces without recent traffic as down
    pub(crate) fn update_ni_status(&self, now: Timestamp) {
        let timeout = secs_to_ms(self.config.interface_timeout());
        let mut state = self.state.write();
        if !state.routing {
            return;
        }

        for iface in state.interfaces.values_mut() {
            if iface.nid.net().is_loopback() || now < iface.last_alive.saturating_add(timeout) {
                continue;
            }
            if iface.status != NiState::Down {
                debug!("NI {} status changed to down", iface.nid);
                iface.status = NiState::Down;
            }
        }
    }

    /// This node's answer to a router ping
    pub fn local_ping_info(&self) -> PingInfo {
        let state = self.state.read();
        let entries = state
            .interfaces
            .values()
            .map(|iface| NiStatus::new(iface.nid, iface.status))
            .collect();
        PingInfo::new(PING_VERSION_2, std::process::id(), entries)
    }

    // ========================================================================
    // FORWARDING
    // ========================================================================

    pub fn is_routing(&self) -> bool {
        self.state.read().routing
    }

    /// Size the router buffer pools and start forwarding
    ///
    /// `im_a_router` decides in `auto` mode. Returns whether the node now
    /// forwards.
    pub fn enable_forwarding(&self, im_a_router: bool) -> Result<bool, RouterError> {
        let forward = match self.config.forwarding {
            ForwardingMode::Enabled => true,
            ForwardingMode::Disabled => false,
            ForwardingMode::Auto => im_a_router,
        };
        if !forward {
            info!("Forwarding {} (not a router)", self.config.forwarding);
            return Ok(false);
        }
        self.config.validate_pools()?;

        let _setup = self.forwarding_setup.lock();
        let mut pools = {
            let mut state = self.state.write();
            if state.routing {
                return Ok(true);
            }
            std::mem::take(&mut state.pools)
        };

        let counts = [
            self.config.tiny_router_buffers,
            self.config.small_router_buffers,
            self.config.large_router_buffers,
        ];
        let result = PoolClass::ALL
            .iter()
            .zip(counts)
            .try_for_each(|(&class, count)| pools.get_mut(class).allocate(count as usize, false));

        let mut state = self.state.write();
        match result {
            Ok(()) => {
                state.pools = pools;
                state.routing = true;
                info!(
                    "Forwarding enabled: {} tiny, {} small, {} large buffers",
                    counts[0], counts[1], counts[2]
                );
                Ok(true)
            }
            Err(e) => {
                error!("Failed to allocate router buffers: {}", e);
                state.pools = RouterPools::default();
                Err(e)
            }
        }
    }

    /// Stop forwarding and release every pool
    pub fn disable_forwarding(&self) -> Result<(), RouterError> {
        let _setup = self.forwarding_setup.lock();
        let mut state = self.state.write();
        if !state.routing {
            return Ok(());
        }
        state.pools.free_all()?;
        state.routing = false;
        info!("Forwarding disabled");
        Ok(())
    }

    /// Ask for a buffer to forward a `payload_len` byte message
    pub fn take_buffer(&self, payload_len: usize, id: ForwardId) -> Result<Admission, RouterError> {
        let class = PoolClass::for_payload(payload_len).ok_or_else(|| {
            RouterError::InvalidArgument(format!("payload of {} bytes too large to forward", payload_len))
        })?;

        let mut state = self.state.write();
        if !state.routing {
            return Err(RouterError::NotRunning);
        }
        Ok(state.pools.get_mut(class).take(id))
    }

    /// Return a forwarding buffer; yields the forward that now owns it, if any
    pub fn give_back_buffer(
        &self,
        buffer: RouterBuffer,
    ) -> Result<Option<(ForwardId, RouterBuffer)>, RouterError> {
        let class = buffer.class();
        self.state.write().pools.get_mut(class).give_back(buffer)
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.state.read().pools.iter().map(|p| p.stats()).collect()
    }
}
