//! Asymmetric router failure detection and route selection
//!
//! A router may answer pings while the interface leading to the destination
//! network is dead. Its last ping reply lists the status of every interface,
//! which lets us skip such a router for that destination.

use super::Router;
use crate::config::RouterConfig;
use crate::nid::{NetId, Nid};
use crate::peer::PeerRouterState;
use crate::ping::{count_down_interfaces, ProtocolError};
use tracing::debug;

/// Down interface count of a gateway for `net`; `None` if not applicable
pub(crate) fn router_down_ni_locked(
    config: &RouterConfig,
    gateway: &PeerRouterState,
    net: NetId,
) -> Result<Option<usize>, ProtocolError> {
    if !config.avoid_asym_router_failure || !gateway.alive {
        return Ok(None);
    }
    let Some(info) = gateway.rcd.as_ref().and_then(|rcd| rcd.ping_info.as_ref()) else {
        return Ok(None);
    };
    // version 1 replies carry no interface status
    if !info.has_ni_status() {
        return Ok(None);
    }
    count_down_interfaces(info, net).map(Some)
}

impl Router {
    /// How many of `gateway`'s interfaces are down as far as reaching `net`
    /// is concerned
    ///
    /// `Ok(None)` when the check does not apply: the feature is off, no reply
    /// is cached, or the gateway is not alive.
    pub fn router_down_ni(&self, gateway: Nid, net: NetId) -> Result<Option<usize>, ProtocolError> {
        let state = self.state.read();
        match state.peers.get(&gateway) {
            Some(entry) => router_down_ni_locked(self.config(), &entry.state, net),
            None => Ok(None),
        }
    }

    /// Best gateway for `net`: alive, not asymmetrically failed, fewest hops
    pub fn find_route(&self, net: NetId) -> Option<Nid> {
        let state = self.state.read();
        let rnet = state.table.get(net)?;

        let mut best: Option<(u32, Nid)> = None;
        for route in &rnet.routes {
            let Some(entry) = state.peers.get(&route.gateway.nid) else {
                continue;
            };
            if !entry.state.alive {
                continue;
            }
            match router_down_ni_locked(self.config(), &entry.state, net) {
                Ok(Some(0)) | Ok(None) => {}
                Ok(Some(down)) => {
                    debug!("{} has {} interfaces down for {}", route.gateway.nid, down, net);
                    continue;
                }
                Err(e) => {
                    debug!("Bad interface status from {}: {}", route.gateway.nid, e);
                    continue;
                }
            }
            if best.map_or(true, |(hops, _)| route.hops < hops) {
                best = Some((route.hops, route.gateway.nid));
            }
        }
        best.map(|(_, nid)| nid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::net::BufferHandle;
    use crate::peer::RouterCheckData;
    use crate::ping::{NiState, NiStatus, PingInfo, PING_VERSION_1, PING_VERSION_2};
    use crate::testing::FakeNetwork;
    use std::sync::Arc;

    fn nid(s: &str) -> Nid {
        s.parse().unwrap()
    }

    fn net(s: &str) -> NetId {
        s.parse().unwrap()
    }

    fn router(config: RouterConfig) -> Router {
        let fake = FakeNetwork::new(&[nid("10.0.0.100@tcp")]);
        Router::new(config, fake, Arc::new(ManualClock::new(1_000_000_000)))
    }

    fn cache_reply(router: &Router, gw: Nid, info: PingInfo) {
        let mut state = router.state.write();
        let entry = state.peers.get_mut(&gw).unwrap();
        entry.state.rcd = Some(RouterCheckData {
            handle: Some(BufferHandle(1)),
            ping_info: Some(info),
        });
    }

    fn o2ib_down() -> PingInfo {
        PingInfo::new(
            PING_VERSION_2,
            1,
            vec![
                NiStatus::new(nid("10.0.0.1@tcp"), NiState::Up),
                NiStatus::new(nid("192.168.0.1@o2ib"), NiState::Down),
            ],
        )
    }

    #[test]
    fn test_down_ni_not_applicable() {
        let gw = nid("10.0.0.1@tcp");

        let r = router(RouterConfig::default());
        r.add_route(net("gni"), 1, gw).unwrap();
        assert_eq!(r.router_down_ni(gw, net("gni")), Ok(None));

        cache_reply(&r, gw, PingInfo::new(PING_VERSION_1, 1, vec![]));
        assert_eq!(r.router_down_ni(gw, net("gni")), Ok(None));

        let r = router(RouterConfig {
            avoid_asym_router_failure: false,
            ..Default::default()
        });
        r.add_route(net("gni"), 1, gw).unwrap();
        cache_reply(&r, gw, o2ib_down());
        assert_eq!(r.router_down_ni(gw, net("gni")), Ok(None));
    }

    #[test]
    fn test_down_ni_counts() {
        let gw = nid("10.0.0.1@tcp");
        let r = router(RouterConfig::default());
        r.add_route(net("gni"), 1, gw).unwrap();
        cache_reply(&r, gw, o2ib_down());

        assert_eq!(r.router_down_ni(gw, net("gni")), Ok(Some(1)));
        assert_eq!(r.router_down_ni(gw, net("tcp")), Ok(Some(0)));
    }

    #[test]
    fn test_find_route_prefers_fewest_hops() {
        let r = router(RouterConfig::default());
        let near = nid("10.0.0.1@tcp");
        let far = nid("10.0.0.2@tcp");
        r.add_route(net("gni"), 3, far).unwrap();
        r.add_route(net("gni"), 1, near).unwrap();

        assert_eq!(r.find_route(net("gni")), Some(near));
        assert_eq!(r.find_route(net("ptl")), None);
    }

    #[test]
    fn test_find_route_skips_dead_and_asymmetric() {
        let r = router(RouterConfig::default());
        let near = nid("10.0.0.1@tcp");
        let far = nid("10.0.0.2@tcp");
        r.add_route(net("gni"), 3, far).unwrap();
        r.add_route(net("gni"), 1, near).unwrap();

        cache_reply(&r, near, o2ib_down());
        assert_eq!(r.find_route(net("gni")), Some(far));

        r.notify(far, None, false, r.now()).unwrap();
        assert_eq!(r.find_route(net("gni")), None);
    }
}
