//! Peer liveness reports and their delivery to interface drivers
//!
//! Reports are ordered by the time they were observed, not by arrival.
//! Delivery is coalesced: at most one delivery loop runs per peer, and it
//! always hands the driver the newest state, so a short flap may never be
//! seen.

use super::{Router, RouterState};
use crate::clock::Timestamp;
use crate::nid::Nid;
use crate::RouterError;
use parking_lot::RwLockWriteGuard;
use tracing::{debug, warn};

impl Router {
    /// Report that `peer` is (or is not) alive as of `when`
    ///
    /// `interface` is the local interface of the reporting driver; `None`
    /// means the report comes from elsewhere and the driver must be told.
    pub fn notify(&self, peer: Nid, interface: Option<Nid>, alive: bool, when: Timestamp) -> Result<(), RouterError> {
        let now = self.now();

        if let Some(ni) = interface {
            if ni.net() != peer.net() {
                warn!("Ignoring notification of {} {} by {} (different net)", peer, updown(alive), ni);
                return Err(RouterError::InvalidArgument(format!(
                    "{} is not on the network of {}",
                    peer, ni
                )));
            }
        }

        if when > now {
            warn!(
                "Ignoring prediction from {} of {} {} {} ms in the future",
                interface.map_or_else(|| "userspace".to_string(), |ni| ni.to_string()),
                peer,
                updown(alive),
                when - now
            );
            return Err(RouterError::InvalidArgument(format!("report time {} is in the future", when)));
        }

        if interface.is_some() && !alive && !self.config().auto_down {
            debug!("Auto-down disabled, ignoring {} down", peer);
            return Ok(());
        }

        let mut state = self.state.write();
        if state.checker.is_stopping() {
            return Err(RouterError::ShuttingDown);
        }

        let Some(entry) = state.peers.get_mut(&peer) else {
            debug!("{} not found", peer);
            return Ok(());
        };

        // Drivers may report a down peer they never talked to with a stale
        // time; never go back before the last known sign of life.
        let mut when = when;
        if interface.is_some() && !alive && when < entry.state.last_alive {
            when = entry.state.last_alive;
        }

        entry.state.record_liveness(peer, interface.is_none(), alive, when);

        if interface.is_some() {
            self.do_notify_locked(&mut state, peer);
        }
        Ok(())
    }

    /// Deliver whatever notification is pending for `peer`
    pub fn deliver_notifications(&self, peer: Nid) {
        let mut state = self.state.write();
        self.do_notify_locked(&mut state, peer);
    }

    /// Run the delivery loop for `nid` unless one is already running
    pub(crate) fn do_notify_locked(&self, state: &mut RwLockWriteGuard<'_, RouterState>, nid: Nid) {
        let ni = match state.peers.get_mut(&nid) {
            Some(entry) if !entry.state.notifying => {
                entry.state.notifying = true;
                entry.peer.ni
            }
            _ => return,
        };

        loop {
            let Some(entry) = state.peers.get_mut(&nid) else {
                return;
            };
            if !entry.state.notify_pending {
                entry.state.notifying = false;
                return;
            }

            let alive = entry.state.alive;
            let to_driver = entry.state.notify_to_driver;
            entry.state.notify_pending = false;
            entry.state.notify_to_driver = false;

            if to_driver {
                let net = self.net();
                RwLockWriteGuard::unlocked(state, || {
                    if let Some(driver) = net.driver(ni) {
                        driver.notify(ni, nid, alive);
                    }
                });
            }
        }
    }
}

fn updown(alive: bool) -> &'static str {
    if alive {
        "up"
    } else {
        "down"
    }
}

#[cfg(test)]
mod tests {
    use crate::clock::ManualClock;
    use crate::config::RouterConfig;
    use crate::net::MockInterfaceDriver;
    use crate::nid::{NetId, Nid};
    use crate::routing::Router;
    use crate::testing::FakeNetwork;
    use crate::RouterError;
    use mockall::predicate::eq;
    use std::sync::Arc;

    const START: u64 = 1_000_000_000;

    fn nid(s: &str) -> Nid {
        s.parse().unwrap()
    }

    fn setup(config: RouterConfig, driver: MockInterfaceDriver) -> (Router, Arc<ManualClock>) {
        let ni = nid("10.0.0.100@tcp");
        let fake = FakeNetwork::new(&[ni]);
        fake.set_driver(ni, Arc::new(driver));
        let clock = Arc::new(ManualClock::new(START));
        let router = Router::new(config, fake, clock.clone());
        (router, clock)
    }

    fn add_gateway(router: &Router, gw: Nid) {
        router.add_route("o2ib".parse::<NetId>().unwrap(), 1, gw).unwrap();
    }

    #[test]
    fn test_flips_coalesce_into_one_callback() {
        let gw = nid("10.0.0.1@tcp");
        let ni = nid("10.0.0.100@tcp");
        let mut driver = MockInterfaceDriver::new();
        // assumed alive on add
        driver.expect_notify().with(eq(ni), eq(gw), eq(true)).times(1).return_const(());
        // final state of the three flips
        driver.expect_notify().with(eq(ni), eq(gw), eq(false)).times(1).return_const(());

        let (router, _) = setup(RouterConfig::default(), driver);
        add_gateway(&router, gw);

        router.notify(gw, None, false, START - 3).unwrap();
        router.notify(gw, None, true, START - 2).unwrap();
        router.notify(gw, None, false, START - 1).unwrap();
        assert_eq!(router.peer(gw).unwrap().alive_count, 3);

        router.deliver_notifications(gw);
        router.deliver_notifications(gw);
        let peer = router.peer(gw).unwrap();
        assert!(!peer.notify_pending);
        assert!(!peer.notifying);
    }

    #[test]
    fn test_driver_reports_are_not_echoed() {
        let gw = nid("10.0.0.1@tcp");
        let ni = nid("10.0.0.100@tcp");
        let mut driver = MockInterfaceDriver::new();
        driver.expect_notify().with(eq(ni), eq(gw), eq(true)).times(1).return_const(());

        let (router, _) = setup(RouterConfig::default(), driver);
        add_gateway(&router, gw);

        router.notify(gw, Some(ni), false, START).unwrap();
        let peer = router.peer(gw).unwrap();
        assert!(!peer.alive);
        assert!(!peer.notify_pending);
    }

    #[test]
    fn test_out_of_order_reports() {
        let gw = nid("10.0.0.1@tcp");
        let mut driver = MockInterfaceDriver::new();
        driver.expect_notify().return_const(());
        let (router, _) = setup(RouterConfig::default(), driver);
        add_gateway(&router, gw);

        router.notify(gw, None, false, START - 5_000).unwrap();
        router.notify(gw, None, true, START - 7_000).unwrap();
        assert!(!router.peer(gw).unwrap().alive);
    }

    #[test]
    fn test_rejects_future_and_foreign_reports() {
        let gw = nid("10.0.0.1@tcp");
        let mut driver = MockInterfaceDriver::new();
        driver.expect_notify().return_const(());
        let (router, _) = setup(RouterConfig::default(), driver);
        add_gateway(&router, gw);

        assert!(matches!(
            router.notify(gw, None, true, START + 1),
            Err(RouterError::InvalidArgument(_))
        ));
        assert!(matches!(
            router.notify(gw, Some(nid("192.168.1.1@o2ib")), true, START),
            Err(RouterError::InvalidArgument(_))
        ));
        assert_eq!(router.peer(gw).unwrap().alive_count, 0);
    }

    #[test]
    fn test_unknown_peer_ignored() {
        let (router, _) = setup(RouterConfig::default(), MockInterfaceDriver::new());
        assert!(router.notify(nid("10.0.0.77@tcp"), None, false, START).is_ok());
        assert!(router.peer(nid("10.0.0.77@tcp")).is_none());
    }

    #[test]
    fn test_auto_down_disabled() {
        let gw = nid("10.0.0.1@tcp");
        let ni = nid("10.0.0.100@tcp");
        let mut driver = MockInterfaceDriver::new();
        driver.expect_notify().return_const(());
        let (router, _) = setup(
            RouterConfig {
                auto_down: false,
                ..Default::default()
            },
            driver,
        );
        add_gateway(&router, gw);

        router.notify(gw, Some(ni), false, START).unwrap();
        assert!(router.peer(gw).unwrap().alive);
        assert_eq!(router.peer(gw).unwrap().alive_count, 0);
    }

    #[test]
    fn test_down_report_clamped_to_last_alive() {
        let gw = nid("10.0.0.1@tcp");
        let ni = nid("10.0.0.100@tcp");
        let mut driver = MockInterfaceDriver::new();
        driver.expect_notify().return_const(());
        let (router, clock) = setup(RouterConfig::default(), driver);
        add_gateway(&router, gw);

        clock.advance_secs(10);
        router.record_peer_activity(gw, START + 5_000);
        router.notify(gw, Some(ni), false, START - 60_000).unwrap();

        let peer = router.peer(gw).unwrap();
        assert!(!peer.alive);
        assert_eq!(peer.timestamp, START + 5_000);
    }
}
