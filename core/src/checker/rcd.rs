//! Per-router ping buffers and zombie reclamation

use super::{CheckerState, RouterChecker};
use crate::net::BufferHandle;
use crate::peer::{Peer, RouterCheckData};
use crate::ping::PING_BUFFER_LEN;
use crate::routing::RouterState;
use parking_lot::RwLockWriteGuard;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Pause between checks while waiting for zombie unlinks
const ZOMBIE_POLL: Duration = Duration::from_millis(250);

impl RouterChecker {
    /// Bind a dedicated ping buffer for `peer`
    ///
    /// The lock is dropped while binding. If the peer stopped being a router,
    /// got a buffer from someone else or the checker began stopping in the
    /// meantime, the new buffer goes straight to the zombie list and whatever
    /// the peer has now is used.
    pub(super) fn create_check_data_locked(
        &self,
        state: &mut RwLockWriteGuard<'_, RouterState>,
        peer: &Arc<Peer>,
    ) -> Option<BufferHandle> {
        let sink = self.sink.lock().as_ref().cloned()?;
        let net = self.router.net();
        let nid = peer.nid;

        let bound = RwLockWriteGuard::unlocked(state, || net.bind(PING_BUFFER_LEN, sink));
        let handle = match bound {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Can't bind ping buffer for router {}: {}", nid, e);
                return None;
            }
        };

        let running = state.checker == CheckerState::Running;
        match state.peers.get_mut(&nid) {
            Some(entry) if running && entry.state.is_router() && entry.state.rcd.is_none() => {
                debug!("Router {} ping buffer {}", nid, handle);
                entry.state.rcd = Some(RouterCheckData::new(handle));
                Some(handle)
            }
            _ => {
                debug!("Router {} changed while binding, retiring {}", nid, handle);
                state.zombies.push(RouterCheckData::new(handle));
                let router = &self.router;
                RwLockWriteGuard::unlocked(state, || router.unlink_check_data(handle));

                if !running {
                    return None;
                }
                state
                    .peers
                    .get(&nid)
                    .filter(|e| e.state.is_router())
                    .and_then(|e| e.state.rcd.as_ref())
                    .and_then(|rcd| rcd.handle)
            }
        }
    }

    /// Free zombies whose unlink has completed; returns how many remain
    pub(crate) fn prune_zombies(&self) -> usize {
        let mut state = self.router.state.write();
        let before = state.zombies.len();
        state.zombies.retain(|rcd| !rcd.is_unlinked());
        let remaining = state.zombies.len();
        if remaining < before {
            debug!("Freed {} router ping buffers", before - remaining);
        }
        remaining
    }

    /// Wait until every zombie's unlink has completed
    pub(super) async fn wait_zombies(&self) {
        let mut waits: u32 = 0;
        loop {
            self.process_events();
            let remaining = self.prune_zombies();
            if remaining == 0 {
                return;
            }

            waits += 1;
            if waits.is_power_of_two() {
                warn!("Waiting for {} router ping buffers to unlink", remaining);
            } else {
                debug!("Waiting for {} router ping buffers to unlink", remaining);
            }
            tokio::time::sleep(ZOMBIE_POLL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::checker::{CheckerState, RouterChecker};
    use crate::clock::ManualClock;
    use crate::config::{ExecutionModel, RouterConfig};
    use crate::nid::{NetId, Nid};
    use crate::routing::Router;
    use crate::testing::FakeNetwork;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    fn nid(s: &str) -> Nid {
        s.parse().unwrap()
    }

    fn setup() -> (Arc<RouterChecker>, Arc<FakeNetwork>) {
        let fake = FakeNetwork::new(&[nid("10.0.0.100@tcp")]);
        let config = RouterConfig {
            execution: ExecutionModel::Cooperative,
            ..Default::default()
        };
        let router = Arc::new(Router::new(config, fake.clone(), Arc::new(ManualClock::new(1_000_000_000))));
        (RouterChecker::new(router), fake)
    }

    #[tokio::test]
    async fn test_removed_router_becomes_zombie() {
        let (checker, fake) = setup();
        let gw = nid("10.0.0.1@tcp");
        let net: NetId = "o2ib".parse().unwrap();
        checker.router().add_route(net, 1, gw).unwrap();
        checker.start().await.unwrap();
        checker.tick();
        assert!(checker.router().peer(gw).unwrap().rcd.is_some());

        fake.defer_unlinks(true);
        checker.router().del_route(net, gw).unwrap();
        assert_eq!(checker.router().zombie_count(), 1);

        checker.tick();
        assert_eq!(checker.router().zombie_count(), 1);

        fake.complete_unlinks();
        checker.tick();
        assert_eq!(checker.router().zombie_count(), 0);

        fake.defer_unlinks(false);
        checker.stop().await.unwrap();
        assert_eq!(checker.state(), CheckerState::Shutdown);
    }

    #[tokio::test]
    async fn test_failed_unlink_releases_zombie() {
        let (checker, fake) = setup();
        let gw = nid("10.0.0.1@tcp");
        let net: NetId = "o2ib".parse().unwrap();
        checker.router().add_route(net, 1, gw).unwrap();
        checker.start().await.unwrap();
        checker.tick();

        fake.fail_unlinks(true);
        checker.router().del_route(net, gw).unwrap();
        assert_eq!(checker.prune_zombies(), 0);

        fake.fail_unlinks(false);
        checker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_buffer_bound_while_stopping_is_retired() {
        let (checker, fake) = setup();
        let gw = nid("10.0.0.1@tcp");
        checker.router().add_route("o2ib".parse().unwrap(), 1, gw).unwrap();
        checker.start().await.unwrap();
        let peer = checker.router().state.read().peers[&gw].peer.clone();

        {
            let mut state = checker.router().state.write();
            state.checker = CheckerState::StopRequested;
            assert_eq!(checker.create_check_data_locked(&mut state, &peer), None);
            assert!(state.peers[&gw].state.rcd.is_none());
            assert_eq!(state.zombies.len(), 1);
            state.checker = CheckerState::Running;
        }

        checker.stop().await.unwrap();
        assert_eq!(checker.router().zombie_count(), 0);
        assert_eq!(fake.bound_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_running_tick() {
        let (checker, fake) = setup();
        let gw = nid("10.0.0.1@tcp");
        checker.router().add_route("o2ib".parse().unwrap(), 1, gw).unwrap();
        checker.start().await.unwrap();

        // stand-in for a host thread in the middle of a tick
        checker.ticking.store(true, Ordering::Release);
        let stopping = {
            let checker = checker.clone();
            tokio::spawn(async move { checker.stop().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(checker.state(), CheckerState::StopRequested);
        assert_eq!(fake.bound_count(), 1);

        checker.ticking.store(false, Ordering::Release);
        stopping.await.unwrap().unwrap();
        assert_eq!(checker.state(), CheckerState::Shutdown);
        assert_eq!(fake.bound_count(), 0);
    }
}
