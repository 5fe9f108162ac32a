//! Router checker
//!
//! Pings every gateway on its own schedule and turns replies, failed sends
//! and timeouts into liveness reports. The loop body is [`RouterChecker::tick`]:
//! under [`ExecutionModel::Threaded`] a tokio task calls it once a second,
//! under [`ExecutionModel::Cooperative`] the host does.
//!
//! Lifecycle: `Shutdown -> Running -> StopRequested -> Unlinking -> Unlinked -> Shutdown`.
//! Stopping waits for the network layer to confirm that every ping buffer
//! has been unlinked.

mod rcd;

use crate::clock::secs_to_ms;
use crate::config::ExecutionModel;
use crate::net::{BufferHandle, EventSink, NetEvent, NetEventKind};
use crate::peer::Peer;
use crate::ping::{self, MAX_RTR_NIS, PING_BUFFER_LEN};
use crate::routing::{Router, RouterState};
use crate::RouterError;
use parking_lot::{Mutex, RwLockWriteGuard};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Period of the threaded checker loop
pub const CHECK_PERIOD: Duration = Duration::from_secs(1);
/// Poll period while waiting for the shared ping buffer to unlink
const UNLINK_POLL: Duration = Duration::from_millis(250);
/// Poll period while waiting for a host-driven tick to finish
const TICK_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CheckerState {
    /// No event queue held
    Shutdown,
    Running,
    StopRequested,
    /// Waiting for the shared ping buffer's unlink to complete
    Unlinking,
    Unlinked,
}

impl CheckerState {
    /// Between a stop request and the end of teardown
    pub fn is_stopping(&self) -> bool {
        matches!(
            self,
            CheckerState::StopRequested | CheckerState::Unlinking | CheckerState::Unlinked
        )
    }
}

impl std::fmt::Display for CheckerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckerState::Shutdown => write!(f, "shutdown"),
            CheckerState::Running => write!(f, "running"),
            CheckerState::StopRequested => write!(f, "stop requested"),
            CheckerState::Unlinking => write!(f, "unlinking"),
            CheckerState::Unlinked => write!(f, "unlinked"),
        }
    }
}

/// Clears the re-entrancy flag when a tick ends
struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct RouterChecker {
    router: Arc<Router>,
    ticking: AtomicBool,
    events: Mutex<Option<mpsc::UnboundedReceiver<NetEvent>>>,
    sink: Mutex<Option<EventSink>>,
    /// Fired when the shared ping buffer's unlink completes
    unlinked_tx: Mutex<Option<oneshot::Sender<()>>>,
    unlinked_rx: Mutex<Option<oneshot::Receiver<()>>>,
    task: Mutex<Option<(oneshot::Sender<()>, JoinHandle<()>)>>,
    /// Serializes the start and stop transitions
    lifecycle: Mutex<()>,
}

impl RouterChecker {
    pub fn new(router: Arc<Router>) -> Arc<Self> {
        Arc::new(Self {
            router,
            ticking: AtomicBool::new(false),
            events: Mutex::new(None),
            sink: Mutex::new(None),
            unlinked_tx: Mutex::new(None),
            unlinked_rx: Mutex::new(None),
            task: Mutex::new(None),
            lifecycle: Mutex::new(()),
        })
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn state(&self) -> CheckerState {
        self.router.checker_state()
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Bind the shared ping buffer and start checking routers
    ///
    /// With `check_routers_before_use` this only returns once every known
    /// router has been determined up or down.
    pub async fn start(self: &Arc<Self>) -> Result<(), RouterError> {
        let config = self.router.config().clone();
        if let Err(e) = config.validate() {
            error!("{}", e);
            return Err(e.into());
        }

        {
            let _lifecycle = self.lifecycle.lock();
            {
                let state = self.router.state.read();
                if state.checker != CheckerState::Shutdown {
                    return Err(RouterError::AlreadyRunning);
                }
                if !state.routing
                    && config.live_router_check_interval <= 0
                    && config.dead_router_check_interval <= 0
                {
                    info!("Router checker disabled: no check intervals and not routing");
                    return Ok(());
                }
            }

            let (sink, rx) = EventSink::channel();
            let handle = self
                .router
                .net()
                .bind(PING_BUFFER_LEN, sink.clone())
                .map_err(|e| {
                    error!("Can't bind router checker ping buffer: {}", e);
                    RouterError::Network(e)
                })?;

            let (done_tx, done_rx) = oneshot::channel();
            *self.events.lock() = Some(rx);
            *self.sink.lock() = Some(sink);
            *self.unlinked_tx.lock() = Some(done_tx);
            *self.unlinked_rx.lock() = Some(done_rx);

            let mut state = self.router.state.write();
            state.default_handle = Some(handle);
            state.checker = CheckerState::Running;
        }
        info!("Router checker started ({})", config.execution);

        if config.execution == ExecutionModel::Threaded {
            self.spawn_loop();
        }

        if config.check_routers_before_use {
            self.wait_known_router_state().await;
        }
        Ok(())
    }

    fn spawn_loop(self: &Arc<Self>) {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let checker = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(CHECK_PERIOD);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = interval.tick() => {
                        checker.tick();
                    }
                }
            }
            debug!("Router checker loop exiting");
        });

        *self.task.lock() = Some((stop_tx, handle));
    }

    /// Wait until every router has been determined up or down at least once
    async fn wait_known_router_state(&self) {
        let cooperative = self.router.config().execution == ExecutionModel::Cooperative;

        loop {
            if self.state() != CheckerState::Running {
                return;
            }
            if cooperative {
                self.tick();
            }

            let all_known = {
                let state = self.router.state.read();
                let known = state
                    .routers
                    .iter()
                    .filter_map(|p| state.peers.get(&p.nid))
                    .all(|e| e.state.alive_count != 0);
                known
            };
            if all_known {
                return;
            }
            tokio::time::sleep(CHECK_PERIOD).await;
        }
    }

    /// Stop checking and release the event queue
    ///
    /// Waits for every ping buffer to be unlinked by the network layer.
    pub async fn stop(&self) -> Result<(), RouterError> {
        {
            let _lifecycle = self.lifecycle.lock();
            let mut state = self.router.state.write();
            match state.checker {
                CheckerState::Shutdown => return Ok(()),
                CheckerState::Running => state.checker = CheckerState::StopRequested,
                _ => return Err(RouterError::NotRunning),
            }
        }
        info!("Stopping router checker");

        let task = self.task.lock().take();
        if let Some((stop_tx, handle)) = task {
            let _ = stop_tx.send(());
            if let Err(e) = handle.await {
                warn!("Router checker loop ended abnormally: {}", e);
            }
        }

        // A host thread may still be inside tick() with the lock dropped
        while self.ticking.load(Ordering::Acquire) {
            tokio::time::sleep(TICK_POLL).await;
        }

        let handles = self.router.state.write().retire_all_check_data();
        for handle in handles {
            self.router.unlink_check_data(handle);
        }
        self.wait_zombies().await;

        let default_handle = {
            let mut state = self.router.state.write();
            state.checker = CheckerState::Unlinking;
            state.default_handle
        };
        match default_handle {
            Some(handle) => {
                if let Err(e) = self.router.net().unlink(handle) {
                    warn!("Unlink of {} failed: {}", handle, e);
                    self.default_unlinked();
                }
            }
            None => self.default_unlinked(),
        }

        let done = self.unlinked_rx.lock().take();
        if let Some(mut done) = done {
            loop {
                self.process_events();
                tokio::select! {
                    _ = &mut done => break,
                    _ = tokio::time::sleep(UNLINK_POLL) => {}
                }
            }
        }

        {
            let mut state = self.router.state.write();
            state.checker = CheckerState::Shutdown;
            state.default_handle = None;
        }
        *self.events.lock() = None;
        *self.sink.lock() = None;
        info!("Router checker stopped");
        Ok(())
    }

    /// The shared ping buffer is gone
    fn default_unlinked(&self) {
        {
            let mut state = self.router.state.write();
            if state.checker == CheckerState::Unlinking {
                state.checker = CheckerState::Unlinked;
            }
            state.default_handle = None;
        }
        debug!("Router checker ping buffer unlinked");
        if let Some(tx) = self.unlinked_tx.lock().take() {
            let _ = tx.send(());
        }
    }

    // ========================================================================
    // CHECKER LOOP
    // ========================================================================

    /// One pass of the checker: ping due routers, consume events, refresh
    /// local interface status and free unlinked zombies.
    ///
    /// Returns false if the pass was skipped because another one is running
    /// or the checker is not running.
    pub fn tick(&self) -> bool {
        if self.ticking.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _guard = TickGuard(&self.ticking);

        if self.state() != CheckerState::Running {
            return false;
        }

        self.ping_routers();
        self.process_events();
        self.router.update_ni_status(self.router.now());
        self.prune_zombies();
        true
    }

    /// Walk the router list, restarting whenever it changes under us
    fn ping_routers(&self) {
        let mut state = self.router.state.write();

        'rescan: loop {
            let version = state.routers.version();
            let mut index = 0;
            while let Some(peer) = state.routers.get(index).cloned() {
                self.ping_router_locked(&mut state, &peer);
                if state.routers.version() != version {
                    continue 'rescan;
                }
                index += 1;
            }
            break;
        }
    }

    fn ping_router_locked(&self, state: &mut RwLockWriteGuard<'_, RouterState>, peer: &Arc<Peer>) {
        let config = self.router.config();
        let nid = peer.nid;
        let now = self.router.now();

        if let Some(entry) = state.peers.get_mut(&nid) {
            if entry.state.ping_deadline != 0 && now > entry.state.ping_deadline {
                debug!("Ping of router {} timed out", nid);
                entry.state.record_liveness(nid, true, false, now);
            }
        }

        // Deliver outstanding notifications, possibly the timeout above
        self.router.do_notify_locked(state, nid);

        let is_router = state.peers.get(&nid).is_some_and(|e| e.state.is_router());
        if !is_router || state.checker != CheckerState::Running {
            return;
        }

        let handle = if config.avoid_asym_router_failure {
            let existing = state
                .peers
                .get(&nid)
                .and_then(|e| e.state.rcd.as_ref())
                .map(|rcd| rcd.handle);
            match existing {
                Some(Some(handle)) => handle,
                Some(None) => return,
                None => match self.create_check_data_locked(state, peer) {
                    Some(handle) => handle,
                    None => return,
                },
            }
        } else {
            match state.default_handle {
                Some(handle) => handle,
                None => return,
            }
        };

        let Some(entry) = state.peers.get_mut(&nid) else {
            return;
        };
        let secs = if entry.state.alive {
            config.live_router_check_interval
        } else {
            config.dead_router_check_interval
        };
        let interval = secs_to_ms(secs);
        if interval == 0
            || entry.state.ping_not_sent
            || now <= entry.state.ping_timestamp.saturating_add(interval)
        {
            return;
        }

        let previous_timestamp = entry.state.ping_timestamp;
        let previous_deadline = entry.state.ping_deadline;
        entry.state.ping_not_sent = true;
        entry.state.ping_timestamp = now;
        if previous_deadline == 0 {
            entry.state.ping_deadline = now.saturating_add(secs_to_ms(config.router_ping_timeout));
        }
        debug!("Pinging router {} ({})", nid, handle);

        let net = self.router.net();
        let sent = RwLockWriteGuard::unlocked(state, || net.get(handle, nid));

        if let Err(e) = sent {
            // Not a timeout: try again on the next pass
            debug!("Failed to ping router {}: {}", nid, e);
            if let Some(entry) = state.peers.get_mut(&nid) {
                entry.state.ping_not_sent = false;
                entry.state.ping_timestamp = previous_timestamp;
                entry.state.ping_deadline = previous_deadline;
            }
        }
    }

    // ========================================================================
    // EVENTS
    // ========================================================================

    /// Consume every queued event
    pub(crate) fn process_events(&self) {
        let mut events = self.events.lock();
        let Some(rx) = events.as_mut() else {
            return;
        };
        while let Ok(event) = rx.try_recv() {
            self.handle_event(event);
        }
    }

    fn handle_event(&self, event: NetEvent) {
        if event.kind == NetEventKind::Unlink {
            self.handle_unlink(event.handle);
            return;
        }

        let avoid_asym = self.router.config().avoid_asym_router_failure;
        let now = self.router.now();
        let nid = event.peer;

        let mut state = self.router.state.write();
        let default_handle = state.default_handle;
        let Some(entry) = state.peers.get_mut(&nid) else {
            return;
        };

        // Ignore if no longer a router or the ping buffer was replaced
        let current = if avoid_asym {
            entry.state.rcd.as_ref().and_then(|rcd| rcd.handle)
        } else {
            default_handle
        };
        if !entry.state.is_router() || current != Some(event.handle) {
            debug!("Ignoring stale {:?} event from {}", event.kind, nid);
            return;
        }

        if event.kind == NetEventKind::Send {
            entry.state.ping_not_sent = false;
            if event.status.is_ok() {
                return;
            }
        }

        match (event.kind, &event.status) {
            (NetEventKind::Reply, Ok(())) => {
                match ping::parse(&event.payload, event.payload.len(), MAX_RTR_NIS) {
                    Ok(info) => {
                        entry.state.record_liveness(nid, true, true, now);
                        if let Some(rcd) = entry.state.rcd.as_mut() {
                            rcd.ping_info = Some(info);
                        }
                    }
                    Err(e) => {
                        debug!("Discarding ping reply from {}: {}", nid, e);
                    }
                }
            }
            (_, status) => {
                debug!("Router {} ping failed: {:?}", nid, status);
                entry.state.record_liveness(nid, true, false, now);
            }
        }
    }

    fn handle_unlink(&self, handle: BufferHandle) {
        let mut state = self.router.state.write();
        if state.default_handle == Some(handle) {
            drop(state);
            self.default_unlinked();
            return;
        }

        let RouterState { peers, zombies, .. } = &mut *state;
        let rcd = peers
            .values_mut()
            .filter_map(|e| e.state.rcd.as_mut())
            .chain(zombies.iter_mut())
            .find(|rcd| rcd.handle == Some(handle));
        match rcd {
            Some(rcd) => rcd.handle = None,
            None => debug!("Unlink of unknown buffer {}", handle),
        }
    }
}
