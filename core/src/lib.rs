// NetRouter Core: routing and router health for a credit-flow transport
//
// Keeps the table of remote networks and their gateways, pings gateways to
// learn whether they are alive, tells interface drivers when that changes,
// and owns the buffer pools used when this node forwards for others.

pub mod checker;
pub mod clock;
pub mod config;
pub mod net;
pub mod nid;
pub mod peer;
pub mod ping;
pub mod pool;
pub mod routing;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

use thiserror::Error;

pub use checker::{CheckerState, RouterChecker};
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use config::{ConfigError, ExecutionModel, ForwardingMode, RouterConfig};
pub use net::{BufferHandle, EventSink, InterfaceDriver, NetError, NetEvent, NetEventKind, NetworkLayer};
pub use nid::{AddressParseError, LndType, NetId, Nid};
pub use peer::{Peer, PeerRouterState, RouterCheckData, RouterInfo};
pub use ping::{ByteOrder, NiState, NiStatus, PingInfo, ProtocolError};
pub use pool::{Admission, BufferPool, ForwardId, PoolClass, PoolStats, RouterBuffer, RouterPools};
pub use routing::{LocalInterface, RemoteNet, Route, RouteRecord, Router};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouterError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Not found")]
    NotFound,
    #[error("Configuration conflict: {0}")]
    ConfigurationConflict(String),
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Network error: {0}")]
    Network(#[from] NetError),
    #[error("Router checker already running")]
    AlreadyRunning,
    #[error("Router checker not running")]
    NotRunning,
    #[error("Shutting down")]
    ShuttingDown,
    #[error("Buffer pool busy: {0}")]
    PoolBusy(String),
}

impl From<ConfigError> for RouterError {
    fn from(err: ConfigError) -> Self {
        RouterError::InvalidArgument(err.to_string())
    }
}
