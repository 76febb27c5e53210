use std::sync::Arc;
use std::time::Duration;

use crate::identity::NodeKey;

/// Configuration for a treespan PacketConn.
pub struct Config {
    /// How often to refresh our own tree announcement. Default: 45 minutes.
    pub router_refresh: Duration,
    /// Timeout before marking another node's info as expired. An expired
    /// info is deleted after a second full timeout period. Default: 1 hour.
    pub router_timeout: Duration,
    /// Bound on the announcement store size. Default: 65535.
    pub router_max_infos: usize,
    /// When true, per-peer Merkle trees carry only the local ancestry plus
    /// that peer's ancestry (contents prescribed by an external multicast
    /// layer). When false (default), they carry the full info set.
    pub bloom_multicast_enabled: bool,
    /// Delay before sending a keepalive to an idle peer. Default: 1 second.
    pub peer_keepalive: Duration,
    /// Read deadline before considering a peer dead. Default: 2.5 seconds.
    pub peer_timeout: Duration,
    /// Timeout before dropping an unused source route. Default: 1 minute.
    pub path_timeout: Duration,
    /// Minimum interval between path lookups to the same destination. Default: 1 second.
    pub path_throttle: Duration,
    /// Seed for the (non-cryptographic) refresh-jitter RNG. Default: from entropy.
    pub jitter_seed: Option<u64>,
    /// Callback invoked when a new path is discovered.
    pub path_notify: Option<Arc<dyn Fn(NodeKey) + Send + Sync>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            router_refresh: Duration::from_secs(45 * 60),
            router_timeout: Duration::from_secs(60 * 60),
            router_max_infos: 65535,
            bloom_multicast_enabled: false,
            peer_keepalive: Duration::from_secs(1),
            peer_timeout: Duration::from_millis(2500),
            path_timeout: Duration::from_secs(60),
            path_throttle: Duration::from_secs(1),
            jitter_seed: None,
            path_notify: None,
        }
    }
}

impl Config {
    pub fn with_router_refresh(mut self, d: Duration) -> Self {
        self.router_refresh = d;
        self
    }

    pub fn with_router_timeout(mut self, d: Duration) -> Self {
        self.router_timeout = d;
        self
    }

    pub fn with_router_max_infos(mut self, max: usize) -> Self {
        self.router_max_infos = max;
        self
    }

    pub fn with_bloom_multicast_enabled(mut self, enabled: bool) -> Self {
        self.bloom_multicast_enabled = enabled;
        self
    }

    pub fn with_peer_keepalive(mut self, d: Duration) -> Self {
        self.peer_keepalive = d;
        self
    }

    pub fn with_peer_timeout(mut self, d: Duration) -> Self {
        self.peer_timeout = d;
        self
    }

    pub fn with_path_timeout(mut self, d: Duration) -> Self {
        self.path_timeout = d;
        self
    }

    pub fn with_path_throttle(mut self, d: Duration) -> Self {
        self.path_throttle = d;
        self
    }

    pub fn with_jitter_seed(mut self, seed: u64) -> Self {
        self.jitter_seed = Some(seed);
        self
    }

    pub fn with_path_notify(mut self, f: impl Fn(NodeKey) + Send + Sync + 'static) -> Self {
        self.path_notify = Some(Arc::new(f));
        self
    }
}
