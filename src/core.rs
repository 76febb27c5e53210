//! Core coordinator: wires Router + Peers together and provides the public
//! `PacketConn` implementation.
//!
//! - `PacketConnImpl` is the concrete implementation of `types::PacketConn`.
//! - A 1-second maintenance loop sweeps the router's timers and expires
//!   stale pathfinder state.
//! - `add_link()` spawns reader/writer tasks per peer.
//! - `recv_from()` receives delivered traffic via an mpsc channel.
//! - `send_to()` encodes traffic and routes it via the router.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ed25519_dalek::SigningKey;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::identity::{Identity, NodeKey};
use crate::peers::{dispatch_actions, peer_reader, peer_writer, PeerMessage, Peers};
use crate::router::Router;
use crate::traffic::TrafficPacket;
use crate::types::{Error, LinkConn, Result};
use crate::wire;

/// Channel capacity for inbound traffic delivery.
const RECV_CHANNEL_SIZE: usize = 512;

/// Channel capacity for each peer writer.
const PEER_WRITER_CHANNEL_SIZE: usize = 512;

/// The concrete PacketConn implementation.
pub struct PacketConnImpl {
    /// Signing key (identity).
    signing_key: SigningKey,
    /// Our overlay address.
    key: NodeKey,
    /// Configuration.
    config: Config,
    /// The router (shared with peer tasks).
    router: Arc<Mutex<Router>>,
    /// The peer manager (shared with peer tasks).
    peers: Arc<Mutex<Peers>>,
    /// Inbound traffic channel (reader side).
    traffic_rx: Mutex<mpsc::Receiver<TrafficPacket>>,
    /// Inbound traffic channel (writer side, given to peer readers).
    traffic_tx: mpsc::Sender<TrafficPacket>,
    /// Whether this PacketConn is shut down.
    closed: AtomicBool,
    /// Cancellation token for background tasks.
    cancel: CancellationToken,
    /// Path notify callback, invoked outside the router lock.
    path_notify_cb: Option<Arc<dyn Fn(NodeKey) + Send + Sync>>,
    /// Maintenance task handle.
    _maintenance_handle: JoinHandle<()>,
}

impl PacketConnImpl {
    /// Create a new PacketConn with the given private key and config.
    pub fn new(secret: SigningKey, config: Config) -> Self {
        let identity = Identity::from_signing_key(secret.clone());
        let key = identity.key();
        let router = Arc::new(Mutex::new(Router::new(identity, &config)));
        let peers = Arc::new(Mutex::new(Peers::new()));
        let (traffic_tx, traffic_rx) = mpsc::channel(RECV_CHANNEL_SIZE);
        let cancel = CancellationToken::new();
        let path_notify_cb = config.path_notify.clone();

        // Bootstrap: run the first fix so we self-root immediately.
        {
            let router = router.clone();
            let peers = peers.clone();
            let traffic_tx = traffic_tx.clone();
            let path_notify_cb = path_notify_cb.clone();
            tokio::spawn(async move {
                let actions = {
                    let mut router = router.lock().await;
                    router.fix()
                };
                dispatch_actions(actions, &peers, &traffic_tx, &path_notify_cb).await;
            });
        }

        let maintenance_handle = {
            let router = router.clone();
            let peers = peers.clone();
            let traffic_tx = traffic_tx.clone();
            let cancel = cancel.clone();
            let path_notify_cb = path_notify_cb.clone();
            tokio::spawn(maintenance_loop(
                router,
                peers,
                traffic_tx,
                cancel,
                path_notify_cb,
            ))
        };

        Self {
            signing_key: secret,
            key,
            config,
            router,
            peers,
            traffic_rx: Mutex::new(traffic_rx),
            traffic_tx,
            closed: AtomicBool::new(false),
            cancel,
            path_notify_cb,
            _maintenance_handle: maintenance_handle,
        }
    }
}

/// Background maintenance loop: sweeps timers once a second.
async fn maintenance_loop(
    router: Arc<Mutex<Router>>,
    peers: Arc<Mutex<Peers>>,
    traffic_tx: mpsc::Sender<TrafficPacket>,
    cancel: CancellationToken,
    path_notify_cb: Option<Arc<dyn Fn(NodeKey) + Send + Sync>>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.tick().await; // skip the immediate first tick

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let actions = {
            let mut router = router.lock().await;
            let actions = router.check_timers(Instant::now());
            let path_timeout = router.path_timeout;
            router.pathfinder.sweep(path_timeout);
            actions
        };
        if !actions.is_empty() {
            dispatch_actions(actions, &peers, &traffic_tx, &path_notify_cb).await;
        }
    }
}

#[async_trait::async_trait]
impl crate::types::PacketConn for PacketConnImpl {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, NodeKey)> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::Shutdown);
        }
        let traffic = {
            let mut rx = self.traffic_rx.lock().await;
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Shutdown),
                pkt = rx.recv() => pkt.ok_or(Error::Shutdown)?,
            }
        };
        let n = buf.len().min(traffic.payload.len());
        buf[..n].copy_from_slice(&traffic.payload[..n]);
        Ok((n, traffic.source))
    }

    async fn send_to(&self, buf: &[u8], dest: NodeKey) -> Result<usize> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::Shutdown);
        }
        let max = self.max_payload();
        if buf.len() as u64 > max {
            return Err(Error::PayloadTooLarge {
                len: buf.len(),
                max,
            });
        }
        let traffic = TrafficPacket::new(self.key, dest, buf.to_vec());
        let actions = {
            let mut router = self.router.lock().await;
            router.send_traffic(traffic)
        };
        if !actions.is_empty() {
            dispatch_actions(actions, &self.peers, &self.traffic_tx, &self.path_notify_cb).await;
        }
        Ok(buf.len())
    }

    async fn add_link(&self, key: NodeKey, conn: Box<dyn LinkConn>, prio: u8) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::Shutdown);
        }
        if key == self.key {
            return Err(Error::SelfLink);
        }

        let (read_half, write_half) = tokio::io::split(conn);
        let (writer_tx, writer_rx) = mpsc::channel(PEER_WRITER_CHANNEL_SIZE);
        let peer_cancel = CancellationToken::new();

        // Registration and shutdown() serialize on the peers lock: either
        // we observe the closed flag here, or shutdown() sees this handle
        // when it sweeps and cancels.
        let handle = {
            let mut peers = self.peers.lock().await;
            if self.closed.load(Ordering::Relaxed) {
                return Err(Error::Shutdown);
            }
            peers.allocate_peer(key, prio, writer_tx.clone(), peer_cancel.clone())
        };
        let peer_id = handle.id;
        let port = handle.port;
        let entry = handle.to_entry();
        let traffic_queue = handle.traffic_queue.clone();

        let actions = {
            let mut router = self.router.lock().await;
            router.add_peer(entry)
        };
        if !actions.is_empty() {
            dispatch_actions(actions, &self.peers, &self.traffic_tx, &self.path_notify_cb).await;
        }

        // Lead with a keepalive so the remote's read deadline is serviced
        // even before any protocol traffic goes out.
        if let Some(frame) = wire::encode_frame(wire::PacketType::Dummy, &[]) {
            let _ = writer_tx.send(PeerMessage::SendFrame(frame)).await;
        }

        let writer_cancel = peer_cancel.clone();
        let _writer_handle = tokio::spawn(peer_writer(
            peer_id,
            writer_rx,
            write_half,
            traffic_queue,
            self.config.peer_keepalive,
            writer_cancel,
        ));

        // The reader runs in place; it returns when the peer goes away.
        peer_reader(
            peer_id,
            key,
            self.key,
            port,
            read_half,
            self.router.clone(),
            self.peers.clone(),
            self.traffic_tx.clone(),
            self.path_notify_cb.clone(),
            peer_cancel,
            self.config.peer_timeout,
        )
        .await;
        Ok(())
    }

    fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    fn max_payload(&self) -> u64 {
        // Worst-case per-frame overhead: empty paths, maximum watermark,
        // plus the packet type byte.
        let mut scratch = Vec::new();
        wire::Traffic {
            path: vec![],
            from: vec![],
            source: NodeKey::from([0; 32]),
            dest: NodeKey::from([0; 32]),
            watermark: u64::MAX,
            kind: 0,
            payload: vec![],
        }
        .encode(&mut scratch);
        let overhead = scratch.len() + 1;
        (wire::MAX_FRAME_CONTENT as u64).saturating_sub(overhead as u64)
    }

    async fn shutdown(&self) -> Result<()> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return Err(Error::Shutdown);
        }
        self.cancel.cancel();

        let peers = self.peers.lock().await;
        for links in peers.handles.values() {
            for handle in links.values() {
                handle.cancel.cancel();
            }
        }
        Ok(())
    }

    fn local_key(&self) -> NodeKey {
        self.key
    }
}

/// Public peer info returned by `get_peers()`.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub key: NodeKey,
    pub port: u64,
    pub priority: u8,
    /// Connection order; lower values have been up longer.
    pub order: u64,
}

/// Public tree entry returned by `get_tree()`.
#[derive(Clone, Debug)]
pub struct TreeEntry {
    pub key: NodeKey,
    pub parent: NodeKey,
    pub sequence: u64,
    pub expired: bool,
}

/// Public path entry returned by `get_paths()`.
#[derive(Clone, Debug)]
pub struct PathEntry {
    pub key: NodeKey,
    pub path: Vec<wire::PeerPort>,
    pub sequence: u64,
}

impl PacketConnImpl {
    /// Info about all connected peers.
    pub async fn get_peers(&self) -> Vec<PeerInfo> {
        let router = self.router.lock().await;
        let mut result = Vec::new();
        for (key, entries) in &router.peers {
            for entry in entries.values() {
                result.push(PeerInfo {
                    key: *key,
                    port: entry.port,
                    priority: entry.prio,
                    order: entry.order,
                });
            }
        }
        result.sort_by_key(|p| (p.key, p.order));
        result
    }

    /// All known spanning tree entries.
    pub async fn get_tree(&self) -> Vec<TreeEntry> {
        let router = self.router.lock().await;
        let mut result: Vec<TreeEntry> = router
            .infos
            .iter()
            .map(|(key, info)| TreeEntry {
                key: *key,
                parent: info.parent,
                sequence: info.seq,
                expired: info.expired,
            })
            .collect();
        result.sort_by_key(|e| e.key);
        result
    }

    /// Number of known tree entries.
    pub async fn routing_entries(&self) -> usize {
        let router = self.router.lock().await;
        router.infos.len()
    }

    /// Our current tree coordinates (the path from the root).
    pub async fn tree_coordinates(&self) -> Vec<wire::PeerPort> {
        let router = self.router.lock().await;
        let key = router.key;
        let (_root, path) = router.get_root_and_path(&key);
        path
    }

    /// All working cached paths from the pathfinder.
    pub async fn get_paths(&self) -> Vec<PathEntry> {
        let router = self.router.lock().await;
        let mut result: Vec<PathEntry> = router
            .pathfinder
            .live_routes()
            .into_iter()
            .map(|(key, sequence, path)| PathEntry {
                key,
                path,
                sequence,
            })
            .collect();
        result.sort_by_key(|e| e.key);
        result
    }
}

/// Create a new PacketConn. This is the primary public constructor.
pub fn new_packet_conn(secret: SigningKey, config: Config) -> Arc<PacketConnImpl> {
    Arc::new(PacketConnImpl::new(secret, config))
}
