//! Peer connection management.
//!
//! Each peer connection runs two tokio tasks:
//! - **Reader**: reads length-prefixed frames, decodes and verifies them,
//!   dispatches to the router, and executes the resulting actions.
//! - **Writer**: receives outbound frames via an mpsc channel, drains the
//!   per-peer traffic queue after each write, and sends a keepalive after
//!   one keepalive period without any outgoing frame.
//!
//! Frames are `u16` big-endian length followed by that many bytes, the
//! first of which is the packet type tag. A read that stalls past the peer
//! timeout tears the connection down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::identity::NodeKey;
use crate::router::{PeerEntry, PeerId, Router, RouterAction, RouterAnnounce};
use crate::traffic::{PacketQueue, TrafficPacket};
use crate::wire::{self, PeerPort};

/// Upper bound on bytes queued for one peer before old traffic is dropped.
const TRAFFIC_QUEUE_MAX_BYTES: u64 = 1 << 20;

/// Messages sent from the system to a peer's writer task.
#[derive(Debug)]
pub(crate) enum PeerMessage {
    /// Raw frame bytes to write (already length-prefixed).
    SendFrame(Vec<u8>),
}

/// Handle to a peer's writer task.
pub(crate) struct PeerHandle {
    pub id: PeerId,
    pub key: NodeKey,
    pub port: PeerPort,
    pub prio: u8,
    pub order: u64,
    pub tx: mpsc::Sender<PeerMessage>,
    pub cancel: CancellationToken,
    /// Overflow queue for outbound traffic when the writer is busy.
    pub traffic_queue: Arc<tokio::sync::Mutex<PacketQueue>>,
}

impl PeerHandle {
    pub fn to_entry(&self) -> PeerEntry {
        PeerEntry {
            id: self.id,
            key: self.key,
            port: self.port,
            prio: self.prio,
            order: self.order,
        }
    }
}

/// Manages all peer connections.
pub(crate) struct Peers {
    next_id: PeerId,
    /// Ports currently allocated to peer keys.
    used_ports: HashMap<PeerPort, NodeKey>,
    /// Active peer handles, grouped by public key.
    pub handles: HashMap<NodeKey, HashMap<PeerId, PeerHandle>>,
    /// Connection order counter.
    order: u64,
}

impl Peers {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            used_ports: HashMap::new(),
            handles: HashMap::new(),
            order: 0,
        }
    }

    /// Allocate a new peer handle. Parallel links to an already-known key
    /// share its port; otherwise the lowest free port is taken (port 0 is
    /// the self-root marker and never allocated).
    pub fn allocate_peer(
        &mut self,
        key: NodeKey,
        prio: u8,
        tx: mpsc::Sender<PeerMessage>,
        cancel: CancellationToken,
    ) -> PeerHandle {
        let id = self.next_id;
        self.next_id += 1;

        let port = match self
            .handles
            .get(&key)
            .and_then(|links| links.values().next())
        {
            Some(existing) => existing.port,
            None => {
                let mut port: PeerPort = 1;
                while self.used_ports.contains_key(&port) {
                    port += 1;
                }
                self.used_ports.insert(port, key);
                port
            }
        };

        let order = self.order;
        self.order += 1;

        let handle = PeerHandle {
            id,
            key,
            port,
            prio,
            order,
            tx,
            cancel,
            traffic_queue: Arc::new(tokio::sync::Mutex::new(PacketQueue::new())),
        };
        self.handles.entry(key).or_insert_with(HashMap::new).insert(
            id,
            PeerHandle {
                id,
                key,
                port,
                prio,
                order,
                tx: handle.tx.clone(),
                cancel: handle.cancel.clone(),
                traffic_queue: handle.traffic_queue.clone(),
            },
        );
        handle
    }

    /// Remove a peer by ID. Returns the port it used.
    pub fn remove_peer(&mut self, id: PeerId, key: &NodeKey) -> Option<PeerPort> {
        let links = self.handles.get_mut(key)?;
        let port = links.get(&id).map(|h| h.port);
        links.remove(&id);
        if links.is_empty() {
            self.handles.remove(key);
            if let Some(p) = port {
                self.used_ports.remove(&p);
            }
        }
        port
    }

    /// Send a message to a specific peer without blocking the caller.
    pub fn send_to_peer(&self, peer_id: PeerId, msg: PeerMessage) -> bool {
        for links in self.handles.values() {
            if let Some(handle) = links.get(&peer_id) {
                match handle.tx.try_send(msg) {
                    Ok(_) => return true,
                    Err(mpsc::error::TrySendError::Full(msg)) => {
                        let tx = handle.tx.clone();
                        tokio::spawn(async move {
                            let _ = tx.send(msg).await;
                        });
                        return true;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return false,
                }
            }
        }
        false
    }

    pub fn get_handle(&self, peer_id: PeerId) -> Option<&PeerHandle> {
        self.handles.values().find_map(|links| links.get(&peer_id))
    }
}

// ---------------------------------------------------------------------------
// Frame encoding for outbound actions
// ---------------------------------------------------------------------------

/// Encode a router action into a frame for its target peer. Returns None
/// for actions that aren't peer sends, and for frames too large for the
/// 16-bit length prefix (silently dropped).
pub(crate) fn encode_action_frame(action: &RouterAction) -> Option<(PeerId, Vec<u8>)> {
    let (peer_id, packet_type, body) = match action {
        RouterAction::SendSigReq { peer_id, req } => {
            let mut body = Vec::new();
            req.encode(&mut body);
            (*peer_id, wire::PacketType::SigReq, body)
        }
        RouterAction::SendSigRes { peer_id, res } => {
            let mut body = Vec::new();
            res.encode(&mut body);
            (*peer_id, wire::PacketType::SigRes, body)
        }
        RouterAction::SendAnnounce { peer_id, ann } => {
            let mut body = Vec::new();
            ann.encode(&mut body);
            (*peer_id, wire::PacketType::Announce, body)
        }
        RouterAction::SendMerkleReq { peer_id, req } => {
            let mut body = Vec::new();
            req.encode(&mut body);
            (*peer_id, wire::PacketType::MerkleReq, body)
        }
        RouterAction::SendMerkleRes { peer_id, res } => {
            let mut body = Vec::new();
            res.encode(&mut body);
            (*peer_id, wire::PacketType::MerkleRes, body)
        }
        RouterAction::SendPathLookup { peer_id, lookup } => {
            let mut body = Vec::new();
            lookup.encode(&mut body);
            (*peer_id, wire::PacketType::PathLookup, body)
        }
        RouterAction::SendPathNotify { peer_id, notify } => {
            let mut body = Vec::new();
            notify.encode(&mut body);
            (*peer_id, wire::PacketType::PathNotify, body)
        }
        RouterAction::SendPathBroken { peer_id, broken } => {
            let mut body = Vec::new();
            broken.encode(&mut body);
            (*peer_id, wire::PacketType::PathBroken, body)
        }
        RouterAction::SendTraffic { peer_id, traffic } => {
            let mut body = Vec::new();
            traffic.to_wire().encode(&mut body);
            (*peer_id, wire::PacketType::Traffic, body)
        }
        RouterAction::DeliverTraffic { .. } | RouterAction::PathNotifyCallback { .. } => {
            return None
        }
    };
    wire::encode_frame(packet_type, &body).map(|frame| (peer_id, frame))
}

// ---------------------------------------------------------------------------
// Action dispatch
// ---------------------------------------------------------------------------

/// Send traffic to a peer, spilling into its queue when the channel is full.
async fn send_traffic_to_peer(
    peers: &Arc<tokio::sync::Mutex<Peers>>,
    peer_id: PeerId,
    traffic: TrafficPacket,
) {
    let peers_lock = peers.lock().await;
    let Some(handle) = peers_lock.get_handle(peer_id) else {
        return;
    };
    let mut body = Vec::new();
    traffic.to_wire().encode(&mut body);
    let Some(frame) = wire::encode_frame(wire::PacketType::Traffic, &body) else {
        return; // oversized frames are silently dropped
    };
    let tx = handle.tx.clone();
    let queue = handle.traffic_queue.clone();
    drop(peers_lock);

    match tx.try_send(PeerMessage::SendFrame(frame)) {
        Ok(_) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            // Writer is saturated; queue the packet and let the writer
            // drain it after its next write. Oldest-from-largest-flow is
            // shed once the queue is over budget.
            let mut q = queue.lock().await;
            q.push(traffic);
            while q.bytes() > TRAFFIC_QUEUE_MAX_BYTES {
                if !q.shed_largest() {
                    break;
                }
            }
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

/// Execute a batch of router actions.
pub(crate) async fn dispatch_actions(
    actions: Vec<RouterAction>,
    peers: &Arc<tokio::sync::Mutex<Peers>>,
    traffic_tx: &mpsc::Sender<TrafficPacket>,
    path_notify_cb: &Option<Arc<dyn Fn(NodeKey) + Send + Sync>>,
) {
    for action in actions {
        match action {
            RouterAction::DeliverTraffic { traffic } => {
                if traffic_tx.try_send(traffic).is_err() {
                    tracing::trace!("receive channel full, dropping delivered traffic");
                }
            }
            RouterAction::SendTraffic { peer_id, traffic } => {
                send_traffic_to_peer(peers, peer_id, traffic).await;
            }
            RouterAction::PathNotifyCallback { key } => {
                if let Some(cb) = path_notify_cb {
                    cb(key);
                }
            }
            other => {
                if let Some((peer_id, frame)) = encode_action_frame(&other) {
                    let peers = peers.lock().await;
                    let _ = peers.send_to_peer(peer_id, PeerMessage::SendFrame(frame));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Peer reader
// ---------------------------------------------------------------------------

/// Read and handle frames from one peer until it disconnects or errors.
/// Decode failures terminate this peer only; signature failures drop the
/// offending message and keep reading.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn peer_reader(
    peer_id: PeerId,
    peer_key: NodeKey,
    our_key: NodeKey,
    port: PeerPort,
    conn_read: impl tokio::io::AsyncRead + Unpin + Send,
    router: Arc<tokio::sync::Mutex<Router>>,
    peers: Arc<tokio::sync::Mutex<Peers>>,
    traffic_tx: mpsc::Sender<TrafficPacket>,
    path_notify_cb: Option<Arc<dyn Fn(NodeKey) + Send + Sync>>,
    cancel: CancellationToken,
    peer_timeout: Duration,
) {
    let mut reader = BufReader::new(conn_read);
    let mut len_buf = [0u8; 2];
    let mut buf = vec![0u8; wire::MAX_FRAME_CONTENT];

    loop {
        let read_result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = tokio::time::timeout(peer_timeout, reader.read_exact(&mut len_buf)) => result,
        };
        match read_result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::info!(peer_id, "read error: {}, closing connection", e);
                break;
            }
            Err(_) => {
                tracing::info!(peer_id, "peer timed out, closing connection");
                break;
            }
        }

        let size = u16::from_be_bytes(len_buf) as usize;
        let read_result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = tokio::time::timeout(peer_timeout, reader.read_exact(&mut buf[..size])) => result,
        };
        match read_result {
            Ok(Ok(_)) => {}
            _ => break,
        }

        let frame = &buf[..size];
        if frame.is_empty() {
            continue; // bare keepalive
        }
        let Ok(ptype) = wire::PacketType::try_from(frame[0]) else {
            tracing::warn!(peer_id, "unrecognized packet type {}", frame[0]);
            break;
        };
        let body = &frame[1..];

        let actions = match ptype {
            wire::PacketType::Dummy => continue,
            wire::PacketType::SigReq => {
                let mut d = wire::Decoder::new(body);
                let Ok(req) = wire::SigReq::decode(&mut d) else {
                    break;
                };
                let router = router.lock().await;
                vec![router.handle_request(peer_id, &peer_key, port, &req)]
            }
            wire::PacketType::SigRes => {
                let mut d = wire::Decoder::new(body);
                let Ok(res) = wire::SigRes::decode(&mut d) else {
                    break;
                };
                // The attestation covers (us, peer, req, port-at-peer).
                let bs = wire::sig_res_bytes(&our_key, &peer_key, res.seq, res.nonce, res.port);
                if !peer_key.verifies(&bs, &res.psig) {
                    tracing::warn!(peer_id, "dropping sig res with bad signature");
                    continue;
                }
                let mut router = router.lock().await;
                router.handle_response(&peer_key, &res)
            }
            wire::PacketType::Announce => {
                let Ok(ann) = wire::Announce::decode(body) else {
                    break;
                };
                let router_ann = RouterAnnounce::from_wire(&ann);
                if !router_ann.check() {
                    tracing::warn!(peer_id, "dropping announce that fails verification");
                    continue;
                }
                let mut router = router.lock().await;
                router.handle_announce(&router_ann)
            }
            wire::PacketType::MerkleReq => {
                let mut d = wire::Decoder::new(body);
                let Ok(req) = wire::MerkleReq::decode(&mut d) else {
                    break;
                };
                let router = router.lock().await;
                router.handle_merkle_req(peer_id, &peer_key, &req)
            }
            wire::PacketType::MerkleRes => {
                let mut d = wire::Decoder::new(body);
                let Ok(res) = wire::MerkleRes::decode(&mut d) else {
                    break;
                };
                let router = router.lock().await;
                router.handle_merkle_res(peer_id, &peer_key, &res)
            }
            wire::PacketType::PathLookup => {
                let Ok(lookup) = wire::PathLookup::decode(body) else {
                    break;
                };
                let mut router = router.lock().await;
                router.handle_lookup(&peer_key, &lookup)
            }
            wire::PacketType::PathNotify => {
                let Ok(notify) = wire::PathNotify::decode(body) else {
                    break;
                };
                let mut router = router.lock().await;
                router.handle_notify(&notify)
            }
            wire::PacketType::PathBroken => {
                let Ok(broken) = wire::PathBroken::decode(body) else {
                    break;
                };
                let mut router = router.lock().await;
                router.handle_broken(&broken)
            }
            wire::PacketType::Traffic => {
                let Ok(tr) = wire::Traffic::decode(body) else {
                    break;
                };
                let mut router = router.lock().await;
                router.handle_traffic(TrafficPacket::from_wire(tr))
            }
        };
        dispatch_actions(actions, &peers, &traffic_tx, &path_notify_cb).await;
    }

    // Peer disconnected: unregister it everywhere, then run the fallout.
    let actions = {
        let mut router = router.lock().await;
        router.remove_peer(peer_id, &peer_key, port)
    };
    {
        let mut peers_lock = peers.lock().await;
        peers_lock.remove_peer(peer_id, &peer_key);
    }
    dispatch_actions(actions, &peers, &traffic_tx, &path_notify_cb).await;
    cancel.cancel();
}

// ---------------------------------------------------------------------------
// Peer writer
// ---------------------------------------------------------------------------

/// Write frames to one peer. The keepalive deadline is pushed back on
/// every outgoing frame; when it fires, a Dummy frame goes out instead.
pub(crate) async fn peer_writer(
    peer_id: PeerId,
    mut rx: mpsc::Receiver<PeerMessage>,
    mut conn_write: impl tokio::io::AsyncWrite + Unpin + Send,
    traffic_queue: Arc<tokio::sync::Mutex<PacketQueue>>,
    keepalive: Duration,
    cancel: CancellationToken,
) {
    let keepalive_frame =
        wire::encode_frame(wire::PacketType::Dummy, &[]).expect("keepalive frame fits");
    let mut deadline = tokio::time::Instant::now() + keepalive;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = rx.recv() => {
                let Some(PeerMessage::SendFrame(data)) = msg else { break };
                if conn_write.write_all(&data).await.is_err() {
                    break;
                }
                drain_traffic_queue(peer_id, &traffic_queue, &mut conn_write).await;
                if conn_write.flush().await.is_err() {
                    break;
                }
                deadline = tokio::time::Instant::now() + keepalive;
            }
            _ = tokio::time::sleep_until(deadline) => {
                tracing::trace!(peer_id, "sending keepalive");
                if conn_write.write_all(&keepalive_frame).await.is_err() {
                    break;
                }
                if conn_write.flush().await.is_err() {
                    break;
                }
                deadline = tokio::time::Instant::now() + keepalive;
            }
        }
    }
    cancel.cancel();
}

/// Drain queued traffic packets after a successful write.
async fn drain_traffic_queue<W: tokio::io::AsyncWrite + Unpin>(
    peer_id: PeerId,
    queue: &Arc<tokio::sync::Mutex<PacketQueue>>,
    writer: &mut W,
) {
    loop {
        let traffic = {
            let mut q = queue.lock().await;
            q.pop()
        };
        let Some(traffic) = traffic else { break };

        let mut body = Vec::new();
        traffic.to_wire().encode(&mut body);
        let Some(frame) = wire::encode_frame(wire::PacketType::Traffic, &body) else {
            continue;
        };
        if writer.write_all(&frame).await.is_err() {
            tracing::debug!(peer_id, "failed to write queued traffic");
            break;
        }
    }
}
