//! Source-routed path discovery on top of the spanning tree.
//!
//! Tree-distance forwarding always works but pays for long tree paths;
//! once real traffic flows we discover the destination's actual tree
//! coordinates and source-route along them. Each destination of interest
//! is one `Target` moving through three states:
//!
//! ```text
//!   (send to unknown key)        (signed notify)          (forwarding fails)
//!  ----------------------> Pending ----------> Live <--------------------
//!                                               |  \------> Broken
//!                                               |   (fresh notify) ^
//!                                               +-----------------/
//! ```
//!
//! A target parks at most one packet while it waits for coordinates, and
//! lookups toward it are throttled as a unit, whatever state it is in.
//! Everything here is owned by the router and runs under its lock.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::identity::{Identity, NodeKey, Sig};
use crate::traffic::TrafficPacket;
use crate::wire::{self, PeerPort};

/// Our own (seq, coordinates) advertisement, signed so lookup answers
/// can't be forged by intermediate nodes.
#[derive(Clone)]
pub(crate) struct SignedCoords {
    pub seq: u64,
    pub coords: Vec<PeerPort>,
    pub sig: Sig,
}

impl SignedCoords {
    /// The bytes the signature covers: varint(seq) then the path.
    pub fn signable(seq: u64, coords: &[PeerPort]) -> Vec<u8> {
        let mut out = Vec::new();
        wire::put_uvarint(&mut out, seq);
        wire::put_path(&mut out, coords);
        out
    }
}

enum TargetState {
    /// A lookup is out; no usable coordinates yet.
    Pending,
    /// A working source route.
    Live { seq: u64, coords: Vec<PeerPort> },
    /// The route failed in flight. The seq survives so a replayed old
    /// notify can't resurrect the same stale route.
    Broken { seq: u64 },
}

struct Target {
    state: TargetState,
    /// One packet held back until coordinates (re)appear. Newer sends
    /// replace older ones; this is a latch, not a queue.
    parked: Option<TrafficPacket>,
    /// When we last flooded a lookup toward this target.
    last_lookup: Option<Instant>,
    /// Freshness base for the expiry sweep.
    touched: Instant,
}

/// What became of an incoming path notify.
pub(crate) enum NotifyVerdict {
    /// Sequence not newer, or identical coordinates on a working route.
    Stale,
    /// We never asked about this source and know nothing of it.
    Unsolicited,
    /// Route stored. Any parked packet comes back to be sent on it.
    Updated { parked: Option<TrafficPacket> },
}

/// Path discovery and caching state.
pub(crate) struct Pathfinder {
    own: SignedCoords,
    targets: HashMap<NodeKey, Target>,
}

impl Pathfinder {
    pub fn new(ident: &Identity) -> Self {
        let sig = ident.sign(&SignedCoords::signable(0, &[]));
        Self {
            own: SignedCoords {
                seq: 0,
                coords: Vec::new(),
                sig,
            },
            targets: HashMap::new(),
        }
    }

    /// The working source route to `dest`, if any.
    pub fn coords_to(&self, dest: &NodeKey) -> Option<&[PeerPort]> {
        match self.targets.get(dest)?.state {
            TargetState::Live { ref coords, .. } => Some(coords),
            _ => None,
        }
    }

    /// Park a packet on its destination's target, creating a Pending
    /// target if this is the first interest in that destination.
    pub fn park(&mut self, packet: TrafficPacket) {
        let target = self
            .targets
            .entry(packet.dest)
            .or_insert_with(|| Target {
                state: TargetState::Pending,
                parked: None,
                last_lookup: None,
                touched: Instant::now(),
            });
        target.parked = Some(packet);
    }

    /// Whether a lookup toward `dest` is currently allowed. One throttle
    /// per target, in every state: re-discovery of a broken route obeys
    /// the same clock as first discovery.
    pub fn may_lookup(&self, dest: &NodeKey, throttle: Duration) -> bool {
        match self.targets.get(dest).and_then(|t| t.last_lookup) {
            Some(at) => at.elapsed() >= throttle,
            None => true,
        }
    }

    /// Note that a lookup toward `dest` went out just now.
    pub fn lookup_sent(&mut self, dest: &NodeKey) {
        if let Some(target) = self.targets.get_mut(dest) {
            target.last_lookup = Some(Instant::now());
        }
    }

    /// Fold a (verified) path notify into the target table.
    pub fn apply_notify(
        &mut self,
        source: NodeKey,
        seq: u64,
        coords: Vec<PeerPort>,
    ) -> NotifyVerdict {
        let Some(target) = self.targets.get_mut(&source) else {
            tracing::debug!("unsolicited path notify from {}", source.fingerprint());
            return NotifyVerdict::Unsolicited;
        };
        match &target.state {
            TargetState::Live {
                seq: have,
                coords: current,
            } => {
                if seq <= *have {
                    return NotifyVerdict::Stale;
                }
                // A working route with unchanged coordinates carries no
                // news, and accepting it would keep resetting the entry.
                if *current == coords {
                    return NotifyVerdict::Stale;
                }
            }
            TargetState::Broken { seq: have } => {
                // Same coordinates are fine here: the destination hasn't
                // moved, but the hops in between may have recovered.
                if seq <= *have {
                    return NotifyVerdict::Stale;
                }
            }
            TargetState::Pending => {}
        }
        target.state = TargetState::Live { seq, coords };
        target.touched = Instant::now();
        NotifyVerdict::Updated {
            parked: target.parked.take(),
        }
    }

    /// Forwarding along `dest`'s route failed; stop using it until a
    /// fresh notify shows up.
    pub fn mark_broken(&mut self, dest: &NodeKey) {
        if let Some(target) = self.targets.get_mut(dest) {
            if let TargetState::Live { seq, .. } = target.state {
                target.state = TargetState::Broken { seq };
            }
        }
    }

    /// We received traffic from `source`; its route is evidently alive.
    pub fn heard_from(&mut self, source: &NodeKey) {
        if let Some(target) = self.targets.get_mut(source) {
            if matches!(target.state, TargetState::Live { .. }) {
                target.touched = Instant::now();
            }
        }
    }

    /// Our current advertisement for `coords`, re-signed only when the
    /// coordinates actually changed.
    pub fn advertise(
        &mut self,
        ident: &Identity,
        coords: Vec<PeerPort>,
        now_secs: u64,
    ) -> SignedCoords {
        if self.own.coords != coords {
            let sig = ident.sign(&SignedCoords::signable(now_secs, &coords));
            self.own = SignedCoords {
                seq: now_secs,
                coords,
                sig,
            };
        }
        self.own.clone()
    }

    /// Drop targets nobody has cared about for a full path timeout.
    pub fn sweep(&mut self, timeout: Duration) {
        let now = Instant::now();
        self.targets.retain(|_, target| {
            let base = match target.state {
                TargetState::Pending => target.last_lookup.unwrap_or(target.touched),
                _ => target.touched,
            };
            now.duration_since(base) < timeout
        });
    }

    /// Working routes, for introspection.
    pub fn live_routes(&self) -> Vec<(NodeKey, u64, Vec<PeerPort>)> {
        self.targets
            .iter()
            .filter_map(|(key, target)| match &target.state {
                TargetState::Live { seq, coords } => Some((*key, *seq, coords.clone())),
                _ => None,
            })
            .collect()
    }
}
