//! Traffic packets and the fair per-flow send queue.

use std::collections::VecDeque;
use std::time::Instant;

use crate::identity::{NodeKey, KEY_LEN};
use crate::wire::{self, PeerPort};

/// Ordinary application traffic.
pub(crate) const TRAFFIC_KIND_STANDARD: u8 = 0;

/// A user traffic packet routed through the network.
#[derive(Debug, Clone)]
pub(crate) struct TrafficPacket {
    pub path: Vec<PeerPort>,
    pub from: Vec<PeerPort>,
    pub source: NodeKey,
    pub dest: NodeKey,
    pub watermark: u64,
    pub kind: u8,
    pub payload: Vec<u8>,
}

impl TrafficPacket {
    pub fn new(source: NodeKey, dest: NodeKey, payload: Vec<u8>) -> Self {
        Self {
            path: Vec::new(),
            from: Vec::new(),
            source,
            dest,
            watermark: u64::MAX,
            kind: TRAFFIC_KIND_STANDARD,
            payload,
        }
    }

    pub fn to_wire(&self) -> wire::Traffic {
        wire::Traffic {
            path: self.path.clone(),
            from: self.from.clone(),
            source: self.source,
            dest: self.dest,
            watermark: self.watermark,
            kind: self.kind,
            payload: self.payload.clone(),
        }
    }

    pub fn from_wire(tr: wire::Traffic) -> Self {
        Self {
            path: tr.path,
            from: tr.from,
            source: tr.source,
            dest: tr.dest,
            watermark: tr.watermark,
            kind: tr.kind,
            payload: tr.payload,
        }
    }

    /// Encoded size, used for queue accounting.
    pub fn wire_size(&self) -> u64 {
        (wire::path_len(&self.path)
            + wire::path_len(&self.from)
            + 2 * KEY_LEN
            + wire::uvarint_len(self.watermark)
            + 1
            + self.payload.len()) as u64
    }
}

// ---------------------------------------------------------------------------
// Fair send queue
// ---------------------------------------------------------------------------
//
// Packets group into lanes by destination, and within a lane into flows by
// source. Popping takes the oldest packet anywhere; shedding under
// pressure takes from the heaviest flow inside the heaviest lane, so one
// loud flow starves itself before it starves anyone else.

struct Queued {
    packet: TrafficPacket,
    size: u64,
    since: Instant,
}

struct Flow {
    source: NodeKey,
    packets: VecDeque<Queued>,
    bytes: u64,
}

impl Flow {
    fn oldest(&self) -> Option<Instant> {
        self.packets.front().map(|q| q.since)
    }
}

struct Lane {
    dest: NodeKey,
    flows: Vec<Flow>,
    bytes: u64,
}

impl Lane {
    fn oldest(&self) -> Option<Instant> {
        self.flows.iter().filter_map(Flow::oldest).min()
    }
}

/// Per-destination, per-source fair packet queue.
pub(crate) struct PacketQueue {
    lanes: Vec<Lane>,
    bytes: u64,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self {
            lanes: Vec::new(),
            bytes: 0,
        }
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    pub fn push(&mut self, packet: TrafficPacket) {
        let size = packet.wire_size();
        let entry = Queued {
            size,
            since: Instant::now(),
            packet,
        };

        let dest = entry.packet.dest;
        let lane = match self.lanes.iter_mut().find(|l| l.dest == dest) {
            Some(lane) => lane,
            None => {
                self.lanes.push(Lane {
                    dest,
                    flows: Vec::new(),
                    bytes: 0,
                });
                self.lanes.last_mut().unwrap()
            }
        };
        let source = entry.packet.source;
        let flow = match lane.flows.iter_mut().find(|f| f.source == source) {
            Some(flow) => flow,
            None => {
                lane.flows.push(Flow {
                    source,
                    packets: VecDeque::new(),
                    bytes: 0,
                });
                lane.flows.last_mut().unwrap()
            }
        };

        flow.bytes += size;
        lane.bytes += size;
        self.bytes += size;
        flow.packets.push_back(entry);
    }

    /// Take the oldest packet across every lane and flow.
    pub fn pop(&mut self) -> Option<TrafficPacket> {
        let lane_idx = (0..self.lanes.len()).min_by_key(|&i| self.lanes[i].oldest())?;
        let lane = &mut self.lanes[lane_idx];
        let flow_idx = (0..lane.flows.len()).min_by_key(|&i| lane.flows[i].oldest())?;
        Some(self.take_from(lane_idx, flow_idx))
    }

    /// Shed the oldest packet of the heaviest flow in the heaviest lane.
    /// Returns true if anything was shed.
    pub fn shed_largest(&mut self) -> bool {
        let Some(lane_idx) = (0..self.lanes.len()).max_by_key(|&i| self.lanes[i].bytes) else {
            return false;
        };
        let lane = &self.lanes[lane_idx];
        let Some(flow_idx) = (0..lane.flows.len()).max_by_key(|&i| lane.flows[i].bytes) else {
            return false;
        };
        self.take_from(lane_idx, flow_idx);
        true
    }

    fn take_from(&mut self, lane_idx: usize, flow_idx: usize) -> TrafficPacket {
        let lane = &mut self.lanes[lane_idx];
        let flow = &mut lane.flows[flow_idx];
        let entry = flow.packets.pop_front().expect("flows are never empty");
        flow.bytes -= entry.size;
        lane.bytes -= entry.size;
        self.bytes -= entry.size;
        if flow.packets.is_empty() {
            lane.flows.swap_remove(flow_idx);
        }
        if lane.flows.is_empty() {
            self.lanes.swap_remove(lane_idx);
        }
        entry.packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(src: u8, dst: u8, payload: &[u8]) -> TrafficPacket {
        TrafficPacket::new(
            NodeKey::from([src; 32]),
            NodeKey::from([dst; 32]),
            payload.to_vec(),
        )
    }

    #[test]
    fn pop_is_fifo_across_flows() {
        let mut q = PacketQueue::new();
        q.push(packet(1, 2, b"first"));
        q.push(packet(3, 4, b"second"));
        q.push(packet(1, 4, b"third"));
        assert!(!q.is_empty());

        assert_eq!(q.pop().unwrap().payload, b"first");
        assert_eq!(q.pop().unwrap().payload, b"second");
        assert_eq!(q.pop().unwrap().payload, b"third");
        assert!(q.is_empty());
        assert!(q.pop().is_none());
        assert_eq!(q.bytes(), 0);
    }

    #[test]
    fn shed_hits_the_heaviest_flow() {
        let mut q = PacketQueue::new();
        // A noisy flow and a quiet one.
        for _ in 0..3 {
            q.push(packet(1, 2, &[0; 200]));
        }
        q.push(packet(3, 4, &[0; 10]));

        assert!(q.shed_largest());
        // The quiet flow is untouched; the noisy one lost a packet.
        let mut remaining = Vec::new();
        while let Some(p) = q.pop() {
            remaining.push(p.payload.len());
        }
        assert_eq!(remaining.iter().filter(|&&n| n == 200).count(), 2);
        assert_eq!(remaining.iter().filter(|&&n| n == 10).count(), 1);
        assert!(!PacketQueue::new().shed_largest());
    }

    #[test]
    fn byte_accounting_tracks_wire_size() {
        let mut q = PacketQueue::new();
        let mut p = packet(1, 2, b"payload bytes");
        p.path = vec![1, 2, 300];
        p.from = vec![4];
        p.watermark = 1 << 20;

        let mut encoded = Vec::new();
        p.to_wire().encode(&mut encoded);
        assert_eq!(p.wire_size(), encoded.len() as u64);

        q.push(p.clone());
        assert_eq!(q.bytes(), p.wire_size());
        q.pop();
        assert_eq!(q.bytes(), 0);
    }
}
