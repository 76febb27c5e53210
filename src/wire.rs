//! Wire protocol: framing, canonical encodings, and message types.
//!
//! Frames are `length(u16 big-endian) | type(u8) | body`. Integers are
//! unsigned LEB128 varints; keys, signatures, and digests are raw
//! fixed-size bytes; paths are varint port sequences terminated by a zero.

use crate::identity::{NodeKey, Sig, KEY_LEN, SIG_LEN};
use crate::merkle::{Digest, DIGEST_LEN, KEY_BITS};
use crate::types::Error;

/// Port identifier for a peer link on the spanning tree.
pub(crate) type PeerPort = u64;

/// Largest frame content (type byte + body) the u16 length prefix allows.
pub(crate) const MAX_FRAME_CONTENT: usize = u16::MAX as usize;

/// Longest legal LEB128 encoding of a u64.
const MAX_UVARINT_LEN: usize = 10;

// ---------------------------------------------------------------------------
// Packet types
// ---------------------------------------------------------------------------

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PacketType {
    Dummy = 0,
    SigReq = 1,
    SigRes = 2,
    Announce = 3,
    MerkleReq = 4,
    MerkleRes = 5,
    PathLookup = 6,
    PathNotify = 7,
    PathBroken = 8,
    Traffic = 9,
}

impl TryFrom<u8> for PacketType {
    type Error = crate::types::Error;
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => Self::Dummy,
            1 => Self::SigReq,
            2 => Self::SigRes,
            3 => Self::Announce,
            4 => Self::MerkleReq,
            5 => Self::MerkleRes,
            6 => Self::PathLookup,
            7 => Self::PathNotify,
            8 => Self::PathBroken,
            9 => Self::Traffic,
            _ => return Err(Error::Decode),
        })
    }
}

// ---------------------------------------------------------------------------
// Varint and path primitives
// ---------------------------------------------------------------------------

/// Append `value` as an unsigned LEB128 varint.
pub(crate) fn put_uvarint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Parse a varint from the front of `data`: (value, bytes consumed).
pub(crate) fn take_uvarint(data: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, &byte) in data.iter().take(MAX_UVARINT_LEN).enumerate() {
        let shift = 7 * i as u32;
        if shift >= 63 && byte > 1 {
            return None; // would overflow u64
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None // ran out of bytes, or the continuation bit never cleared
}

/// Encoded length of a varint.
pub(crate) fn uvarint_len(value: u64) -> usize {
    // One byte per 7 payload bits, at least one.
    ((64 - u64::from(value | 1).leading_zeros() as usize) + 6) / 7
}

/// Append a path as varint ports with a zero terminator.
pub(crate) fn put_path(out: &mut Vec<u8>, path: &[PeerPort]) {
    for &port in path {
        put_uvarint(out, port);
    }
    put_uvarint(out, 0);
}

/// Encoded length of a path, terminator included.
pub(crate) fn path_len(path: &[PeerPort]) -> usize {
    path.iter().map(|&p| uvarint_len(p)).sum::<usize>() + 1
}

// ---------------------------------------------------------------------------
// Decoder cursor
// ---------------------------------------------------------------------------

/// Cursor over a message body. Every field accessor fails with
/// `Error::Decode` on truncated input, and `finish` rejects trailing
/// bytes, so decoders are total by construction.
pub(crate) struct Decoder<'a> {
    data: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn uvarint(&mut self) -> Result<u64, Error> {
        let (value, used) = take_uvarint(self.data).ok_or(Error::Decode)?;
        self.data = &self.data[used..];
        Ok(value)
    }

    pub fn byte(&mut self) -> Result<u8, Error> {
        let (&b, rest) = self.data.split_first().ok_or(Error::Decode)?;
        self.data = rest;
        Ok(b)
    }

    fn fixed<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        if self.data.len() < N {
            return Err(Error::Decode);
        }
        let (head, rest) = self.data.split_at(N);
        self.data = rest;
        let mut out = [0u8; N];
        out.copy_from_slice(head);
        Ok(out)
    }

    pub fn node_key(&mut self) -> Result<NodeKey, Error> {
        self.fixed::<KEY_LEN>().map(NodeKey::from)
    }

    pub fn signature(&mut self) -> Result<Sig, Error> {
        self.fixed::<SIG_LEN>()
    }

    pub fn digest(&mut self) -> Result<Digest, Error> {
        self.fixed::<DIGEST_LEN>()
    }

    pub fn path(&mut self) -> Result<Vec<PeerPort>, Error> {
        let mut path = Vec::new();
        loop {
            match self.uvarint()? {
                0 => return Ok(path),
                port => path.push(port),
            }
        }
    }

    /// Consume whatever is left (e.g. a trailing payload).
    pub fn take_rest(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data).to_vec()
    }

    /// Assert the body was consumed exactly.
    pub fn finish(self) -> Result<(), Error> {
        if self.data.is_empty() {
            Ok(())
        } else {
            Err(Error::Decode)
        }
    }
}

// ---------------------------------------------------------------------------
// Canonical signed bytes
// ---------------------------------------------------------------------------

/// The bytes a parent attestation signs: node || parent || seq || nonce ||
/// port. An announcement's own signature covers the same bytes.
pub(crate) fn sig_res_bytes(
    node: &NodeKey,
    parent: &NodeKey,
    seq: u64,
    nonce: u64,
    port: PeerPort,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 * KEY_LEN + 3 * MAX_UVARINT_LEN);
    out.extend_from_slice(node.as_bytes());
    out.extend_from_slice(parent.as_bytes());
    put_uvarint(&mut out, seq);
    put_uvarint(&mut out, nonce);
    put_uvarint(&mut out, port);
    out
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Signature request: a would-be child's challenge to a candidate parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SigReq {
    pub seq: u64,
    pub nonce: u64,
}

impl SigReq {
    pub fn encode(&self, out: &mut Vec<u8>) {
        put_uvarint(out, self.seq);
        put_uvarint(out, self.nonce);
    }

    pub fn decode(d: &mut Decoder) -> Result<Self, Error> {
        Ok(Self {
            seq: d.uvarint()?,
            nonce: d.uvarint()?,
        })
    }
}

/// Signature response: the parent's attestation, naming the link port.
#[derive(Debug, Clone)]
pub(crate) struct SigRes {
    pub seq: u64,
    pub nonce: u64,
    pub port: PeerPort,
    pub psig: Sig,
}

impl SigRes {
    pub fn encode(&self, out: &mut Vec<u8>) {
        put_uvarint(out, self.seq);
        put_uvarint(out, self.nonce);
        put_uvarint(out, self.port);
        out.extend_from_slice(&self.psig);
    }

    pub fn decode(d: &mut Decoder) -> Result<Self, Error> {
        Ok(Self {
            seq: d.uvarint()?,
            nonce: d.uvarint()?,
            port: d.uvarint()?,
            psig: d.signature()?,
        })
    }
}

/// Tree announcement: a node's signed claim of its parent.
#[derive(Debug, Clone)]
pub(crate) struct Announce {
    pub key: NodeKey,
    pub parent: NodeKey,
    pub sig_res: SigRes,
    pub sig: Sig,
}

impl Announce {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.key.as_bytes());
        out.extend_from_slice(self.parent.as_bytes());
        self.sig_res.encode(out);
        out.extend_from_slice(&self.sig);
    }

    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        let mut d = Decoder::new(data);
        let ann = Self {
            key: d.node_key()?,
            parent: d.node_key()?,
            sig_res: SigRes::decode(&mut d)?,
            sig: d.signature()?,
        };
        d.finish()?;
        Ok(ann)
    }
}

/// Merkle synchronization request: names a subtree by key prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MerkleReq {
    pub prefix_len: u64,
    pub prefix: NodeKey,
}

impl MerkleReq {
    pub fn check(&self) -> bool {
        self.prefix_len <= KEY_BITS as u64
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        put_uvarint(out, self.prefix_len);
        out.extend_from_slice(self.prefix.as_bytes());
    }

    pub fn decode(d: &mut Decoder) -> Result<Self, Error> {
        Ok(Self {
            prefix_len: d.uvarint()?,
            prefix: d.node_key()?,
        })
    }
}

/// Merkle synchronization response: the digest at a subtree prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MerkleRes {
    pub req: MerkleReq,
    pub digest: Digest,
}

impl MerkleRes {
    pub fn encode(&self, out: &mut Vec<u8>) {
        self.req.encode(out);
        out.extend_from_slice(&self.digest);
    }

    pub fn decode(d: &mut Decoder) -> Result<Self, Error> {
        Ok(Self {
            req: MerkleReq::decode(d)?,
            digest: d.digest()?,
        })
    }
}

/// Path lookup request, flooded across tree edges.
#[derive(Debug, Clone)]
pub(crate) struct PathLookup {
    pub source: NodeKey,
    pub dest: NodeKey,
    pub from: Vec<PeerPort>,
}

impl PathLookup {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.source.as_bytes());
        out.extend_from_slice(self.dest.as_bytes());
        put_path(out, &self.from);
    }

    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        let mut d = Decoder::new(data);
        let lookup = Self {
            source: d.node_key()?,
            dest: d.node_key()?,
            from: d.path()?,
        };
        d.finish()?;
        Ok(lookup)
    }
}

/// Signed path info carried inside a PathNotify.
#[derive(Debug, Clone)]
pub(crate) struct PathNotifyInfo {
    pub seq: u64,
    pub path: Vec<PeerPort>,
    pub sig: Sig,
}

impl PathNotifyInfo {
    pub fn encode(&self, out: &mut Vec<u8>) {
        put_uvarint(out, self.seq);
        put_path(out, &self.path);
        out.extend_from_slice(&self.sig);
    }

    pub fn decode(d: &mut Decoder) -> Result<Self, Error> {
        Ok(Self {
            seq: d.uvarint()?,
            path: d.path()?,
            sig: d.signature()?,
        })
    }
}

/// Path notification (the answer to a lookup), source-routed back.
#[derive(Debug, Clone)]
pub(crate) struct PathNotify {
    pub path: Vec<PeerPort>,
    pub watermark: u64,
    pub source: NodeKey,
    pub dest: NodeKey,
    pub info: PathNotifyInfo,
}

impl PathNotify {
    pub fn encode(&self, out: &mut Vec<u8>) {
        put_path(out, &self.path);
        put_uvarint(out, self.watermark);
        out.extend_from_slice(self.source.as_bytes());
        out.extend_from_slice(self.dest.as_bytes());
        self.info.encode(out);
    }

    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        let mut d = Decoder::new(data);
        let notify = Self {
            path: d.path()?,
            watermark: d.uvarint()?,
            source: d.node_key()?,
            dest: d.node_key()?,
            info: PathNotifyInfo::decode(&mut d)?,
        };
        d.finish()?;
        Ok(notify)
    }
}

/// Path broken notification, source-routed back to the traffic source.
#[derive(Debug, Clone)]
pub(crate) struct PathBroken {
    pub path: Vec<PeerPort>,
    pub watermark: u64,
    pub source: NodeKey,
    pub dest: NodeKey,
}

impl PathBroken {
    pub fn encode(&self, out: &mut Vec<u8>) {
        put_path(out, &self.path);
        put_uvarint(out, self.watermark);
        out.extend_from_slice(self.source.as_bytes());
        out.extend_from_slice(self.dest.as_bytes());
    }

    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        let mut d = Decoder::new(data);
        let broken = Self {
            path: d.path()?,
            watermark: d.uvarint()?,
            source: d.node_key()?,
            dest: d.node_key()?,
        };
        d.finish()?;
        Ok(broken)
    }
}

/// User traffic packet.
#[derive(Debug, Clone)]
pub(crate) struct Traffic {
    pub path: Vec<PeerPort>,
    pub from: Vec<PeerPort>,
    pub source: NodeKey,
    pub dest: NodeKey,
    pub watermark: u64,
    pub kind: u8,
    pub payload: Vec<u8>,
}

impl Traffic {
    pub fn encode(&self, out: &mut Vec<u8>) {
        put_path(out, &self.path);
        put_path(out, &self.from);
        out.extend_from_slice(self.source.as_bytes());
        out.extend_from_slice(self.dest.as_bytes());
        put_uvarint(out, self.watermark);
        out.push(self.kind);
        out.extend_from_slice(&self.payload);
    }

    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        let mut d = Decoder::new(data);
        Ok(Self {
            path: d.path()?,
            from: d.path()?,
            source: d.node_key()?,
            dest: d.node_key()?,
            watermark: d.uvarint()?,
            kind: d.byte()?,
            payload: d.take_rest(),
        })
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Build a complete frame. Returns None when the content would overflow
/// the 16-bit length prefix; callers drop such frames silently.
pub(crate) fn encode_frame(packet_type: PacketType, body: &[u8]) -> Option<Vec<u8>> {
    let content_len = body.len() + 1;
    if content_len > MAX_FRAME_CONTENT {
        return None;
    }
    let mut frame = Vec::with_capacity(2 + content_len);
    frame.extend_from_slice(&(content_len as u16).to_be_bytes());
    frame.push(packet_type as u8);
    frame.extend_from_slice(body);
    Some(frame)
}

/// Split one frame off the front of `data`: (type, body, bytes consumed).
/// Zero-length content counts as a Dummy frame.
pub(crate) fn decode_frame(data: &[u8]) -> Result<(PacketType, &[u8], usize), Error> {
    let [hi, lo, rest @ ..] = data else {
        return Err(Error::Decode);
    };
    let length = u16::from_be_bytes([*hi, *lo]) as usize;
    if rest.len() < length {
        return Err(Error::Decode);
    }
    let content = &rest[..length];
    match content.split_first() {
        None => Ok((PacketType::Dummy, content, 2)),
        Some((&tag, body)) => Ok((PacketType::try_from(tag)?, body, 2 + length)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
