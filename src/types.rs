//! Crate-level error type and the public connection traits.

use ed25519_dalek::SigningKey;

use crate::identity::NodeKey;

/// Things that can go wrong at the public surface. Protocol-level problems
/// (bad signatures, stale announcements, unroutable packets) are handled
/// internally by dropping the offending input and never surface here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A peer sent bytes that don't parse as a protocol frame. The
    /// offending link is torn down.
    #[error("malformed wire data")]
    Decode,
    /// The connection has been shut down.
    #[error("connection is shut down")]
    Shutdown,
    /// A payload too large to fit a single frame after routing overhead.
    #[error("payload of {len} bytes exceeds the {max}-byte limit")]
    PayloadTooLarge { len: usize, max: u64 },
    /// Refusing to add a link whose remote key is our own.
    #[error("refusing to peer with ourselves")]
    SelfLink,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A point-to-point transport link to one peer: any async byte stream
/// (TCP, TLS, an in-memory duplex, ...). Authenticating the remote key
/// during connection setup is the transport's business, not ours.
pub trait LinkConn:
    tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static
{
}

impl<T> LinkConn for T where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static
{
}

/// An overlay endpoint: send and receive datagrams addressed by node key,
/// and feed it transport links to directly-connected peers.
#[async_trait::async_trait]
pub trait PacketConn: Send + Sync {
    /// Receive the next datagram. Returns the payload length written into
    /// `buf` and the sender's key.
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, NodeKey)>;

    /// Send a datagram to the node holding `dest`. Delivery is best
    /// effort; unknown destinations trigger path discovery and the packet
    /// is parked until a route turns up.
    async fn send_to(&self, buf: &[u8], dest: NodeKey) -> Result<usize>;

    /// Hand over an established transport link to the peer holding `key`.
    /// Drives the link until it dies; lower `prio` links are preferred
    /// when several reach the same peer.
    async fn add_link(&self, key: NodeKey, conn: Box<dyn LinkConn>, prio: u8) -> Result<()>;

    /// Our own key, i.e. our overlay address.
    fn local_key(&self) -> NodeKey;

    /// Largest payload `send_to` accepts.
    fn max_payload(&self) -> u64;

    /// The signing key behind `local_key`.
    fn signing_key(&self) -> &SigningKey;

    /// Whether `shutdown` has run.
    fn is_shutdown(&self) -> bool;

    /// Tear down all links and background work. Idempotence is an error:
    /// the second call reports `Error::Shutdown`.
    async fn shutdown(&self) -> Result<()>;
}
