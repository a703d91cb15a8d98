//! The interfaces this crate consumes from the surrounding system: the socket multiplexer that
//!  owns physical sockets, and the peer finder (DHT / rendezvous lookup).

use std::fmt::{Debug, Formatter};
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::endpoint::{Endpoint, Family};
use crate::error::BdtResult;
use crate::peer::PeerInfo;

/// Opaque identification of a physical socket owned by the transport
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SocketId(pub u64);

impl Debug for SocketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "S{}", self.0)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SendOptions {
    pub preferred_socket: Option<SocketId>,
    /// send to all candidate endpoints rather than the one that worked most recently
    pub ignore_route_cache: bool,
    /// for reliable streams: drop the package rather than queueing it if the stream is busy
    pub drop_if_busy: bool,
    pub max_delay: Option<Duration>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SendStatus {
    Sent,
    /// a reliable stream did not accept (all of) the package right away; the transport reports
    ///  when it can accept more via `Stack::on_stream_writable`
    Busy,
}

/// An ephemeral socket opened for NAT traversal. It is owned by exactly one hole punching
///  attempt; implementations close the physical socket when this is dropped.
pub trait DynamicSocket: Send + Sync {
    fn id(&self) -> SocketId;
}

/// The socket multiplexer. Inbound packages are delivered to `Stack::deliver` /
///  `Stack::deliver_bytes`, which the transport calls for every received package.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// sends the buffer to the given candidate endpoints (all of them or a subset, depending on
    ///  the transport's route cache and the options)
    async fn send(&self, buf: &[u8], endpoints: &[Endpoint], options: &SendOptions) -> BdtResult<SendStatus>;

    async fn create_dynamic_socket(&self, family: Family) -> BdtResult<Box<dyn DynamicSocket>>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait PeerFinder: Send + Sync + 'static {
    /// rendezvous peers near the given peer id
    async fn find_sn(&self, peerid: &str, from_cache: bool) -> BdtResult<Vec<PeerInfo>>;

    async fn find_peer(&self, peerid: &str) -> Option<PeerInfo>;

    fn local_endpoints(&self) -> Vec<Endpoint>;
}
