//! The transfer engine of an established connection: turns application writes into sequenced
//!  packages and inbound packages into an ordered byte stream.
//!
//! A transfer only sees its connection through [TransferHost], which provides addressed packages
//!  and a way to post them, so it never depends on connection internals.

pub mod tcp;
pub mod udp;

use bytes::Bytes;
use tokio::time::Instant;

use crate::error::BdtResult;
use crate::package::{CommandType, Package};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransferEvent {
    Data(Bytes),
    /// the peer's fin was received in order - no more data will arrive
    EndOfStream,
    /// the send buffer has room again after being (nearly) full
    Drain,
    /// our fin was sent and everything up to and including it is acknowledged
    CloseAcked,
}

pub trait TransferHost {
    /// a package with addressing fields (vports, peer id hashes, session id) filled in for the
    ///  remote side, and sequence fields unset
    fn new_package(&self, cmd_type: CommandType) -> Package;

    /// encodes the package and queues it for sending to the remote side
    fn post_package(&mut self, package: &mut Package);

    fn emit(&mut self, event: TransferEvent);
}

pub trait Transfer: Send {
    /// buffers the data for sending, returning the number of bytes accepted
    fn send(&mut self, host: &mut dyn TransferHost, data: &[u8], now: Instant) -> BdtResult<usize>;

    /// queues a fin behind all buffered data
    fn close(&mut self, host: &mut dyn TransferHost, now: Instant);

    fn on_package(&mut self, host: &mut dyn TransferHost, package: &Package, now: Instant);

    fn on_timer(&mut self, host: &mut dyn TransferHost, now: Instant);

    /// the earliest point in time at which [Transfer::on_timer] has work to do
    fn next_deadline(&self) -> Option<Instant>;

    /// the underlying stream did not accept a package right away
    fn on_stream_busy(&mut self) {}

    /// the underlying stream can accept data again
    fn on_stream_writable(&mut self, _host: &mut dyn TransferHost, _now: Instant) {}
}

/// progress of the local half-close
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum FinState {
    Open,
    /// waiting for buffered data to be sent
    Queued,
    Sent,
    Acked,
}
