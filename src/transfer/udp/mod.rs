//! Reliable, ordered delivery on top of unreliable datagrams.
//!
//! Outgoing data is cut into packages of `min(cwnd / 4, mss)` bytes. Every package is tracked in
//!  the [SendQueue] until it is cumulatively acknowledged, and the flight (sequence distance of
//!  unacknowledged, non-SACKed packages) never exceeds `min(cwnd, remote window)`. Losses are
//!  detected by duplicate acks, SACK skips, an explicit FINAL_ACK from the receiver, or the
//!  retransmission timeout.
//!
//! The receiving side releases packages in sequence order through the [RecvQueue] and acks
//!  either immediately or after an adaptive delay.

mod congestion;
mod recv_queue;
mod rtt;
mod send_queue;

use std::cmp::min;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::UdpTransferConfig;
use crate::error::{BdtError, BdtResult};
use crate::package::{CommandType, Package, PackageFlags};
use crate::send_buffer::{SendBuffer, SendBufferSignal};
use crate::sequence::SeqNum;
use crate::transfer::udp::congestion::{AckOutcome, CongestionState, RenoCongestion};
use crate::transfer::udp::recv_queue::{RecvOutcome, RecvQueue};
use crate::transfer::udp::rtt::RttEstimator;
use crate::transfer::udp::send_queue::SendQueue;
use crate::transfer::{FinState, Transfer, TransferEvent, TransferHost};

/// window sizes are advertised in units of KiB
const WINDOW_UNIT: u32 = 1024;

/// when and how often the receiving side acknowledges
struct AckTiming {
    delay: Duration,
    deadline: Option<Instant>,
    unacked_bytes: u32,
    quick_acks: u32,
    last_arrival: Option<Instant>,

    final_ack_deadline: Option<Instant>,
    final_acks_left: u32,
}

impl AckTiming {
    fn new(config: &UdpTransferConfig) -> AckTiming {
        AckTiming {
            delay: config.ack_delay_initial,
            deadline: None,
            unacked_bytes: 0,
            quick_acks: config.quick_ack_count,
            last_arrival: None,
            final_ack_deadline: None,
            final_acks_left: 0,
        }
    }

    /// Registers an incoming package carrying sequence units. Returns `true` if the ack should go
    ///  out right away, otherwise the delayed ack deadline is armed.
    fn on_received(&mut self, len: usize, config: &UdpTransferConfig, now: Instant) -> bool {
        if let Some(last_arrival) = self.last_arrival {
            let gap = now.duration_since(last_arrival);
            if gap > self.delay {
                self.quick_acks = config.quick_ack_count;
            }
            self.delay = ((self.delay + gap) / 2).clamp(config.ack_delay_min, config.ack_delay_max);
        }
        self.last_arrival = Some(now);
        self.unacked_bytes = self.unacked_bytes.saturating_add(len as u32);

        self.final_acks_left = config.final_ack_times;
        self.final_ack_deadline = Some(now + config.final_ack_interval);

        if self.quick_acks > 0 {
            self.quick_acks -= 1;
            return true;
        }
        if self.unacked_bytes >= 2 * config.mss {
            return true;
        }
        if self.deadline.is_none() {
            self.deadline = Some(now + self.delay);
        }
        false
    }

    fn on_ack_sent(&mut self) {
        self.unacked_bytes = 0;
        self.deadline = None;
    }
}

pub struct UdpTransfer {
    config: UdpTransferConfig,

    send_buffer: SendBuffer,
    send_queue: SendQueue,
    recv_queue: RecvQueue,
    congestion: RenoCongestion,
    rtt: RttEstimator,

    /// in bytes
    remote_window: u32,
    nagle_deadline: Option<Instant>,
    ack: AckTiming,

    fin: FinState,
    remote_fin: bool,
}

impl UdpTransfer {
    /// `next_seq` is the first sequence number this side sends, `next_remote_seq` the first one
    ///  expected from the peer, and `remote_window_size` the window the peer advertised during the
    ///  handshake.
    pub fn new(config: UdpTransferConfig, next_seq: SeqNum, next_remote_seq: SeqNum, remote_window_size: u16) -> UdpTransfer {
        UdpTransfer {
            send_buffer: SendBuffer::new(config.send_buffer_capacity, config.send_buffer_drain_size),
            send_queue: SendQueue::new(next_seq),
            recv_queue: RecvQueue::new(next_remote_seq, config.recv_window),
            congestion: RenoCongestion::new(config.mss, config.initial_ssthresh, config.max_cwnd),
            rtt: RttEstimator::new(config.rto_initial, config.rto_min, config.rto_max),
            remote_window: remote_window_bytes(remote_window_size, config.mss),
            nagle_deadline: None,
            ack: AckTiming::new(&config),
            fin: FinState::Open,
            remote_fin: false,
            config,
        }
    }

    fn advertised_window(&self) -> u16 {
        min(self.recv_queue.window_free() / WINDOW_UNIT, u16::MAX as u32) as u16
    }

    fn rto_deadline(&self) -> Option<Instant> {
        self.send_queue.oldest_unacked()
            .map(|stub| stub.sent_time + self.rtt.rto())
    }

    /// Sends pending retransmissions, and then new data and the fin as far as the window allows.
    ///  `flush` overrides the coalescing delay for a partial package.
    fn try_send(&mut self, host: &mut dyn TransferHost, now: Instant, flush: bool) {
        let ack_seq = self.recv_queue.next_expected();
        let window_size = self.advertised_window();
        while let Some(stub) = self.send_queue.next_resend() {
            debug!("retransmitting {:?} (sent {} times)", stub.package, stub.send_count);
            stub.on_resend(ack_seq, window_size, now);
            host.post_package(&mut stub.package);
            self.ack.on_ack_sent();
        }

        loop {
            let window = min(self.congestion.cwnd(), self.remote_window);
            let flight = self.send_queue.flight_size();
            if flight >= window {
                trace!("window full: flight {}, cwnd {}, remote window {}", flight, self.congestion.cwnd(), self.remote_window);
                break;
            }

            if !self.send_buffer.is_empty() {
                let package_size = min(self.congestion.cwnd() / 4, self.config.mss).max(1) as usize;
                if self.send_buffer.len() < package_size && !flush && self.fin == FinState::Open {
                    if self.nagle_deadline.is_none() {
                        self.nagle_deadline = Some(now + self.config.nagle_delay);
                    }
                    break;
                }

                // a data package takes one sequence unit beyond its payload
                if window - flight < 2 {
                    trace!("window nearly full: flight {}, window {}", flight, window);
                    break;
                }
                let (chunks, signals) = self.send_buffer.head(min(package_size, (window - flight - 1) as usize));
                let mut package = host.new_package(CommandType::Data);
                package.data = concat(chunks);
                self.post_new(host, package, now);
                self.nagle_deadline = None;

                if signals.contains(&SendBufferSignal::Drain) {
                    host.emit(TransferEvent::Drain);
                }
            }
            else if self.fin == FinState::Queued {
                let package = host.new_package(CommandType::Fin);
                debug!("sending fin at {:?}", self.send_queue.next_seq());
                self.post_new(host, package, now);
                self.fin = FinState::Sent;
                break;
            }
            else {
                break;
            }
        }
    }

    /// posts a package carrying new sequence units and starts tracking it
    fn post_new(&mut self, host: &mut dyn TransferHost, mut package: Package, now: Instant) {
        package.header.seq = self.send_queue.next_seq();
        package.header.ack_seq = self.recv_queue.next_expected();
        package.header.window_size = self.advertised_window();
        host.post_package(&mut package);
        self.send_queue.push(package, now);
        self.ack.on_ack_sent();
    }

    /// A pure ack is a data package without payload: it carries the next unsent sequence number
    ///  but does not occupy it.
    fn send_ack(&mut self, host: &mut dyn TransferHost, final_ack: bool) {
        let mut package = host.new_package(CommandType::Data);
        package.header.seq = self.send_queue.next_seq();
        package.header.ack_seq = self.recv_queue.next_expected();
        package.header.window_size = self.advertised_window();
        if self.recv_queue.has_pending() {
            package.set_sack_ranges(&self.recv_queue.sack_ranges());
        }
        if final_ack {
            package.header.flags.insert(PackageFlags::FINAL_ACK);
        }
        trace!("sending ack {:?}", package);
        host.post_package(&mut package);
        self.ack.on_ack_sent();
    }

    fn on_ack_info(&mut self, host: &mut dyn TransferHost, package: &Package, carries_seq: bool, now: Instant) {
        let header = &package.header;
        self.remote_window = remote_window_bytes(header.window_size, self.config.mss);

        let skipped = if header.flags.contains(PackageFlags::SACK) {
            self.send_queue.on_sack(&package.sack_ranges())
        }
        else {
            Vec::new()
        };

        let cumulative = self.send_queue.on_ack(header.ack_seq, self.rtt.rto(), now);
        if let Some(sample) = cumulative.rtt_sample {
            self.rtt.on_sample(sample);
        }

        // a data package that does not advance the ack is not a duplicate ack
        if cumulative.acked > 0 || !carries_seq {
            let outcome = self.congestion.on_ack(
                header.ack_seq,
                cumulative.acked,
                !self.send_queue.is_empty(),
                self.send_queue.next_seq(),
                header.flags.contains(PackageFlags::FINAL_ACK),
            );
            if outcome == AckOutcome::EnterFastRecovery {
                if let Some(oldest) = self.send_queue.oldest_unacked().map(|stub| stub.seq()) {
                    self.send_queue.mark_resend(oldest);
                }
            }
        }
        if self.congestion.state() == CongestionState::FastRecover {
            for seq in skipped {
                self.send_queue.mark_resend(seq);
            }
        }

        if self.fin == FinState::Sent && self.send_queue.is_empty() {
            debug!("fin acknowledged");
            self.fin = FinState::Acked;
            host.emit(TransferEvent::CloseAcked);
        }
    }

    fn on_seq_package(&mut self, host: &mut dyn TransferHost, package: &Package, now: Instant) {
        let immediate = match self.recv_queue.on_package(package.clone()) {
            RecvOutcome::InOrder(released) => {
                let mut immediate = package.header.flags.contains(PackageFlags::RESEND);
                let mut len = 0;
                for p in released {
                    if p.cmd_type() == CommandType::Fin {
                        immediate = true;
                        if !self.remote_fin {
                            debug!("received fin");
                            self.remote_fin = true;
                            host.emit(TransferEvent::EndOfStream);
                        }
                    }
                    else if self.remote_fin {
                        trace!("dropping data after fin: {:?}", p);
                    }
                    else {
                        len += p.data.len();
                        host.emit(TransferEvent::Data(p.data));
                    }
                }
                let quick = self.ack.on_received(len, &self.config, now);
                immediate || quick || self.recv_queue.has_pending()
            }
            RecvOutcome::OutOfOrder | RecvOutcome::Duplicate | RecvOutcome::OutOfWindow => {
                self.ack.on_received(package.data.len(), &self.config, now);
                true
            }
        };

        if immediate {
            self.send_ack(host, false);
        }
    }

    fn on_retransmission_timeout(&mut self) {
        let Some(oldest) = self.send_queue.oldest_unacked().map(|stub| stub.seq()) else {
            return;
        };
        debug!("retransmission timeout for {:?} after {:?}", oldest, self.rtt.rto());
        self.congestion.on_timeout();
        self.rtt.backoff();
        self.send_queue.mark_resend(oldest);
    }
}

impl Transfer for UdpTransfer {
    fn send(&mut self, host: &mut dyn TransferHost, data: &[u8], now: Instant) -> BdtResult<usize> {
        if self.fin != FinState::Open {
            return Err(BdtError::InvalidState);
        }
        let accepted = self.send_buffer.push(data)?;
        self.try_send(host, now, false);
        Ok(accepted)
    }

    fn close(&mut self, host: &mut dyn TransferHost, now: Instant) {
        if self.fin == FinState::Open {
            self.fin = FinState::Queued;
            self.try_send(host, now, true);
        }
    }

    fn on_package(&mut self, host: &mut dyn TransferHost, package: &Package, now: Instant) {
        let carries_seq = match package.cmd_type() {
            CommandType::Fin => true,
            CommandType::Data => package.has_payload(),
            other => {
                trace!("ignoring {:?} in transfer", other);
                return;
            }
        };

        self.on_ack_info(host, package, carries_seq, now);
        if carries_seq {
            self.on_seq_package(host, package, now);
        }
        self.try_send(host, now, false);
    }

    fn on_timer(&mut self, host: &mut dyn TransferHost, now: Instant) {
        if self.ack.deadline.is_some_and(|d| d <= now) {
            self.send_ack(host, false);
        }

        if self.ack.final_ack_deadline.is_some_and(|d| d <= now) {
            self.ack.final_ack_deadline = None;
            if self.ack.final_acks_left > 0 {
                self.ack.final_acks_left -= 1;
                trace!("peer is quiet - re-sending final ack");
                self.send_ack(host, true);
                if self.ack.final_acks_left > 0 {
                    self.ack.final_ack_deadline = Some(now + self.config.final_ack_interval);
                }
            }
        }

        if self.rto_deadline().is_some_and(|d| d <= now) {
            self.on_retransmission_timeout();
        }

        let flush = self.nagle_deadline.is_some_and(|d| d <= now);
        if flush {
            self.nagle_deadline = None;
        }
        self.try_send(host, now, flush);
    }

    fn next_deadline(&self) -> Option<Instant> {
        [self.ack.deadline, self.ack.final_ack_deadline, self.nagle_deadline, self.rto_deadline()]
            .into_iter()
            .flatten()
            .min()
    }
}

/// An advertised window of zero still admits one mss, which serves as the window probe until the
///  peer's next ack reopens it
fn remote_window_bytes(window_size: u16, mss: u32) -> u32 {
    (window_size as u32 * WINDOW_UNIT).max(mss)
}

fn concat(mut chunks: Vec<Bytes>) -> Bytes {
    if chunks.len() == 1 {
        return chunks.pop().unwrap_or_default();
    }

    let mut buf = BytesMut::with_capacity(chunks.iter().map(|c| c.len()).sum());
    for chunk in chunks {
        buf.put_slice(&chunk);
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::RecordingHost;
    use rstest::rstest;
    use std::cmp::max;

    fn config() -> UdpTransferConfig {
        UdpTransferConfig {
            mss: 100,
            initial_ssthresh: 6400,
            max_cwnd: 100_000,
            rto_initial: Duration::from_secs(1),
            rto_min: Duration::from_millis(200),
            rto_max: Duration::from_secs(60),
            ack_delay_initial: Duration::from_millis(40),
            ack_delay_min: Duration::from_millis(5),
            ack_delay_max: Duration::from_millis(100),
            quick_ack_count: 2,
            nagle_delay: Duration::from_millis(10),
            final_ack_interval: Duration::from_secs(5),
            final_ack_times: 3,
            recv_window: 64 * 1024,
            send_buffer_capacity: 10_000,
            send_buffer_drain_size: 2_000,
        }
    }

    struct Side {
        transfer: UdpTransfer,
        host: RecordingHost,
    }

    fn pair(config: UdpTransferConfig) -> (Side, Side) {
        let a = Side {
            transfer: UdpTransfer::new(config.clone(), SeqNum::from_raw(1000), SeqNum::from_raw(5000), 64),
            host: RecordingHost::default(),
        };
        let b = Side {
            transfer: UdpTransfer::new(config, SeqNum::from_raw(5000), SeqNum::from_raw(1000), 64),
            host: RecordingHost::default(),
        };
        (a, b)
    }

    fn deliver(to: &mut Side, packages: Vec<Package>, now: Instant) {
        for p in packages {
            to.transfer.on_package(&mut to.host, &p, now);
        }
    }

    /// Passes packages back and forth over a link without latency until both sides are quiet,
    ///  advancing time to the next deadline whenever nothing is in transit.
    fn exchange(a: &mut Side, b: &mut Side, now: &mut Instant, mut drop: impl FnMut(&Package) -> bool) {
        for _ in 0..10_000 {
            let from_a = a.host.take_posted();
            let from_b = b.host.take_posted();

            if from_a.is_empty() && from_b.is_empty() {
                let next = [a.transfer.next_deadline(), b.transfer.next_deadline()]
                    .into_iter()
                    .flatten()
                    .min();
                match next {
                    None => return,
                    Some(deadline) => {
                        *now = max(*now, deadline);
                        a.transfer.on_timer(&mut a.host, *now);
                        b.transfer.on_timer(&mut b.host, *now);
                        continue;
                    }
                }
            }

            for p in from_a {
                if !drop(&p) {
                    b.transfer.on_package(&mut b.host, &p, *now);
                }
            }
            for p in from_b {
                if !drop(&p) {
                    a.transfer.on_package(&mut a.host, &p, *now);
                }
            }
        }
        panic!("transfer did not settle");
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_small_write_waits_for_nagle() {
        let (mut a, _) = pair(config());
        let now = Instant::now();

        assert_eq!(a.transfer.send(&mut a.host, b"abc", now), Ok(3));
        assert!(a.host.posted.is_empty());
        assert_eq!(a.transfer.next_deadline(), Some(now + Duration::from_millis(10)));

        a.transfer.on_timer(&mut a.host, now + Duration::from_millis(10));
        let posted = a.host.take_posted();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].cmd_type(), CommandType::Data);
        assert_eq!(posted[0].header.seq, SeqNum::from_raw(1000));
        assert_eq!(posted[0].header.ack_seq, SeqNum::from_raw(5000));
        assert_eq!(posted[0].data.as_ref(), b"abc");
    }

    #[test]
    fn test_first_flight_is_limited_by_cwnd() {
        let (mut a, _) = pair(config());
        let now = Instant::now();

        a.transfer.send(&mut a.host, &pattern(1000), now).unwrap();

        // cwnd is one mss, packages are a quarter of it
        let posted = a.host.take_posted();
        let sizes = posted.iter().map(|p| p.data.len()).collect::<Vec<_>>();
        assert_eq!(sizes, vec![25, 25, 25, 21]);
        let seqs = posted.iter().map(|p| p.header.seq.to_raw()).collect::<Vec<_>>();
        assert_eq!(seqs, vec![1000, 1026, 1052, 1078]);
        assert_eq!(a.transfer.send_queue.flight_size(), 100);
        assert!(a.transfer.send_queue.flight_size() <= a.transfer.congestion.cwnd());
    }

    #[test]
    fn test_lossless_transfer() {
        let (mut a, mut b) = pair(config());
        let mut now = Instant::now();
        let data = pattern(5000);

        assert_eq!(a.transfer.send(&mut a.host, &data, now), Ok(5000));
        let mut resends = 0;
        exchange(&mut a, &mut b, &mut now, |p| {
            if p.header.flags.contains(PackageFlags::RESEND) {
                resends += 1;
            }
            false
        });

        assert_eq!(b.host.received_data(), data);
        assert!(a.transfer.send_queue.is_empty());
        assert!(a.transfer.congestion.cwnd() > 100);
        assert_eq!(resends, 0);
    }

    #[test]
    fn test_one_loss_retransmits_only_the_lost_package() {
        let (mut a, mut b) = pair(config());
        let now = Instant::now();
        let data = pattern(75);

        a.transfer.send(&mut a.host, &data, now).unwrap();
        let sent = a.host.take_posted();
        assert_eq!(sent.len(), 3);

        deliver(&mut b, vec![sent[0].clone(), sent[2].clone()], now);
        let acks = b.host.take_posted();
        assert_eq!(acks.len(), 2);
        assert_eq!(acks[0].header.ack_seq, SeqNum::from_raw(1026));
        assert_eq!(acks[1].header.ack_seq, SeqNum::from_raw(1026));
        assert_eq!(acks[1].sack_ranges(), vec![(SeqNum::from_raw(1052), SeqNum::from_raw(1078))]);

        deliver(&mut a, acks, now);
        assert!(a.host.take_posted().is_empty());

        // first ack without delay: rto is at its minimum
        let rto_deadline = now + Duration::from_millis(200);
        assert_eq!(a.transfer.next_deadline(), Some(rto_deadline));
        a.transfer.on_timer(&mut a.host, rto_deadline);

        let resent = a.host.take_posted();
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].header.seq, SeqNum::from_raw(1026));
        assert!(resent[0].header.flags.contains(PackageFlags::RESEND));
        assert_eq!(resent[0].data, sent[1].data);

        deliver(&mut b, resent, rto_deadline);
        assert_eq!(b.host.received_data(), data);

        let acks = b.host.take_posted();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].header.ack_seq, SeqNum::from_raw(1078));
        deliver(&mut a, acks, rto_deadline);
        assert!(a.transfer.send_queue.is_empty());
    }

    #[test]
    fn test_fast_retransmit_on_duplicate_acks() {
        let (mut a, mut b) = pair(config());
        let mut now = Instant::now();

        let warmup = pattern(75);
        a.transfer.send(&mut a.host, &warmup, now).unwrap();
        exchange(&mut a, &mut b, &mut now, |_| false);

        let data = pattern(1000);
        a.transfer.send(&mut a.host, &data, now).unwrap();
        let sent = a.host.take_posted();
        assert_eq!(sent.len(), 4);

        deliver(&mut b, sent[1..].to_vec(), now);
        let acks = b.host.take_posted();
        assert_eq!(acks.len(), 3);

        deliver(&mut a, acks, now);
        let resends = a.host.posted_resends();
        assert_eq!(resends.len(), 1);
        assert_eq!(resends[0].header.seq, sent[0].header.seq);
        assert_eq!(a.transfer.congestion.state(), CongestionState::FastRecover);

        exchange(&mut a, &mut b, &mut now, |_| false);
        let mut expected = warmup;
        expected.extend(data);
        assert_eq!(b.host.received_data(), expected);
        assert_eq!(a.transfer.congestion.state(), CongestionState::CongestionAvoid);
    }

    #[rstest]
    #[case::no_loss(0)]
    #[case::every_fifth(5)]
    #[case::every_third(3)]
    fn test_transfer_with_loss(#[case] drop_every: usize) {
        let (mut a, mut b) = pair(config());
        let mut now = Instant::now();
        let data = pattern(3000);

        a.transfer.send(&mut a.host, &data, now).unwrap();
        let mut count = 0;
        exchange(&mut a, &mut b, &mut now, |_| {
            count += 1;
            drop_every > 0 && count % drop_every == 0
        });

        assert_eq!(b.host.received_data(), data);
        assert!(a.transfer.send_queue.is_empty());
    }

    #[test]
    fn test_close_sequence() {
        let (mut a, mut b) = pair(config());
        let mut now = Instant::now();

        a.transfer.send(&mut a.host, &pattern(30), now).unwrap();
        a.transfer.close(&mut a.host, now);

        // the fin flushes buffered data without waiting for more
        let posted = a.host.posted.iter().map(|p| (p.cmd_type(), p.data.len())).collect::<Vec<_>>();
        assert_eq!(posted, vec![(CommandType::Data, 25), (CommandType::Data, 5), (CommandType::Fin, 0)]);
        assert_eq!(a.transfer.send(&mut a.host, b"x", now), Err(BdtError::InvalidState));

        exchange(&mut a, &mut b, &mut now, |_| false);
        assert_eq!(b.host.received_data(), pattern(30));
        assert_eq!(b.host.events.last(), Some(&TransferEvent::EndOfStream));
        assert_eq!(a.host.events, vec![TransferEvent::CloseAcked]);

        // half-closed: the other direction still works
        b.transfer.send(&mut b.host, &pattern(10), now).unwrap();
        b.transfer.close(&mut b.host, now);
        exchange(&mut a, &mut b, &mut now, |_| false);
        assert_eq!(a.host.received_data(), pattern(10));
        assert!(a.host.events.contains(&TransferEvent::EndOfStream));
        assert!(b.host.events.contains(&TransferEvent::CloseAcked));
    }

    #[test]
    fn test_lost_fin_is_retransmitted() {
        let (mut a, mut b) = pair(config());
        let mut now = Instant::now();

        a.transfer.close(&mut a.host, now);
        let mut dropped = false;
        exchange(&mut a, &mut b, &mut now, |p| {
            if p.cmd_type() == CommandType::Fin && !dropped {
                dropped = true;
                return true;
            }
            false
        });

        assert!(dropped);
        assert_eq!(b.host.events, vec![TransferEvent::EndOfStream]);
        assert_eq!(a.host.events, vec![TransferEvent::CloseAcked]);
    }

    #[test]
    fn test_delayed_ack() {
        let (mut a, mut b) = pair(UdpTransferConfig { quick_ack_count: 0, ..config() });
        let now = Instant::now();

        a.transfer.send(&mut a.host, &pattern(25), now).unwrap();
        deliver(&mut b, a.host.take_posted(), now);
        assert!(b.host.take_posted().is_empty());

        let ack_deadline = now + Duration::from_millis(40);
        assert_eq!(b.transfer.next_deadline(), Some(ack_deadline));
        b.transfer.on_timer(&mut b.host, ack_deadline);
        let acks = b.host.take_posted();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].header.ack_seq, SeqNum::from_raw(1026));
        assert!(!acks[0].has_payload());
    }

    #[test]
    fn test_final_ack_watchdog() {
        let (mut a, mut b) = pair(config());
        let now = Instant::now();

        a.transfer.send(&mut a.host, &pattern(25), now).unwrap();
        deliver(&mut b, a.host.take_posted(), now);
        b.host.take_posted();

        let mut at = now;
        for _ in 0..3 {
            at += Duration::from_secs(5);
            assert_eq!(b.transfer.next_deadline(), Some(at));
            b.transfer.on_timer(&mut b.host, at);
            let acks = b.host.take_posted();
            assert_eq!(acks.len(), 1);
            assert!(acks[0].header.flags.contains(PackageFlags::FINAL_ACK));
        }
        assert_eq!(b.transfer.next_deadline(), None);
    }

    #[test]
    fn test_remote_window_limits_flight() {
        let (mut a, _) = pair(config());
        let now = Instant::now();
        a.transfer.remote_window = 50;

        a.transfer.send(&mut a.host, &pattern(1000), now).unwrap();
        let posted = a.host.take_posted();
        let sizes = posted.iter().map(|p| p.data.len()).collect::<Vec<_>>();
        assert_eq!(sizes, vec![25, 23]);
        let total: u32 = posted.iter().map(|p| p.next_seq().distance_from(p.header.seq)).sum();
        assert_eq!(total, 50);
        assert!(a.transfer.send_queue.flight_size() <= 50);
    }

    #[rstest]
    #[case::zero_admits_one_mss(0, 100)]
    #[case::one_kib(1, 1024)]
    #[case::handshake_default(64, 65_536)]
    fn test_remote_window_bytes(#[case] window_size: u16, #[case] expected: u32) {
        assert_eq!(remote_window_bytes(window_size, 100), expected);
    }

    #[test]
    fn test_buffer_overflow() {
        let (mut a, _) = pair(config());
        let now = Instant::now();

        assert_eq!(a.transfer.send(&mut a.host, &pattern(9_950), now), Ok(9_950));
        // small chunks are rejected as a whole, big chunks accepted partially
        assert_eq!(a.transfer.send(&mut a.host, &pattern(500), now), Err(BdtError::OutOfSize));
        assert!(a.transfer.send(&mut a.host, &pattern(3000), now).unwrap() < 3000);
    }
}
