use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::package::{Package, PackageFlags, SackRange};
use crate::sequence::SeqNum;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StubState {
    /// sent, waiting for an ack or the retransmission timeout
    WaitAck,
    /// marked for retransmission ahead of new data
    WaitResend,
    /// acknowledged selectively, but not yet covered by the cumulative ack
    Sacked,
}

/// One sent, unacknowledged package
#[derive(Debug)]
pub struct SendStub {
    pub package: Package,
    pub first_sent_time: Instant,
    pub sent_time: Instant,
    pub send_count: u32,
    /// number of SACKs that acknowledged later packages but not this one
    pub sack_count: u32,
    pub state: StubState,
}

impl SendStub {
    pub fn seq(&self) -> SeqNum {
        self.package.header.seq
    }

    /// the cumulative ack that acknowledges this package
    pub fn limit_ack_seq(&self) -> SeqNum {
        self.package.next_seq()
    }

    fn seq_len(&self) -> u32 {
        self.limit_ack_seq().distance_from(self.seq())
    }

    /// prepares the package for retransmission
    pub fn on_resend(&mut self, ack_seq: SeqNum, window_size: u16, now: Instant) {
        self.package.header.flags.insert(PackageFlags::RESEND);
        self.package.header.ack_seq = ack_seq;
        self.package.header.window_size = window_size;
        self.package.invalidate();

        self.sent_time = now;
        self.send_count += 1;
        self.sack_count = 0;
        self.state = StubState::WaitAck;
    }
}

#[derive(Debug, Default, Eq, PartialEq)]
pub struct CumulativeAck {
    /// sequence units between the previous and the new cumulative ack floor
    pub acked: u32,
    pub rtt_sample: Option<Duration>,
}

/// All sent and not yet cumulatively acknowledged packages, in sequence order. The stub states
///  partition them into packages waiting for an ack, waiting for retransmission and SACKed.
///  Stubs waiting for retransmission always precede stubs waiting for an ack.
pub struct SendQueue {
    stubs: VecDeque<SendStub>,
    /// sequence number after the most recently sent package
    next_seq: SeqNum,
}

impl SendQueue {
    pub const SACK_SKIP_THRESHOLD: u32 = 3;

    pub fn new(next_seq: SeqNum) -> SendQueue {
        SendQueue {
            stubs: VecDeque::new(),
            next_seq,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stubs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stubs.len()
    }

    pub fn next_seq(&self) -> SeqNum {
        self.next_seq
    }

    /// the lowest unacknowledged sequence number
    pub fn floor(&self) -> SeqNum {
        self.stubs.front()
            .map(|s| s.seq())
            .unwrap_or(self.next_seq)
    }

    /// sequence distance between the lowest unacknowledged and the most recently sent package,
    ///  not counting SACKed packages
    pub fn flight_size(&self) -> u32 {
        let sacked: u32 = self.stubs.iter()
            .filter(|s| s.state == StubState::Sacked)
            .map(|s| s.seq_len())
            .sum();
        self.next_seq.distance_from(self.floor()).saturating_sub(sacked)
    }

    pub fn push(&mut self, package: Package, now: Instant) {
        debug_assert_eq!(package.header.seq, self.next_seq);
        self.next_seq = package.next_seq();

        self.stubs.push_back(SendStub {
            package,
            first_sent_time: now,
            sent_time: now,
            send_count: 1,
            sack_count: 0,
            state: StubState::WaitAck,
        });
    }

    /// Removes all stubs covered by a cumulative ack. The RTT sample is taken from the most
    ///  recent acknowledged package that is unambiguous, i.e. sent only once, or re-sent more
    ///  than an RTO after its first transmission.
    pub fn on_ack(&mut self, ack: SeqNum, rto: Duration, now: Instant) -> CumulativeAck {
        if ack > self.next_seq {
            trace!("ignoring ack {:?} beyond the highest sent sequence {:?}", ack, self.next_seq);
            return CumulativeAck::default();
        }

        let old_floor = self.floor();
        let mut rtt_sample = None;
        while let Some(front) = self.stubs.front() {
            if front.limit_ack_seq() > ack {
                break;
            }
            if let Some(stub) = self.stubs.pop_front() {
                if stub.send_count == 1 || stub.sent_time.duration_since(stub.first_sent_time) > rto {
                    rtt_sample = Some(now.duration_since(stub.sent_time));
                }
            }
        }

        CumulativeAck {
            acked: self.floor().distance_from(old_floor),
            rtt_sample,
        }
    }

    /// Marks SACKed stubs and counts a skip for every unacknowledged stub below the highest SACKed
    ///  one. Returns the sequence numbers of stubs that just reached the skip threshold, lowest
    ///  first.
    pub fn on_sack(&mut self, ranges: &[SackRange]) -> Vec<SeqNum> {
        let mut highest_sacked = None;
        for (idx, stub) in self.stubs.iter_mut().enumerate() {
            let covered = ranges.iter()
                .any(|(from, to)| stub.seq() >= *from && stub.limit_ack_seq() <= *to);
            if covered {
                stub.state = StubState::Sacked;
            }
            if stub.state == StubState::Sacked {
                highest_sacked = Some(idx);
            }
        }

        let mut result = Vec::new();
        if let Some(highest_sacked) = highest_sacked {
            for stub in self.stubs.iter_mut().take(highest_sacked) {
                if stub.state == StubState::WaitAck {
                    stub.sack_count += 1;
                    if stub.sack_count == Self::SACK_SKIP_THRESHOLD {
                        result.push(stub.seq());
                    }
                }
            }
        }
        result
    }

    /// Marks the stub for retransmission, together with all unacknowledged stubs before it
    pub fn mark_resend(&mut self, seq: SeqNum) -> bool {
        let Some(idx) = self.stubs.iter().position(|s| s.seq() == seq) else {
            return false;
        };
        if self.stubs[idx].state == StubState::Sacked {
            return false;
        }

        for stub in self.stubs.iter_mut().take(idx + 1) {
            if stub.state == StubState::WaitAck {
                stub.state = StubState::WaitResend;
            }
        }
        true
    }

    /// the oldest package that is neither SACKed nor already marked for retransmission
    pub fn oldest_unacked(&self) -> Option<&SendStub> {
        self.stubs.iter()
            .find(|s| s.state == StubState::WaitAck)
    }

    pub fn next_resend(&mut self) -> Option<&mut SendStub> {
        self.stubs.iter_mut()
            .find(|s| s.state == StubState::WaitResend)
    }

    #[cfg(test)]
    pub fn states(&self) -> Vec<(u32, StubState)> {
        self.stubs.iter()
            .map(|s| (s.seq().to_raw(), s.state))
            .collect()
    }
}
