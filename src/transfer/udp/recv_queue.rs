use tracing::trace;

use crate::package::{Package, SackRange};
use crate::sequence::SeqNum;

/// a contiguous run of packages received ahead of the next expected sequence number
#[derive(Debug)]
struct PendingRange {
    seq: SeqNum,
    next_seq: SeqNum,
    packages: Vec<Package>,
}

#[derive(Debug, Eq, PartialEq)]
pub enum RecvOutcome {
    /// packages released in order, starting with the received one
    InOrder(Vec<Package>),
    OutOfOrder,
    Duplicate,
    OutOfWindow,
}

/// The reorder buffer of the receiving side. Packages at the next expected sequence number are
///  released immediately, together with any pending range they connect to. Other packages are kept
///  in a sorted list of non-touching ranges.
pub struct RecvQueue {
    next_expected: SeqNum,
    pending: Vec<PendingRange>,
    pending_bytes: usize,
    window: u32,
}

impl RecvQueue {
    pub fn new(next_expected: SeqNum, window: u32) -> RecvQueue {
        RecvQueue {
            next_expected,
            pending: Vec::new(),
            pending_bytes: 0,
            window,
        }
    }

    /// the cumulative ack: next sequence number expected from the peer
    pub fn next_expected(&self) -> SeqNum {
        self.next_expected
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// free space of the receive window in bytes
    pub fn window_free(&self) -> u32 {
        self.window.saturating_sub(self.pending_bytes as u32)
    }

    pub fn sack_ranges(&self) -> Vec<SackRange> {
        self.pending.iter()
            .map(|r| (r.seq, r.next_seq))
            .collect()
    }

    pub fn on_package(&mut self, package: Package) -> RecvOutcome {
        let seq = package.header.seq;
        let next_seq = package.next_seq();

        if seq < self.next_expected {
            trace!("duplicate package {:?}, expecting {:?}", seq, self.next_expected);
            return RecvOutcome::Duplicate;
        }
        if next_seq.distance_from(self.next_expected) > self.window {
            trace!("package {:?} outside of receive window starting at {:?}", seq, self.next_expected);
            return RecvOutcome::OutOfWindow;
        }

        if seq == self.next_expected {
            self.next_expected = next_seq;
            let mut released = vec![package];

            while let Some(first) = self.pending.first() {
                if first.seq > self.next_expected {
                    break;
                }
                let range = self.pending.remove(0);
                if range.seq < self.next_expected {
                    // overlaps with what was just released - cannot happen with consistent
                    //  packetization by the sender
                    trace!("dropping pending range {:?}..{:?} overlapping released data", range.seq, range.next_seq);
                    self.pending_bytes -= range_bytes(&range);
                    continue;
                }
                self.pending_bytes -= range_bytes(&range);
                self.next_expected = range.next_seq;
                released.extend(range.packages);
            }
            return RecvOutcome::InOrder(released);
        }

        self.insert_pending(package)
    }

    fn insert_pending(&mut self, package: Package) -> RecvOutcome {
        let seq = package.header.seq;
        let next_seq = package.next_seq();
        let len = package.data.len();

        for idx in 0..self.pending.len() {
            let range = &mut self.pending[idx];

            if seq >= range.seq && next_seq <= range.next_seq {
                return RecvOutcome::Duplicate;
            }
            if seq == range.next_seq {
                range.packages.push(package);
                range.next_seq = next_seq;

                let merge_with_next = self.pending.get(idx + 1)
                    .map(|next| next.seq == next_seq)
                    .unwrap_or(false);
                if merge_with_next {
                    let next = self.pending.remove(idx + 1);
                    let range = &mut self.pending[idx];
                    range.next_seq = next.next_seq;
                    range.packages.extend(next.packages);
                }
                self.pending_bytes += len;
                return RecvOutcome::OutOfOrder;
            }
            if next_seq == range.seq {
                range.packages.insert(0, package);
                range.seq = seq;
                self.pending_bytes += len;
                return RecvOutcome::OutOfOrder;
            }
            if next_seq < range.seq {
                self.pending.insert(idx, PendingRange { seq, next_seq, packages: vec![package] });
                self.pending_bytes += len;
                return RecvOutcome::OutOfOrder;
            }
            if seq < range.next_seq {
                // partial overlap
                return RecvOutcome::Duplicate;
            }
        }

        self.pending.push(PendingRange { seq, next_seq, packages: vec![package] });
        self.pending_bytes += len;
        RecvOutcome::OutOfOrder
    }
}

fn range_bytes(range: &PendingRange) -> usize {
    range.packages.iter()
        .map(|p| p.data.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::{CommandType, PackageHeader};
    use bytes::Bytes;
    use rstest::rstest;

    fn seq(n: u32) -> SeqNum {
        SeqNum::from_raw(n)
    }

    /// package with 4 payload bytes: occupies [seq, seq+5)
    fn package(seq_raw: u32) -> Package {
        let mut header = PackageHeader::new(CommandType::Data);
        header.seq = seq(seq_raw);
        let mut result = Package::new(header);
        result.data = Bytes::from(seq_raw.to_le_bytes().to_vec());
        result
    }

    fn released_seqs(outcome: RecvOutcome) -> Vec<u32> {
        match outcome {
            RecvOutcome::InOrder(packages) => packages.iter().map(|p| p.header.seq.to_raw()).collect(),
            other => panic!("expected in order release, was {:?}", other),
        }
    }

    #[test]
    fn test_in_order() {
        let mut queue = RecvQueue::new(seq(100), 1000);
        assert_eq!(released_seqs(queue.on_package(package(100))), vec![100]);
        assert_eq!(released_seqs(queue.on_package(package(105))), vec![105]);
        assert_eq!(queue.next_expected(), seq(110));
        assert!(!queue.has_pending());
    }

    #[test]
    fn test_gap_is_filled() {
        let mut queue = RecvQueue::new(seq(100), 1000);
        assert_eq!(queue.on_package(package(105)), RecvOutcome::OutOfOrder);
        assert_eq!(queue.on_package(package(115)), RecvOutcome::OutOfOrder);
        assert_eq!(queue.sack_ranges(), vec![(seq(105), seq(110)), (seq(115), seq(120))]);
        assert_eq!(queue.window_free(), 1000 - 8);

        assert_eq!(queue.on_package(package(110)), RecvOutcome::OutOfOrder);
        assert_eq!(queue.sack_ranges(), vec![(seq(105), seq(120))]);

        assert_eq!(released_seqs(queue.on_package(package(100))), vec![100, 105, 110, 115]);
        assert_eq!(queue.next_expected(), seq(120));
        assert!(queue.sack_ranges().is_empty());
        assert_eq!(queue.window_free(), 1000);
    }

    #[rstest]
    #[case::already_released(vec![100], 100)]
    #[case::pending(vec![110], 110)]
    #[case::inside_pending_range(vec![110, 115], 115)]
    fn test_duplicate(#[case] received: Vec<u32>, #[case] duplicate: u32) {
        let mut queue = RecvQueue::new(seq(100), 1000);
        for s in received {
            queue.on_package(package(s));
        }
        assert_eq!(queue.on_package(package(duplicate)), RecvOutcome::Duplicate);
    }

    #[test]
    fn test_out_of_window() {
        let mut queue = RecvQueue::new(seq(100), 20);
        assert_eq!(queue.on_package(package(115)), RecvOutcome::OutOfOrder);
        assert_eq!(queue.on_package(package(120)), RecvOutcome::OutOfWindow);
    }

    #[test]
    fn test_prepend_to_range() {
        let mut queue = RecvQueue::new(seq(100), 1000);
        queue.on_package(package(115));
        queue.on_package(package(110));
        queue.on_package(package(130));
        queue.on_package(package(125));
        assert_eq!(queue.sack_ranges(), vec![(seq(110), seq(120)), (seq(125), seq(135))]);
    }

    #[test]
    fn test_wraparound() {
        let start = u32::MAX - 6;
        let mut queue = RecvQueue::new(seq(start), 1000);
        assert_eq!(queue.on_package(package(start.wrapping_add(5))), RecvOutcome::OutOfOrder);
        assert_eq!(released_seqs(queue.on_package(package(start))), vec![start, start.wrapping_add(5)]);
        assert_eq!(queue.next_expected(), seq(start.wrapping_add(10)));
    }

    #[test]
    fn test_any_permutation_is_delivered_once_in_order() {
        let seqs: Vec<u32> = (0..6).map(|i| 1000 + 5 * i).collect();

        // all permutations of 6 packages via Heap's algorithm
        let mut perm = seqs.clone();
        let mut c = vec![0usize; perm.len()];
        let check = |order: &[u32]| {
            let mut queue = RecvQueue::new(seq(1000), 10_000);
            let mut delivered = Vec::new();
            for s in order {
                if let RecvOutcome::InOrder(packages) = queue.on_package(package(*s)) {
                    delivered.extend(packages.into_iter().flat_map(|p| p.data.to_vec()));
                }
            }
            let expected: Vec<u8> = seqs.iter().flat_map(|s| s.to_le_bytes()).collect();
            assert_eq!(delivered, expected, "order {:?}", order);
        };

        check(&perm);
        let mut i = 0;
        while i < perm.len() {
            if c[i] < i {
                if i % 2 == 0 { perm.swap(0, i); } else { perm.swap(c[i], i); }
                check(&perm);
                c[i] += 1;
                i = 0;
            }
            else {
                c[i] = 0;
                i += 1;
            }
        }
    }
}
