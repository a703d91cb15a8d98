//! Reno style congestion control: slow start, congestion avoidance and fast recovery. The
//!  window is tracked in bytes.

use std::cmp::{max, min};

use tracing::{debug, instrument, trace};

use crate::sequence::SeqNum;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CongestionState {
    SlowStart,
    CongestionAvoid,
    FastRecover,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AckOutcome {
    Nothing,
    /// fast recovery was entered - the oldest unacknowledged package should be retransmitted
    EnterFastRecovery,
    /// another duplicate ack while in fast recovery
    DuplicateInRecovery,
    ExitFastRecovery,
}

#[derive(Debug)]
pub struct RenoCongestion {
    mss: u32,
    max_cwnd: u32,

    cwnd: u32,
    ssthresh: u32,
    state: CongestionState,

    last_ack: Option<SeqNum>,
    dup_ack_count: u32,

    /// highest sequence in flight when fast recovery was entered
    recover_seq: SeqNum,
    /// cwnd when fast recovery was entered
    recover_cwnd: u32,
}

impl RenoCongestion {
    pub const DUP_ACK_THRESHOLD: u32 = 3;

    pub fn new(mss: u32, initial_ssthresh: u32, max_cwnd: u32) -> RenoCongestion {
        assert!(max_cwnd >= 2 * mss);

        RenoCongestion {
            mss,
            max_cwnd,
            cwnd: mss,
            ssthresh: max(initial_ssthresh, 2 * mss),
            state: CongestionState::SlowStart,
            last_ack: None,
            dup_ack_count: 0,
            recover_seq: SeqNum::ZERO,
            recover_cwnd: 0,
        }
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    pub fn state(&self) -> CongestionState {
        self.state
    }

    pub fn mss(&self) -> u32 {
        self.mss
    }

    /// Called for every incoming cumulative ack.
    ///
    /// * `acked_bytes`: the number of sequence units by which the cumulative ack advanced
    /// * `in_flight`: whether there is unacknowledged data after processing the ack
    /// * `highest_sent`: the sequence number after the most recently sent package
    /// * `final_ack`: the peer flagged the ack as re-sent after a quiet period
    #[instrument(level = "trace", skip(self))]
    pub fn on_ack(&mut self, ack: SeqNum, acked_bytes: u32, in_flight: bool, highest_sent: SeqNum, final_ack: bool) -> AckOutcome {
        let is_duplicate = acked_bytes == 0 && self.last_ack == Some(ack) && in_flight;
        self.last_ack = Some(ack);

        if acked_bytes > 0 {
            self.dup_ack_count = 0;

            match self.state {
                CongestionState::SlowStart => {
                    self.cwnd = self.cwnd.saturating_add(max(acked_bytes, self.mss));
                    if self.cwnd >= self.ssthresh {
                        trace!("slow start -> congestion avoidance at cwnd {}", self.cwnd);
                        self.state = CongestionState::CongestionAvoid;
                    }
                }
                CongestionState::CongestionAvoid => {
                    let mss = self.mss as u64;
                    let cwnd = self.cwnd as u64;
                    let increment = (mss * mss).div_ceil(cwnd);
                    self.cwnd = self.cwnd.saturating_add(increment as u32);
                }
                CongestionState::FastRecover => {
                    if ack >= self.recover_seq {
                        self.ssthresh = max(self.recover_cwnd / 2, 2 * self.mss);
                        self.cwnd = self.ssthresh;
                        self.state = CongestionState::CongestionAvoid;
                        debug!("leaving fast recovery: cwnd = ssthresh = {}", self.cwnd);
                        return AckOutcome::ExitFastRecovery;
                    }
                }
            }
            self.cwnd = min(self.cwnd, self.max_cwnd);

            if final_ack && in_flight && self.state != CongestionState::FastRecover {
                return self.enter_fast_recovery(highest_sent);
            }
            return AckOutcome::Nothing;
        }

        if is_duplicate {
            self.dup_ack_count += 1;
            trace!("duplicate ack #{} for {:?}", self.dup_ack_count, ack);

            if self.state == CongestionState::FastRecover {
                return AckOutcome::DuplicateInRecovery;
            }
            if self.dup_ack_count == Self::DUP_ACK_THRESHOLD {
                return self.enter_fast_recovery(highest_sent);
            }
        }

        if final_ack && in_flight && self.state != CongestionState::FastRecover {
            return self.enter_fast_recovery(highest_sent);
        }
        AckOutcome::Nothing
    }

    fn enter_fast_recovery(&mut self, highest_sent: SeqNum) -> AckOutcome {
        debug!("entering fast recovery at cwnd {}, recovering up to {:?}", self.cwnd, highest_sent);
        self.recover_cwnd = self.cwnd;
        self.recover_seq = highest_sent;
        self.state = CongestionState::FastRecover;
        AckOutcome::EnterFastRecovery
    }

    /// retransmission timeout of the oldest unacknowledged package
    pub fn on_timeout(&mut self) {
        self.ssthresh = max(self.cwnd / 2, 2 * self.mss);
        self.cwnd = self.mss;
        self.state = CongestionState::SlowStart;
        self.dup_ack_count = 0;
        debug!("retransmission timeout: ssthresh={}, back to slow start", self.ssthresh);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const MSS: u32 = 1000;

    fn seq(n: u32) -> SeqNum {
        SeqNum::from_raw(n)
    }

    fn reno(cwnd: u32, ssthresh: u32, state: CongestionState) -> RenoCongestion {
        let mut result = RenoCongestion::new(MSS, 2 * MSS, 100 * MSS);
        result.cwnd = cwnd;
        result.ssthresh = ssthresh;
        result.state = state;
        result.last_ack = Some(seq(100));
        result
    }

    #[rstest]
    #[case::slow_start_small_ack(1000, 8000, CongestionState::SlowStart, 10, 2000, CongestionState::SlowStart)]
    #[case::slow_start_big_ack(1000, 8000, CongestionState::SlowStart, 3000, 4000, CongestionState::SlowStart)]
    #[case::slow_start_to_avoid(7000, 8000, CongestionState::SlowStart, 1000, 8000, CongestionState::CongestionAvoid)]
    // ceil(1000*1000 / 3000) = 334
    #[case::avoid(3000, 2000, CongestionState::CongestionAvoid, 1000, 3334, CongestionState::CongestionAvoid)]
    #[case::avoid_exact(4000, 2000, CongestionState::CongestionAvoid, 10, 4250, CongestionState::CongestionAvoid)]
    #[case::capped(100 * MSS, 2000, CongestionState::CongestionAvoid, 1000, 100 * MSS, CongestionState::CongestionAvoid)]
    fn test_growth(#[case] cwnd: u32, #[case] ssthresh: u32, #[case] state: CongestionState, #[case] acked: u32, #[case] expected_cwnd: u32, #[case] expected_state: CongestionState) {
        let mut reno = reno(cwnd, ssthresh, state);
        let outcome = reno.on_ack(seq(100) + acked, acked, true, seq(50_000), false);
        assert_eq!(outcome, AckOutcome::Nothing);
        assert_eq!(reno.cwnd(), expected_cwnd);
        assert_eq!(reno.state(), expected_state);
    }

    #[test]
    fn test_triple_duplicate_ack() {
        let mut reno = reno(10_000, 5000, CongestionState::CongestionAvoid);

        assert_eq!(reno.on_ack(seq(100), 0, true, seq(20_000), false), AckOutcome::Nothing);
        assert_eq!(reno.on_ack(seq(100), 0, true, seq(20_000), false), AckOutcome::Nothing);
        assert_eq!(reno.on_ack(seq(100), 0, true, seq(20_000), false), AckOutcome::EnterFastRecovery);
        assert_eq!(reno.state(), CongestionState::FastRecover);
        assert_eq!(reno.on_ack(seq(100), 0, true, seq(20_000), false), AckOutcome::DuplicateInRecovery);

        // partial ack stays in recovery
        assert_eq!(reno.on_ack(seq(5000), 4900, true, seq(20_000), false), AckOutcome::Nothing);
        assert_eq!(reno.state(), CongestionState::FastRecover);
        assert_eq!(reno.cwnd(), 10_000);

        assert_eq!(reno.on_ack(seq(20_000), 15_000, false, seq(20_000), false), AckOutcome::ExitFastRecovery);
        assert_eq!(reno.state(), CongestionState::CongestionAvoid);
        assert_eq!(reno.ssthresh(), 5000);
        assert_eq!(reno.cwnd(), 5000);
    }

    #[test]
    fn test_duplicates_without_flight_are_ignored() {
        let mut reno = reno(10_000, 5000, CongestionState::CongestionAvoid);
        for _ in 0..5 {
            assert_eq!(reno.on_ack(seq(100), 0, false, seq(100), false), AckOutcome::Nothing);
        }
        assert_eq!(reno.state(), CongestionState::CongestionAvoid);
    }

    #[test]
    fn test_new_ack_resets_duplicate_count() {
        let mut reno = reno(10_000, 5000, CongestionState::CongestionAvoid);
        reno.on_ack(seq(100), 0, true, seq(20_000), false);
        reno.on_ack(seq(100), 0, true, seq(20_000), false);
        reno.on_ack(seq(200), 100, true, seq(20_000), false);
        reno.on_ack(seq(200), 0, true, seq(20_000), false);
        assert_eq!(reno.on_ack(seq(200), 0, true, seq(20_000), false), AckOutcome::Nothing);
        assert_eq!(reno.state(), CongestionState::CongestionAvoid);
    }

    #[rstest]
    #[case::with_flight(true, AckOutcome::EnterFastRecovery, CongestionState::FastRecover)]
    #[case::without_flight(false, AckOutcome::Nothing, CongestionState::CongestionAvoid)]
    fn test_final_ack(#[case] in_flight: bool, #[case] expected: AckOutcome, #[case] expected_state: CongestionState) {
        let mut reno = reno(10_000, 5000, CongestionState::CongestionAvoid);
        assert_eq!(reno.on_ack(seq(100), 0, in_flight, seq(20_000), true), expected);
        assert_eq!(reno.state(), expected_state);
    }

    #[test]
    fn test_recovery_exit_keeps_minimum_ssthresh() {
        let mut reno = reno(3000, 2000, CongestionState::CongestionAvoid);
        assert_eq!(reno.on_ack(seq(100), 0, true, seq(4000), true), AckOutcome::EnterFastRecovery);
        assert_eq!(reno.on_ack(seq(4000), 3900, false, seq(4000), false), AckOutcome::ExitFastRecovery);
        assert_eq!(reno.ssthresh(), 2 * MSS);
        assert_eq!(reno.cwnd(), 2 * MSS);
    }

    #[rstest]
    #[case::big(40_000, 20_000)]
    #[case::small(3000, 2 * MSS)]
    #[case::minimal(MSS, 2 * MSS)]
    fn test_timeout(#[case] cwnd: u32, #[case] expected_ssthresh: u32) {
        let mut reno = reno(cwnd, 5000, CongestionState::FastRecover);
        reno.on_timeout();
        assert_eq!(reno.cwnd(), MSS);
        assert_eq!(reno.ssthresh(), expected_ssthresh);
        assert_eq!(reno.state(), CongestionState::SlowStart);
    }
}
