use std::time::Duration;

use tracing::trace;

/// Smoothed RTT / variance estimation (alpha = 1/8, beta = 1/4) with `rto = srtt + 4 * rttvar`,
///  kept inside `[rto_min, rto_max]`. Values are tracked in microseconds.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt_micros: u64,
    rttvar_micros: u64,
    rto: Duration,
    initialized: bool,

    rto_min: Duration,
    rto_max: Duration,
}

impl RttEstimator {
    pub fn new(rto_initial: Duration, rto_min: Duration, rto_max: Duration) -> RttEstimator {
        RttEstimator {
            srtt_micros: 0,
            rttvar_micros: 0,
            rto: rto_initial.clamp(rto_min, rto_max),
            initialized: false,
            rto_min,
            rto_max,
        }
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn srtt(&self) -> Option<Duration> {
        if self.initialized {
            Some(Duration::from_micros(self.srtt_micros))
        }
        else {
            None
        }
    }

    pub fn on_sample(&mut self, sample: Duration) {
        let sample = sample.as_micros().min(u64::MAX as u128) as u64;

        if !self.initialized {
            self.srtt_micros = sample;
            self.rttvar_micros = sample / 2;
            self.initialized = true;
        }
        else {
            let diff = self.srtt_micros.abs_diff(sample);
            self.rttvar_micros = (3 * self.rttvar_micros + diff) / 4;
            self.srtt_micros = (7 * self.srtt_micros + sample) / 8;
        }

        let rto = Duration::from_micros(self.srtt_micros.saturating_add(self.rttvar_micros.saturating_mul(4)));
        self.rto = rto.clamp(self.rto_min, self.rto_max);
        trace!("RTT sample {}us: srtt={}us rttvar={}us rto={:?}", sample, self.srtt_micros, self.rttvar_micros, self.rto);
    }

    /// doubles the RTO after a retransmission timeout
    pub fn backoff(&mut self) {
        self.rto = self.rto.saturating_mul(2).clamp(self.rto_min, self.rto_max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn estimator() -> RttEstimator {
        RttEstimator::new(Duration::from_secs(1), Duration::from_millis(100), Duration::from_secs(10))
    }

    #[test]
    fn test_initial() {
        let rtt = estimator();
        assert_eq!(rtt.rto(), Duration::from_secs(1));
        assert_eq!(rtt.srtt(), None);
    }

    #[rstest]
    #[case::first_sample(vec![200], 200_000, Duration::from_millis(600))]
    #[case::clamped_low(vec![10], 10_000, Duration::from_millis(100))]
    #[case::clamped_high(vec![5000], 5_000_000, Duration::from_secs(10))]
    // rttvar = (3*100 + 0)/4 = 75ms, srtt = 200ms
    #[case::stable(vec![200, 200], 200_000, Duration::from_millis(500))]
    // rttvar = (3*50 + 80)/4 = 57.5ms, srtt = (7*100 + 180)/8 = 110ms
    #[case::rising(vec![100, 180], 110_000, Duration::from_micros(110_000 + 4 * 57_500))]
    fn test_samples(#[case] samples_ms: Vec<u64>, #[case] expected_srtt_micros: u64, #[case] expected_rto: Duration) {
        let mut rtt = estimator();
        for s in samples_ms {
            rtt.on_sample(Duration::from_millis(s));
        }
        assert_eq!(rtt.srtt(), Some(Duration::from_micros(expected_srtt_micros)));
        assert_eq!(rtt.rto(), expected_rto);
    }

    #[test]
    fn test_backoff_is_bounded() {
        let mut rtt = estimator();
        rtt.backoff();
        assert_eq!(rtt.rto(), Duration::from_secs(2));
        for _ in 0..10 {
            rtt.backoff();
        }
        assert_eq!(rtt.rto(), Duration::from_secs(10));

        rtt.on_sample(Duration::from_millis(200));
        assert_eq!(rtt.rto(), Duration::from_millis(600));
    }
}
