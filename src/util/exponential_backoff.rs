use std::cmp::min;
use std::time::Duration;

/// Geometrically growing delays between repeated attempts, e.g. SN lookups or relay calls
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current: Duration,

    config_initial: Duration,
    config_max: Duration,
    config_factor_eighths: u32,
}

impl ExponentialBackoff {
    /// doubles the delay with every attempt
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self::with_factor_eighths(initial, max, 8*2)
    }

    pub fn with_factor_eighths(initial: Duration, max: Duration, factor_eighths: u32) -> Self {
        assert!(factor_eighths >= 8);
        assert!(initial <= max);

        ExponentialBackoff {
            current: initial,
            config_initial: initial,
            config_max: max,
            config_factor_eighths: factor_eighths,
        }
    }

    /// the delay before the next attempt
    #[must_use]
    pub fn next_delay(&mut self) -> Duration {
        let result = self.current;
        self.current = min(self.current * self.config_factor_eighths / 8, self.config_max);
        result
    }

    pub fn reset(&mut self) {
        self.current = self.config_initial;
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn millis(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[rstest]
    #[case::doubling(100, 10_000, 16, vec![100, 200, 400, 800, 1600])]
    #[case::capped(100, 500, 16, vec![100, 200, 400, 500, 500])]
    #[case::factor_1_5(100, 10_000, 12, vec![100, 150, 225, 337, 506])]
    #[case::constant(100, 10_000, 8, vec![100, 100, 100, 100, 100])]
    #[case::initial_is_max(500, 500, 16, vec![500, 500, 500, 500, 500])]
    fn test_next_delay(#[case] initial: u64, #[case] max: u64, #[case] factor: u32, #[case] expected: Vec<u64>) {
        let mut eb = ExponentialBackoff::with_factor_eighths(millis(initial), millis(max), factor);
        let actual = (0..expected.len())
            .map(|_| eb.next_delay().as_millis() as u64)
            .collect::<Vec<_>>();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_reset() {
        let mut eb = ExponentialBackoff::new(millis(100), millis(10_000));
        let _ = eb.next_delay();
        let _ = eb.next_delay();
        assert_eq!(eb.next_delay(), millis(400));

        eb.reset();
        assert_eq!(eb.next_delay(), millis(100));
    }
}
