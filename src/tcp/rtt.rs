//! Smoothed round-trip-time estimator (Jacobson/Karels, spec §4.8).

use std::time::Duration;

const ALPHA_NUM: u32 = 1;
const ALPHA_DEN: u32 = 8;
const BETA_NUM: u32 = 1;
const BETA_DEN: u32 = 4;

#[derive(Debug, Clone, Copy)]
pub struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    min_rto: Duration,
    max_rto: Duration,
}

impl RttEstimator {
    pub fn new(initial_rto: Duration, min_rto: Duration, max_rto: Duration) -> Self {
        RttEstimator {
            srtt: None,
            rttvar: Duration::ZERO,
            rto: initial_rto.clamp(min_rto, max_rto),
            min_rto,
            max_rto,
        }
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Folds in a new RTT sample per RFC 6298 (α=1/8, β=1/4).
    pub fn sample(&mut self, sample: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(sample);
                self.rttvar = sample / 2;
            }
            Some(srtt) => {
                let diff = if sample > srtt {
                    sample - srtt
                } else {
                    srtt - sample
                };
                self.rttvar = scale(self.rttvar, BETA_DEN - BETA_NUM, BETA_DEN)
                    + scale(diff, BETA_NUM, BETA_DEN);
                self.srtt = Some(
                    scale(srtt, ALPHA_DEN - ALPHA_NUM, ALPHA_DEN)
                        + scale(sample, ALPHA_NUM, ALPHA_DEN),
                );
            }
        }
        let srtt = self.srtt.unwrap();
        self.rto = (srtt + 4 * self.rttvar).clamp(self.min_rto, self.max_rto);
    }

    /// Doubles the RTO on retransmit timeout (exponential backoff), capped
    /// at `max_rto`.
    pub fn backoff(&mut self) {
        self.rto = (self.rto * 2).min(self.max_rto);
    }

    pub fn reset_backoff(&mut self) {
        if let Some(srtt) = self.srtt {
            self.rto = (srtt + 4 * self.rttvar).clamp(self.min_rto, self.max_rto);
        }
    }
}

fn scale(d: Duration, num: u32, den: u32) -> Duration {
    Duration::from_secs_f64(d.as_secs_f64() * num as f64 / den as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_sets_srtt_directly() {
        let mut rtt = RttEstimator::new(Duration::from_secs(1), Duration::from_secs(1), Duration::from_secs(60));
        rtt.sample(Duration::from_millis(200));
        assert!(rtt.rto() >= Duration::from_millis(200));
    }

    #[test]
    fn rto_clamped_to_bounds() {
        let mut rtt = RttEstimator::new(Duration::from_secs(1), Duration::from_secs(1), Duration::from_secs(60));
        rtt.sample(Duration::from_nanos(1));
        assert_eq!(rtt.rto(), Duration::from_secs(1));

        for _ in 0..40 {
            rtt.sample(Duration::from_secs(120));
        }
        assert_eq!(rtt.rto(), Duration::from_secs(60));
    }

    #[test]
    fn backoff_doubles_until_max() {
        let mut rtt = RttEstimator::new(Duration::from_secs(1), Duration::from_secs(1), Duration::from_secs(60));
        for _ in 0..10 {
            rtt.backoff();
        }
        assert_eq!(rtt.rto(), Duration::from_secs(60));
    }
}
