use std::time::Duration;

// RTO Constants (RFC 4960)
const RTO_ALPHA: f64 = 0.125;
const RTO_BETA: f64 = 0.25;

#[derive(Debug, Clone)]
pub struct RtoCalculator {
    srtt: f64,
    rttvar: f64,
    rto: f64,
    min: f64,
    max: f64,
}

impl RtoCalculator {
    pub fn new(initial: Duration, min: Duration, max: Duration) -> Self {
        Self {
            srtt: 0.0,
            rttvar: 0.0,
            rto: initial.as_secs_f64(),
            min: min.as_secs_f64(),
            max: max.as_secs_f64(),
        }
    }

    pub fn update(&mut self, rtt: Duration) {
        let rtt = rtt.as_secs_f64();
        if self.srtt == 0.0 {
            self.srtt = rtt;
            self.rttvar = rtt / 2.0;
        } else {
            self.rttvar = (1.0 - RTO_BETA) * self.rttvar + RTO_BETA * (self.srtt - rtt).abs();
            self.srtt = (1.0 - RTO_ALPHA) * self.srtt + RTO_ALPHA * rtt;
        }
        self.rto = (self.srtt + 4.0 * self.rttvar).clamp(self.min, self.max);
    }

    pub fn backoff(&mut self) {
        self.rto = (self.rto * 2.0).min(self.max);
    }

    pub fn rto(&self) -> Duration {
        Duration::from_secs_f64(self.rto)
    }

    pub fn srtt(&self) -> Duration {
        Duration::from_secs_f64(self.srtt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rto_calculator() {
        let mut calc = RtoCalculator::new(
            Duration::from_secs(1),
            Duration::from_millis(200),
            Duration::from_secs(60),
        );
        assert_eq!(calc.rto(), Duration::from_secs(1));

        // srtt = 1.0, rttvar = 0.5, rto = 1.0 + 4 * 0.5
        calc.update(Duration::from_secs(1));
        assert_eq!(calc.rto(), Duration::from_secs(3));

        // rttvar = 0.75 * 0.5 = 0.375, rto = 1.0 + 1.5
        calc.update(Duration::from_secs(1));
        assert_eq!(calc.rto(), Duration::from_millis(2500));

        calc.backoff();
        assert_eq!(calc.rto(), Duration::from_secs(5));
    }

    #[test]
    fn test_rto_clamped() {
        let mut calc = RtoCalculator::new(
            Duration::from_secs(1),
            Duration::from_millis(200),
            Duration::from_secs(3),
        );
        calc.update(Duration::from_millis(10));
        assert_eq!(calc.rto(), Duration::from_millis(200));
        for _ in 0..10 {
            calc.backoff();
        }
        assert_eq!(calc.rto(), Duration::from_secs(3));
    }
}
