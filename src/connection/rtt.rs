// Copyright (c) 2023 The TCPCC Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::cmp;
use std::time::Duration;

/// RTT estimation for a connection.
///
/// Classic Jacobson/Karels exponentially weighted moving averages, kept in
/// fixed point: `srtt` is scaled by 8 (gain 1/8) and `mdev` by 4 (gain 1/4),
/// both in microseconds. `mdev_max` tracks the running peak of the deviation
/// since the last ack of new data and folds into `rttvar` only at that
/// boundary, so a single quiet round trip cannot collapse the variance.
pub struct RttEstimator {
    /// Smoothed RTT estimate, scaled by 8, in microseconds. Zero until the
    /// first sample arrives.
    srtt: u32,

    /// Mean deviation of RTT samples, scaled by 4, in microseconds.
    mdev: u32,

    /// Maximum of `mdev` observed since the last ack of new data.
    mdev_max: u32,

    /// Smoothed deviation actually used for RTO calculation.
    rttvar: u32,

    /// The most recent raw RTT sample in microseconds.
    latest_rtt: u32,

    /// Exponential backoff shift applied after each retransmission timeout.
    /// Cleared whenever a usable sample arrives (Karn's algorithm).
    backoff: u32,

    /// Lower bound of the retransmission timeout in microseconds.
    rto_min: u32,

    /// Upper bound of the retransmission timeout in microseconds.
    rto_max: u32,
}

impl RttEstimator {
    pub fn new(rto_min: Duration, rto_max: Duration) -> Self {
        Self {
            srtt: 0,
            mdev: 0,
            mdev_max: 0,
            rttvar: 0,
            latest_rtt: 0,
            backoff: 0,
            rto_min: rto_min.as_micros() as u32,
            rto_max: rto_max.as_micros() as u32,
        }
    }

    /// Return whether the estimator has consumed at least one sample.
    pub fn has_sample(&self) -> bool {
        self.srtt != 0
    }

    /// Return the current smoothed RTT estimation.
    pub fn smoothed_rtt(&self) -> Duration {
        Duration::from_micros((self.srtt >> 3) as u64)
    }

    /// Return the latest raw RTT sample.
    pub fn latest_rtt(&self) -> Duration {
        Duration::from_micros(self.latest_rtt as u64)
    }

    /// Return the latest raw RTT sample in microseconds.
    pub fn latest_rtt_us(&self) -> u32 {
        self.latest_rtt
    }

    /// Return the current deviation term used for RTO calculation.
    pub fn rttvar(&self) -> Duration {
        Duration::from_micros(self.rttvar as u64)
    }

    /// Return the current RTO backoff shift.
    pub fn backoff(&self) -> u32 {
        self.backoff
    }

    /// Increase the backoff shift after a retransmission timeout.
    pub fn backoff_inc(&mut self) {
        self.backoff = self.backoff.saturating_add(1);
    }

    /// Update estimator with the given raw RTT sample in microseconds.
    ///
    /// A zero sample is coerced to 1 to avoid degenerate shifts downstream.
    /// The caller enforces Karn's algorithm: acks of retransmitted segments
    /// must not be fed here unless a timestamp echo disambiguates them.
    pub fn sample(&mut self, measured_us: u32) {
        let m = cmp::max(measured_us, 1);
        self.latest_rtt = m;

        if self.srtt != 0 {
            let mut err = m as i64 - (self.srtt >> 3) as i64;
            self.srtt = (self.srtt as i64 + err) as u32;
            if err < 0 {
                err = -err;
            }
            err -= (self.mdev >> 2) as i64;
            self.mdev = (self.mdev as i64 + err) as u32;
            if self.mdev > self.mdev_max {
                self.mdev_max = self.mdev;
                if self.mdev_max > self.rttvar {
                    self.rttvar = self.mdev_max;
                }
            }
        } else {
            // First measurement.
            self.srtt = m << 3;
            self.mdev = m << 1;
            self.mdev_max = cmp::max(self.mdev, self.rto_min);
            self.rttvar = self.mdev_max;
        }

        // A usable sample means the network is answering again.
        self.backoff = 0;
    }

    /// Fold the deviation peak into `rttvar` at an ack-of-new-data boundary
    /// and restart peak tracking.
    pub fn on_new_data_acked(&mut self) {
        if self.srtt == 0 {
            return;
        }
        if self.mdev_max < self.rttvar {
            self.rttvar -= (self.rttvar - self.mdev_max) >> 2;
        }
        self.mdev_max = self.rto_min;
    }

    /// Return the retransmission timeout, bounded to `[rto_min, rto_max]`.
    ///
    /// Before the first sample the upper half of the bound is used, matching
    /// a conservative initial RTO.
    pub fn rto(&self) -> Duration {
        let rto = if self.srtt != 0 {
            (self.srtt >> 3).saturating_add(self.rttvar)
        } else {
            self.rto_min.saturating_mul(100)
        };
        let rto = rto.clamp(self.rto_min, self.rto_max);
        Duration::from_micros(rto as u64)
    }

    /// Return the RTO with the current exponential backoff applied, capped
    /// at `rto_max`.
    pub fn backoff_rto(&self) -> Duration {
        let base = self.rto().as_micros() as u64;
        let rto = base.saturating_mul(1 << cmp::min(self.backoff, 16));
        Duration::from_micros(cmp::min(rto, self.rto_max as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RTO_MIN: Duration = Duration::from_millis(200);
    const RTO_MAX: Duration = Duration::from_secs(120);

    #[test]
    fn initial() {
        let r = RttEstimator::new(RTO_MIN, RTO_MAX);
        assert!(!r.has_sample());
        assert_eq!(r.smoothed_rtt(), Duration::ZERO);
        assert_eq!(r.backoff(), 0);
        // Conservative RTO before any sample.
        assert_eq!(r.rto(), Duration::from_secs(20));
    }

    #[test]
    fn first_sample() {
        let mut r = RttEstimator::new(RTO_MIN, RTO_MAX);
        r.sample(100_000);
        assert!(r.has_sample());
        assert_eq!(r.smoothed_rtt(), Duration::from_millis(100));
        assert_eq!(r.latest_rtt(), Duration::from_millis(100));
        // mdev = 2 * sample, below rto_min, so rttvar starts at rto_min.
        assert_eq!(r.rttvar(), RTO_MIN);
        assert_eq!(r.rto(), Duration::from_millis(300));
    }

    #[test]
    fn zero_sample_coerced() {
        let mut r = RttEstimator::new(RTO_MIN, RTO_MAX);
        r.sample(0);
        assert_eq!(r.latest_rtt_us(), 1);
        assert_eq!(r.smoothed_rtt(), Duration::from_micros(1));
        assert_eq!(r.rto(), RTO_MIN + Duration::from_micros(1));
    }

    #[test]
    fn ewma_convergence() {
        let mut r = RttEstimator::new(RTO_MIN, RTO_MAX);
        r.sample(100_000);
        for _ in 0..100 {
            r.sample(300_000);
            r.on_new_data_acked();
        }
        // Estimate converges onto the steady sample.
        let srtt = r.smoothed_rtt().as_micros() as i64;
        assert!((srtt - 300_000).abs() < 2_000, "srtt={}", srtt);
        assert!(r.rto() >= Duration::from_millis(300));
        assert!(r.rto() <= RTO_MAX);
    }

    #[test]
    fn rto_bounds() {
        let mut r = RttEstimator::new(RTO_MIN, RTO_MAX);
        r.sample(1);
        assert_eq!(r.rto(), RTO_MIN + Duration::from_micros(1));

        for _ in 0..10 {
            r.sample(200_000_000);
        }
        assert_eq!(r.rto(), RTO_MAX);
    }

    #[test]
    fn backoff() {
        let mut r = RttEstimator::new(RTO_MIN, RTO_MAX);
        r.sample(100_000);
        let base = r.rto();

        r.backoff_inc();
        r.backoff_inc();
        assert_eq!(r.backoff(), 2);
        assert_eq!(r.backoff_rto(), base * 4);

        // Backoff saturates at rto_max.
        for _ in 0..20 {
            r.backoff_inc();
        }
        assert_eq!(r.backoff_rto(), RTO_MAX);

        // A fresh sample clears the backoff (Karn).
        r.sample(100_000);
        assert_eq!(r.backoff(), 0);
        assert_eq!(r.backoff_rto(), r.rto());
    }

    #[test]
    fn variance_fold_at_ack_boundary() {
        let mut r = RttEstimator::new(RTO_MIN, RTO_MAX);
        r.sample(500_000);
        // A large spike raises mdev_max and rttvar immediately.
        r.sample(1_500_000);
        let spiked = r.rttvar();

        // Steady samples inside one window do not lower rttvar.
        r.sample(500_000);
        r.sample(500_000);
        assert_eq!(r.rttvar(), spiked);

        // The fold at the new-data-ack boundary lets rttvar decay.
        let mut last = r.rttvar();
        for _ in 0..16 {
            r.on_new_data_acked();
            r.sample(500_000);
            assert!(r.rttvar() <= last);
            last = r.rttvar();
        }
        assert!(last < spiked);
    }
}
