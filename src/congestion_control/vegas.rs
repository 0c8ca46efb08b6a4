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
use std::time::Instant;

use log::*;

use super::AckView;
use super::CongestionController;
use super::WindowState;
use crate::connection::rtt::RttEstimator;
use crate::seq::TcpSeq;

/// Probe threshold: grow the window while fewer than `alpha` segments are
/// estimated to be queued in the network.
const ALPHA: u32 = 2;

/// Shed threshold: shrink the window when more than `beta` segments appear
/// queued.
const BETA: u32 = 4;

/// Slow start bound: leave slow start as soon as more than `gamma` segments
/// appear queued.
const GAMMA: u32 = 1;

/// Minimum number of RTT samples in a window before the delay calculation
/// is trusted.
const MIN_SAMPLES: u32 = 3;

/// Vegas Configuration.
#[derive(Debug)]
pub struct VegasConfig {
    /// Probe threshold in segments.
    alpha: u32,

    /// Shed threshold in segments.
    beta: u32,

    /// Slow start exit threshold in segments.
    gamma: u32,
}

impl VegasConfig {
    /// Update alpha.
    fn set_alpha(&mut self, alpha: u32) -> &mut Self {
        self.alpha = alpha;
        self
    }

    /// Update beta.
    fn set_beta(&mut self, beta: u32) -> &mut Self {
        self.beta = beta;
        self
    }

    /// Update gamma.
    fn set_gamma(&mut self, gamma: u32) -> &mut Self {
        self.gamma = gamma;
        self
    }
}

impl Default for VegasConfig {
    fn default() -> Self {
        Self {
            alpha: ALPHA,
            beta: BETA,
            gamma: GAMMA,
        }
    }
}

/// Vegas delay-based congestion control.
///
/// Once per RTT it compares the expected rate (`cwnd / base_rtt`) with the
/// actual rate (`cwnd / min_rtt` of the window just finished) and adjusts
/// the window so the difference stays between `alpha` and `beta` segments.
/// The minimum RTT observed within the window stands in for queueing-free
/// delay; a window with fewer than three samples falls back to Reno growth.
#[derive(Debug)]
pub struct Vegas {
    /// Configuration.
    config: VegasConfig,

    /// The lowest RTT ever observed, the queueing-free delay proxy.
    base_rtt_us: u32,

    /// The lowest RTT observed during the current window.
    min_rtt_us: u32,

    /// Number of RTT samples collected during the current window.
    cnt_rtt: u32,

    /// `snd_una` when the current window started.
    beg_snd_una: TcpSeq,

    /// `snd_nxt` when the current window started; an ack past this ends the
    /// window.
    beg_snd_nxt: TcpSeq,

    /// Congestion window when the current window started.
    beg_snd_cwnd: u32,

    /// Whether the delay machinery is active. Disabled after an RTO until
    /// sampling restarts cleanly.
    doing_vegas: bool,
}

impl Vegas {
    pub fn new(config: VegasConfig) -> Self {
        Self {
            config,
            base_rtt_us: u32::MAX,
            min_rtt_us: u32::MAX,
            cnt_rtt: 0,
            beg_snd_una: TcpSeq(0),
            beg_snd_nxt: TcpSeq(0),
            beg_snd_cwnd: 0,
            doing_vegas: true,
        }
    }

    fn restart_window(&mut self, ack: &AckView, cwnd: u32) {
        self.beg_snd_una = self.beg_snd_nxt;
        self.beg_snd_nxt = ack.snd_nxt;
        self.beg_snd_cwnd = cwnd;
        self.cnt_rtt = 0;
        self.min_rtt_us = u32::MAX;
    }

    fn record_sample(&mut self, rtt_us: u32) {
        self.base_rtt_us = cmp::min(self.base_rtt_us, rtt_us);
        self.min_rtt_us = cmp::min(self.min_rtt_us, rtt_us);
        self.cnt_rtt += 1;
    }
}

impl CongestionController for Vegas {
    fn name(&self) -> &str {
        "vegas"
    }

    fn on_ack_advance(
        &mut self,
        window: &mut WindowState,
        ack: &AckView,
        rtt: &RttEstimator,
        now: Instant,
    ) {
        if let Some(sample) = ack.rtt_sample_us {
            self.record_sample(cmp::max(sample, 1));
        }

        if !self.doing_vegas {
            // Plain Reno until sampling is re-established.
            if window.in_slow_start() {
                window.slow_start();
            } else {
                window.cong_avoid_ai(window.cwnd);
            }
            if self.cnt_rtt >= MIN_SAMPLES {
                self.doing_vegas = true;
            }
            return;
        }

        // Act only once per RTT, when the ack passes the sequence recorded
        // at the start of this window.
        if !ack.snd_una.after(self.beg_snd_nxt) {
            return;
        }

        let cnt_rtt = self.cnt_rtt;
        let min_rtt = self.min_rtt_us;
        self.restart_window(ack, window.cwnd);

        if cnt_rtt < MIN_SAMPLES {
            // Not enough samples to trust the delay math for this RTT.
            if window.in_slow_start() {
                window.slow_start();
            } else {
                window.cong_avoid_ai(window.cwnd);
            }
            return;
        }

        let base_rtt = cmp::max(self.base_rtt_us, 1) as u64;
        let rtt = cmp::max(min_rtt, 1) as u64;
        let cwnd = window.cwnd as u64;

        // Segments sitting in queues: expected minus actual rate, scaled by
        // the queueing-free delay.
        let target_cwnd = (cwnd * base_rtt / rtt) as u32;
        let diff = (cwnd * (rtt - cmp::min(base_rtt, rtt)) / base_rtt) as u32;

        trace!(
            "vegas cwnd={} base_rtt={}us min_rtt={}us diff={}",
            window.cwnd,
            base_rtt,
            rtt,
            diff
        );

        if diff > self.config.gamma && window.in_slow_start() {
            // Slow start is outrunning the path. Match the measured rate
            // exactly and drop to congestion avoidance right away, without
            // waiting for a loss.
            window.cwnd = cmp::min(window.cwnd, target_cwnd + 1);
            window.ssthresh = cmp::min(window.ssthresh, window.cwnd.saturating_sub(1).max(2));
        } else if window.in_slow_start() {
            window.slow_start();
        } else if diff > self.config.beta {
            // Too much data queued: shed one segment.
            window.cwnd -= 1;
            window.ssthresh = cmp::min(window.ssthresh, window.cwnd.saturating_sub(1).max(2));
        } else if diff < self.config.alpha {
            // Spare capacity: probe with one more segment.
            window.cwnd += 1;
        }
        // In between alpha and beta: hold.

        window.cwnd = window.cwnd.clamp(2, window.cwnd_clamp);
    }

    fn on_loss(&mut self, window: &WindowState) {
        self.doing_vegas = false;
        self.cnt_rtt = 0;
        self.min_rtt_us = u32::MAX;
    }
}
