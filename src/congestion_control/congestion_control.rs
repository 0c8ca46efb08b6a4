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

#![allow(unused_variables)]

use core::str::FromStr;
use std::cmp;
use std::fmt;
use std::time::Instant;

use crate::connection::rtt::RttEstimator;
use crate::seq::TcpSeq;
use crate::CongestionConfig;
use crate::Error;
use crate::Result;
pub use bic::Bic;
pub use bic::BicConfig;
pub use reno::Reno;
pub use vegas::Vegas;
pub use vegas::VegasConfig;

/// Available congestion control algorithms.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Default)]
pub enum CongestionControlAlgorithm {
    /// Reno-style additive increase / multiplicative decrease. Slow start
    /// below the threshold, then one segment per window of acks.
    #[default]
    Reno,

    /// A BIC-style binary search window increase. After a loss it probes
    /// back toward the last known-good window with a binary-search step,
    /// recovering faster than Reno without overshooting the prior maximum.
    Bic,

    /// Vegas, a delay-based algorithm. It compares the expected and actual
    /// delivery rates once per RTT and adjusts the window before losses
    /// occur.
    Vegas,
}

impl FromStr for CongestionControlAlgorithm {
    type Err = Error;

    fn from_str(algor: &str) -> Result<CongestionControlAlgorithm> {
        if algor.eq_ignore_ascii_case("reno") {
            Ok(CongestionControlAlgorithm::Reno)
        } else if algor.eq_ignore_ascii_case("bic") {
            Ok(CongestionControlAlgorithm::Bic)
        } else if algor.eq_ignore_ascii_case("vegas") {
            Ok(CongestionControlAlgorithm::Vegas)
        } else {
            Err(Error::InvalidConfig("unknown".into()))
        }
    }
}

/// The congestion window and its bookkeeping, shared by all algorithms.
/// All quantities are in whole segments (MSS units).
#[derive(Debug, Clone)]
pub struct WindowState {
    /// Congestion window.
    pub cwnd: u32,

    /// Slow start threshold.
    pub ssthresh: u32,

    /// Upper bound the window may never exceed.
    pub cwnd_clamp: u32,

    /// Fractional-increase accumulator for congestion avoidance, also used
    /// as the alternating counter for the rate-halving decrease.
    pub cwnd_cnt: u32,
}

impl WindowState {
    pub fn new(initial_cwnd: u32, ssthresh: u32, cwnd_clamp: u32) -> Self {
        WindowState {
            cwnd: initial_cwnd,
            ssthresh,
            cwnd_clamp,
            cwnd_cnt: 0,
        }
    }

    /// Whether the window is still below the slow start threshold.
    pub fn in_slow_start(&self) -> bool {
        self.cwnd <= self.ssthresh
    }

    /// Slow start: one more segment per ack, up to the clamp.
    pub fn slow_start(&mut self) {
        self.cwnd = cmp::min(self.cwnd + 1, self.cwnd_clamp);
    }

    /// Congestion avoidance: one more segment per `effective_cwnd` acks.
    pub fn cong_avoid_ai(&mut self, effective_cwnd: u32) {
        let effective_cwnd = cmp::max(effective_cwnd, 1);
        if self.cwnd_cnt >= effective_cwnd {
            self.cwnd_cnt = 0;
            self.cwnd = cmp::min(self.cwnd + 1, self.cwnd_clamp);
        } else {
            self.cwnd_cnt += 1;
        }
    }

    /// Clamp the window to `in_flight + max_burst` so a large cumulative ack
    /// cannot release a burst of back-to-back segments.
    pub fn moderate(&mut self, in_flight: u32, max_burst: u32) {
        self.cwnd = cmp::max(cmp::min(self.cwnd, in_flight + max_burst), 1);
    }

    /// Rate-halving decrease during a window reduction: every second ack
    /// takes one segment off, down to `floor` but never below
    /// `in_flight + 1`.
    pub fn cwnd_down(&mut self, in_flight: u32, floor: u32) {
        let decr = self.cwnd_cnt + 1;
        self.cwnd_cnt = decr & 1;
        let decr = decr >> 1;

        let limit = cmp::max(floor, in_flight + 1);
        if decr > 0 && self.cwnd.saturating_sub(decr) >= limit {
            self.cwnd -= decr;
        }
        self.cwnd = cmp::max(self.cwnd, 1);
    }

    /// Roll back a window reduction (`tcp_undo_cwr` behavior). The window is
    /// reinflated to twice the threshold; a real undo also restores the
    /// threshold snapshotted before the cut.
    pub fn undo(&mut self, prior_ssthresh: u32, real_undo: bool) {
        if prior_ssthresh != 0 {
            self.cwnd = cmp::max(self.cwnd, self.ssthresh << 1);
            if real_undo && prior_ssthresh > self.ssthresh {
                self.ssthresh = prior_ssthresh;
            }
        } else {
            self.cwnd = cmp::max(self.cwnd, self.ssthresh);
        }
        self.cwnd = cmp::min(self.cwnd, self.cwnd_clamp);
        self.cwnd_cnt = 0;
    }
}

/// Per-ack view handed to the window controller when `snd_una` advances.
#[derive(Debug, Clone, Copy)]
pub struct AckView {
    /// Cumulative ack after this ack was applied.
    pub snd_una: TcpSeq,

    /// Highest sequence sent so far.
    pub snd_nxt: TcpSeq,

    /// Segments newly acknowledged by this ack.
    pub newly_acked: u32,

    /// The raw RTT sample this ack produced, if it was usable under Karn's
    /// algorithm.
    pub rtt_sample_us: Option<u32>,
}

/// Window growth policy, selected once at connection setup.
///
/// The congestion state machine decides *when* the window may grow or must
/// shrink; implementations of this trait only decide *how fast* it grows
/// while the connection is in Open or Disorder.
pub trait CongestionController {
    /// Name of the congestion control algorithm.
    fn name(&self) -> &str;

    /// Grow the window for an ack that advanced `snd_una` while the state
    /// machine permits growth.
    fn on_ack_advance(
        &mut self,
        window: &mut WindowState,
        ack: &AckView,
        rtt: &RttEstimator,
        now: Instant,
    );

    /// The slow start threshold to adopt when the window is being cut.
    fn ssthresh(&mut self, window: &WindowState, in_flight: u32) -> u32 {
        cmp::max(window.cwnd / 2, 2)
    }

    /// Reset internal state after a retransmission timeout.
    fn on_loss(&mut self, window: &WindowState) {}
}

impl fmt::Debug for dyn CongestionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "congestion controller {}", self.name())
    }
}

/// Build a congestion controller.
pub fn build_congestion_controller(conf: &CongestionConfig) -> Box<dyn CongestionController> {
    match conf.congestion_control_algorithm {
        CongestionControlAlgorithm::Reno => Box::new(Reno::new()),
        CongestionControlAlgorithm::Bic => Box::new(Bic::new(BicConfig::default())),
        CongestionControlAlgorithm::Vegas => Box::new(Vegas::new(VegasConfig::default())),
    }
}


mod bic;
mod reno;
mod vegas;
