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
use std::time::Instant;

use log::*;

use super::AckView;
use super::CongestionController;
use super::WindowState;
use crate::connection::rtt::RttEstimator;

/// Below this window BIC behaves exactly like Reno; the binary search is
/// not worth its overhead for small windows.
const LOW_WINDOW: u32 = 14;

/// Smoothing factor of the binary search step, in units of 1/BICTCP_B.
const SMOOTH_PART: u32 = 20;

/// The maximum window increase per RTT (turns the search linear far below
/// the target).
const MAX_INCREMENT: u32 = 16;

/// Distance divisor of the binary search.
const BICTCP_B: u32 = 4;

/// Multiplicative decrease factor, scaled by `BETA_SCALE`.
const BETA: u32 = 819;

/// Scale of `BETA` (so beta is 819/1024, about 0.8).
const BETA_SCALE: u32 = 1024;

/// Don't grow faster than 1/20 of the window per ack before the first loss.
const INITIAL_CNT_CAP: u32 = 20;

/// Ignore window updates arriving closer together than this.
const UPDATE_INTERVAL: Duration = Duration::from_millis(31);

/// BIC Configuration.
#[derive(Debug)]
pub struct BicConfig {
    /// Reno fallback window.
    low_window: u32,

    /// Largest increase per RTT in segments.
    max_increment: u32,

    /// Enable shrinking the remembered maximum when a loss occurs below it,
    /// to release bandwidth to newer flows faster.
    fast_convergence_enabled: bool,
}

impl BicConfig {
    /// Update low window.
    fn set_low_window(&mut self, low_window: u32) -> &mut Self {
        self.low_window = low_window;
        self
    }

    /// Update max increment.
    fn set_max_increment(&mut self, max_increment: u32) -> &mut Self {
        self.max_increment = cmp::max(max_increment, 1);
        self
    }

    /// Enable fast convergence.
    fn enable_fast_convergence(&mut self, enable: bool) -> &mut Self {
        self.fast_convergence_enabled = enable;
        self
    }
}

impl Default for BicConfig {
    fn default() -> Self {
        Self {
            low_window: LOW_WINDOW,
            max_increment: MAX_INCREMENT,
            fast_convergence_enabled: true,
        }
    }
}

/// BIC congestion control: binary increase of the window toward the last
/// maximum seen before a reduction.
///
/// Far below the target the increase is linear (`max_increment` per RTT);
/// close to it the step halves the remaining distance (binary search); above
/// it the window probes gently away from the known-good point.
#[derive(Debug)]
pub struct Bic {
    /// Configuration.
    config: BicConfig,

    /// The last maximum window before the last reduction.
    last_max_cwnd: u32,

    /// The window the last increase count was computed for.
    last_cwnd: u32,

    /// When the increase count was last computed.
    last_stamp: Option<Instant>,

    /// Window at the last loss event. Zero until the first loss.
    loss_cwnd: u32,

    /// Acks needed per one-segment increase, derived from the distance to
    /// `last_max_cwnd`.
    cnt: u32,
}

impl Bic {
    pub fn new(config: BicConfig) -> Self {
        Self {
            config,
            last_max_cwnd: 0,
            last_cwnd: 0,
            last_stamp: None,
            loss_cwnd: 0,
            cnt: 0,
        }
    }

    /// Recompute `cnt`, the number of acks per segment of growth, for the
    /// current window.
    fn update(&mut self, cwnd: u32, now: Instant) {
        if self.last_cwnd == cwnd {
            if let Some(last) = self.last_stamp {
                if now.saturating_duration_since(last) <= UPDATE_INTERVAL {
                    return;
                }
            }
        }
        self.last_cwnd = cwnd;
        self.last_stamp = Some(now);

        if cwnd <= self.config.low_window {
            self.cnt = cwnd;
            return;
        }

        if cwnd < self.last_max_cwnd {
            let dist = (self.last_max_cwnd - cwnd) / BICTCP_B;
            if dist > self.config.max_increment {
                // Far away: linear increase.
                self.cnt = cwnd / self.config.max_increment;
            } else if dist <= 1 {
                // On top of the target: smoothed binary search.
                self.cnt = (cwnd * SMOOTH_PART) / BICTCP_B;
            } else {
                // Binary search toward the target.
                self.cnt = cwnd / dist;
            }
        } else {
            // Beyond the last maximum: careful slow-start-like probing
            // first, turning linear once far above it.
            if cwnd < self.last_max_cwnd + BICTCP_B {
                self.cnt = (cwnd * SMOOTH_PART) / BICTCP_B;
            } else if cwnd < self.last_max_cwnd + self.config.max_increment * (BICTCP_B - 1) {
                self.cnt = (cwnd * (BICTCP_B - 1)) / (cwnd - self.last_max_cwnd);
            } else {
                self.cnt = cwnd / self.config.max_increment;
            }
        }

        // No loss seen yet: do not grow slower than 1/20 per ack.
        if self.loss_cwnd == 0 && self.cnt > INITIAL_CNT_CAP {
            self.cnt = INITIAL_CNT_CAP;
        }
        if self.cnt == 0 {
            self.cnt = 1;
        }
    }
}

impl CongestionController for Bic {
    fn name(&self) -> &str {
        "bic"
    }

    fn on_ack_advance(
        &mut self,
        window: &mut WindowState,
        ack: &AckView,
        rtt: &RttEstimator,
        now: Instant,
    ) {
        if window.in_slow_start() {
            window.slow_start();
            return;
        }
        self.update(window.cwnd, now);
        window.cong_avoid_ai(self.cnt);
    }

    fn ssthresh(&mut self, window: &WindowState, in_flight: u32) -> u32 {
        let cwnd = window.cwnd;

        // Epoch ends; remember where the network last pushed back.
        if cwnd < self.last_max_cwnd && self.config.fast_convergence_enabled {
            self.last_max_cwnd = (cwnd * (BETA_SCALE + BETA)) / (2 * BETA_SCALE);
        } else {
            self.last_max_cwnd = cwnd;
        }
        self.loss_cwnd = cwnd;
        trace!(
            "bic loss event cwnd={} last_max_cwnd={}",
            cwnd,
            self.last_max_cwnd
        );

        if cwnd <= self.config.low_window {
            return cmp::max(cwnd >> 1, 2);
        }
        cmp::max((cwnd * BETA) / BETA_SCALE, 2)
    }

    fn on_loss(&mut self, window: &WindowState) {
        self.last_max_cwnd = 0;
        self.last_cwnd = 0;
        self.last_stamp = None;
        self.cnt = 0;
    }
}
