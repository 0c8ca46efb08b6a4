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

use std::time::Instant;

use super::AckView;
use super::CongestionController;
use super::WindowState;
use crate::connection::rtt::RttEstimator;

/// Reno congestion control.
///
/// Slow start while `cwnd <= ssthresh`, then additive increase of one
/// segment per window of acks. The multiplicative decrease is the trait
/// default of half the window. Also used as the fallback growth rule by the
/// other algorithms.
#[derive(Debug, Default)]
pub struct Reno;

impl Reno {
    pub fn new() -> Self {
        Reno
    }
}

impl CongestionController for Reno {
    fn name(&self) -> &str {
        "reno"
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
        } else {
            window.cong_avoid_ai(window.cwnd);
        }
    }
}
