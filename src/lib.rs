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

//! TCPCC is the congestion control and reliable delivery core of a TCP
//! sender, factored out as a standalone library.
//!
//! It tracks unacknowledged segments in a retransmission queue, processes
//! cumulative and selective acknowledgments, estimates round trip time,
//! drives the Open/Disorder/CWR/Recovery/Loss congestion state machine with
//! its undo paths and F-RTO probing, and grows or shrinks the congestion
//! window through pluggable controllers (Reno, BIC, Vegas).
//!
//! The library does not own sockets or move payload bytes. The caller feeds
//! it send and acknowledgment events and reads back the window, the
//! segments to retransmit, and the retransmission deadline.

#![allow(unused_imports)]
#![allow(dead_code)]

use std::cmp;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// The largest window scale shift allowed by RFC 7323 Section 2.3.
pub const MAX_WSCALE: u8 = 14;

/// The largest send window a peer can advertise, i.e. the 16 bit window
/// field shifted by the maximum scale factor.
pub const MAX_WINDOW: u32 = 65535 << MAX_WSCALE as u32;

/// Upper bound on the reordering estimate, in segments. Acks carrying
/// evidence of deeper reordering clamp to this value.
pub const MAX_REORDERING: u32 = 127;

/// Default reordering tolerance, in segments. Three duplicate
/// acknowledgments trigger fast retransmit.
const DEFAULT_REORDERING: u32 = 3;

/// Default initial congestion window, in segments.
const DEFAULT_INITIAL_CWND: u32 = 10;

/// Default slow start threshold, in segments. Effectively unbounded until
/// the first loss event sets a real threshold.
const DEFAULT_INITIAL_SSTHRESH: u32 = u16::MAX as u32;

/// Default hard ceiling on the congestion window, in segments.
const DEFAULT_CWND_CLAMP: u32 = u16::MAX as u32;

/// Default burst allowance when moderating the window after an undo, in
/// segments.
const DEFAULT_MAX_BURST: u32 = 3;

/// Default lower bound of the retransmission timeout.
const DEFAULT_RTO_MIN: Duration = Duration::from_millis(200);

/// Default upper bound of the retransmission timeout.
const DEFAULT_RTO_MAX: Duration = Duration::from_secs(120);

/// Configurations about a connection.
#[derive(Clone)]
pub struct Config {
    /// Initial send sequence number.
    pub(crate) initial_seq: u32,

    /// Shift applied to the peer's 16 bit window advertisements.
    pub(crate) snd_wscale: u8,

    /// Initial congestion window in segments.
    pub(crate) initial_cwnd: u32,

    /// Initial slow start threshold in segments.
    pub(crate) initial_ssthresh: u32,

    /// Hard ceiling on the congestion window in segments.
    pub(crate) cwnd_clamp: u32,

    /// Reordering tolerance in segments.
    pub(crate) reordering: u32,

    /// Burst allowance for window moderation in segments.
    pub(crate) max_burst: u32,

    /// Whether the peer negotiated SACK. Without it, duplicate
    /// acknowledgments emulate selective acknowledgment information.
    pub(crate) sack_enabled: bool,

    /// Lower bound of the retransmission timeout.
    pub(crate) rto_min: Duration,

    /// Upper bound of the retransmission timeout.
    pub(crate) rto_max: Duration,

    /// Congestion control configurations.
    pub congestion: CongestionConfig,
}

impl Config {
    /// Create default configuration.
    ///
    /// The configuration may be customized by calling related set methods.
    ///
    /// ## Examples:
    ///
    /// ```
    /// let mut conf = tcpcc::Config::new()?;
    /// conf.set_initial_cwnd(10);
    /// conf.set_snd_wscale(7)?;
    /// # Ok::<(), tcpcc::error::Error>(())
    /// ```
    pub fn new() -> Result<Self> {
        Ok(Self {
            initial_seq: 0,
            snd_wscale: 0,
            initial_cwnd: DEFAULT_INITIAL_CWND,
            initial_ssthresh: DEFAULT_INITIAL_SSTHRESH,
            cwnd_clamp: DEFAULT_CWND_CLAMP,
            reordering: DEFAULT_REORDERING,
            max_burst: DEFAULT_MAX_BURST,
            sack_enabled: true,
            rto_min: DEFAULT_RTO_MIN,
            rto_max: DEFAULT_RTO_MAX,
            congestion: CongestionConfig::default(),
        })
    }

    /// Set the initial send sequence number.
    pub fn set_initial_seq(&mut self, v: u32) {
        self.initial_seq = v;
    }

    /// Set the shift applied to the peer's window advertisements, as
    /// negotiated by the window scale option.
    pub fn set_snd_wscale(&mut self, v: u8) -> Result<()> {
        if v > MAX_WSCALE {
            return Err(Error::InvalidConfig("window scale too large".into()));
        }
        self.snd_wscale = v;
        Ok(())
    }

    /// Set the initial congestion window in segments.
    pub fn set_initial_cwnd(&mut self, v: u32) {
        self.initial_cwnd = cmp::max(v, 1);
    }

    /// Set the initial slow start threshold in segments.
    pub fn set_initial_ssthresh(&mut self, v: u32) {
        self.initial_ssthresh = cmp::max(v, 2);
    }

    /// Set the hard ceiling on the congestion window in segments.
    pub fn set_cwnd_clamp(&mut self, v: u32) {
        self.cwnd_clamp = cmp::max(v, 2);
    }

    /// Set the reordering tolerance in segments.
    pub fn set_reordering(&mut self, v: u32) -> Result<()> {
        if v == 0 || v > MAX_REORDERING {
            return Err(Error::InvalidConfig("reordering out of range".into()));
        }
        self.reordering = v;
        Ok(())
    }

    /// Set the burst allowance used when moderating the window.
    pub fn set_max_burst(&mut self, v: u32) {
        self.max_burst = v;
    }

    /// Enable or disable SACK processing.
    pub fn enable_sack(&mut self, v: bool) {
        self.sack_enabled = v;
    }

    /// Set the lower bound of the retransmission timeout in milliseconds.
    pub fn set_rto_min(&mut self, v: u64) {
        self.rto_min = Duration::from_millis(v);
    }

    /// Set the upper bound of the retransmission timeout in milliseconds.
    pub fn set_rto_max(&mut self, v: u64) {
        self.rto_max = Duration::from_millis(v);
    }

    /// Set the congestion control algorithm.
    pub fn set_congestion_control_algorithm(&mut self, v: CongestionControlAlgorithm) {
        self.congestion.congestion_control_algorithm = v;
    }
}

/// Configurations about congestion control.
#[derive(Debug, Clone)]
pub struct CongestionConfig {
    /// Congestion control algorithm.
    pub congestion_control_algorithm: CongestionControlAlgorithm,
}

impl Default for CongestionConfig {
    fn default() -> Self {
        Self {
            congestion_control_algorithm: CongestionControlAlgorithm::default(),
        }
    }
}

/// Statistics about a connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConnectionStats {
    /// Total number of sent segments.
    pub sent_count: u64,

    /// Total number of segments cumulatively acknowledged.
    pub acked_count: u64,

    /// Total number of retransmitted segments.
    pub retrans_count: u64,

    /// Total number of duplicate acknowledgments received.
    pub dup_ack_count: u64,

    /// Total number of retransmission timeouts fired.
    pub rto_count: u64,
}

/// A point-in-time view of congestion state, for diagnostics export.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CongestionSnapshot {
    /// Current congestion avoidance state.
    pub ca_state: CaState,

    /// Congestion window in segments.
    pub cwnd: u32,

    /// Slow start threshold in segments.
    pub ssthresh: u32,

    /// Smoothed round trip time in microseconds.
    pub srtt_us: u64,

    /// Current retransmission timeout, with backoff applied, in
    /// microseconds.
    pub rto_us: u64,

    /// Reordering tolerance in segments.
    pub reordering: u32,

    /// Segments selectively acknowledged but not yet cumulatively acked.
    pub sacked_out: u32,

    /// Segments considered lost.
    pub lost_out: u32,

    /// Segments retransmitted and still unacknowledged.
    pub retrans_out: u32,
}

/// A specialized [`Result`] type for quick returns.
///
/// [`Result`]: https://doc.rust-lang.org/std/result/enum.Result.html
pub type Result<T> = std::result::Result<T, Error>;


pub use crate::congestion_control::CongestionControlAlgorithm;
pub use crate::connection::AckOutcome;
pub use crate::connection::AckPacket;
pub use crate::connection::CaState;
pub use crate::connection::Connection;
pub use crate::connection::SackBlock;
pub use crate::error::Error;
pub use crate::seq::TcpSeq;

#[path = "connection/connection.rs"]
pub mod connection;

#[path = "congestion_control/congestion_control.rs"]
pub mod congestion_control;

pub mod error;
mod seq;
