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

//! Per-connection congestion control and reliable-delivery state.

use std::cmp;
use std::time::Instant;

use enumflags2::bitflags;
use enumflags2::BitFlags;
use log::*;
use smallvec::SmallVec;

use self::recovery::AckEvent;
use self::recovery::LossRecovery;
use self::rtt::RttEstimator;
use self::sack::SackProcessor;
use self::scoreboard::Scoreboard;
use crate::congestion_control;
use crate::congestion_control::AckView;
use crate::congestion_control::CongestionController;
use crate::congestion_control::WindowState;
use crate::seq::TcpSeq;
use crate::CongestionSnapshot;
use crate::Config;
use crate::ConnectionStats;
use crate::Error;
use crate::Result;
pub use self::recovery::CaState;
pub use self::sack::SackBlock;

/// Events observed while one ack is applied, combined into the view the
/// state machine decides on.
#[bitflags]
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckFlag {
    /// The cumulative ack advanced over some data.
    DataAcked = 0x0001,

    /// The peer's advertised window changed.
    WinUpdate = 0x0002,

    /// At least one segment was newly reported received via SACK.
    DataSacked = 0x0004,

    /// New loss evidence surfaced (SACK past the episode fence, or a lost
    /// retransmission).
    DataLost = 0x0008,

    /// The ack carried an ECN congestion echo.
    EcnEcho = 0x0010,

    /// Some drained segment had been retransmitted.
    RetransAcked = 0x0020,

    /// Some drained segment was acked off its original transmission.
    OrigAcked = 0x0040,

    /// The first SACK block was a duplicate report.
    DsackSeen = 0x0080,

    /// The ack duplicated the previous one without new information.
    DupAck = 0x0100,
}

/// A decoded incoming ack, as handed over by the option-decoding layer.
#[derive(Debug, Clone, Default)]
pub struct AckPacket {
    /// Cumulative acknowledgment.
    pub ack_seq: TcpSeq,

    /// Raw (unscaled) window advertisement.
    pub window: u16,

    /// SACK blocks carried by the packet, if any.
    pub sack_blocks: SmallVec<[SackBlock; 4]>,

    /// Peer timestamp value.
    pub ts_value: Option<u32>,

    /// Echo of our own timestamp.
    pub ts_echo: Option<u32>,

    /// ECN congestion-experienced echo.
    pub ecn_echo: bool,
}

/// What one processed ack means for the caller.
#[derive(Debug, Default)]
pub struct AckOutcome {
    /// Bytes newly covered by the cumulative ack.
    pub newly_acked_bytes: u32,

    /// The congestion window after this ack, in segments.
    pub cwnd: u32,

    /// Segment ranges due for retransmission right now, oldest first. The
    /// caller emits them and reports each back via `on_retransmit`.
    pub retransmits: Vec<(TcpSeq, TcpSeq)>,

    /// When the retransmission timer should next fire, if armed.
    pub rto_deadline: Option<Instant>,
}

/// Congestion control context of one connection.
///
/// Owns the retransmission scoreboard, the RTT estimator, the SACK
/// processor, the loss recovery state machine and the pluggable window
/// growth policy, and drives them in order for every incoming ack. All
/// events of one connection are processed sequentially; there is no
/// interior locking.
pub struct Connection {
    /// Oldest unacknowledged sequence number.
    snd_una: TcpSeq,

    /// Next sequence number to be sent.
    snd_nxt: TcpSeq,

    /// Peer receive window, in bytes, already scaled.
    snd_wnd: u32,

    /// Ack sequence of the last accepted window update.
    snd_wl2: TcpSeq,

    /// Window scale shift negotiated for the peer's advertisements.
    snd_wscale: u8,

    /// Most recent peer timestamp accepted; acks echoing an older one are
    /// rejected as wrapped duplicates.
    ts_recent: Option<u32>,

    /// Round trip estimation.
    rtt: RttEstimator,

    /// Per-segment delivery bookkeeping.
    scoreboard: Scoreboard,

    /// SACK block interpretation.
    sack: SackProcessor,

    /// The congestion state machine.
    recovery: LossRecovery,

    /// The congestion window and threshold.
    window: WindowState,

    /// Window growth policy.
    cc: Box<dyn CongestionController>,

    /// When the retransmission timer fires next.
    rto_deadline: Option<Instant>,

    /// Various statistics of the connection.
    stats: ConnectionStats,

    /// Unique trace id for debug logging.
    trace_id: String,
}

impl Connection {
    /// Create a new congestion control context.
    pub fn new(conf: &Config) -> Result<Connection> {
        if conf.snd_wscale > crate::MAX_WSCALE {
            return Err(Error::InvalidConfig("window scale too large".into()));
        }
        if conf.initial_cwnd == 0 || conf.cwnd_clamp == 0 {
            return Err(Error::InvalidConfig("zero window".into()));
        }
        let cc = congestion_control::build_congestion_controller(&conf.congestion);

        Ok(Connection {
            snd_una: TcpSeq(conf.initial_seq),
            snd_nxt: TcpSeq(conf.initial_seq),
            snd_wnd: 0,
            snd_wl2: TcpSeq(conf.initial_seq),
            snd_wscale: conf.snd_wscale,
            ts_recent: None,
            rtt: RttEstimator::new(conf.rto_min, conf.rto_max),
            scoreboard: Scoreboard::new(),
            sack: SackProcessor::new(crate::MAX_WINDOW, crate::MAX_REORDERING),
            recovery: LossRecovery::new(conf.reordering, conf.max_burst, conf.sack_enabled),
            window: WindowState::new(conf.initial_cwnd, conf.initial_ssthresh, conf.cwnd_clamp),
            cc,
            rto_deadline: None,
            stats: ConnectionStats::default(),
            trace_id: String::from(""),
        })
    }

    /// Set the unique trace id for debug logging.
    pub fn set_trace_id(&mut self, trace_id: &str) {
        self.trace_id = trace_id.to_string();
        self.recovery.set_trace_id(trace_id);
    }

    pub fn snd_una(&self) -> TcpSeq {
        self.snd_una
    }

    pub fn snd_nxt(&self) -> TcpSeq {
        self.snd_nxt
    }

    /// Current congestion state.
    pub fn ca_state(&self) -> CaState {
        self.recovery.ca_state()
    }

    /// Whether the window permits transmitting another segment right now.
    pub fn can_send(&self) -> bool {
        let c = self.scoreboard.counters();
        if c.in_flight() >= self.window.cwnd {
            return false;
        }
        (self.snd_nxt - self.snd_una) < cmp::max(self.snd_wnd, 1)
    }

    /// Advisory that the embedding is under memory pressure.
    ///
    /// The window is moderated down to what is currently in flight plus a
    /// small burst allowance. No state transition and no threshold cut:
    /// growth resumes with the next acceptable ack.
    pub fn on_memory_pressure(&mut self) {
        self.recovery
            .on_memory_pressure(&self.scoreboard.counters(), &mut self.window);
    }

    /// Record a newly transmitted segment covering `[seq, end_seq)`.
    ///
    /// Arms the retransmission timer if it was idle.
    pub fn on_packet_sent(&mut self, seq: TcpSeq, end_seq: TcpSeq, now: Instant) {
        if seq != self.snd_nxt {
            warn!(
                "{} sent {} while snd_nxt is {}",
                self.trace_id, seq, self.snd_nxt
            );
        }
        self.scoreboard.enqueue(seq, end_seq, now);
        if end_seq.after(self.snd_nxt) {
            self.snd_nxt = end_seq;
        }
        if self.rto_deadline.is_none() {
            self.rto_deadline = Some(now + self.rtt.backoff_rto());
        }
        self.stats.sent_count += 1;
    }

    /// Record the retransmission of `[seq, end_seq)`, previously scheduled
    /// through an `AckOutcome`. `ts_val` is our timestamp option value on
    /// the retransmitted segment, used for spurious-cut detection.
    pub fn on_retransmit(&mut self, seq: TcpSeq, end_seq: TcpSeq, ts_val: Option<u32>, now: Instant) {
        self.scoreboard.mark_retransmitted(seq, end_seq, now);
        self.recovery.note_retransmission(ts_val);
        self.stats.retrans_count += 1;
    }

    /// Process one incoming ack and return what it changed.
    ///
    /// Acks outside the window (behind `snd_una` or beyond `snd_nxt`) and
    /// acks failing the timestamp check are discarded with `Error::Done`
    /// without touching any state.
    pub fn on_ack(&mut self, pkt: &AckPacket, now: Instant) -> Result<AckOutcome> {
        if pkt.ack_seq.after(self.snd_nxt) {
            trace!(
                "{} ack {} beyond snd_nxt {}",
                self.trace_id,
                pkt.ack_seq,
                self.snd_nxt
            );
            return Err(Error::Done);
        }
        if pkt.ack_seq.before(self.snd_una) {
            return Err(Error::Done);
        }
        // Timestamp sanity: an ack echoing a timestamp older than the last
        // one accepted is a wrapped or reordered duplicate.
        if let (Some(ts), Some(recent)) = (pkt.ts_value, self.ts_recent) {
            if (ts.wrapping_sub(recent) as i32) < 0 {
                trace!("{} paws reject ts={} recent={}", self.trace_id, ts, recent);
                return Err(Error::Done);
            }
        }
        if pkt.ts_value.is_some() {
            self.ts_recent = pkt.ts_value;
        }

        let mut flags: BitFlags<AckFlag> = BitFlags::empty();
        let prior_snd_una = self.snd_una;
        let prior_in_flight = self.scoreboard.counters().in_flight();

        if pkt.ack_seq.after(self.snd_una) {
            flags |= AckFlag::DataAcked;
        }
        self.update_window(pkt, &mut flags);
        if pkt.ecn_echo {
            flags |= AckFlag::EcnEcho;
        }

        // Drain segments fully covered by the cumulative ack, collecting
        // the RTT sample and the per-tag evidence as they go.
        let acked = self.scoreboard.ack_to(pkt.ack_seq);
        let newly_acked = acked.len() as u32;
        let mut newly_acked_bytes = 0;
        let mut sample_sent: Option<Instant> = None;
        for seg in &acked {
            newly_acked_bytes += seg.len();
            if seg.is_retrans() {
                flags |= AckFlag::RetransAcked;
            } else {
                flags |= AckFlag::OrigAcked;
                // Karn: only segments never retransmitted produce samples.
                sample_sent = Some(match sample_sent {
                    Some(t) => cmp::max(t, seg.time_sent),
                    None => seg.time_sent,
                });
            }
        }
        self.snd_una = pkt.ack_seq;
        self.stats.acked_count += newly_acked as u64;

        if flags.contains(AckFlag::DataAcked) {
            if let Some(sent) = sample_sent {
                let us = now.saturating_duration_since(sent).as_micros();
                self.rtt.sample(cmp::min(us, u32::MAX as u128) as u32);
            }
            self.rtt.on_new_data_acked();
        } else if !flags.contains(AckFlag::WinUpdate)
            && (!self.scoreboard.is_empty() || !pkt.sack_blocks.is_empty())
        {
            flags |= AckFlag::DupAck;
            self.stats.dup_ack_count += 1;
        }

        flags |= self.sack.process(
            &mut self.scoreboard,
            &pkt.sack_blocks,
            pkt.ack_seq,
            prior_snd_una,
            self.recovery.high_seq,
            &mut self.recovery.undo_retrans,
            &mut self.recovery.reordering,
        );

        // Window growth first, while the state still permits it; the state
        // machine may well cut right after.
        let state = self.recovery.ca_state();
        let may_raise = flags.contains(AckFlag::DataAcked)
            && prior_in_flight >= self.window.cwnd
            && state < CaState::Cwr
            && (!flags.contains(AckFlag::EcnEcho) || self.window.in_slow_start());
        if may_raise {
            let view = AckView {
                snd_una: self.snd_una,
                snd_nxt: self.snd_nxt,
                newly_acked,
                rtt_sample_us: if self.rtt.has_sample() {
                    Some(self.rtt.latest_rtt_us())
                } else {
                    None
                },
            };
            self.cc
                .on_ack_advance(&mut self.window, &view, &self.rtt, now);
        }

        // A clean in-order ack in Open needs no state machine attention.
        // Anything else is dubious: a duplicate, new SACK or loss evidence,
        // a congestion echo, or an episode already in progress.
        let dubious = !flags.intersects(AckFlag::DataAcked | AckFlag::WinUpdate)
            || flags.intersects(
                AckFlag::DataSacked | AckFlag::DataLost | AckFlag::DsackSeen | AckFlag::EcnEcho,
            )
            || self.recovery.ca_state() != CaState::Open;

        let ev = AckEvent {
            flags,
            prior_snd_una,
            snd_una: self.snd_una,
            snd_nxt: self.snd_nxt,
            newly_acked,
            ts_echo: pkt.ts_echo,
            now,
        };
        let schedule = dubious
            && self.recovery.on_ack(
                &mut self.scoreboard,
                &mut self.window,
                self.cc.as_mut(),
                &self.rtt,
                &ev,
            );

        let retransmits = if schedule {
            self.recovery
                .schedule_retransmits(&self.scoreboard, &self.window)
        } else {
            Vec::new()
        };

        // Restart the timer on forward progress; cancel it when nothing is
        // left outstanding.
        if self.scoreboard.is_empty() {
            self.rto_deadline = None;
        } else if flags.contains(AckFlag::DataAcked) {
            self.rto_deadline = Some(now + self.rtt.backoff_rto());
        }

        Ok(AckOutcome {
            newly_acked_bytes,
            cwnd: self.window.cwnd,
            retransmits,
            rto_deadline: self.rto_deadline,
        })
    }

    /// The retransmission timer fired.
    ///
    /// Backs the timer off exponentially and reacts per the state machine:
    /// a first timeout with a live RTT estimate opens an F-RTO probe window
    /// instead of flushing the scoreboard outright. Returns the ranges to
    /// retransmit immediately.
    pub fn on_rto(&mut self, now: Instant) -> AckOutcome {
        let mut out = AckOutcome {
            cwnd: self.window.cwnd,
            ..Default::default()
        };
        let head = match self.scoreboard.head() {
            Some(head) => (head.seq, head.end_seq),
            None => {
                self.rto_deadline = None;
                return out;
            }
        };
        let c = self.scoreboard.counters();

        if self.rtt.has_sample() && self.recovery.retransmits == 0 {
            self.recovery.enter_frto(
                &mut self.window,
                self.cc.as_mut(),
                c.in_flight(),
                self.snd_una,
                self.snd_nxt,
            );
        } else {
            self.recovery.enter_loss(
                &mut self.scoreboard,
                &mut self.window,
                self.cc.as_mut(),
                self.snd_una,
                self.snd_nxt,
                true,
            );
        }
        self.recovery.retransmits += 1;
        self.rtt.backoff_inc();
        self.stats.rto_count += 1;
        self.rto_deadline = Some(now + self.rtt.backoff_rto());

        out.cwnd = self.window.cwnd;
        out.retransmits = vec![head];
        out.rto_deadline = self.rto_deadline;
        out
    }

    /// Read-only diagnostics snapshot.
    pub fn snapshot(&self) -> CongestionSnapshot {
        let c = self.scoreboard.counters();
        CongestionSnapshot {
            ca_state: self.recovery.ca_state(),
            cwnd: self.window.cwnd,
            ssthresh: self.window.ssthresh,
            srtt_us: self.rtt.smoothed_rtt().as_micros() as u64,
            rto_us: self.rtt.backoff_rto().as_micros() as u64,
            reordering: self.recovery.reordering,
            sacked_out: c.sacked_out,
            lost_out: c.lost_out,
            retrans_out: c.retrans_out,
        }
    }

    /// Various statistics of the connection.
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Accept the window advertisement if it is fresh (`snd_wl2` rule).
    /// Advertisements are scaled uniformly; the handshake exchange itself
    /// is outside this context.
    fn update_window(&mut self, pkt: &AckPacket, flags: &mut BitFlags<AckFlag>) {
        let nwin = (pkt.window as u32) << self.snd_wscale;
        if pkt.ack_seq.after(self.snd_wl2)
            || (pkt.ack_seq == self.snd_wl2 && nwin > self.snd_wnd)
        {
            if nwin != self.snd_wnd {
                *flags |= AckFlag::WinUpdate;
            }
            self.snd_wnd = nwin;
            self.snd_wl2 = pkt.ack_seq;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::CongestionControlAlgorithm;
    use smallvec::smallvec;
    use std::time::Duration;

    const MSS: u32 = 1000;

    fn new_conn(algor: CongestionControlAlgorithm) -> Connection {
        let mut conf = Config::new().unwrap();
        conf.set_initial_cwnd(10);
        conf.set_initial_ssthresh(20);
        conf.congestion.congestion_control_algorithm = algor;
        let mut conn = Connection::new(&conf).unwrap();
        conn.set_trace_id("TEST");
        conn
    }

    fn send_segments(conn: &mut Connection, count: u32, now: Instant) {
        for _ in 0..count {
            let seq = conn.snd_nxt();
            conn.on_packet_sent(seq, seq + MSS, now);
        }
    }

    fn plain_ack(ack_seq: u32, window: u16) -> AckPacket {
        AckPacket {
            ack_seq: TcpSeq(ack_seq),
            window,
            ..Default::default()
        }
    }

    fn sack_ack(ack_seq: u32, window: u16, blocks: &[(u32, u32)]) -> AckPacket {
        AckPacket {
            ack_seq: TcpSeq(ack_seq),
            window,
            sack_blocks: blocks.iter().map(|b| SackBlock::new(b.0, b.1)).collect(),
            ..Default::default()
        }
    }

    fn assert_counter_invariants(conn: &Connection) {
        let c = conn.scoreboard.counters();
        assert!(c.left_out() <= c.packets_out + c.retrans_out);
        assert!(conn.window.cwnd >= 1);
        assert!(conn.window.cwnd <= conn.window.cwnd_clamp);
    }

    #[test]
    fn ack_outside_window_discarded() {
        let now = Instant::now();
        let mut conn = new_conn(CongestionControlAlgorithm::Reno);
        send_segments(&mut conn, 3, now);

        // Beyond snd_nxt.
        assert_eq!(
            conn.on_ack(&plain_ack(9000, 1000), now).unwrap_err(),
            Error::Done
        );
        // Behind snd_una.
        conn.on_ack(&plain_ack(2000, 1000), now).unwrap();
        assert_eq!(
            conn.on_ack(&plain_ack(1000, 1000), now).unwrap_err(),
            Error::Done
        );
        assert_eq!(conn.snd_una(), TcpSeq(2000));
    }

    #[test]
    fn stale_timestamp_discarded() {
        let now = Instant::now();
        let mut conn = new_conn(CongestionControlAlgorithm::Reno);
        send_segments(&mut conn, 4, now);

        let mut pkt = plain_ack(1000, 1000);
        pkt.ts_value = Some(500);
        conn.on_ack(&pkt, now).unwrap();

        let mut old = plain_ack(2000, 1000);
        old.ts_value = Some(100);
        assert_eq!(conn.on_ack(&old, now).unwrap_err(), Error::Done);
        assert_eq!(conn.snd_una(), TcpSeq(1000));
    }

    #[test]
    fn cumulative_ack_advances_and_restarts_timer() {
        let t0 = Instant::now();
        let mut conn = new_conn(CongestionControlAlgorithm::Reno);
        send_segments(&mut conn, 5, t0);
        assert!(conn.rto_deadline.is_some());

        let t1 = t0 + Duration::from_millis(100);
        let out = conn.on_ack(&plain_ack(3000, 1000), t1).unwrap();
        assert_eq!(out.newly_acked_bytes, 3 * MSS);
        assert_eq!(conn.snd_una(), TcpSeq(3000));
        assert!(conn.rtt.has_sample());
        assert!(out.rto_deadline.unwrap() > t1);

        // Acking everything cancels the timer.
        let out = conn.on_ack(&plain_ack(5000, 1000), t1).unwrap();
        assert!(out.rto_deadline.is_none());
        assert_counter_invariants(&conn);
    }

    #[test]
    fn window_advertisements_scaled_uniformly() {
        let now = Instant::now();
        let mut conf = Config::new().unwrap();
        conf.set_snd_wscale(7).unwrap();
        let mut conn = Connection::new(&conf).unwrap();
        send_segments(&mut conn, 2, now);

        conn.on_ack(&plain_ack(1000, 100), now).unwrap();
        assert_eq!(conn.snd_wnd, 100 << 7);

        // An older ack cannot shrink the window.
        let out = conn.on_ack(&plain_ack(1000, 50), now);
        assert!(out.is_ok());
        assert_eq!(conn.snd_wnd, 100 << 7);
    }

    #[test]
    fn memory_pressure_moderates_cwnd() {
        let now = Instant::now();
        let mut conn = new_conn(CongestionControlAlgorithm::Reno);
        send_segments(&mut conn, 8, now);
        conn.on_ack(&plain_ack(5000, 64000), now).unwrap();
        assert_eq!(conn.window.cwnd, 10);

        // Three segments in flight plus the burst allowance of three.
        conn.on_memory_pressure();
        assert_eq!(conn.window.cwnd, 6);
        assert_eq!(conn.ca_state(), CaState::Open);
        assert_eq!(conn.window.ssthresh, 20);

        // Advisory only: once the pipe fills again, growth resumes.
        send_segments(&mut conn, 3, now);
        let out = conn.on_ack(&plain_ack(8000, 64000), now).unwrap();
        assert_eq!(out.cwnd, 7);
        assert_counter_invariants(&conn);
    }

    #[test]
    fn dup_sacks_at_reordering_boundary_stay_open() {
        let now = Instant::now();
        let mut conn = new_conn(CongestionControlAlgorithm::Reno);
        send_segments(&mut conn, 10, now);
        conn.on_ack(&plain_ack(1000, 64000), now).unwrap();

        // Three duplicate acks, each sacking one more segment past the
        // hole at snd_una. fackets_out stops at reordering; tie does not
        // trigger recovery.
        for i in 0..3u32 {
            let start = 2000 + i * MSS;
            let pkt = sack_ack(1000, 64000, &[(start, start + MSS)]);
            conn.on_ack(&pkt, now).unwrap();
        }
        let c = conn.scoreboard.counters();
        assert_eq!(c.sacked_out, 3);
        assert_eq!(c.fackets_out, 3);
        assert!(conn.ca_state() < CaState::Recovery);
        assert_eq!(conn.window.ssthresh, 20);
        assert_counter_invariants(&conn);
    }

    #[test]
    fn dup_sacks_past_reordering_enter_recovery() {
        let now = Instant::now();
        let mut conf = Config::new().unwrap();
        conf.set_initial_cwnd(10);
        conf.set_initial_ssthresh(20);
        conf.set_reordering(2).unwrap();
        let mut conn = Connection::new(&conf).unwrap();
        send_segments(&mut conn, 10, now);
        conn.on_ack(&plain_ack(1000, 64000), now).unwrap();

        let mut due = Vec::new();
        for i in 0..3u32 {
            let start = 2000 + i * MSS;
            let pkt = sack_ack(1000, 64000, &[(start, start + MSS)]);
            due = conn.on_ack(&pkt, now).unwrap().retransmits;
        }
        assert_eq!(conn.ca_state(), CaState::Recovery);
        // ssthresh halved from the window of 10.
        assert_eq!(conn.window.ssthresh, 5);
        assert_eq!(conn.recovery.high_seq, conn.snd_nxt());
        // The hole at snd_una is due for fast retransmit.
        assert_eq!(due.first(), Some(&(TcpSeq(1000), TcpSeq(2000))));
        assert_counter_invariants(&conn);
    }

    #[test]
    fn rto_loss_and_full_undo_round_trip() {
        let t0 = Instant::now();
        let mut conn = new_conn(CongestionControlAlgorithm::Reno);
        send_segments(&mut conn, 5, t0);
        // Without an RTT estimate there is no F-RTO probe; the timeout
        // commits to Loss immediately, preserving SACK state.
        let out = conn.on_rto(t0);
        assert_eq!(conn.ca_state(), CaState::Loss);
        assert_eq!(conn.window.cwnd, 1);
        assert_eq!(out.retransmits, vec![(TcpSeq(0), TcpSeq(1000))]);
        let c = conn.scoreboard.counters();
        assert_eq!(c.lost_out, 5);

        let prior_ssthresh = 20;
        // All five acked; nothing was actually retransmitted, so the cut
        // is undone in full and the machine returns to Open.
        let t1 = t0 + Duration::from_millis(50);
        let out = conn.on_ack(&plain_ack(5000, 64000), t1).unwrap();
        assert_eq!(conn.ca_state(), CaState::Open);
        assert_eq!(conn.window.ssthresh, prior_ssthresh);
        assert!(out.retransmits.is_empty());
        assert_eq!(conn.scoreboard.counters().lost_out, 0);
        assert_counter_invariants(&conn);
    }

    #[test]
    fn rto_with_estimate_opens_frto_probe() {
        let t0 = Instant::now();
        let mut conn = new_conn(CongestionControlAlgorithm::Reno);
        send_segments(&mut conn, 6, t0);
        let t1 = t0 + Duration::from_millis(80);
        conn.on_ack(&plain_ack(1000, 64000), t1).unwrap();
        assert!(conn.rtt.has_sample());

        send_segments(&mut conn, 1, t1);
        let t2 = t1 + Duration::from_secs(1);
        conn.on_rto(t2);
        assert!(conn.recovery.in_frto());
        // Scoreboard untouched by the probe.
        assert_eq!(conn.scoreboard.counters().lost_out, 0);

        // Two acks for original transmissions: the timeout was spurious.
        conn.on_ack(&plain_ack(2000, 64000), t2).unwrap();
        conn.on_ack(&plain_ack(3000, 64000), t2).unwrap();
        assert!(!conn.recovery.in_frto());
        assert_eq!(conn.ca_state(), CaState::Open);
        assert_eq!(conn.window.ssthresh, 20);
        assert_counter_invariants(&conn);
    }

    #[test]
    fn dsack_undo_retrans_idempotent() {
        let now = Instant::now();
        let mut conn = new_conn(CongestionControlAlgorithm::Reno);
        send_segments(&mut conn, 6, now);
        conn.on_retransmit(TcpSeq(1000), TcpSeq(2000), None, now);
        conn.recovery.undo_retrans = 1;

        // D-SACK: first block below the cumulative ack reports the
        // retransmitted range as received twice.
        let pkt = sack_ack(2000, 64000, &[(1000, 2000)]);
        conn.on_ack(&pkt, now).unwrap();
        assert_eq!(conn.recovery.undo_retrans, 0);

        // The same report again only bumps the dup-ack statistics.
        let pkt = sack_ack(2000, 64000, &[(1000, 2000)]);
        conn.on_ack(&pkt, now).unwrap();
        assert_eq!(conn.recovery.undo_retrans, 0);
        assert_counter_invariants(&conn);
    }

    #[test]
    fn zero_rtt_sample_coerced() {
        let now = Instant::now();
        let mut conn = new_conn(CongestionControlAlgorithm::Reno);
        send_segments(&mut conn, 1, now);
        // Ack in the same instant: raw sample 0 becomes 1us.
        conn.on_ack(&plain_ack(1000, 64000), now).unwrap();
        assert!(conn.rtt.has_sample());
        assert_eq!(conn.rtt.latest_rtt_us(), 1);
    }

    #[test]
    fn vegas_with_few_samples_grows_like_reno() {
        let t0 = Instant::now();
        let mut conf = Config::new().unwrap();
        conf.set_initial_cwnd(4);
        conf.set_initial_ssthresh(2);
        conf.congestion.congestion_control_algorithm = CongestionControlAlgorithm::Vegas;
        let mut conn = Connection::new(&conf).unwrap();

        // Keep the pipe full so acks are window-limited, then deliver two
        // RTT samples; Vegas stays on the Reno path until it has three.
        let cwnd_before = conn.window.cwnd;
        let mut now = t0;
        for i in 0..2u32 {
            send_segments(&mut conn, 4, now);
            now += Duration::from_millis(100);
            let una = conn.snd_nxt().0;
            conn.on_ack(&plain_ack(una, 64000), now).unwrap();
            assert!(conn.rtt.has_sample(), "round {}", i);
        }
        // Congestion avoidance above ssthresh: growth is fractional, so
        // the window never jumps by more than one per ack.
        assert!(conn.window.cwnd >= cwnd_before);
        assert!(conn.window.cwnd <= cwnd_before + 2);
        assert_counter_invariants(&conn);
    }

    #[test]
    fn bic_connection_recovers_from_loss() {
        let t0 = Instant::now();
        let mut conn = new_conn(CongestionControlAlgorithm::Bic);
        send_segments(&mut conn, 10, t0);
        let t1 = t0 + Duration::from_millis(100);
        conn.on_ack(&plain_ack(1000, 64000), t1).unwrap();

        // SACKs far past the hole force recovery under BIC.
        for i in 0..4u32 {
            let start = 5000 + i * MSS;
            conn.on_ack(&sack_ack(1000, 64000, &[(start, start + MSS)]), t1)
                .unwrap();
        }
        assert_eq!(conn.ca_state(), CaState::Recovery);
        assert!(conn.window.ssthresh < 20);
        assert_counter_invariants(&conn);
    }

    #[test]
    fn ecn_echo_enters_cwr() {
        let now = Instant::now();
        let mut conn = new_conn(CongestionControlAlgorithm::Reno);
        send_segments(&mut conn, 8, now);

        let mut pkt = plain_ack(1000, 64000);
        pkt.ecn_echo = true;
        conn.on_ack(&pkt, now).unwrap();
        assert_eq!(conn.ca_state(), CaState::Cwr);
        assert_eq!(conn.window.ssthresh, 5);
        assert_counter_invariants(&conn);
    }

    #[test]
    fn snapshot_reflects_state() {
        let now = Instant::now();
        let mut conn = new_conn(CongestionControlAlgorithm::Reno);
        send_segments(&mut conn, 5, now);
        conn.on_ack(&plain_ack(2000, 64000), now + Duration::from_millis(30))
            .unwrap();

        let snap = conn.snapshot();
        assert_eq!(snap.ca_state, CaState::Open);
        assert_eq!(snap.cwnd, conn.window.cwnd);
        assert!(snap.srtt_us > 0);
        assert!(snap.rto_us > 0);
        assert_eq!(snap.reordering, 3);

        // Snapshots serialize for diagnostics export.
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"cwnd\""));
    }

    #[test]
    fn can_send_respects_cwnd_and_peer_window() {
        let now = Instant::now();
        let mut conf = Config::new().unwrap();
        conf.set_initial_cwnd(2);
        let mut conn = Connection::new(&conf).unwrap();

        // A tiny advertisement blocks new data once a segment is out.
        conn.on_ack(&plain_ack(0, 64), now).unwrap();
        assert!(conn.can_send());
        send_segments(&mut conn, 1, now);
        assert!(!conn.can_send());

        // A roomy window leaves the congestion window as the limit.
        conn.on_ack(&plain_ack(1000, 64000), now).unwrap();
        assert!(conn.can_send());
        send_segments(&mut conn, 2, now);
        assert!(!conn.can_send());
    }

    #[test]
    fn stats_accumulate() {
        let now = Instant::now();
        let mut conn = new_conn(CongestionControlAlgorithm::Reno);
        send_segments(&mut conn, 4, now);
        conn.on_ack(&plain_ack(2000, 64000), now).unwrap();
        conn.on_ack(&sack_ack(2000, 64000, &[(3000, 4000)]), now)
            .unwrap();

        let stats = conn.stats();
        assert_eq!(stats.sent_count, 4);
        assert_eq!(stats.acked_count, 2);
        assert_eq!(stats.dup_ack_count, 1);
    }

    #[test]
    fn smallvec_blocks_inline() {
        let blocks: SmallVec<[SackBlock; 4]> = smallvec![
            SackBlock::new(0, 1000),
            SackBlock::new(2000, 3000),
            SackBlock::new(4000, 5000),
            SackBlock::new(6000, 7000),
        ];
        assert!(!blocks.spilled());
    }
}

mod recovery;
pub(crate) mod rtt;
pub(crate) mod sack;
pub(crate) mod scoreboard;
