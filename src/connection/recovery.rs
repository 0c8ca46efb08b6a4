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

use enumflags2::BitFlags;
use log::*;
use serde::Serialize;

use super::rtt::RttEstimator;
use super::scoreboard::Counters;
use super::scoreboard::Scoreboard;
use super::AckFlag;
use crate::congestion_control::CongestionController;
use crate::congestion_control::WindowState;
use crate::seq::TcpSeq;

/// Congestion state of a connection.
///
/// The machine cycles back to `Open` whenever `high_seq` is fully
/// acknowledged and no loss indicators remain outstanding; no state is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize)]
pub enum CaState {
    /// Nothing unusual on the wire.
    #[default]
    Open,

    /// Duplicate acks or SACKs seen; possibly plain reordering, so no
    /// window cut has been decided yet.
    Disorder,

    /// The window is being reduced in response to an explicit congestion
    /// signal (ECN echo) rather than inferred loss.
    Cwr,

    /// Fast retransmit in progress.
    Recovery,

    /// A retransmission timeout fired, or the peer reneged on its SACKs.
    Loss,
}

impl std::fmt::Display for CaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One incoming ack, as seen by the state machine after the scoreboard has
/// been brought up to date.
pub(crate) struct AckEvent {
    /// Flags accumulated while applying the ack.
    pub flags: BitFlags<AckFlag>,

    /// `snd_una` before the ack was applied.
    pub prior_snd_una: TcpSeq,

    /// `snd_una` after the ack was applied.
    pub snd_una: TcpSeq,

    /// Highest sequence sent so far.
    pub snd_nxt: TcpSeq,

    /// Whole segments drained from the queue by the cumulative ack.
    pub newly_acked: u32,

    /// Echoed timestamp carried by the ack, if any.
    pub ts_echo: Option<u32>,

    /// Arrival time of the ack.
    pub now: Instant,
}

/// The loss recovery state machine.
///
/// Decides when the connection moves between Open, Disorder, CWR, Recovery
/// and Loss, which window reductions can be undone, and which segments are
/// due for retransmission. Window growth policy lives behind
/// `CongestionController`; this machine only gates it.
pub(crate) struct LossRecovery {
    /// Current congestion state.
    ca_state: CaState,

    /// `snd_nxt` at the moment the current episode began. Acking past it
    /// terminates the episode.
    pub(crate) high_seq: TcpSeq,

    /// `snd_una` snapshotted when the window was cut; present while the cut
    /// is still undoable.
    pub(crate) undo_marker: Option<TcpSeq>,

    /// Retransmissions not yet proven necessary. Reaching zero while
    /// `undo_marker` is set means every cut this episode was spurious.
    pub(crate) undo_retrans: u32,

    /// The threshold as it stood before the cut, restored on a real undo.
    prior_ssthresh: u32,

    /// Estimated maximum segment reordering distance of the path.
    pub(crate) reordering: u32,

    /// Reordering value to fall back to when entering Loss.
    initial_reordering: u32,

    /// Burst allowance used when moderating the window.
    max_burst: u32,

    /// Whether the peer negotiated SACK. Without it, duplicate acks are
    /// converted to emulated sacks on the scoreboard.
    sack_enabled: bool,

    /// Our timestamp value at the first retransmission of the episode.
    /// An ack echoing an earlier timestamp proves the original got through.
    retrans_stamp: Option<u32>,

    /// Consecutive retransmission timeouts.
    pub(crate) retransmits: u32,

    /// F-RTO progress: 0 inactive, then 1 and 2 over the two-ack window
    /// following a candidate-spurious timeout.
    frto_counter: u8,

    /// `snd_nxt` when the candidate-spurious timeout fired.
    frto_highmark: TcpSeq,

    trace_id: String,
}

impl LossRecovery {
    pub fn new(reordering: u32, max_burst: u32, sack_enabled: bool) -> Self {
        LossRecovery {
            ca_state: CaState::Open,
            high_seq: TcpSeq(0),
            undo_marker: None,
            undo_retrans: 0,
            prior_ssthresh: 0,
            reordering,
            initial_reordering: reordering,
            max_burst,
            sack_enabled,
            retrans_stamp: None,
            retransmits: 0,
            frto_counter: 0,
            frto_highmark: TcpSeq(0),
            trace_id: String::from(""),
        }
    }

    pub fn set_trace_id(&mut self, trace_id: &str) {
        self.trace_id = trace_id.to_string();
    }

    pub fn ca_state(&self) -> CaState {
        self.ca_state
    }

    pub fn in_frto(&self) -> bool {
        self.frto_counter > 0
    }

    fn set_state(&mut self, state: CaState) {
        if state != self.ca_state {
            trace!(
                "{} congestion state {} -> {}",
                self.trace_id,
                self.ca_state,
                state
            );
            self.ca_state = state;
        }
    }

    /// What the threshold is worth right now for undo purposes. Outside a
    /// reduction the window itself may be the better estimate.
    fn current_ssthresh(&self, window: &WindowState) -> u32 {
        if self.ca_state > CaState::Disorder {
            window.ssthresh
        } else {
            cmp::max(window.ssthresh, (window.cwnd >> 1) + (window.cwnd >> 2))
        }
    }

    /// Forward ack count; without SACK, duplicate-ack emulation stands in.
    fn fackets(&self, c: &Counters) -> u32 {
        if self.sack_enabled {
            c.fackets_out
        } else {
            c.sacked_out + 1
        }
    }

    /// Record the first retransmission of an episode for timestamp-based
    /// undo decisions.
    pub fn note_retransmission(&mut self, ts_val: Option<u32>) {
        if self.retrans_stamp.is_none() {
            self.retrans_stamp = ts_val;
        }
    }

    /// The echoed timestamp predates the first retransmission: the ack was
    /// generated by the original transmission, not the retransmit.
    fn packet_delayed(&self, ts_echo: Option<u32>) -> bool {
        match (ts_echo, self.retrans_stamp) {
            (Some(echo), Some(stamp)) => (echo.wrapping_sub(stamp) as i32) < 0,
            _ => false,
        }
    }

    /// Whether the cuts of the current episode can still be rolled back.
    fn may_undo(&self, ts_echo: Option<u32>) -> bool {
        self.undo_marker.is_some() && (self.undo_retrans == 0 || self.packet_delayed(ts_echo))
    }

    /// Whether the head of the queue has been outstanding longer than the
    /// RTO without any ack evidence.
    fn head_timed_out(&self, sb: &Scoreboard, rtt: &RttEstimator, now: Instant) -> bool {
        match sb.head() {
            Some(head) => now.saturating_duration_since(head.time_sent) >= rtt.rto(),
            None => false,
        }
    }

    /// Decide whether the accumulated evidence justifies fast retransmit.
    fn time_to_recover(
        &self,
        sb: &Scoreboard,
        window: &WindowState,
        rtt: &RttEstimator,
        now: Instant,
    ) -> bool {
        let c = sb.counters();
        if c.lost_out > 0 {
            return true;
        }
        // Strictly greater: evidence exactly at the reordering estimate is
        // still explainable as reordering.
        if self.fackets(&c) > self.reordering {
            return true;
        }
        if self.head_timed_out(sb, rtt, now) {
            return true;
        }
        // Send-limited with half the outstanding data sacked: waiting for
        // more duplicate acks would stall, nothing new goes out to provoke
        // them.
        if c.packets_out <= self.reordering
            && c.sacked_out >= cmp::max(c.packets_out / 2, 1)
            && c.in_flight() >= window.cwnd
        {
            return true;
        }
        false
    }

    /// Begin fast retransmit: snapshot the undo state, cut the threshold
    /// (unless an explicit congestion signal already did) and fence the
    /// episode at `snd_nxt`.
    fn enter_recovery(
        &mut self,
        window: &mut WindowState,
        cc: &mut dyn CongestionController,
        c: &Counters,
        snd_una: TcpSeq,
        snd_nxt: TcpSeq,
        ecn: bool,
    ) {
        self.prior_ssthresh = 0;
        self.undo_marker = Some(snd_una);
        self.undo_retrans = c.retrans_out;
        if self.ca_state < CaState::Cwr {
            if !ecn {
                self.prior_ssthresh = self.current_ssthresh(window);
            }
            window.ssthresh = cc.ssthresh(window, c.in_flight());
        }
        self.high_seq = snd_nxt;
        window.cwnd_cnt = 0;
        debug!(
            "{} fast retransmit: ssthresh={} high_seq={}",
            self.trace_id, window.ssthresh, self.high_seq
        );
        self.set_state(CaState::Recovery);
    }

    /// React to an explicit congestion signal without any loss evidence.
    pub fn enter_cwr(
        &mut self,
        window: &mut WindowState,
        cc: &mut dyn CongestionController,
        in_flight: u32,
        snd_nxt: TcpSeq,
    ) {
        self.prior_ssthresh = 0;
        self.undo_marker = None;
        if self.ca_state < CaState::Cwr {
            window.ssthresh = cc.ssthresh(window, in_flight);
            window.cwnd = cmp::max(cmp::min(window.cwnd, in_flight + 1), 1);
            window.cwnd_cnt = 0;
            self.high_seq = snd_nxt;
            self.set_state(CaState::Cwr);
        }
    }

    /// Advisory from the embedding that socket buffers are tight. Moderates
    /// the window to what is in flight plus a burst allowance, without any
    /// state transition or threshold cut.
    pub fn on_memory_pressure(&self, c: &Counters, window: &mut WindowState) {
        window.moderate(c.in_flight(), self.max_burst);
    }

    fn complete_cwr(&mut self, window: &mut WindowState) {
        window.cwnd = cmp::min(window.cwnd, window.ssthresh);
        window.cwnd_cnt = 0;
    }

    /// Full RTO (or reneging) reaction. With `preserve_sack` the peer's
    /// SACK information survives and the cut stays undoable; without it the
    /// scoreboard is wiped back to square one.
    pub fn enter_loss(
        &mut self,
        sb: &mut Scoreboard,
        window: &mut WindowState,
        cc: &mut dyn CongestionController,
        snd_una: TcpSeq,
        snd_nxt: TcpSeq,
        preserve_sack: bool,
    ) {
        let c = sb.counters();
        if self.ca_state <= CaState::Disorder
            || snd_una == self.high_seq
            || (self.ca_state == CaState::Loss && self.retransmits == 0)
        {
            self.prior_ssthresh = self.current_ssthresh(window);
            window.ssthresh = cc.ssthresh(window, c.in_flight());
        }
        window.cwnd = 1;
        window.cwnd_cnt = 0;
        self.undo_retrans = 0;
        self.undo_marker = if preserve_sack { Some(snd_una) } else { None };
        sb.mark_all_lost(preserve_sack && self.sack_enabled);
        self.reordering = cmp::min(self.reordering, self.initial_reordering);
        self.high_seq = snd_nxt;
        self.set_state(CaState::Loss);
        cc.on_loss(window);
        warn!(
            "{} loss: cwnd=1 ssthresh={} lost_out={}",
            self.trace_id,
            window.ssthresh,
            sb.counters().lost_out
        );
    }

    /// The timeout may have been spurious: cut the threshold but leave the
    /// scoreboard alone and open a two-ack observation window.
    pub fn enter_frto(
        &mut self,
        window: &mut WindowState,
        cc: &mut dyn CongestionController,
        in_flight: u32,
        snd_una: TcpSeq,
        snd_nxt: TcpSeq,
    ) {
        self.frto_counter = 1;
        if self.ca_state <= CaState::Disorder
            || snd_una == self.high_seq
            || (self.ca_state == CaState::Loss && self.retransmits == 0)
        {
            self.prior_ssthresh = self.current_ssthresh(window);
            window.ssthresh = cc.ssthresh(window, in_flight);
        }
        self.undo_marker = Some(snd_una);
        self.undo_retrans = 0;
        self.frto_highmark = snd_nxt;
        self.high_seq = snd_nxt;
        self.set_state(CaState::Loss);
        debug!("{} rto candidate-spurious, probing", self.trace_id);
    }

    /// Advance the F-RTO probe with one incoming ack. Returns true when the
    /// ack was consumed by the probe.
    fn process_frto(
        &mut self,
        sb: &mut Scoreboard,
        window: &mut WindowState,
        cc: &mut dyn CongestionController,
        ev: &AckEvent,
    ) -> bool {
        if self.frto_counter == 0 {
            return false;
        }
        let in_flight = sb.counters().in_flight();

        if ev.snd_una == ev.prior_snd_una || !ev.snd_una.before(self.frto_highmark) {
            // No new data acked below the mark: the timeout was genuine.
            self.frto_counter = 0;
            self.enter_loss(sb, window, cc, ev.snd_una, ev.snd_nxt, true);
            // The retransmission was proven necessary; the cut stays.
            self.undo_marker = None;
            return false;
        }

        if self.frto_counter == 1 {
            // First new ack: open just enough window for two fresh segments
            // whose acks will settle the question.
            window.cwnd = cmp::min(in_flight + 2, window.cwnd_clamp);
            self.frto_counter = 2;
        } else {
            // Second new ack: the original transmissions are arriving, the
            // timeout was spurious. Restore the threshold and resume.
            debug!("{} spurious rto, undoing", self.trace_id);
            window.undo(self.prior_ssthresh, true);
            window.moderate(in_flight, self.max_burst);
            self.undo_marker = None;
            self.retransmits = 0;
            self.frto_counter = 0;
            self.set_state(CaState::Open);
        }
        true
    }

    /// Roll back the cut when exiting Recovery or Loss, if still possible.
    /// Returns true when the caller should hold the current state a little
    /// longer (non-SACK flows at exactly `high_seq`).
    fn try_undo_recovery(
        &mut self,
        window: &mut WindowState,
        c: &Counters,
        snd_una: TcpSeq,
        ts_echo: Option<u32>,
    ) -> bool {
        if self.may_undo(ts_echo) {
            debug!("{} undoing window reduction", self.trace_id);
            window.undo(self.prior_ssthresh, true);
            self.undo_marker = None;
        }
        if !self.sack_enabled && snd_una == self.high_seq {
            // Without SACK a retransmitted segment can be acked by a
            // duplicate of its original; leaving too early invites a false
            // fast retransmit.
            window.moderate(c.in_flight(), self.max_burst);
            return true;
        }
        self.retrans_stamp = None;
        self.set_state(CaState::Open);
        false
    }

    /// A D-SACK proved every retransmission of the episode spurious while
    /// still in Disorder: undo without ever entering Recovery.
    fn try_undo_dsack(&mut self, window: &mut WindowState) {
        if self.undo_marker.is_some() && self.undo_retrans == 0 {
            debug!("{} d-sack undo", self.trace_id);
            window.undo(self.prior_ssthresh, true);
            self.undo_marker = None;
        }
    }

    /// Partial ack during Recovery. Returns whether the head should still
    /// be marked lost and retransmitted.
    fn try_undo_partial(
        &mut self,
        sb: &mut Scoreboard,
        window: &mut WindowState,
        acked: u32,
        ts_echo: Option<u32>,
    ) -> bool {
        let c = sb.counters();
        let mut failed = !self.sack_enabled || c.fackets_out > self.reordering;
        if self.may_undo(ts_echo) {
            // The hole was plugged by a delayed original, not by our
            // retransmit; the rest are most probably delayed as well.
            if c.retrans_out == 0 {
                self.retrans_stamp = None;
            }
            let dist = self.fackets(&c) + acked;
            self.reordering = cmp::min(cmp::max(self.reordering, dist), crate::MAX_REORDERING);
            debug!("{} partial undo", self.trace_id);
            window.undo(self.prior_ssthresh, false);
            self.undo_marker = None;
            failed = false;
        }
        failed
    }

    /// Undo out of Loss when the first post-RTO acks prove the originals
    /// got through. Returns true when Loss was exited.
    fn try_undo_loss(
        &mut self,
        sb: &mut Scoreboard,
        window: &mut WindowState,
        ts_echo: Option<u32>,
    ) -> bool {
        if !self.may_undo(ts_echo) {
            return false;
        }
        debug!("{} loss undo", self.trace_id);
        sb.clear_lost();
        window.undo(self.prior_ssthresh, true);
        self.retransmits = 0;
        self.undo_marker = None;
        if self.sack_enabled {
            self.set_state(CaState::Open);
        }
        true
    }

    /// No reason to cut (yet): settle into Open or Disorder depending on
    /// whether any loss indicator is still outstanding.
    fn try_to_open(
        &mut self,
        sb: &Scoreboard,
        window: &mut WindowState,
        cc: &mut dyn CongestionController,
        ev: &AckEvent,
    ) {
        let c = sb.counters();
        if c.retrans_out == 0 {
            self.retrans_stamp = None;
        }
        if ev.flags.contains(AckFlag::EcnEcho) {
            self.enter_cwr(window, cc, c.in_flight(), ev.snd_nxt);
        }
        if self.ca_state != CaState::Cwr {
            let state = if c.left_out() > 0 || c.retrans_out > 0 || self.undo_marker.is_some() {
                CaState::Disorder
            } else {
                CaState::Open
            };
            if state != self.ca_state {
                self.set_state(state);
                self.high_seq = ev.snd_nxt;
            }
            window.moderate(c.in_flight(), self.max_burst);
        } else {
            window.cwnd_down(c.in_flight(), cmp::max(window.ssthresh / 2, 2));
        }
    }

    /// Tag segments lost based on the forward ack count and on queue age.
    fn update_scoreboard(&mut self, sb: &mut Scoreboard, rtt: &RttEstimator, now: Instant) {
        let c = sb.counters();
        let count = if self.sack_enabled {
            cmp::max(self.fackets(&c).saturating_sub(self.reordering), 1)
        } else {
            1
        };

        let mut newly = 0;
        for pos in 0..sb.len() {
            if newly >= count {
                break;
            }
            let seq = match sb.get(pos) {
                Some(seg) => seg.seq,
                None => break,
            };
            if !seq.before(self.high_seq) {
                break;
            }
            if sb.tag_lost(pos) {
                newly += 1;
            }
        }

        // Untagged segments older than the RTO are lost even without SACK
        // evidence; possible because the timer restarts on every new ack.
        let rto = rtt.rto();
        for pos in 0..sb.len() {
            let (time_sent, untagged) = match sb.get(pos) {
                Some(seg) => (seg.time_sent, seg.tags.is_empty()),
                None => break,
            };
            if untagged && now.saturating_duration_since(time_sent) >= rto {
                sb.tag_lost(pos);
            }
        }
    }

    /// Drive the state machine with one ack. Returns true when the caller
    /// should schedule retransmissions afterwards.
    pub fn on_ack(
        &mut self,
        sb: &mut Scoreboard,
        window: &mut WindowState,
        cc: &mut dyn CongestionController,
        rtt: &RttEstimator,
        ev: &AckEvent,
    ) -> bool {
        let is_dupack = !ev.flags.contains(AckFlag::DataAcked)
            && ev.flags.intersects(AckFlag::DupAck | AckFlag::DataSacked);
        let mut do_lost = is_dupack || ev.flags.contains(AckFlag::DataLost);

        // The peer reneged: it cumulatively acked short of data it had
        // already sacked. Its reassembly buffer is gone; start over.
        if sb.head().map_or(false, |h| h.is_sacked()) {
            warn!("{} sack reneging detected", self.trace_id);
            self.enter_loss(sb, window, cc, ev.snd_una, ev.snd_nxt, false);
            self.retransmits += 1;
            return true;
        }

        if self.process_frto(sb, window, cc, ev) {
            return false;
        }

        // Episode exit: high_seq fully acknowledged.
        if self.ca_state != CaState::Open && !ev.snd_una.before(self.high_seq) {
            match self.ca_state {
                CaState::Loss => {
                    self.retransmits = 0;
                    if self.try_undo_recovery(window, &sb.counters(), ev.snd_una, ev.ts_echo) {
                        return false;
                    }
                }
                CaState::Cwr => {
                    if ev.snd_una != self.high_seq {
                        self.complete_cwr(window);
                        self.set_state(CaState::Open);
                    }
                }
                CaState::Disorder => {
                    self.try_undo_dsack(window);
                    if self.undo_marker.is_none()
                        || !self.sack_enabled
                        || ev.snd_una != self.high_seq
                    {
                        self.undo_marker = None;
                        self.set_state(CaState::Open);
                    }
                }
                CaState::Recovery => {
                    if !self.sack_enabled {
                        sb.reset_emulated_sacks();
                    }
                    if self.try_undo_recovery(window, &sb.counters(), ev.snd_una, ev.ts_echo) {
                        return false;
                    }
                    self.complete_cwr(window);
                }
                CaState::Open => unreachable!(),
            }
        }

        match self.ca_state {
            CaState::Recovery => {
                if ev.snd_una == ev.prior_snd_una {
                    if !self.sack_enabled && is_dupack {
                        sb.add_emulated_sack();
                    }
                } else {
                    if !self.sack_enabled {
                        sb.remove_emulated_sacks(ev.newly_acked);
                    }
                    do_lost = self.try_undo_partial(sb, window, ev.newly_acked, ev.ts_echo);
                }
            }
            CaState::Loss => {
                if ev.flags.contains(AckFlag::DataAcked) {
                    self.retransmits = 0;
                }
                if !self.try_undo_loss(sb, window, ev.ts_echo) {
                    let c = sb.counters();
                    window.moderate(c.in_flight(), self.max_burst);
                    return true;
                }
                if self.ca_state != CaState::Open {
                    return true;
                }
                // Loss undone; reassess like a normal open-state ack.
                if !self.time_to_recover(sb, window, rtt, ev.now) {
                    self.try_to_open(sb, window, cc, ev);
                    return false;
                }
                let c = sb.counters();
                let ecn = ev.flags.contains(AckFlag::EcnEcho);
                self.enter_recovery(window, cc, &c, ev.snd_una, ev.snd_nxt, ecn);
            }
            _ => {
                if !self.sack_enabled {
                    if ev.snd_una != ev.prior_snd_una {
                        sb.reset_emulated_sacks();
                    }
                    if is_dupack {
                        sb.add_emulated_sack();
                    }
                }
                if self.ca_state == CaState::Disorder {
                    self.try_undo_dsack(window);
                }
                if !self.time_to_recover(sb, window, rtt, ev.now) {
                    self.try_to_open(sb, window, cc, ev);
                    return false;
                }
                let c = sb.counters();
                let ecn = ev.flags.contains(AckFlag::EcnEcho);
                self.enter_recovery(window, cc, &c, ev.snd_una, ev.snd_nxt, ecn);
                do_lost = true;
            }
        }

        if do_lost || self.head_timed_out(sb, rtt, ev.now) {
            self.update_scoreboard(sb, rtt, ev.now);
        }
        let c = sb.counters();
        window.cwnd_down(c.in_flight(), cmp::max(window.ssthresh / 2, 2));
        true
    }

    /// Segments due for retransmission right now, oldest first, bounded by
    /// the window space currently available.
    pub fn schedule_retransmits(
        &self,
        sb: &Scoreboard,
        window: &WindowState,
    ) -> Vec<(TcpSeq, TcpSeq)> {
        let mut due = Vec::new();
        if self.ca_state < CaState::Recovery {
            return due;
        }
        let c = sb.counters();
        let mut budget = window.cwnd.saturating_sub(c.in_flight());
        for seg in sb.iter() {
            if budget == 0 {
                break;
            }
            if seg.is_lost() && !seg.is_retrans() {
                due.push((seg.seq, seg.end_seq));
                budget -= 1;
            }
        }
        due
    }
}
