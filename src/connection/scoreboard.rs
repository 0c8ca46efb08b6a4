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

use std::collections::VecDeque;
use std::time::Instant;

use enumflags2::bitflags;
use enumflags2::BitFlags;
use log::*;
use slab::Slab;

use crate::seq::TcpSeq;

/// Per-segment state over the in-flight retransmission queue.
///
/// The valid tag combinations are 0, S, L, R, L|R and S|R. `Lost|Sacked` is
/// never constructed: a SACK arriving for a lost-tagged segment clears the
/// lost tag first.
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentTag {
    /// The segment has been retransmitted at least once.
    Retrans = 0b0001,

    /// The segment was reported received via a SACK block.
    Sacked = 0b0010,

    /// The segment is presumed lost.
    Lost = 0b0100,

    /// The segment carries urgent data.
    Urg = 0b1000,
}

/// Metadata of an outstanding segment.
#[derive(Debug, Clone)]
pub struct Segment {
    /// First sequence number covered by the segment.
    pub seq: TcpSeq,

    /// One past the last sequence number covered by the segment.
    pub end_seq: TcpSeq,

    /// Scoreboard tags.
    pub tags: BitFlags<SegmentTag>,

    /// The time the segment was (first) transmitted.
    pub time_sent: Instant,

    /// The time of the most recent retransmission, if any.
    pub time_retrans: Option<Instant>,
}

impl Segment {
    /// Segment length in bytes.
    pub fn len(&self) -> u32 {
        self.end_seq - self.seq
    }

    pub fn is_sacked(&self) -> bool {
        self.tags.contains(SegmentTag::Sacked)
    }

    pub fn is_lost(&self) -> bool {
        self.tags.contains(SegmentTag::Lost)
    }

    pub fn is_retrans(&self) -> bool {
        self.tags.contains(SegmentTag::Retrans)
    }
}

/// Aggregate scoreboard counters, all in whole segments.
///
/// Invariants: `left_out = sacked_out + lost_out`;
/// `in_flight = packets_out - left_out + retrans_out`; every counter >= 0.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counters {
    /// Segments transmitted and not yet fully acknowledged.
    pub packets_out: u32,

    /// Segments reported received by SACK (or emulated duplicate acks).
    pub sacked_out: u32,

    /// Segments presumed lost.
    pub lost_out: u32,

    /// Segments retransmitted and not yet confirmed.
    pub retrans_out: u32,

    /// Highest queue position reached by a SACK walk (forward ack count).
    pub fackets_out: u32,
}

impl Counters {
    /// Segments that have left the network per the scoreboard.
    pub fn left_out(&self) -> u32 {
        self.sacked_out + self.lost_out
    }

    /// Segments estimated to still be in the network.
    pub fn in_flight(&self) -> u32 {
        self.packets_out
            .saturating_sub(self.left_out())
            .saturating_add(self.retrans_out)
    }
}

// A counter going negative is a defect in caller logic, observed under
// memory pressure in practice. Clamp and log, never panic: the congestion
// engine must not take down a healthy connection over bookkeeping noise.
fn counter_dec(v: &mut u32, by: u32, what: &str) {
    match v.checked_sub(by) {
        Some(n) => *v = n,
        None => {
            warn!("scoreboard counter {} would go negative, clamped", what);
            *v = 0;
        }
    }
}

/// The scoreboard: per-segment tags over the in-flight queue plus the
/// aggregate counters derived from them.
///
/// Entries live in an arena and are referenced by index; the queue order is
/// tracked separately so walks never unlink during iteration. Entries are
/// removed strictly from the front as `snd_una` advances.
pub struct Scoreboard {
    /// Arena of queue entries.
    segments: Slab<Segment>,

    /// Arena keys in ascending sequence order.
    order: VecDeque<usize>,

    /// Aggregate counters.
    counters: Counters,
}

impl Scoreboard {
    pub fn new() -> Self {
        Scoreboard {
            segments: Slab::new(),
            order: VecDeque::new(),
            counters: Counters::default(),
        }
    }

    /// Number of segments on the queue.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Return the aggregate counters.
    pub fn counters(&self) -> Counters {
        self.counters
    }

    /// The oldest outstanding segment, if any.
    pub fn head(&self) -> Option<&Segment> {
        self.order.front().map(|k| &self.segments[*k])
    }

    /// The segment at the given queue position.
    pub fn get(&self, pos: usize) -> Option<&Segment> {
        self.order.get(pos).map(|k| &self.segments[*k])
    }

    /// Iterate segments in sequence order.
    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.order.iter().map(|k| &self.segments[*k])
    }

    /// Record a newly transmitted segment at the tail of the queue.
    pub fn enqueue(&mut self, seq: TcpSeq, end_seq: TcpSeq, now: Instant) {
        if let Some(last) = self.order.back().map(|k| &self.segments[*k]) {
            if seq.before(last.end_seq) {
                warn!(
                    "scoreboard enqueue out of order: seq={} behind end_seq={}",
                    seq, last.end_seq
                );
            }
        }
        let key = self.segments.insert(Segment {
            seq,
            end_seq,
            tags: BitFlags::default(),
            time_sent: now,
            time_retrans: None,
        });
        self.order.push_back(key);
        self.counters.packets_out += 1;
    }

    /// Remove entries whose range lies entirely below `snd_una` from the
    /// front of the queue, decrementing the counters by the tags that were
    /// set on each removed entry. Returns the removed entries in order.
    pub fn ack_to(&mut self, snd_una: TcpSeq) -> Vec<Segment> {
        let mut acked = Vec::new();
        while let Some(&key) = self.order.front() {
            if self.segments[key].end_seq.after(snd_una) {
                break;
            }
            self.order.pop_front();
            let seg = self.segments.remove(key);
            counter_dec(&mut self.counters.packets_out, 1, "packets_out");
            if seg.is_sacked() {
                counter_dec(&mut self.counters.sacked_out, 1, "sacked_out");
            }
            if seg.is_lost() {
                counter_dec(&mut self.counters.lost_out, 1, "lost_out");
            }
            if seg.is_retrans() {
                counter_dec(&mut self.counters.retrans_out, 1, "retrans_out");
            }
            self.counters.fackets_out = self.counters.fackets_out.saturating_sub(1);
            acked.push(seg);
        }
        acked
    }

    /// Tag the segment at `pos` as sacked. Clears a lost tag if present
    /// (`Lost|Sacked` is invalid). Returns false if it was already sacked.
    pub(crate) fn tag_sacked(&mut self, pos: usize) -> bool {
        let key = match self.order.get(pos) {
            Some(k) => *k,
            None => return false,
        };
        let seg = &mut self.segments[key];
        if seg.is_sacked() {
            return false;
        }
        if seg.is_lost() {
            seg.tags.remove(SegmentTag::Lost);
            counter_dec(&mut self.counters.lost_out, 1, "lost_out");
        }
        seg.tags.insert(SegmentTag::Sacked);
        self.counters.sacked_out += 1;
        true
    }

    /// Tag the segment at `pos` as lost. Sacked segments are left alone.
    /// Returns true if the tag was newly set.
    pub(crate) fn tag_lost(&mut self, pos: usize) -> bool {
        let key = match self.order.get(pos) {
            Some(k) => *k,
            None => return false,
        };
        let seg = &mut self.segments[key];
        if seg.is_sacked() || seg.is_lost() {
            return false;
        }
        seg.tags.insert(SegmentTag::Lost);
        self.counters.lost_out += 1;
        true
    }

    /// Drop the retransmitted tag from the segment at `pos`, if set.
    pub(crate) fn clear_retrans(&mut self, pos: usize) -> bool {
        let key = match self.order.get(pos) {
            Some(k) => *k,
            None => return false,
        };
        let seg = &mut self.segments[key];
        if !seg.is_retrans() {
            return false;
        }
        seg.tags.remove(SegmentTag::Retrans);
        counter_dec(&mut self.counters.retrans_out, 1, "retrans_out");
        true
    }

    /// Raise `fackets_out` to the given queue position count.
    pub(crate) fn update_fackets(&mut self, fack_count: u32) {
        if fack_count > self.counters.fackets_out {
            self.counters.fackets_out = fack_count;
        }
    }

    fn for_range<F: FnMut(&mut Segment, &mut Counters)>(
        &mut self,
        start: TcpSeq,
        end: TcpSeq,
        mut f: F,
    ) {
        for &key in self.order.iter() {
            let seg = &mut self.segments[key];
            if !seg.end_seq.after(start) {
                continue;
            }
            if !seg.seq.before(end) {
                break;
            }
            // Only segments fully inside the range are retagged; the queue
            // never splits entries.
            if !seg.seq.before(start) && !seg.end_seq.after(end) {
                f(seg, &mut self.counters);
            }
        }
    }

    /// Tag every segment fully inside `[start, end)` as sacked.
    pub fn mark_sacked(&mut self, start: TcpSeq, end: TcpSeq) {
        self.for_range(start, end, |seg, counters| {
            if seg.is_sacked() {
                return;
            }
            if seg.is_lost() {
                seg.tags.remove(SegmentTag::Lost);
                counter_dec(&mut counters.lost_out, 1, "lost_out");
            }
            seg.tags.insert(SegmentTag::Sacked);
            counters.sacked_out += 1;
        });
    }

    /// Tag every unsacked segment fully inside `[start, end)` as lost.
    pub fn mark_lost(&mut self, start: TcpSeq, end: TcpSeq) {
        self.for_range(start, end, |seg, counters| {
            if seg.is_sacked() || seg.is_lost() {
                return;
            }
            seg.tags.insert(SegmentTag::Lost);
            counters.lost_out += 1;
        });
    }

    /// Tag every segment fully inside `[start, end)` as retransmitted and
    /// stamp the retransmission time.
    pub fn mark_retransmitted(&mut self, start: TcpSeq, end: TcpSeq, now: Instant) {
        self.for_range(start, end, |seg, counters| {
            if !seg.is_retrans() {
                seg.tags.insert(SegmentTag::Retrans);
                counters.retrans_out += 1;
            }
            seg.time_retrans = Some(now);
        });
    }

    /// Clear every tag on segments fully inside `[start, end)`.
    pub fn clear_tags(&mut self, start: TcpSeq, end: TcpSeq) {
        self.for_range(start, end, |seg, counters| {
            if seg.is_sacked() {
                counter_dec(&mut counters.sacked_out, 1, "sacked_out");
            }
            if seg.is_lost() {
                counter_dec(&mut counters.lost_out, 1, "lost_out");
            }
            if seg.is_retrans() {
                counter_dec(&mut counters.retrans_out, 1, "retrans_out");
            }
            seg.tags = BitFlags::default();
        });
    }

    /// Tag the first `count` unsacked segments at the head of the queue as
    /// lost. Returns how many were newly tagged.
    pub fn mark_head_lost(&mut self, count: u32) -> u32 {
        let mut newly = 0;
        for pos in 0..self.len() {
            if newly >= count {
                break;
            }
            if self.tag_lost(pos) {
                newly += 1;
            }
        }
        newly
    }

    /// RTO reaction over the whole queue: clear all retransmitted tags and
    /// tag unacknowledged segments lost. With `preserve_sack`, segments the
    /// peer already reported via SACK keep their tag and are not marked
    /// lost; otherwise SACK information is discarded too.
    pub fn mark_all_lost(&mut self, preserve_sack: bool) {
        for &key in self.order.iter() {
            let seg = &mut self.segments[key];
            seg.tags.remove(SegmentTag::Retrans);
            seg.time_retrans = None;
            if seg.is_sacked() && !preserve_sack {
                seg.tags.remove(SegmentTag::Sacked);
            }
            if !seg.is_sacked() {
                seg.tags.insert(SegmentTag::Lost);
            }
        }
        if !preserve_sack {
            self.counters.fackets_out = 0;
        }
        self.recount();
    }

    /// Drop every lost tag; an undo proved the loss marking spurious.
    pub fn clear_lost(&mut self) {
        for &key in self.order.iter() {
            self.segments[key].tags.remove(SegmentTag::Lost);
        }
        self.counters.lost_out = 0;
    }

    /// Non-SACK flows emulate SACK accounting: each duplicate ack stands
    /// for one segment that reached the receiver out of order. Emulated
    /// sacks raise `sacked_out` without tagging any segment.
    pub fn add_emulated_sack(&mut self) {
        if self.counters.left_out() < self.counters.packets_out {
            self.counters.sacked_out += 1;
        }
    }

    /// Shrink the emulated sack count as a cumulative ack drains `acked`
    /// segments; the in-order head consumes one of the duplicates.
    pub fn remove_emulated_sacks(&mut self, acked: u32) {
        if acked == 0 {
            return;
        }
        self.counters.sacked_out = self.counters.sacked_out.saturating_sub(acked - 1);
        if self.counters.sacked_out > self.counters.packets_out {
            self.counters.sacked_out = self.counters.packets_out;
        }
    }

    /// Discard all emulated sacks.
    pub fn reset_emulated_sacks(&mut self) {
        self.counters.sacked_out = 0;
    }

    /// Demote all SACK tags (the peer reneged) back to untagged.
    pub fn demote_sacked(&mut self) {
        for &key in self.order.iter() {
            let seg = &mut self.segments[key];
            seg.tags.remove(SegmentTag::Sacked);
        }
        self.counters.sacked_out = 0;
        self.counters.fackets_out = 0;
    }

    /// Recompute the aggregate counters from the per-segment tags.
    pub fn recount(&mut self) {
        let mut c = Counters {
            packets_out: self.order.len() as u32,
            fackets_out: self.counters.fackets_out,
            ..Default::default()
        };
        for &key in self.order.iter() {
            let seg = &self.segments[key];
            if seg.is_sacked() {
                c.sacked_out += 1;
            }
            if seg.is_lost() {
                c.lost_out += 1;
            }
            if seg.is_retrans() {
                c.retrans_out += 1;
            }
        }
        self.counters = c;
    }
}

impl Default for Scoreboard {
    fn default() -> Self {
        Self::new()
    }
}
