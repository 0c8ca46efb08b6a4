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

use super::scoreboard::Scoreboard;
use super::AckFlag;
use crate::seq::TcpSeq;

/// A decoded selective acknowledgment block, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SackBlock {
    pub start: TcpSeq,
    pub end: TcpSeq,
}

impl SackBlock {
    pub fn new(start: u32, end: u32) -> Self {
        SackBlock {
            start: TcpSeq(start),
            end: TcpSeq(end),
        }
    }
}

/// Interprets incoming SACK blocks against the scoreboard.
///
/// Stateless apart from the last duplicate-SACK range seen, which is cached
/// so re-reporting the same range cannot be credited twice.
pub(crate) struct SackProcessor {
    /// Blocks referencing data older than `snd_una - max_window` are
    /// discarded as ancient (possibly wrapped) rather than processed.
    max_window: u32,

    /// Cap on the reordering estimate, guarding against a misbehaving peer
    /// inflating it without bound.
    max_reordering: u32,

    /// The last D-SACK range credited against `undo_retrans`.
    last_dsack: Option<(TcpSeq, TcpSeq)>,
}

impl SackProcessor {
    pub fn new(max_window: u32, max_reordering: u32) -> Self {
        SackProcessor {
            max_window,
            max_reordering,
            last_dsack: None,
        }
    }

    /// Apply the blocks carried by one incoming ack.
    ///
    /// `ack_seq` is the cumulative ack of the same packet and
    /// `prior_snd_una` the cumulative ack before this packet was applied;
    /// `high_seq` marks where the current loss episode began.
    #[allow(clippy::too_many_arguments)]
    pub fn process(
        &mut self,
        sb: &mut Scoreboard,
        blocks: &[SackBlock],
        ack_seq: TcpSeq,
        prior_snd_una: TcpSeq,
        high_seq: TcpSeq,
        undo_retrans: &mut u32,
        reordering: &mut u32,
    ) -> BitFlags<AckFlag> {
        let mut flags = BitFlags::empty();
        if blocks.is_empty() {
            return flags;
        }

        // Only the first block can be a duplicate report: either it starts
        // below the cumulative ack, or it is fully contained in the second
        // block.
        let b0 = blocks[0];
        let dsack = b0.start.before(ack_seq)
            || (blocks.len() > 1
                && !b0.start.before(blocks[1].start)
                && !b0.end.after(blocks[1].end));
        if dsack {
            flags |= AckFlag::DsackSeen;
            self.credit_dsack(sb, b0, ack_seq, undo_retrans);
        }

        let prior_fackets = sb.counters().fackets_out;
        // Newest original-transmission time among segments newly sacked by
        // this ack; proves in-order delivery past older retransmissions.
        let mut newest_sacked_sent: Option<Instant> = None;

        for block in blocks.iter() {
            if !block.start.before(block.end) {
                continue;
            }
            if block.end.before(prior_snd_una - self.max_window) {
                warn!(
                    "discarding ancient sack block [{}, {})",
                    block.start, block.end
                );
                continue;
            }
            if block.end.after(high_seq) && prior_snd_una.before(high_seq) {
                // The receiver holds data sent after the episode began, so
                // everything in the gap has had time to arrive.
                flags |= AckFlag::DataLost;
            }

            for pos in 0..sb.len() {
                let (seg_seq, seg_end, retrans, time_sent) = {
                    let seg = sb.get(pos).unwrap();
                    (seg.seq, seg.end_seq, seg.is_retrans(), seg.time_sent)
                };
                if !seg_end.after(block.start) {
                    continue;
                }
                if !seg_seq.before(block.end) {
                    break;
                }
                // The queue never splits entries; only fully covered
                // segments change tags.
                if seg_seq.before(block.start) || seg_end.after(block.end) {
                    continue;
                }

                if sb.tag_sacked(pos) {
                    flags |= AckFlag::DataSacked;
                    let fack_count = pos as u32;
                    if fack_count < prior_fackets && !retrans {
                        // This SACK filled a hole below the forward-most
                        // point already reached: the network reordered.
                        let dist = prior_fackets - fack_count;
                        let prior = *reordering;
                        *reordering = cmp::min(cmp::max(prior, dist), self.max_reordering);
                        if *reordering != prior {
                            debug!(
                                "reordering detected: distance={} reordering={}",
                                dist, *reordering
                            );
                        }
                    }
                    newest_sacked_sent = Some(match newest_sacked_sent {
                        Some(t) => cmp::max(t, time_sent),
                        None => time_sent,
                    });
                }
                sb.update_fackets(pos as u32);
            }
        }

        if let Some(newest) = newest_sacked_sent {
            if self.detect_lost_retrans(sb, newest) {
                flags |= AckFlag::DataLost;
            }
        }

        flags
    }

    /// Credit a duplicate-SACK report against `undo_retrans`: the receiver
    /// got the data twice, so a retransmission was spurious. Only ranges
    /// not seen before are credited.
    fn credit_dsack(
        &mut self,
        sb: &mut Scoreboard,
        block: SackBlock,
        ack_seq: TcpSeq,
        undo_retrans: &mut u32,
    ) {
        if self.last_dsack == Some((block.start, block.end)) {
            return;
        }
        self.last_dsack = Some((block.start, block.end));
        trace!("dsack for [{}, {})", block.start, block.end);

        let mut credited = false;
        for pos in 0..sb.len() {
            let (seg_seq, seg_end, retrans) = {
                let seg = sb.get(pos).unwrap();
                (seg.seq, seg.end_seq, seg.is_retrans())
            };
            if !seg_end.after(block.start) {
                continue;
            }
            if !seg_seq.before(block.end) {
                break;
            }
            if retrans {
                sb.clear_retrans(pos);
                *undo_retrans = undo_retrans.saturating_sub(1);
                credited = true;
            }
        }

        // The duplicated range may already be cumulatively acked and gone
        // from the queue.
        if !credited && !block.end.after(ack_seq) {
            *undo_retrans = undo_retrans.saturating_sub(1);
        }
    }

    /// A retransmission is itself presumed lost when data transmitted after
    /// it has been sacked while the retransmitted segment still has not.
    fn detect_lost_retrans(&self, sb: &mut Scoreboard, newest_sacked_sent: Instant) -> bool {
        let mut found = false;
        for pos in 0..sb.len() {
            let retrans_time = {
                let seg = sb.get(pos).unwrap();
                if !seg.is_retrans() || seg.is_sacked() || seg.is_lost() {
                    continue;
                }
                seg.time_retrans
            };
            if let Some(t) = retrans_time {
                if t < newest_sacked_sent {
                    sb.clear_retrans(pos);
                    sb.tag_lost(pos);
                    debug!("lost retransmission detected at queue pos {}", pos);
                    found = true;
                }
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const MAX_WINDOW: u32 = 1 << 20;
    const MAX_REORDERING: u32 = 127;

    fn scoreboard_with(n: u32, now: Instant) -> Scoreboard {
        let mut sb = Scoreboard::new();
        for i in 0..n {
            sb.enqueue(TcpSeq(i * 1000), TcpSeq((i + 1) * 1000), now);
        }
        sb
    }

    fn processor() -> SackProcessor {
        SackProcessor::new(MAX_WINDOW, MAX_REORDERING)
    }

    #[test]
    fn basic_sacking() {
        let now = Instant::now();
        let mut sb = scoreboard_with(5, now);
        let mut p = processor();
        let (mut undo, mut reord) = (0, 3);

        let flags = p.process(
            &mut sb,
            &[SackBlock::new(2000, 4000)],
            TcpSeq(0),
            TcpSeq(0),
            TcpSeq(0),
            &mut undo,
            &mut reord,
        );
        assert!(flags.contains(AckFlag::DataSacked));
        let c = sb.counters();
        assert_eq!(c.sacked_out, 2);
        assert_eq!(c.fackets_out, 3);
        assert!(sb.get(2).unwrap().is_sacked());
        assert!(sb.get(3).unwrap().is_sacked());
        assert!(!sb.get(4).unwrap().is_sacked());
    }

    #[test]
    fn reapplying_same_block_is_idempotent() {
        let now = Instant::now();
        let mut sb = scoreboard_with(5, now);
        let mut p = processor();
        let (mut undo, mut reord) = (0, 3);
        let blocks = [SackBlock::new(2000, 3000)];

        p.process(
            &mut sb,
            &blocks,
            TcpSeq(0),
            TcpSeq(0),
            TcpSeq(0),
            &mut undo,
            &mut reord,
        );
        let before = sb.counters();

        let flags = p.process(
            &mut sb,
            &blocks,
            TcpSeq(0),
            TcpSeq(0),
            TcpSeq(0),
            &mut undo,
            &mut reord,
        );
        assert_eq!(sb.counters(), before);
        assert!(!flags.contains(AckFlag::DataSacked));
    }

    #[test]
    fn ancient_block_discarded() {
        let now = Instant::now();
        let mut sb = scoreboard_with(3, now);
        let mut p = processor();
        let (mut undo, mut reord) = (0, 3);

        // snd_una far ahead; the block is way behind the window.
        let una = TcpSeq(10_000_000);
        let flags = p.process(
            &mut sb,
            &[SackBlock::new(1000, 2000)],
            una,
            una,
            una,
            &mut undo,
            &mut reord,
        );
        // Block start below the ack makes it a D-SACK report, but the walk
        // discards it, so no tags move.
        assert_eq!(sb.counters().sacked_out, 0);
        assert!(!flags.contains(AckFlag::DataSacked));
    }

    #[test]
    fn dsack_decrements_undo_retrans_once() {
        let now = Instant::now();
        let mut sb = scoreboard_with(4, now);
        sb.mark_retransmitted(TcpSeq(0), TcpSeq(1000), now);
        let mut p = processor();
        let (mut undo, mut reord) = (2, 3);

        // First block below the cumulative ack: duplicate report of the
        // retransmitted head.
        let blocks = [SackBlock::new(0, 1000)];
        let flags = p.process(
            &mut sb,
            &blocks,
            TcpSeq(1000),
            TcpSeq(0),
            TcpSeq(4000),
            &mut undo,
            &mut reord,
        );
        assert!(flags.contains(AckFlag::DsackSeen));
        assert_eq!(undo, 1);
        assert_eq!(sb.counters().retrans_out, 0);

        // Same range again: no further credit.
        p.process(
            &mut sb,
            &blocks,
            TcpSeq(1000),
            TcpSeq(0),
            TcpSeq(4000),
            &mut undo,
            &mut reord,
        );
        assert_eq!(undo, 1);
    }

    #[test]
    fn dsack_never_negative() {
        let now = Instant::now();
        let mut sb = scoreboard_with(2, now);
        sb.mark_retransmitted(TcpSeq(0), TcpSeq(1000), now);
        let mut p = processor();
        let (mut undo, mut reord) = (0, 3);

        p.process(
            &mut sb,
            &[SackBlock::new(0, 1000)],
            TcpSeq(1000),
            TcpSeq(0),
            TcpSeq(2000),
            &mut undo,
            &mut reord,
        );
        assert_eq!(undo, 0);
    }

    #[test]
    fn dsack_by_containment_in_second_block() {
        let now = Instant::now();
        let mut sb = scoreboard_with(5, now);
        let mut p = processor();
        let (mut undo, mut reord) = (1, 3);

        let flags = p.process(
            &mut sb,
            &[SackBlock::new(2000, 3000), SackBlock::new(1000, 4000)],
            TcpSeq(0),
            TcpSeq(0),
            TcpSeq(5000),
            &mut undo,
            &mut reord,
        );
        assert!(flags.contains(AckFlag::DsackSeen));
        // The contained range was never retransmitted nor acked: no credit.
        assert_eq!(undo, 1);
        // Both blocks still sack-tag queued data.
        assert_eq!(sb.counters().sacked_out, 3);
    }

    #[test]
    fn sack_beyond_high_seq_flags_loss() {
        let now = Instant::now();
        let mut sb = scoreboard_with(6, now);
        let mut p = processor();
        let (mut undo, mut reord) = (0, 3);

        let flags = p.process(
            &mut sb,
            &[SackBlock::new(5000, 6000)],
            TcpSeq(0),
            TcpSeq(0),
            TcpSeq(4000),
            &mut undo,
            &mut reord,
        );
        assert!(flags.contains(AckFlag::DataLost));
    }

    #[test]
    fn reordering_updated_when_hole_fills() {
        let now = Instant::now();
        let mut sb = scoreboard_with(10, now);
        let mut p = processor();
        let (mut undo, mut reord) = (0, 3);

        // Forward-most point reaches position 7.
        p.process(
            &mut sb,
            &[SackBlock::new(7000, 8000)],
            TcpSeq(0),
            TcpSeq(0),
            TcpSeq(0),
            &mut undo,
            &mut reord,
        );
        assert_eq!(sb.counters().fackets_out, 7);
        assert_eq!(reord, 3);

        // A hole at position 1 fills afterwards: distance 7 - 1 = 6.
        p.process(
            &mut sb,
            &[SackBlock::new(1000, 2000)],
            TcpSeq(0),
            TcpSeq(0),
            TcpSeq(0),
            &mut undo,
            &mut reord,
        );
        assert_eq!(reord, 6);
    }

    #[test]
    fn reordering_capped() {
        let now = Instant::now();
        let mut sb = scoreboard_with(300, now);
        let mut p = SackProcessor::new(MAX_WINDOW, MAX_REORDERING);
        let (mut undo, mut reord) = (0, 3);

        p.process(
            &mut sb,
            &[SackBlock::new(299_000, 300_000)],
            TcpSeq(0),
            TcpSeq(0),
            TcpSeq(0),
            &mut undo,
            &mut reord,
        );
        p.process(
            &mut sb,
            &[SackBlock::new(0, 1000)],
            TcpSeq(0),
            TcpSeq(0),
            TcpSeq(0),
            &mut undo,
            &mut reord,
        );
        assert_eq!(reord, MAX_REORDERING);
    }

    #[test]
    fn lost_retransmission_detected() {
        let t0 = Instant::now();
        let mut sb = Scoreboard::new();
        // Segment 0 sent early, retransmitted at t0.
        sb.enqueue(TcpSeq(0), TcpSeq(1000), t0);
        // Segment 1 transmitted after the retransmission of segment 0.
        sb.enqueue(TcpSeq(1000), TcpSeq(2000), t0 + Duration::from_millis(50));
        sb.mark_retransmitted(TcpSeq(0), TcpSeq(1000), t0 + Duration::from_millis(10));

        let mut p = processor();
        let (mut undo, mut reord) = (1, 3);

        // SACK for segment 1, sent after the retransmission, arrives while
        // segment 0 is still unsacked: the retransmission is lost.
        let flags = p.process(
            &mut sb,
            &[SackBlock::new(1000, 2000)],
            TcpSeq(0),
            TcpSeq(0),
            TcpSeq(2000),
            &mut undo,
            &mut reord,
        );
        assert!(flags.contains(AckFlag::DataLost));
        let c = sb.counters();
        assert_eq!(c.retrans_out, 0);
        assert_eq!(c.lost_out, 1);
        assert!(sb.get(0).unwrap().is_lost());
        assert!(!sb.get(0).unwrap().is_retrans());
    }
}
