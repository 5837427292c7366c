// Copyright (c) 2023 The TQUIC Authors.
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

//! Bookkeeping of segments that have been sent but not yet cumulatively
//! acknowledged.

use std::collections::VecDeque;
use std::ops::Range;
use std::time::Instant;

use enumflags2::bitflags;
use enumflags2::BitFlags;
use slab::Slab;
use smallvec::SmallVec;

use crate::Error;
use crate::Result;

/// The largest payload a single segment may cover. Anything larger would make
/// the wrapping comparisons of the 32-bit sequence space ambiguous.
const MAX_SEGMENT_LEN: u32 = 1 << 30;

/// Return whether `seq1` comes before `seq2` in the wrapping sequence space.
#[inline]
pub fn seq_before(seq1: u32, seq2: u32) -> bool {
    (seq1.wrapping_sub(seq2) as i32) < 0
}

/// Return whether `seq1` comes after `seq2` in the wrapping sequence space.
#[inline]
pub fn seq_after(seq1: u32, seq2: u32) -> bool {
    seq_before(seq2, seq1)
}

/// Per-segment state flags.
#[bitflags]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentFlags {
    /// Covered by the cumulative acknowledgment.
    Acked = 1 << 0,

    /// Covered by a SACK block.
    Sacked = 1 << 1,

    /// A retransmission of the segment is outstanding and counted in
    /// `retrans_out`.
    Retransmitted = 1 << 2,

    /// Presumed lost.
    Lost = 1 << 3,

    /// The segment has been retransmitted at least once. Unlike
    /// `Retransmitted` it is never cleared.
    EverRetransmitted = 1 << 4,
}

/// Return whether the flags describe a retransmitted segment, i.e. one whose
/// send time is not ordered with the original transmissions.
#[inline]
pub fn is_retransmission(flags: BitFlags<SegmentFlags>) -> bool {
    flags.intersects(SegmentFlags::Retransmitted | SegmentFlags::EverRetransmitted)
}

/// Stable handle of a segment in the store.
///
/// Arena slots are reused once a segment is drained, so the handle also
/// carries the id the store assigned to the segment. A handle outliving its
/// segment never resolves to the segment that took over the slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentHandle {
    key: usize,
    id: u64,
}

impl SegmentHandle {
    /// Return the arena index behind the handle.
    pub fn index(&self) -> usize {
        self.key
    }
}

/// Metadata of a sent segment.
#[derive(Clone)]
pub struct SentSegment {
    /// Half-open sequence range `[start, end)`.
    pub seq: Range<u32>,

    /// The time of the most recent (re)transmission.
    pub sent_time: Instant,

    /// State flags.
    pub flags: BitFlags<SegmentFlags>,

    /// Unique id within the store.
    id: u64,
}

impl SentSegment {
    pub fn start_seq(&self) -> u32 {
        self.seq.start
    }

    pub fn end_seq(&self) -> u32 {
        self.seq.end
    }

    /// Number of sequence numbers covered by the segment.
    pub fn len(&self) -> u32 {
        self.seq.end.wrapping_sub(self.seq.start)
    }

    pub fn is_acked(&self) -> bool {
        self.flags.contains(SegmentFlags::Acked)
    }

    pub fn is_sacked(&self) -> bool {
        self.flags.contains(SegmentFlags::Sacked)
    }

    pub fn is_lost(&self) -> bool {
        self.flags.contains(SegmentFlags::Lost)
    }

    /// Whether a retransmission of the segment is currently outstanding.
    pub fn is_retransmitted(&self) -> bool {
        self.flags.contains(SegmentFlags::Retransmitted)
    }

    /// Whether the segment was ever retransmitted.
    pub fn is_retransmission(&self) -> bool {
        is_retransmission(self.flags)
    }
}

impl std::fmt::Debug for SentSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "seq={}..{}", self.seq.start, self.seq.end)?;
        write!(f, " sent_time={:?}", self.sent_time)?;
        write!(f, " flags={:?}", self.flags)?;

        Ok(())
    }
}

/// Metadata of a segment newly acknowledged or selectively acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct AckedSegment {
    /// Handle of the segment in the store.
    pub handle: SegmentHandle,

    /// The end sequence number of the segment.
    pub end_seq: u32,

    /// The time of the most recent (re)transmission.
    pub sent_time: Instant,

    /// The flags of the segment before this acknowledgment was applied.
    pub flags: BitFlags<SegmentFlags>,
}

/// Outstanding segments of a connection, ordered by sequence number.
///
/// Segments live in an arena and are addressed by `SegmentHandle`. All flag
/// mutation goes through the store so that the in-flight counters stay
/// consistent with the flags.
pub struct SentSegmentStore {
    /// Segment arena.
    segments: Slab<SentSegment>,

    /// Arena keys in ascending sequence order.
    order: VecDeque<usize>,

    /// The oldest unacknowledged sequence number.
    snd_una: u32,

    /// The next sequence number to be sent.
    snd_nxt: u32,

    /// The highest end sequence number covered by a SACK block so far.
    highest_sack_end: Option<u32>,

    /// Number of segments not cumulatively acknowledged.
    packets_out: u64,

    /// Number of selectively acknowledged segments.
    sacked_out: u64,

    /// Number of segments marked lost.
    lost_out: u64,

    /// Number of outstanding retransmissions.
    retrans_out: u64,

    /// Id of the next segment.
    next_id: u64,
}

impl SentSegmentStore {
    /// Create an empty store starting at the initial sequence number `isn`.
    pub fn new(isn: u32) -> Self {
        SentSegmentStore {
            segments: Slab::with_capacity(64),
            order: VecDeque::with_capacity(64),
            snd_una: isn,
            snd_nxt: isn,
            highest_sack_end: None,
            packets_out: 0,
            sacked_out: 0,
            lost_out: 0,
            retrans_out: 0,
            next_id: 0,
        }
    }

    fn handle_of(key: usize, seg: &SentSegment) -> SegmentHandle {
        SegmentHandle { key, id: seg.id }
    }

    /// Record the transmission of `len` new bytes at `now`.
    ///
    /// New data always starts at `snd_nxt`, so originals are ordered both by
    /// sequence number and by send time.
    pub fn on_sent(&mut self, len: u32, now: Instant) -> Result<SegmentHandle> {
        if len == 0 || len > MAX_SEGMENT_LEN {
            return Err(Error::InvalidSegment);
        }

        let start = self.snd_nxt;
        let end = start.wrapping_add(len);
        let id = self.next_id;
        self.next_id += 1;
        let key = self.segments.insert(SentSegment {
            seq: start..end,
            sent_time: now,
            flags: BitFlags::empty(),
            id,
        });
        self.order.push_back(key);
        self.snd_nxt = end;
        self.packets_out += 1;

        Ok(SegmentHandle { key, id })
    }

    /// Record a retransmission of the segment at `now`.
    pub fn on_retransmit(&mut self, handle: SegmentHandle, now: Instant) -> Result<()> {
        let seg = self
            .segments
            .get_mut(handle.key)
            .filter(|seg| seg.id == handle.id)
            .ok_or(Error::UnknownSegment)?;
        if seg.is_acked() {
            return Err(Error::UnknownSegment);
        }

        if !seg.is_retransmitted() {
            self.retrans_out += 1;
        }
        seg.flags |= SegmentFlags::Retransmitted | SegmentFlags::EverRetransmitted;
        seg.sent_time = now;

        Ok(())
    }

    /// Mark the segment as selectively acknowledged.
    ///
    /// Return whether the segment was newly sacked.
    pub fn mark_sacked(&mut self, handle: SegmentHandle) -> bool {
        let seg = match self
            .segments
            .get_mut(handle.key)
            .filter(|seg| seg.id == handle.id)
        {
            Some(seg) => seg,
            None => return false,
        };
        if seg.flags.intersects(SegmentFlags::Acked | SegmentFlags::Sacked) {
            return false;
        }

        // A delivered segment no longer counts as lost or as an outstanding
        // retransmission.
        if seg.is_lost() {
            seg.flags.remove(SegmentFlags::Lost);
            self.lost_out = self.lost_out.saturating_sub(1);
        }
        if seg.is_retransmitted() {
            seg.flags.remove(SegmentFlags::Retransmitted);
            self.retrans_out = self.retrans_out.saturating_sub(1);
        }
        seg.flags.insert(SegmentFlags::Sacked);
        self.sacked_out += 1;

        let end = seg.end_seq();
        match self.highest_sack_end {
            Some(h) if !seq_after(end, h) => (),
            _ => self.highest_sack_end = Some(end),
        }
        true
    }

    /// Mark the segment as lost.
    ///
    /// Return whether the segment was newly marked.
    pub fn mark_lost(&mut self, handle: SegmentHandle) -> bool {
        let seg = match self
            .segments
            .get_mut(handle.key)
            .filter(|seg| seg.id == handle.id)
        {
            Some(seg) => seg,
            None => return false,
        };
        if seg
            .flags
            .intersects(SegmentFlags::Acked | SegmentFlags::Sacked | SegmentFlags::Lost)
        {
            return false;
        }

        seg.flags.insert(SegmentFlags::Lost);
        self.lost_out += 1;
        true
    }

    /// Clear the outstanding retransmission of the segment, which is presumed
    /// to have been lost as well.
    ///
    /// Return whether a retransmission was outstanding.
    pub fn clear_retransmitted(&mut self, handle: SegmentHandle) -> bool {
        let seg = match self
            .segments
            .get_mut(handle.key)
            .filter(|seg| seg.id == handle.id)
        {
            Some(seg) => seg,
            None => return false,
        };
        if !seg.is_retransmitted() {
            return false;
        }

        seg.flags.remove(SegmentFlags::Retransmitted);
        self.retrans_out = self.retrans_out.saturating_sub(1);
        true
    }

    /// Apply a cumulative acknowledgment.
    ///
    /// Every segment that ends at or before `ack` is marked acked. It returns
    /// the segments that were acked by this call, including previously sacked
    /// ones, in ascending sequence order.
    pub fn on_cumulative_ack(&mut self, ack: u32) -> Result<Vec<AckedSegment>> {
        if seq_after(ack, self.snd_nxt) {
            return Err(Error::InvalidAck);
        }

        let mut acked = Vec::new();
        if !seq_after(ack, self.snd_una) {
            return Ok(acked);
        }

        for &key in self.order.iter() {
            let seg = match self.segments.get_mut(key) {
                Some(seg) => seg,
                None => continue,
            };
            if seq_after(seg.end_seq(), ack) {
                break;
            }
            if seg.is_acked() {
                continue;
            }

            acked.push(AckedSegment {
                handle: Self::handle_of(key, seg),
                end_seq: seg.end_seq(),
                sent_time: seg.sent_time,
                flags: seg.flags,
            });

            if seg.is_sacked() {
                self.sacked_out = self.sacked_out.saturating_sub(1);
            }
            if seg.is_lost() {
                self.lost_out = self.lost_out.saturating_sub(1);
            }
            if seg.is_retransmitted() {
                self.retrans_out = self.retrans_out.saturating_sub(1);
            }
            self.packets_out = self.packets_out.saturating_sub(1);

            seg.flags
                .remove(SegmentFlags::Sacked | SegmentFlags::Lost | SegmentFlags::Retransmitted);
            seg.flags.insert(SegmentFlags::Acked);
        }

        self.snd_una = ack;
        Ok(acked)
    }

    /// Apply a SACK block.
    ///
    /// Only segments entirely covered by `range` are marked. It returns the
    /// segments that were newly sacked by this call.
    pub fn sack_range(&mut self, range: Range<u32>) -> Vec<AckedSegment> {
        let mut covered: SmallVec<[SegmentHandle; 16]> = SmallVec::new();
        for &key in self.order.iter() {
            let seg = match self.segments.get(key) {
                Some(seg) => seg,
                None => continue,
            };
            if !seq_before(seg.start_seq(), range.end) {
                break;
            }
            if seq_before(seg.start_seq(), range.start) || seq_after(seg.end_seq(), range.end) {
                continue;
            }
            if !seq_after(seg.end_seq(), self.snd_una) {
                continue;
            }
            covered.push(Self::handle_of(key, seg));
        }

        let mut sacked = Vec::with_capacity(covered.len());
        for handle in covered {
            let (end_seq, sent_time, flags) = match self.get(handle) {
                Some(seg) => (seg.end_seq(), seg.sent_time, seg.flags),
                None => continue,
            };
            if self.mark_sacked(handle) {
                sacked.push(AckedSegment {
                    handle,
                    end_seq,
                    sent_time,
                    flags,
                });
            }
        }
        sacked
    }

    /// Remove the cumulatively acknowledged segments from the front of the
    /// store. Return the number of removed segments.
    pub fn drain_acked(&mut self) -> usize {
        let mut removed = 0;
        while let Some(&key) = self.order.front() {
            match self.segments.get(key) {
                Some(seg) if !seg.is_acked() => break,
                Some(_) => {
                    self.segments.remove(key);
                }
                None => (),
            }
            self.order.pop_front();
            removed += 1;
        }
        removed
    }

    /// Get an immutable reference to the segment identified by `handle`.
    ///
    /// A handle whose segment has been drained resolves to nothing.
    pub fn get(&self, handle: SegmentHandle) -> Option<&SentSegment> {
        self.segments
            .get(handle.key)
            .filter(|seg| seg.id == handle.id)
    }

    /// Return an iterator over the stored segments in ascending sequence
    /// order.
    pub fn iter(&self) -> impl Iterator<Item = (SegmentHandle, &SentSegment)> + '_ {
        self.order
            .iter()
            .filter_map(move |&key| {
                self.segments
                    .get(key)
                    .map(|seg| (Self::handle_of(key, seg), seg))
            })
    }

    /// Return the number of stored segments, including acked ones that have
    /// not been drained yet.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// The oldest unacknowledged sequence number.
    pub fn snd_una(&self) -> u32 {
        self.snd_una
    }

    /// The next sequence number to be sent.
    pub fn snd_nxt(&self) -> u32 {
        self.snd_nxt
    }

    /// The highest end sequence number covered by a SACK block so far.
    pub fn highest_sack_end(&self) -> Option<u32> {
        self.highest_sack_end
    }

    pub fn packets_out(&self) -> u64 {
        self.packets_out
    }

    pub fn sacked_out(&self) -> u64 {
        self.sacked_out
    }

    pub fn lost_out(&self) -> u64 {
        self.lost_out
    }

    pub fn retrans_out(&self) -> u64 {
        self.retrans_out
    }

    /// Number of segments presumed to be in the network.
    pub fn in_flight(&self) -> u64 {
        self.packets_out
            .saturating_sub(self.sacked_out + self.lost_out)
            .saturating_add(self.retrans_out)
    }
}
