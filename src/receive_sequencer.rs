use std::cmp::{max, min};
use anyhow::bail;
use bit_set::BitSet;
use tracing::{debug, trace};
use crate::config::{SessionParams, MAX_IMAGE_SIZE};
use crate::fec;
use crate::seqn::{OffsetToWire, SeqnToOffset};
use crate::stats::SequencerStats;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SequencerMode {
    Normal,
    /// A group had more than one loss. All data is ignored until the sender goes back and
    ///  retransmits the segment at `next_seqn`.
    GoBackN,
}

/// The receiver's state machine: writes arriving segments into the image buffer, tracks the
///  current FEC group, repairs single losses from parity segments and decides when the sender's
///  Go-Back-N retransmission is needed.
///
/// Offsets are byte positions in the image. All data segments start at a multiple of `datasize`,
///  and all except the image's last segment are `datasize` bytes long.
pub struct ReceiveSequencer {
    image: Vec<u8>,
    datasize: usize,
    fwnd: usize,
    mode: SequencerMode,

    /// the next expected contiguous byte offset: everything below it was received. This is the
    ///  value that is acknowledged.
    next_seqn: usize,

    /// start of the current FEC group, as far as the receiver knows. This is a multiple of
    ///  `fwnd * datasize` unless the receiver resynchronized to a group start observed from
    ///  the sender.
    window_start: usize,

    /// the segments received at or after `window_start`, indexed by their distance from it in
    ///  segments. Keeping a set rather than a count makes duplicates harmless and identifies the
    ///  segment to reconstruct.
    received: BitSet,

    stats: SequencerStats,
}

impl ReceiveSequencer {
    pub fn new(params: &SessionParams, img_size: usize) -> anyhow::Result<ReceiveSequencer> {
        if img_size as u64 > MAX_IMAGE_SIZE {
            bail!("image size {} exceeds the sequence number space", img_size);
        }

        Ok(ReceiveSequencer {
            image: vec![0; img_size],
            datasize: params.datasize,
            fwnd: params.fwnd as usize,
            mode: SequencerMode::Normal,
            next_seqn: 0,
            window_start: 0,
            received: BitSet::with_capacity(params.fwnd as usize),
            stats: Default::default(),
        })
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn into_image(self) -> Vec<u8> {
        self.image
    }

    pub fn img_size(&self) -> usize {
        self.image.len()
    }

    pub fn mode(&self) -> SequencerMode {
        self.mode
    }

    pub fn next_seqn(&self) -> usize {
        self.next_seqn
    }

    pub fn window_start(&self) -> usize {
        self.window_start
    }

    pub fn is_complete(&self) -> bool {
        self.next_seqn >= self.img_size()
    }

    pub fn stats(&self) -> &SequencerStats {
        &self.stats
    }

    /// The number of distinct segments of the current group that were received
    pub fn packets_count(&self) -> usize {
        self.received.iter()
            .take_while(|&i| i < self.fwnd)
            .count()
    }

    fn ack_value(&self) -> u32 {
        self.next_seqn.seqn()
    }

    fn group_bytes(&self) -> usize {
        self.fwnd * self.datasize
    }

    fn segment_len(&self, offset: usize) -> usize {
        min(self.datasize, self.img_size() - offset)
    }

    /// The number of segments in the current group, which is less than `fwnd` for the image's
    ///  last group
    fn adjusted_group_size(&self) -> usize {
        let remaining = self.img_size().saturating_sub(self.window_start);
        min(self.fwnd, remaining.div_ceil(self.datasize))
    }

    fn is_valid_segment(&self, offset: usize, len: usize) -> bool {
        offset < self.img_size()
            && offset % self.datasize == 0
            && len == self.segment_len(offset)
    }

    fn index_of(&self, offset: usize) -> usize {
        (offset - self.window_start) / self.datasize
    }

    /// Moves `window_start`, re-indexing the received segments relative to it. Segments below
    ///  the new start are forgotten.
    fn rebase(&mut self, new_window_start: usize) {
        let mut rebased = BitSet::with_capacity(self.fwnd);
        for i in self.received.iter() {
            let offset = self.window_start + i * self.datasize;
            if offset >= new_window_start {
                rebased.insert((offset - new_window_start) / self.datasize);
            }
        }
        self.window_start = new_window_start;
        self.received = rebased;
    }

    fn advance_group(&mut self) {
        self.rebase(self.window_start + self.group_bytes());
    }

    /// advance `next_seqn` over all contiguously received segments
    fn advance_contiguous(&mut self) {
        while self.next_seqn < self.img_size()
            && self.next_seqn >= self.window_start
            && self.received.contains(self.index_of(self.next_seqn))
        {
            self.next_seqn += self.segment_len(self.next_seqn);
        }
    }

    fn enter_go_back_n(&mut self, reason: &str) {
        debug!("entering Go-Back-N mode at {}: {}", self.next_seqn, reason);
        self.mode = SequencerMode::GoBackN;
        self.window_start = self.next_seqn;
        self.received.clear();
        self.stats.go_back_n_entries += 1;
    }

    /// Handles a DATA segment, returning the cumulative ACK to send, or `None` if the segment
    ///  does not fit into the image and was discarded.
    pub fn on_data(&mut self, seqn: u32, payload: &[u8]) -> Option<u32> {
        let offset = seqn.offset();
        if !self.is_valid_segment(offset, payload.len()) {
            debug!("discarding DATA segment @{} with {} bytes: does not fit image of {} bytes", offset, payload.len(), self.img_size());
            return None;
        }

        match self.mode {
            SequencerMode::GoBackN => {
                if offset == self.next_seqn {
                    debug!("sender went back to {} - resuming", offset);
                    self.write(offset, payload);
                    self.mode = SequencerMode::Normal;
                    self.window_start = offset;
                    self.received.clear();
                    self.received.insert(0);
                    self.next_seqn += payload.len();
                    self.stats.resynchronizations += 1;
                }
                else {
                    trace!("ignoring DATA @{} while waiting for {}", offset, self.next_seqn);
                    self.stats.ignored_in_go_back_n += 1;
                }
            }
            SequencerMode::Normal => {
                self.write(offset, payload);

                if offset < self.window_start {
                    trace!("stale DATA @{} before current group at {}", offset, self.window_start);
                    self.stats.stale_segments += 1;
                }
                else if offset - self.window_start >= self.group_bytes() {
                    // the sender moved on to the next group, and this receiver saw no parity for
                    //  the current one
                    if offset == self.next_seqn && offset - self.window_start < 2 * self.group_bytes() {
                        self.advance_group();
                        let index = self.index_of(offset);
                        self.received.insert(index);
                        self.advance_contiguous();
                    }
                    else {
                        self.enter_go_back_n("data beyond current group with a gap");
                    }
                }
                else {
                    let index = self.index_of(offset);
                    self.received.insert(index);
                    self.advance_contiguous();
                }
            }
        }

        trace!("DATA @{}: next_seqn={}, window_start={}, count={}", offset, self.next_seqn, self.window_start, self.packets_count());
        Some(self.ack_value())
    }

    /// Handles a parity segment for the group starting at `seqn`. Returns an ACK to send if the
    ///  parity was used to reconstruct a missing segment.
    pub fn on_fec(&mut self, seqn: u32, parity: &[u8]) -> Option<u32> {
        let group_start = seqn.offset();

        if self.mode == SequencerMode::GoBackN {
            trace!("ignoring FEC @{} in Go-Back-N mode", group_start);
            self.stats.ignored_in_go_back_n += 1;
            return None;
        }
        if group_start >= self.img_size() || group_start % self.datasize != 0 || parity.len() != self.datasize {
            debug!("discarding FEC segment @{} with {} bytes", group_start, parity.len());
            return None;
        }

        if group_start > self.window_start {
            self.enter_go_back_n("sender's FEC group is ahead of the receiver's");
            return None;
        }

        if group_start < self.window_start {
            let group_end = min(group_start + self.group_bytes(), self.img_size());
            if group_end <= self.next_seqn {
                trace!("stale FEC @{}: group was received completely", group_start);
                self.stats.stale_parity += 1;
                return None;
            }

            debug!("resynchronizing FEC group from {} to {}", self.window_start, group_start);
            self.rebase(group_start);
            for offset in (group_start..self.next_seqn).step_by(self.datasize) {
                let index = self.index_of(offset);
                self.received.insert(index);
            }
            self.stats.resynchronizations += 1;
        }

        let adjusted_group_size = self.adjusted_group_size();
        let packets_count = self.packets_count();

        if packets_count == adjusted_group_size {
            trace!("FEC @{}: group complete", group_start);
            self.advance_group();
            self.advance_contiguous();
            None
        }
        else if packets_count + 1 == adjusted_group_size {
            self.reconstruct(adjusted_group_size, parity);
            Some(self.ack_value())
        }
        else {
            self.enter_go_back_n("more than one segment missing in FEC group");
            None
        }
    }

    fn reconstruct(&mut self, adjusted_group_size: usize, parity: &[u8]) {
        let missing = match (0..adjusted_group_size).find(|&i| !self.received.contains(i)) {
            Some(i) => i,
            None => return,
        };
        let missing_offset = self.window_start + missing * self.datasize;
        let missing_len = self.segment_len(missing_offset);

        let recovered = {
            let others = (0..adjusted_group_size)
                .filter(|&i| i != missing)
                .map(|i| {
                    let offset = self.window_start + i * self.datasize;
                    &self.image[offset..offset + self.segment_len(offset)]
                });
            fec::reconstruct(parity, others)
        };

        debug!("reconstructed segment @{} from FEC group at {}", missing_offset, self.window_start);
        self.image[missing_offset..missing_offset + missing_len].copy_from_slice(&recovered[..missing_len]);
        self.received.insert(missing);
        self.stats.reconstructions += 1;

        self.advance_group();
        self.next_seqn = max(self.next_seqn, min(self.window_start, self.img_size()));
        self.advance_contiguous();
    }

    fn write(&mut self, offset: usize, payload: &[u8]) {
        self.image[offset..offset + payload.len()].copy_from_slice(payload);
    }
}
