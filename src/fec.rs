//! XOR parity over groups of consecutive data segments.
//!
//! For a group of up to `fwnd` segments, the parity segment is the byte-wise XOR of all segments,
//!  each zero-extended to `datasize`. So the parity is always `datasize` bytes, and any single
//!  missing segment is the XOR of the parity with all other segments of the group.

use tracing::trace;

/// dst ^= src, for `min(dst.len(), src.len())` bytes. Bytes of `dst` beyond `src`'s length are
///  left unchanged, which is XOR with implicit zero padding.
pub fn xor_into(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= *s;
    }
}

/// Recovers a single missing segment from a group's parity and all other segments of the group.
///  The result has the parity's length, i.e. it is zero padded if the missing segment is short.
pub fn reconstruct<'a>(parity: &[u8], others: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
    let mut result = parity.to_vec();
    for segment in others {
        xor_into(&mut result, segment);
    }
    result
}

/// The sender side's parity accumulator. Segments must be absorbed in order of their offsets,
///  and all segments except the last one of the object must be `datasize` bytes long.
pub struct FecEncoder {
    fwnd: usize,
    datasize: usize,
    group_start: usize,
    count: usize,
    parity: Vec<u8>,
}

impl FecEncoder {
    pub fn new(fwnd: usize, datasize: usize) -> FecEncoder {
        FecEncoder {
            fwnd,
            datasize,
            group_start: 0,
            count: 0,
            parity: vec![0; datasize],
        }
    }

    /// Discards the current group, starting a new one at `offset`. This is where the sender
    ///  realigns after going back to its oldest unacknowledged byte.
    pub fn restart(&mut self, offset: usize) {
        trace!("FEC group restarts at {}", offset);
        self.group_start = offset;
        self.count = 0;
        self.parity.fill(0);
    }

    /// The offset of the segment the encoder expects next
    pub fn next_offset(&self) -> usize {
        self.group_start + self.count * self.datasize
    }

    pub fn absorb(&mut self, offset: usize, segment: &[u8]) {
        debug_assert_eq!(offset, self.next_offset());
        debug_assert!(segment.len() <= self.datasize);

        xor_into(&mut self.parity, segment);
        self.count += 1;
    }

    pub fn is_group_complete(&self) -> bool {
        self.count >= self.fwnd
    }

    /// Returns the group's start offset and parity if any segments were absorbed, and starts
    ///  the next group right after them
    pub fn take_parity(&mut self) -> Option<(usize, Vec<u8>)> {
        if self.count == 0 {
            return None;
        }

        let group_start = self.group_start;
        let parity = std::mem::replace(&mut self.parity, vec![0; self.datasize]);
        self.group_start = self.next_offset();
        self.count = 0;
        Some((group_start, parity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn object(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + i / 256) as u8).collect()
    }

    #[rstest]
    #[case::same_len(vec![1, 2, 3], vec![3, 2, 1], vec![2, 0, 2])]
    #[case::short_src(vec![1, 2, 3], vec![1], vec![0, 2, 3])]
    #[case::long_src(vec![1], vec![1, 5, 5], vec![0])]
    #[case::empty_src(vec![9, 9], vec![], vec![9, 9])]
    fn test_xor_into(#[case] dst: Vec<u8>, #[case] src: Vec<u8>, #[case] expected: Vec<u8>) {
        let mut dst = dst;
        xor_into(&mut dst, &src);
        assert_eq!(dst, expected);
    }

    #[rstest]
    #[case::full_group(40, 10, 4)]
    #[case::short_last_segment(37, 10, 4)]
    #[case::short_group(25, 10, 4)]
    #[case::single_segment(3, 10, 4)]
    fn test_parity_recovers_any_single_segment(#[case] len: usize, #[case] datasize: usize, #[case] fwnd: usize) {
        let data = object(len);
        let segments: Vec<&[u8]> = data.chunks(datasize).collect();
        assert!(segments.len() <= fwnd);

        let mut encoder = FecEncoder::new(fwnd, datasize);
        for (i, segment) in segments.iter().enumerate() {
            encoder.absorb(i * datasize, segment);
        }
        assert_eq!(encoder.is_group_complete(), segments.len() == fwnd);

        let (group_start, parity) = encoder.take_parity().unwrap();
        assert_eq!(group_start, 0);
        assert_eq!(parity.len(), datasize);

        for missing in 0..segments.len() {
            let others = segments.iter()
                .enumerate()
                .filter(|(i, _)| *i != missing)
                .map(|(_, s)| *s);
            let recovered = reconstruct(&parity, others);
            assert_eq!(&recovered[..segments[missing].len()], segments[missing]);
            assert!(recovered[segments[missing].len()..].iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn test_groups_follow_each_other() {
        let mut encoder = FecEncoder::new(2, 10);
        assert!(encoder.take_parity().is_none());

        for offset in [0, 10] {
            encoder.absorb(offset, &[1; 10]);
        }
        assert!(encoder.is_group_complete());
        assert_eq!(encoder.take_parity(), Some((0, vec![0; 10])));
        assert!(encoder.take_parity().is_none());
        assert_eq!(encoder.next_offset(), 20);

        encoder.absorb(20, &[3; 10]);
        assert!(!encoder.is_group_complete());
        assert_eq!(encoder.take_parity(), Some((20, vec![3; 10])));
    }

    #[test]
    fn test_restart() {
        let mut encoder = FecEncoder::new(4, 10);
        encoder.absorb(0, &[1; 10]);
        encoder.absorb(10, &[2; 10]);

        encoder.restart(10);
        assert!(encoder.take_parity().is_none());
        assert_eq!(encoder.next_offset(), 10);

        encoder.absorb(10, &[2; 10]);
        assert_eq!(encoder.take_parity(), Some((10, vec![2; 10])));
        assert_eq!(encoder.next_offset(), 20);
    }
}
