//! Sequence numbers on the wire are `u32` byte offsets into the transferred image, and buffer
//!  positions are `usize`. Widening is always safe. Narrowing relies on checks made when a session
//!  is set up: image sizes are limited to `MAX_IMAGE_SIZE`, and payloads to the segment size.

use std::fmt::Debug;

/// Widens a wire sequence number to a position in the image buffer
pub trait SeqnToOffset {
    fn offset(self) -> usize;
}

#[cfg(not(target_pointer_width = "16"))]
impl SeqnToOffset for u32 {
    fn offset(self) -> usize {
        self as usize
    }
}

/// Narrows buffer positions and lengths to their wire representation.
/// NB: panics if the value is out of range, which is a bug in the caller's session setup
pub trait OffsetToWire {
    fn seqn(self) -> u32;
    fn wire_len(self) -> u16;
}

impl OffsetToWire for usize {
    fn seqn(self) -> u32 {
        narrow(self, "sequence number")
    }

    fn wire_len(self) -> u16 {
        narrow(self, "payload length")
    }
}

fn narrow<T>(value: usize, what: &str) -> T
where
    T: TryFrom<usize>,
    T::Error: Debug,
{
    match T::try_from(value) {
        Ok(narrowed) => narrowed,
        Err(e) => panic!("this is a bug: {} {} out of range for the wire format: {:?}", what, value, e),
    }
}
