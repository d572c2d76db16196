use std::cmp::min;
use tracing::{debug, trace};
use crate::config::SessionParams;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AckEffect {
    /// `snd_una` moved forward
    Progress,
    Duplicate,
    /// the ACK refers to bytes that were never sent, or to a reserved sequence number
    Invalid,
}

/// The sender's sliding window over the object's bytes. Offsets are byte positions in the object.
///
/// Invariants: `snd_una <= snd_next <= total`, and `snd_next - snd_una <= rwnd * datasize`.
#[derive(Debug)]
pub struct SendWindow {
    /// oldest unacknowledged byte
    snd_una: usize,
    /// next byte to send
    snd_next: usize,
    /// highest byte ever sent (exclusive); ACKs beyond this are invalid
    snd_max: usize,
    total: usize,
    datasize: usize,
    window_bytes: usize,
}

impl SendWindow {
    pub fn new(params: &SessionParams, total: usize) -> SendWindow {
        SendWindow {
            snd_una: 0,
            snd_next: 0,
            snd_max: 0,
            total,
            datasize: params.datasize,
            window_bytes: params.window_bytes(),
        }
    }

    pub fn snd_una(&self) -> usize {
        self.snd_una
    }

    pub fn snd_next(&self) -> usize {
        self.snd_next
    }

    pub fn snd_max(&self) -> usize {
        self.snd_max
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn usable_window(&self) -> usize {
        self.window_bytes - (self.snd_next - self.snd_una)
    }

    /// Sending continues while the usable window exceeds one segment and bytes remain
    pub fn can_send(&self) -> bool {
        self.snd_next < self.total && self.usable_window() > self.datasize
    }

    /// Returns the offset and length of the next segment, and accounts for it as sent - whether
    ///  or not it actually makes it onto the wire.
    pub fn next_segment(&mut self) -> Option<(usize, usize)> {
        if !self.can_send() {
            return None;
        }

        let offset = self.snd_next;
        let len = min(self.datasize, self.total - offset);
        self.snd_next += len;
        self.snd_max = self.snd_max.max(self.snd_next);
        self.debug_check_invariants();
        Some((offset, len))
    }

    pub fn on_ack(&mut self, ack: usize) -> AckEffect {
        if ack > self.snd_max {
            debug!("ACK for {} beyond highest sent byte {} - ignoring", ack, self.snd_max);
            return AckEffect::Invalid;
        }
        if ack <= self.snd_una {
            trace!("duplicate ACK {}", ack);
            return AckEffect::Duplicate;
        }

        trace!("ACK {}: snd_una moves from {}", ack, self.snd_una);
        self.snd_una = ack;
        if self.snd_next < self.snd_una {
            // the receiver got further than we knew when we went back
            self.snd_next = self.snd_una;
        }
        self.debug_check_invariants();
        AckEffect::Progress
    }

    /// Go-Back-N: resend everything from the oldest unacknowledged byte
    pub fn go_back_n(&mut self) {
        debug!("going back from {} to {}", self.snd_next, self.snd_una);
        self.snd_next = self.snd_una;
    }

    pub fn is_complete(&self) -> bool {
        self.snd_una >= self.total
    }

    /// The number of bytes sent but not yet acknowledged
    pub fn in_flight(&self) -> usize {
        self.snd_next - self.snd_una
    }

    pub fn window_bytes(&self) -> usize {
        self.window_bytes
    }

    fn debug_check_invariants(&self) {
        debug_assert!(self.snd_una <= self.snd_next && self.snd_next <= self.snd_max && self.snd_max <= self.total,
            "snd_una={}, snd_next={}, snd_max={}, total={}", self.snd_una, self.snd_next, self.snd_max, self.total);
        debug_assert!(self.in_flight() <= self.window_bytes, "{} bytes in flight, window is {}", self.in_flight(), self.window_bytes);
    }
}
