use std::sync::Arc;
use std::time::Duration;
use bytes::{Bytes, BytesMut};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use crate::config::{NetimgConfig, SessionParams};
use crate::fec::FecEncoder;
use crate::loss::{LossSimulator, OutgoingUnit};
use crate::packet_header::{Segment, SegmentKind, FIN_SEQ, SYN_SEQ};
use crate::seqn::{OffsetToWire, SeqnToOffset};
use crate::send_window::{AckEffect, SendWindow};
use crate::socket::DatagramSocket;
use crate::stats::SenderStats;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransferOutcome {
    /// all data and the FIN were acknowledged
    Completed,
    /// all data was acknowledged, but no ACK for the FIN arrived. The receiver has the complete
    ///  image, so this is a clean (if unconfirmed) end of the transfer.
    FinUnacknowledged,
}

/// Sends an image to a receiver that completed the handshake: sliding window with cumulative
///  ACKs, one FEC parity segment per group of `fwnd` data segments, Go-Back-N when no ACK
///  progress is made for a retransmission timeout, and a FIN handshake with bounded retries.
pub struct ImageSender {
    socket: Arc<dyn DatagramSocket>,
    image: Bytes,
    params: SessionParams,
    window: SendWindow,
    encoder: FecEncoder,
    loss: Box<dyn LossSimulator>,
    retransmit_timeout: Duration,
    max_tries: u32,
    stats: SenderStats,
    send_buf: BytesMut,
    recv_buf: Vec<u8>,
}

impl ImageSender {
    pub fn new(
        socket: Arc<dyn DatagramSocket>,
        params: SessionParams,
        image: Bytes,
        config: &NetimgConfig,
        loss: Box<dyn LossSimulator>,
    ) -> ImageSender {
        ImageSender {
            socket,
            window: SendWindow::new(&params, image.len()),
            encoder: FecEncoder::new(params.fwnd as usize, params.datasize),
            image,
            params,
            loss,
            retransmit_timeout: config.retransmit_timeout,
            max_tries: config.max_tries,
            stats: Default::default(),
            send_buf: BytesMut::with_capacity(params.mss as usize),
            recv_buf: vec![0; params.mss as usize],
        }
    }

    pub fn stats(&self) -> &SenderStats {
        &self.stats
    }

    pub fn window(&self) -> &SendWindow {
        &self.window
    }

    pub async fn transfer(&mut self) -> anyhow::Result<TransferOutcome> {
        info!("sending {} bytes: mss={}, rwnd={}, fwnd={}, datasize={}",
            self.image.len(), self.params.mss, self.params.rwnd, self.params.fwnd, self.params.datasize);

        while !self.window.is_complete() {
            self.send_window_contents().await?;
            self.await_ack_progress().await?;
        }

        let outcome = self.finish().await?;
        info!("transfer finished: {:?}, {:?}", outcome, self.stats);
        Ok(outcome)
    }

    /// Sends segments while the usable window allows, each followed by its group's parity
    ///  segment where it completes a group or the image
    async fn send_window_contents(&mut self) -> anyhow::Result<()> {
        loop {
            let previously_sent = self.window.snd_next() < self.window.snd_max();
            let Some((offset, len)) = self.window.next_segment() else {
                break;
            };

            if self.encoder.next_offset() != offset {
                // after going back, or after an ACK beyond the point we went back to
                self.encoder.restart(offset);
            }

            let payload = self.image.slice(offset..offset + len);
            if previously_sent {
                self.stats.retransmitted_segments += 1;
            }
            self.send_segment(Segment::Data { seqn: offset.seqn(), payload: &payload }).await?;
            self.encoder.absorb(offset, &payload);

            if self.encoder.is_group_complete() || self.window.snd_next() >= self.window.total() {
                if let Some((group_start, parity)) = self.encoder.take_parity() {
                    self.send_segment(Segment::Fec { seqn: group_start.seqn(), payload: &parity }).await?;
                }
            }
        }
        Ok(())
    }

    /// DATA and FEC segments go through the loss simulator; a dropped segment is accounted for
    ///  as if it had been sent
    async fn send_segment(&mut self, segment: Segment<'_>) -> anyhow::Result<()> {
        let unit = match &segment {
            Segment::Data { seqn, .. } => Some(OutgoingUnit::new(SegmentKind::Data, *seqn)),
            Segment::Fec { seqn, .. } => Some(OutgoingUnit::new(SegmentKind::Fec, *seqn)),
            _ => None,
        };

        if let Some(unit) = unit {
            let dropped = self.loss.should_drop(unit);
            match (unit.kind, dropped) {
                (SegmentKind::Fec, true) => self.stats.fec_segments_dropped += 1,
                (SegmentKind::Fec, false) => self.stats.fec_segments_sent += 1,
                (_, true) => self.stats.data_segments_dropped += 1,
                (_, false) => self.stats.data_segments_sent += 1,
            }
            if dropped {
                debug!("simulated loss: {:?}", segment);
                return Ok(());
            }
        }

        trace!("sending {:?}", segment);
        self.send_buf.clear();
        segment.encode(&mut self.send_buf);
        self.socket.send_datagram(&self.send_buf).await
    }

    /// Waits up to one retransmission timeout for an ACK that moves `snd_una`, draining all
    ///  ACKs that arrive. Duplicate ACKs do not extend the wait. Without progress, the window
    ///  goes back to `snd_una`.
    async fn await_ack_progress(&mut self) -> anyhow::Result<()> {
        let deadline = Instant::now() + self.retransmit_timeout;

        loop {
            let now = Instant::now();
            if now >= deadline || !self.socket.wait_readable(deadline - now).await? {
                debug!("retransmission timeout at snd_una={}, snd_next={}", self.window.snd_una(), self.window.snd_next());
                self.stats.go_back_n_rounds += 1;
                self.window.go_back_n();
                return Ok(());
            }

            if self.drain_acks()? {
                return Ok(());
            }
        }
    }

    /// Processes all ACKs that are ready without blocking, returning whether `snd_una` moved
    fn drain_acks(&mut self) -> anyhow::Result<bool> {
        let mut progress = false;

        while let Some(len) = self.socket.try_recv_datagram(&mut self.recv_buf)? {
            match Segment::decode(&self.recv_buf[..len]) {
                Ok(Segment::Ack { seqn }) if seqn != SYN_SEQ && seqn != FIN_SEQ => {
                    self.stats.acks_received += 1;
                    match self.window.on_ack(seqn.offset()) {
                        AckEffect::Progress => progress = true,
                        AckEffect::Duplicate => self.stats.duplicate_acks += 1,
                        AckEffect::Invalid => self.stats.invalid_datagrams += 1,
                    }
                }
                Ok(segment) => {
                    debug!("ignoring {:?} while waiting for ACKs", segment);
                }
                Err(e) => {
                    debug!("discarding invalid datagram: {}", e);
                    self.stats.invalid_datagrams += 1;
                }
            }
        }
        Ok(progress)
    }

    async fn finish(&mut self) -> anyhow::Result<TransferOutcome> {
        for attempt in 1..=self.max_tries {
            debug!("sending FIN, attempt {}", attempt);
            self.stats.fin_attempts += 1;
            self.send_segment(Segment::Fin).await?;

            let deadline = Instant::now() + self.retransmit_timeout;
            loop {
                let now = Instant::now();
                if now >= deadline || !self.socket.wait_readable(deadline - now).await? {
                    break;
                }
                if self.drain_fin_ack()? {
                    info!("FIN acknowledged");
                    return Ok(TransferOutcome::Completed);
                }
            }
        }

        warn!("no ACK for FIN after {} attempts", self.max_tries);
        Ok(TransferOutcome::FinUnacknowledged)
    }

    fn drain_fin_ack(&mut self) -> anyhow::Result<bool> {
        while let Some(len) = self.socket.try_recv_datagram(&mut self.recv_buf)? {
            match Segment::decode(&self.recv_buf[..len]) {
                Ok(Segment::Ack { seqn: FIN_SEQ }) => return Ok(true),
                Ok(segment) => trace!("ignoring {:?} while waiting for FIN ACK", segment),
                Err(e) => debug!("discarding invalid datagram: {}", e),
            }
        }
        Ok(false)
    }
}
