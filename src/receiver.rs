use std::sync::Arc;
use std::time::Duration;
use anyhow::bail;
use bytes::BytesMut;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use crate::config::{NetimgConfig, SessionParams, MAX_IMAGE_SIZE};
use crate::control_messages::{ImageGeometry, MetadataReply, QueryMessage};
use crate::display::ImageDisplay;
use crate::loss::{LossSimulator, OutgoingUnit};
use crate::packet_header::{Segment, SegmentKind, FIN_SEQ, SYN_SEQ};
use crate::receive_sequencer::ReceiveSequencer;
use crate::socket::DatagramSocket;
use crate::stats::{ReceiverStats, SequencerStats};

/// Sends a query for an image and waits for the server's image message, re-sending the query
///  when no reply arrives within the retransmission timeout.
///
/// If the image was found, the image message is acknowledged before returning. A server that
///  does not receive this acknowledgement re-sends the image message, which
///  [ImageReceiver] acknowledges again.
pub async fn query_image(socket: &dyn DatagramSocket, params: &SessionParams, config: &NetimgConfig, name: &str) -> anyhow::Result<MetadataReply> {
    let query = QueryMessage::new(name, params)?;
    let mut query_buf = BytesMut::with_capacity(QueryMessage::SERIALIZED_LEN);
    query.ser(&mut query_buf);

    let mut recv_buf = vec![0u8; params.mss as usize];

    for attempt in 1..=config.max_tries {
        debug!("querying for {:?}, attempt {}", name, attempt);
        socket.send_datagram(&query_buf).await?;

        let deadline = Instant::now() + config.retransmit_timeout;
        loop {
            let now = Instant::now();
            if now >= deadline || !socket.wait_readable(deadline - now).await? {
                break;
            }
            let Some(len) = socket.try_recv_datagram(&mut recv_buf)? else {
                continue;
            };

            let reply = MetadataReply::deser(&recv_buf[..len])?;
            if let MetadataReply::Found(geometry) = &reply {
                if geometry.img_size() > MAX_IMAGE_SIZE {
                    bail!("image {:?} has {} bytes, more than can be transferred", name, geometry.img_size());
                }
                send_handshake_ack(socket).await?;
            }
            info!("reply for {:?}: {:?}", name, reply);
            return Ok(reply);
        }
    }

    bail!("no reply from the server after {} queries", config.max_tries)
}

async fn send_handshake_ack(socket: &dyn DatagramSocket) -> anyhow::Result<()> {
    let mut buf = BytesMut::with_capacity(8);
    Segment::Ack { seqn: SYN_SEQ }.encode(&mut buf);
    socket.send_datagram(&buf).await
}

#[derive(Debug)]
pub struct ReceivedImage {
    pub geometry: ImageGeometry,
    pub pixels: Vec<u8>,
    /// all bytes of the image arrived (directly or reconstructed)
    pub complete: bool,
    pub stats: ReceiverStats,
    pub sequencer_stats: SequencerStats,
}

/// The client side of a transfer after the handshake. Every ready datagram is processed
///  without blocking, and each DATA segment is answered with a cumulative ACK that is subject
///  to simulated loss.
pub struct ImageReceiver {
    socket: Arc<dyn DatagramSocket>,
    geometry: ImageGeometry,
    sequencer: ReceiveSequencer,
    loss: Box<dyn LossSimulator>,
    stats: ReceiverStats,
    recv_buf: Vec<u8>,
    send_buf: BytesMut,
    fin_received: bool,
    retransmit_timeout: Duration,
    max_tries: u32,
}

impl ImageReceiver {
    pub fn new(
        socket: Arc<dyn DatagramSocket>,
        geometry: ImageGeometry,
        params: &SessionParams,
        config: &NetimgConfig,
        loss: Box<dyn LossSimulator>,
    ) -> anyhow::Result<ImageReceiver> {
        let img_size = geometry.img_size();
        if img_size > MAX_IMAGE_SIZE {
            bail!("image size {} exceeds the sequence number space", img_size);
        }

        Ok(ImageReceiver {
            socket,
            geometry,
            sequencer: ReceiveSequencer::new(params, img_size as usize)?,
            loss,
            stats: Default::default(),
            recv_buf: vec![0; params.mss as usize],
            send_buf: BytesMut::with_capacity(8),
            fin_received: false,
            retransmit_timeout: config.retransmit_timeout,
            max_tries: config.max_tries,
        })
    }

    pub fn sequencer(&self) -> &ReceiveSequencer {
        &self.sequencer
    }

    pub fn stats(&self) -> &ReceiverStats {
        &self.stats
    }

    /// Processes a single datagram if one is ready. Returns `false` without waiting if there
    ///  is none.
    pub async fn poll_once(&mut self, display: &mut dyn ImageDisplay) -> anyhow::Result<bool> {
        let Some(len) = self.socket.try_recv_datagram(&mut self.recv_buf)? else {
            return Ok(false);
        };

        self.handle_datagram(len).await?;
        display.on_update(self.sequencer.image(), &self.geometry, self.sequencer.next_seqn());
        Ok(true)
    }

    async fn handle_datagram(&mut self, len: usize) -> anyhow::Result<()> {
        let reply = {
            let datagram = &self.recv_buf[..len];
            match Segment::decode(datagram) {
                Ok(Segment::Data { seqn, payload }) => {
                    trace!("DATA @{}, {} bytes", seqn, payload.len());
                    self.stats.data_segments_received += 1;
                    let ack = self.sequencer.on_data(seqn, payload);
                    if ack.is_none() {
                        self.stats.invalid_datagrams += 1;
                    }
                    ack
                }
                Ok(Segment::Fec { seqn, payload }) => {
                    trace!("FEC @{}", seqn);
                    self.stats.fec_segments_received += 1;
                    self.sequencer.on_fec(seqn, payload)
                }
                Ok(Segment::Fin) => {
                    if !self.fin_received {
                        info!("FIN received at {} of {} bytes", self.sequencer.next_seqn(), self.sequencer.img_size());
                    }
                    self.fin_received = true;
                    self.stats.fin_received += 1;
                    Some(FIN_SEQ)
                }
                Ok(Segment::Ack { seqn }) => {
                    debug!("discarding ACK {} sent to the receiver", seqn);
                    self.stats.invalid_datagrams += 1;
                    None
                }
                Err(e) => match MetadataReply::deser(datagram) {
                    Ok(MetadataReply::Found(_)) => {
                        // our handshake ACK was lost
                        debug!("image message received again - re-sending handshake ACK");
                        Some(SYN_SEQ)
                    }
                    _ => {
                        debug!("discarding invalid datagram: {}", e);
                        self.stats.invalid_datagrams += 1;
                        None
                    }
                },
            }
        };

        match reply {
            Some(SYN_SEQ) => send_handshake_ack(self.socket.as_ref()).await,
            Some(seqn) => self.send_ack(seqn).await,
            None => Ok(()),
        }
    }

    async fn send_ack(&mut self, seqn: u32) -> anyhow::Result<()> {
        if self.loss.should_drop(OutgoingUnit::new(SegmentKind::Ack, seqn)) {
            debug!("simulated loss: ACK {}", seqn);
            self.stats.acks_dropped += 1;
            return Ok(());
        }

        trace!("sending ACK {}", seqn);
        self.stats.acks_sent += 1;
        self.send_buf.clear();
        Segment::Ack { seqn }.encode(&mut self.send_buf);
        self.socket.send_datagram(&self.send_buf).await
    }

    /// Receives until the sender has finished: after the first FIN, the receiver keeps
    ///  answering FIN retransmissions until the link has been idle for `max_tries` retransmission
    ///  timeouts. The display is updated after every datagram.
    pub async fn run(mut self, display: &mut dyn ImageDisplay) -> anyhow::Result<ReceivedImage> {
        let idle_limit = self.retransmit_timeout * self.max_tries;
        display.on_update(self.sequencer.image(), &self.geometry, 0);

        loop {
            if !self.socket.wait_readable(idle_limit).await? {
                if self.fin_received {
                    break;
                }
                if self.sequencer.is_complete() {
                    warn!("image complete, but no FIN from the server");
                    break;
                }
                bail!("no data from the server for {:?}, received {} of {} bytes", idle_limit, self.sequencer.next_seqn(), self.sequencer.img_size());
            }

            while self.poll_once(display).await? {}
        }

        let complete = self.sequencer.is_complete();
        if complete {
            info!("received image: {:?}, {:?}", self.stats, self.sequencer.stats());
        }
        else {
            warn!("transfer ended at {} of {} bytes", self.sequencer.next_seqn(), self.sequencer.img_size());
        }

        let sequencer_stats = self.sequencer.stats().clone();
        Ok(ReceivedImage {
            geometry: self.geometry,
            pixels: self.sequencer.into_image(),
            complete,
            stats: self.stats,
            sequencer_stats,
        })
    }
}
