use std::sync::Arc;
use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use crate::config::{NetimgConfig, MAX_IMAGE_SIZE};
use crate::control_messages::{ErrorCode, MetadataReply, QueryDecision, QueryMessage};
use crate::image_store::{ImageStore, StoredImage};
use crate::loss::{self, LossSimulator};
use crate::packet_header::{Segment, SYN_SEQ};
use crate::sender::{ImageSender, TransferOutcome};
use crate::socket::{DatagramSocket, PeerSocket};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionOutcome {
    Transferred(TransferOutcome),
    NotFound,
    /// the query was malformed, and the client was told why
    Rejected(ErrorCode),
    /// a stray ACK, no reply
    Ignored,
    /// the client did not acknowledge the image message
    HandshakeFailed,
    /// the image can not be transferred
    Aborted,
}

/// Handles a single datagram received on the server's query port, and if it is a valid query
///  for an existing image, runs the whole session: image message, transfer and FIN.
pub async fn serve_query(
    socket: Arc<dyn DatagramSocket>,
    datagram: &[u8],
    store: &dyn ImageStore,
    config: &NetimgConfig,
    loss: Box<dyn LossSimulator>,
) -> anyhow::Result<SessionOutcome> {
    let query = match QueryMessage::decide(datagram) {
        QueryDecision::Serve(query) => query,
        QueryDecision::Ignore => {
            debug!("ignoring stray ACK on the query port");
            return Ok(SessionOutcome::Ignored);
        }
        QueryDecision::Reject(code) => {
            warn!("rejecting query: {:?}", code);
            send_reply(socket.as_ref(), MetadataReply::Error(code)).await?;
            return Ok(SessionOutcome::Rejected(code));
        }
    };
    let params = query.session_params()?;
    info!("query for {:?}: mss={}, rwnd={}, fwnd={}", query.name, params.mss, params.rwnd, params.fwnd);

    let image = match store.load(&query.name) {
        Ok(Some(image)) => image,
        Ok(None) => {
            info!("image {:?} not found", query.name);
            send_reply(socket.as_ref(), MetadataReply::NotFound).await?;
            return Ok(SessionOutcome::NotFound);
        }
        Err(e) => {
            warn!("could not load image {:?}: {}", query.name, e);
            send_reply(socket.as_ref(), MetadataReply::NotFound).await?;
            return Ok(SessionOutcome::NotFound);
        }
    };

    if !is_transferable(&image) {
        warn!("image {:?} can not be transferred: {:?} with {} bytes", query.name, image.geometry, image.pixels.len());
        send_reply(socket.as_ref(), MetadataReply::Error(ErrorCode::Generic)).await?;
        return Ok(SessionOutcome::Aborted);
    }

    if !send_metadata_until_acked(socket.as_ref(), &image, config).await? {
        warn!("no handshake ACK for {:?} after {} attempts", query.name, config.max_tries);
        return Ok(SessionOutcome::HandshakeFailed);
    }

    let mut sender = ImageSender::new(socket, params, image.pixels, config, loss);
    let outcome = sender.transfer().await?;
    Ok(SessionOutcome::Transferred(outcome))
}

fn is_transferable(image: &StoredImage) -> bool {
    let img_size = image.geometry.img_size();
    img_size <= MAX_IMAGE_SIZE && img_size == image.pixels.len() as u64
}

async fn send_reply(socket: &dyn DatagramSocket, reply: MetadataReply) -> anyhow::Result<()> {
    let mut buf = BytesMut::with_capacity(MetadataReply::SERIALIZED_LEN);
    reply.ser(&mut buf);
    socket.send_datagram(&buf).await
}

/// Returns `true` once the client acknowledged the image message
async fn send_metadata_until_acked(socket: &dyn DatagramSocket, image: &StoredImage, config: &NetimgConfig) -> anyhow::Result<bool> {
    let mut buf = [0u8; 512];

    for attempt in 1..=config.max_tries {
        debug!("sending image message, attempt {}", attempt);
        send_reply(socket, MetadataReply::Found(image.geometry)).await?;

        let deadline = Instant::now() + config.retransmit_timeout;
        loop {
            let now = Instant::now();
            if now >= deadline || !socket.wait_readable(deadline - now).await? {
                break;
            }
            while let Some(len) = socket.try_recv_datagram(&mut buf)? {
                match Segment::decode(&buf[..len]) {
                    Ok(Segment::Ack { seqn: SYN_SEQ }) => return Ok(true),
                    // e.g. a re-sent query
                    _ => debug!("ignoring datagram of {} bytes during handshake", len),
                }
            }
        }
    }
    Ok(false)
}

/// The image server: serves one client at a time on a single UDP socket. Queries arriving
///  during a session are turned away as busy.
pub struct ImageServer {
    socket: Arc<UdpSocket>,
    store: Arc<dyn ImageStore>,
    config: NetimgConfig,
    num_sessions: u64,
}

impl ImageServer {
    pub fn new(socket: Arc<UdpSocket>, store: Arc<dyn ImageStore>, config: NetimgConfig) -> anyhow::Result<ImageServer> {
        config.validate()?;
        Ok(ImageServer {
            socket,
            store,
            config,
            num_sessions: 0,
        })
    }

    /// Waits for the next datagram on the query port and handles it
    pub async fn handle_query(&mut self) -> anyhow::Result<SessionOutcome> {
        let mut buf = [0u8; 2 * QueryMessage::SERIALIZED_LEN];
        let (len, client) = self.socket.recv_from(&mut buf).await?;
        debug!("received {} bytes from {:?}", len, client);

        // every session gets its own loss pattern, reproducible from the configured seed
        let loss = loss::for_probability(self.config.drop_probability, self.config.seed.wrapping_add(self.num_sessions));
        self.num_sessions += 1;

        let peer = Arc::new(PeerSocket::server(self.socket.clone(), client));
        let outcome = serve_query(peer, &buf[..len], self.store.as_ref(), &self.config, loss).await?;
        info!("session with {:?} ended: {:?}", client, outcome);
        Ok(outcome)
    }

    pub async fn serve(&mut self) -> anyhow::Result<()> {
        info!("serving images on {:?}", self.socket.local_addr()?);
        loop {
            self.handle_query().await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use mockall::predicate::eq;
    use rstest::rstest;
    use crate::config::SessionParams;
    use crate::control_messages::{ImageFormat, ImageGeometry};
    use crate::display::NullDisplay;
    use crate::image_store::InMemoryImageStore;
    use crate::loss::NoLoss;
    use crate::receiver::{query_image, ImageReceiver};
    use crate::socket::{bind_udp_socket, MockDatagramSocket};
    use crate::test_util::memory_socket::MemorySocket;

    fn config() -> NetimgConfig {
        NetimgConfig {
            mss: 1036,
            rwnd: 12,
            fwnd: 4,
            drop_probability: 0.0,
            ..NetimgConfig::new()
        }
    }

    fn params() -> SessionParams {
        config().session_params().unwrap()
    }

    fn geometry() -> ImageGeometry {
        ImageGeometry { depth: 3, format: ImageFormat::Rgb, width: 100, height: 50 }
    }

    fn pixels() -> Vec<u8> {
        (0..15_000).map(|i| (i % 241) as u8).collect()
    }

    fn store() -> InMemoryImageStore {
        let mut store = InMemoryImageStore::new();
        store.insert("ShipatSea.tga", geometry(), pixels());
        // geometry and pixel buffer disagree
        store.insert("broken.tga", geometry(), vec![0u8; 10]);
        store
    }

    fn query(name: &str) -> Vec<u8> {
        let mut buf = BytesMut::new();
        QueryMessage::new(name, &params()).unwrap().ser(&mut buf);
        buf.to_vec()
    }

    fn encoded_reply(reply: MetadataReply) -> Vec<u8> {
        let mut buf = BytesMut::new();
        reply.ser(&mut buf);
        buf.to_vec()
    }

    struct FailingStore;
    impl ImageStore for FailingStore {
        fn load(&self, _name: &str) -> anyhow::Result<Option<StoredImage>> {
            anyhow::bail!("disk on fire")
        }
    }

    #[rstest]
    #[case::wrong_size(query("a.tga")[..100].to_vec(), SessionOutcome::Rejected(ErrorCode::WrongSize))]
    #[case::wrong_version({ let mut q = query("a.tga"); q[0] = 0x10; q }, SessionOutcome::Rejected(ErrorCode::WrongVersion))]
    #[case::wrong_type({ let mut q = query("a.tga"); q[1] = 0x20; q }, SessionOutcome::Rejected(ErrorCode::WrongType))]
    #[case::bad_name(query("../etc/passwd"), SessionOutcome::Rejected(ErrorCode::BadName))]
    #[case::bad_windows({ let mut q = query("a.tga"); q[5] = q[4]; q }, SessionOutcome::Rejected(ErrorCode::Generic))]
    #[case::not_found(query("a.tga"), SessionOutcome::NotFound)]
    #[case::broken_image(query("broken.tga"), SessionOutcome::Aborted)]
    #[tokio::test(start_paused = true)]
    async fn test_single_reply(#[case] datagram: Vec<u8>, #[case] expected: SessionOutcome) {
        let expected_reply = match expected {
            SessionOutcome::Rejected(code) => MetadataReply::Error(code),
            SessionOutcome::Aborted => MetadataReply::Error(ErrorCode::Generic),
            _ => MetadataReply::NotFound,
        };

        let mut socket = MockDatagramSocket::new();
        let reply = encoded_reply(expected_reply);
        socket.expect_send_datagram()
            .once()
            .withf(move |buf| buf == reply.as_slice())
            .returning(|_| Ok(()));

        let outcome = serve_query(Arc::new(socket), &datagram, &store(), &config(), Box::new(NoLoss)).await.unwrap();
        assert_eq!(outcome, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stray_ack_is_ignored() {
        let socket = MockDatagramSocket::new();
        let mut ack = BytesMut::new();
        Segment::Ack { seqn: 5000 }.encode(&mut ack);

        let outcome = serve_query(Arc::new(socket), &ack, &store(), &config(), Box::new(NoLoss)).await.unwrap();
        assert_eq!(outcome, SessionOutcome::Ignored);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_is_not_found() {
        let mut socket = MockDatagramSocket::new();
        let reply = encoded_reply(MetadataReply::NotFound);
        socket.expect_send_datagram()
            .once()
            .withf(move |buf| buf == reply.as_slice())
            .returning(|_| Ok(()));

        let outcome = serve_query(Arc::new(socket), &query("a.tga"), &FailingStore, &config(), Box::new(NoLoss)).await.unwrap();
        assert_eq!(outcome, SessionOutcome::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_without_ack() {
        let mut socket = MockDatagramSocket::new();
        let reply = encoded_reply(MetadataReply::Found(geometry()));
        socket.expect_send_datagram()
            .times(3)
            .withf(move |buf| buf == reply.as_slice())
            .returning(|_| Ok(()));
        socket.expect_wait_readable()
            .times(3)
            .with(eq(Duration::from_millis(1500)))
            .returning(|_| Ok(false));

        let outcome = serve_query(Arc::new(socket), &query("ShipatSea.tga"), &store(), &config(), Box::new(NoLoss)).await.unwrap();
        assert_eq!(outcome, SessionOutcome::HandshakeFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_over_memory_link() {
        let (server_end, client_end) = MemorySocket::pair();
        let server_end: Arc<dyn DatagramSocket> = Arc::new(server_end);
        let client_end: Arc<dyn DatagramSocket> = Arc::new(client_end);
        let store = store();

        let server = async {
            let mut buf = vec![0u8; 1000];
            assert!(server_end.wait_readable(Duration::from_secs(1)).await.unwrap());
            let len = server_end.try_recv_datagram(&mut buf).unwrap().unwrap();
            serve_query(server_end.clone(), &buf[..len], &store, &config(), Box::new(NoLoss)).await.unwrap()
        };

        let client = async {
            let reply = query_image(client_end.as_ref(), &params(), &config(), "ShipatSea.tga").await.unwrap();
            let MetadataReply::Found(geometry) = reply else {
                panic!("unexpected reply {:?}", reply);
            };
            let receiver = ImageReceiver::new(client_end.clone(), geometry, &params(), &config(), Box::new(NoLoss)).unwrap();
            receiver.run(&mut NullDisplay).await.unwrap()
        };

        let (outcome, received) = tokio::join!(server, client);
        assert_eq!(outcome, SessionOutcome::Transferred(TransferOutcome::Completed));
        assert!(received.complete);
        assert_eq!(received.geometry, geometry());
        assert_eq!(received.pixels, pixels());
    }

    #[tokio::test]
    async fn test_server_over_udp() {
        let loopback = "127.0.0.1:0".parse().unwrap();
        let server_socket = Arc::new(bind_udp_socket(loopback, None, Some(1036)).unwrap());
        let server_addr = server_socket.local_addr().unwrap();
        let mut server = ImageServer::new(server_socket, Arc::new(store()), config()).unwrap();

        let client_socket = Arc::new(bind_udp_socket(loopback, Some(config().receive_buffer_size()), None).unwrap());
        let client_end: Arc<dyn DatagramSocket> = Arc::new(PeerSocket::client(client_socket, server_addr));

        let client = async {
            let reply = query_image(client_end.as_ref(), &params(), &config(), "ShipatSea.tga").await.unwrap();
            let MetadataReply::Found(geometry) = reply else {
                panic!("unexpected reply {:?}", reply);
            };
            let receiver = ImageReceiver::new(client_end.clone(), geometry, &params(), &config(), Box::new(NoLoss)).unwrap();
            receiver.run(&mut NullDisplay).await.unwrap()
        };

        let (outcome, received) = tokio::join!(server.handle_query(), client);
        assert_eq!(outcome.unwrap(), SessionOutcome::Transferred(TransferOutcome::Completed));
        assert_eq!(received.pixels, pixels());
    }
}
