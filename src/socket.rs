use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)] use mockall::automock;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, trace};
use crate::control_messages::{ErrorCode, MetadataReply, SYN_QUERY};

/// A datagram endpoint that is bound to a single peer for the duration of a transfer. This is an
///  abstraction over a UDP socket, introduced to facilitate mocking the I/O part away for testing.
///
/// Reading is split into waiting for readiness (with a timeout, the only place where either role
///  suspends) and non-blocking retrieval of a single datagram.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn send_datagram(&self, buf: &[u8]) -> anyhow::Result<()>;

    /// Waits until a datagram is (probably) available. Returns `false` if the timeout expired
    ///  first. Readiness can be spurious, so a subsequent [DatagramSocket::try_recv_datagram] may
    ///  still find nothing.
    async fn wait_readable(&self, timeout: Duration) -> anyhow::Result<bool>;

    /// Retrieves a single datagram if one is ready, without blocking. Datagrams longer than
    ///  `buf` are truncated.
    fn try_recv_datagram(&self, buf: &mut [u8]) -> anyhow::Result<Option<usize>>;
}

/// A UDP socket 'connected' to a peer by filtering: datagrams from other addresses are discarded,
///  and a server socket answers queries from other clients with a 'busy' error.
pub struct PeerSocket {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    reject_foreign_queries: bool,
}

impl PeerSocket {
    pub fn client(socket: Arc<UdpSocket>, server: SocketAddr) -> PeerSocket {
        PeerSocket {
            socket,
            peer: server,
            reject_foreign_queries: false,
        }
    }

    pub fn server(socket: Arc<UdpSocket>, client: SocketAddr) -> PeerSocket {
        PeerSocket {
            socket,
            peer: client,
            reject_foreign_queries: true,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn handle_foreign_datagram(&self, from: SocketAddr, datagram: &[u8]) {
        if self.reject_foreign_queries && datagram.len() >= 2 && datagram[1] == SYN_QUERY {
            debug!("rejecting query from {:?} while serving {:?}", from, self.peer);
            let mut reply = BytesMut::with_capacity(MetadataReply::SERIALIZED_LEN);
            MetadataReply::Error(ErrorCode::Busy).ser(&mut reply);
            if let Err(e) = self.socket.try_send_to(&reply, from) {
                debug!("could not send busy reply to {:?}: {}", from, e);
            }
        }
        else {
            debug!("discarding datagram from {:?}", from);
        }
    }
}

#[async_trait]
impl DatagramSocket for PeerSocket {
    async fn send_datagram(&self, buf: &[u8]) -> anyhow::Result<()> {
        trace!("UDP socket: sending {} bytes to {:?}", buf.len(), self.peer);
        self.socket.send_to(buf, self.peer).await?;
        Ok(())
    }

    async fn wait_readable(&self, timeout: Duration) -> anyhow::Result<bool> {
        match tokio::time::timeout(timeout, self.socket.readable()).await {
            Ok(readiness) => {
                readiness?;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    fn try_recv_datagram(&self, buf: &mut [u8]) -> anyhow::Result<Option<usize>> {
        loop {
            match self.socket.try_recv_from(buf) {
                Ok((len, from)) if from == self.peer => return Ok(Some(len)),
                Ok((len, from)) => self.handle_foreign_datagram(from, &buf[..len]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Creates a non-blocking UDP socket with explicitly sized kernel buffers. A client should have
///  room for a full receive window (`rwnd * mss`), a server for at least one segment.
pub fn bind_udp_socket(addr: SocketAddr, recv_buffer_size: Option<usize>, send_buffer_size: Option<usize>) -> anyhow::Result<UdpSocket> {
    let socket2 = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if let Some(size) = recv_buffer_size {
        socket2.set_recv_buffer_size(size)?;
    }
    if let Some(size) = send_buffer_size {
        // the kernel may round up, never shrink an already larger default
        if socket2.send_buffer_size()? < size {
            socket2.set_send_buffer_size(size)?;
        }
    }
    socket2.set_nonblocking(true)?;
    socket2.bind(&addr.into())?;

    let socket: std::net::UdpSocket = socket2.into();
    debug!("bound UDP socket to {:?}", socket.local_addr()?);
    Ok(UdpSocket::from_std(socket)?)
}
