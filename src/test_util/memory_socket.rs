use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::Notify;
use crate::socket::DatagramSocket;

#[derive(Default)]
struct Channel {
    queue: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
}

impl Channel {
    fn queue(&self) -> MutexGuard<'_, VecDeque<Vec<u8>>> {
        // a panicking test thread must not take the other end down with it
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One end of an in-memory, lossless, order-preserving datagram link. Loss is injected by the
///  protocol's loss simulators, not by the link.
pub struct MemorySocket {
    inbound: Arc<Channel>,
    outbound: Arc<Channel>,
}

impl MemorySocket {
    /// Creates two connected ends: what one sends, the other receives
    pub fn pair() -> (MemorySocket, MemorySocket) {
        let a_to_b = Arc::new(Channel::default());
        let b_to_a = Arc::new(Channel::default());

        (
            MemorySocket { inbound: b_to_a.clone(), outbound: a_to_b.clone() },
            MemorySocket { inbound: a_to_b, outbound: b_to_a },
        )
    }

    /// The number of datagrams waiting to be received on this end
    pub fn num_pending(&self) -> usize {
        self.inbound.queue().len()
    }
}

#[async_trait]
impl DatagramSocket for MemorySocket {
    async fn send_datagram(&self, buf: &[u8]) -> anyhow::Result<()> {
        self.outbound.queue().push_back(buf.to_vec());
        self.outbound.notify.notify_one();
        Ok(())
    }

    async fn wait_readable(&self, timeout: Duration) -> anyhow::Result<bool> {
        let notified = self.inbound.notify.notified();
        if !self.inbound.queue().is_empty() {
            return Ok(true);
        }
        Ok(tokio::time::timeout(timeout, notified).await.is_ok())
    }

    fn try_recv_datagram(&self, buf: &mut [u8]) -> anyhow::Result<Option<usize>> {
        match self.inbound.queue().pop_front() {
            Some(datagram) => {
                let len = datagram.len().min(buf.len());
                buf[..len].copy_from_slice(&datagram[..len]);
                Ok(Some(len))
            }
            None => Ok(None),
        }
    }
}
