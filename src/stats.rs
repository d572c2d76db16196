//! Per-transfer counters, logged when a transfer ends and inspected by tests.

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct SenderStats {
    pub data_segments_sent: u64,
    /// data segments accounted as sent but dropped by the loss simulator
    pub data_segments_dropped: u64,
    pub fec_segments_sent: u64,
    pub fec_segments_dropped: u64,
    /// data segments sent again after going back
    pub retransmitted_segments: u64,
    pub acks_received: u64,
    pub duplicate_acks: u64,
    pub invalid_datagrams: u64,
    /// retransmission timeouts, each of them followed by going back to `snd_una`
    pub go_back_n_rounds: u64,
    pub fin_attempts: u64,
}

impl SenderStats {
    pub fn loss_rate(&self) -> f64 {
        let total = self.data_segments_sent + self.data_segments_dropped + self.fec_segments_sent + self.fec_segments_dropped;
        if total == 0 {
            return 0.0;
        }
        (self.data_segments_dropped + self.fec_segments_dropped) as f64 / total as f64
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ReceiverStats {
    pub data_segments_received: u64,
    pub fec_segments_received: u64,
    pub acks_sent: u64,
    pub acks_dropped: u64,
    /// datagrams that could not be decoded or did not fit into the image
    pub invalid_datagrams: u64,
    pub fin_received: u64,
}

/// Decisions of the receive sequencer
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct SequencerStats {
    pub reconstructions: u64,
    pub go_back_n_entries: u64,
    pub resynchronizations: u64,
    /// segments ignored while waiting for the sender to go back
    pub ignored_in_go_back_n: u64,
    pub stale_segments: u64,
    pub stale_parity: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loss_rate() {
        assert_eq!(SenderStats::default().loss_rate(), 0.0);

        let stats = SenderStats {
            data_segments_sent: 90,
            data_segments_dropped: 5,
            fec_segments_sent: 0,
            fec_segments_dropped: 5,
            ..Default::default()
        };
        assert_eq!(stats.loss_rate(), 0.1);
    }
}
