use std::time::Duration;
use anyhow::bail;
use tracing::warn;
use crate::packet_header::SegmentHeader;

/// Bytes of IP and UDP headers that count against the maximum segment size.
pub const UDP_IP_OVERHEAD: usize = 28;

pub const DEFAULT_MSS: u16 = 10276;
pub const MIN_MSS: u16 = 40;
pub const DEFAULT_RWND: u8 = 12;
pub const DEFAULT_FWND: u8 = 11;

/// Probabilities outside this range are accepted, but they are not useful for demonstrating the
///  recovery paths: below it hardly anything is lost, above it most transfers degenerate into
///  repeated Go-Back-N rounds.
pub const RECOMMENDED_DROP_PROBABILITY: (f64, f64) = (0.011, 0.11);
pub const DEFAULT_DROP_PROBABILITY: f64 = 0.021;

pub const DEFAULT_SEED: u64 = 48916;
pub const DEFAULT_MAX_TRIES: u32 = 3;

/// Largest image (in bytes) whose offsets stay clear of the reserved sequence numbers.
pub const MAX_IMAGE_SIZE: u64 = 0x7fff_ffff;

pub struct NetimgConfig {
    /// Maximum segment size in bytes, *including* segment header and UDP / IP headers.
    pub mss: u16,

    /// This is the receive window in segments. The sender never has more than this many
    ///  segments' worth of bytes unacknowledged.
    pub rwnd: u8,

    /// FEC group size in segments; one parity segment is sent per group. Must be smaller
    ///  than `rwnd`.
    pub fwnd: u8,

    /// Probability of dropping an outgoing DATA / FEC / ACK unit deliberately. A negative value
    ///  turns simulated loss off.
    pub drop_probability: f64,

    /// Seed for the simulated loss, so runs are reproducible
    pub seed: u64,

    /// how long the sender waits for ACK progress before going back to `snd_una`; also the
    ///  wait per attempt for handshake and FIN acknowledgements
    pub retransmit_timeout: Duration,

    pub max_tries: u32,
}

impl NetimgConfig {
    pub fn new() -> NetimgConfig {
        NetimgConfig {
            mss: DEFAULT_MSS,
            rwnd: DEFAULT_RWND,
            fwnd: Self::default_fwnd(DEFAULT_RWND),
            drop_probability: DEFAULT_DROP_PROBABILITY,
            seed: DEFAULT_SEED,
            retransmit_timeout: Duration::from_millis(1500),
            max_tries: DEFAULT_MAX_TRIES,
        }
    }

    /// The FEC window defaults to [DEFAULT_FWND], shrunk if necessary to stay below `rwnd`
    pub fn default_fwnd(rwnd: u8) -> u8 {
        if DEFAULT_FWND >= rwnd {
            rwnd.saturating_sub(1)
        }
        else {
            DEFAULT_FWND
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mss < MIN_MSS {
            bail!("maximum segment size {} is too small, must be at least {}", self.mss, MIN_MSS);
        }
        if self.rwnd < 2 {
            bail!("receive window must be at least 2 segments, was {}", self.rwnd);
        }
        if self.fwnd == 0 || self.fwnd >= self.rwnd {
            bail!("FEC window {} must be between 1 and the receive window {} (exclusive)", self.fwnd, self.rwnd);
        }
        if self.drop_probability > 1.0 || self.drop_probability.is_nan() {
            bail!("drop probability {} is not a probability", self.drop_probability);
        }
        if self.max_tries == 0 {
            bail!("at least one try is required");
        }

        let (min, max) = RECOMMENDED_DROP_PROBABILITY;
        if self.drop_probability > 0.0 && (self.drop_probability < min || self.drop_probability > max) {
            warn!("recommended drop probability is between {} and {}, configured {}", min, max, self.drop_probability);
        }
        Ok(())
    }

    pub fn session_params(&self) -> anyhow::Result<SessionParams> {
        self.validate()?;
        SessionParams::new(self.mss, self.rwnd, self.fwnd)
    }

    /// The socket receive buffer needed to hold a full window of segments
    pub fn receive_buffer_size(&self) -> usize {
        self.rwnd as usize * self.mss as usize
    }
}

impl Default for NetimgConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// The parameters of a single transfer, fixed once the query is processed
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SessionParams {
    pub mss: u16,
    pub rwnd: u8,
    pub fwnd: u8,
    /// payload bytes per segment: `mss` minus segment header and UDP / IP headers
    pub datasize: usize,
}

impl SessionParams {
    pub fn new(mss: u16, rwnd: u8, fwnd: u8) -> anyhow::Result<SessionParams> {
        if mss < MIN_MSS {
            bail!("maximum segment size {} is too small, must be at least {}", mss, MIN_MSS);
        }
        if rwnd < 2 || fwnd == 0 || fwnd >= rwnd {
            bail!("invalid window sizes: rwnd={}, fwnd={}", rwnd, fwnd);
        }

        Ok(SessionParams {
            mss,
            rwnd,
            fwnd,
            datasize: mss as usize - SegmentHeader::SERIALIZED_LEN - UDP_IP_OVERHEAD,
        })
    }

    /// The maximum number of unacknowledged bytes
    pub fn window_bytes(&self) -> usize {
        self.rwnd as usize * self.datasize
    }

    /// The number of bytes covered by one FEC group
    pub fn group_bytes(&self) -> usize {
        self.fwnd as usize * self.datasize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::default(DEFAULT_MSS, 10240)]
    #[case::minimal(MIN_MSS, 4)]
    #[case::ethernet(1500, 1464)]
    fn test_datasize(#[case] mss: u16, #[case] expected: usize) {
        let params = SessionParams::new(mss, 12, 11).unwrap();
        assert_eq!(params.datasize, expected);
        assert_eq!(params.window_bytes(), 12 * expected);
        assert_eq!(params.group_bytes(), 11 * expected);
    }

    #[rstest]
    #[case(12, 11)]
    #[case(11, 10)]
    #[case(2, 1)]
    #[case(255, 11)]
    fn test_default_fwnd(#[case] rwnd: u8, #[case] expected: u8) {
        assert_eq!(NetimgConfig::default_fwnd(rwnd), expected);
    }

    #[rstest]
    #[case::defaults(DEFAULT_MSS, 12, 11, 0.021, true)]
    #[case::mss_too_small(39, 12, 11, 0.021, false)]
    #[case::rwnd_too_small(DEFAULT_MSS, 1, 0, 0.021, false)]
    #[case::fwnd_equals_rwnd(DEFAULT_MSS, 4, 4, 0.021, false)]
    #[case::fwnd_zero(DEFAULT_MSS, 4, 0, 0.021, false)]
    #[case::loss_off(DEFAULT_MSS, 4, 3, -1.0, true)]
    #[case::massive_loss(DEFAULT_MSS, 4, 3, 0.5, true)]
    #[case::not_a_probability(DEFAULT_MSS, 4, 3, 1.5, false)]
    fn test_validate(#[case] mss: u16, #[case] rwnd: u8, #[case] fwnd: u8, #[case] drop_probability: f64, #[case] valid: bool) {
        let config = NetimgConfig {
            mss,
            rwnd,
            fwnd,
            drop_probability,
            ..NetimgConfig::new()
        };
        assert_eq!(config.validate().is_ok(), valid);
    }
}
