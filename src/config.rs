use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;
use crate::frame::Frame;

/// The biggest UDP payload that fits into an IPv4 datagram
pub const MAX_UDP_PAYLOAD: usize = 65_507;

#[derive(Debug, Clone)]
pub struct WindowConfig {
    /// the address the end point's UDP socket is bound to
    pub self_addr: SocketAddr,

    /// This is the number of message bytes carried by a single Data frame, which determines the
    ///  number of fragments (and therefore the negotiated window length) for a given message.
    ///
    /// A frame adds [Frame::CONTROL_FRAME_LEN] bytes to this, and the result should fit into a
    ///  single IP packet on all routes between peers to avoid IP-level fragmentation. With full
    ///  Ethernet frames and no optional IP headers, that is `1500 - 20 - 8 - 9 = 1463` for IPv4.
    pub max_payload_len: usize,

    /// The number of fragments beyond the cursor that are in flight at any given time, and that
    ///  are re-sent on every retransmission tick.
    pub window_size: u32,

    /// The interval of the ticker that re-sends whatever the current state is waiting to have
    ///  acknowledged (size negotiation, unacknowledged fragments, commit / flush)
    pub retransmit_interval: Duration,

    /// The number of consecutive ticks without progress after which the active transfer is
    ///  abandoned (sender side) or the partially received window is discarded (receiver side)
    pub max_retries: u32,

    /// Upper bound for messages per peer that are either in transfer or waiting for the window.
    ///  Enqueueing more messages than this fails.
    pub max_queued_messages: usize,

    /// Upper bound for the window length a peer can request in a size negotiation. Receive slots
    ///  are pre-allocated for the entire window, so this limits per-peer memory.
    pub max_fragments_per_message: u32,

    /// Upper bound for the number of peers that have a window. Windows are never evicted, so
    ///  once this is reached, messages to new peers are rejected and size negotiations from new
    ///  peers are dropped.
    pub max_peers: usize,

    /// Log every frame that is sent or received at TRACE level
    pub trace_frames: bool,
}

impl WindowConfig {
    pub fn new(self_addr: SocketAddr) -> WindowConfig {
        WindowConfig {
            self_addr,
            max_payload_len: 1463,
            window_size: 8,
            retransmit_interval: Duration::from_millis(100),
            max_retries: 50,
            max_queued_messages: 1024,
            max_fragments_per_message: 16 * 1024,
            max_peers: 1024,
            trace_frames: true,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_payload_len == 0 {
            bail!("max payload length must be at least 1");
        }
        if self.max_payload_len + Frame::CONTROL_FRAME_LEN > MAX_UDP_PAYLOAD {
            bail!("max payload length {} does not fit into a UDP datagram", self.max_payload_len);
        }
        if self.window_size == 0 {
            bail!("window size must be at least 1");
        }
        if self.retransmit_interval.is_zero() {
            bail!("retransmit interval must not be zero");
        }
        if self.max_retries == 0 {
            bail!("max retries must be at least 1");
        }
        if self.max_queued_messages == 0 {
            bail!("max queued messages must be at least 1");
        }
        if self.max_fragments_per_message == 0 {
            bail!("max fragments per message must be at least 1");
        }
        if self.max_peers == 0 {
            bail!("max peers must be at least 1");
        }
        Ok(())
    }

    /// The biggest message payload that fits into [WindowConfig::max_fragments_per_message]
    ///  fragments, assuming the peer uses the same configuration
    pub fn max_message_len(&self) -> usize {
        (self.max_fragments_per_message as usize * self.max_payload_len)
            .saturating_sub(size_of::<u32>())
    }
}
