//! A sliding-window ARQ (automatic repeat request) protocol over UDP, transferring whole
//!  application messages reliably between peers.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (i.e. defined-length chunks of data as
//!   opposed to streams of bytes). Messages are delivered completely and exactly once, or not at
//!   all.
//! * The protocol is peer-to-peer: each node has a single UDP socket, and every peer address gets
//!   a window of its own
//! * Big messages are fragmented to avoid IP-level fragmentation, with a configured payload size
//!   per datagram
//! * Every datagram carries a CRC-32, and anything that fails to parse is dropped silently. The
//!   protocol relies on retransmission rather than on negative acknowledgements.
//! * Messages to a peer are transferred one at a time, each in a window of its own, so they are
//!   delivered in the order they were sent
//! * Explicitly *not* a congestion-controlled, encrypted or connection-oriented transport. There is
//!   no handshake beyond the per-message size negotiation.
//!
//! ## Frame format
//!
//! Each UDP datagram holds exactly one frame. All numbers are in network byte order (BE):
//!
//! ```ascii
//! 0: kind (u8)
//!    * 0 Data
//!    * 1 Ack
//!    * 2 SizeNegotiate
//!    * 3 SizeNegotiateAck
//!    * 4 CommitFlush
//!    * 5 CommitFlushAck
//! 1: descriptor (u32) - fragment index (Data), cumulative ack (Ack), window length (all others)
//! 5: payload - Data frames only, 1 to `max_payload_len` bytes
//! *: CRC-32 (ISO-HDLC, i.e. the one used by Ethernet and zip) of all preceding bytes (u32)
//! ```
//!
//! A message is transferred as the byte stream `sequence id (u32) | payload`, split into Data frames
//!  of at most `max_payload_len` bytes. Fragment `i` carries descriptor `i`.
//!
//! ## Transfer of a message
//!
//! ```ascii
//! sender                               receiver
//!   SizeNegotiate(n)          -->
//!                             <--      SizeNegotiateAck(n)
//!   Data(0), Data(1), ...     -->
//!                             <--      Ack(k)  (all fragments below k are there)
//!   ...
//!   CommitFlush(n)            -->
//!                                      (message is delivered to the application)
//!                             <--      CommitFlushAck(n)
//! ```
//!
//! The sender keeps up to `window_size` fragments beyond the acknowledged cursor in flight. On
//!  every tick of the retransmission timer it re-sends whatever it is currently waiting to have
//!  acknowledged, so loss in either direction is healed by the sender alone. If a phase makes no
//!  progress for `max_retries` ticks, the message is abandoned. A receiver that hears nothing for
//!  as long discards its incomplete window, or delivers it if it is complete.
//!
//! Duplicate frames are harmless: fragments are stored idempotently, acks never move the cursor
//!  back, and repeated negotiation and commit frames are acknowledged again.
//!
//! NB: The frame format has no window generation, so a frame that is delayed by a full window
//!  transfer can be mistaken for a frame of the current window. The protocol is meant for networks
//!  that do not reorder datagrams by that much.

pub mod config;
pub mod end_point;
pub mod fragmentation;
pub mod frame;
pub mod message;
pub mod message_dispatcher;
pub mod peer_table;
pub mod peer_window;
pub mod send_socket;
pub mod window;
