//! The per-peer protocol engine. This is purely a state machine: it consumes frames, timer ticks
//!  and application messages, and it returns the frames to be sent and the messages to be
//!  delivered. It does no I/O and holds no locks, which is the job of
//!  [crate::peer_window::PeerWindow].
//!
//! A window transfers exactly one message. The sender side goes through
//!
//! ```ascii
//! Idle -> Negotiating -> Transmitting -> CommitFlushing -> Idle
//! ```
//!
//! and the receiver side through `Idle -> Receiving -> Idle`. An instance becomes a sender when a
//!  message is enqueued while it is idle, and a receiver when it receives a size negotiation
//!  while it is idle.
//!
//! Each phase on the sender side repeats its frames on every tick until the expected
//!  acknowledgement arrives, so a lost frame in any direction is healed by the next tick. Data
//!  acknowledgements are cumulative: `Ack(n)` confirms all fragments below `n`.
//!
//! Frames that do not fit the current state are transport noise: they are dropped and logged,
//!  and they never change the state.

use std::collections::VecDeque;
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::bail;
use tracing::{debug, error, trace, warn};
use crate::config::WindowConfig;
use crate::fragmentation::{fragment, reassemble_slots};
use crate::frame::{Frame, FrameKind};
use crate::message::Message;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum WindowState {
    /// no window, ready to either send or receive
    Idle,
    /// sender: waiting for the peer to acknowledge the window length
    Negotiating,
    /// sender: sending fragments, waiting for them to be acknowledged
    Transmitting,
    /// sender: all fragments are acknowledged, waiting for the peer to deliver the message
    CommitFlushing,
    /// receiver: collecting fragments until the peer commits the window
    Receiving,
}

impl WindowState {
    pub fn is_sending(&self) -> bool {
        matches!(self, WindowState::Negotiating | WindowState::Transmitting | WindowState::CommitFlushing)
    }
}

/// What the state machine wants done in response to an event
#[derive(Debug, Default)]
pub struct Reaction {
    /// to be sent to the peer, in this order
    pub frames: Vec<Frame>,
    /// a message that was completely received and committed
    pub delivered: Option<Message>,
}

impl Reaction {
    fn send(frames: Vec<Frame>) -> Reaction {
        Reaction {
            frames,
            delivered: None,
        }
    }

    fn reply(frame: Frame) -> Reaction {
        Self::send(vec![frame])
    }
}

/// A snapshot of a window's state, for monitoring and for detecting stalled transfers
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct WindowStatus {
    pub state: WindowState,
    pub cursor: u32,
    pub window_len: u32,
    /// messages waiting for the window, not counting the one in transfer
    pub queued_messages: usize,
    /// number of consecutive ticks without progress in the current state
    pub ticks_without_progress: u32,
    /// messages that were acknowledged by the peer as delivered
    pub completed_messages: u64,
    /// messages that were given up on because the peer stopped responding
    pub abandoned_messages: u64,
    /// messages that were received and handed to the application
    pub delivered_messages: u64,
    /// partially received windows that were discarded because the peer stopped sending
    pub discarded_windows: u64,
    pub dropped_frames: u64,
}

pub struct WindowStateMachine {
    config: Arc<WindowConfig>,
    peer_addr: SocketAddr,

    state: WindowState,
    /// Indexed by fragment index. On the sender side, all slots are filled with the active
    ///  message's fragments; on the receiver side, slots are filled as fragments arrive.
    ///
    /// NB: This is empty exactly when the state is [WindowState::Idle]
    slots: Vec<Option<Frame>>,
    /// All fragments *below* the cursor are confirmed: acknowledged by the peer on the sender
    ///  side, received without gaps on the receiver side
    cursor: u32,
    /// messages waiting for the window to become free, fragmented only when they become active
    queue: VecDeque<Message>,
    ticks_without_progress: u32,
    /// the length of the last receive window that was delivered, as long as no other receive
    ///  window was started or discarded since. A repeated commit is acknowledged only for this.
    last_committed: Option<u32>,

    completed_messages: u64,
    abandoned_messages: u64,
    delivered_messages: u64,
    discarded_windows: u64,
    dropped_frames: u64,
}

impl WindowStateMachine {
    pub fn new(config: Arc<WindowConfig>, peer_addr: SocketAddr) -> WindowStateMachine {
        WindowStateMachine {
            config,
            peer_addr,
            state: WindowState::Idle,
            slots: Vec::new(),
            cursor: 0,
            queue: VecDeque::new(),
            ticks_without_progress: 0,
            last_committed: None,
            completed_messages: 0,
            abandoned_messages: 0,
            delivered_messages: 0,
            discarded_windows: 0,
            dropped_frames: 0,
        }
    }

    pub fn state(&self) -> WindowState {
        self.state
    }

    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    pub fn window_len(&self) -> u32 {
        // slots are sized from a u32 descriptor, or from a fragment count checked in fragment()
        self.slots.len() as u32
    }

    /// the number of messages waiting or in transfer on the sender side
    pub fn num_pending_messages(&self) -> usize {
        self.queue.len() + usize::from(self.state.is_sending())
    }

    pub fn status(&self) -> WindowStatus {
        WindowStatus {
            state: self.state,
            cursor: self.cursor,
            window_len: self.window_len(),
            queued_messages: self.queue.len(),
            ticks_without_progress: self.ticks_without_progress,
            completed_messages: self.completed_messages,
            abandoned_messages: self.abandoned_messages,
            delivered_messages: self.delivered_messages,
            discarded_windows: self.discarded_windows,
            dropped_frames: self.dropped_frames,
        }
    }

    /// Adds a message to the outbound queue. If the window is idle, the message becomes active
    ///  right away, and the returned frames start its size negotiation.
    ///
    /// This fails if the queue is full, or if the message is too big for a window - in both cases
    ///  the message is not queued.
    pub fn enqueue(&mut self, message: Message) -> anyhow::Result<Vec<Frame>> {
        if message.payload.len() > self.config.max_message_len() {
            bail!("message of {} bytes exceeds the maximum message length of {} bytes", message.payload.len(), self.config.max_message_len());
        }
        if self.num_pending_messages() >= self.config.max_queued_messages {
            bail!("outbound queue for {:?} is full ({} messages)", self.peer_addr, self.num_pending_messages());
        }

        trace!("queueing {:?} for {:?}", message, self.peer_addr);
        self.queue.push_back(message);

        if self.state == WindowState::Idle {
            Ok(self.start_next_message())
        }
        else {
            Ok(Vec::new())
        }
    }

    /// Discards the active transfer and all queued messages, returning the state machine to
    ///  [WindowState::Idle]. Returns the number of discarded outbound messages; a receive window
    ///  in progress is counted in [WindowStatus::discarded_windows] and is never acknowledged.
    pub fn cancel(&mut self) -> usize {
        let num_discarded = self.num_pending_messages();
        debug!("cancelling window with {:?} in state {:?}, discarding {} outbound messages", self.peer_addr, self.state, num_discarded);

        if self.state == WindowState::Receiving {
            self.discarded_windows += 1;
        }
        self.last_committed = None;

        self.queue.clear();
        self.clear_window();
        num_discarded
    }

    /// Called by the retransmission timer: returns the frames to be re-sent in the current state.
    ///
    /// Ticks also drive the retry limit. If the current phase makes no progress for more than
    ///  `max_retries` ticks, the active message is abandoned (sender), or the receive window is
    ///  discarded. A receive window that is complete is delivered instead, which is the only way a
    ///  tick can deliver a message.
    pub fn on_tick(&mut self) -> Reaction {
        if self.state == WindowState::Idle {
            return Reaction::default();
        }

        self.ticks_without_progress += 1;
        if self.ticks_without_progress > self.config.max_retries {
            return self.give_up();
        }

        match self.state {
            WindowState::Negotiating => Reaction::reply(self.size_negotiate_frame()),
            WindowState::Transmitting => Reaction::send(self.frames_in_range(self.cursor, self.send_window_end())),
            WindowState::CommitFlushing => Reaction::reply(self.commit_flush_frame()),
            WindowState::Receiving | WindowState::Idle => Reaction::default(),
        }
    }

    /// Handles a frame received from the peer. The frame's checksum has been verified at this
    ///  point.
    pub fn on_frame(&mut self, frame: Frame) -> Reaction {
        match (self.state, frame.kind) {
            (WindowState::Negotiating, FrameKind::SizeNegotiateAck) => self.on_size_negotiate_ack(frame),
            (WindowState::Transmitting, FrameKind::Ack) => self.on_ack(frame),
            (WindowState::CommitFlushing, FrameKind::CommitFlushAck) => self.on_commit_flush_ack(frame),
            (WindowState::Idle, FrameKind::SizeNegotiate) => self.on_size_negotiate(frame),
            (WindowState::Receiving, FrameKind::SizeNegotiate) => self.on_size_negotiate_while_receiving(frame),
            (WindowState::Receiving, FrameKind::Data) => self.on_data(frame),
            (WindowState::Receiving, FrameKind::CommitFlush) => self.on_commit_flush(frame),
            (WindowState::Idle, FrameKind::CommitFlush) => self.on_commit_flush_while_idle(frame),
            (state, _) => self.drop_frame(&frame, format_args!("unexpected in state {:?}", state)),
        }
    }

    fn on_commit_flush_while_idle(&mut self, frame: Frame) -> Reaction {
        if self.last_committed != Some(frame.descriptor) {
            return self.drop_frame(&frame, "commit for a window that was not delivered");
        }

        // the window was delivered, but our acknowledgement got lost
        trace!("repeating commit acknowledgement {} for {:?}", frame.descriptor, self.peer_addr);
        Reaction::reply(Frame::control(FrameKind::CommitFlushAck, frame.descriptor))
    }

    fn on_size_negotiate_ack(&mut self, frame: Frame) -> Reaction {
        if frame.descriptor != self.window_len() {
            return self.drop_frame(&frame, format_args!("window length mismatch, negotiating {}", self.window_len()));
        }

        debug!("{:?} acknowledged window length {}, transmitting", self.peer_addr, frame.descriptor);
        self.state = WindowState::Transmitting;
        self.ticks_without_progress = 0;
        Reaction::send(self.frames_in_range(self.cursor, self.send_window_end()))
    }

    fn on_ack(&mut self, frame: Frame) -> Reaction {
        let window_len = self.window_len();
        if frame.descriptor > window_len {
            return self.drop_frame(&frame, format_args!("ack beyond window length {}", window_len));
        }
        if frame.descriptor <= self.cursor {
            trace!("ack {} from {:?} does not advance cursor {}", frame.descriptor, self.peer_addr, self.cursor);
            return Reaction::default();
        }

        let previous_window_end = self.send_window_end();
        self.cursor = frame.descriptor;
        self.ticks_without_progress = 0;

        if self.cursor == window_len {
            debug!("all {} fragments acknowledged by {:?}, committing", window_len, self.peer_addr);
            self.state = WindowState::CommitFlushing;
            return Reaction::reply(self.commit_flush_frame());
        }

        // send the fragments that the advanced cursor moved into the window
        Reaction::send(self.frames_in_range(previous_window_end.max(self.cursor), self.send_window_end()))
    }

    fn on_commit_flush_ack(&mut self, frame: Frame) -> Reaction {
        if frame.descriptor != self.window_len() {
            return self.drop_frame(&frame, format_args!("terminal marker does not match window length {}", self.window_len()));
        }

        debug!("{:?} committed window of {} fragments", self.peer_addr, self.window_len());
        self.completed_messages += 1;
        self.clear_window();
        Reaction::send(self.start_next_message())
    }

    fn on_size_negotiate(&mut self, frame: Frame) -> Reaction {
        debug_assert_eq!(self.state, WindowState::Idle);

        let requested = frame.descriptor;
        if requested == 0 {
            return self.drop_frame(&frame, "empty window requested");
        }
        let max_fragments = self.config.max_fragments_per_message;
        if requested > max_fragments {
            return self.drop_frame(&frame, format_args!("window length exceeds the maximum of {}", max_fragments));
        }

        debug!("receiving window of {} fragments from {:?}", requested, self.peer_addr);
        self.last_committed = None;
        self.slots = vec![None; requested as usize];
        self.cursor = 0;
        self.state = WindowState::Receiving;
        self.ticks_without_progress = 0;
        Reaction::reply(Frame::control(FrameKind::SizeNegotiateAck, requested))
    }

    /// The sender only starts a new negotiation after it considers the previous window committed,
    ///  so a size negotiation in the middle of a window is either a repetition (our
    ///  acknowledgement got lost) or the start of the sender's next window.
    fn on_size_negotiate_while_receiving(&mut self, frame: Frame) -> Reaction {
        let window_len = self.window_len();

        if self.slots.iter().all(Option::is_none) {
            if frame.descriptor == window_len {
                trace!("repeating size acknowledgement {} for {:?}", window_len, self.peer_addr);
                return Reaction::reply(Frame::control(FrameKind::SizeNegotiateAck, window_len));
            }
            debug!("{:?} renegotiated window length from {} to {} before sending data", self.peer_addr, window_len, frame.descriptor);
            self.clear_window();
            return self.on_size_negotiate(frame);
        }

        if self.cursor == window_len {
            // The window is complete, and the sender moved on without our commit. A complete
            //  window is exactly the message, so it is safe to deliver it now.
            debug!("{:?} started a new window before committing a complete one - delivering it", self.peer_addr);
            let delivered = self.commit_received_window();
            let mut reaction = self.on_size_negotiate(frame);
            reaction.delivered = delivered;
            return reaction;
        }

        if frame.descriptor == window_len {
            return self.drop_frame(&frame, "repeated size negotiation for a window in progress");
        }

        warn!("{:?} started a window of length {} while {} of {} fragments were received - discarding the partial window", self.peer_addr, frame.descriptor, self.cursor, window_len);
        self.discarded_windows += 1;
        self.clear_window();
        self.on_size_negotiate(frame)
    }

    fn on_data(&mut self, frame: Frame) -> Reaction {
        let window_len = self.window_len();
        if frame.descriptor >= window_len {
            return self.drop_frame(&frame, format_args!("fragment index beyond window length {}", window_len));
        }

        self.ticks_without_progress = 0;

        // overwriting is idempotent for repeated fragments
        let index = frame.descriptor as usize;
        self.slots[index] = Some(frame);

        while self.cursor < window_len && self.slots[self.cursor as usize].is_some() {
            self.cursor += 1;
        }

        Reaction::reply(Frame::control(FrameKind::Ack, self.cursor))
    }

    fn on_commit_flush(&mut self, frame: Frame) -> Reaction {
        let window_len = self.window_len();
        if frame.descriptor != window_len {
            return self.drop_frame(&frame, format_args!("terminal marker does not match window length {}", window_len));
        }
        let cursor = self.cursor;
        if cursor < window_len {
            return self.drop_frame(&frame, format_args!("commit for incomplete window, {} of {} fragments received", cursor, window_len));
        }

        let delivered = self.commit_received_window();

        let mut frames = vec![Frame::control(FrameKind::CommitFlushAck, window_len)];
        frames.extend(self.start_next_message());
        Reaction {
            frames,
            delivered,
        }
    }

    /// reassembles the (complete) receive window and returns to Idle
    fn commit_received_window(&mut self) -> Option<Message> {
        let result = match reassemble_slots(&self.slots) {
            Ok(message) => {
                debug!("received {:?} from {:?}", message, self.peer_addr);
                self.delivered_messages += 1;
                self.last_committed = Some(self.window_len());
                Some(message)
            }
            Err(e) => {
                error!("this is a bug: committing a window from {:?} failed - discarding it: {}", self.peer_addr, e);
                self.discarded_windows += 1;
                self.last_committed = None;
                None
            }
        };
        self.clear_window();
        result
    }

    fn give_up(&mut self) -> Reaction {
        let mut delivered = None;

        if self.state == WindowState::Receiving {
            if self.cursor == self.window_len() {
                // all commits were lost, but the peer may still see our acknowledgement of a
                //  repeated one after we are back to Idle
                debug!("no commit from {:?} for {} ticks, but the window is complete - delivering it", self.peer_addr, self.config.max_retries);
                delivered = self.commit_received_window();
            }
            else {
                warn!("no data from {:?} for {} ticks - discarding window with {} of {} fragments", self.peer_addr, self.config.max_retries, self.cursor, self.window_len());
                self.discarded_windows += 1;
                self.last_committed = None;
            }
        }
        else {
            warn!("no response from {:?} for {} ticks in state {:?} - abandoning message", self.peer_addr, self.config.max_retries, self.state);
            self.abandoned_messages += 1;
        }

        self.clear_window();
        Reaction {
            frames: self.start_next_message(),
            delivered,
        }
    }

    /// Activates the next queued message if there is one. This must only be called when idle.
    fn start_next_message(&mut self) -> Vec<Frame> {
        debug_assert_eq!(self.state, WindowState::Idle);

        while let Some(message) = self.queue.pop_front() {
            match fragment(&message, self.config.max_payload_len) {
                Ok(fragments) => {
                    debug!("negotiating window of {} fragments for {:?} with {:?}", fragments.len(), message, self.peer_addr);
                    self.slots = fragments.into_iter().map(Some).collect();
                    self.cursor = 0;
                    self.state = WindowState::Negotiating;
                    self.ticks_without_progress = 0;
                    return vec![self.size_negotiate_frame()];
                }
                Err(e) => {
                    warn!("dropping {:?} for {:?}: {}", message, self.peer_addr, e);
                    self.abandoned_messages += 1;
                }
            }
        }
        Vec::new()
    }

    fn clear_window(&mut self) {
        self.slots.clear();
        self.cursor = 0;
        self.state = WindowState::Idle;
        self.ticks_without_progress = 0;
    }

    fn send_window_end(&self) -> u32 {
        self.cursor
            .saturating_add(self.config.window_size)
            .min(self.window_len())
    }

    fn frames_in_range(&self, from: u32, to: u32) -> Vec<Frame> {
        if from >= to {
            return Vec::new();
        }
        self.slots[from as usize..to as usize].iter()
            .flatten()
            .cloned()
            .collect()
    }

    fn size_negotiate_frame(&self) -> Frame {
        Frame::control(FrameKind::SizeNegotiate, self.window_len())
    }

    fn commit_flush_frame(&self) -> Frame {
        Frame::control(FrameKind::CommitFlush, self.window_len())
    }

    fn drop_frame(&mut self, frame: &Frame, reason: impl Display) -> Reaction {
        self.dropped_frames += 1;
        debug!("dropping {:?} from {:?} in state {:?}: {}", frame, self.peer_addr, self.state, reason);
        Reaction::default()
    }
}
