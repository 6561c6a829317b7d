use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{trace, warn};
use crate::config::WindowConfig;
use crate::frame::Frame;
use crate::message::Message;
use crate::send_socket::SendSocket;
use crate::window::{Reaction, WindowStateMachine, WindowStatus};

struct PeerWindowInner {
    config: Arc<WindowConfig>,
    peer_addr: SocketAddr,
    /// The lock is held while frames are sent, so that all events for a peer are handled one at a
    ///  time, and the frames for one event go out before the next event is looked at.
    state_machine: Mutex<WindowStateMachine>,
    send_socket: Arc<dyn SendSocket>,
    delivery: mpsc::UnboundedSender<(SocketAddr, Message)>,
}

impl PeerWindowInner {
    async fn send_frames(&self, frames: &[Frame]) {
        for frame in frames {
            if self.config.trace_frames {
                trace!("sending {:?} to {:?}", frame, self.peer_addr);
            }
            self.send_socket.do_send_packet(self.peer_addr, &frame.to_bytes()).await;
        }
    }

    async fn on_tick(&self) {
        let mut state_machine = self.state_machine.lock().await;
        let reaction = state_machine.on_tick();
        self.react(reaction).await;
    }

    /// Hands a delivered message to the dispatch loop before the frames are sent, so it is on its
    ///  way to the application before the commit is acknowledged
    async fn react(&self, reaction: Reaction) {
        if let Some(message) = reaction.delivered {
            if self.delivery.send((self.peer_addr, message)).is_err() {
                warn!("dispatch loop is shut down - dropping message received from {:?}", self.peer_addr);
            }
        }
        self.send_frames(&reaction.frames).await;
    }
}

/// The sliding window for a single peer: it wraps the protocol state machine with a lock, the
///  socket, and a ticker task that drives retransmission.
pub struct PeerWindow {
    inner: Arc<PeerWindowInner>,
    active_handle: Option<JoinHandle<()>>,
}

impl Drop for PeerWindow {
    fn drop(&mut self) {
        if let Some(handle) = self.active_handle.take() {
            handle.abort();
        }
    }
}

impl PeerWindow {
    /// The config must be validated by the caller: the ticker panics on a zero retransmit interval.
    pub(crate) fn new(
        config: Arc<WindowConfig>,
        peer_addr: SocketAddr,
        send_socket: Arc<dyn SendSocket>,
        delivery: mpsc::UnboundedSender<(SocketAddr, Message)>,
    ) -> PeerWindow {
        PeerWindow {
            inner: Arc::new(PeerWindowInner {
                state_machine: Mutex::new(WindowStateMachine::new(config.clone(), peer_addr)),
                config,
                peer_addr,
                send_socket,
                delivery,
            }),
            active_handle: None,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn spawn_active_loop(&mut self) {
        if self.active_handle.is_some() {
            warn!("active loop already spawned");
            return;
        }
        self.active_handle = Some(tokio::spawn(Self::do_loop(self.inner.clone())));
    }

    async fn do_loop(inner: Arc<PeerWindowInner>) {
        let mut retransmit_interval = interval(inner.config.retransmit_interval);
        // a stalled peer must not cause a burst of catch-up ticks
        retransmit_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            retransmit_interval.tick().await;
            inner.on_tick().await;
        }
    }

    /// Queues a message for this peer. If the window is idle, the message's size negotiation is
    ///  sent before this returns.
    pub async fn enqueue_message(&self, message: Message) -> anyhow::Result<()> {
        let mut state_machine = self.inner.state_machine.lock().await;
        let frames = state_machine.enqueue(message)?;
        self.inner.send_frames(&frames).await;
        Ok(())
    }

    /// Handles a frame received from this window's peer
    pub async fn on_frame(&self, frame: Frame) {
        if self.inner.config.trace_frames {
            trace!("received {:?} from {:?}", frame, self.inner.peer_addr);
        }

        let mut state_machine = self.inner.state_machine.lock().await;
        let reaction = state_machine.on_frame(frame);
        self.inner.react(reaction).await;
    }

    pub async fn status(&self) -> WindowStatus {
        self.inner.state_machine.lock().await
            .status()
    }

    /// Discards the active transfer and all queued messages, returning the number of discarded
    ///  messages
    pub async fn cancel(&self) -> usize {
        self.inner.state_machine.lock().await
            .cancel()
    }
}
