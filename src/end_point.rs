use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, span, warn, Instrument, Level};
use uuid::Uuid;
use crate::config::{WindowConfig, MAX_UDP_PAYLOAD};
use crate::frame::{Frame, FrameKind};
use crate::message::Message;
use crate::message_dispatcher::{spawn_dispatch_loop, MessageDispatcher};
use crate::peer_table::PeerTable;
use crate::send_socket::{LossySendSocket, SendSocket};
use crate::window::WindowStatus;

/// EndPoint is where all parts of the protocol come together: It owns the UDP socket, dispatches
///  incoming datagrams to the windows of their peers, and has an API for application code to
///  send messages.
///
/// Received messages are passed to the [MessageDispatcher]. Application code must call
///  [EndPoint::recv_loop] (typically in a spawned task) for anything to be received.
pub struct EndPoint {
    config: Arc<WindowConfig>,
    socket: Arc<UdpSocket>,
    self_addr: SocketAddr,
    peer_table: PeerTable,
    dispatch_handle: JoinHandle<()>,
}

impl Drop for EndPoint {
    fn drop(&mut self) {
        self.dispatch_handle.abort();
    }
}

impl EndPoint {
    pub async fn new(message_dispatcher: Arc<dyn MessageDispatcher>, config: Arc<WindowConfig>) -> anyhow::Result<EndPoint> {
        Self::bind(message_dispatcher, config, |socket| socket).await
    }

    /// Creates an end point that randomly drops and corrupts a share of the datagrams it sends.
    ///  This is for testing recovery from loss, and should never be used for production traffic.
    pub async fn new_lossy(message_dispatcher: Arc<dyn MessageDispatcher>, config: Arc<WindowConfig>, drop_rate: f64, corrupt_rate: f64, seed: u64) -> anyhow::Result<EndPoint> {
        Self::bind(message_dispatcher, config, |socket| {
            let lossy: Arc<dyn SendSocket> = Arc::new(LossySendSocket::new(socket, drop_rate, corrupt_rate, seed));
            lossy
        }).await
    }

    async fn bind(
        message_dispatcher: Arc<dyn MessageDispatcher>,
        config: Arc<WindowConfig>,
        wrap_send_socket: impl FnOnce(Arc<dyn SendSocket>) -> Arc<dyn SendSocket>,
    ) -> anyhow::Result<EndPoint> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(config.self_addr).await?);
        let self_addr = socket.local_addr()?;
        info!("bound socket to {:?}", self_addr);

        let send_socket = wrap_send_socket(Arc::new(socket.clone()));
        let (delivery, dispatch_handle) = spawn_dispatch_loop(message_dispatcher);

        Ok(EndPoint {
            peer_table: PeerTable::new(config.clone(), send_socket, delivery),
            config,
            socket,
            self_addr,
            dispatch_handle,
        })
    }

    /// the actual address the socket is bound to, with the port resolved if it was configured as 0
    pub fn self_addr(&self) -> SocketAddr {
        self.self_addr
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    /// Queues a message for a peer. This returns once the message is queued, not when it is
    ///  delivered; it fails if the peer's queue is full or the message is too big for a window.
    pub async fn send_message(&self, to: SocketAddr, message: Message) -> anyhow::Result<()> {
        debug!("sending {:?} to {:?}", message, to);
        self.peer_table.get_or_create(to).await?
            .enqueue_message(message).await
    }

    /// a snapshot of the window for a peer, or `None` if there was never any traffic with it
    pub async fn peer_status(&self, peer_addr: SocketAddr) -> Option<WindowStatus> {
        match self.peer_table.get(&peer_addr).await {
            Some(window) => Some(window.status().await),
            None => None,
        }
    }

    /// Discards the transfer in progress and all queued messages for a peer, returning the number
    ///  of discarded messages
    pub async fn cancel(&self, peer_addr: SocketAddr) -> usize {
        match self.peer_table.get(&peer_addr).await {
            Some(window) => window.cancel().await,
            None => 0,
        }
    }

    pub async fn peers(&self) -> Vec<SocketAddr> {
        self.peer_table.peers().await
    }

    pub async fn recv_loop(&self) {
        info!("starting receive loop");

        let mut buf = vec![0u8; MAX_UDP_PAYLOAD];
        loop {
            let (num_read, from) = match self.socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "datagram_received", ?correlation_id);

            self.on_datagram(from, &buf[..num_read])
                .instrument(span)
                .await;
        }
    }

    async fn on_datagram(&self, from: SocketAddr, datagram: &[u8]) {
        let frame = match Frame::deser(datagram) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("dropping datagram of {} bytes from {:?}: {}", datagram.len(), from, e);
                return;
            }
        };

        if let Some(window) = self.peer_table.get(&from).await {
            window.on_frame(frame).await;
            return;
        }

        // a new window starts out Idle, and a size negotiation is the only frame it accepts
        if frame.kind != FrameKind::SizeNegotiate {
            debug!("dropping {:?} from unknown peer {:?}", frame.kind, from);
            return;
        }
        match self.peer_table.get_or_create(from).await {
            Ok(window) => window.on_frame(frame).await,
            Err(e) => warn!("dropping size negotiation: {}", e),
        }
    }
}
