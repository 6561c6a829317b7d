use std::net::SocketAddr;
use std::sync::Arc;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use crate::message::Message;

/// The application's inbound side: receives every completely received message, exactly once and
///  in the order its peer sent it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn on_message(&self, peer_addr: SocketAddr, message: Message);
}

/// Decouples delivery from the receive path: peer windows push delivered messages into the
///  channel while holding their lock, and a separate task calls the (potentially slow)
///  application code.
pub fn spawn_dispatch_loop(message_dispatcher: Arc<dyn MessageDispatcher>) -> (mpsc::UnboundedSender<(SocketAddr, Message)>, JoinHandle<()>) {
    let (sender, mut receiver) = mpsc::unbounded_channel::<(SocketAddr, Message)>();

    let handle = tokio::spawn(async move {
        while let Some((peer_addr, message)) = receiver.recv().await {
            trace!("dispatching {:?} from {:?}", message, peer_addr);
            message_dispatcher.on_message(peer_addr, message).await;
        }
        debug!("all senders are closed, shutting down dispatch loop");
    });

    (sender, handle)
}
