use std::net::SocketAddr;
use std::sync::Arc;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, RwLock};
use anyhow::bail;
use tracing::debug;
use crate::config::WindowConfig;
use crate::message::Message;
use crate::peer_window::PeerWindow;
use crate::send_socket::SendSocket;

/// The registry of per-peer windows, keyed by the peer's socket address. Windows are created
///  lazily, on the first message to or the first size negotiation from a peer, and they live as
///  long as the table. The number of windows is bounded by [WindowConfig::max_peers].
pub struct PeerTable {
    config: Arc<WindowConfig>,
    send_socket: Arc<dyn SendSocket>,
    delivery: mpsc::UnboundedSender<(SocketAddr, Message)>,
    windows: RwLock<FxHashMap<SocketAddr, Arc<PeerWindow>>>,
}

impl PeerTable {
    /// The config must be validated by the caller.
    pub(crate) fn new(config: Arc<WindowConfig>, send_socket: Arc<dyn SendSocket>, delivery: mpsc::UnboundedSender<(SocketAddr, Message)>) -> PeerTable {
        PeerTable {
            config,
            send_socket,
            delivery,
            windows: Default::default(),
        }
    }

    pub async fn get(&self, peer_addr: &SocketAddr) -> Option<Arc<PeerWindow>> {
        self.windows.read().await
            .get(peer_addr)
            .cloned()
    }

    pub async fn get_or_create(&self, peer_addr: SocketAddr) -> anyhow::Result<Arc<PeerWindow>> {
        if let Some(window) = self.get(&peer_addr).await {
            return Ok(window);
        }

        let mut windows = self.windows.write().await;
        // some other task may have created it while we were waiting for the write lock
        if let Some(window) = windows.get(&peer_addr) {
            return Ok(window.clone());
        }
        if windows.len() >= self.config.max_peers {
            bail!("no window for {:?}: the limit of {} peers is reached", peer_addr, self.config.max_peers);
        }

        debug!("creating window for peer {:?}", peer_addr);
        let mut window = PeerWindow::new(self.config.clone(), peer_addr, self.send_socket.clone(), self.delivery.clone());
        window.spawn_active_loop();

        let window = Arc::new(window);
        windows.insert(peer_addr, window.clone());
        Ok(window)
    }

    pub async fn peers(&self) -> Vec<SocketAddr> {
        self.windows.read().await
            .keys()
            .cloned()
            .collect()
    }
}
