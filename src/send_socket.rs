use std::net::SocketAddr;
use std::sync::Arc;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, error, trace};

/// The outbound side of the UDP socket. This is a trait so that tests can capture datagrams and
///  simulate an unreliable network.
///
/// Sending is fire-and-forget: failures are logged, and the retransmission timer takes care of
///  datagrams that did not make it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]);
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        trace!("UDP socket: sending packet to {:?}", to);

        if let Err(e) = self.send_to(packet_buf, to).await {
            error!("error sending UDP packet to {:?}: {}", to, e);
        }
    }
}

/// Wraps a socket, randomly dropping or corrupting outgoing datagrams. This is for exercising
///  recovery paths in tests and demos, and has no place in production traffic.
pub struct LossySendSocket {
    inner: Arc<dyn SendSocket>,
    drop_rate: f64,
    corrupt_rate: f64,
    rng: Mutex<StdRng>,
}

impl LossySendSocket {
    /// Rates are probabilities in `[0.0, 1.0]`. A fixed seed makes the sequence of dropped and
    ///  corrupted datagrams reproducible.
    pub fn new(inner: Arc<dyn SendSocket>, drop_rate: f64, corrupt_rate: f64, seed: u64) -> LossySendSocket {
        LossySendSocket {
            inner,
            drop_rate: drop_rate.clamp(0.0, 1.0),
            corrupt_rate: corrupt_rate.clamp(0.0, 1.0),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

#[async_trait]
impl SendSocket for LossySendSocket {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        let corrupted = {
            let mut rng = self.rng.lock().await;
            if rng.gen_bool(self.drop_rate) {
                debug!("simulated loss: dropping packet of {} bytes to {:?}", packet_buf.len(), to);
                return;
            }

            if !packet_buf.is_empty() && rng.gen_bool(self.corrupt_rate) {
                let mut corrupted = packet_buf.to_vec();
                let pos = rng.gen_range(0..corrupted.len());
                corrupted[pos] ^= rng.gen_range(1..=u8::MAX);
                debug!("simulated corruption: flipping bits at offset {} of packet to {:?}", pos, to);
                Some(corrupted)
            }
            else {
                None
            }
        };

        match corrupted {
            Some(corrupted) => self.inner.do_send_packet(to, &corrupted).await,
            None => self.inner.do_send_packet(to, packet_buf).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use mockall::predicate::{always, eq};
    use rstest::rstest;
    use tokio::runtime::Builder;

    fn addr() -> SocketAddr {
        SocketAddr::from(([1, 2, 3, 4], 5))
    }

    #[rstest]
    #[case::perfect(0.0, 0.0, 10, 10)]
    #[case::all_lost(1.0, 0.0, 0, 0)]
    #[case::all_corrupted(0.0, 1.0, 10, 0)]
    #[case::lost_wins_over_corrupted(1.0, 1.0, 0, 0)]
    fn test_lossy_send_socket(#[case] drop_rate: f64, #[case] corrupt_rate: f64, #[case] expected_sent: usize, #[case] expected_intact: usize) {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            let packet = [1u8, 2, 3, 4, 5, 6, 7, 8, 9];
            let intact = Arc::new(AtomicUsize::new(0));
            let intact_in_mock = intact.clone();

            let mut inner = MockSendSocket::new();
            inner.expect_do_send_packet()
                .with(eq(addr()), always())
                .times(expected_sent)
                .returning(move |_, buf| {
                    if buf == packet {
                        intact_in_mock.fetch_add(1, Ordering::SeqCst);
                    }
                });

            let socket = LossySendSocket::new(Arc::new(inner), drop_rate, corrupt_rate, 7);
            for _ in 0..10 {
                socket.do_send_packet(addr(), &packet).await;
            }

            assert_eq!(intact.load(Ordering::SeqCst), expected_intact);
        });
    }

    #[test]
    fn test_corruption_changes_exactly_one_byte() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            let packet = vec![0u8; 20];

            let mut inner = MockSendSocket::new();
            inner.expect_do_send_packet()
                .times(50)
                .returning(|_, buf| {
                    assert_eq!(buf.len(), 20);
                    assert_eq!(buf.iter().filter(|&&b| b != 0).count(), 1);
                });

            let socket = LossySendSocket::new(Arc::new(inner), 0.0, 1.0, 3);
            for _ in 0..50 {
                socket.do_send_packet(addr(), &packet).await;
            }
        });
    }

    #[test]
    fn test_partial_loss_is_reproducible() {
        fn num_sent(seed: u64) -> usize {
            let rt = Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async move {
                let sent = Arc::new(AtomicUsize::new(0));
                let sent_in_mock = sent.clone();

                let mut inner = MockSendSocket::new();
                inner.expect_do_send_packet()
                    .returning(move |_, _| { sent_in_mock.fetch_add(1, Ordering::SeqCst); });

                let socket = LossySendSocket::new(Arc::new(inner), 0.5, 0.0, seed);
                for _ in 0..1000 {
                    socket.do_send_packet(addr(), &[1]).await;
                }
                sent.load(Ordering::SeqCst)
            })
        }

        let sent = num_sent(11);
        assert_eq!(sent, num_sent(11));
        assert!(sent > 300 && sent < 700, "{}", sent);
    }
}
