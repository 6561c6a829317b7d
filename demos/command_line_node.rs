use clap::Parser;
use clap_derive::Parser;
use sliding_window_udp::config::WindowConfig;
use sliding_window_udp::end_point::EndPoint;
use sliding_window_udp::message::Message;
use sliding_window_udp::message_dispatcher::MessageDispatcher;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tracing::{info, Level};

/// Runs a node that logs every message it receives, and optionally sends a number of messages
///  to a peer, reporting progress until all of them are either delivered or abandoned.
#[derive(Parser)]
struct Args {
    self_address: String,

    #[clap(long)]
    peer: Option<String>,

    #[clap(long, default_value_t = 10)]
    num_messages: u32,

    #[clap(long, default_value_t = 5000)]
    message_size: usize,

    #[clap(long, default_value_t = 1463)]
    max_payload: usize,

    #[clap(long, default_value_t = 8)]
    window_size: u32,

    /// share of sent datagrams that are dropped (half as many are corrupted on top of that)
    #[clap(long, default_value_t = 0.0)]
    loss_rate: f64,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

struct LoggingMessageDispatcher;

#[async_trait]
impl MessageDispatcher for LoggingMessageDispatcher {
    async fn on_message(&self, peer_addr: SocketAddr, message: Message) {
        info!("received {:?} from {:?}", message, peer_addr);
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let mut config = WindowConfig::new(args.self_address.parse()?);
    config.max_payload_len = args.max_payload;
    config.window_size = args.window_size;
    config.trace_frames = args.very_verbose;
    let config = Arc::new(config);

    let dispatcher = Arc::new(LoggingMessageDispatcher);
    let end_point = if args.loss_rate > 0.0 {
        EndPoint::new_lossy(dispatcher, config, args.loss_rate, args.loss_rate / 2.0, rand::random()).await?
    }
    else {
        EndPoint::new(dispatcher, config).await?
    };
    let end_point = Arc::new(end_point);

    let receiving = end_point.clone();
    tokio::spawn(async move { receiving.recv_loop().await });

    if let Some(peer) = args.peer {
        let peer: SocketAddr = peer.parse()?;

        for sequence_id in 0..args.num_messages {
            let payload = vec![(sequence_id % 256) as u8; args.message_size];
            end_point.send_message(peer, Message::new(sequence_id, payload)).await?;
        }

        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if let Some(status) = end_point.peer_status(peer).await {
                info!("{:?}", status);
                if status.completed_messages + status.abandoned_messages >= args.num_messages as u64 {
                    info!("done sending: {} delivered, {} abandoned", status.completed_messages, status.abandoned_messages);
                    break;
                }
            }
        }
    }

    info!("listening on {:?} - press Ctrl-C to stop", end_point.self_addr());
    tokio::signal::ctrl_c().await?;
    Ok(())
}
