//! Standalone circuit relay daemon
//!
//! Accepts TCP connections, frames them (u32 length prefix per frame) and
//! hands each one to the relay server. Deploy one of these on a publicly
//! reachable host so NATed peers can reserve slots and relay traffic.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use uniconn::{
    Connection, ConnectionKind, PeerId, RelayLimits, RelayServer,
};

/// Largest accepted frame (control messages plus relayed payloads)
const MAX_FRAME: usize = 1024 * 1024;

const FRAME_QUEUE_DEPTH: usize = 64;

/// Circuit relay daemon
#[derive(Parser)]
#[command(name = "uniconn-relay")]
#[command(author, version, about)]
struct Cli {
    /// TCP listen address
    #[arg(short, long, default_value = "0.0.0.0:4521")]
    listen: SocketAddr,

    /// Concurrent reservations served
    #[arg(long, default_value = "128")]
    max_reservations: usize,

    /// Concurrent circuits served
    #[arg(long, default_value = "128")]
    max_circuits: usize,

    /// Concurrent circuits touching a single peer
    #[arg(long, default_value = "8")]
    max_circuits_per_peer: usize,

    /// Reservation TTL (seconds)
    #[arg(long, default_value = "300")]
    reservation_ttl: u64,

    /// Sweep interval for expired reservations and idle circuits (seconds)
    #[arg(long, default_value = "30")]
    sweep_interval: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = cli
        .log_level
        .parse::<Level>()
        .unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to install tracing subscriber")?;

    let limits = RelayLimits {
        max_reservations: cli.max_reservations,
        max_circuits: cli.max_circuits,
        max_circuits_per_peer: cli.max_circuits_per_peer,
        reservation_ttl: Duration::from_secs(cli.reservation_ttl),
        ..RelayLimits::default()
    };
    let local_peer = PeerId::random();
    info!(peer = %local_peer, "relay identity generated");

    let server = RelayServer::new(local_peer, limits);
    server.spawn_sweeper(Duration::from_secs(cli.sweep_interval));

    let listener = TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("failed to bind {}", cli.listen))?;
    info!("relay listening on {}", cli.listen);

    spawn_stats_logger(server.clone());

    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!("accept failed: {}", e);
                continue;
            }
        };
        debug!(%remote, "inbound connection");
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_stream(server, stream, remote).await {
                debug!(%remote, "connection ended: {}", e);
            }
        });
    }
}

/// Bridge a TCP stream into a framed [`Connection`] and serve it
async fn serve_stream(
    server: Arc<RelayServer>,
    stream: TcpStream,
    remote: SocketAddr,
) -> Result<()> {
    let (mut read_half, mut write_half) = stream.into_split();

    let (in_tx, in_rx) = mpsc::channel::<Bytes>(FRAME_QUEUE_DEPTH);
    let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(FRAME_QUEUE_DEPTH);

    // Socket -> frames
    let reader = tokio::spawn(async move {
        let mut buf = BytesMut::new();
        loop {
            match read_frame(&mut read_half, &mut buf).await {
                Ok(Some(frame)) => {
                    if in_tx.send(frame).await.is_err() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    debug!("read error: {}", e);
                    return;
                }
            }
        }
    });

    // Frames -> socket
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if frame.len() > MAX_FRAME {
                warn!("dropping oversized outbound frame ({} bytes)", frame.len());
                continue;
            }
            let len = (frame.len() as u32).to_be_bytes();
            if write_half.write_all(&len).await.is_err()
                || write_half.write_all(&frame).await.is_err()
            {
                return;
            }
        }
        let _ = write_half.shutdown().await;
    });

    // Peer identity arrives in the Hello frame; placeholder until then.
    let conn = Connection::from_parts(
        PeerId::random(),
        remote,
        ConnectionKind::Direct,
        out_tx,
        in_rx,
    );

    let result = server.serve_connection(conn).await;
    reader.abort();
    writer.abort();
    result.map_err(Into::into)
}

/// Read one u32-length-prefixed frame; `None` on clean EOF
async fn read_frame(
    read_half: &mut tokio::net::tcp::OwnedReadHalf,
    buf: &mut BytesMut,
) -> Result<Option<Bytes>> {
    let mut len_bytes = [0u8; 4];
    match read_half.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME {
        anyhow::bail!("frame of {} bytes exceeds limit", len);
    }
    buf.resize(len, 0);
    read_half.read_exact(&mut buf[..]).await?;
    Ok(Some(buf.split_to(len).freeze()))
}

fn spawn_stats_logger(server: Arc<RelayServer>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let stats = server.stats().await;
            info!(
                reservations = stats.active_reservations,
                circuits = stats.active_circuits,
                bytes_relayed = stats.bytes_relayed,
                "relay stats"
            );
        }
    });
}
