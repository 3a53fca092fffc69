use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use quinn::Endpoint;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{Level, debug, info, warn};

use dispelproto::relay::ALPN;
use dispelproto::relay::DEFAULT_SECRET;
use dispelproto::relay::FrameSigner;
use dispelproto::relay::PacketType;
use dispelproto::relay::RelayPacket;
use netplane::relay::read_packet;
use netplane::relay::write_packet;

mod rooms;

use rooms::Outbox;
use rooms::Rooms;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const MAX_IDLE: Duration = Duration::from_secs(300);

#[derive(Clone, Debug)]
struct Config {
    bind: SocketAddr,
    secret: String,
    console_addr: Option<String>,
}

fn usage_and_exit() -> ! {
    eprintln!(
        "relayd\n\n\
USAGE:\n  relayd [--bind HOST:PORT] [--relay-secret KEY] [--console-addr URL]\n\n\
ENV:\n  RELAY_BIND    default 0.0.0.0:2139\n  RELAY_SECRET  signing key for the relay wire\n  CONSOLE_ADDR  optional, reconciles transport leaves with the lobby\n"
    );
    std::process::exit(2);
}

fn parse_args() -> Config {
    let mut bind: SocketAddr = std::env::var("RELAY_BIND")
        .unwrap_or_else(|_| "0.0.0.0:2139".to_string())
        .parse()
        .unwrap_or_else(|_| usage_and_exit());
    let mut secret = std::env::var("RELAY_SECRET").unwrap_or_else(|_| DEFAULT_SECRET.to_string());
    let mut console_addr = std::env::var("CONSOLE_ADDR").ok();

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--bind" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                bind = v.parse().unwrap_or_else(|_| usage_and_exit());
            }
            "--relay-secret" => {
                secret = it.next().unwrap_or_else(|| usage_and_exit());
            }
            "--console-addr" => {
                console_addr = Some(it.next().unwrap_or_else(|| usage_and_exit()));
            }
            "-h" | "--help" => usage_and_exit(),
            _ => usage_and_exit(),
        }
    }
    Config {
        bind,
        secret,
        console_addr,
    }
}

/// Reconciliation hook: a transport-level leave also removes the user from
/// whatever game room the console still has them in.
#[derive(Clone)]
struct ConsoleHook {
    http: reqwest::Client,
    base: Option<String>,
}

impl ConsoleHook {
    fn new(base: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base,
        }
    }

    async fn on_leave(&self, user_id: i64) {
        let Some(base) = &self.base else { return };
        let url = format!("{base}/grpc/GameService/LeaveGame");
        let result = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "userId": user_id }))
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() || resp.status().as_u16() == 404 => {}
            Ok(resp) => warn!(user_id, status = %resp.status(), "console leave hook refused"),
            Err(err) => warn!(user_id, %err, "console leave hook failed"),
        }
    }
}

struct App {
    signer: FrameSigner,
    rooms: Mutex<Rooms>,
    console: ConsoleHook,
}

async fn deliver(outbox: Outbox) {
    for (tx, packet) in outbox {
        if tx.send(packet).await.is_err() {
            debug!("peer queue gone, delivery dropped");
        }
    }
}

fn server_endpoint(bind: SocketAddr) -> anyhow::Result<Endpoint> {
    let cert = rcgen::generate_simple_self_signed(vec!["relay".to_string()])
        .context("self-signed certificate")?;
    let cert_der = rustls::pki_types::CertificateDer::from(cert.cert);
    let key_der = rustls::pki_types::PrivateKeyDer::from(
        rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()),
    );

    let mut crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .context("server tls config")?;
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let quic_crypto = quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
        .context("quic tls config")?;
    let mut config = quinn::ServerConfig::with_crypto(Arc::new(quic_crypto));
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        quinn::IdleTimeout::try_from(MAX_IDLE).context("idle timeout")?,
    ));
    config.transport_config(Arc::new(transport));

    Endpoint::server(config, bind).context("relay endpoint")
}

/// One peer: a single bidirectional stream, join-first.
async fn handle_connection(app: Arc<App>, connecting: quinn::Incoming) {
    let conn = match connecting.await {
        Ok(conn) => conn,
        Err(err) => {
            debug!(%err, "connection failed during handshake");
            return;
        }
    };
    let remote = conn.remote_address();
    let (send, mut recv) = match conn.accept_bi().await {
        Ok(pair) => pair,
        Err(err) => {
            debug!(%remote, %err, "no stream from peer");
            return;
        }
    };

    // the first packet must be a join
    let first = match read_packet(&mut recv, &app.signer).await {
        Ok(Some(packet)) if packet.kind == PacketType::Join => packet,
        Ok(Some(packet)) => {
            warn!(%remote, kind = ?packet.kind, "peer spoke before joining");
            conn.close(1u32.into(), b"join first");
            return;
        }
        Ok(None) | Err(_) => return,
    };
    let (room_name, peer_id) = (first.room.clone(), first.from);
    info!(%remote, room = %room_name, peer_id, "peer joined");

    let (out_tx, mut out_rx) = mpsc::channel::<RelayPacket>(rooms::PEER_DEPTH);
    let signer = app.signer.clone();
    let writer = tokio::spawn(async move {
        let mut send = send;
        while let Some(packet) = out_rx.recv().await {
            if let Err(err) = write_packet(&mut send, &signer, &packet).await {
                debug!(%err, "peer write failed");
                break;
            }
        }
        let _ = send.finish();
    });

    let outbox = app.rooms.lock().await.join(&room_name, peer_id, out_tx);
    deliver(outbox).await;

    loop {
        match read_packet(&mut recv, &app.signer).await {
            Ok(Some(packet)) => {
                if packet.kind == PacketType::Leave {
                    break;
                }
                let outbox = app.rooms.lock().await.route(packet);
                deliver(outbox).await;
            }
            Ok(None) => break,
            Err(err) => {
                debug!(%remote, peer_id, %err, "peer read failed");
                break;
            }
        }
    }

    let outbox = app.rooms.lock().await.leave(&room_name, peer_id);
    deliver(outbox).await;
    app.console.on_leave(peer_id).await;
    writer.abort();
    info!(%remote, room = %room_name, peer_id, "peer gone");
}

async fn sweep_loop(app: Arc<App>) {
    let mut tick = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tick.tick().await;
        let idle = app.rooms.lock().await.idle_peers(MAX_IDLE);
        for (room_name, peer_id) in idle {
            warn!(room = %room_name, peer_id, "disconnecting idle peer");
            let outbox = app.rooms.lock().await.leave(&room_name, peer_id);
            deliver(outbox).await;
            app.console.on_leave(peer_id).await;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,relayd=info".into()),
        )
        .with_target(false)
        .with_max_level(Level::INFO)
        .init();

    let cfg = parse_args();
    let endpoint = server_endpoint(cfg.bind)?;
    info!(bind = %cfg.bind, "relay listening");

    let app = Arc::new(App {
        signer: FrameSigner::new(&cfg.secret),
        rooms: Mutex::new(Rooms::new()),
        console: ConsoleHook::new(cfg.console_addr),
    });

    let sweeper = tokio::spawn(sweep_loop(app.clone()));

    loop {
        tokio::select! {
            incoming = endpoint.accept() => {
                let Some(incoming) = incoming else { break };
                tokio::spawn(handle_connection(app.clone(), incoming));
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    sweeper.abort();
    endpoint.close(0u32.into(), b"relay shutting down");
    Ok(())
}
