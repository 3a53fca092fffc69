use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{Level, info, warn};

mod console;
mod lobbylink;
mod session;

use console::ConsoleClient;
use session::ProxyFlavor;
use session::SessionCtx;

#[derive(Clone, Debug)]
struct Config {
    bind: SocketAddr,
    console_addr: String,
    lobby_addr: String,
    my_ip: Ipv4Addr,
    flavor: ProxyFlavor,
    relay_addr: Option<SocketAddr>,
    relay_secret: String,
}

fn usage_and_exit() -> ! {
    eprintln!(
        "backendd\n\n\
USAGE:\n  backendd [--bind HOST:PORT] [--console-addr URL] [--lobby-addr URL]\n           [--my-ip-addr IPV4] [--proxy lan|webrtc-beta|relay-beta]\n           [--relay-addr HOST:PORT] [--relay-secret KEY]\n\n\
ENV:\n  BACKEND_BIND  default 0.0.0.0:6112\n  CONSOLE_ADDR  default http://127.0.0.1:2137\n  LOBBY_ADDR    default ws://127.0.0.1:2137\n  RELAY_SECRET  signing key for the relay wire\n"
    );
    std::process::exit(2);
}

fn flavor_from_flag(flag: &str) -> Option<ProxyFlavor> {
    match flag {
        "lan" => Some(ProxyFlavor::Lan),
        "webrtc-beta" => Some(ProxyFlavor::WebRtc),
        "relay-beta" => Some(ProxyFlavor::Relay),
        _ => None,
    }
}

fn parse_args() -> Config {
    let mut bind: SocketAddr = std::env::var("BACKEND_BIND")
        .unwrap_or_else(|_| "0.0.0.0:6112".to_string())
        .parse()
        .unwrap_or_else(|_| usage_and_exit());

    let mut console_addr =
        std::env::var("CONSOLE_ADDR").unwrap_or_else(|_| "http://127.0.0.1:2137".to_string());
    let mut lobby_addr =
        std::env::var("LOBBY_ADDR").unwrap_or_else(|_| "ws://127.0.0.1:2137".to_string());
    let mut my_ip = Ipv4Addr::new(127, 0, 0, 1);
    let mut flavor = ProxyFlavor::Lan;
    let mut relay_addr: Option<SocketAddr> = None;
    let mut relay_secret = std::env::var("RELAY_SECRET")
        .unwrap_or_else(|_| dispelproto::relay::DEFAULT_SECRET.to_string());

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--bind" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                bind = v.parse().unwrap_or_else(|_| usage_and_exit());
            }
            "--console-addr" => {
                console_addr = it.next().unwrap_or_else(|| usage_and_exit());
            }
            "--lobby-addr" => {
                lobby_addr = it.next().unwrap_or_else(|| usage_and_exit());
            }
            "--my-ip-addr" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                my_ip = v.parse().unwrap_or_else(|_| usage_and_exit());
            }
            "--proxy" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                flavor = flavor_from_flag(&v).unwrap_or_else(|| usage_and_exit());
            }
            "--relay-addr" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                relay_addr = Some(v.parse().unwrap_or_else(|_| usage_and_exit()));
            }
            "--relay-secret" => {
                relay_secret = it.next().unwrap_or_else(|| usage_and_exit());
            }
            "-h" | "--help" => usage_and_exit(),
            _ => usage_and_exit(),
        }
    }

    if flavor == ProxyFlavor::Relay && relay_addr.is_none() {
        eprintln!("--proxy relay-beta requires --relay-addr");
        usage_and_exit();
    }

    Config {
        bind,
        console_addr,
        lobby_addr,
        my_ip,
        flavor,
        relay_addr,
        relay_secret,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,backendd=info".into()),
        )
        .with_target(false)
        .with_max_level(Level::INFO)
        .init();

    let cfg = parse_args();

    let console = ConsoleClient::new(cfg.console_addr.clone());
    match console.well_known().await {
        Ok(doc) => info!(
            console = %cfg.console_addr,
            version = %doc.version,
            run_mode = %doc.run_mode,
            "console reachable"
        ),
        Err(err) => warn!(console = %cfg.console_addr, %err, "console not reachable yet"),
    }

    let ctx = Arc::new(SessionCtx {
        console,
        lobby_addr: cfg.lobby_addr,
        my_ip: cfg.my_ip,
        flavor: cfg.flavor,
        relay_addr: cfg.relay_addr,
        relay_secret: cfg.relay_secret,
    });

    let listener = TcpListener::bind(cfg.bind).await?;
    info!(bind = %cfg.bind, proxy = ?cfg.flavor, "backend listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(%err, "accept failed");
                        continue;
                    }
                };
                info!(%peer, "game client connected");
                let ctx = ctx.clone();
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move {
                    if let Err(err) = session::run(ctx, stream, peer, shutdown).await {
                        warn!(%peer, %err, "session error");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                let _ = shutdown_tx.send(true);
                break;
            }
        }
    }
    Ok(())
}
