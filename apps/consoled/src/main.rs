use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use axum::routing::post;
use gamestore::memory::MemoryStore;
use roomsvc::service::RoomService;
use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{Level, info, warn};

mod rpc;

use rpc::AppState;

const HANDLER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
struct Config {
    bind: SocketAddr,
    run_mode: String,
    relay_addr: Option<String>,
    seed: bool,
}

fn usage_and_exit() -> ! {
    eprintln!(
        "consoled\n\n\
USAGE:\n  consoled [--bind HOST:PORT] [--run-mode lan|p2p|relay|singleplayer] [--relay-addr HOST:PORT] [--seed]\n\n\
ENV:\n  CONSOLE_BIND  default 0.0.0.0:2137\n  RUN_MODE      default lan\n  RELAY_ADDR    optional, advertised to launchers in relay mode\n"
    );
    std::process::exit(2);
}

fn run_mode_name(flag: &str) -> Option<&'static str> {
    match flag {
        "lan" => Some(dispelproto::console::RUN_MODE_LAN),
        "p2p" => Some(dispelproto::console::RUN_MODE_P2P),
        "relay" => Some(dispelproto::console::RUN_MODE_RELAY),
        "singleplayer" => Some(dispelproto::console::RUN_MODE_SINGLE_PLAYER),
        _ => None,
    }
}

fn parse_args() -> Config {
    let mut bind: SocketAddr = std::env::var("CONSOLE_BIND")
        .unwrap_or_else(|_| "0.0.0.0:2137".to_string())
        .parse()
        .unwrap_or_else(|_| usage_and_exit());

    let mut run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "lan".to_string());
    let mut relay_addr = std::env::var("RELAY_ADDR").ok();
    let mut seed = false;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--bind" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                bind = v.parse().unwrap_or_else(|_| usage_and_exit());
            }
            "--run-mode" => {
                run_mode = it.next().unwrap_or_else(|| usage_and_exit());
            }
            "--relay-addr" => {
                relay_addr = Some(it.next().unwrap_or_else(|| usage_and_exit()));
            }
            "--seed" => seed = true,
            "-h" | "--help" => usage_and_exit(),
            _ => usage_and_exit(),
        }
    }

    if run_mode_name(&run_mode).is_none() {
        usage_and_exit();
    }

    Config {
        bind,
        run_mode,
        relay_addr,
        seed,
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(%err, "ctrl-c handler failed");
    }
    info!("shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,consoled=info".into()),
        )
        .with_target(false)
        .with_max_level(Level::INFO)
        .init();

    let cfg = parse_args();

    let store = Arc::new(MemoryStore::new());
    if cfg.seed {
        store.seed_demo().await?;
        info!("seeded demo account archer/test");
    }

    let (rooms, _rooms_loop) = RoomService::start();

    let state = AppState {
        store,
        rooms: rooms.clone(),
        addr: cfg.bind.to_string(),
        // flag is lowercase, launchers expect the canonical spelling
        run_mode: run_mode_name(&cfg.run_mode)
            .unwrap_or(dispelproto::console::RUN_MODE_LAN)
            .to_string(),
        relay_addr: cfg.relay_addr.clone(),
    };

    let lobby = Router::new()
        .route("/lobby", get(roomsvc::ws::lobby_handler))
        .with_state(rooms);

    let app = Router::new()
        .route("/_health", get(|| async { "ok\n" }))
        .route("/.well-known/console.json", get(rpc::well_known))
        .route("/grpc/:service/:method", post(rpc::dispatch))
        .with_state(state)
        .merge(lobby)
        .layer(TimeoutLayer::new(HANDLER_TIMEOUT))
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(cfg.bind).await?;
    info!(bind = %cfg.bind, run_mode = %cfg.run_mode, "console listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    Ok(())
}
