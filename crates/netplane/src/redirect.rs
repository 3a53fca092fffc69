//! Couples a tunnel endpoint with a local socket.
//!
//! A [`Pipe`] is the tunnel-facing half: bytes pushed into `to_remote` travel
//! to the peer, bytes arriving from the peer come out of `from_remote`. The
//! run functions bind or dial the local socket per the peer's role and shuttle
//! until either side closes.

use std::net::Ipv4Addr;
use std::net::SocketAddr;

use anyhow::Context;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::debug;

pub const PIPE_DEPTH: usize = 64;

const IO_BUF: usize = 64 * 1024;

/// Tunnel-facing half of one redirect.
#[derive(Debug)]
pub struct Pipe {
    pub to_remote: mpsc::Sender<Vec<u8>>,
    pub from_remote: mpsc::Receiver<Vec<u8>>,
}

/// Build a connected pair: the `Pipe` goes to the redirect, the returned
/// sender/receiver stay with the tunnel.
pub fn pipe() -> (Pipe, mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
    let (to_remote, remote_rx) = mpsc::channel(PIPE_DEPTH);
    let (remote_tx, from_remote) = mpsc::channel(PIPE_DEPTH);
    (
        Pipe {
            to_remote,
            from_remote,
        },
        remote_tx,
        remote_rx,
    )
}

async fn shuttle_tcp(stream: TcpStream, mut pipe: Pipe) -> anyhow::Result<()> {
    let (mut rd, mut wr) = stream.into_split();
    let mut buf = vec![0u8; IO_BUF];
    loop {
        tokio::select! {
            n = rd.read(&mut buf) => {
                let n = n.context("tcp redirect read")?;
                if n == 0 {
                    break;
                }
                if pipe.to_remote.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
            chunk = pipe.from_remote.recv() => {
                let Some(chunk) = chunk else { break };
                wr.write_all(&chunk).await.context("tcp redirect write")?;
            }
        }
    }
    Ok(())
}

/// Accept one game TCP connection on `ip:port` and shuttle it.
pub async fn run_tcp_listen(ip: Ipv4Addr, port: u16, pipe: Pipe) -> anyhow::Result<()> {
    let listener = TcpListener::bind(SocketAddr::from((ip, port)))
        .await
        .with_context(|| format!("bind tcp {ip}:{port}"))?;
    let (stream, peer) = listener.accept().await.context("tcp redirect accept")?;
    debug!(%peer, "game connected to redirect");
    shuttle_tcp(stream, pipe).await
}

/// Dial the local game at `ip:port` and shuttle.
pub async fn run_tcp_dial(ip: Ipv4Addr, port: u16, pipe: Pipe) -> anyhow::Result<()> {
    let stream = TcpStream::connect(SocketAddr::from((ip, port)))
        .await
        .with_context(|| format!("dial tcp {ip}:{port}"))?;
    shuttle_tcp(stream, pipe).await
}

/// Bind UDP on `ip:port`; datagrams flow to the tunnel, tunnel chunks go back
/// to whoever talked to us last.
pub async fn run_udp_listen(ip: Ipv4Addr, port: u16, mut pipe: Pipe) -> anyhow::Result<()> {
    let socket = UdpSocket::bind(SocketAddr::from((ip, port)))
        .await
        .with_context(|| format!("bind udp {ip}:{port}"))?;
    let mut buf = vec![0u8; IO_BUF];
    let mut last_peer: Option<SocketAddr> = None;
    loop {
        tokio::select! {
            r = socket.recv_from(&mut buf) => {
                let (n, peer) = r.context("udp redirect recv")?;
                last_peer = Some(peer);
                if pipe.to_remote.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
            chunk = pipe.from_remote.recv() => {
                let Some(chunk) = chunk else { break };
                if let Some(peer) = last_peer {
                    socket.send_to(&chunk, peer).await.context("udp redirect send")?;
                }
            }
        }
    }
    Ok(())
}

/// Dial UDP toward the local game at `ip:port`.
pub async fn run_udp_dial(ip: Ipv4Addr, port: u16, mut pipe: Pipe) -> anyhow::Result<()> {
    let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        .await
        .context("bind udp dialer")?;
    socket
        .connect(SocketAddr::from((ip, port)))
        .await
        .with_context(|| format!("dial udp {ip}:{port}"))?;
    let mut buf = vec![0u8; IO_BUF];
    loop {
        tokio::select! {
            r = socket.recv(&mut buf) => {
                let n = r.context("udp dialer recv")?;
                if pipe.to_remote.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
            chunk = pipe.from_remote.recv() => {
                let Some(chunk) = chunk else { break };
                socket.send(&chunk).await.context("udp dialer send")?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tcp_listen_shuttles_both_ways() {
        let (p, remote_tx, mut remote_rx) = pipe();
        let ip = Ipv4Addr::LOCALHOST;
        let listener = TcpListener::bind(SocketAddr::from((ip, 0))).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            shuttle_tcp(stream, p).await.unwrap();
        });

        let mut game = TcpStream::connect(addr).await.unwrap();
        game.write_all(b"to-tunnel").await.unwrap();
        assert_eq!(remote_rx.recv().await.unwrap(), b"to-tunnel");

        remote_tx.send(b"to-game".to_vec()).await.unwrap();
        let mut buf = [0u8; 7];
        game.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"to-game");
    }

    #[tokio::test]
    async fn udp_listen_replies_to_last_peer() {
        let (p, remote_tx, mut remote_rx) = pipe();
        let ip = Ipv4Addr::LOCALHOST;
        let port = 46113;
        tokio::spawn(async move {
            let _ = run_udp_listen(ip, port, p).await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let game = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        game.send_to(b"ping", (ip, port)).await.unwrap();
        assert_eq!(remote_rx.recv().await.unwrap(), b"ping");

        remote_tx.send(b"pong".to_vec()).await.unwrap();
        let mut buf = [0u8; 4];
        let (n, _) = game.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
    }
}
