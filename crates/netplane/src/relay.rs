//! Relay strategy: every peer flow rides one QUIC bidirectional stream to the
//! relay server, as signed packets with a u32 big-endian length prefix.
//!
//! Locally the shape matches the P2P strategy: each remote peer gets a
//! loopback address from the ring, redirect sockets bound there face the game,
//! and the packet router shuttles between those sockets and the stream.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::anyhow;
use quinn::Endpoint;
use quinn::RecvStream;
use quinn::SendStream;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use dispelproto::backend::build_host_migration;
use dispelproto::codes;
use dispelproto::lobby::LobbyBody;
use dispelproto::relay::ALPN;
use dispelproto::relay::FrameSigner;
use dispelproto::relay::PacketType;
use dispelproto::relay::RelayPacket;
use dispelproto::relay::decode_frame;
use dispelproto::relay::encode_frame;

use crate::CreateParams;
use crate::GAME_TCP_PORT;
use crate::GAME_UDP_PORT;
use crate::GameData;
use crate::GetPlayerAddrParams;
use crate::HostParams;
use crate::JoinParams;
use crate::PeerRole;
use crate::Proxy;
use crate::SessionNet;
use crate::ipring::IpRing;
use crate::redirect;

/// Upper bound on one relay frame; base64 inflates the 64 KiB game reads.
pub const MAX_FRAME: usize = 256 * 1024;

const KEEP_ALIVE: Duration = Duration::from_secs(10);
const OUTBOUND_DEPTH: usize = 256;

/// Write one signed packet with its length prefix.
pub async fn write_packet(
    send: &mut SendStream,
    signer: &FrameSigner,
    packet: &RelayPacket,
) -> anyhow::Result<()> {
    let frame = encode_frame(signer, packet).context("encode relay frame")?;
    if frame.len() > MAX_FRAME {
        return Err(anyhow!("relay frame over limit: {}", frame.len()));
    }
    send.write_all(&(frame.len() as u32).to_be_bytes())
        .await
        .context("write frame length")?;
    send.write_all(&frame).await.context("write frame")?;
    Ok(())
}

/// Read one packet; `Ok(None)` on a clean end of stream. Signature mismatch
/// is logged and the packet kept.
pub async fn read_packet(
    recv: &mut RecvStream,
    signer: &FrameSigner,
) -> anyhow::Result<Option<RelayPacket>> {
    let mut len_buf = [0u8; 4];
    match recv.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(quinn::ReadExactError::FinishedEarly(_)) => return Ok(None),
        Err(err) => return Err(err).context("read frame length"),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        return Err(anyhow!("relay frame over limit: {len}"));
    }
    let mut frame = vec![0u8; len];
    recv.read_exact(&mut frame).await.context("read frame")?;
    let (sig, packet) = decode_frame(&frame).map_err(|err| anyhow!("bad relay frame: {err}"))?;
    if !signer.verify(sig, &frame[dispelproto::relay::SIGNATURE_LEN..]) {
        warn!(from = packet.from, kind = ?packet.kind, "relay frame signature mismatch");
    }
    Ok(Some(packet))
}

/// rustls verifier that accepts the relay's self-signed certificate. The
/// shared-secret frame signatures are the authenticity story for this plane.
#[derive(Debug)]
struct TrustRelayCert(rustls::crypto::CryptoProvider);

impl TrustRelayCert {
    fn new() -> Arc<Self> {
        Arc::new(Self(rustls::crypto::ring::default_provider()))
    }
}

impl rustls::client::danger::ServerCertVerifier for TrustRelayCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn client_endpoint() -> anyhow::Result<Endpoint> {
    let crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(TrustRelayCert::new())
        .with_no_client_auth();
    let mut crypto = crypto;
    crypto.alpn_protocols = vec![ALPN.to_vec()];
    let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
        .context("relay client tls config")?;
    let mut config = quinn::ClientConfig::new(Arc::new(quic_crypto));
    let mut transport = quinn::TransportConfig::default();
    transport.keep_alive_interval(Some(KEEP_ALIVE));
    config.transport_config(Arc::new(transport));
    let mut endpoint =
        Endpoint::client("0.0.0.0:0".parse().context("client bind addr")?)
            .context("relay client endpoint")?;
    endpoint.set_default_client_config(config);
    Ok(endpoint)
}

struct PeerPipes {
    addr: Ipv4Addr,
    role: PeerRole,
    tcp_in: Option<mpsc::Sender<Vec<u8>>>,
    udp_in: Option<mpsc::Sender<Vec<u8>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl PeerPipes {
    fn teardown(&mut self) {
        self.tcp_in = None;
        self.udp_in = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[derive(Default)]
struct RelayState {
    room_id: Option<String>,
    is_host: bool,
    host_user_id: i64,
    out_tx: Option<mpsc::Sender<RelayPacket>>,
    peers: HashMap<i64, PeerPipes>,
    link_tasks: Vec<JoinHandle<()>>,
    endpoint: Option<Endpoint>,
}

struct Shared {
    signer: FrameSigner,
    state: Mutex<RelayState>,
    ring: Mutex<IpRing>,
}

pub struct RelayProxy {
    relay_addr: SocketAddr,
    shared: Arc<Shared>,
}

impl RelayProxy {
    pub fn new(relay_addr: SocketAddr, secret: &str) -> Self {
        Self {
            relay_addr,
            shared: Arc::new(Shared {
                signer: FrameSigner::new(secret),
                state: Mutex::new(RelayState::default()),
                ring: Mutex::new(IpRing::for_party()),
            }),
        }
    }

    /// Connect the stream and announce the room, once per session.
    async fn ensure_link(&self, room_id: &str, sess: &SessionNet) -> anyhow::Result<()> {
        let mut state = self.shared.state.lock().await;
        if state.out_tx.is_some() {
            return Ok(());
        }

        let endpoint = client_endpoint()?;
        let conn = endpoint
            .connect(self.relay_addr, "relay")
            .context("relay connect")?
            .await
            .context("relay handshake")?;
        let (mut send, mut recv) = conn.open_bi().await.context("open relay stream")?;
        info!(addr = %self.relay_addr, room = room_id, "relay link up");

        write_packet(
            &mut send,
            &self.shared.signer,
            &RelayPacket::join(room_id, sess.user_id),
        )
        .await?;

        let (out_tx, mut out_rx) = mpsc::channel::<RelayPacket>(OUTBOUND_DEPTH);
        let signer = self.shared.signer.clone();
        let writer = tokio::spawn(async move {
            while let Some(packet) = out_rx.recv().await {
                if let Err(err) = write_packet(&mut send, &signer, &packet).await {
                    warn!(%err, "relay write failed");
                    break;
                }
            }
            let _ = send.finish();
        });

        let shared = self.shared.clone();
        let router_sess = sess.clone();
        let router = tokio::spawn(async move {
            let signer = shared.signer.clone();
            loop {
                match read_packet(&mut recv, &signer).await {
                    Ok(Some(packet)) => {
                        if let Err(err) = route_inbound(&shared, &router_sess, packet).await {
                            warn!(%err, "relay packet dropped");
                        }
                    }
                    Ok(None) => {
                        debug!("relay stream closed");
                        break;
                    }
                    Err(err) => {
                        warn!(%err, "relay read failed");
                        break;
                    }
                }
            }
        });

        // empty data packets keep our LastSeen fresh on the server sweep
        let ka_tx = out_tx.clone();
        let ka_room = room_id.to_owned();
        let ka_from = sess.user_id;
        let keep_alive = tokio::spawn(async move {
            let mut tick = tokio::time::interval(KEEP_ALIVE);
            tick.tick().await;
            loop {
                tick.tick().await;
                let packet = RelayPacket {
                    kind: PacketType::Data,
                    room: ka_room.clone(),
                    from: ka_from,
                    to: None,
                    payload: None,
                };
                if ka_tx.send(packet).await.is_err() {
                    break;
                }
            }
        });

        state.room_id = Some(room_id.to_owned());
        state.out_tx = Some(out_tx);
        state.link_tasks = vec![writer, router, keep_alive];
        state.endpoint = Some(endpoint);
        Ok(())
    }

    async fn send_packet(&self, packet: RelayPacket) -> anyhow::Result<()> {
        let out_tx = {
            let state = self.shared.state.lock().await;
            state
                .out_tx
                .clone()
                .ok_or_else(|| anyhow!("relay link not connected"))?
        };
        out_tx
            .send(packet)
            .await
            .map_err(|_| anyhow!("relay link closed"))
    }
}

fn peer_role(state: &RelayState, sess_user_id: i64, peer_id: i64, joined_late: bool) -> PeerRole {
    if state.is_host && peer_id == sess_user_id {
        return PeerRole::HostIsSelf;
    }
    PeerRole::decide(state.is_host, peer_id == state.host_user_id, !joined_late)
}

/// Bind the local redirect sockets for one peer and wire them to the stream.
async fn wire_peer(
    shared: &Arc<Shared>,
    sess: &SessionNet,
    peer_id: i64,
    joined_late: bool,
) -> anyhow::Result<Ipv4Addr> {
    let mut state = shared.state.lock().await;
    if let Some(existing) = state.peers.get(&peer_id) {
        return Ok(existing.addr);
    }
    let room = state
        .room_id
        .clone()
        .ok_or_else(|| anyhow!("not in a room"))?;
    let out_tx = state
        .out_tx
        .clone()
        .ok_or_else(|| anyhow!("relay link not connected"))?;
    let addr = shared
        .ring
        .lock()
        .await
        .assign(peer_id)
        .ok_or_else(|| anyhow!("loopback ring exhausted"))?;
    let role = peer_role(&state, sess.user_id, peer_id, joined_late);

    let mut pipes = PeerPipes {
        addr,
        role,
        tcp_in: None,
        udp_in: None,
        tasks: Vec::new(),
    };
    spawn_peer_pipes(&mut pipes, &room, sess.user_id, peer_id, out_tx);
    state.peers.insert(peer_id, pipes);
    debug!(peer_id, %addr, ?role, "relay peer wired");
    Ok(addr)
}

fn spawn_peer_pipes(
    pipes: &mut PeerPipes,
    room: &str,
    self_id: i64,
    peer_id: i64,
    out_tx: mpsc::Sender<RelayPacket>,
) {
    let (addr, role) = (pipes.addr, pipes.role);
    let wants_tcp = matches!(role, PeerRole::HostIsSelf | PeerRole::HostIsOther);
    for (is_tcp, kind) in [(true, PacketType::Tcp), (false, PacketType::Udp)] {
        if is_tcp && !wants_tcp {
            continue;
        }
        let (pipe, remote_tx, mut remote_rx) = redirect::pipe();
        if is_tcp {
            pipes.tcp_in = Some(remote_tx);
        } else {
            pipes.udp_in = Some(remote_tx);
        }

        let room = room.to_owned();
        let out = out_tx.clone();
        pipes.tasks.push(tokio::spawn(async move {
            while let Some(chunk) = remote_rx.recv().await {
                let packet = RelayPacket {
                    kind,
                    room: room.clone(),
                    from: self_id,
                    to: Some(peer_id),
                    payload: Some(chunk),
                };
                if out.send(packet).await.is_err() {
                    break;
                }
            }
        }));

        pipes.tasks.push(tokio::spawn(async move {
            let result = match (is_tcp, role) {
                (true, PeerRole::HostIsSelf) => {
                    redirect::run_tcp_dial(Ipv4Addr::LOCALHOST, GAME_TCP_PORT, pipe).await
                }
                (true, _) => redirect::run_tcp_listen(addr, GAME_TCP_PORT, pipe).await,
                (false, PeerRole::HostIsSelf) | (false, PeerRole::GuestJoining) => {
                    redirect::run_udp_dial(Ipv4Addr::LOCALHOST, GAME_UDP_PORT, pipe).await
                }
                (false, _) => redirect::run_udp_listen(addr, GAME_UDP_PORT, pipe).await,
            };
            if let Err(err) = result {
                warn!(%err, "relay redirect finished with error");
            }
        }));
    }
}

async fn route_inbound(
    shared: &Arc<Shared>,
    sess: &SessionNet,
    packet: RelayPacket,
) -> anyhow::Result<()> {
    match packet.kind {
        PacketType::Join => {
            // the server announces every peer in the room, ours included
            if packet.from != sess.user_id {
                wire_peer(shared, sess, packet.from, true).await?;
            }
        }
        PacketType::Leave => {
            let mut state = shared.state.lock().await;
            if let Some(mut pipes) = state.peers.remove(&packet.from) {
                pipes.teardown();
            }
            shared.ring.lock().await.release(packet.from);
        }
        PacketType::Tcp | PacketType::Udp => {
            let tx = {
                let state = shared.state.lock().await;
                let pipes = state
                    .peers
                    .get(&packet.from)
                    .ok_or_else(|| anyhow!("data from unwired peer {}", packet.from))?;
                match packet.kind {
                    PacketType::Tcp => pipes.tcp_in.clone(),
                    _ => pipes.udp_in.clone(),
                }
            };
            let payload = packet.payload.unwrap_or_default();
            if let Some(tx) = tx {
                let _ = tx.send(payload).await;
            }
        }
        PacketType::Data | PacketType::Broadcast => {
            debug!(from = packet.from, "relay control data ignored");
        }
        PacketType::Migrate => {
            apply_migration(shared, sess, packet.from).await?;
        }
    }
    Ok(())
}

/// New host elected; re-derive roles, re-bind redirects, tell the game.
async fn apply_migration(
    shared: &Arc<Shared>,
    sess: &SessionNet,
    new_host: i64,
) -> anyhow::Result<()> {
    let room;
    let out_tx;
    let rebind: Vec<i64> = {
        let mut state = shared.state.lock().await;
        state.host_user_id = new_host;
        state.is_host = new_host == sess.user_id;
        room = state.room_id.clone().unwrap_or_default();
        out_tx = state.out_tx.clone();
        state.peers.keys().copied().collect()
    };
    for peer_id in rebind {
        let mut state = shared.state.lock().await;
        let role = peer_role(&state, sess.user_id, peer_id, false);
        let Some(out) = out_tx.clone() else { break };
        if let Some(pipes) = state.peers.get_mut(&peer_id) {
            if pipes.role != role {
                pipes.teardown();
                pipes.role = role;
                spawn_peer_pipes(pipes, &room, sess.user_id, peer_id, out);
            }
        }
    }

    let host_addr = shared
        .ring
        .lock()
        .await
        .lookup(new_host)
        .unwrap_or(Ipv4Addr::LOCALHOST);
    let payload = build_host_migration(new_host == sess.user_id, host_addr);
    sess.game_tx
        .send((codes::HOST_MIGRATION, payload.to_vec()))
        .await
        .map_err(|_| anyhow!("game writer gone"))
}

impl Proxy for RelayProxy {
    async fn create_room(
        &self,
        params: CreateParams,
        sess: &SessionNet,
    ) -> anyhow::Result<Ipv4Addr> {
        self.ensure_link(&params.room_id, sess).await?;
        let mut state = self.shared.state.lock().await;
        state.is_host = true;
        state.host_user_id = sess.user_id;
        Ok(Ipv4Addr::LOCALHOST)
    }

    async fn host_room(&self, params: HostParams, sess: &SessionNet) -> anyhow::Result<()> {
        self.ensure_link(&params.room_id, sess).await?;
        let mut state = self.shared.state.lock().await;
        state.is_host = true;
        state.host_user_id = sess.user_id;
        Ok(())
    }

    async fn select_game(&self, data: GameData, sess: &SessionNet) -> anyhow::Result<()> {
        self.ensure_link(&data.room_id, sess).await?;
        {
            let mut state = self.shared.state.lock().await;
            state.host_user_id = data.host_user_id;
            state.is_host = data.host_user_id == sess.user_id;
        }
        for player in &data.players {
            if player.user_id != sess.user_id {
                wire_peer(&self.shared, sess, player.user_id, false).await?;
            }
        }
        Ok(())
    }

    async fn join(&self, params: JoinParams, sess: &SessionNet) -> anyhow::Result<Ipv4Addr> {
        self.ensure_link(&params.room_id, sess).await?;
        {
            let mut state = self.shared.state.lock().await;
            state.host_user_id = params.host_user_id;
            state.is_host = params.host_user_id == sess.user_id;
        }
        Ok(Ipv4Addr::LOCALHOST)
    }

    async fn get_player_addr(
        &self,
        params: GetPlayerAddrParams,
        _sess: &SessionNet,
    ) -> anyhow::Result<Ipv4Addr> {
        self.shared
            .ring
            .lock()
            .await
            .lookup(params.user_id)
            .ok_or_else(|| anyhow!("no tunnel for player {}", params.user_id))
    }

    async fn connect_to_player(
        &self,
        params: GetPlayerAddrParams,
        sess: &SessionNet,
    ) -> anyhow::Result<Ipv4Addr> {
        wire_peer(&self.shared, sess, params.user_id, false).await
    }

    async fn handle_lobby_event(&self, body: &LobbyBody, sess: &SessionNet) -> anyhow::Result<()> {
        match body {
            LobbyBody::HostMigration(new_host) => {
                apply_migration(&self.shared, sess, new_host.user_id).await?;
            }
            LobbyBody::LeaveRoom(player) => {
                let mut state = self.shared.state.lock().await;
                if let Some(mut pipes) = state.peers.remove(&player.user_id) {
                    pipes.teardown();
                }
                self.shared.ring.lock().await.release(player.user_id);
            }
            other => debug!(kind = other.name(), "relay proxy ignoring lobby event"),
        }
        Ok(())
    }

    async fn close(&self, sess: &SessionNet) {
        let room = {
            let state = self.shared.state.lock().await;
            state.room_id.clone()
        };
        if let Some(room) = room {
            let _ = self
                .send_packet(RelayPacket::leave(room, sess.user_id))
                .await;
        }
        let mut state = self.shared.state.lock().await;
        for (_, mut pipes) in state.peers.drain() {
            pipes.teardown();
        }
        for task in state.link_tasks.drain(..) {
            task.abort();
        }
        state.out_tx = None;
        if let Some(endpoint) = state.endpoint.take() {
            endpoint.close(0u32.into(), b"session closed");
        }
        state.room_id = None;
        state.is_host = false;
        state.host_user_id = 0;
        self.shared.ring.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(host: i64, is_host: bool) -> RelayState {
        RelayState {
            room_id: Some("room".into()),
            is_host,
            host_user_id: host,
            ..RelayState::default()
        }
    }

    #[test]
    fn roles_follow_the_host_matrix() {
        let guest_view = state_with(1, false);
        assert_eq!(peer_role(&guest_view, 2, 1, false), PeerRole::HostIsOther);
        assert_eq!(
            peer_role(&guest_view, 2, 3, false),
            PeerRole::GuestAlreadyPresent
        );
        assert_eq!(peer_role(&guest_view, 2, 3, true), PeerRole::GuestJoining);

        let host_view = state_with(1, true);
        assert_eq!(peer_role(&host_view, 1, 2, true), PeerRole::GuestJoining);
    }

    #[tokio::test]
    async fn data_to_an_unwired_peer_is_an_error() {
        let proxy = RelayProxy::new("127.0.0.1:2137".parse().unwrap(), "secret");
        let (game_tx, _game_rx) = mpsc::channel(4);
        let (signal_tx, _signal_rx) = mpsc::channel(4);
        let sess = SessionNet {
            user_id: 2,
            username: "guest".into(),
            game_tx,
            signal_tx,
        };
        let packet = RelayPacket {
            kind: PacketType::Tcp,
            room: "room".into(),
            from: 9,
            to: Some(2),
            payload: Some(vec![1, 2, 3]),
        };
        assert!(route_inbound(&proxy.shared, &sess, packet).await.is_err());
    }

    #[tokio::test]
    async fn migration_emits_a_game_frame() {
        let proxy = RelayProxy::new("127.0.0.1:2137".parse().unwrap(), "secret");
        let (game_tx, mut game_rx) = mpsc::channel(4);
        let (signal_tx, _signal_rx) = mpsc::channel(4);
        let sess = SessionNet {
            user_id: 2,
            username: "guest".into(),
            game_tx,
            signal_tx,
        };
        {
            let mut state = proxy.shared.state.lock().await;
            *state = state_with(1, false);
        }
        apply_migration(&proxy.shared, &sess, 2).await.unwrap();
        let (code, payload) = game_rx.recv().await.unwrap();
        assert_eq!(code, codes::HOST_MIGRATION);
        assert_eq!(&payload[..4], &[1, 0, 0, 0]);
    }
}
