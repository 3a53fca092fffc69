//! `netplane`: the transport plane.
//!
//! One [`Proxy`] interface, three strategies for carrying the game's native
//! peer traffic (TCP/6114, UDP/6113):
//!
//! - [`lan::LanProxy`] hands out real interface addresses and opens nothing;
//! - [`p2p::P2pProxy`] tunnels both ports through WebRTC data channels and
//!   backs each remote peer with a loopback address from an [`ipring::IpRing`];
//! - [`relay::RelayProxy`] tunnels through the QUIC relay with locally bound
//!   fake host sockets.
//!
//! Whatever the strategy, the value handed back to the game is always a plain
//! IPv4 it can dial.

pub mod ipring;
pub mod lan;
pub mod p2p;
pub mod redirect;
pub mod relay;

use std::net::Ipv4Addr;

use tokio::sync::mpsc;

use dispelproto::lobby::Envelope;
use dispelproto::lobby::LobbyBody;

/// Game-side TCP port for peer traffic.
pub const GAME_TCP_PORT: u16 = 6114;

/// Game-side UDP port for peer traffic.
pub const GAME_UDP_PORT: u16 = 6113;

/// One write queued toward the game client: command code plus payload.
pub type GameWrite = (u8, Vec<u8>);

/// Per-session handles a proxy needs: who the session is, how to push frames
/// to its game client, and how to push signaling onto its lobby socket.
#[derive(Debug, Clone)]
pub struct SessionNet {
    pub user_id: i64,
    pub username: String,
    pub game_tx: mpsc::Sender<GameWrite>,
    pub signal_tx: mpsc::Sender<Envelope>,
}

/// Where a remote peer stands relative to this session. Decides which local
/// sockets get bound (see the role matrix in the proxy implementations).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// The peer is this session itself hosting; dial loopback.
    HostIsSelf,
    /// The peer hosts and we are joining; listen on TCP and UDP.
    HostIsOther,
    /// A fellow guest that joined before us; listen on UDP only.
    GuestAlreadyPresent,
    /// A fellow guest joining after us; dial UDP.
    GuestJoining,
}

impl PeerRole {
    pub fn decide(self_is_host: bool, peer_is_host: bool, peer_joined_before: bool) -> Self {
        match (self_is_host, peer_is_host, peer_joined_before) {
            (_, _, _) if peer_is_host && self_is_host => PeerRole::HostIsSelf,
            (_, true, _) => PeerRole::HostIsOther,
            (true, false, _) => PeerRole::GuestJoining,
            (false, false, true) => PeerRole::GuestAlreadyPresent,
            (false, false, false) => PeerRole::GuestJoining,
        }
    }

    /// Whether this role binds a local TCP listener.
    pub fn listens_tcp(&self) -> bool {
        matches!(self, PeerRole::HostIsOther)
    }

    /// Whether this role binds a local UDP socket (vs dialing).
    pub fn listens_udp(&self) -> bool {
        matches!(self, PeerRole::HostIsOther | PeerRole::GuestAlreadyPresent)
    }
}

#[derive(Debug, Clone)]
pub struct CreateParams {
    pub room_id: String,
}

#[derive(Debug, Clone)]
pub struct HostParams {
    pub room_id: String,
}

#[derive(Debug, Clone)]
pub struct JoinParams {
    pub room_id: String,
    pub host_user_id: i64,
    pub host_user_ip: String,
}

#[derive(Debug, Clone)]
pub struct GetPlayerAddrParams {
    pub room_id: String,
    pub user_id: i64,
    pub ip_address: String,
    pub host_user_id: i64,
}

/// Room data a guest primes its addressing from before joining.
#[derive(Debug, Clone)]
pub struct GameData {
    pub room_id: String,
    pub host_user_id: i64,
    pub players: Vec<RemotePlayer>,
}

#[derive(Debug, Clone)]
pub struct RemotePlayer {
    pub user_id: i64,
    pub username: String,
    pub class_type: u8,
    pub ip_address: String,
}

/// The one interface the backend drives, identical across strategies.
#[allow(async_fn_in_trait)]
pub trait Proxy: Send + Sync {
    /// Host side: allocate local resources, return the address the game
    /// reports as its own.
    async fn create_room(&self, params: CreateParams, sess: &SessionNet)
    -> anyhow::Result<Ipv4Addr>;

    /// Host side: finalize after the CreateGame commit frame.
    async fn host_room(&self, params: HostParams, sess: &SessionNet) -> anyhow::Result<()>;

    /// Guest side: prime addressing from the room data.
    async fn select_game(&self, data: GameData, sess: &SessionNet) -> anyhow::Result<()>;

    /// Guest side: the address this session reports back to the game.
    async fn join(&self, params: JoinParams, sess: &SessionNet) -> anyhow::Result<Ipv4Addr>;

    /// Address of one remote player for a lookup that must not allocate.
    async fn get_player_addr(
        &self,
        params: GetPlayerAddrParams,
        sess: &SessionNet,
    ) -> anyhow::Result<Ipv4Addr>;

    /// Address of one remote player, allocating transport resources on first
    /// contact.
    async fn connect_to_player(
        &self,
        params: GetPlayerAddrParams,
        sess: &SessionNet,
    ) -> anyhow::Result<Ipv4Addr>;

    /// Control messages arriving over this session's lobby socket.
    async fn handle_lobby_event(&self, body: &LobbyBody, sess: &SessionNet) -> anyhow::Result<()>;

    /// Session teardown; drop every peer resource.
    async fn close(&self, sess: &SessionNet);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_matrix() {
        // self guest, peer is host -> listen both
        assert_eq!(PeerRole::decide(false, true, true), PeerRole::HostIsOther);
        // self host meeting a joining guest -> dial side of the guest pair
        assert_eq!(PeerRole::decide(true, false, false), PeerRole::GuestJoining);
        // two guests, peer was already in -> listen udp only
        assert_eq!(
            PeerRole::decide(false, false, true),
            PeerRole::GuestAlreadyPresent
        );
        assert!(PeerRole::HostIsOther.listens_tcp());
        assert!(PeerRole::HostIsOther.listens_udp());
        assert!(!PeerRole::GuestAlreadyPresent.listens_tcp());
        assert!(PeerRole::GuestAlreadyPresent.listens_udp());
        assert!(!PeerRole::GuestJoining.listens_udp());
    }
}
