//! Peer-to-peer strategy over WebRTC.
//!
//! The lobby socket is the signaling channel. Each remote peer maps to one
//! `RTCPeerConnection` with two data channels, `<roomId>/tcp` and
//! `<roomId>/udp`. The game never learns about any of that: every peer gets a
//! loopback address from the ring and local sockets bound there feed the data
//! channels.
//!
//! Local socket per role:
//!
//! | role                | tcp channel        | udp channel        |
//! |---------------------|--------------------|--------------------|
//! | HostIsSelf          | dial 127.0.0.1     | dial 127.0.0.1     |
//! | HostIsOther         | listen on ring ip  | listen on ring ip  |
//! | GuestAlreadyPresent | none               | listen on ring ip  |
//! | GuestJoining        | none               | dial 127.0.0.1     |

use std::collections::HashMap;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::Context;
use anyhow::anyhow;
use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use dispelproto::backend::build_host_migration;
use dispelproto::codes;
use dispelproto::lobby;
use dispelproto::lobby::Envelope;
use dispelproto::lobby::LobbyBody;

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

struct Peer {
    addr: Ipv4Addr,
    pc: Arc<RTCPeerConnection>,
    link: Arc<PeerLink>,
}

/// Per-peer wiring shared with the webrtc callbacks. `on_open` fires on the
/// webrtc side, so the redirect task handles must land somewhere the proxy
/// can still reach when the peer leaves or the host migrates.
struct PeerLink {
    addr: Ipv4Addr,
    role: Mutex<PeerRole>,
    channels: Mutex<Vec<(Arc<RTCDataChannel>, bool)>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerLink {
    fn new(addr: Ipv4Addr, role: PeerRole) -> Arc<Self> {
        Arc::new(Self {
            addr,
            role: Mutex::new(role),
            channels: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    async fn role(&self) -> PeerRole {
        *self.role.lock().await
    }

    async fn set_role(&self, role: PeerRole) {
        *self.role.lock().await = role;
    }

    async fn abort_tasks(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }

    /// Track a data channel and wire it to its local socket once it opens.
    /// The role is read when `on_open` fires, not when it is registered.
    async fn adopt(self: &Arc<Self>, dc: Arc<RTCDataChannel>, is_tcp: bool) {
        self.channels.lock().await.push((dc.clone(), is_tcp));
        let link = self.clone();
        let dc_open = dc.clone();
        dc.on_open(Box::new(move || {
            let link = link.clone();
            let dc = dc_open.clone();
            Box::pin(async move {
                let role = link.role().await;
                let handles = Self::wire_channel(&dc, link.addr, role, is_tcp);
                link.tasks.lock().await.extend(handles);
            })
        }));
    }

    /// Re-wire channels that are already open under the current role.
    /// `on_open` never fires twice, so a role change has to redo this by
    /// hand; channels still negotiating pick the new role up in `adopt`'s
    /// callback.
    async fn rewire_open(self: &Arc<Self>) {
        let role = self.role().await;
        let channels = self.channels.lock().await.clone();
        for (dc, is_tcp) in channels {
            if dc.ready_state() == RTCDataChannelState::Open {
                let handles = Self::wire_channel(&dc, self.addr, role, is_tcp);
                self.tasks.lock().await.extend(handles);
            }
        }
    }

    /// Wire one open data channel to its local socket.
    fn wire_channel(
        dc: &Arc<RTCDataChannel>,
        addr: Ipv4Addr,
        role: PeerRole,
        is_tcp: bool,
    ) -> Vec<JoinHandle<()>> {
        let (pipe, remote_tx, mut remote_rx) = redirect::pipe();

        let dc_in = dc.clone();
        dc_in.on_message(Box::new(move |msg| {
            let tx = remote_tx.clone();
            Box::pin(async move {
                if tx.send(msg.data.to_vec()).await.is_err() {
                    debug!("redirect gone, dropping data channel message");
                }
            })
        }));

        let dc_out = dc.clone();
        let writer = tokio::spawn(async move {
            while let Some(chunk) = remote_rx.recv().await {
                if dc_out.send(&Bytes::from(chunk)).await.is_err() {
                    break;
                }
            }
        });

        let local = tokio::spawn(async move {
            let result = match (is_tcp, role) {
                (true, PeerRole::HostIsSelf) => {
                    redirect::run_tcp_dial(Ipv4Addr::LOCALHOST, GAME_TCP_PORT, pipe).await
                }
                (true, PeerRole::HostIsOther) => {
                    redirect::run_tcp_listen(addr, GAME_TCP_PORT, pipe).await
                }
                (true, _) => Ok(()),
                (false, PeerRole::HostIsSelf) | (false, PeerRole::GuestJoining) => {
                    redirect::run_udp_dial(Ipv4Addr::LOCALHOST, GAME_UDP_PORT, pipe).await
                }
                (false, PeerRole::HostIsOther) | (false, PeerRole::GuestAlreadyPresent) => {
                    redirect::run_udp_listen(addr, GAME_UDP_PORT, pipe).await
                }
            };
            if let Err(err) = result {
                warn!(%err, "redirect finished with error");
            }
        });

        vec![writer, local]
    }
}

#[derive(Default)]
struct P2pState {
    room_id: Option<String>,
    is_host: bool,
    host_user_id: i64,
    peers: HashMap<i64, Peer>,
    // who was already in the room when we arrived
    present_before_us: HashSet<i64>,
}

pub struct P2pProxy {
    state: Mutex<P2pState>,
    ring: Mutex<IpRing>,
}

impl Default for P2pProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl P2pProxy {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(P2pState::default()),
            ring: Mutex::new(IpRing::for_party()),
        }
    }

    async fn new_peer_connection() -> anyhow::Result<Arc<RTCPeerConnection>> {
        let api = APIBuilder::new().build();
        let pc = api
            .new_peer_connection(RTCConfiguration::default())
            .await
            .context("new peer connection")?;
        Ok(Arc::new(pc))
    }

    fn role_for(&self, state: &P2pState, peer_id: i64) -> PeerRole {
        let peer_is_host = peer_id == state.host_user_id;
        let self_is_host = state.is_host;
        if self_is_host && peer_is_host {
            return PeerRole::HostIsSelf;
        }
        PeerRole::decide(
            self_is_host,
            peer_is_host,
            state.present_before_us.contains(&peer_id),
        )
    }

    fn send_signal(sess: &SessionNet, to: i64, body: LobbyBody) {
        let env = Envelope::directed(sess.user_id.to_string(), to.to_string(), body);
        if sess.signal_tx.try_send(env).is_err() {
            warn!(to, "signaling queue full, dropping rtc message");
        }
    }

    /// Build the offering side of one peer link and push the offer over the
    /// lobby socket.
    async fn offer_peer(&self, sess: &SessionNet, peer_id: i64) -> anyhow::Result<Ipv4Addr> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.peers.get(&peer_id) {
            return Ok(existing.addr);
        }
        let room = state
            .room_id
            .clone()
            .ok_or_else(|| anyhow!("not in a room"))?;
        let addr = self
            .ring
            .lock()
            .await
            .assign(peer_id)
            .ok_or_else(|| anyhow!("loopback ring exhausted"))?;
        let role = self.role_for(&state, peer_id);

        let pc = Self::new_peer_connection().await?;
        let tcp = pc
            .create_data_channel(&format!("{room}/tcp"), None)
            .await
            .context("create tcp data channel")?;
        let udp = pc
            .create_data_channel(&format!("{room}/udp"), None)
            .await
            .context("create udp data channel")?;

        let ice_sess = sess.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let sess = ice_sess.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                if let Ok(init) = candidate.to_json() {
                    Self::send_signal(
                        &sess,
                        peer_id,
                        LobbyBody::RtcIceCandidate(lobby::IceCandidate {
                            name: sess.user_id.to_string(),
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                        }),
                    );
                }
            })
        }));

        let offer = pc.create_offer(None).await.context("create offer")?;
        pc.set_local_description(offer.clone())
            .await
            .context("set local offer")?;
        Self::send_signal(
            sess,
            peer_id,
            LobbyBody::RtcOffer(lobby::SessionDescription {
                name: sess.user_id.to_string(),
                sdp: offer.sdp,
            }),
        );

        let link = PeerLink::new(addr, role);
        link.adopt(tcp, true).await;
        link.adopt(udp, false).await;
        state.peers.insert(peer_id, Peer { addr, pc, link });
        Ok(addr)
    }

    /// Build the answering side when a remote offer arrives.
    async fn answer_peer(
        &self,
        sess: &SessionNet,
        peer_id: i64,
        sdp: &str,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let addr = self
            .ring
            .lock()
            .await
            .assign(peer_id)
            .ok_or_else(|| anyhow!("loopback ring exhausted"))?;
        let role = self.role_for(&state, peer_id);

        let pc = Self::new_peer_connection().await?;
        let link = PeerLink::new(addr, role);

        // the offerer names the channels; adopt whatever arrives
        let dc_link = link.clone();
        pc.on_data_channel(Box::new(move |dc| {
            let link = dc_link.clone();
            let label = dc.label().to_owned();
            Box::pin(async move {
                let is_tcp = label.ends_with("/tcp");
                link.adopt(dc, is_tcp).await;
            })
        }));

        let offer = RTCSessionDescription::offer(sdp.to_owned()).context("parse remote offer")?;
        pc.set_remote_description(offer)
            .await
            .context("set remote offer")?;
        let answer = pc.create_answer(None).await.context("create answer")?;
        pc.set_local_description(answer.clone())
            .await
            .context("set local answer")?;
        Self::send_signal(
            sess,
            peer_id,
            LobbyBody::RtcAnswer(lobby::SessionDescription {
                name: sess.user_id.to_string(),
                sdp: answer.sdp,
            }),
        );

        state.peers.insert(peer_id, Peer { addr, pc, link });
        Ok(())
    }

    async fn drop_peer(&self, peer_id: i64) {
        let mut state = self.state.lock().await;
        if let Some(peer) = state.peers.remove(&peer_id) {
            peer.link.abort_tasks().await;
            let _ = peer.pc.close().await;
        }
        self.ring.lock().await.release(peer_id);
        state.present_before_us.remove(&peer_id);
    }
}

impl Proxy for P2pProxy {
    async fn create_room(
        &self,
        params: CreateParams,
        _sess: &SessionNet,
    ) -> anyhow::Result<Ipv4Addr> {
        let mut state = self.state.lock().await;
        state.room_id = Some(params.room_id);
        state.is_host = true;
        Ok(Ipv4Addr::LOCALHOST)
    }

    async fn host_room(&self, _params: HostParams, sess: &SessionNet) -> anyhow::Result<()> {
        self.state.lock().await.host_user_id = sess.user_id;
        Ok(())
    }

    async fn select_game(&self, data: GameData, sess: &SessionNet) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.room_id = Some(data.room_id);
        state.host_user_id = data.host_user_id;
        state.is_host = data.host_user_id == sess.user_id;
        state.present_before_us = data
            .players
            .iter()
            .map(|p| p.user_id)
            .filter(|id| *id != sess.user_id)
            .collect();
        Ok(())
    }

    async fn join(&self, params: JoinParams, sess: &SessionNet) -> anyhow::Result<Ipv4Addr> {
        {
            let mut state = self.state.lock().await;
            state.room_id = Some(params.room_id);
            state.host_user_id = params.host_user_id;
            state.is_host = params.host_user_id == sess.user_id;
        }
        // the address the game reports as its own; peers reach it through
        // their own rings
        Ok(Ipv4Addr::LOCALHOST)
    }

    async fn get_player_addr(
        &self,
        params: GetPlayerAddrParams,
        _sess: &SessionNet,
    ) -> anyhow::Result<Ipv4Addr> {
        self.ring
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
        self.offer_peer(sess, params.user_id).await
    }

    async fn handle_lobby_event(&self, body: &LobbyBody, sess: &SessionNet) -> anyhow::Result<()> {
        match body {
            LobbyBody::RtcOffer(offer) => {
                let peer_id: i64 = offer.name.parse().context("offer sender id")?;
                self.answer_peer(sess, peer_id, &offer.sdp).await?;
            }
            LobbyBody::RtcAnswer(answer) => {
                let peer_id: i64 = answer.name.parse().context("answer sender id")?;
                let state = self.state.lock().await;
                let peer = state
                    .peers
                    .get(&peer_id)
                    .ok_or_else(|| anyhow!("answer from unknown peer {peer_id}"))?;
                let desc = RTCSessionDescription::answer(answer.sdp.clone())
                    .context("parse remote answer")?;
                peer.pc
                    .set_remote_description(desc)
                    .await
                    .context("set remote answer")?;
            }
            LobbyBody::RtcIceCandidate(candidate) => {
                let peer_id: i64 = candidate.name.parse().context("candidate sender id")?;
                let state = self.state.lock().await;
                if let Some(peer) = state.peers.get(&peer_id) {
                    peer.pc
                        .add_ice_candidate(RTCIceCandidateInit {
                            candidate: candidate.candidate.clone(),
                            sdp_mid: candidate.sdp_mid.clone(),
                            sdp_mline_index: candidate.sdp_m_line_index,
                            username_fragment: None,
                        })
                        .await
                        .context("add ice candidate")?;
                }
            }
            LobbyBody::JoinRoom(p) => {
                // joined after us; roles for them derive from that
                debug!(user_id = p.user_id, "peer joined room");
            }
            LobbyBody::LeaveRoom(p) => {
                self.drop_peer(p.user_id).await;
            }
            LobbyBody::HostMigration(new_host) => {
                let rebind: Vec<i64> = {
                    let mut state = self.state.lock().await;
                    state.host_user_id = new_host.user_id;
                    state.is_host = new_host.user_id == sess.user_id;
                    state.peers.keys().copied().collect()
                };
                // re-derive roles and rebuild local sockets for every peer
                for peer_id in rebind {
                    let looked_up = {
                        let state = self.state.lock().await;
                        let role = self.role_for(&state, peer_id);
                        state.peers.get(&peer_id).map(|p| (p.link.clone(), role))
                    };
                    let Some((link, role)) = looked_up else { continue };
                    if link.role().await != role {
                        link.set_role(role).await;
                        link.abort_tasks().await;
                        link.rewire_open().await;
                    }
                }
                let payload = build_host_migration(
                    new_host.user_id == sess.user_id,
                    self.ring
                        .lock()
                        .await
                        .lookup(new_host.user_id)
                        .unwrap_or(Ipv4Addr::LOCALHOST),
                );
                sess.game_tx
                    .send((codes::HOST_MIGRATION, payload.to_vec()))
                    .await
                    .context("queue host migration frame")?;
            }
            other => debug!(kind = other.name(), "p2p proxy ignoring lobby event"),
        }
        Ok(())
    }

    async fn close(&self, _sess: &SessionNet) {
        let mut state = self.state.lock().await;
        for (_, peer) in state.peers.drain() {
            peer.link.abort_tasks().await;
            let _ = peer.pc.close().await;
        }
        state.room_id = None;
        state.is_host = false;
        state.host_user_id = 0;
        state.present_before_us.clear();
        self.ring.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn session(user_id: i64) -> (SessionNet, mpsc::Receiver<Envelope>) {
        let (game_tx, _game_rx) = mpsc::channel(8);
        let (signal_tx, signal_rx) = mpsc::channel(8);
        (
            SessionNet {
                user_id,
                username: format!("user{user_id}"),
                game_tx,
                signal_tx,
            },
            signal_rx,
        )
    }

    #[tokio::test]
    async fn join_reports_loopback_and_primes_roles() {
        let proxy = P2pProxy::new();
        let (sess, _rx) = session(2);

        proxy
            .select_game(
                GameData {
                    room_id: "room".into(),
                    host_user_id: 1,
                    players: vec![crate::RemotePlayer {
                        user_id: 1,
                        username: "host".into(),
                        class_type: 0,
                        ip_address: "1.2.3.4".into(),
                    }],
                },
                &sess,
            )
            .await
            .unwrap();
        let addr = proxy
            .join(
                JoinParams {
                    room_id: "room".into(),
                    host_user_id: 1,
                    host_user_ip: "1.2.3.4".into(),
                },
                &sess,
            )
            .await
            .unwrap();
        assert_eq!(addr, Ipv4Addr::LOCALHOST);

        let state = proxy.state.lock().await;
        assert!(!state.is_host);
        assert_eq!(proxy.role_for(&state, 1), PeerRole::HostIsOther);
    }

    #[tokio::test]
    async fn offering_a_peer_allocates_ring_address_and_signals() {
        let proxy = P2pProxy::new();
        let (sess, mut signals) = session(2);
        proxy
            .join(
                JoinParams {
                    room_id: "room".into(),
                    host_user_id: 1,
                    host_user_ip: "1.2.3.4".into(),
                },
                &sess,
            )
            .await
            .unwrap();

        let addr = proxy
            .connect_to_player(
                GetPlayerAddrParams {
                    room_id: "room".into(),
                    user_id: 1,
                    ip_address: "1.2.3.4".into(),
                    host_user_id: 1,
                },
                &sess,
            )
            .await
            .unwrap();
        assert_eq!(addr, Ipv4Addr::new(127, 0, 1, 2));

        // a second call is idempotent
        let again = proxy
            .get_player_addr(
                GetPlayerAddrParams {
                    room_id: "room".into(),
                    user_id: 1,
                    ip_address: "1.2.3.4".into(),
                    host_user_id: 1,
                },
                &sess,
            )
            .await
            .unwrap();
        assert_eq!(again, addr);

        let env = signals.recv().await.unwrap();
        assert_eq!(env.to, "1");
        assert!(matches!(env.body, LobbyBody::RtcOffer(_)));
    }

    #[tokio::test]
    async fn leave_releases_the_ring_slot() {
        let proxy = P2pProxy::new();
        let (sess, _signals) = session(2);
        proxy
            .join(
                JoinParams {
                    room_id: "room".into(),
                    host_user_id: 1,
                    host_user_ip: "1.2.3.4".into(),
                },
                &sess,
            )
            .await
            .unwrap();
        proxy
            .connect_to_player(
                GetPlayerAddrParams {
                    room_id: "room".into(),
                    user_id: 1,
                    ip_address: "1.2.3.4".into(),
                    host_user_id: 1,
                },
                &sess,
            )
            .await
            .unwrap();

        proxy
            .handle_lobby_event(
                &LobbyBody::LeaveRoom(lobby::Player {
                    user_id: 1,
                    username: "host".into(),
                    character_id: 1,
                    class_type: 0,
                    ip_address: "1.2.3.4".into(),
                }),
                &sess,
            )
            .await
            .unwrap();
        assert!(proxy.ring.lock().await.lookup(1).is_none());
    }

    // stands in for a redirect task; the oneshot sender drops only when the
    // task is actually torn down
    fn pending_task(tx: tokio::sync::oneshot::Sender<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let _tx = tx;
            std::future::pending::<()>().await;
        })
    }

    #[tokio::test]
    async fn dropping_a_peer_aborts_its_redirect_tasks() {
        let proxy = P2pProxy::new();
        let (sess, _signals) = session(2);
        proxy
            .join(
                JoinParams {
                    room_id: "room".into(),
                    host_user_id: 1,
                    host_user_ip: "1.2.3.4".into(),
                },
                &sess,
            )
            .await
            .unwrap();
        proxy
            .connect_to_player(
                GetPlayerAddrParams {
                    room_id: "room".into(),
                    user_id: 1,
                    ip_address: "1.2.3.4".into(),
                    host_user_id: 1,
                },
                &sess,
            )
            .await
            .unwrap();

        let link = proxy.state.lock().await.peers[&1].link.clone();
        // both channels registered so their sockets come up on open
        assert_eq!(link.channels.lock().await.len(), 2);

        let (tx, rx) = tokio::sync::oneshot::channel();
        link.tasks.lock().await.push(pending_task(tx));

        proxy
            .handle_lobby_event(
                &LobbyBody::LeaveRoom(lobby::Player {
                    user_id: 1,
                    username: "host".into(),
                    character_id: 1,
                    class_type: 0,
                    ip_address: "1.2.3.4".into(),
                }),
                &sess,
            )
            .await
            .unwrap();

        assert!(rx.await.is_err());
        assert!(link.tasks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn host_migration_rebinds_roles_and_restarts_wiring() {
        let proxy = P2pProxy::new();
        let (game_tx, mut game_rx) = mpsc::channel(8);
        let (signal_tx, _signal_rx) = mpsc::channel(8);
        let sess = SessionNet {
            user_id: 2,
            username: "user2".into(),
            game_tx,
            signal_tx,
        };
        proxy
            .join(
                JoinParams {
                    room_id: "room".into(),
                    host_user_id: 1,
                    host_user_ip: "1.2.3.4".into(),
                },
                &sess,
            )
            .await
            .unwrap();
        proxy
            .connect_to_player(
                GetPlayerAddrParams {
                    room_id: "room".into(),
                    user_id: 1,
                    ip_address: "1.2.3.4".into(),
                    host_user_id: 1,
                },
                &sess,
            )
            .await
            .unwrap();

        let link = proxy.state.lock().await.peers[&1].link.clone();
        assert_eq!(link.role().await, PeerRole::HostIsOther);
        let (tx, rx) = tokio::sync::oneshot::channel();
        link.tasks.lock().await.push(pending_task(tx));

        // the host leaves hosting to us; peer 1 becomes a plain guest
        proxy
            .handle_lobby_event(
                &LobbyBody::HostMigration(lobby::Player {
                    user_id: 2,
                    username: "user2".into(),
                    character_id: 1,
                    class_type: 0,
                    ip_address: "5.6.7.8".into(),
                }),
                &sess,
            )
            .await
            .unwrap();

        assert_eq!(link.role().await, PeerRole::GuestJoining);
        // the old wiring is gone and the game was told about the new host
        assert!(rx.await.is_err());
        let (code, _payload) = game_rx.recv().await.unwrap();
        assert_eq!(code, codes::HOST_MIGRATION);
    }
}
