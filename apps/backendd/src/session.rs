//! One game-client session: handshake, serial command dispatch, and the
//! bridge between the game wire, the console RPC surface, and the lobby.

use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use dispelproto::backend;
use dispelproto::backend::FAIL;
use dispelproto::backend::OK;
use dispelproto::codes;
use dispelproto::console;
use dispelproto::lobby;
use dispelproto::lobby::Envelope;
use dispelproto::lobby::LobbyBody;
use lanio::frame::GameFrame;
use lanio::frame::GameFrameReader;
use lanio::frame::GameFrameWriter;
use netplane::lan::LanProxy;
use netplane::p2p::P2pProxy;
use netplane::relay::RelayProxy;
use netplane::CreateParams;
use netplane::GameData;
use netplane::GetPlayerAddrParams;
use netplane::GameWrite;
use netplane::HostParams;
use netplane::JoinParams;
use netplane::Proxy;
use netplane::RemotePlayer;
use netplane::SessionNet;

use crate::console::ConsoleClient;
use crate::console::RpcError;
use crate::lobbylink::LobbyLink;

const WRITE_DEPTH: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyFlavor {
    Lan,
    WebRtc,
    Relay,
}

/// Immutable per-process context every session shares.
pub struct SessionCtx {
    pub console: ConsoleClient,
    pub lobby_addr: String,
    pub my_ip: Ipv4Addr,
    pub flavor: ProxyFlavor,
    pub relay_addr: Option<SocketAddr>,
    pub relay_secret: String,
}

/// The strategies are concrete types behind one trait that is not object
/// safe, so the session carries them in an enum.
enum AnyProxy {
    Lan(LanProxy),
    P2p(P2pProxy),
    Relay(RelayProxy),
}

impl AnyProxy {
    fn build(ctx: &SessionCtx) -> anyhow::Result<Self> {
        Ok(match ctx.flavor {
            ProxyFlavor::Lan => AnyProxy::Lan(LanProxy::new(ctx.my_ip)),
            ProxyFlavor::WebRtc => AnyProxy::P2p(P2pProxy::new()),
            ProxyFlavor::Relay => {
                let addr = ctx
                    .relay_addr
                    .context("relay proxy selected but no --relay-addr")?;
                AnyProxy::Relay(RelayProxy::new(addr, &ctx.relay_secret))
            }
        })
    }
}

macro_rules! delegate {
    ($self:expr, $p:ident => $call:expr) => {
        match $self {
            AnyProxy::Lan($p) => $call,
            AnyProxy::P2p($p) => $call,
            AnyProxy::Relay($p) => $call,
        }
    };
}

impl Proxy for AnyProxy {
    async fn create_room(
        &self,
        params: CreateParams,
        sess: &SessionNet,
    ) -> anyhow::Result<Ipv4Addr> {
        delegate!(self, p => p.create_room(params, sess).await)
    }

    async fn host_room(&self, params: HostParams, sess: &SessionNet) -> anyhow::Result<()> {
        delegate!(self, p => p.host_room(params, sess).await)
    }

    async fn select_game(&self, data: GameData, sess: &SessionNet) -> anyhow::Result<()> {
        delegate!(self, p => p.select_game(data, sess).await)
    }

    async fn join(&self, params: JoinParams, sess: &SessionNet) -> anyhow::Result<Ipv4Addr> {
        delegate!(self, p => p.join(params, sess).await)
    }

    async fn get_player_addr(
        &self,
        params: GetPlayerAddrParams,
        sess: &SessionNet,
    ) -> anyhow::Result<Ipv4Addr> {
        delegate!(self, p => p.get_player_addr(params, sess).await)
    }

    async fn connect_to_player(
        &self,
        params: GetPlayerAddrParams,
        sess: &SessionNet,
    ) -> anyhow::Result<Ipv4Addr> {
        delegate!(self, p => p.connect_to_player(params, sess).await)
    }

    async fn handle_lobby_event(&self, body: &LobbyBody, sess: &SessionNet) -> anyhow::Result<()> {
        delegate!(self, p => p.handle_lobby_event(body, sess).await)
    }

    async fn close(&self, sess: &SessionNet) {
        delegate!(self, p => p.close(sess).await)
    }
}

enum Flow {
    Continue,
    /// Authentication succeeded; the loop must start polling this receiver.
    LobbyUp(mpsc::Receiver<Envelope>),
}

struct Session {
    ctx: Arc<SessionCtx>,
    peer: SocketAddr,
    game_tx: mpsc::Sender<GameWrite>,
    proxy: AnyProxy,
    user: Option<console::UserDto>,
    net: Option<SessionNet>,
    lobby: Option<LobbyLink>,
    /// Room proposed by CreateGame state 0, not yet committed.
    pending_room: Option<String>,
    in_room: Option<String>,
}

impl Session {
    async fn send(&self, code: u8, payload: Vec<u8>) -> anyhow::Result<()> {
        self.game_tx
            .send((code, payload))
            .await
            .map_err(|_| anyhow::anyhow!("game writer gone"))
    }

    fn user(&self) -> Option<&console::UserDto> {
        self.user.as_ref()
    }

    async fn dispatch(&mut self, frame: GameFrame) -> anyhow::Result<Flow> {
        let code = frame.code;
        debug!(peer = %self.peer, code, name = codes::name(code), "frame");

        if self.user.is_none() && !codes::allowed_before_auth(code) {
            self.send(code, FAIL.to_vec()).await?;
            return Ok(Flow::Continue);
        }

        match code {
            codes::AUTHORIZATION_HANDSHAKE | codes::CLIENT_HOST_AND_USERNAME => {
                // handshake already done; a repeat is noise
                debug!(peer = %self.peer, "handshake frame after handshake");
                Ok(Flow::Continue)
            }
            codes::CLIENT_AUTHENTICATION => self.on_authenticate(&frame).await,
            codes::CREATE_NEW_ACCOUNT => {
                self.on_create_account(&frame).await?;
                Ok(Flow::Continue)
            }
            codes::LIST_GAMES => {
                self.on_list_games().await?;
                Ok(Flow::Continue)
            }
            codes::LIST_CHANNELS => {
                self.send(code, backend::build_channel_list()).await?;
                Ok(Flow::Continue)
            }
            codes::SELECT_CHANNEL => {
                if let Ok(channel) = backend::parse_select_channel(&frame.payload) {
                    debug!(peer = %self.peer, %channel, "channel selected");
                }
                Ok(Flow::Continue)
            }
            codes::SEND_LOBBY_MESSAGE => {
                self.on_chat(&frame).await?;
                Ok(Flow::Continue)
            }
            codes::PING_CLOCK_TIME => {
                self.send(code, OK.to_vec()).await?;
                Ok(Flow::Continue)
            }
            codes::CREATE_GAME => {
                self.on_create_game(&frame).await?;
                Ok(Flow::Continue)
            }
            codes::JOIN_GAME => {
                self.on_join_game(&frame).await?;
                Ok(Flow::Continue)
            }
            codes::SELECT_GAME => {
                self.on_select_game(&frame).await?;
                Ok(Flow::Continue)
            }
            codes::GET_CHARACTERS => {
                self.on_get_characters(&frame).await?;
                Ok(Flow::Continue)
            }
            codes::DELETE_CHARACTER => {
                self.on_delete_character(&frame).await?;
                Ok(Flow::Continue)
            }
            codes::SELECT_CHARACTER => {
                self.on_select_character(&frame).await?;
                Ok(Flow::Continue)
            }
            codes::CREATE_CHARACTER => {
                self.on_create_character(&frame).await?;
                Ok(Flow::Continue)
            }
            codes::UPDATE_CHARACTER_STATS => {
                self.on_update_stats(&frame).await?;
                Ok(Flow::Continue)
            }
            codes::UPDATE_CHARACTER_INVENTORY => {
                self.on_update_inventory(&frame).await?;
                Ok(Flow::Continue)
            }
            codes::GET_CHARACTER_INVENTORY => {
                self.on_get_inventory(&frame).await?;
                Ok(Flow::Continue)
            }
            codes::GET_CHARACTER_SPELLS => {
                self.on_get_spells(&frame).await?;
                Ok(Flow::Continue)
            }
            codes::UPDATE_CHARACTER_SPELLS => {
                self.on_update_spells(&frame).await?;
                Ok(Flow::Continue)
            }
            codes::SHOW_RANKING => {
                self.on_ranking(&frame).await?;
                Ok(Flow::Continue)
            }
            other => {
                warn!(peer = %self.peer, code = other, "unknown command");
                self.send(other, FAIL.to_vec()).await?;
                Ok(Flow::Continue)
            }
        }
    }

    // ---- accounts ----

    async fn on_authenticate(&mut self, frame: &GameFrame) -> anyhow::Result<Flow> {
        if self.user.is_some() {
            // double login
            self.send(frame.code, FAIL.to_vec()).await?;
            return Ok(Flow::Continue);
        }
        let req = match backend::parse_client_authentication(&frame.payload) {
            Ok(req) => req,
            Err(err) => {
                debug!(peer = %self.peer, %err, "bad authentication payload");
                self.send(frame.code, FAIL.to_vec()).await?;
                return Ok(Flow::Continue);
            }
        };
        let user = match self
            .ctx
            .console
            .authenticate_user(&req.username, &req.password)
            .await
        {
            Ok(user) => user,
            Err(err) => {
                debug!(peer = %self.peer, %err, "authentication refused");
                self.send(frame.code, FAIL.to_vec()).await?;
                return Ok(Flow::Continue);
            }
        };

        let player = lobby::Player {
            user_id: user.user_id,
            username: user.user_name.clone(),
            character_id: 0,
            class_type: 0,
            ip_address: self.ctx.my_ip.to_string(),
        };
        let (link, incoming) = match LobbyLink::connect(
            &self.ctx.lobby_addr,
            user.user_id,
            &user.user_name,
            player,
        )
        .await
        {
            Ok(pair) => pair,
            Err(err) => {
                warn!(peer = %self.peer, %err, "lobby link failed");
                self.send(frame.code, FAIL.to_vec()).await?;
                return Ok(Flow::Continue);
            }
        };

        self.net = Some(SessionNet {
            user_id: user.user_id,
            username: user.user_name.clone(),
            game_tx: self.game_tx.clone(),
            signal_tx: link.outgoing.clone(),
        });
        info!(peer = %self.peer, user_id = user.user_id, username = %user.user_name, "signed in");
        self.user = Some(user);
        self.lobby = Some(link);
        self.send(frame.code, OK.to_vec()).await?;
        Ok(Flow::LobbyUp(incoming))
    }

    async fn on_create_account(&mut self, frame: &GameFrame) -> anyhow::Result<()> {
        let req = match backend::parse_create_new_account(&frame.payload) {
            Ok(req) => req,
            Err(_) => return self.send(frame.code, FAIL.to_vec()).await,
        };
        let field_ok = |s: &str| (1..=backend::MAX_ACCOUNT_FIELD_LEN).contains(&s.len());
        if !field_ok(&req.username) || !field_ok(&req.password) {
            return self.send(frame.code, FAIL.to_vec()).await;
        }
        match self
            .ctx
            .console
            .create_user(&req.username, &req.password)
            .await
        {
            Ok(user) => {
                info!(peer = %self.peer, username = %req.username, user_id = user.user_id, "account created");
                self.send(frame.code, OK.to_vec()).await
            }
            Err(err) => {
                debug!(peer = %self.peer, %err, "account creation refused");
                self.send(frame.code, FAIL.to_vec()).await
            }
        }
    }

    // ---- rooms ----

    async fn on_list_games(&mut self) -> anyhow::Result<()> {
        let games = match self.ctx.console.list_games().await {
            Ok(games) => games,
            Err(err) => {
                warn!(peer = %self.peer, %err, "list games failed");
                return self.send(codes::LIST_GAMES, FAIL.to_vec()).await;
            }
        };
        let rooms: Vec<backend::RoomListing> = games
            .iter()
            .map(|g| backend::RoomListing {
                host_ip: g
                    .host_ip_address
                    .parse()
                    .unwrap_or(Ipv4Addr::UNSPECIFIED),
                name: g.game_name.clone(),
                password: g.password.clone(),
            })
            .collect();
        self.send(codes::LIST_GAMES, backend::build_game_list(&rooms))
            .await
    }

    async fn on_create_game(&mut self, frame: &GameFrame) -> anyhow::Result<()> {
        let Some(user) = self.user().cloned() else {
            return self.send(frame.code, FAIL.to_vec()).await;
        };
        let req = match backend::parse_create_game(&frame.payload) {
            Ok(req) => req,
            Err(err) => {
                debug!(peer = %self.peer, %err, "bad create game payload");
                return self.send(frame.code, FAIL.to_vec()).await;
            }
        };
        let Some(net) = self.net.clone() else {
            return self.send(frame.code, FAIL.to_vec()).await;
        };

        match req.state {
            backend::GAME_STATE_NONE => {
                let host_ip = match self
                    .proxy
                    .create_room(
                        CreateParams {
                            room_id: req.room_name.clone(),
                        },
                        &net,
                    )
                    .await
                {
                    Ok(ip) => ip,
                    Err(err) => {
                        warn!(peer = %self.peer, %err, "proxy create room failed");
                        return self.send(frame.code, FAIL.to_vec()).await;
                    }
                };
                let created = self
                    .ctx
                    .console
                    .create_game(&console::CreateGameRequest {
                        game_name: req.room_name.clone(),
                        password: req.password.clone(),
                        map_id: req.map_id,
                        host_user_id: user.user_id,
                        host_ip_address: host_ip.to_string(),
                    })
                    .await;
                match created {
                    Ok(_) => {
                        self.pending_room = Some(req.room_name.clone());
                        self.send(frame.code, vec![1, 0, 0, 0]).await
                    }
                    Err(err) => {
                        debug!(peer = %self.peer, %err, "create game refused");
                        self.send(frame.code, FAIL.to_vec()).await
                    }
                }
            }
            backend::GAME_STATE_CREATING => {
                let Some(room) = self.pending_room.take() else {
                    return self.send(frame.code, FAIL.to_vec()).await;
                };
                if let Err(err) = self.ctx.console.set_game_ready(&room).await {
                    warn!(peer = %self.peer, %err, "commit game failed");
                    return self.send(frame.code, FAIL.to_vec()).await;
                }
                if let Err(err) = self
                    .proxy
                    .host_room(HostParams { room_id: room.clone() }, &net)
                    .await
                {
                    warn!(peer = %self.peer, %err, "proxy host room failed");
                }
                self.in_room = Some(room);
                self.send(frame.code, vec![2, 0, 0, 0]).await
            }
            _ => self.send(frame.code, FAIL.to_vec()).await,
        }
    }

    /// Resolve this room's players to the addresses the game should dial,
    /// establishing tunnels to any the proxy has not seen yet.
    async fn resolve_players(
        &self,
        game: &console::GameDto,
        net: &SessionNet,
    ) -> Vec<backend::GamePlayerListing> {
        let mut out = Vec::with_capacity(game.players.len());
        for p in &game.players {
            if p.user_id == net.user_id {
                continue;
            }
            let params = GetPlayerAddrParams {
                room_id: game.game_name.clone(),
                user_id: p.user_id,
                ip_address: p.ip_address.clone(),
                host_user_id: game.host_user_id,
            };
            let addr = match self.proxy.connect_to_player(params, net).await {
                Ok(addr) => addr,
                Err(err) => {
                    warn!(user_id = p.user_id, %err, "no address for player");
                    continue;
                }
            };
            out.push(backend::GamePlayerListing {
                class_type: p.class_type,
                ip_address: addr,
                username: p.user_name.clone(),
            });
        }
        out
    }

    fn game_data(game: &console::GameDto) -> GameData {
        GameData {
            room_id: game.game_name.clone(),
            host_user_id: game.host_user_id,
            players: game
                .players
                .iter()
                .map(|p| RemotePlayer {
                    user_id: p.user_id,
                    username: p.user_name.clone(),
                    class_type: p.class_type,
                    ip_address: p.ip_address.clone(),
                })
                .collect(),
        }
    }

    async fn on_select_game(&mut self, frame: &GameFrame) -> anyhow::Result<()> {
        if self.in_room.is_some() {
            return self.send(frame.code, FAIL.to_vec()).await;
        }
        let room_name = match backend::parse_select_game(&frame.payload) {
            Ok(name) => name,
            Err(_) => return self.send(frame.code, FAIL.to_vec()).await,
        };
        let Some(net) = self.net.clone() else {
            return self.send(frame.code, FAIL.to_vec()).await;
        };
        let game = match self.ctx.console.get_game(&room_name).await {
            Ok(game) => game,
            Err(err) => {
                debug!(peer = %self.peer, %err, "select game: no such room");
                return self.send(frame.code, FAIL.to_vec()).await;
            }
        };
        if let Err(err) = self.proxy.select_game(Self::game_data(&game), &net).await {
            warn!(peer = %self.peer, %err, "proxy select game failed");
            return self.send(frame.code, FAIL.to_vec()).await;
        }
        let players = self.resolve_players(&game, &net).await;
        self.send(frame.code, backend::build_select_game(game.map_id, &players))
            .await
    }

    async fn on_join_game(&mut self, frame: &GameFrame) -> anyhow::Result<()> {
        if self.in_room.is_some() {
            return self.send(frame.code, FAIL.to_vec()).await;
        }
        let room_name = match backend::parse_join_game(&frame.payload) {
            Ok(name) => name,
            Err(_) => return self.send(frame.code, FAIL.to_vec()).await,
        };
        let Some(net) = self.net.clone() else {
            return self.send(frame.code, FAIL.to_vec()).await;
        };
        let game = match self.ctx.console.get_game(&room_name).await {
            Ok(game) => game,
            Err(err) => {
                debug!(peer = %self.peer, %err, "join game: no such room");
                return self.send(frame.code, FAIL.to_vec()).await;
            }
        };
        let my_addr = match self
            .proxy
            .join(
                JoinParams {
                    room_id: game.game_name.clone(),
                    host_user_id: game.host_user_id,
                    host_user_ip: game.host_ip_address.clone(),
                },
                &net,
            )
            .await
        {
            Ok(addr) => addr,
            Err(err) => {
                warn!(peer = %self.peer, %err, "proxy join failed");
                return self.send(frame.code, FAIL.to_vec()).await;
            }
        };
        let joined = self
            .ctx
            .console
            .join_game(&console::JoinGameRequest {
                game_name: game.game_name.clone(),
                user_id: net.user_id,
                ip_address: my_addr.to_string(),
            })
            .await;
        let joined = match joined {
            Ok(game) => game,
            Err(err) => {
                debug!(peer = %self.peer, %err, "join game refused");
                return self.send(frame.code, FAIL.to_vec()).await;
            }
        };
        self.in_room = Some(joined.game_name.clone());
        let players = self.resolve_players(&joined, &net).await;
        let state = if joined.ready {
            backend::GAME_STATE_STARTED as u16
        } else {
            backend::GAME_STATE_CREATING as u16
        };
        self.send(frame.code, backend::build_join_game(state, &players))
            .await
    }

    // ---- chat ----

    async fn on_chat(&mut self, frame: &GameFrame) -> anyhow::Result<()> {
        let text = match backend::parse_send_lobby_message(&frame.payload) {
            Ok(text) => text,
            Err(_) => return Ok(()),
        };
        if text.is_empty() || text.len() > backend::MAX_CHAT_LEN {
            debug!(peer = %self.peer, len = text.len(), "chat message out of bounds");
            return Ok(());
        }
        let (Some(user), Some(link)) = (self.user.as_ref(), self.lobby.as_ref()) else {
            return Ok(());
        };
        let env = Envelope::broadcast(
            user.user_id.to_string(),
            LobbyBody::Chat(lobby::ChatMessage {
                from: user.user_name.clone(),
                text,
            }),
        );
        if link.outgoing.send(env).await.is_err() {
            warn!(peer = %self.peer, "lobby link closed, chat dropped");
        }
        Ok(())
    }

    // ---- characters ----

    async fn on_get_characters(&mut self, frame: &GameFrame) -> anyhow::Result<()> {
        if backend::parse_get_characters(&frame.payload).is_err() {
            return self.send(frame.code, FAIL.to_vec()).await;
        }
        let Some(user) = self.user().cloned() else {
            return self.send(frame.code, FAIL.to_vec()).await;
        };
        match self.ctx.console.list_characters(user.user_id).await {
            Ok(characters) => {
                let names: Vec<String> =
                    characters.into_iter().map(|c| c.character_name).collect();
                self.send(frame.code, backend::build_character_list(&names))
                    .await
            }
            Err(err) => {
                warn!(peer = %self.peer, %err, "list characters failed");
                self.send(frame.code, FAIL.to_vec()).await
            }
        }
    }

    async fn on_select_character(&mut self, frame: &GameFrame) -> anyhow::Result<()> {
        let Some(user) = self.user().cloned() else {
            return self.send(frame.code, FAIL.to_vec()).await;
        };
        let req = match backend::parse_select_character(&frame.payload) {
            Ok(req) => req,
            Err(_) => return self.send(frame.code, FAIL.to_vec()).await,
        };
        match self
            .ctx
            .console
            .get_character(user.user_id, &req.character_name)
            .await
        {
            Ok(character) => match decode_stats(&character.stats) {
                Some(stats) => {
                    self.send(frame.code, backend::build_select_character(&stats).to_vec())
                        .await
                }
                None => self.send(frame.code, FAIL.to_vec()).await,
            },
            Err(err) => {
                debug!(peer = %self.peer, %err, "select character failed");
                self.send(frame.code, FAIL.to_vec()).await
            }
        }
    }

    async fn on_create_character(&mut self, frame: &GameFrame) -> anyhow::Result<()> {
        let Some(user) = self.user().cloned() else {
            return self.send(frame.code, FAIL.to_vec()).await;
        };
        let req = match backend::parse_create_character(&frame.payload) {
            Ok(req) => req,
            Err(_) => return self.send(frame.code, FAIL.to_vec()).await,
        };
        match self
            .ctx
            .console
            .create_character(user.user_id, &req.character_name, &req.stats)
            .await
        {
            Ok(_) => self.send(frame.code, OK.to_vec()).await,
            Err(err) => {
                debug!(peer = %self.peer, %err, "create character refused");
                self.send(frame.code, FAIL.to_vec()).await
            }
        }
    }

    async fn on_delete_character(&mut self, frame: &GameFrame) -> anyhow::Result<()> {
        let Some(user) = self.user().cloned() else {
            return self.send(frame.code, FAIL.to_vec()).await;
        };
        let req = match backend::parse_delete_character(&frame.payload) {
            Ok(req) => req,
            Err(_) => return self.send(frame.code, FAIL.to_vec()).await,
        };
        match self
            .ctx
            .console
            .delete_character(user.user_id, &req.character_name)
            .await
        {
            Ok(()) => {
                self.send(
                    frame.code,
                    backend::build_delete_character(&req.character_name),
                )
                .await
            }
            Err(err) => {
                debug!(peer = %self.peer, %err, "delete character failed");
                self.send(frame.code, FAIL.to_vec()).await
            }
        }
    }

    async fn on_update_stats(&mut self, frame: &GameFrame) -> anyhow::Result<()> {
        let Some(user) = self.user().cloned() else {
            return self.send(frame.code, FAIL.to_vec()).await;
        };
        let req = match backend::parse_update_character_stats(&frame.payload) {
            Ok(req) => req,
            Err(_) => return self.send(frame.code, FAIL.to_vec()).await,
        };
        match self
            .ctx
            .console
            .put_stats(user.user_id, &req.character_name, &req.stats)
            .await
        {
            // this one answers with an empty payload
            Ok(()) => self.send(frame.code, Vec::new()).await,
            Err(err) => {
                debug!(peer = %self.peer, %err, "update stats failed");
                self.send(frame.code, FAIL.to_vec()).await
            }
        }
    }

    async fn on_update_inventory(&mut self, frame: &GameFrame) -> anyhow::Result<()> {
        let Some(user) = self.user().cloned() else {
            return self.send(frame.code, FAIL.to_vec()).await;
        };
        let req = match backend::parse_update_character_inventory(&frame.payload) {
            Ok(req) => req,
            Err(_) => return self.send(frame.code, FAIL.to_vec()).await,
        };
        match self
            .ctx
            .console
            .put_inventory(user.user_id, &req.character.character_name, &req.inventory)
            .await
        {
            Ok(()) => self.send(frame.code, OK.to_vec()).await,
            Err(err) => {
                debug!(peer = %self.peer, %err, "update inventory failed");
                self.send(frame.code, FAIL.to_vec()).await
            }
        }
    }

    async fn on_get_inventory(&mut self, frame: &GameFrame) -> anyhow::Result<()> {
        let Some(user) = self.user().cloned() else {
            return self.send(frame.code, FAIL.to_vec()).await;
        };
        let req = match backend::parse_get_character_inventory(&frame.payload) {
            Ok(req) => req,
            Err(_) => return self.send(frame.code, FAIL.to_vec()).await,
        };
        let character = match self
            .ctx
            .console
            .get_character(user.user_id, &req.character_name)
            .await
        {
            Ok(character) => character,
            Err(err) => {
                debug!(peer = %self.peer, %err, "get inventory failed");
                return self.send(frame.code, FAIL.to_vec()).await;
            }
        };
        let inventory = character
            .inventory
            .as_deref()
            .and_then(console::decode_blob)
            .filter(|b| b.len() == dispelproto::character::INVENTORY_LEN);
        match inventory {
            Some(blob) => self.send(frame.code, blob).await,
            None => self.send(frame.code, FAIL.to_vec()).await,
        }
    }

    async fn on_get_spells(&mut self, frame: &GameFrame) -> anyhow::Result<()> {
        let Some(user) = self.user().cloned() else {
            return self.send(frame.code, FAIL.to_vec()).await;
        };
        let req = match backend::parse_get_character_spells(&frame.payload) {
            Ok(req) => req,
            Err(_) => return self.send(frame.code, FAIL.to_vec()).await,
        };
        let character = match self
            .ctx
            .console
            .get_character(user.user_id, &req.character_name)
            .await
        {
            Ok(character) => character,
            Err(err) => {
                debug!(peer = %self.peer, %err, "get spells failed");
                return self.send(frame.code, FAIL.to_vec()).await;
            }
        };
        // an absent blob still answers: the known slots come back as ones
        let mut spells = [0u8; dispelproto::character::SPELLS_LEN];
        if let Some(b) = character.spells.as_deref().and_then(console::decode_blob) {
            if b.len() == spells.len() {
                spells.copy_from_slice(&b);
            }
        }
        self.send(frame.code, backend::build_character_spells(&spells).to_vec())
            .await
    }

    async fn on_update_spells(&mut self, frame: &GameFrame) -> anyhow::Result<()> {
        let Some(user) = self.user().cloned() else {
            return self.send(frame.code, FAIL.to_vec()).await;
        };
        let req = match backend::parse_update_character_spells(&frame.payload) {
            Ok(req) => req,
            Err(_) => return self.send(frame.code, FAIL.to_vec()).await,
        };
        match self
            .ctx
            .console
            .put_spells(user.user_id, &req.character.character_name, &req.spells)
            .await
        {
            Ok(()) => self.send(frame.code, OK.to_vec()).await,
            Err(err) => {
                debug!(peer = %self.peer, %err, "update spells failed");
                self.send(frame.code, FAIL.to_vec()).await
            }
        }
    }

    async fn on_ranking(&mut self, frame: &GameFrame) -> anyhow::Result<()> {
        let req = match backend::parse_show_ranking(&frame.payload) {
            Ok(req) => req,
            Err(_) => return self.send(frame.code, FAIL.to_vec()).await,
        };
        let reply = match self
            .ctx
            .console
            .ranking(&console::GetRankingRequest {
                class_type: req.class_type as u8,
                offset: req.offset,
                user_name: req.username.clone(),
                character_name: req.character_name.clone(),
            })
            .await
        {
            Ok(reply) => reply,
            Err(err) => {
                warn!(peer = %self.peer, %err, "ranking failed");
                return self.send(frame.code, FAIL.to_vec()).await;
            }
        };
        let to_position = |p: &console::RankingPositionDto| backend::RankingPosition {
            rank: p.rank,
            points: p.points,
            username: p.user_name.clone(),
            character_name: p.character_name.clone(),
        };
        let players: Vec<backend::RankingPosition> =
            reply.positions.iter().map(to_position).collect();
        let current = to_position(&reply.current_player);
        self.send(frame.code, backend::build_ranking(&players, &current))
            .await
    }

    // ---- lobby inbound ----

    async fn on_lobby(&mut self, env: Envelope) -> anyhow::Result<()> {
        match &env.body {
            LobbyBody::Chat(msg) => {
                self.send(
                    codes::RECEIVE_MESSAGE,
                    backend::build_chat_broadcast(&msg.from, &msg.text),
                )
                .await
            }
            body => {
                if let Some(net) = self.net.clone() {
                    if let Err(err) = self.proxy.handle_lobby_event(body, &net).await {
                        warn!(peer = %self.peer, %err, kind = body.name(), "lobby event failed");
                    }
                }
                if matches!(body, LobbyBody::LeaveRoom(p) if self.user().map(|u| u.user_id) == Some(p.user_id))
                {
                    self.in_room = None;
                }
                Ok(())
            }
        }
    }

    async fn teardown(&mut self) {
        if let Some(net) = self.net.clone() {
            self.proxy.close(&net).await;
        }
        if let Some(user) = self.user.take() {
            if let Err(err) = self.ctx.console.leave_game(user.user_id).await {
                if !err.is_not_found() {
                    debug!(peer = %self.peer, %err, "leave game reconcile failed");
                }
            }
        }
        if let Some(mut link) = self.lobby.take() {
            link.shutdown();
        }
    }
}

fn decode_stats(text: &str) -> Option<[u8; dispelproto::character::STATS_LEN]> {
    console::decode_blob(text)?.try_into().ok()
}

/// Drive one accepted connection to completion.
pub async fn run<S>(
    ctx: Arc<SessionCtx>,
    stream: S,
    peer: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = GameFrameReader::new(read_half);

    let (game_tx, mut game_rx) = mpsc::channel::<GameWrite>(WRITE_DEPTH);
    let mut writer = tokio::spawn(async move {
        let mut writer = GameFrameWriter::new(write_half);
        while let Some((code, payload)) = game_rx.recv().await {
            if writer.write_frame(code, &payload).await.is_err() {
                break;
            }
            if writer.flush().await.is_err() {
                break;
            }
        }
    });

    let result = run_inner(ctx, &mut reader, game_tx, peer, &mut shutdown).await;
    // every sender is gone by now, so the writer drains and exits on its own
    if tokio::time::timeout(std::time::Duration::from_secs(5), &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
    result
}

async fn run_inner<R>(
    ctx: Arc<SessionCtx>,
    reader: &mut GameFrameReader<R>,
    game_tx: mpsc::Sender<GameWrite>,
    peer: SocketAddr,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
{
    // step 1: one raw ping byte before any framing
    match reader.read_ping_byte().await? {
        Some(backend::PING_BYTE) => {}
        Some(other) => {
            debug!(%peer, byte = other, "bad opening byte");
            return Ok(());
        }
        None => return Ok(()),
    }

    // step 2: host and username
    let Some(frame) = reader.read_frame().await? else {
        return Ok(());
    };
    if frame.code != codes::CLIENT_HOST_AND_USERNAME
        || backend::parse_host_and_username(&frame.payload).is_err()
    {
        debug!(%peer, code = frame.code, "handshake expected host/username");
        return Ok(());
    }
    game_tx
        .send((codes::CLIENT_HOST_AND_USERNAME, OK.to_vec()))
        .await
        .ok();

    // step 3: authorization key and version
    let Some(frame) = reader.read_frame().await? else {
        return Ok(());
    };
    if frame.code != codes::AUTHORIZATION_HANDSHAKE {
        debug!(%peer, code = frame.code, "handshake expected authorization");
        return Ok(());
    }
    match backend::parse_authorization(&frame.payload) {
        Ok(auth) => {
            debug!(%peer, version = auth.version, "authorized");
            game_tx
                .send((codes::AUTHORIZATION_HANDSHAKE, backend::AUTH_OK.to_vec()))
                .await
                .ok();
        }
        Err(err) => {
            debug!(%peer, %err, "authorization rejected");
            game_tx
                .send((codes::AUTHORIZATION_HANDSHAKE, FAIL.to_vec()))
                .await
                .ok();
            return Ok(());
        }
    }

    let proxy = AnyProxy::build(&ctx)?;
    let mut session = Session {
        ctx,
        peer,
        game_tx,
        proxy,
        user: None,
        net: None,
        lobby: None,
        pending_room: None,
        in_room: None,
    };
    let mut lobby_in: Option<mpsc::Receiver<Envelope>> = None;

    loop {
        tokio::select! {
            frame = reader.read_frame() => {
                match frame? {
                    Some(frame) => match session.dispatch(frame).await? {
                        Flow::Continue => {}
                        Flow::LobbyUp(incoming) => lobby_in = Some(incoming),
                    },
                    None => break,
                }
            }
            env = recv_lobby(&mut lobby_in) => {
                match env {
                    Some(env) => session.on_lobby(env).await?,
                    // lobby dropped from under us; the session keeps running
                    None => lobby_in = None,
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    session.teardown().await;
    info!(%peer, "session closed");
    Ok(())
}

async fn recv_lobby(lobby_in: &mut Option<mpsc::Receiver<Envelope>>) -> Option<Envelope> {
    match lobby_in {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::io::AsyncWriteExt;

    fn ctx() -> Arc<SessionCtx> {
        Arc::new(SessionCtx {
            console: ConsoleClient::new("http://127.0.0.1:1"),
            lobby_addr: "ws://127.0.0.1:1".into(),
            my_ip: Ipv4Addr::new(192, 168, 1, 7),
            flavor: ProxyFlavor::Lan,
            relay_addr: None,
            relay_secret: String::new(),
        })
    }

    fn spawn_session(
        server: tokio::io::DuplexStream,
    ) -> (tokio::task::JoinHandle<anyhow::Result<()>>, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let peer: SocketAddr = "127.0.0.1:51000".parse().unwrap();
        let handle = tokio::spawn(run(ctx(), server, peer, shutdown_rx));
        (handle, shutdown_tx)
    }

    async fn read_reply(client: &mut tokio::io::DuplexStream) -> (u8, Vec<u8>) {
        let mut header = [0u8; 4];
        client.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], 0xFF);
        let total = u16::from_le_bytes([header[2], header[3]]) as usize;
        let mut payload = vec![0u8; total - 4];
        client.read_exact(&mut payload).await.unwrap();
        (header[1], payload)
    }

    async fn handshake(client: &mut tokio::io::DuplexStream) {
        client.write_all(&[1]).await.unwrap();
        // FF 1E 19 00 "DESKTOP-1337ISH\0" "User\0"
        client
            .write_all(b"\xFF\x1E\x19\x00DESKTOP-1337ISH\0User\0")
            .await
            .unwrap();
        let (code, payload) = read_reply(client).await;
        assert_eq!(code, codes::CLIENT_HOST_AND_USERNAME);
        assert_eq!(payload, [1, 0, 0, 0]);

        // FF 06 10 00 "68XIPSID" 03 00 00 00
        client
            .write_all(b"\xFF\x06\x10\x0068XIPSID\x03\x00\x00\x00")
            .await
            .unwrap();
        let (code, payload) = read_reply(client).await;
        assert_eq!(code, codes::AUTHORIZATION_HANDSHAKE);
        assert_eq!(payload, b"ENET\0");
    }

    #[tokio::test]
    async fn handshake_happy_path() {
        let (mut client, server) = tokio::io::duplex(4096);
        let (handle, _shutdown) = spawn_session(server);
        handshake(&mut client).await;
        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wrong_authorization_key_is_rejected_and_closed() {
        let (mut client, server) = tokio::io::duplex(4096);
        let (handle, _shutdown) = spawn_session(server);

        client.write_all(&[1]).await.unwrap();
        client
            .write_all(b"\xFF\x1E\x19\x00DESKTOP-1337ISH\0User\0")
            .await
            .unwrap();
        let (_, payload) = read_reply(&mut client).await;
        assert_eq!(payload, [1, 0, 0, 0]);

        client
            .write_all(b"\xFF\x06\x10\x00BADKEY!!\x03\x00\x00\x00")
            .await
            .unwrap();
        let (code, payload) = read_reply(&mut client).await;
        assert_eq!(code, codes::AUTHORIZATION_HANDSHAKE);
        assert_eq!(payload, [0, 0, 0, 0]);

        // connection closes after the rejection
        let mut leftover = [0u8; 1];
        assert_eq!(client.read(&mut leftover).await.unwrap(), 0);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn bad_opening_byte_closes_without_reply() {
        let (mut client, server) = tokio::io::duplex(4096);
        let (handle, _shutdown) = spawn_session(server);
        client.write_all(&[9]).await.unwrap();
        let mut leftover = [0u8; 1];
        assert_eq!(client.read(&mut leftover).await.unwrap(), 0);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn commands_before_sign_in_fail_but_keep_the_connection() {
        let (mut client, server) = tokio::io::duplex(4096);
        let (_handle, _shutdown) = spawn_session(server);
        handshake(&mut client).await;

        // ListGames without authentication
        client.write_all(&[0xFF, 9, 4, 0]).await.unwrap();
        let (code, payload) = read_reply(&mut client).await;
        assert_eq!(code, codes::LIST_GAMES);
        assert_eq!(payload, [0, 0, 0, 0]);

        // still alive: the next command gets its own reply
        client.write_all(&[0xFF, 21, 4, 0]).await.unwrap();
        let (code, payload) = read_reply(&mut client).await;
        assert_eq!(code, codes::PING_CLOCK_TIME);
        assert_eq!(payload, [0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn unknown_command_gets_a_fail_reply() {
        let (mut client, server) = tokio::io::duplex(4096);
        let (_handle, _shutdown) = spawn_session(server);
        handshake(&mut client).await;

        client.write_all(&[0xFF, 200, 4, 0]).await.unwrap();
        let (code, payload) = read_reply(&mut client).await;
        assert_eq!(code, 200);
        assert_eq!(payload, [0, 0, 0, 0]);
    }

    // ---- signed-in flows against an in-process console ----

    fn frame(code: u8, payload: &[u8]) -> Vec<u8> {
        let total = (payload.len() + 4) as u16;
        let mut out = vec![0xFF, code];
        out.extend_from_slice(&total.to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    async fn rpc_stub(
        axum::extract::Path((service, method)): axum::extract::Path<(String, String)>,
        axum::Json(body): axum::Json<serde_json::Value>,
    ) -> axum::response::Response {
        use axum::response::IntoResponse;
        match (service.as_str(), method.as_str()) {
            ("UserService", "AuthenticateUser") => axum::Json(console::UserReply {
                user: console::UserDto {
                    user_id: 7,
                    user_name: "archer".into(),
                },
            })
            .into_response(),
            ("GameService", "CreateGame") => {
                let req: console::CreateGameRequest = serde_json::from_value(body).unwrap();
                axum::Json(console::GameReply {
                    game: console::GameDto {
                        game_name: req.game_name,
                        password: req.password,
                        map_id: req.map_id,
                        host_user_id: req.host_user_id,
                        host_ip_address: req.host_ip_address,
                        ready: false,
                        players: Vec::new(),
                    },
                })
                .into_response()
            }
            ("GameService", "SetGameReady") | ("GameService", "LeaveGame") => {
                axum::Json(console::Empty {}).into_response()
            }
            _ => (
                axum::http::StatusCode::NOT_FOUND,
                axum::Json(console::ErrorReply {
                    error: format!("{service}/{method}"),
                }),
            )
                .into_response(),
        }
    }

    /// Console double: canned RPC answers plus the real lobby endpoint.
    async fn spawn_console() -> SocketAddr {
        let (rooms, _rooms_loop) = roomsvc::RoomService::start();
        let app = axum::Router::new()
            .route(
                "/grpc/:service/:method",
                axum::routing::post(rpc_stub),
            )
            .merge(
                axum::Router::new()
                    .route("/lobby", axum::routing::get(roomsvc::ws::lobby_handler))
                    .with_state(rooms),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn spawn_session_against(
        console: SocketAddr,
        server: tokio::io::DuplexStream,
    ) -> (tokio::task::JoinHandle<anyhow::Result<()>>, watch::Sender<bool>) {
        let ctx = Arc::new(SessionCtx {
            console: ConsoleClient::new(format!("http://{console}")),
            lobby_addr: format!("ws://{console}"),
            my_ip: Ipv4Addr::new(192, 168, 1, 7),
            flavor: ProxyFlavor::Lan,
            relay_addr: None,
            relay_secret: String::new(),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let peer: SocketAddr = "127.0.0.1:51000".parse().unwrap();
        let handle = tokio::spawn(run(ctx, server, peer, shutdown_rx));
        (handle, shutdown_tx)
    }

    async fn sign_in(client: &mut tokio::io::DuplexStream) {
        let mut payload = 2u32.to_le_bytes().to_vec();
        payload.extend_from_slice(b"test\0archer\0");
        client
            .write_all(&frame(codes::CLIENT_AUTHENTICATION, &payload))
            .await
            .unwrap();
        let (code, reply) = read_reply(client).await;
        assert_eq!(code, codes::CLIENT_AUTHENTICATION);
        assert_eq!(reply, [1, 0, 0, 0]);
    }

    fn create_game_payload(state: u32) -> Vec<u8> {
        let mut payload = state.to_le_bytes().to_vec();
        payload.extend_from_slice(&3u32.to_le_bytes());
        payload.extend_from_slice(b"room\0\0");
        payload
    }

    #[tokio::test]
    async fn create_game_walks_both_states_then_rejects() {
        let console = spawn_console().await;
        let (mut client, server) = tokio::io::duplex(4096);
        let (_handle, _shutdown) = spawn_session_against(console, server);
        handshake(&mut client).await;
        sign_in(&mut client).await;

        // state 0 proposes the room
        client
            .write_all(&frame(codes::CREATE_GAME, &create_game_payload(0)))
            .await
            .unwrap();
        let (code, reply) = read_reply(&mut client).await;
        assert_eq!(code, codes::CREATE_GAME);
        assert_eq!(reply, [1, 0, 0, 0]);

        // state 1 commits it
        client
            .write_all(&frame(codes::CREATE_GAME, &create_game_payload(1)))
            .await
            .unwrap();
        let (code, reply) = read_reply(&mut client).await;
        assert_eq!(code, codes::CREATE_GAME);
        assert_eq!(reply, [2, 0, 0, 0]);

        // any other state fails
        client
            .write_all(&frame(codes::CREATE_GAME, &create_game_payload(5)))
            .await
            .unwrap();
        let (code, reply) = read_reply(&mut client).await;
        assert_eq!(code, codes::CREATE_GAME);
        assert_eq!(reply, [0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn commit_without_proposal_fails() {
        let console = spawn_console().await;
        let (mut client, server) = tokio::io::duplex(4096);
        let (_handle, _shutdown) = spawn_session_against(console, server);
        handshake(&mut client).await;
        sign_in(&mut client).await;

        client
            .write_all(&frame(codes::CREATE_GAME, &create_game_payload(1)))
            .await
            .unwrap();
        let (code, reply) = read_reply(&mut client).await;
        assert_eq!(code, codes::CREATE_GAME);
        assert_eq!(reply, [0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn oversized_chat_is_dropped_and_a_valid_one_comes_back() {
        let console = spawn_console().await;
        let (mut client, server) = tokio::io::duplex(4096);
        let (_handle, _shutdown) = spawn_session_against(console, server);
        handshake(&mut client).await;
        sign_in(&mut client).await;

        // one byte past the limit: no reply, no broadcast
        let long = "x".repeat(backend::MAX_CHAT_LEN + 1);
        let mut payload = long.into_bytes();
        payload.push(0);
        client
            .write_all(&frame(codes::SEND_LOBBY_MESSAGE, &payload))
            .await
            .unwrap();

        // a valid line echoes back from the lobby; had the long one gone
        // through, its broadcast would have arrived first
        client
            .write_all(&frame(codes::SEND_LOBBY_MESSAGE, b"hello\0"))
            .await
            .unwrap();
        let (code, reply) = read_reply(&mut client).await;
        assert_eq!(code, codes::RECEIVE_MESSAGE);
        assert_eq!(reply, backend::build_chat_broadcast("archer", "hello"));
    }
}
