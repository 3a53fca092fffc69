use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use tokio::sync::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use dispelproto::lobby;
use dispelproto::lobby::Envelope;
use dispelproto::lobby::LobbyBody;
use dispelproto::lobby::Player;

use crate::RoomError;

/// Per-send budget for lobby writes; a slow client loses messages instead of
/// stalling the broadcast.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound queue depth per lobby socket.
pub const OUTBOUND_DEPTH: usize = 128;

const EVENT_DEPTH: usize = 256;

/// Events consumed by the single lobby event task.
#[derive(Debug)]
pub enum Event {
    /// A decoded message arriving on some user's lobby socket.
    Incoming { from: i64, envelope: Envelope },
    /// A lobby socket closed.
    Disconnected { user_id: i64 },
    /// Drain and reset all state, then stop the loop.
    Shutdown,
}

/// One connected user as the lobby tracks them.
#[derive(Debug, Clone)]
struct UserSession {
    user_id: i64,
    username: String,
    character_id: i64,
    class_type: u8,
    ip_address: String,
    room_id: Option<String>,
    connected_at: DateTime<Utc>,
    outbound: mpsc::Sender<Vec<u8>>,
}

impl UserSession {
    fn player(&self) -> Player {
        Player {
            user_id: self.user_id,
            username: self.username.clone(),
            character_id: self.character_id,
            class_type: self.class_type,
            ip_address: self.ip_address.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct GameRoom {
    name: String,
    password: String,
    map_id: u32,
    ready: bool,
    created_by: i64,
    host_user_id: i64,
    // membership by id only; joined-at drives host election
    players: HashMap<i64, DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

/// Public view of one room, with player state joined in from presence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub name: String,
    pub password: String,
    pub map_id: u32,
    pub ready: bool,
    pub created_by: i64,
    pub host_user_id: i64,
    pub players: Vec<RoomPlayer>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomPlayer {
    pub user_id: i64,
    pub username: String,
    pub character_id: i64,
    pub class_type: u8,
    pub ip_address: String,
    pub joined_at: DateTime<Utc>,
}

impl RoomSnapshot {
    pub fn host_ip_address(&self) -> Option<&str> {
        self.players
            .iter()
            .find(|p| p.user_id == self.host_user_id)
            .map(|p| p.ip_address.as_str())
    }
}

/// What `leave_room` did, for callers that relay the outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveOutcome {
    NotInAnyRoom,
    Left { room: String },
    RoomDestroyed { room: String },
    HostMigrated { room: String, new_host: i64 },
}

pub struct RoomService {
    presence: RwLock<HashMap<i64, UserSession>>,
    rooms: RwLock<HashMap<String, GameRoom>>,
    events_tx: mpsc::Sender<Event>,
}

impl RoomService {
    /// Build the service and spawn its event loop.
    pub fn start() -> (Arc<Self>, JoinHandle<()>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_DEPTH);
        let svc = Arc::new(Self {
            presence: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            events_tx,
        });
        let loop_svc = svc.clone();
        let handle = tokio::spawn(async move { loop_svc.event_loop(events_rx).await });
        (svc, handle)
    }

    pub fn events(&self) -> mpsc::Sender<Event> {
        self.events_tx.clone()
    }

    async fn event_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Event>) {
        while let Some(event) = rx.recv().await {
            match event {
                Event::Incoming { from, envelope } => self.handle_incoming(from, envelope).await,
                Event::Disconnected { user_id } => self.disconnect(user_id).await,
                Event::Shutdown => {
                    self.presence.write().await.clear();
                    self.rooms.write().await.clear();
                    info!("lobby event loop drained");
                    break;
                }
            }
        }
    }

    async fn handle_incoming(&self, from: i64, envelope: Envelope) {
        match &envelope.body {
            LobbyBody::Chat(chat) => {
                let text = chat.text.clone();
                self.broadcast_chat(from, &text).await;
            }
            LobbyBody::RtcOffer(_) | LobbyBody::RtcAnswer(_) | LobbyBody::RtcIceCandidate(_) => {
                self.forward(&envelope).await;
            }
            LobbyBody::SetRoomReady(room) => {
                let is_host = {
                    let rooms = self.rooms.read().await;
                    rooms.get(room).map(|r| r.host_user_id) == Some(from)
                };
                if is_host {
                    if let Err(err) = self.set_room_ready(room).await {
                        warn!(%err, room, "set-ready from socket failed");
                    }
                }
            }
            other => {
                // room membership is server-driven; clients cannot mutate it
                debug!(from, kind = other.name(), "dropping unsolicited lobby message");
            }
        }
    }

    /// Broadcast a chat line from `from` to every lobby member.
    pub async fn broadcast_chat(&self, from: i64, text: &str) {
        let (sender_name, targets) = {
            let presence = self.presence.read().await;
            let Some(sender) = presence.get(&from) else {
                return;
            };
            let targets: Vec<mpsc::Sender<Vec<u8>>> =
                presence.values().map(|s| s.outbound.clone()).collect();
            (sender.username.clone(), targets)
        };
        let envelope = Envelope::broadcast(
            from.to_string(),
            LobbyBody::Chat(lobby::ChatMessage {
                from: sender_name,
                text: text.to_owned(),
            }),
        );
        let Ok(frame) = lobby::encode(&envelope) else {
            return;
        };
        for tx in targets {
            Self::send_frame(&tx, frame.clone()).await;
        }
    }

    /// Forward an RTC message unchanged to its addressee. Silent drop when the
    /// addressee is offline or the address is not a user id.
    async fn forward(&self, envelope: &Envelope) {
        let Ok(to) = envelope.to.parse::<i64>() else {
            debug!(to = %envelope.to, "rtc forward with unparseable addressee");
            return;
        };
        let target = {
            let presence = self.presence.read().await;
            presence.get(&to).map(|s| s.outbound.clone())
        };
        let Some(tx) = target else {
            return;
        };
        if let Ok(frame) = lobby::encode(envelope) {
            Self::send_frame(&tx, frame).await;
        }
    }

    async fn send_frame(tx: &mpsc::Sender<Vec<u8>>, frame: Vec<u8>) {
        if let Err(err) = tx.send_timeout(frame, SEND_TIMEOUT).await {
            warn!(%err, "lobby send dropped");
        }
    }

    /// Register a user whose socket finished the lobby handshake. Sends the
    /// `LobbyUsers` snapshot (including the newcomer) to the newcomer and
    /// announces `JoinLobby` to everyone else.
    pub async fn register_session(
        &self,
        user: lobby::User,
        player: Player,
        outbound: mpsc::Sender<Vec<u8>>,
    ) -> Result<(), RoomError> {
        let session = UserSession {
            user_id: user.user_id,
            username: user.username,
            character_id: player.character_id,
            class_type: player.class_type,
            ip_address: player.ip_address,
            room_id: None,
            connected_at: Utc::now(),
            outbound: outbound.clone(),
        };
        let me = session.player();

        let (snapshot, others) = {
            let mut presence = self.presence.write().await;
            if presence.contains_key(&session.user_id) {
                return Err(RoomError::AlreadyInRoom);
            }
            presence.insert(session.user_id, session);
            let snapshot: Vec<Player> = presence.values().map(|s| s.player()).collect();
            let others: Vec<mpsc::Sender<Vec<u8>>> = presence
                .values()
                .filter(|s| s.user_id != me.user_id)
                .map(|s| s.outbound.clone())
                .collect();
            (snapshot, others)
        };

        info!(user_id = me.user_id, username = %me.username, "joined the lobby");

        let users = Envelope::directed("0", me.user_id.to_string(), LobbyBody::LobbyUsers(snapshot));
        if let Ok(frame) = lobby::encode(&users) {
            Self::send_frame(&outbound, frame).await;
        }
        let joined = Envelope::broadcast(me.user_id.to_string(), LobbyBody::JoinLobby(me));
        if let Ok(frame) = lobby::encode(&joined) {
            for tx in others {
                Self::send_frame(&tx, frame.clone()).await;
            }
        }
        Ok(())
    }

    /// Tear down a departed user: leave any room, drop presence, broadcast
    /// `LeaveLobby`.
    pub async fn disconnect(&self, user_id: i64) {
        let _ = self.leave_room(user_id).await;

        let (player, connected_at, remaining) = {
            let mut presence = self.presence.write().await;
            let Some(session) = presence.remove(&user_id) else {
                return;
            };
            let remaining: Vec<mpsc::Sender<Vec<u8>>> =
                presence.values().map(|s| s.outbound.clone()).collect();
            (session.player(), session.connected_at, remaining)
        };

        let online_for = Utc::now().signed_duration_since(connected_at);
        info!(user_id, username = %player.username, online_secs = online_for.num_seconds(), "left the lobby");
        let left = Envelope::broadcast(user_id.to_string(), LobbyBody::LeaveLobby(player));
        if let Ok(frame) = lobby::encode(&left) {
            for tx in remaining {
                Self::send_frame(&tx, frame.clone()).await;
            }
        }
    }

    pub async fn is_online(&self, user_id: i64) -> bool {
        self.presence.read().await.contains_key(&user_id)
    }

    pub async fn list_rooms(&self) -> Vec<RoomSnapshot> {
        let rooms = self.rooms.read().await;
        let presence = self.presence.read().await;
        let mut out: Vec<RoomSnapshot> = rooms
            .values()
            .map(|r| Self::snapshot_of(r, &presence))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub async fn get_room(&self, name: &str) -> Option<RoomSnapshot> {
        let rooms = self.rooms.read().await;
        let presence = self.presence.read().await;
        rooms.get(name).map(|r| Self::snapshot_of(r, &presence))
    }

    fn snapshot_of(room: &GameRoom, presence: &HashMap<i64, UserSession>) -> RoomSnapshot {
        let mut players: Vec<RoomPlayer> = room
            .players
            .iter()
            .filter_map(|(id, joined_at)| {
                presence.get(id).map(|s| RoomPlayer {
                    user_id: s.user_id,
                    username: s.username.clone(),
                    character_id: s.character_id,
                    class_type: s.class_type,
                    ip_address: s.ip_address.clone(),
                    joined_at: *joined_at,
                })
            })
            .collect();
        // host first, then join order
        players.sort_by_key(|p| (p.user_id != room.host_user_id, p.joined_at, p.user_id));
        RoomSnapshot {
            name: room.name.clone(),
            password: room.password.clone(),
            map_id: room.map_id,
            ready: room.ready,
            created_by: room.created_by,
            host_user_id: room.host_user_id,
            players,
            created_at: room.created_at,
        }
    }

    /// Create a room with the host as its first member. `Ready` stays false
    /// until the CreateGame commit frame arrives.
    pub async fn create_room(
        &self,
        host_user_id: i64,
        name: &str,
        password: &str,
        map_id: u32,
        host_ip: &str,
    ) -> Result<RoomSnapshot, RoomError> {
        let mut rooms = self.rooms.write().await;
        let mut presence = self.presence.write().await;

        if rooms.contains_key(name) {
            return Err(RoomError::RoomExists);
        }
        let host = presence.get_mut(&host_user_id).ok_or(RoomError::NotInLobby)?;
        if host.room_id.is_some() {
            return Err(RoomError::AlreadyInRoom);
        }
        host.room_id = Some(name.to_owned());
        host.ip_address = host_ip.to_owned();

        let now = Utc::now();
        let room = GameRoom {
            name: name.to_owned(),
            password: password.to_owned(),
            map_id,
            ready: false,
            created_by: host_user_id,
            host_user_id,
            players: HashMap::from([(host_user_id, now)]),
            created_at: now,
        };
        info!(room = name, host_user_id, "room created");
        let snap = Self::snapshot_of(&room, &presence);
        rooms.insert(name.to_owned(), room);
        Ok(snap)
    }

    /// Join an existing room. Other members learn about it with a `JoinRoom`
    /// broadcast.
    pub async fn join_room(
        &self,
        name: &str,
        user_id: i64,
        ip_address: &str,
    ) -> Result<RoomSnapshot, RoomError> {
        let (snap, joiner, notify) = {
            let mut rooms = self.rooms.write().await;
            let mut presence = self.presence.write().await;

            let room = rooms.get_mut(name).ok_or(RoomError::NoSuchRoom)?;
            let user = presence.get_mut(&user_id).ok_or(RoomError::NotInLobby)?;
            if user.room_id.is_some() || room.players.contains_key(&user_id) {
                return Err(RoomError::AlreadyInRoom);
            }
            user.room_id = Some(name.to_owned());
            user.ip_address = ip_address.to_owned();
            room.players.insert(user_id, Utc::now());

            let joiner = presence
                .get(&user_id)
                .map(|s| s.player())
                .ok_or(RoomError::NotInLobby)?;
            let notify: Vec<mpsc::Sender<Vec<u8>>> = room
                .players
                .keys()
                .filter(|id| **id != user_id)
                .filter_map(|id| presence.get(id).map(|s| s.outbound.clone()))
                .collect();
            (Self::snapshot_of(room, &presence), joiner, notify)
        };

        info!(room = name, user_id, "joined room");
        let joined = Envelope::broadcast(user_id.to_string(), LobbyBody::JoinRoom(joiner));
        if let Ok(frame) = lobby::encode(&joined) {
            for tx in notify {
                Self::send_frame(&tx, frame.clone()).await;
            }
        }
        Ok(snap)
    }

    /// Flip the ready gate and tell the members.
    pub async fn set_room_ready(&self, name: &str) -> Result<(), RoomError> {
        let notify = {
            let mut rooms = self.rooms.write().await;
            let presence = self.presence.read().await;
            let room = rooms.get_mut(name).ok_or(RoomError::NoSuchRoom)?;
            room.ready = true;
            room.players
                .keys()
                .filter_map(|id| presence.get(id).map(|s| s.outbound.clone()))
                .collect::<Vec<_>>()
        };
        info!(room = name, "room ready");
        let env = Envelope::broadcast("0", LobbyBody::SetRoomReady(name.to_owned()));
        if let Ok(frame) = lobby::encode(&env) {
            for tx in notify {
                Self::send_frame(&tx, frame.clone()).await;
            }
        }
        Ok(())
    }

    /// Remove a user from whatever room they occupy. Empty rooms die; a
    /// departing host triggers election and every remaining member hears a
    /// `LeaveRoom` plus a `HostMigration` naming the new host.
    pub async fn leave_room(&self, user_id: i64) -> LeaveOutcome {
        enum Planned {
            Destroyed,
            Left,
            Migrated(Player),
        }

        let (room_name, leaver, members, planned) = {
            let mut rooms = self.rooms.write().await;
            let mut presence = self.presence.write().await;

            let Some(room_name) = presence
                .get(&user_id)
                .and_then(|s| s.room_id.clone())
            else {
                return LeaveOutcome::NotInAnyRoom;
            };
            let leaver = match presence.get_mut(&user_id) {
                Some(s) => {
                    s.room_id = None;
                    s.player()
                }
                None => return LeaveOutcome::NotInAnyRoom,
            };
            let Some(room) = rooms.get_mut(&room_name) else {
                return LeaveOutcome::NotInAnyRoom;
            };
            room.players.remove(&user_id);

            if room.players.is_empty() {
                rooms.remove(&room_name);
                info!(room = %room_name, "room destroyed");
                (room_name, leaver, Vec::new(), Planned::Destroyed)
            } else {
                let was_host = room.host_user_id == user_id;
                let planned = if was_host {
                    // earliest joiner wins, ties to the smallest id
                    let new_host = room
                        .players
                        .iter()
                        .min_by_key(|(id, joined_at)| (**joined_at, **id))
                        .map(|(id, _)| *id);
                    match new_host {
                        Some(id) => {
                            room.host_user_id = id;
                            match presence.get(&id).map(|s| s.player()) {
                                Some(p) => Planned::Migrated(p),
                                None => Planned::Left,
                            }
                        }
                        None => Planned::Left,
                    }
                } else {
                    Planned::Left
                };
                let members: Vec<(i64, mpsc::Sender<Vec<u8>>)> = room
                    .players
                    .keys()
                    .filter_map(|id| presence.get(id).map(|s| (*id, s.outbound.clone())))
                    .collect();
                (room_name, leaver, members, planned)
            }
        };

        let left = Envelope::broadcast(user_id.to_string(), LobbyBody::LeaveRoom(leaver));
        let left_frame = lobby::encode(&left).ok();
        match planned {
            Planned::Destroyed => LeaveOutcome::RoomDestroyed { room: room_name },
            Planned::Left => {
                if let Some(frame) = left_frame {
                    for (_, tx) in &members {
                        Self::send_frame(tx, frame.clone()).await;
                    }
                }
                LeaveOutcome::Left { room: room_name }
            }
            Planned::Migrated(new_host) => {
                info!(room = %room_name, new_host = new_host.user_id, "host migrated");
                let migration = Envelope::broadcast(
                    new_host.user_id.to_string(),
                    LobbyBody::HostMigration(new_host.clone()),
                );
                let migration_frame = lobby::encode(&migration).ok();
                for (_, tx) in &members {
                    if let Some(frame) = &left_frame {
                        Self::send_frame(tx, frame.clone()).await;
                    }
                    if let Some(frame) = &migration_frame {
                        Self::send_frame(tx, frame.clone()).await;
                    }
                }
                LeaveOutcome::HostMigrated {
                    room: room_name,
                    new_host: new_host.user_id,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Duration;
    use tokio::time::sleep;

    async fn online(
        svc: &RoomService,
        user_id: i64,
        name: &str,
    ) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(OUTBOUND_DEPTH);
        svc.register_session(
            lobby::User {
                user_id,
                username: name.into(),
            },
            Player {
                user_id,
                username: name.into(),
                character_id: 1,
                class_type: 0,
                ip_address: "127.0.0.1".into(),
            },
            tx,
        )
        .await
        .unwrap();
        rx
    }

    fn decode_all(rx: &mut mpsc::Receiver<Vec<u8>>) -> Vec<LobbyBody> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(lobby::decode(&frame).unwrap().body);
        }
        out
    }

    #[tokio::test]
    async fn newcomer_gets_snapshot_including_self() {
        let (svc, _loop) = RoomService::start();
        let mut a = online(&svc, 1, "alpha").await;
        let mut b = online(&svc, 2, "beta").await;

        let first = decode_all(&mut a);
        assert!(matches!(&first[0], LobbyBody::LobbyUsers(users) if users.len() == 1));
        // alpha later hears beta join
        assert!(first.iter().chain(decode_all(&mut a).iter()).any(
            |m| matches!(m, LobbyBody::JoinLobby(p) if p.user_id == 2)
        ));

        let snapshot = decode_all(&mut b);
        assert!(matches!(&snapshot[0], LobbyBody::LobbyUsers(users) if users.len() == 2));
    }

    #[tokio::test]
    async fn create_room_rules() {
        let (svc, _loop) = RoomService::start();
        let _a = online(&svc, 1, "alpha").await;

        svc.create_room(1, "room", "", 3, "127.0.0.1").await.unwrap();
        assert_eq!(
            svc.create_room(1, "room", "", 3, "127.0.0.1").await.unwrap_err(),
            RoomError::RoomExists
        );
        assert_eq!(
            svc.create_room(9, "other", "", 3, "127.0.0.1").await.unwrap_err(),
            RoomError::NotInLobby
        );
        assert_eq!(
            svc.create_room(1, "second", "", 3, "127.0.0.1")
                .await
                .unwrap_err(),
            RoomError::AlreadyInRoom
        );

        let room = svc.get_room("room").await.unwrap();
        assert!(!room.ready);
        assert_eq!(room.host_user_id, 1);
        assert_eq!(room.players.len(), 1);
    }

    #[tokio::test]
    async fn join_and_double_join() {
        let (svc, _loop) = RoomService::start();
        let _a = online(&svc, 1, "alpha").await;
        let _b = online(&svc, 2, "beta").await;

        svc.create_room(1, "room", "", 1, "10.0.0.1").await.unwrap();
        svc.join_room("room", 2, "10.0.0.2").await.unwrap();
        assert_eq!(
            svc.join_room("room", 2, "10.0.0.2").await.unwrap_err(),
            RoomError::AlreadyInRoom
        );
        let room = svc.get_room("room").await.unwrap();
        assert_eq!(room.players.len(), 2);
        assert_eq!(room.host_ip_address(), Some("10.0.0.1"));
    }

    #[tokio::test]
    async fn host_leave_elects_earliest_joiner() {
        let (svc, _loop) = RoomService::start();
        let _a = online(&svc, 5, "alpha").await;
        let mut b = online(&svc, 2, "beta").await;
        let mut c = online(&svc, 3, "gamma").await;

        svc.create_room(5, "room", "", 1, "10.0.0.1").await.unwrap();
        svc.join_room("room", 2, "10.0.0.2").await.unwrap();
        sleep(Duration::from_millis(5)).await;
        svc.join_room("room", 3, "10.0.0.3").await.unwrap();

        let outcome = svc.leave_room(5).await;
        assert_eq!(
            outcome,
            LeaveOutcome::HostMigrated {
                room: "room".into(),
                new_host: 2
            }
        );

        for rx in [&mut b, &mut c] {
            let msgs = decode_all(rx);
            assert!(msgs
                .iter()
                .any(|m| matches!(m, LobbyBody::LeaveRoom(p) if p.user_id == 5)));
            assert!(msgs
                .iter()
                .any(|m| matches!(m, LobbyBody::HostMigration(p) if p.user_id == 2)));
        }
        assert_eq!(svc.get_room("room").await.unwrap().host_user_id, 2);
    }

    #[tokio::test]
    async fn last_leaver_destroys_room() {
        let (svc, _loop) = RoomService::start();
        let _a = online(&svc, 1, "alpha").await;
        svc.create_room(1, "room", "", 1, "10.0.0.1").await.unwrap();
        assert_eq!(
            svc.leave_room(1).await,
            LeaveOutcome::RoomDestroyed {
                room: "room".into()
            }
        );
        assert!(svc.get_room("room").await.is_none());
        // leaver can open a fresh room afterwards
        svc.create_room(1, "room", "", 1, "10.0.0.1").await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_removes_user_from_room_and_presence() {
        let (svc, _loop) = RoomService::start();
        let _a = online(&svc, 1, "alpha").await;
        let mut b = online(&svc, 2, "beta").await;
        svc.create_room(1, "room", "", 1, "10.0.0.1").await.unwrap();
        svc.join_room("room", 2, "10.0.0.2").await.unwrap();

        svc.disconnect(1).await;
        assert!(!svc.is_online(1).await);
        let room = svc.get_room("room").await.unwrap();
        assert_eq!(room.host_user_id, 2);

        let msgs = decode_all(&mut b);
        assert!(msgs
            .iter()
            .any(|m| matches!(m, LobbyBody::LeaveLobby(p) if p.user_id == 1)));
    }

    #[tokio::test]
    async fn rtc_forward_to_absent_peer_is_silent() {
        let (svc, _loop) = RoomService::start();
        let _a = online(&svc, 1, "alpha").await;
        let mut b = online(&svc, 2, "beta").await;
        decode_all(&mut b);

        let offer = Envelope::directed(
            "1",
            "2",
            LobbyBody::RtcOffer(lobby::SessionDescription {
                name: "1".into(),
                sdp: "v=0".into(),
            }),
        );
        svc.events()
            .send(Event::Incoming {
                from: 1,
                envelope: offer.clone(),
            })
            .await
            .unwrap();
        // addressee offline: no error, nothing delivered anywhere
        let ghost = Envelope::directed("1", "9", offer.body.clone());
        svc.events()
            .send(Event::Incoming {
                from: 1,
                envelope: ghost,
            })
            .await
            .unwrap();
        sleep(Duration::from_millis(20)).await;

        let msgs = decode_all(&mut b);
        assert_eq!(msgs.len(), 1);
        assert!(matches!(&msgs[0], LobbyBody::RtcOffer(s) if s.name == "1"));
    }

    #[tokio::test]
    async fn chat_reaches_everyone_including_sender() {
        let (svc, _loop) = RoomService::start();
        let mut a = online(&svc, 1, "alpha").await;
        let mut b = online(&svc, 2, "beta").await;
        decode_all(&mut a);
        decode_all(&mut b);

        svc.broadcast_chat(1, "hello").await;
        for rx in [&mut a, &mut b] {
            let msgs = decode_all(rx);
            assert!(msgs.iter().any(
                |m| matches!(m, LobbyBody::Chat(c) if c.from == "alpha" && c.text == "hello")
            ));
        }
    }
}
