//! Lobby WebSocket wire: every frame is one type-tag byte followed by a CBOR
//! body `{From, To, Type, Content}`. The tag and the `Type` field always
//! agree; the tag exists so a receiver can pick a decoder without parsing
//! CBOR first.

use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::ProtoError;

/// The well-known realm. Doubles as the WebSocket subprotocol and the
/// `protocol` field of the console's well-known document.
pub const REALM: &str = "dispel-multi";

/// Protocol version carried in the `X-Version` header.
pub const PROTO_VERSION: &str = "1.0";

/// The only lobby room name the console accepts.
pub const LOBBY_ROOM: &str = "DISPEL";

pub const TAG_HELLO: u8 = 1;
pub const TAG_WELCOME: u8 = 2;
pub const TAG_JOIN_LOBBY: u8 = 3;
pub const TAG_JOINED_LOBBY: u8 = 4;
pub const TAG_LOBBY_USERS: u8 = 5;
pub const TAG_LEAVE_LOBBY: u8 = 6;
pub const TAG_CHAT: u8 = 7;
pub const TAG_JOIN_ROOM: u8 = 8;
pub const TAG_LEAVE_ROOM: u8 = 9;
pub const TAG_SET_ROOM_READY: u8 = 10;
pub const TAG_HOST_MIGRATION: u8 = 11;
pub const TAG_RTC_OFFER: u8 = 12;
pub const TAG_RTC_ANSWER: u8 = 13;
pub const TAG_RTC_ICE_CANDIDATE: u8 = 14;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub user_id: i64,
    pub username: String,
}

/// Presence summary of one lobby member: identity plus selected character and
/// the in-game address other clients will dial.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub user_id: i64,
    pub username: String,
    pub character_id: i64,
    pub class_type: u8,
    pub ip_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub from: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescription {
    pub name: String,
    pub sdp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub name: String,
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

/// One lobby message body, tagged per the table above.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LobbyBody {
    Hello(User),
    Welcome,
    JoinLobby(Player),
    JoinedLobby,
    LobbyUsers(Vec<Player>),
    LeaveLobby(Player),
    Chat(ChatMessage),
    JoinRoom(Player),
    LeaveRoom(Player),
    SetRoomReady(String),
    HostMigration(Player),
    RtcOffer(SessionDescription),
    RtcAnswer(SessionDescription),
    RtcIceCandidate(IceCandidate),
}

impl LobbyBody {
    pub fn tag(&self) -> u8 {
        match self {
            LobbyBody::Hello(_) => TAG_HELLO,
            LobbyBody::Welcome => TAG_WELCOME,
            LobbyBody::JoinLobby(_) => TAG_JOIN_LOBBY,
            LobbyBody::JoinedLobby => TAG_JOINED_LOBBY,
            LobbyBody::LobbyUsers(_) => TAG_LOBBY_USERS,
            LobbyBody::LeaveLobby(_) => TAG_LEAVE_LOBBY,
            LobbyBody::Chat(_) => TAG_CHAT,
            LobbyBody::JoinRoom(_) => TAG_JOIN_ROOM,
            LobbyBody::LeaveRoom(_) => TAG_LEAVE_ROOM,
            LobbyBody::SetRoomReady(_) => TAG_SET_ROOM_READY,
            LobbyBody::HostMigration(_) => TAG_HOST_MIGRATION,
            LobbyBody::RtcOffer(_) => TAG_RTC_OFFER,
            LobbyBody::RtcAnswer(_) => TAG_RTC_ANSWER,
            LobbyBody::RtcIceCandidate(_) => TAG_RTC_ICE_CANDIDATE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LobbyBody::Hello(_) => "Hello",
            LobbyBody::Welcome => "Welcome",
            LobbyBody::JoinLobby(_) => "JoinLobby",
            LobbyBody::JoinedLobby => "JoinedLobby",
            LobbyBody::LobbyUsers(_) => "LobbyUsers",
            LobbyBody::LeaveLobby(_) => "LeaveLobby",
            LobbyBody::Chat(_) => "Chat",
            LobbyBody::JoinRoom(_) => "JoinRoom",
            LobbyBody::LeaveRoom(_) => "LeaveRoom",
            LobbyBody::SetRoomReady(_) => "SetRoomReady",
            LobbyBody::HostMigration(_) => "HostMigration",
            LobbyBody::RtcOffer(_) => "RTCOffer",
            LobbyBody::RtcAnswer(_) => "RTCAnswer",
            LobbyBody::RtcIceCandidate(_) => "RTCICECandidate",
        }
    }
}

/// A routed lobby message. `from`/`to` are user ids rendered as strings; an
/// empty `to` means broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: String,
    pub to: String,
    pub body: LobbyBody,
}

impl Envelope {
    pub fn broadcast(from: impl Into<String>, body: LobbyBody) -> Self {
        Self {
            from: from.into(),
            to: String::new(),
            body,
        }
    }

    pub fn directed(from: impl Into<String>, to: impl Into<String>, body: LobbyBody) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            body,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireBody<T> {
    #[serde(rename = "From")]
    from: String,
    #[serde(rename = "To")]
    to: String,
    #[serde(rename = "Type")]
    typ: u8,
    #[serde(rename = "Content")]
    content: T,
}

fn write_body<T: Serialize>(
    out: &mut Vec<u8>,
    from: &str,
    to: &str,
    typ: u8,
    content: &T,
) -> Result<(), ProtoError> {
    let wire = WireBody {
        from: from.to_owned(),
        to: to.to_owned(),
        typ,
        content,
    };
    ciborium::into_writer(&wire, out).map_err(|_| ProtoError::Malformed("cbor encode"))
}

fn read_body<T: DeserializeOwned>(b: &[u8]) -> Result<(String, String, T), ProtoError> {
    let wire: WireBody<T> =
        ciborium::from_reader(b).map_err(|_| ProtoError::Malformed("cbor decode"))?;
    Ok((wire.from, wire.to, wire.content))
}

/// Encode one lobby frame: tag byte plus CBOR body.
pub fn encode(env: &Envelope) -> Result<Vec<u8>, ProtoError> {
    let tag = env.body.tag();
    let mut out = vec![tag];
    let (from, to) = (env.from.as_str(), env.to.as_str());
    match &env.body {
        LobbyBody::Hello(u) => write_body(&mut out, from, to, tag, u)?,
        LobbyBody::Welcome | LobbyBody::JoinedLobby => {
            write_body(&mut out, from, to, tag, &())?
        }
        LobbyBody::JoinLobby(p)
        | LobbyBody::LeaveLobby(p)
        | LobbyBody::JoinRoom(p)
        | LobbyBody::LeaveRoom(p)
        | LobbyBody::HostMigration(p) => write_body(&mut out, from, to, tag, p)?,
        LobbyBody::LobbyUsers(ps) => write_body(&mut out, from, to, tag, ps)?,
        LobbyBody::Chat(c) => write_body(&mut out, from, to, tag, c)?,
        LobbyBody::SetRoomReady(room) => write_body(&mut out, from, to, tag, room)?,
        LobbyBody::RtcOffer(s) | LobbyBody::RtcAnswer(s) => {
            write_body(&mut out, from, to, tag, s)?
        }
        LobbyBody::RtcIceCandidate(c) => write_body(&mut out, from, to, tag, c)?,
    }
    Ok(out)
}

/// Decode one lobby frame.
pub fn decode(frame: &[u8]) -> Result<Envelope, ProtoError> {
    let (tag, body) = frame
        .split_first()
        .ok_or(ProtoError::TooShort { need: 1, got: 0 })?;

    let (from, to, body) = match *tag {
        TAG_HELLO => {
            let (f, t, u) = read_body::<User>(body)?;
            (f, t, LobbyBody::Hello(u))
        }
        TAG_WELCOME => {
            let (f, t, ()) = read_body::<()>(body)?;
            (f, t, LobbyBody::Welcome)
        }
        TAG_JOIN_LOBBY => {
            let (f, t, p) = read_body::<Player>(body)?;
            (f, t, LobbyBody::JoinLobby(p))
        }
        TAG_JOINED_LOBBY => {
            let (f, t, ()) = read_body::<()>(body)?;
            (f, t, LobbyBody::JoinedLobby)
        }
        TAG_LOBBY_USERS => {
            let (f, t, ps) = read_body::<Vec<Player>>(body)?;
            (f, t, LobbyBody::LobbyUsers(ps))
        }
        TAG_LEAVE_LOBBY => {
            let (f, t, p) = read_body::<Player>(body)?;
            (f, t, LobbyBody::LeaveLobby(p))
        }
        TAG_CHAT => {
            let (f, t, c) = read_body::<ChatMessage>(body)?;
            (f, t, LobbyBody::Chat(c))
        }
        TAG_JOIN_ROOM => {
            let (f, t, p) = read_body::<Player>(body)?;
            (f, t, LobbyBody::JoinRoom(p))
        }
        TAG_LEAVE_ROOM => {
            let (f, t, p) = read_body::<Player>(body)?;
            (f, t, LobbyBody::LeaveRoom(p))
        }
        TAG_SET_ROOM_READY => {
            let (f, t, room) = read_body::<String>(body)?;
            (f, t, LobbyBody::SetRoomReady(room))
        }
        TAG_HOST_MIGRATION => {
            let (f, t, p) = read_body::<Player>(body)?;
            (f, t, LobbyBody::HostMigration(p))
        }
        TAG_RTC_OFFER => {
            let (f, t, s) = read_body::<SessionDescription>(body)?;
            (f, t, LobbyBody::RtcOffer(s))
        }
        TAG_RTC_ANSWER => {
            let (f, t, s) = read_body::<SessionDescription>(body)?;
            (f, t, LobbyBody::RtcAnswer(s))
        }
        TAG_RTC_ICE_CANDIDATE => {
            let (f, t, c) = read_body::<IceCandidate>(body)?;
            (f, t, LobbyBody::RtcIceCandidate(c))
        }
        other => return Err(ProtoError::UnknownCode(other)),
    };
    Ok(Envelope { from, to, body })
}
