//! `roomsvc`: the authoritative lobby.
//!
//! Owns who is online (presence map) and which game rooms exist (rooms map),
//! runs the single-consumer event loop that serializes all lobby traffic,
//! performs host election when a host disappears, and forwards WebRTC
//! signaling between peers.
//!
//! Rooms hold membership by user id only; every piece of per-user state lives
//! in the presence map and is looked up by id. That keeps the maps acyclic
//! and lets a room die without touching user state.

pub mod service;
pub mod ws;

pub use service::Event;
pub use service::RoomPlayer;
pub use service::RoomService;
pub use service::RoomSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomError {
    RoomExists,
    NoSuchRoom,
    NotInLobby,
    AlreadyInRoom,
}

impl std::fmt::Display for RoomError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoomError::RoomExists => write!(f, "room already exists"),
            RoomError::NoSuchRoom => write!(f, "no such room"),
            RoomError::NotInLobby => write!(f, "user is not in the lobby"),
            RoomError::AlreadyInRoom => write!(f, "user already occupies a room"),
        }
    }
}

impl std::error::Error for RoomError {}
