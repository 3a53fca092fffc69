//! `dispelproto`: the game's command protocol and the lobby/relay wires.
//!
//! Pure parsing and serialization, no I/O. Backend command payloads ride inside
//! a `lanio::frame` game frame; lobby messages are a single type-tag byte plus
//! a CBOR body; relay frames are a 32-byte signature plus a JSON body.
//!
//! Parsers take `&[u8]` payload slices (header already stripped by `lanio`)
//! and return owned request structs; builders return `Vec<u8>` payloads ready
//! to be framed.

pub mod backend;
pub mod character;
pub mod codes;
pub mod console;
pub mod lobby;
pub mod relay;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtoError {
    TooShort { need: usize, got: usize },
    UnknownCode(u8),
    Malformed(&'static str),
}

impl std::fmt::Display for ProtoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtoError::TooShort { need, got } => {
                write!(f, "payload too short: need {need}, got {got}")
            }
            ProtoError::UnknownCode(c) => write!(f, "unknown command code: {c}"),
            ProtoError::Malformed(s) => write!(f, "malformed payload: {s}"),
        }
    }
}

impl std::error::Error for ProtoError {}
