//! Request parsers and response builders for the backend command set.
//!
//! Requests walk the payload with a small cursor; variable-length fields are
//! null-terminated ASCII, fixed integers little-endian. A missing terminator
//! is a hard parse error. Builders emit payloads only; `lanio` adds the frame
//! header.

use std::net::Ipv4Addr;

use lanio::strings::push_cstring;
use lanio::strings::read_cstring;

use crate::ProtoError;
use crate::character::INVENTORY_LEN;
use crate::character::SPELLS_LEN;
use crate::character::STATS_LEN;
use crate::character::normalize_spells;

/// The fixed key the client must present in `AuthorizationHandshake`.
pub const AUTH_KEY: &[u8; 8] = b"68XIPSID";

/// Client protocol version carried after the key. Observed 3, not validated.
pub const CLIENT_VERSION: u32 = 3;

/// Reply payload closing a successful authorization handshake.
pub const AUTH_OK: &[u8; 5] = b"ENET\0";

/// Byte the client sends before any framed traffic.
pub const PING_BYTE: u8 = 1;

pub const OK: [u8; 4] = [1, 0, 0, 0];
pub const FAIL: [u8; 4] = [0, 0, 0, 0];

/// CreateGame FSM states on the wire.
pub const GAME_STATE_NONE: u32 = 0;
pub const GAME_STATE_CREATING: u32 = 1;
pub const GAME_STATE_STARTED: u32 = 2;

/// The fixed channel list served by `ListChannels`.
pub const CHANNELS: [&str; 3] = ["DISPEL", "Dispel Cyber", "Dispel Underground"];

pub const MAX_CHAT_LEN: usize = 87;
pub const MAX_ACCOUNT_FIELD_LEN: usize = 8;

/// Cursor over a command payload. Mirrors the order-sensitive field walks the
/// wire demands; `finish` rejects unconsumed trailing bytes for commands whose
/// length is exact.
struct Cursor<'a> {
    rest: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(payload: &'a [u8]) -> Self {
        Self { rest: payload }
    }

    fn u32(&mut self) -> Result<u32, ProtoError> {
        if self.rest.len() < 4 {
            return Err(ProtoError::TooShort {
                need: 4,
                got: self.rest.len(),
            });
        }
        let v = u32::from_le_bytes([self.rest[0], self.rest[1], self.rest[2], self.rest[3]]);
        self.rest = &self.rest[4..];
        Ok(v)
    }

    fn cstring(&mut self) -> Result<String, ProtoError> {
        let (s, rest) =
            read_cstring(self.rest).ok_or(ProtoError::Malformed("missing null terminator"))?;
        self.rest = rest;
        Ok(s.to_owned())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtoError> {
        if self.rest.len() < n {
            return Err(ProtoError::TooShort {
                need: n,
                got: self.rest.len(),
            });
        }
        let (head, rest) = self.rest.split_at(n);
        self.rest = rest;
        Ok(head)
    }

    fn finish(self) -> Result<(), ProtoError> {
        if self.rest.is_empty() {
            Ok(())
        } else {
            Err(ProtoError::Malformed("trailing bytes after payload"))
        }
    }
}

// ---- handshake ----

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAndUsernameRequest {
    pub computer_hostname: String,
    pub computer_username: String,
}

pub fn parse_host_and_username(p: &[u8]) -> Result<HostAndUsernameRequest, ProtoError> {
    let mut c = Cursor::new(p);
    let computer_hostname = c.cstring()?;
    let computer_username = c.cstring()?;
    c.finish()?;
    Ok(HostAndUsernameRequest {
        computer_hostname,
        computer_username,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthorizationRequest {
    pub version: u32,
}

/// Payload must be exactly 12 bytes: the 8-byte key then a u32 version.
pub fn parse_authorization(p: &[u8]) -> Result<AuthorizationRequest, ProtoError> {
    if p.len() != 12 {
        return Err(ProtoError::TooShort {
            need: 12,
            got: p.len(),
        });
    }
    if &p[..8] != AUTH_KEY {
        return Err(ProtoError::Malformed("wrong authorization key"));
    }
    let version = u32::from_le_bytes([p[8], p[9], p[10], p[11]]);
    Ok(AuthorizationRequest { version })
}

// ---- accounts ----

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAuthenticationRequest {
    pub unknown: u32,
    pub password: String,
    pub username: String,
}

/// Password precedes username on this wire.
pub fn parse_client_authentication(p: &[u8]) -> Result<ClientAuthenticationRequest, ProtoError> {
    let mut c = Cursor::new(p);
    let unknown = c.u32()?;
    let password = c.cstring()?;
    let username = c.cstring()?;
    c.finish()?;
    Ok(ClientAuthenticationRequest {
        unknown,
        password,
        username,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateNewAccountRequest {
    pub cd_key: u32,
    pub password: String,
    pub username: String,
}

pub fn parse_create_new_account(p: &[u8]) -> Result<CreateNewAccountRequest, ProtoError> {
    let mut c = Cursor::new(p);
    let cd_key = c.u32()?;
    let password = c.cstring()?;
    let username = c.cstring()?;
    c.finish()?;
    Ok(CreateNewAccountRequest {
        cd_key,
        password,
        username,
    })
}

// ---- rooms ----

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateGameRequest {
    pub state: u32,
    pub map_id: u32,
    pub room_name: String,
    pub password: String,
}

pub fn parse_create_game(p: &[u8]) -> Result<CreateGameRequest, ProtoError> {
    let mut c = Cursor::new(p);
    let state = c.u32()?;
    let map_id = c.u32()?;
    if map_id > 5 {
        return Err(ProtoError::Malformed("map id out of range"));
    }
    let room_name = c.cstring()?;
    let password = c.cstring()?;
    c.finish()?;
    Ok(CreateGameRequest {
        state,
        map_id,
        room_name,
        password,
    })
}

/// JoinGame carries the room name; the client appends bytes after it that are
/// not part of the contract, so the tail is tolerated.
pub fn parse_join_game(p: &[u8]) -> Result<String, ProtoError> {
    let mut c = Cursor::new(p);
    c.cstring()
}

pub fn parse_select_game(p: &[u8]) -> Result<String, ProtoError> {
    let mut c = Cursor::new(p);
    let room_name = c.cstring()?;
    c.finish()?;
    Ok(room_name)
}

// ---- characters ----

/// Username + character name pair shared by several character commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacterRef {
    pub username: String,
    pub character_name: String,
}

fn parse_character_ref(c: &mut Cursor<'_>) -> Result<CharacterRef, ProtoError> {
    Ok(CharacterRef {
        username: c.cstring()?,
        character_name: c.cstring()?,
    })
}

pub fn parse_select_character(p: &[u8]) -> Result<CharacterRef, ProtoError> {
    let mut c = Cursor::new(p);
    let r = parse_character_ref(&mut c)?;
    c.finish()?;
    Ok(r)
}

pub fn parse_delete_character(p: &[u8]) -> Result<CharacterRef, ProtoError> {
    let mut c = Cursor::new(p);
    let r = parse_character_ref(&mut c)?;
    c.finish()?;
    Ok(r)
}

pub fn parse_get_character_spells(p: &[u8]) -> Result<CharacterRef, ProtoError> {
    let mut c = Cursor::new(p);
    let r = parse_character_ref(&mut c)?;
    c.finish()?;
    Ok(r)
}

/// GetCharacterInventory tolerates unknown trailing bytes.
pub fn parse_get_character_inventory(p: &[u8]) -> Result<CharacterRef, ProtoError> {
    let mut c = Cursor::new(p);
    parse_character_ref(&mut c)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateCharacterRequest {
    pub stats: [u8; STATS_LEN],
    pub username: String,
    pub character_name: String,
}

pub fn parse_create_character(p: &[u8]) -> Result<CreateCharacterRequest, ProtoError> {
    let mut c = Cursor::new(p);
    let mut stats = [0u8; STATS_LEN];
    stats.copy_from_slice(c.take(STATS_LEN)?);
    let username = c.cstring()?;
    let character_name = c.cstring()?;
    c.finish()?;
    Ok(CreateCharacterRequest {
        stats,
        username,
        character_name,
    })
}

/// UpdateCharacterStats shares the CreateCharacter shape but the client
/// appends an unrecognized tail, which is tolerated.
pub fn parse_update_character_stats(p: &[u8]) -> Result<CreateCharacterRequest, ProtoError> {
    let mut c = Cursor::new(p);
    let mut stats = [0u8; STATS_LEN];
    stats.copy_from_slice(c.take(STATS_LEN)?);
    let username = c.cstring()?;
    let character_name = c.cstring()?;
    Ok(CreateCharacterRequest {
        stats,
        username,
        character_name,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateInventoryRequest {
    pub character: CharacterRef,
    pub inventory: [u8; INVENTORY_LEN],
}

pub fn parse_update_character_inventory(p: &[u8]) -> Result<UpdateInventoryRequest, ProtoError> {
    let mut c = Cursor::new(p);
    let character = parse_character_ref(&mut c)?;
    let mut inventory = [0u8; INVENTORY_LEN];
    inventory.copy_from_slice(c.take(INVENTORY_LEN)?);
    c.finish()?;
    Ok(UpdateInventoryRequest {
        character,
        inventory,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateSpellsRequest {
    pub character: CharacterRef,
    pub spells: [u8; SPELLS_LEN],
}

pub fn parse_update_character_spells(p: &[u8]) -> Result<UpdateSpellsRequest, ProtoError> {
    let mut c = Cursor::new(p);
    let character = parse_character_ref(&mut c)?;
    let mut spells = [0u8; SPELLS_LEN];
    spells.copy_from_slice(c.take(SPELLS_LEN)?);
    c.finish()?;
    Ok(UpdateSpellsRequest { character, spells })
}

/// GetCharacters carries the username with exactly one null terminator.
pub fn parse_get_characters(p: &[u8]) -> Result<String, ProtoError> {
    if p.iter().filter(|b| **b == 0).count() != 1 {
        return Err(ProtoError::Malformed("expected exactly one null terminator"));
    }
    let mut c = Cursor::new(p);
    c.cstring()
}

// ---- chat, channels, ranking ----

/// SendLobbyMessage: text up to the first null; rest ignored.
pub fn parse_send_lobby_message(p: &[u8]) -> Result<String, ProtoError> {
    let (text, _) =
        read_cstring(p).ok_or(ProtoError::Malformed("missing null terminator"))?;
    Ok(text.to_owned())
}

pub fn parse_select_channel(p: &[u8]) -> Result<String, ProtoError> {
    let mut c = Cursor::new(p);
    c.cstring()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankingRequest {
    pub class_type: u32,
    pub offset: u32,
    pub username: String,
    pub character_name: String,
}

pub fn parse_show_ranking(p: &[u8]) -> Result<RankingRequest, ProtoError> {
    let mut c = Cursor::new(p);
    let class_type = c.u32()?;
    let offset = c.u32()?;
    let username = c.cstring()?;
    let character_name = c.cstring()?;
    c.finish()?;
    Ok(RankingRequest {
        class_type,
        offset,
        username,
        character_name,
    })
}

// ---- response builders ----

/// One entry of the ListGames reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomListing {
    pub host_ip: Ipv4Addr,
    pub name: String,
    pub password: String,
}

pub fn build_game_list(rooms: &[RoomListing]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(rooms.len() as u32).to_le_bytes());
    for room in rooms {
        out.extend_from_slice(&room.host_ip.octets());
        push_cstring(&mut out, &room.name);
        push_cstring(&mut out, &room.password);
    }
    out
}

pub fn build_channel_list() -> Vec<u8> {
    let mut out = Vec::new();
    for ch in CHANNELS {
        push_cstring(&mut out, ch);
    }
    out
}

/// One remote player in a JoinGame/SelectGame reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GamePlayerListing {
    pub class_type: u8,
    pub ip_address: Ipv4Addr,
    pub username: String,
}

fn push_players(out: &mut Vec<u8>, players: &[GamePlayerListing]) {
    for p in players {
        out.extend_from_slice(&[p.class_type, 0, 0, 0]);
        out.extend_from_slice(&p.ip_address.octets());
        push_cstring(out, &p.username);
    }
}

/// JoinGame reply: u16 game state then the other players.
pub fn build_join_game(state: u16, players: &[GamePlayerListing]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&state.to_le_bytes());
    push_players(&mut out, players);
    out
}

/// SelectGame reply: u32 map id then the other players.
pub fn build_select_game(map_id: u32, players: &[GamePlayerListing]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&map_id.to_le_bytes());
    push_players(&mut out, players);
    out
}

/// SelectCharacter reply: `{1,0,0,0}` then the 56 stat bytes, 60 bytes total.
pub fn build_select_character(stats: &[u8; STATS_LEN]) -> [u8; 60] {
    let mut out = [0u8; 60];
    out[0] = 1;
    out[4..].copy_from_slice(stats);
    out
}

pub fn build_character_list(names: &[String]) -> Vec<u8> {
    if names.is_empty() {
        return FAIL.to_vec();
    }
    let mut out = OK.to_vec();
    out.extend_from_slice(&(names.len() as u32).to_le_bytes());
    for name in names {
        push_cstring(&mut out, name);
    }
    out
}

pub fn build_delete_character(character_name: &str) -> Vec<u8> {
    let mut out = Vec::new();
    push_cstring(&mut out, character_name);
    out
}

/// GetCharacterSpells reply; zero bytes in the known slots become ones.
pub fn build_character_spells(spells: &[u8; SPELLS_LEN]) -> [u8; SPELLS_LEN] {
    let mut out = *spells;
    normalize_spells(&mut out);
    out
}

/// ReceiveMessage subtype 4: lobby chat broadcast.
pub fn build_chat_broadcast(sender: &str, text: &str) -> Vec<u8> {
    let mut out = vec![4, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
    push_cstring(&mut out, sender);
    push_cstring(&mut out, text);
    out
}

/// HostMigration frame: whether the receiver became host, then the new host's
/// in-game IPv4.
pub fn build_host_migration(is_host: bool, new_host_ip: Ipv4Addr) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0] = u8::from(is_host);
    out[4..].copy_from_slice(&new_host_ip.octets());
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankingPosition {
    pub rank: u32,
    pub points: u32,
    pub username: String,
    pub character_name: String,
}

fn push_position(out: &mut Vec<u8>, p: &RankingPosition) {
    out.extend_from_slice(&p.rank.to_le_bytes());
    out.extend_from_slice(&p.points.to_le_bytes());
    push_cstring(out, &p.username);
    push_cstring(out, &p.character_name);
}

/// ShowRanking reply: the page entries then the requesting player's own row.
pub fn build_ranking(players: &[RankingPosition], current: &RankingPosition) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(players.len() as u32).to_le_bytes());
    for p in players {
        push_position(&mut out, p);
    }
    push_position(&mut out, current);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_and_username_vector() {
        // FF 1E 1A 00 "DESKTOP-1337ISH\0" "User\0", payload only
        let r = parse_host_and_username(b"DESKTOP-1337ISH\0User\0").unwrap();
        assert_eq!(r.computer_hostname, "DESKTOP-1337ISH");
        assert_eq!(r.computer_username, "User");
    }

    #[test]
    fn authorization_accepts_the_observed_key() {
        let r = parse_authorization(b"68XIPSID\x03\x00\x00\x00").unwrap();
        assert_eq!(r.version, 3);
    }

    #[test]
    fn authorization_rejects_wrong_key_and_length() {
        assert!(parse_authorization(b"BADKEY!!\x03\x00\x00\x00").is_err());
        assert!(parse_authorization(b"68XIPSID\x03\x00\x00").is_err());
        assert!(parse_authorization(b"68XIPSID\x03\x00\x00\x00\x00").is_err());
    }

    #[test]
    fn client_authentication_vector() {
        // FF 29 13 00 02 00 00 00 "test\0" "archer\0", payload only
        let r =
            parse_client_authentication(b"\x02\x00\x00\x00test\0archer\0").unwrap();
        assert_eq!(r.unknown, 2);
        assert_eq!(r.password, "test");
        assert_eq!(r.username, "archer");
    }

    #[test]
    fn create_game_vector() {
        // FF 1C 12 00 00 00 00 00 03 00 00 00 "room\0" \0, payload only
        let r = parse_create_game(b"\x00\x00\x00\x00\x03\x00\x00\x00room\0\0").unwrap();
        assert_eq!(r.state, GAME_STATE_NONE);
        assert_eq!(r.map_id, 3);
        assert_eq!(r.room_name, "room");
        assert_eq!(r.password, "");
    }

    #[test]
    fn create_game_rejects_map_out_of_range() {
        assert!(parse_create_game(b"\x00\x00\x00\x00\x06\x00\x00\x00room\0\0").is_err());
    }

    #[test]
    fn delete_character_needs_both_terminators() {
        assert!(parse_delete_character(b"user\0hero").is_err());
        assert!(parse_delete_character(b"userhero").is_err());
        let r = parse_delete_character(b"user\0hero\0").unwrap();
        assert_eq!(r.character_name, "hero");
    }

    #[test]
    fn get_characters_requires_exactly_one_null() {
        assert_eq!(parse_get_characters(b"archer\0").unwrap(), "archer");
        assert!(parse_get_characters(b"archer\0\0").is_err());
        assert!(parse_get_characters(b"archer").is_err());
    }

    #[test]
    fn update_spells_requires_exactly_43_bytes() {
        let mut p = Vec::new();
        push_cstring(&mut p, "user");
        push_cstring(&mut p, "hero");
        p.extend_from_slice(&[2u8; 42]);
        assert!(parse_update_character_spells(&p).is_err());
        p.push(2);
        assert!(parse_update_character_spells(&p).is_ok());
        p.push(2);
        assert!(parse_update_character_spells(&p).is_err());
    }

    #[test]
    fn game_list_layout() {
        let rooms = [RoomListing {
            host_ip: Ipv4Addr::new(127, 0, 0, 1),
            name: "room".into(),
            password: "".into(),
        }];
        let out = build_game_list(&rooms);
        assert_eq!(&out[..4], &[1, 0, 0, 0]);
        assert_eq!(&out[4..8], &[127, 0, 0, 1]);
        assert_eq!(&out[8..], b"room\0\0");
    }

    #[test]
    fn select_character_is_60_bytes() {
        let stats = [7u8; STATS_LEN];
        let out = build_select_character(&stats);
        assert_eq!(out.len(), 60);
        assert_eq!(&out[..4], &[1, 0, 0, 0]);
        assert_eq!(&out[4..], &stats);
    }

    #[test]
    fn chat_broadcast_layout() {
        let out = build_chat_broadcast("mage", "hello");
        assert_eq!(out[0], 4);
        assert_eq!(&out[1..12], &[0u8; 11]);
        assert_eq!(&out[12..], b"mage\0hello\0");
    }

    #[test]
    fn ranking_layout_ends_with_current_player() {
        let page = [RankingPosition {
            rank: 1,
            points: 999,
            username: "top".into(),
            character_name: "dog".into(),
        }];
        let me = RankingPosition {
            rank: 14,
            points: 50,
            username: "me".into(),
            character_name: "hero".into(),
        };
        let out = build_ranking(&page, &me);
        assert_eq!(&out[..4], &[1, 0, 0, 0]);
        assert!(out.ends_with(b"me\0hero\0"));
    }

    #[test]
    fn host_migration_layout() {
        let out = build_host_migration(true, Ipv4Addr::new(127, 0, 1, 2));
        assert_eq!(out, [1, 0, 0, 0, 127, 0, 1, 2]);
    }
}
