//! Console RPC wire: JSON bodies POSTed to `/grpc/<service>/<method>`.
//!
//! Character blobs (stats, inventory, spells) travel as base64 strings so the
//! bodies stay printable. Failures come back as `{"error": "..."}` with a
//! non-2xx status.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde::Serialize;

pub const USER_SERVICE: &str = "UserService";
pub const CHARACTER_SERVICE: &str = "CharacterService";
pub const GAME_SERVICE: &str = "GameService";
pub const RANKING_SERVICE: &str = "RankingService";

pub fn encode_blob(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_blob(text: &str) -> Option<Vec<u8>> {
    STANDARD.decode(text).ok()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReply {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDto {
    pub user_id: i64,
    pub user_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserRequest {
    pub user_name: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateUserRequest {
    pub user_name: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetUserRequest {
    pub user_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserReply {
    pub user: UserDto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterDto {
    pub character_id: i64,
    pub user_id: i64,
    pub character_name: String,
    /// 56 stat bytes, base64.
    pub stats: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spells: Option<String>,
    pub class_type: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListCharactersRequest {
    pub user_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListCharactersReply {
    pub characters: Vec<CharacterDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetCharacterRequest {
    pub user_id: i64,
    pub character_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterReply {
    pub character: CharacterDto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCharacterRequest {
    pub user_id: i64,
    pub character_name: String,
    pub stats: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteCharacterRequest {
    pub user_id: i64,
    pub character_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutStatsRequest {
    pub user_id: i64,
    pub character_name: String,
    pub stats: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutInventoryRequest {
    pub user_id: i64,
    pub character_name: String,
    pub inventory: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutSpellsRequest {
    pub user_id: i64,
    pub character_name: String,
    pub spells: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GamePlayerDto {
    pub user_id: i64,
    pub user_name: String,
    pub character_id: i64,
    pub class_type: u8,
    pub ip_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameDto {
    pub game_name: String,
    pub password: String,
    pub map_id: u32,
    pub host_user_id: i64,
    pub host_ip_address: String,
    pub ready: bool,
    pub players: Vec<GamePlayerDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListGamesRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListGamesReply {
    pub games: Vec<GameDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetGameRequest {
    pub game_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameReply {
    pub game: GameDto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGameRequest {
    pub game_name: String,
    pub password: String,
    pub map_id: u32,
    pub host_user_id: i64,
    pub host_ip_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinGameRequest {
    pub game_name: String,
    pub user_id: i64,
    pub ip_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetGameReadyRequest {
    pub game_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveGameRequest {
    pub user_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetRankingRequest {
    pub class_type: u8,
    pub offset: u32,
    pub user_name: String,
    pub character_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingPositionDto {
    pub rank: u32,
    pub points: u32,
    pub user_name: String,
    pub character_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetRankingReply {
    pub positions: Vec<RankingPositionDto>,
    pub current_player: RankingPositionDto,
}

/// Body of `/.well-known/console.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WellKnown {
    pub version: String,
    pub protocol: String,
    pub addr: String,
    pub run_mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_server_addr: Option<String>,
    pub caller: Caller,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Caller {
    pub addr: String,
}

pub const RUN_MODE_LAN: &str = "LAN";
pub const RUN_MODE_P2P: &str = "P2P";
pub const RUN_MODE_RELAY: &str = "Relay";
pub const RUN_MODE_SINGLE_PLAYER: &str = "SinglePlayer";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blobs_round_trip_base64() {
        let stats = vec![7u8; 56];
        let text = encode_blob(&stats);
        assert_eq!(decode_blob(&text).unwrap(), stats);
        assert!(decode_blob("not base64 !!!").is_none());
    }

    #[test]
    fn wire_names_are_camel_case() {
        let body = serde_json::to_string(&CreateGameRequest {
            game_name: "room".into(),
            password: String::new(),
            map_id: 3,
            host_user_id: 1,
            host_ip_address: "192.168.1.7".into(),
        })
        .unwrap();
        assert!(body.contains("\"gameName\""));
        assert!(body.contains("\"hostIpAddress\""));
    }

    #[test]
    fn well_known_skips_absent_relay_addr() {
        let body = serde_json::to_string(&WellKnown {
            version: "1.0.0".into(),
            protocol: "dispel-multi".into(),
            addr: "192.168.1.7:2137".into(),
            run_mode: RUN_MODE_LAN.into(),
            relay_server_addr: None,
            caller: Caller {
                addr: "192.168.1.10:51000".into(),
            },
        })
        .unwrap();
        assert!(!body.contains("relayServerAddr"));
        assert!(body.contains("\"runMode\":\"LAN\""));
    }
}
