//! Command codes of the game wire. The client addresses every frame with one
//! of these in byte 1.

pub const AUTHORIZATION_HANDSHAKE: u8 = 6;
pub const LIST_GAMES: u8 = 9;
pub const LIST_CHANNELS: u8 = 11;
pub const SELECT_CHANNEL: u8 = 12;
pub const SEND_LOBBY_MESSAGE: u8 = 14;
pub const RECEIVE_MESSAGE: u8 = 15;
pub const PING_CLOCK_TIME: u8 = 21;
pub const CREATE_GAME: u8 = 28;
pub const CLIENT_HOST_AND_USERNAME: u8 = 30;
pub const JOIN_GAME: u8 = 34;
pub const CLIENT_AUTHENTICATION: u8 = 41;
pub const CREATE_NEW_ACCOUNT: u8 = 42;
pub const UPDATE_CHARACTER_INVENTORY: u8 = 44;
pub const GET_CHARACTERS: u8 = 60;
pub const DELETE_CHARACTER: u8 = 61;
pub const GET_CHARACTER_INVENTORY: u8 = 68;
pub const SELECT_GAME: u8 = 69;
pub const SHOW_RANKING: u8 = 70;
pub const HOST_MIGRATION: u8 = 71;
pub const GET_CHARACTER_SPELLS: u8 = 72;
pub const UPDATE_CHARACTER_SPELLS: u8 = 73;
pub const SELECT_CHARACTER: u8 = 76;
pub const CREATE_CHARACTER: u8 = 92;
pub const UPDATE_CHARACTER_STATS: u8 = 108;

/// Human-readable name for logging. Unknown codes map to `"unknown"`.
pub fn name(code: u8) -> &'static str {
    match code {
        AUTHORIZATION_HANDSHAKE => "AuthorizationHandshake",
        LIST_GAMES => "ListGames",
        LIST_CHANNELS => "ListChannels",
        SELECT_CHANNEL => "SelectChannel",
        SEND_LOBBY_MESSAGE => "SendLobbyMessage",
        RECEIVE_MESSAGE => "ReceiveMessage",
        PING_CLOCK_TIME => "PingClockTime",
        CREATE_GAME => "CreateGame",
        CLIENT_HOST_AND_USERNAME => "ClientHostAndUsername",
        JOIN_GAME => "JoinGame",
        CLIENT_AUTHENTICATION => "ClientAuthentication",
        CREATE_NEW_ACCOUNT => "CreateNewAccount",
        UPDATE_CHARACTER_INVENTORY => "UpdateCharacterInventory",
        GET_CHARACTERS => "GetCharacters",
        DELETE_CHARACTER => "DeleteCharacter",
        GET_CHARACTER_INVENTORY => "GetCharacterInventory",
        SELECT_GAME => "SelectGame",
        SHOW_RANKING => "ShowRanking",
        HOST_MIGRATION => "HostMigration",
        GET_CHARACTER_SPELLS => "GetCharacterSpells",
        UPDATE_CHARACTER_SPELLS => "UpdateCharacterSpells",
        SELECT_CHARACTER => "SelectCharacter",
        CREATE_CHARACTER => "CreateCharacter",
        UPDATE_CHARACTER_STATS => "UpdateCharacterStats",
        _ => "unknown",
    }
}

/// Commands the dispatcher accepts before `ClientAuthentication` succeeds.
pub fn allowed_before_auth(code: u8) -> bool {
    matches!(
        code,
        AUTHORIZATION_HANDSHAKE
            | CLIENT_HOST_AND_USERNAME
            | CLIENT_AUTHENTICATION
            | CREATE_NEW_ACCOUNT
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pre_auth_allowlist_is_exactly_four_codes() {
        let allowed: Vec<u8> = (0..=255).filter(|c| allowed_before_auth(*c)).collect();
        assert_eq!(allowed, vec![6, 30, 41, 42]);
    }
}
