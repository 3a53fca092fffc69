//! HTTP client for the console RPC surface.

use dispelproto::console;
use tracing::debug;

#[derive(Debug)]
pub enum RpcError {
    /// The console answered with an error status.
    Remote { status: u16, message: String },
    /// The console could not be reached or spoke garbage.
    Transport(String),
}

impl RpcError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RpcError::Remote { status: 404, .. })
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcError::Remote { status, message } => write!(f, "console {status}: {message}"),
            RpcError::Transport(message) => write!(f, "console unreachable: {message}"),
        }
    }
}

impl std::error::Error for RpcError {}

type Result<T> = std::result::Result<T, RpcError>;

#[derive(Clone)]
pub struct ConsoleClient {
    http: reqwest::Client,
    base: String,
}

impl ConsoleClient {
    /// `base` is the console's HTTP origin, e.g. `http://127.0.0.1:2137`.
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.into(),
        }
    }

    pub async fn well_known(&self) -> Result<console::WellKnown> {
        let url = format!("{}/.well-known/console.json", self.base);
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        resp.json()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))
    }

    async fn call<Req, Resp>(&self, service: &str, method: &str, req: &Req) -> Result<Resp>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        let url = format!("{}/grpc/{service}/{method}", self.base);
        debug!(%service, %method, "console rpc");
        let resp = self
            .http
            .post(url)
            .json(req)
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let message = match resp.json::<console::ErrorReply>().await {
                Ok(reply) => reply.error,
                Err(_) => status.to_string(),
            };
            return Err(RpcError::Remote {
                status: status.as_u16(),
                message,
            });
        }
        resp.json()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))
    }

    pub async fn create_user(&self, user_name: &str, password: &str) -> Result<console::UserDto> {
        let reply: console::UserReply = self
            .call(
                console::USER_SERVICE,
                "CreateUser",
                &console::CreateUserRequest {
                    user_name: user_name.to_owned(),
                    password: password.to_owned(),
                },
            )
            .await?;
        Ok(reply.user)
    }

    pub async fn authenticate_user(
        &self,
        user_name: &str,
        password: &str,
    ) -> Result<console::UserDto> {
        let reply: console::UserReply = self
            .call(
                console::USER_SERVICE,
                "AuthenticateUser",
                &console::AuthenticateUserRequest {
                    user_name: user_name.to_owned(),
                    password: password.to_owned(),
                },
            )
            .await?;
        Ok(reply.user)
    }

    pub async fn list_characters(&self, user_id: i64) -> Result<Vec<console::CharacterDto>> {
        let reply: console::ListCharactersReply = self
            .call(
                console::CHARACTER_SERVICE,
                "ListCharacters",
                &console::ListCharactersRequest { user_id },
            )
            .await?;
        Ok(reply.characters)
    }

    pub async fn get_character(
        &self,
        user_id: i64,
        character_name: &str,
    ) -> Result<console::CharacterDto> {
        let reply: console::CharacterReply = self
            .call(
                console::CHARACTER_SERVICE,
                "GetCharacter",
                &console::GetCharacterRequest {
                    user_id,
                    character_name: character_name.to_owned(),
                },
            )
            .await?;
        Ok(reply.character)
    }

    pub async fn create_character(
        &self,
        user_id: i64,
        character_name: &str,
        stats: &[u8],
    ) -> Result<console::CharacterDto> {
        let reply: console::CharacterReply = self
            .call(
                console::CHARACTER_SERVICE,
                "CreateCharacter",
                &console::CreateCharacterRequest {
                    user_id,
                    character_name: character_name.to_owned(),
                    stats: console::encode_blob(stats),
                },
            )
            .await?;
        Ok(reply.character)
    }

    pub async fn delete_character(&self, user_id: i64, character_name: &str) -> Result<()> {
        let _: console::Empty = self
            .call(
                console::CHARACTER_SERVICE,
                "DeleteCharacter",
                &console::DeleteCharacterRequest {
                    user_id,
                    character_name: character_name.to_owned(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn put_stats(
        &self,
        user_id: i64,
        character_name: &str,
        stats: &[u8],
    ) -> Result<()> {
        let _: console::Empty = self
            .call(
                console::CHARACTER_SERVICE,
                "PutStats",
                &console::PutStatsRequest {
                    user_id,
                    character_name: character_name.to_owned(),
                    stats: console::encode_blob(stats),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn put_inventory(
        &self,
        user_id: i64,
        character_name: &str,
        inventory: &[u8],
    ) -> Result<()> {
        let _: console::Empty = self
            .call(
                console::CHARACTER_SERVICE,
                "PutInventory",
                &console::PutInventoryRequest {
                    user_id,
                    character_name: character_name.to_owned(),
                    inventory: console::encode_blob(inventory),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn put_spells(
        &self,
        user_id: i64,
        character_name: &str,
        spells: &[u8],
    ) -> Result<()> {
        let _: console::Empty = self
            .call(
                console::CHARACTER_SERVICE,
                "PutSpells",
                &console::PutSpellsRequest {
                    user_id,
                    character_name: character_name.to_owned(),
                    spells: console::encode_blob(spells),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn list_games(&self) -> Result<Vec<console::GameDto>> {
        let reply: console::ListGamesReply = self
            .call(
                console::GAME_SERVICE,
                "ListGames",
                &console::ListGamesRequest {},
            )
            .await?;
        Ok(reply.games)
    }

    pub async fn get_game(&self, game_name: &str) -> Result<console::GameDto> {
        let reply: console::GameReply = self
            .call(
                console::GAME_SERVICE,
                "GetGame",
                &console::GetGameRequest {
                    game_name: game_name.to_owned(),
                },
            )
            .await?;
        Ok(reply.game)
    }

    pub async fn create_game(&self, req: &console::CreateGameRequest) -> Result<console::GameDto> {
        let reply: console::GameReply = self.call(console::GAME_SERVICE, "CreateGame", req).await?;
        Ok(reply.game)
    }

    pub async fn join_game(&self, req: &console::JoinGameRequest) -> Result<console::GameDto> {
        let reply: console::GameReply = self.call(console::GAME_SERVICE, "JoinGame", req).await?;
        Ok(reply.game)
    }

    pub async fn set_game_ready(&self, game_name: &str) -> Result<()> {
        let _: console::Empty = self
            .call(
                console::GAME_SERVICE,
                "SetGameReady",
                &console::SetGameReadyRequest {
                    game_name: game_name.to_owned(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn leave_game(&self, user_id: i64) -> Result<()> {
        let _: console::Empty = self
            .call(
                console::GAME_SERVICE,
                "LeaveGame",
                &console::LeaveGameRequest { user_id },
            )
            .await?;
        Ok(())
    }

    pub async fn ranking(
        &self,
        req: &console::GetRankingRequest,
    ) -> Result<console::GetRankingReply> {
        self.call(console::RANKING_SERVICE, "GetRanking", req).await
    }
}
