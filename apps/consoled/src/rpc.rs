//! `/grpc/<service>/<method>` JSON dispatch plus the well-known document.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::extract::ConnectInfo;
use axum::extract::Path;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use serde_json::Value;
use tracing::debug;

use dispelproto::character::INVENTORY_LEN;
use dispelproto::character::SPELLS_LEN;
use dispelproto::character::STATS_LEN;
use dispelproto::console;
use dispelproto::console::ErrorReply;
use dispelproto::lobby::REALM;
use gamestore::Character;
use gamestore::Store;
use gamestore::StoreError;
use gamestore::memory::MemoryStore;
use roomsvc::RoomError;
use roomsvc::RoomService;
use roomsvc::RoomSnapshot;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<MemoryStore>,
    pub rooms: Arc<RoomService>,
    pub addr: String,
    pub run_mode: String,
    pub relay_addr: Option<String>,
}

pub async fn well_known(
    State(app): State<AppState>,
    ConnectInfo(caller): ConnectInfo<SocketAddr>,
) -> Json<console::WellKnown> {
    Json(console::WellKnown {
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol: REALM.to_string(),
        addr: app.addr.clone(),
        run_mode: app.run_mode.clone(),
        relay_server_addr: app.relay_addr.clone(),
        caller: console::Caller {
            addr: caller.to_string(),
        },
    })
}

fn fail(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorReply {
            error: error.into(),
        }),
    )
        .into_response()
}

fn store_fail(err: StoreError) -> Response {
    let status = match err {
        StoreError::NotFound => StatusCode::NOT_FOUND,
        StoreError::AlreadyExists => StatusCode::CONFLICT,
        StoreError::InvalidCredentials => StatusCode::UNAUTHORIZED,
        StoreError::Invalid(_) => StatusCode::BAD_REQUEST,
        StoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    fail(status, err.to_string())
}

fn room_fail(err: RoomError) -> Response {
    let status = match err {
        RoomError::NoSuchRoom => StatusCode::NOT_FOUND,
        RoomError::RoomExists | RoomError::AlreadyInRoom => StatusCode::CONFLICT,
        RoomError::NotInLobby => StatusCode::FAILED_DEPENDENCY,
    };
    fail(status, err.to_string())
}

fn parse<T: serde::de::DeserializeOwned>(body: Value) -> Result<T, Response> {
    serde_json::from_value(body)
        .map_err(|err| fail(StatusCode::BAD_REQUEST, format!("bad request: {err}")))
}

fn blob<const N: usize>(text: &str, what: &str) -> Result<[u8; N], Response> {
    let bytes = console::decode_blob(text)
        .ok_or_else(|| fail(StatusCode::BAD_REQUEST, format!("{what}: not base64")))?;
    bytes.try_into().map_err(|_| {
        fail(
            StatusCode::BAD_REQUEST,
            format!("{what}: expected {N} bytes"),
        )
    })
}

fn user_dto(user: gamestore::User) -> console::UserReply {
    console::UserReply {
        user: console::UserDto {
            user_id: user.user_id,
            user_name: user.username,
        },
    }
}

fn character_dto(c: Character) -> console::CharacterDto {
    console::CharacterDto {
        character_id: c.character_id,
        user_id: c.user_id,
        character_name: c.character_name.clone(),
        class_type: c.class_type(),
        stats: console::encode_blob(&c.stats),
        inventory: c.inventory.as_ref().map(|b| console::encode_blob(b)),
        spells: c.spells.as_ref().map(|b| console::encode_blob(b)),
    }
}

fn game_dto(snap: RoomSnapshot) -> console::GameDto {
    console::GameDto {
        game_name: snap.name.clone(),
        password: snap.password.clone(),
        map_id: snap.map_id,
        host_user_id: snap.host_user_id,
        host_ip_address: snap.host_ip_address().unwrap_or("0.0.0.0").to_string(),
        ready: snap.ready,
        players: snap
            .players
            .iter()
            .map(|p| console::GamePlayerDto {
                user_id: p.user_id,
                user_name: p.username.clone(),
                character_id: p.character_id,
                class_type: p.class_type,
                ip_address: p.ip_address.clone(),
            })
            .collect(),
    }
}

fn ranking_dto(row: gamestore::RankingRow) -> console::RankingPositionDto {
    console::RankingPositionDto {
        rank: row.rank,
        points: row.points,
        user_name: row.username,
        character_name: row.character_name,
    }
}

macro_rules! req {
    ($body:expr) => {
        match parse($body) {
            Ok(v) => v,
            Err(resp) => return resp,
        }
    };
}

macro_rules! ok_or_fail {
    ($result:expr, $map:expr) => {
        match $result {
            Ok(v) => v,
            Err(err) => return $map(err),
        }
    };
}

pub async fn dispatch(
    State(app): State<AppState>,
    Path((service, method)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Response {
    debug!(%service, %method, "rpc");
    match (service.as_str(), method.as_str()) {
        (console::USER_SERVICE, "CreateUser") => {
            let req: console::CreateUserRequest = req!(body);
            let user = ok_or_fail!(
                app.store.create_user(&req.user_name, &req.password).await,
                store_fail
            );
            Json(user_dto(user)).into_response()
        }
        (console::USER_SERVICE, "AuthenticateUser") => {
            let req: console::AuthenticateUserRequest = req!(body);
            let user = ok_or_fail!(
                app.store
                    .authenticate_user(&req.user_name, &req.password)
                    .await,
                store_fail
            );
            Json(user_dto(user)).into_response()
        }
        (console::USER_SERVICE, "GetUser") => {
            let req: console::GetUserRequest = req!(body);
            let user = ok_or_fail!(app.store.get_user(req.user_id).await, store_fail);
            Json(user_dto(user)).into_response()
        }
        (console::CHARACTER_SERVICE, "ListCharacters") => {
            let req: console::ListCharactersRequest = req!(body);
            let characters = ok_or_fail!(app.store.list_characters(req.user_id).await, store_fail);
            Json(console::ListCharactersReply {
                characters: characters.into_iter().map(character_dto).collect(),
            })
            .into_response()
        }
        (console::CHARACTER_SERVICE, "GetCharacter") => {
            let req: console::GetCharacterRequest = req!(body);
            let character = ok_or_fail!(
                app.store
                    .get_character(req.user_id, &req.character_name)
                    .await,
                store_fail
            );
            Json(console::CharacterReply {
                character: character_dto(character),
            })
            .into_response()
        }
        (console::CHARACTER_SERVICE, "CreateCharacter") => {
            let req: console::CreateCharacterRequest = req!(body);
            let stats = match blob::<STATS_LEN>(&req.stats, "stats") {
                Ok(v) => v,
                Err(resp) => return resp,
            };
            let character = ok_or_fail!(
                app.store
                    .create_character(req.user_id, &req.character_name, stats)
                    .await,
                store_fail
            );
            Json(console::CharacterReply {
                character: character_dto(character),
            })
            .into_response()
        }
        (console::CHARACTER_SERVICE, "DeleteCharacter") => {
            let req: console::DeleteCharacterRequest = req!(body);
            ok_or_fail!(
                app.store
                    .delete_character(req.user_id, &req.character_name)
                    .await,
                store_fail
            );
            Json(console::Empty {}).into_response()
        }
        (console::CHARACTER_SERVICE, "PutStats") => {
            let req: console::PutStatsRequest = req!(body);
            let stats = match blob::<STATS_LEN>(&req.stats, "stats") {
                Ok(v) => v,
                Err(resp) => return resp,
            };
            ok_or_fail!(
                app.store
                    .put_stats(req.user_id, &req.character_name, stats)
                    .await,
                store_fail
            );
            Json(console::Empty {}).into_response()
        }
        (console::CHARACTER_SERVICE, "PutInventory") => {
            let req: console::PutInventoryRequest = req!(body);
            let inventory = match blob::<INVENTORY_LEN>(&req.inventory, "inventory") {
                Ok(v) => v,
                Err(resp) => return resp,
            };
            ok_or_fail!(
                app.store
                    .put_inventory(req.user_id, &req.character_name, inventory)
                    .await,
                store_fail
            );
            Json(console::Empty {}).into_response()
        }
        (console::CHARACTER_SERVICE, "PutSpells") => {
            let req: console::PutSpellsRequest = req!(body);
            let spells = match blob::<SPELLS_LEN>(&req.spells, "spells") {
                Ok(v) => v,
                Err(resp) => return resp,
            };
            ok_or_fail!(
                app.store
                    .put_spells(req.user_id, &req.character_name, spells)
                    .await,
                store_fail
            );
            Json(console::Empty {}).into_response()
        }
        (console::GAME_SERVICE, "ListGames") => {
            let games = app.rooms.list_rooms().await;
            Json(console::ListGamesReply {
                games: games.into_iter().map(game_dto).collect(),
            })
            .into_response()
        }
        (console::GAME_SERVICE, "GetGame") => {
            let req: console::GetGameRequest = req!(body);
            match app.rooms.get_room(&req.game_name).await {
                Some(snap) => Json(console::GameReply {
                    game: game_dto(snap),
                })
                .into_response(),
                None => room_fail(RoomError::NoSuchRoom),
            }
        }
        (console::GAME_SERVICE, "CreateGame") => {
            let req: console::CreateGameRequest = req!(body);
            let snap = ok_or_fail!(
                app.rooms
                    .create_room(
                        req.host_user_id,
                        &req.game_name,
                        &req.password,
                        req.map_id,
                        &req.host_ip_address,
                    )
                    .await,
                room_fail
            );
            Json(console::GameReply {
                game: game_dto(snap),
            })
            .into_response()
        }
        (console::GAME_SERVICE, "JoinGame") => {
            let req: console::JoinGameRequest = req!(body);
            let snap = ok_or_fail!(
                app.rooms
                    .join_room(&req.game_name, req.user_id, &req.ip_address)
                    .await,
                room_fail
            );
            Json(console::GameReply {
                game: game_dto(snap),
            })
            .into_response()
        }
        (console::GAME_SERVICE, "SetGameReady") => {
            let req: console::SetGameReadyRequest = req!(body);
            ok_or_fail!(app.rooms.set_room_ready(&req.game_name).await, room_fail);
            Json(console::Empty {}).into_response()
        }
        (console::GAME_SERVICE, "LeaveGame") => {
            let req: console::LeaveGameRequest = req!(body);
            let outcome = app.rooms.leave_room(req.user_id).await;
            debug!(user_id = req.user_id, ?outcome, "leave game");
            Json(console::Empty {}).into_response()
        }
        (console::RANKING_SERVICE, "GetRanking") => {
            let req: console::GetRankingRequest = req!(body);
            let (rows, current) = ok_or_fail!(
                app.store
                    .ranking(
                        req.class_type,
                        req.offset,
                        &req.user_name,
                        &req.character_name,
                    )
                    .await,
                store_fail
            );
            Json(console::GetRankingReply {
                positions: rows.into_iter().map(ranking_dto).collect(),
                current_player: ranking_dto(current),
            })
            .into_response()
        }
        _ => fail(
            StatusCode::NOT_FOUND,
            format!("no such method {service}/{method}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use serde::de::DeserializeOwned;

    fn state() -> AppState {
        let (rooms, _task) = RoomService::start();
        AppState {
            store: Arc::new(MemoryStore::new().with_bcrypt_cost(4)),
            rooms,
            addr: "127.0.0.1:2137".into(),
            run_mode: console::RUN_MODE_LAN.into(),
            relay_addr: None,
        }
    }

    async fn call<T: DeserializeOwned>(
        app: &AppState,
        service: &str,
        method: &str,
        body: Value,
    ) -> (StatusCode, T) {
        let resp = dispatch(
            State(app.clone()),
            Path((service.to_string(), method.to_string())),
            Json(body),
        )
        .await;
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn create_then_authenticate_user() {
        let app = state();
        let (status, created): (StatusCode, console::UserReply) = call(
            &app,
            console::USER_SERVICE,
            "CreateUser",
            serde_json::json!({"userName": "mage", "password": "hunter2"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, authed): (StatusCode, console::UserReply) = call(
            &app,
            console::USER_SERVICE,
            "AuthenticateUser",
            serde_json::json!({"userName": "mage", "password": "hunter2"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(authed.user.user_id, created.user.user_id);

        let (status, err): (StatusCode, ErrorReply) = call(
            &app,
            console::USER_SERVICE,
            "AuthenticateUser",
            serde_json::json!({"userName": "mage", "password": "wrong"}),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(err.error, "invalid credentials");
    }

    #[tokio::test]
    async fn character_blobs_must_be_exact_length() {
        let app = state();
        let (_, user): (StatusCode, console::UserReply) = call(
            &app,
            console::USER_SERVICE,
            "CreateUser",
            serde_json::json!({"userName": "mage", "password": "hunter2"}),
        )
        .await;

        let (status, err): (StatusCode, ErrorReply) = call(
            &app,
            console::CHARACTER_SERVICE,
            "CreateCharacter",
            serde_json::json!({
                "userId": user.user.user_id,
                "characterName": "frodo",
                "stats": console::encode_blob(&[0u8; 12]),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(err.error.contains("56"));

        let (status, reply): (StatusCode, console::CharacterReply) = call(
            &app,
            console::CHARACTER_SERVICE,
            "CreateCharacter",
            serde_json::json!({
                "userId": user.user.user_id,
                "characterName": "frodo",
                "stats": console::encode_blob(&[0u8; STATS_LEN]),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply.character.character_name, "frodo");
    }

    #[tokio::test]
    async fn game_rpcs_require_lobby_presence() {
        let app = state();
        let (status, err): (StatusCode, ErrorReply) = call(
            &app,
            console::GAME_SERVICE,
            "CreateGame",
            serde_json::json!({
                "gameName": "room",
                "password": "",
                "mapId": 2,
                "hostUserId": 1,
                "hostIpAddress": "192.168.1.7",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::FAILED_DEPENDENCY);
        assert!(err.error.contains("lobby"));
    }

    #[tokio::test]
    async fn unknown_method_is_not_found() {
        let app = state();
        let (status, _err): (StatusCode, ErrorReply) = call(
            &app,
            "NopeService",
            "Nothing",
            serde_json::json!({}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
