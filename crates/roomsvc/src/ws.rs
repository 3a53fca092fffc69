//! The `/lobby` WebSocket endpoint.
//!
//! Upgrade requirements: query `userID` and `roomName=DISPEL`, header
//! `X-Version` matching the protocol version, and the well-known realm as the
//! negotiated subprotocol. After upgrade the socket must complete
//! `Hello` -> `Welcome`, `JoinLobby` -> `JoinedLobby` before it joins
//! presence; each step has a 5 second budget and failure closes the socket
//! with a policy violation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Query;
use axum::extract::State;
use axum::extract::ws::CloseFrame;
use axum::extract::ws::Message;
use axum::extract::ws::WebSocket;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use futures_util::SinkExt;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;
use tracing::warn;

use dispelproto::lobby;
use dispelproto::lobby::Envelope;
use dispelproto::lobby::LobbyBody;

use crate::service::Event;
use crate::service::OUTBOUND_DEPTH;
use crate::service::RoomService;

const HANDSHAKE_STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// 1008, the policy-violation close code.
const CLOSE_POLICY: u16 = 1008;

/// Check the upgrade request. Returns the user id on success.
pub fn validate_upgrade(
    params: &HashMap<String, String>,
    headers: &HeaderMap,
) -> Result<i64, &'static str> {
    let user_id = params
        .get("userID")
        .and_then(|v| v.parse::<i64>().ok())
        .ok_or("missing or invalid userID")?;
    if params.get("roomName").map(String::as_str) != Some(lobby::LOBBY_ROOM) {
        return Err("unknown room name");
    }
    let version = headers
        .get("x-version")
        .and_then(|v| v.to_str().ok())
        .ok_or("missing X-Version header")?;
    if version != lobby::PROTO_VERSION {
        return Err("unsupported protocol version");
    }
    let protocols = headers
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !protocols
        .split(',')
        .any(|p| p.trim() == lobby::REALM)
    {
        return Err("realm subprotocol not offered");
    }
    Ok(user_id)
}

pub async fn lobby_handler(
    State(svc): State<Arc<RoomService>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let user_id = match validate_upgrade(&params, &headers) {
        Ok(id) => id,
        Err(reason) => {
            debug!(reason, "rejected lobby upgrade");
            return (StatusCode::BAD_REQUEST, reason).into_response();
        }
    };
    ws.protocols([lobby::REALM])
        .on_upgrade(move |socket| run_socket(svc, user_id, socket))
}

async fn recv_envelope(socket: &mut WebSocket) -> Option<Envelope> {
    loop {
        let msg = timeout(HANDSHAKE_STEP_TIMEOUT, socket.recv())
            .await
            .ok()??
            .ok()?;
        match msg {
            Message::Binary(frame) => return lobby::decode(&frame).ok(),
            Message::Ping(_) | Message::Pong(_) => continue,
            _ => return None,
        }
    }
}

async fn close_policy(mut socket: WebSocket, reason: &'static str) {
    warn!(reason, "lobby handshake failed");
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_POLICY,
            reason: reason.into(),
        })))
        .await;
}

async fn send_body(socket: &mut WebSocket, body: LobbyBody) -> bool {
    let env = Envelope::broadcast("0", body);
    match lobby::encode(&env) {
        Ok(frame) => socket.send(Message::Binary(frame)).await.is_ok(),
        Err(_) => false,
    }
}

async fn run_socket(svc: Arc<RoomService>, user_id: i64, mut socket: WebSocket) {
    // step 1: Hello carrying the user identity named in the URL
    let user = match recv_envelope(&mut socket).await {
        Some(Envelope {
            body: LobbyBody::Hello(user),
            ..
        }) if user.user_id == user_id => user,
        _ => return close_policy(socket, "expected Hello").await,
    };
    if !send_body(&mut socket, LobbyBody::Welcome).await {
        return;
    }

    // step 2: JoinLobby carrying the selected character
    let player = match recv_envelope(&mut socket).await {
        Some(Envelope {
            body: LobbyBody::JoinLobby(player),
            ..
        }) => player,
        _ => return close_policy(socket, "expected JoinLobby").await,
    };
    if !send_body(&mut socket, LobbyBody::JoinedLobby).await {
        return;
    }

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_DEPTH);
    if svc
        .register_session(user, player, outbound_tx)
        .await
        .is_err()
    {
        return close_policy(socket, "already connected").await;
    }

    let events = svc.events();
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { break };
                if sink.send(Message::Binary(frame)).await.is_err() {
                    break;
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Binary(frame))) => {
                        match lobby::decode(&frame) {
                            Ok(envelope) => {
                                if events.send(Event::Incoming { from: user_id, envelope }).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => debug!(%err, user_id, "undecodable lobby frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(%err, user_id, "lobby socket error");
                        break;
                    }
                }
            }
        }
    }

    let _ = events.send(Event::Disconnected { user_id }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn params(user: &str, room: &str) -> HashMap<String, String> {
        HashMap::from([
            ("userID".to_owned(), user.to_owned()),
            ("roomName".to_owned(), room.to_owned()),
        ])
    }

    fn headers(version: &str, protocol: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("x-version", HeaderValue::from_str(version).unwrap());
        h.insert(
            "sec-websocket-protocol",
            HeaderValue::from_str(protocol).unwrap(),
        );
        h
    }

    #[test]
    fn accepts_the_documented_upgrade() {
        let id = validate_upgrade(
            &params("7", "DISPEL"),
            &headers(lobby::PROTO_VERSION, lobby::REALM),
        )
        .unwrap();
        assert_eq!(id, 7);
    }

    #[test]
    fn accepts_realm_among_multiple_offered_protocols() {
        let h = headers(lobby::PROTO_VERSION, "chat, dispel-multi");
        assert!(validate_upgrade(&params("7", "DISPEL"), &h).is_ok());
    }

    #[test]
    fn rejects_wrong_room_version_or_protocol() {
        let good = headers(lobby::PROTO_VERSION, lobby::REALM);
        assert!(validate_upgrade(&params("7", "OTHER"), &good).is_err());
        assert!(validate_upgrade(&params("x", "DISPEL"), &good).is_err());
        assert!(validate_upgrade(
            &params("7", "DISPEL"),
            &headers("9.9", lobby::REALM)
        )
        .is_err());
        assert!(validate_upgrade(
            &params("7", "DISPEL"),
            &headers(lobby::PROTO_VERSION, "something-else")
        )
        .is_err());
    }
}
