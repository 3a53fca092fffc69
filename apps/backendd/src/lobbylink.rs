//! Per-session WebSocket client to the console lobby.
//!
//! Each authenticated game session keeps one lobby socket open so the room
//! service sees it as present. The link performs the Hello/Welcome and
//! JoinLobby/JoinedLobby handshake, then pumps decoded envelopes both ways.

use std::time::Duration;

use anyhow::Context;
use anyhow::anyhow;
use futures_util::SinkExt;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::debug;
use tracing::warn;

use dispelproto::lobby;
use dispelproto::lobby::Envelope;
use dispelproto::lobby::LobbyBody;

const HANDSHAKE_STEP: Duration = Duration::from_secs(5);
const QUEUE_DEPTH: usize = 64;

pub struct LobbyLink {
    pub outgoing: mpsc::Sender<Envelope>,
    tasks: Vec<JoinHandle<()>>,
}

impl LobbyLink {
    /// Connect, handshake, and start the pump tasks. Returns the link and the
    /// receiver of inbound envelopes. `lobby_addr` is the console's WebSocket
    /// origin, e.g. `ws://127.0.0.1:2137`.
    pub async fn connect(
        lobby_addr: &str,
        user_id: i64,
        username: &str,
        player: lobby::Player,
    ) -> anyhow::Result<(Self, mpsc::Receiver<Envelope>)> {
        let url = format!(
            "{lobby_addr}/lobby?userID={user_id}&roomName={}",
            lobby::LOBBY_ROOM
        );
        let mut request = url.into_client_request().context("lobby url")?;
        request
            .headers_mut()
            .insert("X-Version", HeaderValue::from_static(lobby::PROTO_VERSION));
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(lobby::REALM),
        );

        let (socket, _resp) = connect_async(request).await.context("lobby connect")?;
        let (mut sink, mut stream) = socket.split();

        let me = user_id.to_string();
        let hello = Envelope::directed(
            me.clone(),
            me.clone(),
            LobbyBody::Hello(lobby::User {
                user_id,
                username: username.to_owned(),
            }),
        );
        send_env(&mut sink, &hello).await?;
        expect(&mut stream, lobby::TAG_WELCOME).await?;

        let join = Envelope::directed(me.clone(), me, LobbyBody::JoinLobby(player));
        send_env(&mut sink, &join).await?;
        expect(&mut stream, lobby::TAG_JOINED_LOBBY).await?;

        let (outgoing, mut outgoing_rx) = mpsc::channel::<Envelope>(QUEUE_DEPTH);
        let (incoming_tx, incoming) = mpsc::channel::<Envelope>(QUEUE_DEPTH);

        let writer = tokio::spawn(async move {
            while let Some(env) = outgoing_rx.recv().await {
                if send_env(&mut sink, &env).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let frame = match message {
                    Ok(Message::Binary(frame)) => frame,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match lobby::decode(&frame) {
                    Ok(env) => {
                        if incoming_tx.send(env).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(%err, "undecodable lobby frame"),
                }
            }
            debug!("lobby link reader done");
        });

        Ok((
            Self {
                outgoing,
                tasks: vec![writer, reader],
            },
            incoming,
        ))
    }

    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for LobbyLink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn send_env<S>(sink: &mut S, env: &Envelope) -> anyhow::Result<()>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let frame = lobby::encode(env).map_err(|err| anyhow!("encode lobby frame: {err}"))?;
    sink.send(Message::Binary(frame))
        .await
        .context("lobby send")
}

async fn expect<S>(stream: &mut S, want_tag: u8) -> anyhow::Result<Envelope>
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let message = timeout(HANDSHAKE_STEP, stream.next())
            .await
            .context("lobby handshake timed out")?
            .ok_or_else(|| anyhow!("lobby closed during handshake"))?
            .context("lobby handshake read")?;
        match message {
            Message::Binary(frame) => {
                let env =
                    lobby::decode(&frame).map_err(|err| anyhow!("bad lobby frame: {err}"))?;
                if env.body.tag() == want_tag {
                    return Ok(env);
                }
                return Err(anyhow!(
                    "lobby handshake: wanted tag {want_tag}, got {}",
                    env.body.tag()
                ));
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            _ => return Err(anyhow!("lobby handshake: unexpected message type")),
        }
    }
}
