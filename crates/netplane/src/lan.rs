//! Direct-LAN strategy: everybody already shares a network, so addresses pass
//! through untouched and no sockets are opened. The lobby handler only keeps a
//! local mirror of room membership for lookups and turns `HostMigration` into
//! the game's native frame.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::str::FromStr;

use anyhow::Context;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::warn;

use dispelproto::backend::build_host_migration;
use dispelproto::codes;
use dispelproto::lobby::LobbyBody;

use crate::CreateParams;
use crate::GameData;
use crate::GetPlayerAddrParams;
use crate::HostParams;
use crate::JoinParams;
use crate::Proxy;
use crate::SessionNet;

pub struct LanProxy {
    my_ip: Ipv4Addr,
    // user id -> reported in-game address, mirrored from lobby traffic
    players: Mutex<HashMap<i64, Ipv4Addr>>,
}

impl LanProxy {
    pub fn new(my_ip: Ipv4Addr) -> Self {
        Self {
            my_ip,
            players: Mutex::new(HashMap::new()),
        }
    }

    fn parse_ip(text: &str) -> anyhow::Result<Ipv4Addr> {
        Ipv4Addr::from_str(text).with_context(|| format!("not an ipv4 address: {text:?}"))
    }
}

impl Proxy for LanProxy {
    async fn create_room(
        &self,
        _params: CreateParams,
        _sess: &SessionNet,
    ) -> anyhow::Result<Ipv4Addr> {
        Ok(self.my_ip)
    }

    async fn host_room(&self, _params: HostParams, _sess: &SessionNet) -> anyhow::Result<()> {
        Ok(())
    }

    async fn select_game(&self, data: GameData, _sess: &SessionNet) -> anyhow::Result<()> {
        let mut players = self.players.lock().await;
        for p in &data.players {
            match Self::parse_ip(&p.ip_address) {
                Ok(ip) => {
                    players.insert(p.user_id, ip);
                }
                Err(err) => warn!(%err, user_id = p.user_id, "skipping player with bad address"),
            }
        }
        Ok(())
    }

    async fn join(&self, _params: JoinParams, _sess: &SessionNet) -> anyhow::Result<Ipv4Addr> {
        Ok(self.my_ip)
    }

    async fn get_player_addr(
        &self,
        params: GetPlayerAddrParams,
        _sess: &SessionNet,
    ) -> anyhow::Result<Ipv4Addr> {
        if let Some(ip) = self.players.lock().await.get(&params.user_id) {
            return Ok(*ip);
        }
        Self::parse_ip(&params.ip_address)
    }

    async fn connect_to_player(
        &self,
        params: GetPlayerAddrParams,
        sess: &SessionNet,
    ) -> anyhow::Result<Ipv4Addr> {
        let ip = self.get_player_addr(params.clone(), sess).await?;
        self.players.lock().await.insert(params.user_id, ip);
        Ok(ip)
    }

    async fn handle_lobby_event(&self, body: &LobbyBody, sess: &SessionNet) -> anyhow::Result<()> {
        match body {
            LobbyBody::JoinRoom(p) => {
                if let Ok(ip) = Self::parse_ip(&p.ip_address) {
                    self.players.lock().await.insert(p.user_id, ip);
                }
            }
            LobbyBody::LeaveRoom(p) => {
                self.players.lock().await.remove(&p.user_id);
            }
            LobbyBody::HostMigration(new_host) => {
                let ip = if new_host.user_id == sess.user_id {
                    self.my_ip
                } else {
                    Self::parse_ip(&new_host.ip_address)?
                };
                let payload = build_host_migration(new_host.user_id == sess.user_id, ip);
                sess.game_tx
                    .send((codes::HOST_MIGRATION, payload.to_vec()))
                    .await
                    .context("queue host migration frame")?;
            }
            other => debug!(kind = other.name(), "lan proxy ignoring lobby event"),
        }
        Ok(())
    }

    async fn close(&self, _sess: &SessionNet) {
        self.players.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispelproto::lobby::Player;
    use tokio::sync::mpsc;

    fn session() -> (SessionNet, mpsc::Receiver<crate::GameWrite>) {
        let (game_tx, game_rx) = mpsc::channel(8);
        let (signal_tx, _signal_rx) = mpsc::channel(8);
        (
            SessionNet {
                user_id: 1,
                username: "alpha".into(),
                game_tx,
                signal_tx,
            },
            game_rx,
        )
    }

    #[tokio::test]
    async fn addresses_pass_through_unchanged() {
        let my_ip = Ipv4Addr::new(192, 168, 1, 10);
        let proxy = LanProxy::new(my_ip);
        let (sess, _rx) = session();

        let created = proxy
            .create_room(
                CreateParams {
                    room_id: "room".into(),
                },
                &sess,
            )
            .await
            .unwrap();
        assert_eq!(created, my_ip);

        let other = proxy
            .get_player_addr(
                GetPlayerAddrParams {
                    room_id: "room".into(),
                    user_id: 2,
                    ip_address: "192.168.1.20".into(),
                    host_user_id: 1,
                },
                &sess,
            )
            .await
            .unwrap();
        assert_eq!(other, Ipv4Addr::new(192, 168, 1, 20));
    }

    #[tokio::test]
    async fn host_migration_reaches_the_game() {
        let proxy = LanProxy::new(Ipv4Addr::new(192, 168, 1, 10));
        let (sess, mut game_rx) = session();

        proxy
            .handle_lobby_event(
                &LobbyBody::HostMigration(Player {
                    user_id: 2,
                    username: "beta".into(),
                    character_id: 1,
                    class_type: 0,
                    ip_address: "192.168.1.20".into(),
                }),
                &sess,
            )
            .await
            .unwrap();

        let (code, payload) = game_rx.recv().await.unwrap();
        assert_eq!(code, codes::HOST_MIGRATION);
        assert_eq!(payload, vec![0, 0, 0, 0, 192, 168, 1, 20]);
    }
}
