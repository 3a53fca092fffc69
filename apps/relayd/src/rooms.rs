//! Relay routing table. Pure bookkeeping: who is in which room, which peer
//! is host, and which outbound queues a packet fans out to. Connection tasks
//! collect the queue handles under the lock and send after releasing it.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use dispelproto::relay::PacketType;
use dispelproto::relay::RelayPacket;

/// Queue depth toward one peer's stream writer.
pub const PEER_DEPTH: usize = 256;

struct RelayPeer {
    out: mpsc::Sender<RelayPacket>,
    joined_at: Instant,
    last_seen: Instant,
    is_host: bool,
}

#[derive(Default)]
struct Room {
    peers: HashMap<i64, RelayPeer>,
}

impl Room {
    fn host_id(&self) -> Option<i64> {
        self.peers
            .iter()
            .find(|(_, p)| p.is_host)
            .map(|(id, _)| *id)
    }

    /// Election: earliest joiner wins, smallest id breaks the tie.
    fn elect(&self) -> Option<i64> {
        self.peers
            .iter()
            .min_by_key(|(id, p)| (p.joined_at, **id))
            .map(|(id, _)| *id)
    }
}

/// Deliveries a table operation decided on; the caller performs the sends.
pub type Outbox = Vec<(mpsc::Sender<RelayPacket>, RelayPacket)>;

#[derive(Default)]
pub struct Rooms {
    rooms: HashMap<String, Room>,
}

impl Rooms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer. First into the room becomes host. Every existing peer is
    /// told about the newcomer with a synthetic join.
    pub fn join(&mut self, room_name: &str, peer_id: i64, out: mpsc::Sender<RelayPacket>) -> Outbox {
        let room = self.rooms.entry(room_name.to_owned()).or_default();
        let now = Instant::now();
        let is_host = room.peers.is_empty();
        room.peers.insert(
            peer_id,
            RelayPeer {
                out,
                joined_at: now,
                last_seen: now,
                is_host,
            },
        );
        debug!(room = room_name, peer_id, is_host, "peer joined");

        let announce = RelayPacket::join(room_name, peer_id);
        room.peers
            .iter()
            .filter(|(id, _)| **id != peer_id)
            .map(|(_, p)| (p.out.clone(), announce.clone()))
            .collect()
    }

    /// Remove a peer; elect and announce a new host if the host left. Empty
    /// rooms are destroyed.
    pub fn leave(&mut self, room_name: &str, peer_id: i64) -> Outbox {
        let Some(room) = self.rooms.get_mut(room_name) else {
            return Vec::new();
        };
        let Some(gone) = room.peers.remove(&peer_id) else {
            return Vec::new();
        };
        debug!(room = room_name, peer_id, "peer left");

        if room.peers.is_empty() {
            self.rooms.remove(room_name);
            debug!(room = room_name, "room destroyed");
            return Vec::new();
        }

        let mut outbox: Outbox = room
            .peers
            .values()
            .map(|p| (p.out.clone(), RelayPacket::leave(room_name, peer_id)))
            .collect();

        if gone.is_host {
            if let Some(new_host) = room.elect() {
                if let Some(p) = room.peers.get_mut(&new_host) {
                    p.is_host = true;
                }
                debug!(room = room_name, new_host, "host migrated");
                let migrate = RelayPacket::migrate(room_name, new_host);
                outbox.extend(
                    room.peers
                        .values()
                        .map(|p| (p.out.clone(), migrate.clone())),
                );
            }
        }
        outbox
    }

    /// Route one inbound packet. Directed kinds go to `to` if present in the
    /// same room; broadcast fans out to everyone but the sender. Unroutable
    /// packets are dropped silently.
    pub fn route(&mut self, packet: RelayPacket) -> Outbox {
        let Some(room) = self.rooms.get_mut(&packet.room) else {
            return Vec::new();
        };
        if let Some(p) = room.peers.get_mut(&packet.from) {
            p.last_seen = Instant::now();
        }
        match packet.kind {
            PacketType::Tcp | PacketType::Udp | PacketType::Data => {
                let Some(to) = packet.to else {
                    // keep-alives carry no addressee
                    return Vec::new();
                };
                match room.peers.get(&to) {
                    Some(p) => vec![(p.out.clone(), packet)],
                    None => Vec::new(),
                }
            }
            PacketType::Broadcast => room
                .peers
                .iter()
                .filter(|(id, _)| **id != packet.from)
                .map(|(_, p)| (p.out.clone(), packet.clone()))
                .collect(),
            // join/leave have their own entry points; migrate is server-emitted
            PacketType::Join | PacketType::Leave | PacketType::Migrate => Vec::new(),
        }
    }

    pub fn host_of(&self, room_name: &str) -> Option<i64> {
        self.rooms.get(room_name).and_then(Room::host_id)
    }

    /// Peers idle longer than `max_idle`, for the sweep to disconnect.
    pub fn idle_peers(&self, max_idle: std::time::Duration) -> Vec<(String, i64)> {
        let now = Instant::now();
        self.rooms
            .iter()
            .flat_map(|(name, room)| {
                room.peers
                    .iter()
                    .filter(move |(_, p)| now.duration_since(p.last_seen) > max_idle)
                    .map(move |(id, _)| (name.clone(), *id))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> (mpsc::Sender<RelayPacket>, mpsc::Receiver<RelayPacket>) {
        mpsc::channel(PEER_DEPTH)
    }

    fn deliver(outbox: Outbox) {
        for (tx, packet) in outbox {
            tx.try_send(packet).unwrap();
        }
    }

    #[tokio::test]
    async fn first_joiner_is_host_and_later_joins_are_announced() {
        let mut rooms = Rooms::new();
        let (tx1, mut rx1) = peer();
        let (tx2, _rx2) = peer();

        assert!(rooms.join("room", 1, tx1).is_empty());
        assert_eq!(rooms.host_of("room"), Some(1));

        deliver(rooms.join("room", 2, tx2));
        let announced = rx1.recv().await.unwrap();
        assert_eq!(announced.kind, PacketType::Join);
        assert_eq!(announced.from, 2);
        // second joiner is a guest
        assert_eq!(rooms.host_of("room"), Some(1));
    }

    #[tokio::test]
    async fn directed_packets_reach_only_the_addressee() {
        let mut rooms = Rooms::new();
        let (tx1, mut rx1) = peer();
        let (tx2, mut rx2) = peer();
        deliver(rooms.join("room", 1, tx1));
        deliver(rooms.join("room", 2, tx2));
        rx1.try_recv().ok();

        let packet = RelayPacket {
            kind: PacketType::Tcp,
            room: "room".into(),
            from: 1,
            to: Some(2),
            payload: Some(vec![0xAB]),
        };
        deliver(rooms.route(packet.clone()));
        assert_eq!(rx2.recv().await.unwrap(), packet);
        assert!(rx1.try_recv().is_err());

        // absent addressee drops silently
        let mut gone = packet;
        gone.to = Some(9);
        assert!(rooms.route(gone).is_empty());
    }

    #[tokio::test]
    async fn broadcast_skips_the_sender() {
        let mut rooms = Rooms::new();
        let (tx1, mut rx1) = peer();
        let (tx2, mut rx2) = peer();
        let (tx3, mut rx3) = peer();
        rooms.join("room", 1, tx1);
        rooms.join("room", 2, tx2);
        rooms.join("room", 3, tx3);
        while rx1.try_recv().is_ok() {}
        rx2.try_recv().ok();

        deliver(rooms.route(RelayPacket {
            kind: PacketType::Broadcast,
            room: "room".into(),
            from: 2,
            to: None,
            payload: Some(vec![1, 2, 3]),
        }));
        assert!(rx1.try_recv().is_ok());
        assert!(rx3.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn host_leave_elects_the_earliest_joiner_and_broadcasts_migrate() {
        let mut rooms = Rooms::new();
        let (tx1, _rx1) = peer();
        let (tx2, mut rx2) = peer();
        let (tx3, mut rx3) = peer();
        rooms.join("room", 5, tx1);
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        rooms.join("room", 3, tx2);
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        rooms.join("room", 4, tx3);
        rx2.try_recv().ok();

        deliver(rooms.leave("room", 5));
        assert_eq!(rooms.host_of("room"), Some(3));

        let mut saw_migrate_to_3 = false;
        while let Ok(packet) = rx3.try_recv() {
            if packet.kind == PacketType::Migrate {
                assert_eq!(packet.from, 3);
                saw_migrate_to_3 = true;
            }
        }
        assert!(saw_migrate_to_3);
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn empty_room_is_destroyed() {
        let mut rooms = Rooms::new();
        let (tx1, _rx1) = peer();
        rooms.join("room", 1, tx1);
        assert!(rooms.leave("room", 1).is_empty());
        assert_eq!(rooms.host_of("room"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_peers_show_up_in_the_sweep() {
        let mut rooms = Rooms::new();
        let (tx1, _rx1) = peer();
        let (tx2, _rx2) = peer();
        rooms.join("room", 1, tx1);
        rooms.join("room", 2, tx2);

        tokio::time::advance(std::time::Duration::from_secs(301)).await;
        // peer 2 stays fresh through a routed keep-alive
        rooms.route(RelayPacket {
            kind: PacketType::Data,
            room: "room".into(),
            from: 2,
            to: None,
            payload: None,
        });

        let idle = rooms.idle_peers(std::time::Duration::from_secs(300));
        assert_eq!(idle, vec![("room".into(), 1)]);
    }
}
