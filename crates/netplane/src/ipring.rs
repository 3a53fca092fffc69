//! Loopback address allocation for tunneled peers.
//!
//! Every remote peer gets a unique 127-net address; the game dials it as if it
//! were the peer's LAN address and the tunnel picks the traffic up from local
//! listeners bound there.

use std::collections::HashMap;
use std::net::Ipv4Addr;

/// Ring of consecutive loopback-family addresses, sized to the maximum party.
///
/// Assignments are sticky per user until released; releasing returns the
/// address to the ring tail so a rejoin usually lands on a fresh address.
#[derive(Debug)]
pub struct IpRing {
    free: Vec<Ipv4Addr>,
    assigned: HashMap<i64, Ipv4Addr>,
}

impl IpRing {
    /// `start` is the first address handed out; `size` addresses follow
    /// consecutively, carrying into higher octets when the last one rolls
    /// over.
    pub fn new(start: Ipv4Addr, size: u8) -> Self {
        let base = u32::from(start);
        let free = (0..u32::from(size))
            .rev()
            .filter_map(|i| base.checked_add(i).map(Ipv4Addr::from))
            .collect();
        Self {
            free,
            assigned: HashMap::new(),
        }
    }

    /// The default ring the P2P plane uses: three guests besides self,
    /// starting at 127.0.1.2.
    pub fn for_party() -> Self {
        Self::new(Ipv4Addr::new(127, 0, 1, 2), 3)
    }

    pub fn assign(&mut self, user_id: i64) -> Option<Ipv4Addr> {
        if let Some(ip) = self.assigned.get(&user_id) {
            return Some(*ip);
        }
        let ip = self.free.pop()?;
        self.assigned.insert(user_id, ip);
        Some(ip)
    }

    pub fn lookup(&self, user_id: i64) -> Option<Ipv4Addr> {
        self.assigned.get(&user_id).copied()
    }

    pub fn release(&mut self, user_id: i64) {
        if let Some(ip) = self.assigned.remove(&user_id) {
            self.free.insert(0, ip);
        }
    }

    pub fn clear(&mut self) {
        for (_, ip) in self.assigned.drain() {
            self.free.insert(0, ip);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigns_consecutive_addresses_and_is_sticky() {
        let mut ring = IpRing::for_party();
        let a = ring.assign(10).unwrap();
        let b = ring.assign(20).unwrap();
        assert_eq!(a, Ipv4Addr::new(127, 0, 1, 2));
        assert_eq!(b, Ipv4Addr::new(127, 0, 1, 3));
        assert_eq!(ring.assign(10), Some(a));
        assert_eq!(ring.lookup(20), Some(b));
    }

    #[test]
    fn exhaustion_then_release_recycles() {
        let mut ring = IpRing::for_party();
        ring.assign(1).unwrap();
        ring.assign(2).unwrap();
        ring.assign(3).unwrap();
        assert_eq!(ring.assign(4), None);

        ring.release(2);
        assert!(ring.assign(4).is_some());
        assert_eq!(ring.lookup(2), None);
    }

    #[test]
    fn carries_into_the_next_octet_at_the_top_of_the_range() {
        let mut ring = IpRing::new(Ipv4Addr::new(127, 0, 1, 254), 3);
        assert_eq!(ring.assign(1), Some(Ipv4Addr::new(127, 0, 1, 254)));
        assert_eq!(ring.assign(2), Some(Ipv4Addr::new(127, 0, 1, 255)));
        assert_eq!(ring.assign(3), Some(Ipv4Addr::new(127, 0, 2, 0)));
    }
}
