//! Fixed-slot peer table. Connected clients occupy slots 1..=6; slot 0 is
//! reserved for the server's own identity and is never handed out by
//! [`PeerTable::add`].
//!
//! The original's slot allocator guards against a specific GCC `-O2`
//! dead-store-elimination hazard by routing the post-`memset` address copy
//! through `memcpy` instead of a struct assignment. That hazard has no
//! analogue in Rust -- there is no optimizer pass that can silently drop a
//! struct field write here -- so it isn't reproduced; see `DESIGN.md`.

use std::net::SocketAddr;

use crate::ship::ShipState;
use crate::transport::{Reassembler, ReliableQueue};

pub const MAX_PLAYERS: usize = 7;
pub const MAX_PHASER_BANKS: usize = 16;
pub const MAX_TORPEDO_TUBES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PeerState {
    Empty,
    Connecting,
    Checksumming,
    ChecksummingFinal,
    Lobby,
    InGame,
}

pub struct Peer {
    pub state: PeerState,
    pub addr: Option<SocketAddr>,
    pub last_recv_time: u32,
    pub checksum_round: u8,
    pub reliable_seq_out: u16,
    pub reliable_seq_in: u16,
    pub object_id: i32,
    pub connect_time: u32,
    pub name: String,
    pub keepalive_payload: Vec<u8>,
    /// Cached `ObjCreateTeam` blob, replayed to late joiners once this
    /// peer has actually spawned a ship.
    pub spawn_payload: Vec<u8>,
    pub score: i32,
    pub fragment: Reassembler,
    pub reliable_out: ReliableQueue,
    /// Raw, unframed transport messages queued for the next flush --
    /// each entry is exactly what [`crate::transport::Batcher::push_message`]/
    /// `push_reliable`/`push_raw` would write, with the shared
    /// `[direction][msg_count]` packet header applied once at flush time
    /// rather than per message.
    pub outbox: Vec<u8>,
    pub outbox_count: u8,

    /// Server-tracked ship state: HP, position, cloak, weapons. Only
    /// meaningful while `has_ship` is `true` -- before `ObjCreateTeam` is
    /// parsed this holds [`ShipState::default`]'s inert placeholder.
    pub ship: ShipState,
    pub class_index: Option<usize>,
    pub has_ship: bool,
    pub subsys_rr_idx: u8,
    pub last_fire_time: [u32; MAX_PHASER_BANKS],
    pub last_torpedo_time: [u32; MAX_TORPEDO_TUBES],
    pub fire_violations: u8,
    pub violation_window_start: u32,
    /// Set to the tick clock time a destroyed ship should be recreated,
    /// per the data model's "a per-peer respawn timer may recreate it
    /// after a fixed delay". `None` while alive or while no ship has ever
    /// been spawned.
    pub respawn_at: Option<u32>,
}

impl Peer {
    fn empty() -> Self {
        Peer {
            state: PeerState::Empty,
            addr: None,
            last_recv_time: 0,
            checksum_round: 0,
            reliable_seq_out: 0,
            reliable_seq_in: 0,
            object_id: -1,
            connect_time: 0,
            name: String::new(),
            keepalive_payload: Vec::new(),
            spawn_payload: Vec::new(),
            score: 0,
            fragment: Reassembler::new(),
            reliable_out: ReliableQueue::new(),
            outbox: Vec::new(),
            outbox_count: 0,
            ship: ShipState::default(),
            class_index: None,
            has_ship: false,
            subsys_rr_idx: 0,
            last_fire_time: [0; MAX_PHASER_BANKS],
            last_torpedo_time: [0; MAX_TORPEDO_TUBES],
            fire_violations: 0,
            violation_window_start: 0,
            respawn_at: None,
        }
    }

    fn reset(&mut self, addr: SocketAddr, now_ms: u32) {
        *self = Peer::empty();
        self.state = PeerState::Connecting;
        self.addr = Some(addr);
        self.connect_time = now_ms;
        self.last_recv_time = now_ms;
    }
}

/// The server's fixed 7-slot peer table.
pub struct PeerTable {
    peers: Vec<Peer>,
    count: usize,
}

impl PeerTable {
    pub fn new() -> Self {
        let mut peers = Vec::with_capacity(MAX_PLAYERS);
        for _ in 0..MAX_PLAYERS {
            peers.push(Peer::empty());
        }
        PeerTable { peers, count: 0 }
    }

    pub fn get(&self, slot: usize) -> Option<&Peer> {
        self.peers.get(slot).filter(|p| p.state != PeerState::Empty)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut Peer> {
        let found = self.peers.get(slot).map_or(false, |p| p.state != PeerState::Empty);
        if found {
            self.peers.get_mut(slot)
        } else {
            None
        }
    }

    pub fn find(&self, addr: &SocketAddr) -> Option<usize> {
        self.peers
            .iter()
            .position(|p| p.state != PeerState::Empty && p.addr.as_ref() == Some(addr))
    }

    /// Allocates the first empty slot for a new connection, starting the
    /// search at slot 1 -- slot 0 is reserved for the server's own identity
    /// and must never be handed out to a client.
    pub fn add(&mut self, addr: SocketAddr, now_ms: u32) -> Option<usize> {
        let slot = self.peers[1..].iter().position(|p| p.state == PeerState::Empty)? + 1;
        self.peers[slot].reset(addr, now_ms);
        self.count += 1;
        Some(slot)
    }

    pub fn remove(&mut self, slot: usize) {
        if let Some(p) = self.peers.get_mut(slot) {
            if p.state != PeerState::Empty {
                p.state = PeerState::Empty;
                self.count -= 1;
            }
        }
    }

    /// Removes every peer that hasn't been heard from in `timeout_ms`.
    /// Returns the slots removed.
    pub fn reap_timeouts(&mut self, now_ms: u32, timeout_ms: u32) -> Vec<usize> {
        let mut removed = Vec::new();
        for slot in 0..self.peers.len() {
            let timed_out = {
                let p = &self.peers[slot];
                p.state != PeerState::Empty && now_ms.wrapping_sub(p.last_recv_time) > timeout_ms
            };
            if timed_out {
                self.remove(slot);
                removed.push(slot);
            }
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn iter_connected(&self) -> impl Iterator<Item = (usize, &Peer)> {
        self.peers
            .iter()
            .enumerate()
            .filter(|(_, p)| p.state != PeerState::Empty)
    }

    pub fn iter_connected_mut(&mut self) -> impl Iterator<Item = (usize, &mut Peer)> {
        self.peers
            .iter_mut()
            .enumerate()
            .filter(|(_, p)| p.state != PeerState::Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn add_then_find_by_address() {
        let mut table = PeerTable::new();
        let slot = table.add(addr(1000), 0).unwrap();
        assert_eq!(table.find(&addr(1000)), Some(slot));
        assert_eq!(table.count(), 1);
    }

    #[test]
    fn fills_first_empty_slot() {
        let mut table = PeerTable::new();
        let first = table.add(addr(1), 0).unwrap();
        assert_eq!(first, 1);
        let second = table.add(addr(2), 0).unwrap();
        assert!(second > first);
    }

    #[test]
    fn never_allocates_reserved_slot_zero() {
        let mut table = PeerTable::new();
        for i in 0..(MAX_PLAYERS as u16 - 1) {
            assert_ne!(table.add(addr(i), 0).unwrap(), 0);
        }
        assert!(table.add(addr(999), 0).is_none());
    }

    #[test]
    fn table_full_returns_none() {
        let mut table = PeerTable::new();
        // Only slots 1..MAX_PLAYERS are allocatable; slot 0 is reserved.
        for i in 0..(MAX_PLAYERS as u16 - 1) {
            assert!(table.add(addr(i), 0).is_some());
        }
        assert!(table.add(addr(999), 0).is_none());
    }

    #[test]
    fn remove_frees_slot_for_reuse() {
        let mut table = PeerTable::new();
        let slot = table.add(addr(1), 0).unwrap();
        table.remove(slot);
        assert_eq!(table.count(), 0);
        assert!(table.find(&addr(1)).is_none());
        let slot2 = table.add(addr(2), 0).unwrap();
        assert_eq!(slot2, slot);
    }

    #[test]
    fn reaps_stale_peers() {
        let mut table = PeerTable::new();
        table.add(addr(1), 0);
        let removed = table.reap_timeouts(10_000, 5_000);
        assert_eq!(removed.len(), 1);
        assert_eq!(table.count(), 0);
    }
}
