//! Connection handshake state machine: connect, checksum rounds, lobby
//! entry, and graceful/forced teardown. Grounded on
//! `original_source/src/server/server_handshake.c`.
//!
//! This module decides *what* should happen on each transition and
//! advances [`crate::peer::Peer`] state accordingly; it returns
//! [`HandshakeAction`] values describing what the caller (the dispatch
//! layer, which owns message-building and the socket) must send. No wire
//! bytes are constructed here -- that is `dispatch`'s job, the same way
//! `combat`/`movement` hand back simulation deltas rather than packets.

use std::net::SocketAddr;

use crate::peer::{PeerState, PeerTable};

pub const CHECKSUM_ROUNDS: u8 = 4;
pub const FINAL_ROUND: u8 = 0xFF;
pub const INACTIVITY_TIMEOUT_MS: u32 = 30_000;
/// Fixed stock-compatible total-slots value MissionInit always reports,
/// regardless of this server's actual `MAX_PLAYERS` (7).
pub const TOTAL_SLOTS: u8 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootReason {
    ServerFull,
    ChecksumFailed,
    /// Crossed the rapid-fire/anti-cheat violation-window threshold.
    AntiCheatViolation,
}

/// What the dispatcher should do in response to a handshake event.
pub enum HandshakeAction {
    /// Allocate succeeded: send the batched CONNECT response + round-0
    /// CHECKSUM_REQ to `slot`.
    SendConnectAndChecksumReq { slot: usize },
    /// Allocate failed (table full) or checksum validation failed: send a
    /// BootPlayer datagram directly to `addr` (no slot was kept, or the
    /// slot is about to be torn down) and, for `ChecksumFailed`, also
    /// queue the boot reliably to the still-allocated slot first.
    SendBoot { addr: SocketAddr, slot: Option<usize>, reason: BootReason },
    /// Validation passed: request CHECKSUM_REQ for the next round.
    SendChecksumReq { slot: usize, round: u8 },
    /// Rounds 0..CHECKSUM_ROUNDS all passed: send the terminal 0xFF round.
    SendFinalChecksumReq { slot: usize },
    /// Final round accepted: transition to lobby and send the fixed
    /// ordered message sequence (0x28 sentinel, Settings, GameInit,
    /// per-peer Score, per-ship ObjCreateTeam, per-peer DeletePlayerUI).
    EnterLobby { slot: usize },
    /// Peer left (gracefully or by timeout): broadcast the three-message
    /// teardown sequence to every remaining peer, then free the slot.
    Teardown { slot: usize },
    /// Nothing to do -- a duplicate CONNECT from an already-known address,
    /// or a stale retransmit. The caller drops the datagram.
    Ignore,
}

/// A new CONNECT datagram arrived from an address with no existing slot.
/// Allocates a slot and transitions it to `Checksumming`, or reports a
/// full-server boot if none is free.
pub fn handle_connect(peers: &mut PeerTable, addr: SocketAddr, now_ms: u32) -> HandshakeAction {
    if peers.find(&addr).is_some() {
        // Duplicate connect from an already-known address: mirrors the
        // source's "duplicate connect" warning-and-ignore.
        return HandshakeAction::Ignore;
    }
    match peers.add(addr, now_ms) {
        Some(slot) => {
            if let Some(peer) = peers.get_mut(slot) {
                peer.checksum_round = 0;
            }
            HandshakeAction::SendConnectAndChecksumReq { slot }
        }
        None => HandshakeAction::SendBoot { addr, slot: None, reason: BootReason::ServerFull },
    }
}

/// A CHECKSUM_RESP arrived for `slot`. `validated` is the caller's
/// already-computed validation result (permissive-mode accept, or a
/// manifest comparison) -- this function only advances the state machine
/// given that verdict; it does not itself parse or validate the payload.
pub fn handle_checksum_response(peers: &mut PeerTable, slot: usize, validated: bool) -> Option<HandshakeAction> {
    let peer = peers.get_mut(slot)?;

    match peer.state {
        PeerState::ChecksummingFinal => {
            // The terminal round is parsed-but-not-validated upstream;
            // reaching here at all means it was well-formed enough.
            Some(HandshakeAction::EnterLobby { slot })
        }
        PeerState::Checksumming => {
            if !validated {
                return Some(HandshakeAction::SendBoot {
                    addr: peer.addr.expect("connected peer has an address"),
                    slot: Some(slot),
                    reason: BootReason::ChecksumFailed,
                });
            }
            peer.checksum_round += 1;
            if peer.checksum_round < CHECKSUM_ROUNDS {
                Some(HandshakeAction::SendChecksumReq { slot, round: peer.checksum_round })
            } else {
                peer.state = PeerState::ChecksummingFinal;
                Some(HandshakeAction::SendFinalChecksumReq { slot })
            }
        }
        _ => {
            // Stale retransmit after the state has already moved on --
            // silently ignored, matching the source's trace-level log.
            None
        }
    }
}

/// Finalizes the lobby transition after [`handle_checksum_response`]
/// returns `EnterLobby`; separated so the caller can build and flush the
/// message batch before mutating peer state.
pub fn enter_lobby(peers: &mut PeerTable, slot: usize) {
    if let Some(peer) = peers.get_mut(slot) {
        peer.state = PeerState::Lobby;
    }
}

/// Graceful disconnect: DISCONNECT, or (once connected) a CONNECT_ACK.
/// The caller is responsible for processing this *after* every other
/// message in the same datagram, so multiplexed ACKs aren't dropped.
pub fn handle_graceful_disconnect(peers: &PeerTable, slot: usize) -> Option<HandshakeAction> {
    peers.get(slot)?;
    Some(HandshakeAction::Teardown { slot })
}

/// Reaps peers that haven't been heard from in [`INACTIVITY_TIMEOUT_MS`],
/// returning a teardown action for each.
pub fn reap_idle(peers: &mut PeerTable, now_ms: u32) -> Vec<HandshakeAction> {
    peers
        .reap_timeouts(now_ms, INACTIVITY_TIMEOUT_MS)
        .into_iter()
        .map(|slot| HandshakeAction::Teardown { slot })
        .collect()
}

/// Actually frees `slot`'s table entry. Call after the caller has
/// broadcast the teardown message sequence for a [`HandshakeAction::Teardown`].
pub fn complete_teardown(peers: &mut PeerTable, slot: usize) {
    peers.remove(slot);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn connect_allocates_slot_and_starts_checksumming() {
        let mut peers = PeerTable::new();
        match handle_connect(&mut peers, addr(1), 0) {
            HandshakeAction::SendConnectAndChecksumReq { slot } => {
                assert_eq!(peers.get(slot).unwrap().state, PeerState::Connecting);
            }
            _ => panic!("expected SendConnectAndChecksumReq"),
        }
    }

    #[test]
    fn server_full_sends_boot_with_no_slot() {
        let mut peers = PeerTable::new();
        for i in 0..6 {
            peers.add(addr(i), 0);
        }
        match handle_connect(&mut peers, addr(99), 0) {
            HandshakeAction::SendBoot { slot, reason, .. } => {
                assert_eq!(slot, None);
                assert_eq!(reason, BootReason::ServerFull);
            }
            _ => panic!("expected SendBoot"),
        }
    }

    #[test]
    fn checksum_rounds_advance_to_final() {
        let mut peers = PeerTable::new();
        let slot = peers.add(addr(1), 0).unwrap();
        peers.get_mut(slot).unwrap().state = PeerState::Checksumming;

        for round in 0..CHECKSUM_ROUNDS {
            let action = handle_checksum_response(&mut peers, slot, true).unwrap();
            if round + 1 < CHECKSUM_ROUNDS {
                match action {
                    HandshakeAction::SendChecksumReq { round: r, .. } => assert_eq!(r, round + 1),
                    _ => panic!("expected SendChecksumReq for round {}", round),
                }
            } else {
                assert!(matches!(action, HandshakeAction::SendFinalChecksumReq { .. }));
            }
        }
        assert_eq!(peers.get(slot).unwrap().state, PeerState::ChecksummingFinal);
    }

    #[test]
    fn failed_checksum_boots_without_advancing() {
        let mut peers = PeerTable::new();
        let slot = peers.add(addr(1), 0).unwrap();
        peers.get_mut(slot).unwrap().state = PeerState::Checksumming;
        let action = handle_checksum_response(&mut peers, slot, false).unwrap();
        match action {
            HandshakeAction::SendBoot { slot: Some(s), reason, .. } => {
                assert_eq!(s, slot);
                assert_eq!(reason, BootReason::ChecksumFailed);
            }
            _ => panic!("expected SendBoot(ChecksumFailed)"),
        }
    }

    #[test]
    fn final_round_response_enters_lobby() {
        let mut peers = PeerTable::new();
        let slot = peers.add(addr(1), 0).unwrap();
        peers.get_mut(slot).unwrap().state = PeerState::ChecksummingFinal;
        let action = handle_checksum_response(&mut peers, slot, true).unwrap();
        assert!(matches!(action, HandshakeAction::EnterLobby { .. }));
        enter_lobby(&mut peers, slot);
        assert_eq!(peers.get(slot).unwrap().state, PeerState::Lobby);
    }

    #[test]
    fn stale_retransmit_after_lobby_is_ignored() {
        let mut peers = PeerTable::new();
        let slot = peers.add(addr(1), 0).unwrap();
        peers.get_mut(slot).unwrap().state = PeerState::Lobby;
        assert!(handle_checksum_response(&mut peers, slot, true).is_none());
    }

    #[test]
    fn idle_peers_are_reaped_as_teardowns() {
        let mut peers = PeerTable::new();
        peers.add(addr(1), 0);
        let actions = reap_idle(&mut peers, INACTIVITY_TIMEOUT_MS + 1);
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], HandshakeAction::Teardown { .. }));
    }
}
