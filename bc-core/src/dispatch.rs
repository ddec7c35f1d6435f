//! Opcode dispatch table: decides, for each inbound game-layer opcode,
//! whether to relay it to the other peers (reliably or not), drop it, or
//! hand it to a dedicated handler. Grounded on `handle_game_message` in
//! `original_source/src/server/server_dispatch.c`.
//!
//! This module classifies; it does not itself touch sockets or build
//! wire bytes. The caller owns the peer table, the registry, and the
//! actual send -- this keeps the classification independently testable
//! and keeps `bc-core` free of I/O, matching `handshake`/`master`.

use crate::opcodes::{dirty, GameOp};
use crate::peer::PeerState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    /// Forward to every other connected peer, reliably.
    ToOthersReliable,
    /// Forward to every other connected peer, unreliably.
    ToOthersUnreliable,
    /// Not relayed -- either server-only (HostMsg, RequestObj) or the
    /// caller must build a dedicated reply (NewPlayerInGame -> MissionInit,
    /// ChecksumResp -> the handshake module).
    Handled,
    /// Rejected: violates an anti-cheat rule, or arrived before the peer
    /// reached the minimum required state.
    Reject,
}

/// Opcodes accepted before a peer reaches [`PeerState::Lobby`]. Everything
/// else is rejected with `opcodes_rejected` incremented, mirroring the
/// source's `peer->state < PEER_LOBBY` gate.
pub fn accepted_before_lobby(op: GameOp) -> bool {
    matches!(op, GameOp::ChecksumResp)
}

/// Base relay classification for an opcode, ignoring any per-message
/// anti-cheat checks layered on top (cloak, torpedo/beam rate limits,
/// collision ownership) -- those are evaluated by the caller using the
/// ship state this module doesn't have access to.
pub fn classify(op: GameOp, peer_state: PeerState) -> RelayMode {
    if op != GameOp::ChecksumResp && peer_state < PeerState::Lobby {
        return RelayMode::Reject;
    }

    match op {
        GameOp::Chat | GameOp::TeamChat => RelayMode::ToOthersReliable,
        GameOp::PythonEvent | GameOp::PythonEvent2 => RelayMode::ToOthersReliable,
        GameOp::StartFiring
        | GameOp::StopFiring
        | GameOp::StopFiringAt
        | GameOp::SubsysStatus
        | GameOp::AddRepairList
        | GameOp::ClientEvent => RelayMode::ToOthersReliable,
        GameOp::StartCloak | GameOp::StopCloak | GameOp::StartWarp => RelayMode::ToOthersReliable,
        GameOp::RepairPriority | GameOp::TorpTypeChange => RelayMode::ToOthersReliable,
        GameOp::SetPhaserLevel => RelayMode::ToOthersReliable,
        GameOp::TorpedoFire | GameOp::BeamFire => RelayMode::ToOthersReliable,
        GameOp::Explosion => RelayMode::ToOthersReliable,
        GameOp::ObjCreate | GameOp::ObjCreateTeam => RelayMode::ToOthersReliable,
        GameOp::DestroyObj => RelayMode::ToOthersReliable,
        GameOp::CollisionEffect => RelayMode::ToOthersReliable,
        GameOp::NewPlayerInGame => RelayMode::ToOthersReliable,

        // Position/orientation data is client-authoritative and relayed
        // unreliably; pure subsystem-health-only updates (server's own
        // flag) are dropped -- see `strip_state_update`.
        GameOp::StateUpdate => RelayMode::ToOthersUnreliable,

        GameOp::HostMsg | GameOp::RequestObj => RelayMode::Handled,
        GameOp::ChecksumResp => RelayMode::Handled,

        _ => RelayMode::Reject,
    }
}

/// A received StateUpdate's dirty-flag byte is pure subsystem health
/// (`0x20` exactly) only when the server itself produced it -- clients
/// never send that combination alone. Such a message must be suppressed
/// rather than relayed, or an impersonating client could forge
/// authoritative health for other players. Returns `true` when the
/// message should be dropped.
pub fn is_forged_health_update(dirty_flags: u8) -> bool {
    dirty_flags == dirty::SUBSYSTEM_STATES
}

/// Applies a client-reported StateUpdate to the server's tracked copy of a
/// ship's position/orientation/speed, honoring only the fields the client
/// is allowed to author (position, forward, up, speed -- never subsystem
/// health or cloak state, which are server-authoritative).
pub fn apply_tracked_state(
    ship: &mut crate::ship::ShipState,
    dirty_flags: u8,
    pos: crate::math::Vec3,
    fwd: crate::math::Vec3,
    up: crate::math::Vec3,
    speed: f32,
) {
    if dirty_flags & dirty::POSITION_ABS != 0 {
        ship.pos = pos;
    }
    if dirty_flags & dirty::ORIENT_FWD != 0 {
        ship.fwd = fwd;
    }
    if dirty_flags & dirty::ORIENT_UP != 0 {
        ship.up = up;
    }
    if dirty_flags & dirty::SPEED != 0 {
        ship.speed = speed;
    }
}
