//! Game-layer payload builders for the messages the server itself
//! originates: the lobby-entry sequence, `MissionInit`, score and
//! end-game broadcasts, and the three-message teardown sequence.
//!
//! A handful of these (DestroyObj, Score, ScoreChange, Chat/TeamChat)
//! have a wire shape fixed by the stock client; the rest (Settings,
//! GameInit, MissionInit, DeletePlayerUi/Anim, BootPlayer, EndGame) have
//! no externally-imposed layout beyond their narrative behavior, so
//! their concrete byte order below is this server's own choice --
//! recorded in DESIGN.md.
//!
//! Every builder writes into a caller-supplied buffer via [`crate::codec::Cursor`]
//! and returns the number of bytes written, matching the bool/Option
//! failure convention the rest of the wire layer uses.

use crate::codec::Cursor;
use crate::opcodes::GameOp;

/// The four-byte prefix every stock `ObjCreateTeam` ship blob carries.
/// Purpose unknown (spec.md §9 Open Questions); preserved verbatim.
pub const OBJ_CREATE_TEAM_PREFIX: [u8; 4] = [0x08, 0x80, 0x00, 0x00];

/// Parses `0x03` ObjCreateTeam: `[opcode][owner:u8][team:u8][prefix:4][species_id:u16]…`.
/// The remainder of the ship blob (if any) carries client-side cosmetic
/// fields this server has no use for; only the fields needed to spawn the
/// server's own authoritative [`crate::ship::ShipState`] are extracted.
pub fn parse_obj_create_team(payload: &[u8]) -> Option<(u8, u8, u16)> {
    if payload.len() < 1 + 2 + 4 + 2 {
        return None;
    }
    let owner = payload[1];
    let team = payload[2];
    let species_id = u16::from_le_bytes([payload[7], payload[8]]);
    Some((owner, team, species_id))
}

fn with_opcode(buf: &mut [u8], op: GameOp, body: impl FnOnce(&mut Cursor<'_>) -> bool) -> Option<usize> {
    let mut cur = Cursor::new(buf);
    if !cur.write_u8(op.to_byte()) {
        return None;
    }
    if !body(&mut cur) {
        return None;
    }
    Some(cur.position())
}

/// `0x00` Settings: game time, collision/friendly-fire flags, the
/// recipient's own game slot, and the mission script name
/// (length-prefixed ASCII, matching Chat's `[len:u16][ascii]` shape).
pub fn build_settings(
    buf: &mut [u8],
    game_time: f32,
    collision_damage: bool,
    friendly_fire: bool,
    game_slot: u8,
    mission_script: &str,
) -> Option<usize> {
    with_opcode(buf, GameOp::Settings, |cur| {
        cur.write_f32(game_time)
            && cur.write_u8(collision_damage as u8)
            && cur.write_u8(friendly_fire as u8)
            && cur.write_u8(game_slot)
            && cur.write_u16(mission_script.len() as u16)
            && cur.write_bytes(mission_script.as_bytes())
    })
}

/// `0x01` GameInit: carries the current game time so a joiner can
/// synchronize its local clock before any StateUpdate arrives.
pub fn build_game_init(buf: &mut [u8], game_time: f32) -> Option<usize> {
    with_opcode(buf, GameOp::GameInit, |cur| cur.write_f32(game_time))
}

/// `0x35` MissionInit, sent in reply to NEW_PLAYER_IN_GAME: star-system
/// index, the fixed stock-compatible total-slots value (always 9),
/// time limit (minutes) and frag limit.
pub fn build_mission_init(buf: &mut [u8], system_index: u8, time_limit: i32, frag_limit: i32) -> Option<usize> {
    with_opcode(buf, GameOp::MissionInit, |cur| {
        cur.write_u8(system_index) && cur.write_u8(crate::handshake::TOTAL_SLOTS) && cur.write_i32(time_limit) && cur.write_i32(frag_limit)
    })
}

/// `0x37` Score: `[opcode][player:i32][kills:i32][deaths:i32][score:i32]`.
/// `player` is the network player id (wire slot), not an object id.
pub fn build_score(buf: &mut [u8], player_id: i32, kills: i32, deaths: i32, score: i32) -> Option<usize> {
    with_opcode(buf, GameOp::Score, |cur| {
        cur.write_i32(player_id) && cur.write_i32(kills) && cur.write_i32(deaths) && cur.write_i32(score)
    })
}

/// `0x36` ScoreChange: killer fields are present only when
/// `killer_id != 0` (environmental kills carry no killer credit).
pub fn build_score_change(
    buf: &mut [u8],
    killer_id: i32,
    killer_kills: i32,
    killer_score: i32,
    victim_id: i32,
    victim_deaths: i32,
) -> Option<usize> {
    with_opcode(buf, GameOp::ScoreChange, |cur| {
        if !cur.write_i32(killer_id) {
            return false;
        }
        if killer_id != 0 && !(cur.write_i32(killer_kills) && cur.write_i32(killer_score)) {
            return false;
        }
        cur.write_i32(victim_id) && cur.write_i32(victim_deaths) && cur.write_u8(0)
    })
}

/// `0x14` DestroyObj: `[opcode][obj:i32]`.
pub fn build_destroy_obj(buf: &mut [u8], object_id: i32) -> Option<usize> {
    with_opcode(buf, GameOp::DestroyObj, |cur| cur.write_i32(object_id))
}

/// `0x17` DeletePlayerUi: clears a stale UI entry for a departed player.
pub fn build_delete_player_ui(buf: &mut [u8], object_id: i32) -> Option<usize> {
    with_opcode(buf, GameOp::DeletePlayerUi, |cur| cur.write_i32(object_id))
}

/// `0x18` DeletePlayerAnim: clears the departed player's death/spawn
/// animation state.
pub fn build_delete_player_anim(buf: &mut [u8], object_id: i32) -> Option<usize> {
    with_opcode(buf, GameOp::DeletePlayerAnim, |cur| cur.write_i32(object_id))
}

/// `0x04` BootPlayer: one reason byte (0 = server full, 1 = checksum
/// mismatch, 2 = anti-cheat violation), matching
/// [`crate::handshake::BootReason`]'s variants.
pub fn build_boot_player(buf: &mut [u8], reason: crate::handshake::BootReason) -> Option<usize> {
    let code = match reason {
        crate::handshake::BootReason::ServerFull => 0u8,
        crate::handshake::BootReason::ChecksumFailed => 1u8,
        crate::handshake::BootReason::AntiCheatViolation => 2u8,
    };
    with_opcode(buf, GameOp::BootPlayer, |cur| cur.write_u8(code))
}

/// `0x38` EndGame: one reason byte (0 = frag limit reached).
pub fn build_end_game(buf: &mut [u8], reason: u8) -> Option<usize> {
    with_opcode(buf, GameOp::EndGame, |cur| cur.write_u8(reason))
}

/// `0x2C`/`0x2D` Chat/TeamChat: `[opcode][sender_slot][pad:3][len:u16][ascii]`.
pub fn build_chat(buf: &mut [u8], team: bool, sender_slot: u8, text: &str) -> Option<usize> {
    let op = if team { GameOp::TeamChat } else { GameOp::Chat };
    with_opcode(buf, op, |cur| {
        cur.write_u8(sender_slot)
            && cur.write_bytes(&[0, 0, 0])
            && cur.write_u16(text.len() as u16)
            && cur.write_bytes(text.as_bytes())
    })
}

/// A parsed `0x1A` BeamFire: `[opcode][shooter:i32][flags:u8][dir:CV3][more_flags:u8]`
/// plus `[target:i32]` when `more_flags & 0x01 != 0`. `flags`'s low nibble
/// selects the firing phaser/pulse bank, matching how [`crate::combat::can_fire_phaser`]
/// and friends index `cls.subsystems` by bank number.
pub struct BeamFire {
    pub shooter_id: i32,
    pub bank: usize,
    pub dir: (f32, f32, f32),
    pub target_id: Option<i32>,
}

pub fn parse_beam_fire(payload: &[u8]) -> Option<BeamFire> {
    let mut body = payload[1..].to_vec();
    let mut cur = Cursor::new(&mut body);
    let shooter_id = cur.read_i32()?;
    let flags = cur.read_u8()?;
    let dir = cur.read_cv3()?;
    let more_flags = cur.read_u8()?;
    let target_id = if more_flags & 0x01 != 0 { Some(cur.read_i32()?) } else { None };
    Some(BeamFire { shooter_id, bank: (flags & 0x0F) as usize, dir, target_id })
}

/// A parsed `0x19` TorpedoFire: `[opcode][shooter:i32][subsys:u8][flags:u8][vel:CV3]`
/// plus `[target:i32][impact:CV4]` when `flags & 0x02 != 0` (homing, as
/// opposed to dumbfire).
pub struct TorpedoFireMsg {
    pub shooter_id: i32,
    pub tube: usize,
    pub vel: (f32, f32, f32),
    pub target_id: i32,
    pub impact: Option<(f32, f32, f32)>,
}

pub fn parse_torpedo_fire(payload: &[u8]) -> Option<TorpedoFireMsg> {
    let mut body = payload[1..].to_vec();
    let mut cur = Cursor::new(&mut body);
    let shooter_id = cur.read_i32()?;
    let tube = cur.read_u8()? as usize;
    let flags = cur.read_u8()?;
    let vel = cur.read_cv3()?;
    let (target_id, impact) = if flags & 0x02 != 0 {
        let target_id = cur.read_i32()?;
        let impact = cur.read_cv4()?;
        (target_id, Some(impact))
    } else {
        (-1, None)
    };
    Some(TorpedoFireMsg { shooter_id, tube, vel, target_id, impact })
}

/// A parsed `0x2A` CollisionEffect (wire shape mirrors the two-participant
/// convention every other directed message uses): `[opcode][source:i32][target:i32][impact:CV4]`.
pub struct CollisionEffectMsg {
    pub source_id: i32,
    pub target_id: i32,
    pub impact: (f32, f32, f32),
}

pub fn parse_collision_effect(payload: &[u8]) -> Option<CollisionEffectMsg> {
    let mut body = payload[1..].to_vec();
    let mut cur = Cursor::new(&mut body);
    let source_id = cur.read_i32()?;
    let target_id = cur.read_i32()?;
    let impact = cur.read_cv4()?;
    Some(CollisionEffectMsg { source_id, target_id, impact })
}
