//! Position/orientation integration and the `StateUpdate` dirty-flag
//! diff builder, grounded on `original_source/src/game/movement.c`.

use crate::codec::Cursor;
use crate::math::Vec3;
use crate::opcodes::dirty;
use crate::registry::ShipClass;
use crate::ship::ShipState;

/// `pos += fwd * speed * engine_efficiency * dt`.
pub fn move_tick(ship: &mut ShipState, engine_efficiency: f32, dt: f32) {
    if !ship.alive || dt <= 0.0 {
        return;
    }
    ship.pos = ship.pos.add(ship.fwd.scale(ship.speed * engine_efficiency * dt));
}

/// Rotates `fwd` (and `up` in lockstep) toward `target`, limited to
/// `max_angular_velocity * dt` radians this tick. Anti-parallel forward
/// vectors fall back to the ship's own `up` as the rotation axis; exactly
/// parallel vectors (already facing target) are a no-op.
pub fn turn_toward(ship: &mut ShipState, cls: &ShipClass, target: Vec3, dt: f32) {
    if !ship.alive {
        return;
    }

    let to_target = target.sub(ship.pos);
    let dist = to_target.len();
    if dist < 1e-4 {
        return;
    }
    let desired = to_target.normalize();

    let dot = ship.fwd.dot(desired).max(-1.0).min(1.0);
    let angle = dot.acos();
    if angle < 1e-5 {
        return;
    }

    let max_turn = cls.max_angular_velocity * dt;
    if max_turn <= 0.0 {
        return;
    }
    let t = if angle <= max_turn { 1.0 } else { max_turn / angle };

    let mut axis = ship.fwd.cross(desired);
    let axis_len = axis.len();
    if axis_len < 1e-8 {
        if dot < 0.0 {
            axis = ship.up;
        } else {
            return;
        }
    }
    axis = axis.normalize();

    let rot_angle = t * angle;
    ship.fwd = crate::math::rotate_axis_angle(ship.fwd, axis, rot_angle).normalize();
    ship.up = crate::math::rotate_axis_angle(ship.up, axis, rot_angle).normalize();
}

pub fn set_speed(ship: &mut ShipState, cls: &ShipClass, speed: f32) {
    ship.speed = speed.max(0.0).min(cls.max_speed);
}

/// Diffs `cur` against `prev` and builds a `StateUpdate` (opcode 0x1C)
/// payload, or `None` if nothing crossed the per-field change threshold.
pub fn build_state_update(
    cur: &ShipState,
    prev: &ShipState,
    game_time: f32,
    buf: &mut [u8],
) -> Option<usize> {
    let mut flags = 0u8;
    if (cur.pos.x - prev.pos.x).abs() > 0.01
        || (cur.pos.y - prev.pos.y).abs() > 0.01
        || (cur.pos.z - prev.pos.z).abs() > 0.01
    {
        flags |= dirty::POSITION_ABS;
    }
    if (cur.fwd.x - prev.fwd.x).abs() > 0.001
        || (cur.fwd.y - prev.fwd.y).abs() > 0.001
        || (cur.fwd.z - prev.fwd.z).abs() > 0.001
    {
        flags |= dirty::ORIENT_FWD;
    }
    if (cur.up.x - prev.up.x).abs() > 0.001
        || (cur.up.y - prev.up.y).abs() > 0.001
        || (cur.up.z - prev.up.z).abs() > 0.001
    {
        flags |= dirty::ORIENT_UP;
    }
    if (cur.speed - prev.speed).abs() > 0.01 {
        flags |= dirty::SPEED;
    }
    if cur.cloak_state != prev.cloak_state {
        flags |= dirty::CLOAK_STATE;
    }

    if flags == 0 {
        return None;
    }

    let mut field_data = [0u8; 32];
    let mut fb = Cursor::new(&mut field_data);

    if flags & dirty::POSITION_ABS != 0 {
        fb.write_f32(cur.pos.x);
        fb.write_f32(cur.pos.y);
        fb.write_f32(cur.pos.z);
        // No hash bit for now -- mirrors the source's own placeholder.
        fb.write_bit(false);
    }
    if flags & dirty::ORIENT_FWD != 0 {
        fb.write_cv3(cur.fwd.x, cur.fwd.y, cur.fwd.z);
    }
    if flags & dirty::ORIENT_UP != 0 {
        fb.write_cv3(cur.up.x, cur.up.y, cur.up.z);
    }
    if flags & dirty::SPEED != 0 {
        fb.write_cf16(cur.speed);
    }
    if flags & dirty::CLOAK_STATE != 0 {
        fb.write_u8(cloak_state_byte(cur.cloak_state));
    }
    let field_len = fb.position();

    let mut out = Cursor::new(buf);
    if !out.write_u8(crate::opcodes::GameOp::StateUpdate.to_byte())
        || !out.write_i32(cur.object_id)
        || !out.write_f32(game_time)
        || !out.write_u8(flags)
        || !out.write_bytes(&field_data[..field_len])
    {
        return None;
    }
    Some(out.position())
}

/// Builds a `StateUpdate` carrying only the `0x20` subsystem-health
/// dirty bit for a single round-robin subsystem index -- the periodic
/// health broadcast and an immediate damage-induced update both use
/// this, differing only in whether the caller advances the round-robin
/// cursor first.
///
/// For the owning peer, `include_power` is `false`: the owner's own
/// copy of this message omits the power-allocation byte, which is a
/// server-authoritative override only other viewers need to see.
pub fn build_subsystem_health_update(
    buf: &mut [u8],
    object_id: i32,
    game_time: f32,
    subsystem_idx: u8,
    condition_pct: f32,
    include_power: bool,
) -> Option<usize> {
    let mut cur = Cursor::new(buf);
    if !cur.write_u8(crate::opcodes::GameOp::StateUpdate.to_byte())
        || !cur.write_i32(object_id)
        || !cur.write_f32(game_time)
        || !cur.write_u8(dirty::SUBSYSTEM_STATES)
        || !cur.write_u8(subsystem_idx)
        || !cur.write_cf16(condition_pct)
    {
        return None;
    }
    if include_power && !cur.write_u8(0xFF) {
        return None;
    }
    Some(cur.position())
}

fn cloak_state_byte(state: crate::ship::CloakState) -> u8 {
    use crate::ship::CloakState::*;
    match state {
        Decloaked => 0,
        Cloaking => 1,
        Cloaked => 2,
        Decloaking => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ShipClass, Vec3 as RVec3};

    fn sample_class() -> ShipClass {
        ShipClass {
            name: "Test".into(),
            species_id: 1,
            faction: "F".into(),
            hull_hp: 100.0,
            mass: 1.0,
            rotational_inertia: 1.0,
            max_speed: 50.0,
            max_accel: 1.0,
            max_angular_accel: 1.0,
            max_angular_velocity: 1.0,
            shield_hp: [10.0; 6],
            shield_recharge: [1.0; 6],
            can_cloak: false,
            has_tractor: false,
            torpedo_tubes: 0,
            phaser_banks: 0,
            pulse_weapons: 0,
            tractor_beams: 0,
            max_repair_points: 0.0,
            num_repair_teams: 0,
            damage_radius_multiplier: 1.0,
            subsystems: vec![],
        }
    }

    fn ship_at(pos: Vec3, fwd: Vec3, up: Vec3) -> ShipState {
        let cls = sample_class();
        let mut s = ShipState::spawn(&cls, 0, 1, 1, 0);
        s.pos = pos;
        s.fwd = fwd;
        s.up = up;
        s
    }

    #[test]
    fn move_tick_advances_along_forward() {
        let mut ship = ship_at(Vec3::ZERO, Vec3::new(0.0, 1.0, 0.0), Vec3::new(0.0, 0.0, 1.0));
        ship.speed = 10.0;
        move_tick(&mut ship, 1.0, 1.0);
        assert!((ship.pos.y - 10.0).abs() < 1e-5);
    }

    #[test]
    fn turn_toward_rotates_fwd_and_up_together() {
        let cls = sample_class();
        let mut ship = ship_at(Vec3::ZERO, Vec3::new(0.0, 1.0, 0.0), Vec3::new(0.0, 0.0, 1.0));
        turn_toward(&mut ship, &cls, Vec3::new(1.0, 0.0, 0.0), 10.0);
        assert!((ship.fwd.len() - 1.0).abs() < 1e-4);
        assert!((ship.up.len() - 1.0).abs() < 1e-4);
        // up should remain roughly perpendicular to fwd after rotation
        assert!(ship.fwd.dot(ship.up).abs() < 1e-3);
    }

    #[test]
    fn turn_toward_uses_up_as_axis_when_antiparallel() {
        let cls = sample_class();
        let mut ship = ship_at(Vec3::ZERO, Vec3::new(0.0, 1.0, 0.0), Vec3::new(0.0, 0.0, 1.0));
        turn_toward(&mut ship, &cls, Vec3::new(0.0, -1.0, 0.0), 0.01);
        // Should not panic/NaN and fwd should remain unit length.
        assert!((ship.fwd.len() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn set_speed_clamps_to_class_max() {
        let cls = sample_class();
        let mut ship = ship_at(Vec3::ZERO, Vec3::new(0.0, 1.0, 0.0), Vec3::new(0.0, 0.0, 1.0));
        set_speed(&mut ship, &cls, 1000.0);
        assert_eq!(ship.speed, cls.max_speed);
        set_speed(&mut ship, &cls, -5.0);
        assert_eq!(ship.speed, 0.0);
    }

    #[test]
    fn build_state_update_none_when_unchanged() {
        let ship = ship_at(Vec3::ZERO, Vec3::new(0.0, 1.0, 0.0), Vec3::new(0.0, 0.0, 1.0));
        let prev = ship_at(Vec3::ZERO, Vec3::new(0.0, 1.0, 0.0), Vec3::new(0.0, 0.0, 1.0));
        let mut buf = [0u8; 64];
        assert!(build_state_update(&ship, &prev, 0.0, &mut buf).is_none());
    }

    #[test]
    fn build_state_update_flags_position_change() {
        let mut ship = ship_at(Vec3::ZERO, Vec3::new(0.0, 1.0, 0.0), Vec3::new(0.0, 0.0, 1.0));
        let prev = ship_at(Vec3::ZERO, Vec3::new(0.0, 1.0, 0.0), Vec3::new(0.0, 0.0, 1.0));
        ship.pos = Vec3::new(5.0, 0.0, 0.0);
        let mut buf = [0u8; 64];
        let len = build_state_update(&ship, &prev, 1.5, &mut buf).unwrap();
        assert!(len > 0);
        assert_eq!(buf[0], crate::opcodes::GameOp::StateUpdate.to_byte());
    }

    #[test]
    fn subsystem_health_update_omits_power_byte_for_owner() {
        let mut owner_buf = [0u8; 32];
        let owner_len = build_subsystem_health_update(&mut owner_buf, 7, 1.0, 2, 0.5, false).unwrap();
        let mut viewer_buf = [0u8; 32];
        let viewer_len = build_subsystem_health_update(&mut viewer_buf, 7, 1.0, 2, 0.5, true).unwrap();
        assert_eq!(viewer_len, owner_len + 1);
        assert_eq!(owner_buf[9], dirty::SUBSYSTEM_STATES);
    }
}
