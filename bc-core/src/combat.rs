//! Weapon charging, shield facing/damage resolution, cloaking, tractor
//! beams, and repair, grounded on `original_source/src/game/combat.c`.

use crate::math::Vec3;
use crate::registry::{ShipClass, SubsystemDef};
use crate::ship::{CloakState, ShieldFacing, ShipState, CLOAK_TRANSITION_TIME};

/// Area-effect hits (e.g. collisions, torpedo blasts) spread damage evenly
/// across all six facings; directed hits (beams) land on the single facing
/// the impact direction resolves to. Both carry the impact direction,
/// shooter-to-target -- area-effect hits still need it to find which
/// subsystems the blast overlaps, they just don't use it for shield facing.
pub enum DamageKind {
    Directed(Vec3),
    AreaEffect(Vec3),
}

impl DamageKind {
    fn impact_dir(&self) -> Vec3 {
        match *self {
            DamageKind::Directed(dir) | DamageKind::AreaEffect(dir) => dir,
        }
    }
}

/// Resolves `damage` against `ship`'s shields/hull/subsystems, matching
/// `bc_combat_apply_damage`:
/// 1. cloaked ships skip shields entirely (overflow = full damage);
///    otherwise pick facing(s) and split damage across them (area-effect:
///    /6, each facing absorbs independently)
/// 2. absorb into shield_hp per facing, remainder is the overflow
/// 3. hull takes the *entire* overflow
/// 4. `damage_radius * cls.damage_radius_multiplier` (the effective blast
///    radius) is tested against every subsystem's AABB in the target's
///    local frame; every subsystem it overlaps separately loses
///    `overflow * 0.5`, and 25% of that (`overflow * 0.125`) propagates to
///    a contained-in parent that's still alive
/// 5. caller (not this function) checks `is_critical` subsystems reaching
///    zero and destroys the ship if so -- orchestration, not here
pub fn apply_damage(
    ship: &mut ShipState,
    cls: &ShipClass,
    damage: f32,
    kind: DamageKind,
    damage_radius: f32,
) {
    if !ship.alive || damage <= 0.0 {
        return;
    }

    let impact_dir = kind.impact_dir();

    let overflow = if !shields_active(ship) {
        damage
    } else {
        match kind {
            DamageKind::AreaEffect(_) => {
                let per_facing = damage / 6.0;
                let mut total_hull = 0.0;
                for i in 0..6 {
                    total_hull += absorb_shield(&mut ship.shield_hp[i], per_facing);
                }
                total_hull
            }
            DamageKind::Directed(dir) => {
                let facing = select_facing(ship, dir);
                absorb_shield(&mut ship.shield_hp[facing.index()], damage)
            }
        }
    };

    if overflow <= 0.0 {
        return;
    }

    ship.hull_hp = (ship.hull_hp - overflow).max(0.0);

    let effective_radius = damage_radius * cls.damage_radius_multiplier;
    if effective_radius <= 0.0 {
        return;
    }

    let right = ship.right();
    let local = Vec3::new(right.dot(impact_dir), ship.fwd.dot(impact_dir), ship.up.dot(impact_dir));

    for (idx, def) in cls.subsystems.iter().enumerate() {
        if def.radius <= 0.0 || !aabb_overlap(local, effective_radius, def) {
            continue;
        }
        let hp = match ship.subsystem_hp.get_mut(idx) {
            Some(hp) if *hp > 0.0 => hp,
            _ => continue,
        };
        let sub_dmg = overflow * 0.5;
        *hp = (*hp - sub_dmg).max(0.0);

        if let Some(parent_idx) = def.parent_idx {
            if let Some(parent_hp) = ship.subsystem_hp.get_mut(parent_idx) {
                if *parent_hp > 0.0 {
                    *parent_hp = (*parent_hp - sub_dmg * 0.25).max(0.0);
                }
            }
        }
    }
}

fn absorb_shield(shield: &mut f32, incoming: f32) -> f32 {
    if *shield >= incoming {
        *shield -= incoming;
        0.0
    } else {
        let remainder = incoming - *shield;
        *shield = 0.0;
        remainder
    }
}

/// Picks the facing whose local axis is most aligned with the impact
/// direction: `right = fwd x up` completes the frame, and whichever of
/// +-fwd/+-up/+-right the impact projects largest onto wins.
pub fn select_facing(ship: &ShipState, impact_dir: Vec3) -> ShieldFacing {
    let right = ship.right();
    let candidates = [
        (ShieldFacing::Front, ship.fwd.dot(impact_dir)),
        (ShieldFacing::Rear, -ship.fwd.dot(impact_dir)),
        (ShieldFacing::Top, ship.up.dot(impact_dir)),
        (ShieldFacing::Bottom, -ship.up.dot(impact_dir)),
        (ShieldFacing::Right, right.dot(impact_dir)),
        (ShieldFacing::Left, -right.dot(impact_dir)),
    ];
    candidates
        .iter()
        .copied()
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(f, _)| f)
        .unwrap_or(ShieldFacing::Front)
}

/// AABB overlap test in the target's local frame: `local` is the impact
/// direction projected onto (right, forward, up), `def.position` is the
/// subsystem's position in that same frame. Per axis, `[local -
/// damage_radius, local + damage_radius]` overlaps `[position - radius,
/// position + radius]` iff the two centers are within the sum of the two
/// half-extents -- a coarse box test, not a nearest-point/ray test, so a
/// subsystem can register a hit even when the true hitbox is missed.
fn aabb_overlap(local: Vec3, damage_radius: f32, def: &SubsystemDef) -> bool {
    (local.x - def.position.x).abs() <= damage_radius + def.radius
        && (local.y - def.position.y).abs() <= damage_radius + def.radius
        && (local.z - def.position.z).abs() <= damage_radius + def.radius
}

/// Two-pass shield recharge: each facing gains `rate * dt`, and the part
/// of that gain that would overflow the facing's max is redistributed
/// across the other facings in proportion to their remaining headroom.
pub fn recharge_shields(ship: &mut ShipState, cls: &ShipClass, dt: f32) {
    if !ship.alive || ship.cloak_state == CloakState::Cloaked {
        return;
    }
    let mut overflow = 0.0f32;
    let mut headroom = [0.0f32; 6];
    for i in 0..6 {
        let max = cls.shield_hp[i];
        let gained = cls.shield_recharge[i] * dt;
        let new_val = ship.shield_hp[i] + gained;
        if new_val > max {
            overflow += new_val - max;
            ship.shield_hp[i] = max;
        } else {
            ship.shield_hp[i] = new_val;
        }
        headroom[i] = (max - ship.shield_hp[i]).max(0.0);
    }
    if overflow <= 0.0 {
        return;
    }
    let total_headroom: f32 = headroom.iter().sum();
    if total_headroom <= 0.0 {
        return;
    }
    for i in 0..6 {
        let share = overflow * (headroom[i] / total_headroom);
        ship.shield_hp[i] = (ship.shield_hp[i] + share).min(cls.shield_hp[i]);
    }
}

/// Collision damage between two ships: proportional to relative speed and
/// a fixed scale/offset (Open-Questions-resolved: scale 1.0, offset 0.0).
pub fn collision_damage(relative_speed: f32) -> f32 {
    const SCALE: f32 = 1.0;
    const OFFSET: f32 = 0.0;
    (relative_speed * SCALE + OFFSET).max(0.0)
}

// --- Cloaking ---------------------------------------------------------

pub fn start_cloak(ship: &mut ShipState, cls: &ShipClass) -> bool {
    if !cls.can_cloak || !ship.alive || ship.cloak_state != CloakState::Decloaked {
        return false;
    }
    ship.cloak_state = CloakState::Cloaking;
    ship.cloak_timer = 0.0;
    true
}

pub fn stop_cloak(ship: &mut ShipState) -> bool {
    if ship.cloak_state != CloakState::Cloaked && ship.cloak_state != CloakState::Cloaking {
        return false;
    }
    ship.cloak_state = CloakState::Decloaking;
    ship.cloak_timer = 0.0;
    true
}

/// Advances the cloak state machine. Shield HP is preserved (not zeroed)
/// while cloaked; any shield facing that dropped to 0 is restored to 1.0
/// the moment the ship finishes decloaking.
pub fn cloak_tick(ship: &mut ShipState, dt: f32) {
    if ship.cloak_state == CloakState::Decloaked {
        return;
    }
    ship.cloak_timer += dt;
    if ship.cloak_timer < CLOAK_TRANSITION_TIME {
        return;
    }
    ship.cloak_timer = 0.0;
    match ship.cloak_state {
        CloakState::Cloaking => ship.cloak_state = CloakState::Cloaked,
        CloakState::Decloaking => {
            ship.cloak_state = CloakState::Decloaked;
            for hp in ship.shield_hp.iter_mut() {
                if *hp <= 0.0 {
                    *hp = 1.0;
                }
            }
        }
        _ => {}
    }
}

pub fn can_fire_weapons(ship: &ShipState) -> bool {
    ship.cloak_state == CloakState::Decloaked
}

pub fn shields_active(ship: &ShipState) -> bool {
    ship.cloak_state != CloakState::Cloaked
}

// --- Weapons ------------------------------------------------------------

pub fn phaser_charge_tick(ship: &mut ShipState, cls: &ShipClass, power_level: f32, dt: f32) {
    for bank in 0..cls.phaser_banks as usize {
        let def = match cls.subsystems.get(bank) {
            Some(d) => d,
            None => continue,
        };
        if let Some(charge) = ship.phaser_charge.get_mut(bank) {
            let rate = def.recharge_rate * power_level;
            *charge = (*charge + rate * dt).min(def.max_charge);
        }
    }
}

pub fn can_fire_phaser(ship: &ShipState, cls: &ShipClass, bank: usize) -> bool {
    if bank >= cls.phaser_banks as usize || !can_fire_weapons(ship) {
        return false;
    }
    match (cls.subsystems.get(bank), ship.phaser_charge.get(bank)) {
        (Some(def), Some(&charge)) => charge >= def.min_firing_charge,
        _ => false,
    }
}

pub fn fire_phaser(ship: &mut ShipState, cls: &ShipClass, bank: usize) -> Option<f32> {
    if !can_fire_phaser(ship, cls, bank) {
        return None;
    }
    let charge = ship.phaser_charge[bank];
    ship.phaser_charge[bank] = 0.0;
    Some(charge)
}

pub fn torpedo_cooldown_tick(ship: &mut ShipState, dt: f32) {
    for cd in ship.torpedo_cooldown.iter_mut() {
        if *cd > 0.0 {
            *cd = (*cd - dt).max(0.0);
        }
    }
    if ship.torpedo_switching {
        ship.torpedo_switch_timer -= dt;
        if ship.torpedo_switch_timer <= 0.0 {
            ship.torpedo_switching = false;
        }
    }
}

pub fn can_fire_torpedo(ship: &ShipState, cls: &ShipClass, tube: usize) -> bool {
    tube < cls.torpedo_tubes as usize
        && can_fire_weapons(ship)
        && !ship.torpedo_switching
        && ship.torpedo_cooldown.get(tube).copied() == Some(0.0)
}

pub fn fire_torpedo(ship: &mut ShipState, cls: &ShipClass, tube: usize, reload_delay: f32) -> bool {
    if !can_fire_torpedo(ship, cls, tube) {
        return false;
    }
    ship.torpedo_cooldown[tube] = reload_delay;
    true
}

pub fn switch_torpedo_type(ship: &mut ShipState, new_type: u8, switch_time: f32) -> bool {
    if ship.torpedo_switching || new_type == ship.torpedo_type {
        return false;
    }
    ship.torpedo_switching = true;
    ship.torpedo_switch_timer = switch_time;
    ship.torpedo_type = new_type;
    true
}

// --- Tractor beams --------------------------------------------------------

pub fn engage_tractor(ship: &mut ShipState, cls: &ShipClass, target_id: i32) -> bool {
    if !cls.has_tractor || !can_fire_weapons(ship) {
        return false;
    }
    ship.tractor_target_id = target_id;
    true
}

pub fn disengage_tractor(ship: &mut ShipState) {
    ship.tractor_target_id = -1;
}

/// Applies tractor drag to `target`: multiplicative speed reduction, no
/// direct damage. Auto-releases the beam on the source if `target_dist`
/// exceeds `max_range`.
pub fn tractor_tick(source: &mut ShipState, target: &mut ShipState, target_dist: f32, max_range: f32, ratio: f32, _dt: f32) {
    if source.tractor_target_id != target.object_id {
        return;
    }
    if target_dist > max_range {
        source.tractor_target_id = -1;
        return;
    }
    target.speed *= 1.0 - ratio.clamp(0.0, 1.0);
}

// --- Repair ---------------------------------------------------------------

/// Queues `subsystem_idx` for repair if it isn't already queued and isn't
/// already at full health.
pub fn queue_repair(ship: &mut ShipState, cls: &ShipClass, subsystem_idx: usize) {
    if ship.repair_queue.contains(&subsystem_idx) {
        return;
    }
    let full = cls
        .subsystems
        .get(subsystem_idx)
        .map(|d| ship.subsystem_hp.get(subsystem_idx).copied().unwrap_or(0.0) >= d.max_condition)
        .unwrap_or(true);
    if !full {
        ship.repair_queue.push(subsystem_idx);
    }
}

/// Advances the repair FIFO by one tick. `raw_repair = max_repair_points *
/// repair_sys_health_pct * dt` is split evenly across the first
/// `min(queue_count, num_repair_teams)` entries; a 0-HP (destroyed)
/// subsystem is skipped for this tick but stays queued (it can't progress
/// until some other mechanism restores it above 0). Entries reaching full
/// health are removed from the queue, compacting it.
pub fn repair_tick(ship: &mut ShipState, cls: &ShipClass, repair_sys_health_pct: f32, dt: f32) {
    if ship.repair_queue.is_empty() || cls.max_repair_points <= 0.0 {
        return;
    }
    let raw_repair = cls.max_repair_points * repair_sys_health_pct * dt;
    let active = ship.repair_queue.len().min(cls.num_repair_teams.max(0) as usize).max(1);
    let mut completed = Vec::new();
    for (slot, &idx) in ship.repair_queue.iter().take(active).enumerate() {
        let def = match cls.subsystems.get(idx) {
            Some(d) => d,
            None => continue,
        };
        let hp = match ship.subsystem_hp.get_mut(idx) {
            Some(hp) => hp,
            None => continue,
        };
        if *hp <= 0.0 {
            continue;
        }
        let gain = (raw_repair / active as f32) / def.repair_complexity.max(1.0);
        *hp = (*hp + gain).min(def.max_condition);
        if *hp >= def.max_condition {
            completed.push(slot);
        }
    }
    for &slot in completed.iter().rev() {
        ship.repair_queue.remove(slot);
    }
}
