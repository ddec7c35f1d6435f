//! Simulation tick orchestration and loop cadence accounting. Grounded
//! on `bc_powered_efficiency` in `original_source/src/server/server_dispatch.c`,
//! which the header notes is "used by the simulation tick in the main loop".
//!
//! Per-phase mechanics (movement, damage, cloak, shields, repair,
//! torpedoes) already live in [`crate::movement`], [`crate::combat`], and
//! [`crate::torpedo`]; this module is the ordering and cadence glue that
//! calls them once per live ship, plus the round-robin health-broadcast
//! cursor and the fixed-interval scheduler the event loop consumes.

use crate::context::ServerContext;
use crate::math::Vec3;
use crate::opcodes::subsys;
use crate::peer::Peer;
use crate::registry::ShipClass;
use crate::ship::ShipState;
use crate::torpedo::TorpedoHit;

pub const SIM_INTERVAL_MS: u32 = 100;
pub const HEALTH_BROADCAST_INTERVAL_MS: u32 = 500;

/// Fixed-interval accumulator the event loop polls every iteration.
/// Separated from wall-clock reads so it can be driven by [`crate::clock::Clock`]
/// or a fake clock in tests without any real sleeping.
#[derive(Debug, Default)]
pub struct TickScheduler {
    sim_accum_ms: u32,
    health_accum_ms: u32,
}

/// Which fixed-interval phases are due this loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickDue {
    pub sim: bool,
    pub health_broadcast: bool,
}

impl TickScheduler {
    pub fn new() -> Self {
        TickScheduler::default()
    }

    /// Feeds `elapsed_ms` of real time into both accumulators, consuming
    /// at most one interval's worth of each per call -- the loop calls
    /// this once per 1ms-sleep iteration, so multiple intervals piling up
    /// in a single call would only happen under severe overload, in which
    /// case catching up one interval at a time (rather than all at once)
    /// avoids a death spiral of ever-larger simulation steps.
    pub fn advance(&mut self, elapsed_ms: u32) -> TickDue {
        self.sim_accum_ms += elapsed_ms;
        self.health_accum_ms += elapsed_ms;

        let sim = self.sim_accum_ms >= SIM_INTERVAL_MS;
        if sim {
            self.sim_accum_ms -= SIM_INTERVAL_MS;
        }
        let health_broadcast = self.health_accum_ms >= HEALTH_BROADCAST_INTERVAL_MS;
        if health_broadcast {
            self.health_accum_ms -= HEALTH_BROADCAST_INTERVAL_MS;
        }

        TickDue { sim, health_broadcast }
    }
}

/// Health fraction of the subsystems at `first..=last` (inclusive),
/// defaulting to fully healthy when the class has none at those fixed
/// slots. Mirrors the original's scan over "powered" consumer
/// subsystems, simplified to direct fixed-slot lookup since this
/// registry's schema (unlike the original's indirect `ser_list`) has no
/// powered-entry/child indirection to walk.
fn subsystem_range_health(ship: &ShipState, cls: &ShipClass, first: usize, last: usize) -> f32 {
    let mut total = 0.0f32;
    let mut max = 0.0f32;
    for idx in first..=last {
        if let (Some(def), Some(&hp)) = (cls.subsystems.get(idx), ship.subsystem_hp.get(idx)) {
            total += hp;
            max += def.max_condition;
        }
    }
    if max <= 0.0 {
        1.0
    } else {
        (total / max).clamp(0.0, 1.0)
    }
}

pub fn engine_efficiency(ship: &ShipState, cls: &ShipClass) -> f32 {
    subsystem_range_health(ship, cls, subsys::IMPULSE_1, subsys::IMPULSE_4)
}

pub fn reactor_power_level(ship: &ShipState, cls: &ShipClass) -> f32 {
    subsystem_range_health(ship, cls, subsys::REACTOR, subsys::REACTOR)
}

pub fn repair_system_health_pct(ship: &ShipState, cls: &ShipClass) -> f32 {
    subsystem_range_health(ship, cls, subsys::REPAIR, subsys::REPAIR)
}

/// Runs every per-ship phase in fixed order for one live ship: movement,
/// weapon charge, torpedo cooldown, cloak, shield recharge, repair.
/// Tractor drag and torpedo flight are handled separately since they
/// involve more than one ship's state at once.
pub fn run_ship_phases(ship: &mut ShipState, cls: &ShipClass, dt: f32) {
    if !ship.alive {
        return;
    }
    let efficiency = engine_efficiency(ship, cls);
    let power = reactor_power_level(ship, cls);
    let repair_pct = repair_system_health_pct(ship, cls);

    crate::movement::move_tick(ship, efficiency, dt);
    crate::combat::phaser_charge_tick(ship, cls, power, dt);
    crate::combat::torpedo_cooldown_tick(ship, dt);
    crate::combat::cloak_tick(ship, dt);
    crate::combat::recharge_shields(ship, cls, dt);
    crate::combat::repair_tick(ship, cls, repair_pct, dt);
}

/// Drag ratio for one ship's tractor beam this tick: `max_damage *
/// subsystem_condition * distance_ratio * dt`. `target_dist` and
/// `max_range` are supplied by the caller (who has both ships'
/// positions); this only needs the source's own class and subsystem
/// health.
pub fn tractor_drag_ratio(source: &ShipState, cls: &ShipClass, target_dist: f32, max_range: f32, dt: f32) -> f32 {
    let (def, hp) = match (cls.subsystems.get(subsys::TRACTOR_1), source.subsystem_hp.get(subsys::TRACTOR_1)) {
        (Some(d), Some(&hp)) if d.max_condition > 0.0 => (d, hp),
        _ => return 0.0,
    };
    if max_range <= 0.0 || target_dist > max_range {
        return 0.0;
    }
    let condition = (hp / def.max_condition).clamp(0.0, 1.0);
    let distance_ratio = (1.0 - target_dist / max_range).clamp(0.0, 1.0);
    (def.max_damage * condition * distance_ratio * dt).clamp(0.0, 1.0)
}

/// Runs the tractor-beam phase across every connected peer with an
/// active beam. Resolved in two passes -- gather candidate drags first
/// using only shared references, then apply mutations one slot at a time
/// -- so no two peer slots ever need a simultaneous mutable borrow.
pub fn run_tractor_phase(ctx: &mut ServerContext, dt: f32) {
    struct Action {
        source_slot: usize,
        target_slot: usize,
        release: bool,
        drag: f32,
    }

    let mut actions = Vec::new();
    for (source_slot, source) in ctx.peers.iter_connected() {
        if !source.has_ship || source.ship.tractor_target_id < 0 {
            continue;
        }
        let target_slot = match ctx
            .peers
            .iter_connected()
            .find(|(_, p)| p.has_ship && p.ship.object_id == source.ship.tractor_target_id)
            .map(|(slot, _)| slot)
        {
            Some(s) => s,
            None => continue,
        };
        let target = ctx.peers.get(target_slot).unwrap();
        let dist = source.ship.pos.dist(target.ship.pos);
        let cls = match source.class_index.and_then(|i| ctx.registry.get_ship(i)) {
            Some(c) => c,
            None => continue,
        };
        // max_range is the tractor subsystem's own max_damage_distance.
        let max_range = cls
            .subsystems
            .get(subsys::TRACTOR_1)
            .map(|d| d.max_damage_distance)
            .unwrap_or(0.0);
        if dist > max_range {
            actions.push(Action { source_slot, target_slot, release: true, drag: 0.0 });
            continue;
        }
        let drag = tractor_drag_ratio(&source.ship, cls, dist, max_range, dt);
        actions.push(Action { source_slot, target_slot, release: false, drag });
    }

    for action in actions {
        if action.release {
            if let Some(source) = ctx.peers.get_mut(action.source_slot) {
                source.ship.tractor_target_id = -1;
            }
        } else if let Some(target) = ctx.peers.get_mut(action.target_slot) {
            target.ship.speed *= 1.0 - action.drag;
        }
    }
}

/// Runs every per-ship phase, the tractor phase, and the torpedo
/// flight tick, advancing `ctx.game_time`. Returns torpedo hits for the
/// caller to resolve into damage, scoring, and broadcasts -- that's
/// dispatch's job, not this module's, matching how `combat::apply_damage`
/// never decides what message to send afterward either.
pub fn run_sim_tick(ctx: &mut ServerContext, dt: f32) -> Vec<TorpedoHit> {
    if !ctx.registry_loaded || dt <= 0.0 {
        return Vec::new();
    }

    // `registry` and `peers` are disjoint fields of `ServerContext`, so
    // borrowing one immutably and the other mutably in the same pass
    // compiles without any aliasing tricks.
    let registry = &ctx.registry;
    for (_, peer) in ctx.peers.iter_connected_mut() {
        if !peer.has_ship {
            continue;
        }
        let cls = match peer.class_index.and_then(|idx| registry.get_ship(idx)) {
            Some(c) => c,
            None => continue,
        };
        run_ship_phases(&mut peer.ship, cls, dt);
    }

    run_tractor_phase(ctx, dt);

    ctx.game_time += dt;

    let torpedo_hit_radius = crate::ship::TORPEDO_HIT_RADIUS;
    let peers = &ctx.peers;
    ctx.torpedoes.tick(dt, torpedo_hit_radius, |target_id| {
        peers
            .iter_connected()
            .find(|(_, p)| p.has_ship && p.ship.alive && p.ship.object_id == target_id)
            .map(|(_, p)| p.ship.pos)
    })
}

/// Advances a peer's round-robin subsystem-health cursor and returns the
/// index to report this broadcast. Only the periodic health-broadcast
/// tick calls this -- damage-induced immediate updates reuse the current
/// value without advancing it, preserving cadence (see
/// `send_health_update_immediate` in the source).
pub fn advance_health_cursor(peer: &mut Peer, subsystem_count: usize) -> u8 {
    let idx = peer.subsys_rr_idx;
    if subsystem_count > 0 {
        peer.subsys_rr_idx = ((idx as usize + 1) % subsystem_count) as u8;
    }
    idx
}

/// Builds the final master-heartbeat batch for a graceful shutdown. The
/// caller sends each payload and closes its sockets afterward.
pub fn shutdown_master_heartbeats(ctx: &mut ServerContext) -> Vec<(std::net::SocketAddr, String)> {
    ctx.masters.shutdown()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ServerConfig, ServerContext};
    use crate::peer::PeerTable;
    use crate::registry::{Registry, ShipClass, SubsystemDef, Vec3 as RVec3};

    fn addr(port: u16) -> std::net::SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn sub(kind: &str, max_condition: f32, max_damage: f32, max_damage_distance: f32) -> SubsystemDef {
        SubsystemDef {
            name: kind.to_string(),
            kind: kind.to_string(),
            position: RVec3::default(),
            radius: 1.0,
            max_condition,
            disabled_pct: 0.2,
            is_critical: false,
            is_targetable: true,
            repair_complexity: 1.0,
            max_damage,
            max_charge: 100.0,
            min_firing_charge: 50.0,
            recharge_rate: 10.0,
            discharge_rate: 0.0,
            max_damage_distance,
            weapon_id: 0,
            forward: RVec3::default(),
            up: RVec3::default(),
            arc_width: [0.0; 2],
            arc_height: [0.0; 2],
            reload_delay: 1.0,
            max_ready: 0,
            immediate_delay: 0.0,
            direction: RVec3::default(),
            normal_power: 1.0,
            cloak_strength: 0.0,
            max_repair_points: 0.0,
            num_repair_teams: 0,
            parent_idx: None,
        }
    }

    /// A class with every fixed subsystem slot up to TRACTOR_1 populated,
    /// so the range-scan helpers have something to find.
    fn full_class() -> ShipClass {
        let mut subsystems = vec![sub("filler", 100.0, 0.0, 0.0); subsys::TRACTOR_1 + 1];
        subsystems[subsys::REACTOR] = sub("reactor", 100.0, 0.0, 0.0);
        subsystems[subsys::REPAIR] = sub("repair", 100.0, 0.0, 0.0);
        subsystems[subsys::IMPULSE_1] = sub("impulse", 100.0, 0.0, 0.0);
        subsystems[subsys::TRACTOR_1] = sub("tractor_beam", 100.0, 20.0, 500.0);
        ShipClass {
            name: "Test".into(),
            species_id: 1,
            faction: "F".into(),
            hull_hp: 1000.0,
            mass: 1.0,
            rotational_inertia: 1.0,
            max_speed: 100.0,
            max_accel: 1.0,
            max_angular_accel: 1.0,
            max_angular_velocity: 1.0,
            shield_hp: [100.0; 6],
            shield_recharge: [10.0; 6],
            can_cloak: true,
            has_tractor: true,
            torpedo_tubes: 1,
            phaser_banks: 1,
            pulse_weapons: 0,
            tractor_beams: 1,
            max_repair_points: 20.0,
            num_repair_teams: 2,
            damage_radius_multiplier: 1.0,
            subsystems,
        }
    }

    #[test]
    fn scheduler_fires_sim_every_hundred_ms() {
        let mut sched = TickScheduler::new();
        assert_eq!(sched.advance(40), TickDue { sim: false, health_broadcast: false });
        assert_eq!(sched.advance(61), TickDue { sim: true, health_broadcast: false });
    }

    #[test]
    fn scheduler_fires_health_broadcast_every_500ms() {
        let mut sched = TickScheduler::new();
        for _ in 0..4 {
            sched.advance(100);
        }
        let due = sched.advance(100);
        assert!(due.sim);
        assert!(due.health_broadcast);
    }

    #[test]
    fn degraded_impulse_subsystem_reduces_engine_efficiency() {
        let cls = full_class();
        let mut ship = ShipState::spawn(&cls, 0, 1, 1, 0);
        ship.subsystem_hp[subsys::IMPULSE_1] = 50.0;
        assert!((engine_efficiency(&ship, &cls) - 0.5).abs() < 1e-3);
    }

    #[test]
    fn healthy_class_reports_full_efficiency() {
        let cls = full_class();
        let ship = ShipState::spawn(&cls, 0, 1, 1, 0);
        assert!((engine_efficiency(&ship, &cls) - 1.0).abs() < 1e-3);
        assert!((reactor_power_level(&ship, &cls) - 1.0).abs() < 1e-3);
        assert!((repair_system_health_pct(&ship, &cls) - 1.0).abs() < 1e-3);
    }

    #[test]
    fn tractor_drag_is_zero_out_of_range() {
        let cls = full_class();
        let ship = ShipState::spawn(&cls, 0, 1, 1, 0);
        assert_eq!(tractor_drag_ratio(&ship, &cls, 9999.0, 500.0, 0.1), 0.0);
    }

    #[test]
    fn tractor_drag_scales_with_condition_and_distance() {
        let cls = full_class();
        let mut ship = ShipState::spawn(&cls, 0, 1, 1, 0);
        ship.subsystem_hp[subsys::TRACTOR_1] = 50.0; // half condition
        let drag = tractor_drag_ratio(&ship, &cls, 250.0, 500.0, 1.0);
        assert!(drag > 0.0);
        assert!(drag < 20.0 * 1.0);
    }

    #[test]
    fn health_cursor_wraps_and_only_advances_when_called() {
        let mut peers = PeerTable::new();
        let slot = peers.add(addr(1), 0).unwrap();
        let peer = peers.get_mut(slot).unwrap();
        assert_eq!(advance_health_cursor(peer, 3), 0);
        assert_eq!(advance_health_cursor(peer, 3), 1);
        assert_eq!(advance_health_cursor(peer, 3), 2);
        assert_eq!(advance_health_cursor(peer, 3), 0);
    }

    #[test]
    fn sim_tick_noop_when_registry_not_loaded() {
        let mut ctx = ServerContext::new(ServerConfig::default(), 0x5655, 0);
        assert!(run_sim_tick(&mut ctx, 0.1).is_empty());
        assert_eq!(ctx.game_time, 0.0);
    }

    #[test]
    fn sim_tick_advances_game_time_once_loaded() {
        let mut ctx = ServerContext::new(ServerConfig::default(), 0x5655, 0);
        ctx.registry = Registry { ships: vec![full_class()], projectiles: Vec::new() };
        ctx.registry_loaded = true;
        run_sim_tick(&mut ctx, 0.1);
        assert!((ctx.game_time - 0.1).abs() < 1e-6);
    }

    #[test]
    fn tractor_phase_drags_target_and_releases_out_of_range() {
        let mut ctx = ServerContext::new(ServerConfig::default(), 0x5655, 0);
        let cls = full_class();
        ctx.registry = Registry { ships: vec![cls.clone()], projectiles: Vec::new() };
        ctx.registry_loaded = true;

        let s1 = ctx.peers.add(addr(1), 0).unwrap();
        let s2 = ctx.peers.add(addr(2), 0).unwrap();

        {
            let p1 = ctx.peers.get_mut(s1).unwrap();
            p1.has_ship = true;
            p1.class_index = Some(0);
            p1.ship = ShipState::spawn(&cls, 0, 100, s1 as u8, 0);
            p1.ship.tractor_target_id = 200;
            p1.ship.pos = Vec3::new(0.0, 0.0, 0.0);
        }
        {
            let p2 = ctx.peers.get_mut(s2).unwrap();
            p2.has_ship = true;
            p2.class_index = Some(0);
            p2.ship = ShipState::spawn(&cls, 0, 200, s2 as u8, 0);
            p2.ship.pos = Vec3::new(100.0, 0.0, 0.0);
            p2.ship.speed = 100.0;
        }

        run_tractor_phase(&mut ctx, 1.0);
        let target_speed = ctx.peers.get(s2).unwrap().ship.speed;
        assert!(target_speed < 100.0);

        // Now push the target out of range and confirm auto-release.
        ctx.peers.get_mut(s2).unwrap().ship.pos = Vec3::new(9999.0, 0.0, 0.0);
        run_tractor_phase(&mut ctx, 1.0);
        assert_eq!(ctx.peers.get(s1).unwrap().ship.tractor_target_id, -1);
    }
}
