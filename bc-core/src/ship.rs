//! Mutable per-ship simulation state, mirroring `bc_ship_state_t` from
//! `ship_state.h`. Read-only class data lives in [`crate::registry`];
//! this module holds what changes every tick.

use crate::math::Vec3;
use crate::peer::{MAX_PHASER_BANKS, MAX_TORPEDO_TUBES};
use crate::registry::MAX_SHIELD_FACINGS;

pub const MAX_SUBSYSTEMS: usize = 64;

/// Torpedo hit radius used by the tick in [`crate::torpedo`]; the source
/// leaves this as a caller-supplied parameter but every call site in
/// practice uses the same value.
pub const TORPEDO_HIT_RADIUS: f32 = 5.0;

pub const CLOAK_TRANSITION_TIME: f32 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloakState {
    Decloaked,
    Cloaking,
    Cloaked,
    Decloaking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShieldFacing {
    Front,
    Rear,
    Top,
    Bottom,
    Left,
    Right,
}

impl ShieldFacing {
    pub fn index(self) -> usize {
        match self {
            ShieldFacing::Front => 0,
            ShieldFacing::Rear => 1,
            ShieldFacing::Top => 2,
            ShieldFacing::Bottom => 3,
            ShieldFacing::Left => 4,
            ShieldFacing::Right => 5,
        }
    }
}

/// Star-system lookup table, index 1-9 (index 0 unused: the wire format is
/// 1-based). Keys come from `Multiplayer/SpeciesToSystem.py`; only index 1
/// ("Multi1"/Asteroids) is independently confirmed, the rest are carried
/// as advisory best guesses pending a confirmed reference client.
pub const SYSTEM_TABLE: [(&str, &str); 10] = [
    ("", ""),
    ("Multi1", "Asteroids"),
    ("Multi2", "Cloudy"),
    ("Multi3", "Planetorama"),
    ("Multi4", "Showers"),
    ("Multi5", "Space"),
    ("Multi6", "StarSystem"),
    ("Multi7", "Sunny"),
    ("Albirea", "Albirea"),
    ("Poseidon", "Poseidon"),
];

/// A live ship's mutable state. Initialized from [`crate::registry::ShipClass`]
/// defaults on spawn.
pub struct ShipState {
    pub class_index: usize,
    pub object_id: i32,
    pub owner_slot: u8,
    pub team_id: u8,
    pub player_name: String,

    pub pos: Vec3,
    pub fwd: Vec3,
    pub up: Vec3,
    pub speed: f32,

    pub hull_hp: f32,
    pub shield_hp: [f32; MAX_SHIELD_FACINGS],
    pub subsystem_hp: Vec<f32>,

    pub cloak_state: CloakState,
    pub cloak_timer: f32,

    pub phaser_charge: [f32; MAX_PHASER_BANKS],
    pub torpedo_cooldown: [f32; MAX_TORPEDO_TUBES],
    pub torpedo_type: u8,
    pub torpedo_switching: bool,
    pub torpedo_switch_timer: f32,

    pub tractor_target_id: i32,

    pub alive: bool,
    /// FIFO repair queue of subsystem indices. A `Vec` here plays the role
    /// of the source's fixed `repair_queue[BC_MAX_SUBSYSTEMS]` + count.
    pub repair_queue: Vec<usize>,
}

impl ShipState {
    /// Builds a freshly-spawned ship from class defaults: full health, full
    /// charge, zero cooldowns, decloaked, identity orientation.
    pub fn spawn(
        cls: &crate::registry::ShipClass,
        class_index: usize,
        object_id: i32,
        owner_slot: u8,
        team_id: u8,
    ) -> ShipState {
        let subsystem_hp = cls.subsystems.iter().map(|s| s.max_condition).collect();
        ShipState {
            class_index,
            object_id,
            owner_slot,
            team_id,
            player_name: String::new(),
            pos: Vec3::ZERO,
            fwd: Vec3::new(0.0, 1.0, 0.0),
            up: Vec3::new(0.0, 0.0, 1.0),
            speed: 0.0,
            hull_hp: cls.hull_hp,
            shield_hp: cls.shield_hp,
            subsystem_hp,
            cloak_state: CloakState::Decloaked,
            cloak_timer: 0.0,
            phaser_charge: [0.0; MAX_PHASER_BANKS],
            torpedo_cooldown: [0.0; MAX_TORPEDO_TUBES],
            torpedo_type: 0,
            torpedo_switching: false,
            torpedo_switch_timer: 0.0,
            tractor_target_id: -1,
            alive: true,
            repair_queue: Vec::new(),
        }
    }

    /// Local-frame right axis, `forward x up`, used for shield-facing
    /// selection and subsystem-hit transforms.
    pub fn right(&self) -> Vec3 {
        self.fwd.cross(self.up)
    }
}

impl Default for ShipState {
    /// Inert placeholder occupying a peer slot before `ObjCreateTeam` is
    /// parsed and [`ShipState::spawn`] is called. `alive` is `false` and
    /// every caller gates on the owning peer's `has_ship` flag first, so
    /// the exact contents here are never read as meaningful ship data.
    fn default() -> Self {
        ShipState {
            class_index: 0,
            object_id: -1,
            owner_slot: 0,
            team_id: 0,
            player_name: String::new(),
            pos: Vec3::ZERO,
            fwd: Vec3::new(0.0, 1.0, 0.0),
            up: Vec3::new(0.0, 0.0, 1.0),
            speed: 0.0,
            hull_hp: 0.0,
            shield_hp: [0.0; MAX_SHIELD_FACINGS],
            subsystem_hp: Vec::new(),
            cloak_state: CloakState::Decloaked,
            cloak_timer: 0.0,
            phaser_charge: [0.0; MAX_PHASER_BANKS],
            torpedo_cooldown: [0.0; MAX_TORPEDO_TUBES],
            torpedo_type: 0,
            torpedo_switching: false,
            torpedo_switch_timer: 0.0,
            tractor_target_id: -1,
            alive: false,
            repair_queue: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ShipClass, SubsystemDef, Vec3 as RVec3};

    fn sample_class() -> ShipClass {
        ShipClass {
            name: "Test".into(),
            species_id: 1,
            faction: "Federation".into(),
            hull_hp: 1000.0,
            mass: 1.0,
            rotational_inertia: 1.0,
            max_speed: 100.0,
            max_accel: 1.0,
            max_angular_accel: 1.0,
            max_angular_velocity: 1.0,
            shield_hp: [100.0; 6],
            shield_recharge: [1.0; 6],
            can_cloak: true,
            has_tractor: true,
            torpedo_tubes: 1,
            phaser_banks: 1,
            pulse_weapons: 0,
            tractor_beams: 1,
            max_repair_points: 10.0,
            num_repair_teams: 1,
            damage_radius_multiplier: 1.0,
            subsystems: vec![SubsystemDef {
                name: "Hull".into(),
                kind: "hull".into(),
                position: RVec3::default(),
                radius: 1.0,
                max_condition: 1000.0,
                disabled_pct: 0.0,
                is_critical: false,
                is_targetable: false,
                repair_complexity: 1.0,
                max_damage: 0.0,
                max_charge: 0.0,
                min_firing_charge: 0.0,
                recharge_rate: 0.0,
                discharge_rate: 0.0,
                max_damage_distance: 0.0,
                weapon_id: 0,
                forward: RVec3::default(),
                up: RVec3::default(),
                arc_width: [0.0; 2],
                arc_height: [0.0; 2],
                reload_delay: 0.0,
                max_ready: 0,
                immediate_delay: 0.0,
                direction: RVec3::default(),
                normal_power: 0.0,
                cloak_strength: 0.0,
                max_repair_points: 0.0,
                num_repair_teams: 0,
                parent_idx: None,
            }],
        }
    }

    #[test]
    fn spawn_copies_class_defaults() {
        let cls = sample_class();
        let ship = ShipState::spawn(&cls, 0, 42, 1, 0);
        assert_eq!(ship.hull_hp, cls.hull_hp);
        assert_eq!(ship.shield_hp, cls.shield_hp);
        assert_eq!(ship.subsystem_hp, vec![1000.0]);
        assert!(ship.alive);
        assert_eq!(ship.cloak_state, CloakState::Decloaked);
    }

    #[test]
    fn system_table_index_one_is_asteroids() {
        assert_eq!(SYSTEM_TABLE[1], ("Multi1", "Asteroids"));
    }
}
