//! Ship class and projectile registry, loaded from a JSON manifest at
//! startup. Mirrors `bc_game_registry_t`'s shape field-for-field; unlike the
//! original's fixed-size C arrays, counts here are just `Vec::len()`.

use std::fs;
use std::path::Path;

use serde_derive::{Deserialize, Serialize};

pub const MAX_SHIELD_FACINGS: usize = 6;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubsystemDef {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub position: Vec3,
    pub radius: f32,
    pub max_condition: f32,
    pub disabled_pct: f32,
    pub is_critical: bool,
    pub is_targetable: bool,
    pub repair_complexity: f32,

    #[serde(default)]
    pub max_damage: f32,
    #[serde(default)]
    pub max_charge: f32,
    #[serde(default)]
    pub min_firing_charge: f32,
    #[serde(default)]
    pub recharge_rate: f32,
    #[serde(default)]
    pub discharge_rate: f32,
    #[serde(default)]
    pub max_damage_distance: f32,
    #[serde(default)]
    pub weapon_id: u8,

    #[serde(default)]
    pub forward: Vec3,
    #[serde(default)]
    pub up: Vec3,
    #[serde(default)]
    pub arc_width: [f32; 2],
    #[serde(default)]
    pub arc_height: [f32; 2],

    #[serde(default)]
    pub reload_delay: f32,
    #[serde(default)]
    pub max_ready: i32,
    #[serde(default)]
    pub immediate_delay: f32,
    #[serde(default)]
    pub direction: Vec3,

    #[serde(default)]
    pub normal_power: f32,

    #[serde(default)]
    pub cloak_strength: f32,

    #[serde(default)]
    pub max_repair_points: f32,
    #[serde(default)]
    pub num_repair_teams: i32,

    /// Index of this subsystem's containing subsystem within the same
    /// ship class's `subsystems` list, or `None` if top-level. Used to
    /// propagate damage to a parent when a contained subsystem is hit.
    #[serde(default)]
    pub parent_idx: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShipClass {
    pub name: String,
    pub species_id: u16,
    pub faction: String,
    pub hull_hp: f32,
    pub mass: f32,
    pub rotational_inertia: f32,
    pub max_speed: f32,
    pub max_accel: f32,
    pub max_angular_accel: f32,
    pub max_angular_velocity: f32,
    pub shield_hp: [f32; MAX_SHIELD_FACINGS],
    pub shield_recharge: [f32; MAX_SHIELD_FACINGS],
    pub can_cloak: bool,
    pub has_tractor: bool,
    pub torpedo_tubes: u8,
    pub phaser_banks: u8,
    pub pulse_weapons: u8,
    pub tractor_beams: u8,
    pub max_repair_points: f32,
    pub num_repair_teams: i32,
    /// Scales subsystem-damage AABB radius checks for this class. Not
    /// present in the original's checked-in header but referenced by its
    /// combat code; defaults to 1.0 (no scaling) for manifests that omit it.
    #[serde(default = "one")]
    pub damage_radius_multiplier: f32,
    pub subsystems: Vec<SubsystemDef>,
}

fn one() -> f32 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectileDef {
    pub name: String,
    pub script: String,
    pub net_type_id: u8,
    pub damage: f32,
    pub launch_speed: f32,
    pub power_cost: f32,
    pub guidance_lifetime: f32,
    pub max_angular_accel: f32,
    pub lifetime: f32,
    pub damage_radius_factor: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Registry {
    #[serde(default)]
    pub ships: Vec<ShipClass>,
    #[serde(default)]
    pub projectiles: Vec<ProjectileDef>,
}

impl Registry {
    /// Loads a registry from a JSON manifest file.
    pub fn load(path: &Path) -> Result<Registry, String> {
        let text = fs::read_to_string(path).map_err(|e| e.to_string())?;
        serde_json::from_str(&text).map_err(|e| e.to_string())
    }

    pub fn get_ship(&self, index: usize) -> Option<&ShipClass> {
        self.ships.get(index)
    }

    pub fn find_ship(&self, species_id: u16) -> Option<&ShipClass> {
        self.ships.iter().find(|s| s.species_id == species_id)
    }

    pub fn find_ship_index(&self, species_id: u16) -> Option<usize> {
        self.ships.iter().position(|s| s.species_id == species_id)
    }

    pub fn get_projectile(&self, net_type_id: u8) -> Option<&ProjectileDef> {
        self.projectiles.iter().find(|p| p.net_type_id == net_type_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "ships": [{
                "name": "Sovereign",
                "species_id": 1,
                "faction": "Federation",
                "hull_hp": 6000.0,
                "mass": 3500000.0,
                "rotational_inertia": 1.0,
                "max_speed": 300.0,
                "max_accel": 10.0,
                "max_angular_accel": 1.0,
                "max_angular_velocity": 0.5,
                "shield_hp": [1200.0, 1200.0, 1200.0, 1200.0, 1200.0, 1200.0],
                "shield_recharge": [10.0, 10.0, 10.0, 10.0, 10.0, 10.0],
                "can_cloak": false,
                "has_tractor": true,
                "torpedo_tubes": 2,
                "phaser_banks": 4,
                "pulse_weapons": 0,
                "tractor_beams": 1,
                "max_repair_points": 50.0,
                "num_repair_teams": 2,
                "subsystems": [{
                    "name": "Main Phaser",
                    "type": "phaser",
                    "position": {"x": 0.0, "y": 0.0, "z": 10.0},
                    "radius": 2.0,
                    "max_condition": 100.0,
                    "disabled_pct": 0.2,
                    "is_critical": false,
                    "is_targetable": true,
                    "repair_complexity": 1.0
                }]
            }],
            "projectiles": [{
                "name": "Photon Torpedo",
                "script": "photon",
                "net_type_id": 0,
                "damage": 250.0,
                "launch_speed": 150.0,
                "power_cost": 20.0,
                "guidance_lifetime": 4.0,
                "max_angular_accel": 2.0,
                "lifetime": 8.0,
                "damage_radius_factor": 1.0
            }]
        }"#
    }

    #[test]
    fn parses_sample_registry() {
        let reg: Registry = serde_json::from_str(sample_json()).unwrap();
        assert_eq!(reg.ships.len(), 1);
        assert_eq!(reg.ships[0].subsystems.len(), 1);
        assert_eq!(reg.ships[0].subsystems[0].kind, "phaser");
        assert_eq!(reg.projectiles[0].net_type_id, 0);
    }

    #[test]
    fn finds_ship_by_species_id() {
        let reg: Registry = serde_json::from_str(sample_json()).unwrap();
        assert!(reg.find_ship(1).is_some());
        assert!(reg.find_ship(99).is_none());
        assert_eq!(reg.find_ship_index(1), Some(0));
    }

    #[test]
    fn finds_projectile_by_net_type() {
        let reg: Registry = serde_json::from_str(sample_json()).unwrap();
        assert!(reg.get_projectile(0).is_some());
        assert!(reg.get_projectile(5).is_none());
    }
}
