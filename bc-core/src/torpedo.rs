//! Fixed-slot torpedo tracker: spawn, vector-blend homing, hit detection,
//! lifetime expiry. Grounded on
//! `original_source/src/game/torpedo_tracker.c`.

use crate::math::Vec3;

pub const MAX_TORPEDOES: usize = 32;

pub struct Torpedo {
    pub shooter_id: i32,
    pub shooter_slot: usize,
    /// -1 means dumbfire (no homing, no proximity hit check).
    pub target_id: i32,
    pub pos: Vec3,
    /// Normalized direction, not a scaled velocity -- speed is separate.
    pub vel: Vec3,
    pub speed: f32,
    pub damage: f32,
    pub damage_radius: f32,
    pub lifetime: f32,
    pub guidance_life: f32,
    pub max_angular: f32,
}

/// Outcome of a tick: a torpedo either expired harmlessly or struck its
/// target, in which case the caller applies damage via [`crate::combat`].
pub struct TorpedoHit {
    pub shooter_slot: usize,
    pub target_id: i32,
    pub damage: f32,
    pub damage_radius: f32,
    pub impact_pos: Vec3,
}

pub struct TorpedoManager {
    slots: Vec<Option<Torpedo>>,
    count: usize,
}

impl TorpedoManager {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_TORPEDOES);
        slots.resize_with(MAX_TORPEDOES, || None);
        TorpedoManager { slots, count: 0 }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Spawns a torpedo into the first free slot. Returns the slot index,
    /// or `None` if every slot is occupied.
    pub fn spawn(&mut self, t: Torpedo) -> Option<usize> {
        let slot = self.slots.iter().position(|s| s.is_none())?;
        self.slots[slot] = Some(t);
        self.count += 1;
        Some(slot)
    }

    /// Advances every active torpedo by `dt`, applying homing via
    /// `get_target` and reporting hits where `distance(pos, target_pos) <
    /// hit_radius`. `get_target` returns `None` when the target object no
    /// longer exists (already destroyed, disconnected).
    pub fn tick(
        &mut self,
        dt: f32,
        hit_radius: f32,
        mut get_target: impl FnMut(i32) -> Option<Vec3>,
    ) -> Vec<TorpedoHit> {
        let mut hits = Vec::new();
        if dt <= 0.0 {
            return hits;
        }

        for slot in self.slots.iter_mut() {
            let t = match slot {
                Some(t) => t,
                None => continue,
            };

            if t.target_id >= 0 && t.guidance_life > 0.0 {
                if let Some(target_pos) = get_target(t.target_id) {
                    let to_target = target_pos.sub(t.pos).normalize();
                    let max_turn = t.max_angular * dt;
                    t.vel = t.vel.scale(1.0).add(to_target.scale(max_turn)).normalize();
                }
                t.guidance_life -= dt;
            }

            t.pos = t.pos.add(t.vel.scale(t.speed * dt));

            let mut expired_by_hit = false;
            if t.target_id >= 0 {
                if let Some(target_pos) = get_target(t.target_id) {
                    if t.pos.dist(target_pos) < hit_radius {
                        hits.push(TorpedoHit {
                            shooter_slot: t.shooter_slot,
                            target_id: t.target_id,
                            damage: t.damage,
                            damage_radius: t.damage_radius,
                            impact_pos: t.pos,
                        });
                        expired_by_hit = true;
                    }
                }
            }

            if expired_by_hit {
                *slot = None;
                self.count -= 1;
                continue;
            }

            t.lifetime -= dt;
            if t.lifetime <= 0.0 {
                *slot = None;
                self.count -= 1;
            }
        }

        hits
    }
}

impl Default for TorpedoManager {
    fn default() -> Self {
        TorpedoManager::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dumbfire(pos: Vec3, vel: Vec3) -> Torpedo {
        Torpedo {
            shooter_id: 1,
            shooter_slot: 1,
            target_id: -1,
            pos,
            vel,
            speed: 100.0,
            damage: 50.0,
            damage_radius: 5.0,
            lifetime: 8.0,
            guidance_life: 0.0,
            max_angular: 0.0,
        }
    }

    #[test]
    fn spawn_fills_first_free_slot() {
        let mut mgr = TorpedoManager::new();
        let slot = mgr.spawn(dumbfire(Vec3::ZERO, Vec3::new(0.0, 1.0, 0.0))).unwrap();
        assert_eq!(slot, 0);
        assert_eq!(mgr.count(), 1);
    }

    #[test]
    fn spawn_fails_when_full() {
        let mut mgr = TorpedoManager::new();
        for _ in 0..MAX_TORPEDOES {
            assert!(mgr.spawn(dumbfire(Vec3::ZERO, Vec3::new(0.0, 1.0, 0.0))).is_some());
        }
        assert!(mgr.spawn(dumbfire(Vec3::ZERO, Vec3::new(0.0, 1.0, 0.0))).is_none());
    }

    #[test]
    fn dumbfire_expires_after_lifetime() {
        let mut mgr = TorpedoManager::new();
        mgr.spawn(dumbfire(Vec3::ZERO, Vec3::new(0.0, 1.0, 0.0)));
        let hits = mgr.tick(10.0, 5.0, |_| None);
        assert!(hits.is_empty());
        assert_eq!(mgr.count(), 0);
    }

    #[test]
    fn homing_torpedo_hits_target_within_radius() {
        let mut mgr = TorpedoManager::new();
        let mut t = dumbfire(Vec3::new(0.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0));
        t.target_id = 7;
        t.guidance_life = 4.0;
        t.max_angular = 2.0;
        t.speed = 50.0;
        mgr.spawn(t);

        let target_pos = Vec3::new(2.0, 0.0, 0.0);
        let hits = mgr.tick(0.1, 5.0, |id| if id == 7 { Some(target_pos) } else { None });
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].target_id, 7);
        assert_eq!(mgr.count(), 0);
    }

    #[test]
    fn homing_blends_velocity_toward_target_not_slerp() {
        let mut mgr = TorpedoManager::new();
        let mut t = dumbfire(Vec3::ZERO, Vec3::new(1.0, 0.0, 0.0));
        t.target_id = 7;
        t.guidance_life = 4.0;
        t.max_angular = 0.1;
        t.speed = 1.0;
        mgr.spawn(t);

        let target_pos = Vec3::new(0.0, 100.0, 0.0);
        mgr.tick(0.01, 0.001, |id| if id == 7 { Some(target_pos) } else { None });
        let vel = match &mgr.slots[0] {
            Some(t) => t.vel,
            None => panic!("torpedo should still be active"),
        };
        // A small tick bends the direction slightly toward +y but keeps
        // it mostly +x -- a vector blend, not an instant snap to target.
        assert!(vel.x > 0.9);
        assert!(vel.y > 0.0 && vel.y < 0.2);
    }
}
