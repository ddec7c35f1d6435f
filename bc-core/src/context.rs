//! `ServerContext`: the aggregate of per-session state a tick needs to
//! touch. Grounded on the global variable list in
//! `original_source/include/openbc/server_state.h` -- one field here per
//! `g_*` global there, collected into a struct instead of statics so the
//! simulation code stays testable without process-wide mutable state.

use std::collections::HashMap;

use serde_derive::Deserialize;

use crate::error::StartupError;
use crate::master::MasterList;
use crate::peer::PeerTable;
use crate::registry::Registry;
use crate::stats::SessionStats;
use crate::torpedo::TorpedoManager;

/// Display name for each of the nine playable star systems, keyed by the
/// same `Multi1`..`Multi9`-style index the client's MissionInit expects.
/// `g_system_table` in the source carries ten entries; only the first
/// nine are ever selected by `g_system_index` in practice (entry 0 is the
/// lobby/menu placeholder), matching [`crate::ship::SYSTEM_TABLE`].
pub const SYSTEM_TABLE_SIZE: usize = 10;

/// Per-file checksum entries a connecting client's CHECKSUM_RESP rounds
/// are validated against. No original-source manifest file survived
/// retrieval, so the on-disk format is left to `bc-server`'s config
/// loader; this type only carries the parsed result.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChecksumManifest {
    pub entries: HashMap<String, u32>,
}

impl ChecksumManifest {
    pub fn new() -> Self {
        ChecksumManifest { entries: HashMap::new() }
    }

    /// Validates a reported checksum for `file` against the manifest.
    /// An unknown file name fails validation -- the client must be
    /// running content the manifest knows about.
    pub fn validate(&self, file: &str, checksum: u32) -> bool {
        self.entries.get(file).map_or(false, |&want| want == checksum)
    }
}

/// Server-wide session configuration set once at startup (CLI flags and
/// config file), mirroring the scalar `g_*` globals that aren't part of
/// any other subsystem's own state.
pub struct ServerConfig {
    pub map_name: String,
    pub system_index: usize,
    pub max_players: u32,
    pub time_limit_minutes: i32,
    pub frag_limit: i32,
    pub collision_damage: bool,
    pub friendly_fire: bool,
    pub no_checksum: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            map_name: "Multi1".to_string(),
            system_index: 1,
            max_players: 6,
            time_limit_minutes: 0,
            frag_limit: 0,
            collision_damage: true,
            friendly_fire: false,
            no_checksum: false,
        }
    }
}

/// Everything a tick needs: connections, loaded content, live projectiles,
/// master-server registration, session statistics, and match state.
pub struct ServerContext {
    pub config: ServerConfig,
    pub peers: PeerTable,
    pub registry: Registry,
    pub registry_loaded: bool,
    pub torpedoes: TorpedoManager,
    pub manifest: ChecksumManifest,
    pub manifest_loaded: bool,
    pub masters: MasterList,
    pub stats: SessionStats,
    pub game_time: f32,
    pub game_ended: bool,
}

impl ServerContext {
    pub fn new(config: ServerConfig, game_port: u16, start_time_ms: u32) -> Self {
        ServerContext {
            config,
            peers: PeerTable::new(),
            registry: Registry::default(),
            registry_loaded: false,
            torpedoes: TorpedoManager::new(),
            manifest: ChecksumManifest::new(),
            manifest_loaded: false,
            masters: MasterList::new(game_port),
            stats: SessionStats::new(start_time_ms),
            game_time: 0.0,
            game_ended: false,
        }
    }

    /// Loads the ship/projectile registry from a parsed JSON manifest,
    /// marking it loaded on success. Mirrors the source's
    /// `g_registry_loaded` gate -- combat and spawning are skipped
    /// entirely whenever this is `false`. `path` is only used for the
    /// error message; actual file I/O is the caller's job.
    pub fn load_registry(&mut self, path: &str, json: &str) -> Result<(), StartupError> {
        let registry: Registry = serde_json::from_str(json).map_err(|e| StartupError::RegistryLoad {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        self.registry = registry;
        self.registry_loaded = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_stock_dedicated_server_settings() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.max_players, 6);
        assert!(!cfg.no_checksum);
        assert!(cfg.collision_damage);
    }

    #[test]
    fn manifest_rejects_unknown_file_and_mismatched_checksum() {
        let mut manifest = ChecksumManifest::new();
        manifest.entries.insert("mission.py".to_string(), 0xDEADBEEF);
        assert!(manifest.validate("mission.py", 0xDEADBEEF));
        assert!(!manifest.validate("mission.py", 0x1));
        assert!(!manifest.validate("other.py", 0xDEADBEEF));
    }

    #[test]
    fn fresh_context_starts_with_registry_unloaded() {
        let ctx = ServerContext::new(ServerConfig::default(), 0x5655, 0);
        assert!(!ctx.registry_loaded);
        assert!(!ctx.manifest_loaded);
        assert_eq!(ctx.peers.count(), 0);
    }
}
