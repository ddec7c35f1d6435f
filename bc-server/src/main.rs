//! Dedicated server CLI: parses arguments, loads the ship/projectile
//! registry (and, unless disabled, a checksum manifest), wires up a
//! ctrl-c shutdown flag, and hands everything to `bc_core::server::run`.

use std::fs;
use std::net::ToSocketAddrs;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;

use bc_core::clock::SystemClock;
use bc_core::context::{ServerConfig, ServerContext};
use bc_core::error::StartupError;
use bc_core::server::Sockets;

#[derive(Parser, Debug)]
#[command(name = "bcommander-dedi", about = "Dedicated server for the space-combat multiplayer protocol")]
struct Cli {
    /// UDP port the game socket binds to.
    #[arg(long, default_value_t = 22101)]
    port: u16,

    /// UDP port the GameSpy-style discovery socket binds to. Omit to answer
    /// discovery queries on the game socket only.
    #[arg(long)]
    discovery_port: Option<u16>,

    /// Path to the ship/projectile registry JSON file.
    #[arg(long)]
    registry: String,

    /// Path to a checksum manifest JSON file (`{"entries": {"file": checksum}}`).
    /// Omit together with `--no-checksum` to accept any client checksum.
    #[arg(long)]
    manifest: Option<String>,

    /// Skip checksum validation entirely -- every CHECKSUM_RESP is accepted.
    #[arg(long)]
    no_checksum: bool,

    /// Master servers to register with, `host:port`. May be repeated.
    #[arg(long = "master")]
    masters: Vec<String>,

    /// Mission script / map name advertised to clients and to discovery.
    #[arg(long, default_value = "Multi1")]
    map_name: String,

    /// Star-system index, 1-9 (see `bc_core::ship::SYSTEM_TABLE`).
    #[arg(long, default_value_t = 1)]
    system_index: usize,

    #[arg(long, default_value_t = 6)]
    max_players: u32,

    /// Minutes until the match ends on time; 0 disables the time limit.
    #[arg(long, default_value_t = 0)]
    time_limit: i32,

    /// Frags needed to end the match; 0 disables the frag limit.
    #[arg(long, default_value_t = 0)]
    frag_limit: i32,

    #[arg(long, default_value_t = true)]
    collision_damage: bool,

    #[arg(long)]
    friendly_fire: bool,
}

fn main() -> ExitCode {
    env_logger::init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), StartupError> {
    let registry_json = fs::read_to_string(&cli.registry).map_err(|e| StartupError::RegistryLoad {
        path: cli.registry.clone(),
        reason: e.to_string(),
    })?;

    let clock = SystemClock::new();
    let config = ServerConfig {
        map_name: cli.map_name,
        system_index: cli.system_index,
        max_players: cli.max_players,
        time_limit_minutes: cli.time_limit,
        frag_limit: cli.frag_limit,
        collision_damage: cli.collision_damage,
        friendly_fire: cli.friendly_fire,
        no_checksum: cli.no_checksum,
    };

    let mut ctx = ServerContext::new(config, cli.port, clock.now_ms());
    ctx.load_registry(&cli.registry, &registry_json)?;

    if !cli.no_checksum {
        if let Some(path) = &cli.manifest {
            let manifest_json = fs::read_to_string(path).map_err(|e| StartupError::ManifestLoad {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            let manifest = serde_json::from_str(&manifest_json).map_err(|e| StartupError::ManifestLoad {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            ctx.manifest = manifest;
            ctx.manifest_loaded = true;
        }
    }

    for master in &cli.masters {
        let addr = master
            .to_socket_addrs()
            .ok()
            .and_then(|mut it| it.next())
            .ok_or_else(|| StartupError::Config(format!("invalid master server address: {}", master)))?;
        ctx.masters.add(master, addr);
    }

    let sockets = Sockets::bind(cli.port, cli.discovery_port)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|e| StartupError::Config(format!("failed to install ctrl-c handler: {}", e)))?;

    log::info!(
        "dedicated server listening on {} (map {}, {} max players)",
        cli.port,
        ctx.config.map_name,
        ctx.config.max_players
    );

    bc_core::server::run(&mut ctx, &sockets, &clock, &shutdown).map_err(|e| StartupError::Config(e.to_string()))
}
