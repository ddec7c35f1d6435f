//! The event loop: a single-threaded, non-blocking poll that owns the
//! game and discovery sockets, drains datagrams, and drives the
//! fixed-order tick sub-phases. Everything this module calls (codec,
//! cipher, transport, handshake, dispatch, discovery, master, tick) is
//! pure and I/O-free; this is the one place `bc-core` actually touches
//! sockets. `bc-server::main` calls straight into [`run`].

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::clock::Clock;
use crate::codec::Cursor;
use crate::combat::{self, DamageKind};
use crate::context::ServerContext;
use crate::discovery::{self, ServerInfo};
use crate::dispatch::{self, RelayMode};
use crate::error::StartupError;
use crate::handshake::{self, HandshakeAction};
use crate::messages;
use crate::opcodes::{self, GameOp};
use crate::peer::PeerState;
use crate::tick::{self, TickScheduler};
use crate::transport::{self, Batcher, RELIABLE_FLAG_FRAGMENT, RELIABLE_FLAG_WIRE};

const RETRANSMIT_SWEEP_TICKS: u32 = 10;
const KEEPALIVE_TICKS: u32 = 10;
const LOOP_SLEEP: Duration = Duration::from_millis(1);
const RECV_BUF_LEN: usize = 2048;

/// Owns the two non-blocking UDP sockets the loop polls each iteration.
/// The discovery socket is optional -- the protocol also accepts queries
/// on the game socket when no dedicated port is bound.
pub struct Sockets {
    pub game: UdpSocket,
    pub discovery: Option<UdpSocket>,
}

impl Sockets {
    pub fn bind(game_port: u16, discovery_port: Option<u16>) -> Result<Sockets, StartupError> {
        let game = UdpSocket::bind(("0.0.0.0", game_port))
            .map_err(|source| StartupError::BindGameSocket { port: game_port, source })?;
        game.set_nonblocking(true).map_err(StartupError::NonBlocking)?;

        let discovery = match discovery_port {
            Some(port) => {
                let sock = UdpSocket::bind(("0.0.0.0", port))
                    .map_err(|source| StartupError::BindDiscoverySocket { port, source })?;
                sock.set_nonblocking(true).map_err(StartupError::NonBlocking)?;
                Some(sock)
            }
            None => None,
        };

        Ok(Sockets { game, discovery })
    }
}

/// Runs the event loop until `shutdown` is set. Never returns an error
/// under normal operation -- only OS-level socket failures (other than
/// the expected `WouldBlock`) propagate.
pub fn run(ctx: &mut ServerContext, sockets: &Sockets, clock: &dyn Clock, shutdown: &AtomicBool) -> std::io::Result<()> {
    let mut scheduler = TickScheduler::new();
    let mut last_now = clock.now_ms();
    let mut tick_count: u32 = 0;
    let mut last_player_count = ctx.peers.count();

    probe_masters(ctx, clock.now_ms());

    while !shutdown.load(Ordering::Relaxed) {
        let now = clock.now_ms();
        drain_socket(ctx, &sockets.game, sockets, now)?;
        if let Some(disc) = &sockets.discovery {
            drain_socket(ctx, disc, sockets, now)?;
        }

        let elapsed = now.wrapping_sub(last_now);
        last_now = now;
        let due = scheduler.advance(elapsed);

        if due.sim {
            tick_count = tick_count.wrapping_add(1);

            if tick_count % RETRANSMIT_SWEEP_TICKS == 0 {
                run_retransmit_sweep(ctx, &sockets.game, now);
            }
            reap_timeouts(ctx, &sockets.game, now);
            run_master_heartbeat(ctx, &sockets.game, now);

            let hits = tick::run_sim_tick(ctx, 0.1);
            resolve_torpedo_hits(ctx, &sockets.game, hits, now);
            reap_respawns(ctx, now);

            if due.health_broadcast {
                broadcast_health_round_robin(ctx, &sockets.game, now);
            }
            if tick_count % KEEPALIVE_TICKS == 0 {
                emit_keepalives(ctx, &sockets.game, now);
            }

            let player_count = ctx.peers.count();
            if player_count != last_player_count {
                last_player_count = player_count;
                // Hook point: an out-of-band status-changed heartbeat per
                // master is sent the same way `run_master_heartbeat` sends
                // its periodic ones; omitted here since masters re-poll on
                // their own `\status\` cadence regardless.
            }

            flush_all_outboxes(ctx, &sockets.game);
        }

        std::thread::sleep(LOOP_SLEEP);
    }

    shutdown_sequence(ctx, sockets, clock.now_ms());
    Ok(())
}

fn drain_socket(ctx: &mut ServerContext, sock: &UdpSocket, sockets: &Sockets, now: u32) -> std::io::Result<()> {
    let mut buf = [0u8; RECV_BUF_LEN];
    loop {
        match sock.recv_from(&mut buf) {
            Ok((len, addr)) => {
                let data = &buf[..len];
                if discovery::is_query(data) {
                    handle_discovery(ctx, sock, addr, data);
                } else {
                    handle_game_datagram(ctx, sockets, addr, data, now);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

fn handle_discovery(ctx: &mut ServerContext, sock: &UdpSocket, addr: SocketAddr, data: &[u8]) {
    ctx.stats.gamespy_queries += 1;

    if discovery::is_secure(data) {
        if let Some(challenge) = discovery::extract_secure(data) {
            if let Some(hostname) = ctx.masters.mark_verified(&addr) {
                log::info!("listed by {}", hostname);
            }
            let resp = discovery::build_validate(challenge);
            let _ = sock.send_to(resp.as_bytes(), addr);
        }
        return;
    }

    if ctx.masters.is_from_master(&addr) {
        if let Some(hostname) = ctx.masters.record_status_check(&addr) {
            log::info!("listed by {}", hostname);
        }
    }

    let (system_name, _) = crate::ship::SYSTEM_TABLE[ctx.config.system_index.min(9)];
    let names: Vec<String> = ctx
        .peers
        .iter_connected()
        .filter(|(_, p)| p.state == PeerState::InGame || p.state == PeerState::Lobby)
        .map(|(_, p)| p.name.clone())
        .collect();
    let name_refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();

    let info = ServerInfo {
        hostname: &ctx.config.map_name,
        missionscript: &ctx.config.map_name,
        mapname: &ctx.config.map_name,
        gamemode: "openplaying",
        system: system_name,
        numplayers: ctx.peers.count(),
        maxplayers: ctx.config.max_players as usize,
        timelimit: ctx.config.time_limit_minutes,
        fraglimit: ctx.config.frag_limit,
    };
    let resp = discovery::build_response(&info, Some(data), &name_refs);
    let _ = sock.send_to(resp.as_bytes(), addr);
}

fn handle_game_datagram(ctx: &mut ServerContext, sockets: &Sockets, addr: SocketAddr, data: &[u8], now: u32) {
    let mut buf = data.to_vec();
    crate::cipher::decrypt(&mut buf);

    let packet = match transport::parse(&buf) {
        Some(p) => p,
        None => {
            log::debug!("malformed datagram from {}", addr);
            return;
        }
    };

    let slot = ctx.peers.find(&addr);
    if let Some(s) = slot {
        if let Some(peer) = ctx.peers.get_mut(s) {
            peer.last_recv_time = now;
        }
    }
    let mut deferred_teardown: Option<usize> = None;

    for msg in &packet.msgs {
        match msg.msg_type {
            t if t == opcodes::TRANSPORT_ACK => {
                if let Some(s) = slot {
                    if let Some(peer) = ctx.peers.get_mut(s) {
                        peer.reliable_out.ack(msg.seq);
                    }
                }
            }
            t if t == opcodes::TRANSPORT_RELIABLE || is_plain_transport(t) => {
                dispatch_transport_message(ctx, sockets, addr, slot, t, msg, now, &mut deferred_teardown);
            }
            _ => {
                ctx.stats.record_rejected(msg.msg_type);
            }
        }
    }

    if let Some(s) = deferred_teardown {
        teardown_peer(ctx, sockets, s);
    }
}

fn is_plain_transport(t: u8) -> bool {
    t == opcodes::TRANSPORT_KEEPALIVE
        || t == opcodes::TRANSPORT_CONNECT
        || t == opcodes::TRANSPORT_CONNECT_DATA
        || t == opcodes::TRANSPORT_CONNECT_ACK
        || t == opcodes::TRANSPORT_DISCONNECT
}

fn dispatch_transport_message(
    ctx: &mut ServerContext,
    sockets: &Sockets,
    addr: SocketAddr,
    slot: Option<usize>,
    msg_type: u8,
    msg: &transport::TransportMsg<'_>,
    now: u32,
    deferred_teardown: &mut Option<usize>,
) {
    match msg_type {
        t if t == opcodes::TRANSPORT_CONNECT => {
            if slot.is_none() {
                handle_connect(ctx, sockets, addr, now);
            }
        }
        t if t == opcodes::TRANSPORT_CONNECT_DATA => {
            // Stale retry once a slot already exists: ignored.
        }
        t if t == opcodes::TRANSPORT_CONNECT_ACK => {
            if let Some(s) = slot {
                // The ACK is queued for the outgoing datagram before
                // teardown runs, so it rides along with whatever else
                // this datagram produced.
                queue_ack(ctx, s, msg.seq);
                *deferred_teardown = Some(s);
            }
        }
        t if t == opcodes::TRANSPORT_DISCONNECT => {
            if let Some(s) = slot {
                *deferred_teardown = Some(s);
            }
        }
        t if t == opcodes::TRANSPORT_KEEPALIVE => {
            if let Some(s) = slot {
                handle_keepalive(ctx, s, msg.payload, now);
            }
        }
        t if t == opcodes::TRANSPORT_RELIABLE => {
            if msg.flags & RELIABLE_FLAG_WIRE != 0 {
                if let Some(s) = slot {
                    queue_ack(ctx, s, msg.seq);
                }
            }
            let payload = if msg.flags & RELIABLE_FLAG_FRAGMENT != 0 {
                let s = match slot {
                    Some(s) => s,
                    None => return,
                };
                match ctx.peers.get_mut(s).and_then(|p| p.fragment.push(msg.payload)) {
                    Some(full) => full,
                    None => return,
                }
            } else {
                msg.payload.to_vec()
            };
            handle_game_payload(ctx, sockets, addr, slot, &payload, now);
        }
        _ => {}
    }
}

fn handle_connect(ctx: &mut ServerContext, sockets: &Sockets, addr: SocketAddr, now: u32) {
    let action = handshake::handle_connect(&mut ctx.peers, addr, now);
    match action {
        HandshakeAction::SendConnectAndChecksumReq { slot } => {
            let mut out = [0u8; 64];
            if let Some(b) = Batcher::new(&mut out, transport::DIR_INIT) {
                let mut b = b;
                let wire_slot = (slot as u8 + 1).to_le_bytes();
                b.push_message(opcodes::TRANSPORT_CONNECT, &wire_slot);
                let req = build_checksum_req(0);
                let seq = next_seq(ctx, slot);
                b.push_reliable(&req, seq, RELIABLE_FLAG_WIRE);
                let len = b.finish();
                let _ = sockets.game.send_to(encrypted(&out[..len]).as_slice(), addr);
            }
            ctx.stats.total_connections += 1;
        }
        HandshakeAction::SendBoot { addr, slot, reason } => {
            send_boot(ctx, sockets, addr, slot, reason);
        }
        _ => {}
    }
}

fn build_checksum_req(round: u8) -> Vec<u8> {
    vec![GameOp::ChecksumReq.to_byte(), round]
}

fn send_boot(ctx: &mut ServerContext, sockets: &Sockets, addr: SocketAddr, slot: Option<usize>, reason: handshake::BootReason) {
    let mut payload = [0u8; 8];
    let len = messages::build_boot_player(&mut payload, reason).unwrap_or(0);
    if let Some(s) = slot {
        let seq = next_seq(ctx, s);
        let mut out = [0u8; 64];
        if let Some(n) = transport::build_reliable(&mut out, wire_direction(s), &payload[..len], seq, RELIABLE_FLAG_WIRE) {
            let _ = sockets.game.send_to(encrypted(&out[..n]).as_slice(), addr);
        }
        ctx.stats.boots_checksum += 1;
    } else {
        let mut out = [0u8; 64];
        if let Some(n) = transport::build_message(&mut out, transport::DIR_INIT, GameOp::BootPlayer.to_byte(), &payload[..len]) {
            let _ = sockets.game.send_to(encrypted(&out[..n]).as_slice(), addr);
        }
        ctx.stats.boots_full += 1;
    }
}

fn wire_direction(_slot: usize) -> u8 {
    transport::DIR_SERVER
}

fn next_seq(ctx: &mut ServerContext, slot: usize) -> u16 {
    match ctx.peers.get_mut(slot) {
        Some(p) => {
            let seq = p.reliable_seq_out;
            p.reliable_seq_out = p.reliable_seq_out.wrapping_add(1);
            seq
        }
        None => 0,
    }
}

fn encrypted(data: &[u8]) -> Vec<u8> {
    let mut v = data.to_vec();
    crate::cipher::encrypt(&mut v);
    v
}

/// Appends one raw, unframed transport message to `slot`'s outbox and bumps
/// its pending message count. No-op if the body doesn't fit a `u8` length.
fn queue_raw_message(ctx: &mut ServerContext, slot: usize, msg_type: u8, payload: &[u8]) {
    let body_len = 2 + payload.len();
    if body_len > 255 {
        return;
    }
    if let Some(peer) = ctx.peers.get_mut(slot) {
        peer.outbox.push(msg_type);
        peer.outbox.push(body_len as u8);
        peer.outbox.extend_from_slice(payload);
        peer.outbox_count = peer.outbox_count.saturating_add(1);
    }
}

fn queue_raw_ack(ctx: &mut ServerContext, slot: usize, seq: u16, flags: u8) {
    if let Some(peer) = ctx.peers.get_mut(slot) {
        peer.outbox.push(transport::MSG_ACK);
        peer.outbox.push(seq as u8);
        peer.outbox.push(0x00);
        peer.outbox.push(flags);
        peer.outbox_count = peer.outbox_count.saturating_add(1);
    }
}

fn queue_raw_reliable(ctx: &mut ServerContext, slot: usize, payload: &[u8], seq: u16, flags: u8) {
    let body_len = 5 + payload.len();
    if body_len > 255 {
        return;
    }
    if let Some(peer) = ctx.peers.get_mut(slot) {
        peer.outbox.push(transport::MSG_RELIABLE);
        peer.outbox.push(body_len as u8);
        peer.outbox.push(flags);
        peer.outbox.push((seq >> 8) as u8);
        peer.outbox.push((seq & 0xFF) as u8);
        peer.outbox.extend_from_slice(payload);
        peer.outbox_count = peer.outbox_count.saturating_add(1);
    }
}

/// Queues a reliable game message for `slot`: records it in the
/// retransmit queue (which needs a fully-framed standalone packet, since a
/// retransmit is sent directly without going through the outbox) and
/// queues the bare message for the next coalesced flush.
fn send_reliable(ctx: &mut ServerContext, slot: usize, payload: &[u8]) {
    let seq = next_seq(ctx, slot);
    let mut framed = [0u8; 512];
    if let Some(n) = transport::build_reliable(&mut framed, transport::DIR_SERVER, payload, seq, RELIABLE_FLAG_WIRE) {
        if let Some(peer) = ctx.peers.get_mut(slot) {
            peer.reliable_out.add(&framed[..n], seq, 0);
        }
    }
    queue_raw_reliable(ctx, slot, payload, seq, RELIABLE_FLAG_WIRE);
}

fn queue_ack(ctx: &mut ServerContext, slot: usize, seq: u16) {
    queue_raw_ack(ctx, slot, seq, 0);
}

fn handle_keepalive(ctx: &mut ServerContext, slot: usize, payload: &[u8], now: u32) {
    let first_time = ctx.peers.get(slot).map_or(true, |p| p.name.is_empty());
    if first_time && payload.len() > 8 {
        let name_bytes = &payload[8..];
        let name = utf16le_to_string(name_bytes);
        if let Some(peer) = ctx.peers.get_mut(slot) {
            peer.name = name.clone();
        }
        ctx.stats.record_connect(&name, now, ctx.peers.count() as u32);
    } else if let Some(peer) = ctx.peers.get_mut(slot) {
        peer.keepalive_payload = payload.to_vec();
    }
}

fn utf16le_to_string(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

fn handle_game_payload(ctx: &mut ServerContext, sockets: &Sockets, addr: SocketAddr, slot: Option<usize>, payload: &[u8], now: u32) {
    let slot = match slot {
        Some(s) => s,
        None => return,
    };
    if payload.is_empty() {
        return;
    }
    let op = GameOp::from_byte(payload[0]);
    ctx.stats.record_recv(payload[0]);

    if op == GameOp::ChecksumResp {
        handle_checksum_resp(ctx, sockets, slot, addr, payload);
        return;
    }
    if op == GameOp::NewPlayerInGame {
        handle_new_player_in_game(ctx, slot);
        return;
    }

    let peer_state = match ctx.peers.get(slot) {
        Some(p) => p.state,
        None => return,
    };
    let mode = dispatch::classify(op, peer_state);
    match mode {
        RelayMode::Reject => {
            ctx.stats.record_rejected(payload[0]);
        }
        RelayMode::Handled => {
            // HostMsg / RequestObj: server-only informational opcodes with
            // no broadcast effect in this core.
        }
        RelayMode::ToOthersReliable | RelayMode::ToOthersUnreliable => {
            if op == GameOp::StateUpdate {
                handle_state_update(ctx, slot, payload);
            }
            if op == GameOp::ObjCreateTeam {
                handle_obj_create_team(ctx, slot, payload);
            }
            // Validated relay / server-authoritative override: these three
            // inspect and may compute damage for themselves before the
            // generic relay below forwards the same bytes on for display.
            // A `false` verdict means an invariant was violated -- the
            // message is dropped rather than relayed.
            let allow_relay = match op {
                GameOp::BeamFire => handle_beam_fire(ctx, sockets, slot, payload, now),
                GameOp::TorpedoFire => handle_torpedo_fire(ctx, sockets, slot, payload, now),
                GameOp::CollisionEffect => handle_collision_effect(ctx, sockets, slot, payload, now),
                _ => true,
            };
            if allow_relay {
                relay_to_others(ctx, slot, payload, mode == RelayMode::ToOthersReliable);
            }
        }
    }
}

fn handle_state_update(ctx: &mut ServerContext, slot: usize, payload: &[u8]) {
    if payload.len() < 6 {
        return;
    }
    let dirty_flags = payload[5];
    if dispatch::is_forged_health_update(dirty_flags) {
        return;
    }
    // Client-authoritative fields only: position/orientation/speed. Parse
    // is best-effort; a short/garbled tail is silently ignored, matching
    // the "partial failure discards the bad message" rule for an
    // already-accepted opcode.
    let mut body = payload[6..].to_vec();
    let mut cur = Cursor::new(&mut body);
    let mut pos = crate::math::Vec3::ZERO;
    let mut fwd = crate::math::Vec3::ZERO;
    let mut up = crate::math::Vec3::ZERO;
    let mut speed = 0.0f32;
    if dirty_flags & opcodes::dirty::POSITION_ABS != 0 {
        if let (Some(x), Some(y), Some(z)) = (cur.read_f32(), cur.read_f32(), cur.read_f32()) {
            pos = crate::math::Vec3::new(x, y, z);
            let _ = cur.read_bit();
        }
    }
    if dirty_flags & opcodes::dirty::ORIENT_FWD != 0 {
        if let Some((x, y, z)) = cur.read_cv3() {
            fwd = crate::math::Vec3::new(x, y, z);
        }
    }
    if dirty_flags & opcodes::dirty::ORIENT_UP != 0 {
        if let Some((x, y, z)) = cur.read_cv3() {
            up = crate::math::Vec3::new(x, y, z);
        }
    }
    if dirty_flags & opcodes::dirty::SPEED != 0 {
        speed = cur.read_cf16().unwrap_or(0.0);
    }
    if let Some(peer) = ctx.peers.get_mut(slot) {
        if peer.has_ship {
            dispatch::apply_tracked_state(&mut peer.ship, dirty_flags, pos, fwd, up, speed);
        }
    }
}

/// Initializes the server's authoritative [`crate::ship::ShipState`] for a
/// peer's first `ObjCreateTeam`, per the data model's "initialized on
/// client-originated ObjCreateTeam by copying class defaults". The blob is
/// also cached verbatim so late joiners and respawns can replay it.
fn handle_obj_create_team(ctx: &mut ServerContext, slot: usize, payload: &[u8]) {
    let (owner, team, species_id) = match messages::parse_obj_create_team(payload) {
        Some(t) => t,
        None => return,
    };
    let class_index = match ctx.registry.find_ship_index(species_id) {
        Some(i) => i,
        None => return,
    };
    let cls = match ctx.registry.get_ship(class_index) {
        Some(c) => c.clone(),
        None => return,
    };
    let game_slot = slot.saturating_sub(1) as u8;
    let object_id = crate::object_id::make_ship_id(game_slot);

    if let Some(peer) = ctx.peers.get_mut(slot) {
        peer.ship = crate::ship::ShipState::spawn(&cls, class_index, object_id, owner, team);
        peer.class_index = Some(class_index);
        peer.has_ship = true;
        peer.respawn_at = None;
        peer.spawn_payload = payload.to_vec();
    }
}

/// Recreates a destroyed ship once its respawn timer has elapsed, reusing
/// the class, object id, owner slot and team recorded on the ship that died,
/// and replays the cached spawn payload so every other peer's UI sees the
/// respawn the same way it would see any other spawn.
fn reap_respawns(ctx: &mut ServerContext, now: u32) {
    let due: Vec<usize> = ctx
        .peers
        .iter_connected()
        .filter(|(_, p)| p.respawn_at.map_or(false, |t| now.wrapping_sub(t) < (1u32 << 31)))
        .map(|(s, _)| s)
        .collect();

    for slot in due {
        let class_index = match ctx.peers.get(slot).and_then(|p| p.class_index) {
            Some(i) => i,
            None => continue,
        };
        let cls = match ctx.registry.get_ship(class_index) {
            Some(c) => c.clone(),
            None => continue,
        };
        let spawn_payload = if let Some(peer) = ctx.peers.get_mut(slot) {
            let (object_id, owner, team) = (peer.ship.object_id, peer.ship.owner_slot, peer.ship.team_id);
            peer.ship = crate::ship::ShipState::spawn(&cls, class_index, object_id, owner, team);
            peer.has_ship = true;
            peer.respawn_at = None;
            peer.spawn_payload.clone()
        } else {
            continue;
        };
        if !spawn_payload.is_empty() {
            broadcast_reliable(ctx, &spawn_payload);
        }
    }
}

const MAX_FIRE_VIOLATIONS: u8 = 5;
const VIOLATION_WINDOW_MS: u32 = 10_000;
const MAX_COLLISION_DISTANCE: f32 = 2000.0;
/// Blast radius passed to `combat::apply_damage` for collisions -- large
/// enough that the AABB pass always overlaps the whole ship, matching the
/// original's hardcoded `6000.0f` at every `bc_combat_apply_damage` call
/// for ship-vs-ship and ship-vs-environment impacts.
const COLLISION_DAMAGE_RADIUS: f32 = 6000.0;

/// Anti-cheat bookkeeping for a validated-relay rejection: violations
/// accumulate within a rolling window, and a peer crossing the threshold
/// is booted outright rather than just having the one message dropped.
fn record_violation(ctx: &mut ServerContext, sockets: &Sockets, slot: usize, opcode: u8, now: u32) {
    ctx.stats.record_rejected(opcode);
    let should_boot = match ctx.peers.get_mut(slot) {
        Some(peer) => {
            if now.wrapping_sub(peer.violation_window_start) > VIOLATION_WINDOW_MS {
                peer.violation_window_start = now;
                peer.fire_violations = 1;
            } else {
                peer.fire_violations = peer.fire_violations.saturating_add(1);
            }
            peer.fire_violations >= MAX_FIRE_VIOLATIONS
        }
        None => false,
    };
    if should_boot {
        if let Some(addr) = ctx.peers.get(slot).and_then(|p| p.addr) {
            send_boot(ctx, sockets, addr, Some(slot), handshake::BootReason::AntiCheatViolation);
        }
        teardown_peer(ctx, sockets, slot);
    }
}

/// Coarse per-bank fire-rate gate using the peer's own last-fire clock,
/// ahead of and independent from the charge economy
/// [`combat::can_fire_phaser`] enforces.
fn check_phaser_rate(ctx: &mut ServerContext, slot: usize, bank: usize, now: u32) -> bool {
    const MIN_INTERVAL_MS: u32 = 150;
    match ctx.peers.get_mut(slot).and_then(|p| p.last_fire_time.get_mut(bank)) {
        Some(last) => {
            let fresh = *last == 0 || now.wrapping_sub(*last) >= MIN_INTERVAL_MS;
            if fresh {
                *last = now;
            }
            fresh
        }
        None => false,
    }
}

fn check_torpedo_rate(ctx: &mut ServerContext, slot: usize, tube: usize, now: u32) -> bool {
    const MIN_INTERVAL_MS: u32 = 500;
    match ctx.peers.get_mut(slot).and_then(|p| p.last_torpedo_time.get_mut(tube)) {
        Some(last) => {
            let fresh = *last == 0 || now.wrapping_sub(*last) >= MIN_INTERVAL_MS;
            if fresh {
                *last = now;
            }
            fresh
        }
        None => false,
    }
}

/// Validated relay and, when a target is reported, server-authoritative
/// override for BeamFire (0x1A): the shooter must own the ship it claims
/// and clear the bank's charge/cloak gate before the discharge is
/// accepted at all; a reported target's damage is then computed here
/// from the firing subsystem's own definition rather than trusted from
/// the wire, per the seed "authoritative beam kill" case. Returns whether
/// the message should still be relayed to other peers for display.
fn handle_beam_fire(ctx: &mut ServerContext, sockets: &Sockets, slot: usize, payload: &[u8], now: u32) -> bool {
    let fire = match messages::parse_beam_fire(payload) {
        Some(f) => f,
        None => return false,
    };
    let ship_object_id = match ctx.peers.get(slot) {
        Some(p) if p.has_ship => p.ship.object_id,
        _ => return false,
    };
    if fire.shooter_id != ship_object_id {
        record_violation(ctx, sockets, slot, GameOp::BeamFire.to_byte(), now);
        return false;
    }
    if !check_phaser_rate(ctx, slot, fire.bank, now) {
        record_violation(ctx, sockets, slot, GameOp::BeamFire.to_byte(), now);
        return false;
    }

    let class_index = match ctx.peers.get(slot).and_then(|p| p.class_index) {
        Some(i) => i,
        None => return false,
    };
    let cls = match ctx.registry.get_ship(class_index) {
        Some(c) => c.clone(),
        None => return false,
    };
    let fired = match ctx.peers.get_mut(slot) {
        Some(peer) => combat::fire_phaser(&mut peer.ship, &cls, fire.bank),
        None => None,
    };
    if fired.is_none() {
        // Cloaked, unknown bank, or undercharged -- this is the invariant
        // violation the validated-relay category exists to catch.
        record_violation(ctx, sockets, slot, GameOp::BeamFire.to_byte(), now);
        return false;
    }

    if let Some(target_id) = fire.target_id {
        let target_slot = ctx
            .peers
            .iter_connected()
            .find(|(_, p)| p.has_ship && p.ship.object_id == target_id)
            .map(|(s, _)| s);
        if let Some(target_slot) = target_slot {
            if let Some(damage) = cls.subsystems.get(fire.bank).map(|d| d.max_damage) {
                if damage > 0.0 {
                    let dir = crate::math::Vec3::new(fire.dir.0, fire.dir.1, fire.dir.2);
                    // Phasers are a pure directed hit with no blast radius --
                    // the original passes damage_radius=0.0, which skips the
                    // subsystem AABB pass entirely.
                    apply_authoritative_damage(ctx, &sockets.game, slot, target_slot, damage, DamageKind::Directed(dir), 0.0, now);
                }
            }
        }
    }
    true
}

/// Validated relay for TorpedoFire (0x19): ownership, fire rate, and
/// [`combat::fire_torpedo`]'s own cooldown/cloak/tube gate must all pass
/// before a live [`crate::torpedo::Torpedo`] is spawned from the firing
/// ship's projectile definition.
fn handle_torpedo_fire(ctx: &mut ServerContext, sockets: &Sockets, slot: usize, payload: &[u8], now: u32) -> bool {
    let fire = match messages::parse_torpedo_fire(payload) {
        Some(f) => f,
        None => return false,
    };
    let (ship_object_id, pos, torpedo_type) = match ctx.peers.get(slot) {
        Some(p) if p.has_ship => (p.ship.object_id, p.ship.pos, p.ship.torpedo_type),
        _ => return false,
    };
    if fire.shooter_id != ship_object_id {
        record_violation(ctx, sockets, slot, GameOp::TorpedoFire.to_byte(), now);
        return false;
    }
    if !check_torpedo_rate(ctx, slot, fire.tube, now) {
        record_violation(ctx, sockets, slot, GameOp::TorpedoFire.to_byte(), now);
        return false;
    }

    let class_index = match ctx.peers.get(slot).and_then(|p| p.class_index) {
        Some(i) => i,
        None => return false,
    };
    let cls = match ctx.registry.get_ship(class_index) {
        Some(c) => c.clone(),
        None => return false,
    };
    // The tube's reload delay lives on the torpedo-bank subsystem entry
    // reserved for it; `fire_torpedo` only tracks the cooldown timer
    // itself and needs this value handed in.
    let reload_delay = match cls.subsystems.get(opcodes::subsys::TORPEDO_1 + fire.tube) {
        Some(def) => def.reload_delay,
        None => {
            record_violation(ctx, sockets, slot, GameOp::TorpedoFire.to_byte(), now);
            return false;
        }
    };
    let fired = match ctx.peers.get_mut(slot) {
        Some(peer) => combat::fire_torpedo(&mut peer.ship, &cls, fire.tube, reload_delay),
        None => false,
    };
    if !fired {
        record_violation(ctx, sockets, slot, GameOp::TorpedoFire.to_byte(), now);
        return false;
    }

    if let Some(proj) = ctx.registry.get_projectile(torpedo_type).cloned() {
        let vel = crate::math::Vec3::new(fire.vel.0, fire.vel.1, fire.vel.2).normalize();
        let torpedo = crate::torpedo::Torpedo {
            shooter_id: ship_object_id,
            shooter_slot: slot,
            target_id: fire.target_id,
            pos,
            vel,
            speed: proj.launch_speed,
            damage: proj.damage,
            damage_radius: crate::ship::TORPEDO_HIT_RADIUS * proj.damage_radius_factor,
            lifetime: proj.lifetime,
            guidance_life: proj.guidance_lifetime,
            max_angular: proj.max_angular_accel,
        };
        ctx.torpedoes.spawn(torpedo);
    }
    true
}

/// Validated relay for CollisionEffect (0x15): the sender must be one of
/// the two participants, a report whose counterpart will self-report is
/// dropped to avoid double damage, implausibly distant reports are
/// rejected, and (when collision damage is enabled) the server applies
/// its own hull-capped damage to both ships -- credited to the other
/// ship, or to no one for an environmental collision (`object_id == 0`).
fn handle_collision_effect(ctx: &mut ServerContext, sockets: &Sockets, slot: usize, payload: &[u8], now: u32) -> bool {
    let collision = match messages::parse_collision_effect(payload) {
        Some(c) => c,
        None => return false,
    };
    let sender_object_id = match ctx.peers.get(slot) {
        Some(p) if p.has_ship => p.ship.object_id,
        _ => return false,
    };
    if collision.source_id != sender_object_id && collision.target_id != sender_object_id {
        record_violation(ctx, sockets, slot, GameOp::CollisionEffect.to_byte(), now);
        return false;
    }

    let source_slot = ctx
        .peers
        .iter_connected()
        .find(|(_, p)| p.has_ship && p.ship.object_id == collision.source_id)
        .map(|(s, _)| s);
    let target_slot = ctx
        .peers
        .iter_connected()
        .find(|(_, p)| p.has_ship && p.ship.object_id == collision.target_id)
        .map(|(s, _)| s);

    // The other participant reports its own collision too; if this sender
    // is the source and the target is another live player, skip this copy
    // so the pair isn't damaged twice.
    if collision.source_id == sender_object_id && target_slot.is_some() {
        return true;
    }
    if !ctx.config.collision_damage {
        return true;
    }

    let proximity_ok = match (source_slot, target_slot) {
        (Some(s), Some(t)) => {
            let sp = ctx.peers.get(s).map(|p| p.ship.pos);
            let tp = ctx.peers.get(t).map(|p| p.ship.pos);
            match (sp, tp) {
                (Some(sp), Some(tp)) => sp.dist(tp) <= MAX_COLLISION_DISTANCE,
                _ => true,
            }
        }
        _ => true,
    };
    if !proximity_ok {
        record_violation(ctx, sockets, slot, GameOp::CollisionEffect.to_byte(), now);
        return false;
    }

    let impact = crate::math::Vec3::new(collision.impact.0, collision.impact.1, collision.impact.2);
    let relative_speed = impact.len();
    let raw_damage = combat::collision_damage(relative_speed);
    let impact_dir = impact.normalize();

    if let Some(t) = target_slot {
        apply_collision_damage(ctx, sockets, t, source_slot, collision.source_id, raw_damage, impact_dir, now);
    }
    if let Some(s) = source_slot {
        apply_collision_damage(ctx, sockets, s, target_slot, collision.target_id, raw_damage, impact_dir.scale(-1.0), now);
    }
    true
}

/// Applies collision damage to one participant, clamped to half its
/// hull's maximum, crediting the kill to the other participant unless
/// that side is environmental geometry (`object_id == 0`).
fn apply_collision_damage(
    ctx: &mut ServerContext,
    sockets: &Sockets,
    victim_slot: usize,
    other_slot: Option<usize>,
    other_object_id: i32,
    raw_damage: f32,
    impact_dir: crate::math::Vec3,
    now: u32,
) {
    let class_index = match ctx.peers.get(victim_slot).and_then(|p| p.class_index) {
        Some(i) => i,
        None => return,
    };
    let hull_cap = match ctx.registry.get_ship(class_index) {
        Some(c) => c.hull_hp,
        None => return,
    };
    let damage = raw_damage.min(hull_cap * 0.5);
    if damage <= 0.0 {
        return;
    }
    let shooter_slot = if other_object_id == 0 { victim_slot } else { other_slot.unwrap_or(victim_slot) };
    // Collisions are area-effect with a blast radius large enough to cover
    // the whole ship, not a single-facing directed hit.
    apply_authoritative_damage(
        ctx,
        &sockets.game,
        shooter_slot,
        victim_slot,
        damage,
        DamageKind::AreaEffect(impact_dir),
        COLLISION_DAMAGE_RADIUS,
        now,
    );
}

fn relay_to_others(ctx: &mut ServerContext, from_slot: usize, payload: &[u8], reliable: bool) {
    let recipients: Vec<usize> = ctx
        .peers
        .iter_connected()
        .filter(|(s, p)| *s != from_slot && (p.state == PeerState::Lobby || p.state == PeerState::InGame))
        .map(|(s, _)| s)
        .collect();

    for s in recipients {
        if reliable {
            send_reliable(ctx, s, payload);
        } else {
            queue_raw_message(ctx, s, 0x00, payload);
        }
    }
}

fn handle_checksum_resp(ctx: &mut ServerContext, sockets: &Sockets, slot: usize, addr: SocketAddr, payload: &[u8]) {
    let validated = if ctx.manifest_loaded {
        // Well-formedness: a 32-bit checksum must follow the opcode and
        // round byte. The manifest keys by file name, which this core
        // doesn't have a wire channel for beyond the permissive path, so
        // a loaded manifest with no matching entries degrades to
        // permissive accept -- validation proper is exercised by
        // `ChecksumManifest::validate` directly in its own unit tests.
        payload.len() >= 6
    } else {
        payload.len() >= 2
    };

    let action = handshake::handle_checksum_response(&mut ctx.peers, slot, validated);
    match action {
        Some(HandshakeAction::SendChecksumReq { slot, round }) => {
            let req = build_checksum_req(round);
            send_reliable_now(ctx, sockets, slot, addr, &req);
        }
        Some(HandshakeAction::SendFinalChecksumReq { slot }) => {
            let req = build_checksum_req(handshake::FINAL_ROUND);
            send_reliable_now(ctx, sockets, slot, addr, &req);
        }
        Some(HandshakeAction::EnterLobby { slot }) => {
            send_lobby_sequence(ctx, sockets, slot, addr);
            handshake::enter_lobby(&mut ctx.peers, slot);
        }
        Some(HandshakeAction::SendBoot { addr, slot, reason }) => {
            send_boot(ctx, sockets, addr, slot, reason);
        }
        _ => {}
    }
}

fn send_reliable_now(ctx: &mut ServerContext, sockets: &Sockets, slot: usize, addr: SocketAddr, payload: &[u8]) {
    let seq = next_seq(ctx, slot);
    let mut buf = [0u8; 64];
    if let Some(n) = transport::build_reliable(&mut buf, transport::DIR_SERVER, payload, seq, RELIABLE_FLAG_WIRE) {
        if let Some(peer) = ctx.peers.get_mut(slot) {
            peer.reliable_out.add(&buf[..n], seq, 0);
        }
        let _ = sockets.game.send_to(encrypted(&buf[..n]).as_slice(), addr);
    }
}

/// Sends the fixed, order-preserving lobby-entry sequence: the
/// `0x28` sentinel, Settings, GameInit, each already-in-game peer's
/// Score, each already-spawned ship's cached `ObjCreateTeam`, and a
/// `DeletePlayerUi` per other active peer -- batched into as few
/// datagrams as fit, flushed immediately.
fn send_lobby_sequence(ctx: &mut ServerContext, sockets: &Sockets, slot: usize, addr: SocketAddr) {
    let game_slot = slot.saturating_sub(1) as u8;
    let game_time = ctx.game_time;
    let collision_damage = ctx.config.collision_damage;
    let friendly_fire = ctx.config.friendly_fire;
    let mission_script = ctx.config.map_name.clone();

    let mut settings_buf = [0u8; 128];
    let settings_len =
        messages::build_settings(&mut settings_buf, game_time, collision_damage, friendly_fire, game_slot, &mission_script)
            .unwrap_or(0);
    let mut game_init_buf = [0u8; 16];
    let game_init_len = messages::build_game_init(&mut game_init_buf, game_time).unwrap_or(0);

    send_reliable_now(ctx, sockets, slot, addr, &[GameOp::Unknown28.to_byte()]);
    send_reliable_now(ctx, sockets, slot, addr, &settings_buf[..settings_len]);
    send_reliable_now(ctx, sockets, slot, addr, &game_init_buf[..game_init_len]);

    let others: Vec<(usize, i32, i32, i32, i32, Vec<u8>)> = ctx
        .peers
        .iter_connected()
        .filter(|(s, p)| *s != slot && (p.state == PeerState::Lobby || p.state == PeerState::InGame))
        .map(|(s, p)| (s, p.score, 0, 0, p.object_id, p.spawn_payload.clone()))
        .collect();

    for (other_slot, score, kills, deaths, object_id, spawn_payload) in others {
        let mut score_buf = [0u8; 32];
        if let Some(n) = messages::build_score(&mut score_buf, other_slot as i32, kills, deaths, score) {
            send_reliable_now(ctx, sockets, slot, addr, &score_buf[..n]);
        }
        if !spawn_payload.is_empty() {
            send_reliable_now(ctx, sockets, slot, addr, &spawn_payload);
        }
        let mut dpu_buf = [0u8; 8];
        if let Some(n) = messages::build_delete_player_ui(&mut dpu_buf, object_id) {
            send_reliable_now(ctx, sockets, slot, addr, &dpu_buf[..n]);
        }
    }
}

fn handle_new_player_in_game(ctx: &mut ServerContext, slot: usize) {
    if let Some(peer) = ctx.peers.get_mut(slot) {
        peer.state = PeerState::InGame;
    }
    let mut buf = [0u8; 16];
    if let Some(n) = messages::build_mission_init(&mut buf, ctx.config.system_index as u8, ctx.config.time_limit_minutes, ctx.config.frag_limit) {
        send_reliable(ctx, slot, &buf[..n]);
    }
}

fn teardown_peer(ctx: &mut ServerContext, sockets: &Sockets, slot: usize) {
    let object_id = ctx.peers.get(slot).map(|p| p.ship.object_id).unwrap_or(-1);

    let mut destroy = [0u8; 8];
    let destroy_len = messages::build_destroy_obj(&mut destroy, object_id).unwrap_or(0);
    let mut ui = [0u8; 8];
    let ui_len = messages::build_delete_player_ui(&mut ui, object_id).unwrap_or(0);
    let mut anim = [0u8; 8];
    let anim_len = messages::build_delete_player_anim(&mut anim, object_id).unwrap_or(0);

    let others: Vec<usize> = ctx.peers.iter_connected().filter(|(s, _)| *s != slot).map(|(s, _)| s).collect();
    for other in others {
        for payload in [&destroy[..destroy_len], &ui[..ui_len], &anim[..anim_len]] {
            if payload.is_empty() {
                continue;
            }
            send_reliable(ctx, other, payload);
        }
    }
    flush_all_outboxes(ctx, &sockets.game);

    handshake::complete_teardown(&mut ctx.peers, slot);
    ctx.stats.disconnects += 1;
}

fn run_retransmit_sweep(ctx: &mut ServerContext, sock: &UdpSocket, now: u32) {
    let slots: Vec<usize> = ctx.peers.iter_connected().map(|(s, _)| s).collect();
    let mut dead = Vec::new();
    for s in slots {
        let addr = match ctx.peers.get(s).and_then(|p| p.addr) {
            Some(a) => a,
            None => continue,
        };
        if let Some(peer) = ctx.peers.get_mut(s) {
            while let Some((payload, _seq)) = peer.reliable_out.check_retransmit(now) {
                let _ = sock.send_to(encrypted(&payload).as_slice(), addr);
                ctx.stats.reliable_retransmits += 1;
            }
            if peer.reliable_out.check_timeout() {
                dead.push(s);
            }
        }
    }
    for s in dead {
        teardown_peer_silent(ctx, s);
    }
}

/// Retry exhaustion: peer is torn down without a boot message,
/// but still gets the standard three-message broadcast (handled by the
/// caller's next outbox flush since the messages were already queued by
/// `teardown_peer`'s sibling path). Retry-exhaustion reuses the same
/// broadcast by calling the full teardown, just without sending a boot.
fn teardown_peer_silent(ctx: &mut ServerContext, slot: usize) {
    // Mirrors `teardown_peer` minus the socket handle, which the caller
    // (the retransmit sweep) doesn't have split out; route through the
    // same state machine, then let the next flush carry the broadcast.
    let object_id = ctx.peers.get(slot).map(|p| p.ship.object_id).unwrap_or(-1);
    let mut destroy = [0u8; 8];
    let destroy_len = messages::build_destroy_obj(&mut destroy, object_id).unwrap_or(0);
    let mut ui = [0u8; 8];
    let ui_len = messages::build_delete_player_ui(&mut ui, object_id).unwrap_or(0);
    let mut anim = [0u8; 8];
    let anim_len = messages::build_delete_player_anim(&mut anim, object_id).unwrap_or(0);

    let others: Vec<usize> = ctx.peers.iter_connected().filter(|(s, _)| *s != slot).map(|(s, _)| s).collect();
    for other in others {
        for payload in [&destroy[..destroy_len], &ui[..ui_len], &anim[..anim_len]] {
            if payload.is_empty() {
                continue;
            }
            send_reliable(ctx, other, payload);
        }
    }
    handshake::complete_teardown(&mut ctx.peers, slot);
    ctx.stats.timeouts += 1;
}

fn reap_timeouts(ctx: &mut ServerContext, _sock: &UdpSocket, now: u32) {
    let actions = handshake::reap_idle(&mut ctx.peers, now);
    for action in actions {
        if let HandshakeAction::Teardown { slot } = action {
            teardown_peer_silent(ctx, slot);
        }
    }
}

fn run_master_heartbeat(ctx: &mut ServerContext, sock: &UdpSocket, now: u32) {
    for (addr, payload) in ctx.masters.tick(now) {
        let _ = sock.send_to(payload.as_bytes(), addr);
    }
}

fn probe_masters(ctx: &mut ServerContext, now: u32) {
    for (_addr, _payload) in ctx.masters.probe(now) {
        // Real send happens once the socket exists; `run` calls this
        // before the loop starts, so the probe is only recorded here and
        // actually sent on the first `run_master_heartbeat` tick instead
        // of duplicating socket-handling logic for a one-shot startup
        // probe.
    }
}

fn resolve_torpedo_hits(ctx: &mut ServerContext, sock: &UdpSocket, hits: Vec<crate::torpedo::TorpedoHit>, now: u32) {
    for hit in hits {
        let target_slot = ctx
            .peers
            .iter_connected()
            .find(|(_, p)| p.has_ship && p.ship.object_id == hit.target_id)
            .map(|(s, _)| s);
        let target_slot = match target_slot {
            Some(s) => s,
            None => continue,
        };
        // Impact direction is torpedo-position -> target-position, same as
        // the shooter-to-target convention used elsewhere; torpedoes are
        // area-effect with a real blast radius.
        let impact_dir = ctx
            .peers
            .get(target_slot)
            .map(|p| p.ship.pos.sub(hit.impact_pos).normalize())
            .unwrap_or(crate::math::Vec3::ZERO);
        apply_authoritative_damage(
            ctx,
            sock,
            hit.shooter_slot,
            target_slot,
            hit.damage,
            DamageKind::AreaEffect(impact_dir),
            hit.damage_radius,
            now,
        );
    }
}

/// Server-authoritative damage application: applies the damage,
/// broadcasts an immediate health update to
/// everyone, and on a kill emits DestroyObject + ScoreChange and
/// schedules a respawn unless the game has already ended.
fn apply_authoritative_damage(
    ctx: &mut ServerContext,
    sock: &UdpSocket,
    shooter_slot: usize,
    target_slot: usize,
    damage: f32,
    kind: DamageKind,
    damage_radius: f32,
    now: u32,
) {
    let class_index = match ctx.peers.get(target_slot).and_then(|p| p.class_index) {
        Some(i) => i,
        None => return,
    };
    let was_alive;
    let now_dead;
    {
        let cls = match ctx.registry.get_ship(class_index) {
            Some(c) => c.clone(),
            None => return,
        };
        let peer = match ctx.peers.get_mut(target_slot) {
            Some(p) => p,
            None => return,
        };
        was_alive = peer.ship.alive;
        combat::apply_damage(&mut peer.ship, &cls, damage, kind, damage_radius);

        // `combat::apply_damage` never flips `alive` itself; that's this
        // caller's job, checked against the hull floor and every critical
        // subsystem bottoming out.
        let hull_dead = peer.ship.hull_hp <= 0.0;
        let critical_dead = cls
            .subsystems
            .iter()
            .enumerate()
            .any(|(i, def)| def.is_critical && peer.ship.subsystem_hp.get(i).copied().unwrap_or(1.0) <= 0.0);
        if was_alive && (hull_dead || critical_dead) {
            peer.ship.alive = false;
        }
        now_dead = !peer.ship.alive;
    }

    let target_object_id = ctx.peers.get(target_slot).map(|p| p.ship.object_id).unwrap_or(-1);

    broadcast_subsystem_snapshot(ctx, sock, target_slot, target_object_id);

    if was_alive && now_dead {
        on_ship_destroyed(ctx, sock, shooter_slot, target_slot, target_object_id, now);
    }
}

/// Broadcasts an out-of-cadence health update for the subsystem at index 0
/// (the reactor, whose condition gates overall power and is the one value
/// every viewer always wants fresh) right after a damage event, instead of
/// waiting for that ship's next round-robin turn.
fn broadcast_subsystem_snapshot(ctx: &mut ServerContext, sock: &UdpSocket, target_slot: usize, object_id: i32) {
    let game_time = ctx.game_time;
    const SNAPSHOT_IDX: u8 = 0;
    let condition = match ctx.peers.get(target_slot) {
        Some(p) => p.ship.subsystem_hp.get(SNAPSHOT_IDX as usize).copied().unwrap_or(p.ship.hull_hp),
        None => return,
    };
    let recipients: Vec<usize> = ctx.peers.iter_connected().map(|(s, _)| s).collect();
    for s in recipients {
        let include_power = s != target_slot;
        let mut buf = [0u8; 32];
        if let Some(n) = crate::movement::build_subsystem_health_update(&mut buf, object_id, game_time, SNAPSHOT_IDX, condition, include_power) {
            send_reliable(ctx, s, &buf[..n]);
        }
    }
    let _ = sock;
}

fn on_ship_destroyed(ctx: &mut ServerContext, _sock: &UdpSocket, shooter_slot: usize, victim_slot: usize, victim_object_id: i32, now: u32) {
    let credited = shooter_slot != victim_slot && ctx.peers.get(shooter_slot).is_some();

    if credited {
        if let Some(shooter) = ctx.peers.get_mut(shooter_slot) {
            shooter.score += 1;
        }
    }
    let killer_id = if credited { (shooter_slot as i32) + 1 } else { 0 };
    let killer_score = if credited { ctx.peers.get(shooter_slot).map(|p| p.score).unwrap_or(0) } else { 0 };

    let mut sc_buf = [0u8; 32];
    if let Some(n) = messages::build_score_change(&mut sc_buf, killer_id, killer_score, killer_score, victim_object_id, 1) {
        broadcast_reliable(ctx, &sc_buf[..n]);
    }
    let mut destroy_buf = [0u8; 8];
    if let Some(n) = messages::build_destroy_obj(&mut destroy_buf, victim_object_id) {
        broadcast_reliable(ctx, &destroy_buf[..n]);
    }

    if let Some(victim) = ctx.peers.get_mut(victim_slot) {
        victim.has_ship = false;
    }

    if credited && !ctx.game_ended {
        let frag_limit = ctx.config.frag_limit;
        if frag_limit > 0 && killer_score >= frag_limit {
            ctx.game_ended = true;
            let mut eg_buf = [0u8; 4];
            if let Some(n) = messages::build_end_game(&mut eg_buf, 0) {
                broadcast_reliable(ctx, &eg_buf[..n]);
            }
        }
    }

    if !ctx.game_ended {
        const RESPAWN_DELAY_MS: u32 = 5_000;
        if let Some(victim) = ctx.peers.get_mut(victim_slot) {
            victim.respawn_at = Some(now.wrapping_add(RESPAWN_DELAY_MS));
        }
    }
}

fn broadcast_reliable(ctx: &mut ServerContext, payload: &[u8]) {
    let recipients: Vec<usize> = ctx.peers.iter_connected().map(|(s, _)| s).collect();
    for s in recipients {
        send_reliable(ctx, s, payload);
    }
}

fn broadcast_health_round_robin(ctx: &mut ServerContext, _sock: &UdpSocket, now: u32) {
    let slots: Vec<usize> = ctx.peers.iter_connected().filter(|(_, p)| p.has_ship).map(|(s, _)| s).collect();
    for ship_slot in slots {
        let (object_id, subsystem_count, game_time) = match ctx.peers.get(ship_slot) {
            Some(p) => (p.ship.object_id, p.ship.subsystem_hp.len().max(1), ctx.game_time),
            None => continue,
        };
        let rr_idx = tick::advance_health_cursor(ctx.peers.get_mut(ship_slot).unwrap(), subsystem_count);
        let condition = ctx
            .peers
            .get(ship_slot)
            .and_then(|p| p.ship.subsystem_hp.get(rr_idx as usize).copied())
            .unwrap_or(1.0);

        let recipients: Vec<usize> = ctx.peers.iter_connected().map(|(s, _)| s).collect();
        for s in recipients {
            let include_power = s != ship_slot;
            let mut buf = [0u8; 32];
            if let Some(n) = crate::movement::build_subsystem_health_update(&mut buf, object_id, game_time, rr_idx, condition, include_power) {
                send_reliable(ctx, s, &buf[..n]);
            }
        }
    }
    let _ = now;
}

fn emit_keepalives(ctx: &mut ServerContext, _sock: &UdpSocket, _now: u32) {
    let slots: Vec<usize> = ctx.peers.iter_connected().map(|(s, _)| s).collect();
    for s in slots {
        let echo = ctx.peers.get(s).map(|p| p.keepalive_payload.clone()).unwrap_or_default();
        queue_raw_message(ctx, s, opcodes::TRANSPORT_KEEPALIVE, &echo);
    }
}

fn flush_all_outboxes(ctx: &mut ServerContext, sock: &UdpSocket) {
    let slots: Vec<usize> = ctx.peers.iter_connected().map(|(s, _)| s).collect();
    for s in slots {
        let addr = match ctx.peers.get(s).and_then(|p| p.addr) {
            Some(a) => a,
            None => continue,
        };
        if let Some(peer) = ctx.peers.get_mut(s) {
            if peer.outbox.is_empty() {
                continue;
            }
            let payload = std::mem::take(&mut peer.outbox);
            let count = std::mem::take(&mut peer.outbox_count);
            let mut full = Vec::with_capacity(2 + payload.len());
            full.push(transport::DIR_SERVER);
            full.push(count);
            full.extend_from_slice(&payload);
            let _ = sock.send_to(encrypted(&full).as_slice(), addr);
        }
    }
}

fn shutdown_sequence(ctx: &mut ServerContext, sockets: &Sockets, now: u32) {
    log::info!(
        "shutting down: {} connections, {} peak, {} disconnects, {} timeouts",
        ctx.stats.total_connections,
        ctx.stats.peak_players,
        ctx.stats.disconnects,
        ctx.stats.timeouts
    );

    let slots: Vec<usize> = ctx.peers.iter_connected().map(|(s, _)| s).collect();
    for s in slots {
        if let Some(addr) = ctx.peers.get(s).and_then(|p| p.addr) {
            let mut out = [0u8; 16];
            if let Some(n) = transport::build_message(&mut out, transport::DIR_SERVER, opcodes::TRANSPORT_DISCONNECT, &[]) {
                let _ = sockets.game.send_to(encrypted(&out[..n]).as_slice(), addr);
            }
        }
    }

    for (addr, payload) in tick::shutdown_master_heartbeats(ctx) {
        let _ = sockets.game.send_to(payload.as_bytes(), addr);
    }

    let _ = now;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ServerConfig;
    use crate::registry::{ProjectileDef, Registry, ShipClass, SubsystemDef, Vec3 as RVec3};

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn subsystem(max_damage: f32, min_firing_charge: f32, reload_delay: f32) -> SubsystemDef {
        SubsystemDef {
            name: "Sub".into(),
            kind: "generic".into(),
            position: RVec3::default(),
            radius: 5.0,
            max_condition: 100.0,
            disabled_pct: 0.2,
            is_critical: false,
            is_targetable: true,
            repair_complexity: 1.0,
            max_damage,
            max_charge: 100.0,
            min_firing_charge,
            recharge_rate: 10.0,
            discharge_rate: 0.0,
            max_damage_distance: 0.0,
            weapon_id: 0,
            forward: RVec3::default(),
            up: RVec3::default(),
            arc_width: [0.0; 2],
            arc_height: [0.0; 2],
            reload_delay,
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

    fn sample_class() -> ShipClass {
        let mut subsystems = vec![subsystem(0.0, 0.0, 1.0); opcodes::subsys::TORPEDO_1 + 1];
        subsystems[0] = subsystem(150.0, 50.0, 1.0);
        subsystems[opcodes::subsys::TORPEDO_1] = subsystem(0.0, 0.0, 2.0);
        ShipClass {
            name: "Test".into(),
            species_id: 7,
            faction: "F".into(),
            hull_hp: 100.0,
            mass: 1.0,
            rotational_inertia: 1.0,
            max_speed: 100.0,
            max_accel: 1.0,
            max_angular_accel: 1.0,
            max_angular_velocity: 1.0,
            shield_hp: [0.0; 6],
            shield_recharge: [0.0; 6],
            can_cloak: true,
            has_tractor: false,
            torpedo_tubes: 1,
            phaser_banks: 1,
            pulse_weapons: 0,
            tractor_beams: 0,
            max_repair_points: 0.0,
            num_repair_teams: 0,
            damage_radius_multiplier: 1.0,
            subsystems,
        }
    }

    fn sample_registry() -> Registry {
        Registry {
            ships: vec![sample_class()],
            projectiles: vec![ProjectileDef {
                name: "Torp".into(),
                script: "".into(),
                net_type_id: 0,
                damage: 40.0,
                launch_speed: 300.0,
                power_cost: 0.0,
                guidance_lifetime: 2.0,
                max_angular_accel: 1.0,
                lifetime: 8.0,
                damage_radius_factor: 1.0,
            }],
        }
    }

    fn test_ctx() -> ServerContext {
        let mut ctx = ServerContext::new(ServerConfig::default(), 0, 0);
        ctx.registry = sample_registry();
        ctx.registry_loaded = true;
        ctx
    }

    fn spawn_ship(ctx: &mut ServerContext, slot: usize, object_id: i32, pos: crate::math::Vec3) {
        let cls = ctx.registry.get_ship(0).unwrap().clone();
        if let Some(peer) = ctx.peers.get_mut(slot) {
            peer.ship = crate::ship::ShipState::spawn(&cls, 0, object_id, slot as u8, 0);
            peer.ship.pos = pos;
            peer.class_index = Some(0);
            peer.has_ship = true;
        }
    }

    fn build_beam_fire(shooter_id: i32, bank: u8, dir: (f32, f32, f32), target: Option<i32>) -> Vec<u8> {
        let mut buf = [0u8; 32];
        let len = {
            let mut cur = Cursor::new(&mut buf);
            cur.write_u8(GameOp::BeamFire.to_byte());
            cur.write_i32(shooter_id);
            cur.write_u8(bank);
            cur.write_cv3(dir.0, dir.1, dir.2);
            match target {
                Some(t) => {
                    cur.write_u8(0x01);
                    cur.write_i32(t);
                }
                None => {
                    cur.write_u8(0);
                }
            }
            cur.position()
        };
        buf[..len].to_vec()
    }

    fn build_torpedo_fire(shooter_id: i32, tube: u8, vel: (f32, f32, f32)) -> Vec<u8> {
        let mut buf = [0u8; 32];
        let len = {
            let mut cur = Cursor::new(&mut buf);
            cur.write_u8(GameOp::TorpedoFire.to_byte());
            cur.write_i32(shooter_id);
            cur.write_u8(tube);
            cur.write_u8(0);
            cur.write_cv3(vel.0, vel.1, vel.2);
            cur.position()
        };
        buf[..len].to_vec()
    }

    fn build_collision_effect(source_id: i32, target_id: i32, impact: (f32, f32, f32)) -> Vec<u8> {
        let mut buf = [0u8; 32];
        let len = {
            let mut cur = Cursor::new(&mut buf);
            cur.write_u8(GameOp::CollisionEffect.to_byte());
            cur.write_i32(source_id);
            cur.write_i32(target_id);
            cur.write_cv4(impact.0, impact.1, impact.2);
            cur.position()
        };
        buf[..len].to_vec()
    }

    #[test]
    fn beam_fire_with_target_applies_authoritative_damage_and_allows_relay() {
        let mut ctx = test_ctx();
        let sockets = Sockets::bind(0, None).unwrap();
        let shooter = ctx.peers.add(addr(1), 0).unwrap();
        let target = ctx.peers.add(addr(2), 0).unwrap();
        spawn_ship(&mut ctx, shooter, 10, crate::math::Vec3::ZERO);
        spawn_ship(&mut ctx, target, 20, crate::math::Vec3::new(0.0, 30.0, 0.0));
        if let Some(p) = ctx.peers.get_mut(shooter) {
            p.ship.phaser_charge[0] = 100.0;
        }

        let payload = build_beam_fire(10, 0, (0.0, 1.0, 0.0), Some(20));
        let allow_relay = handle_beam_fire(&mut ctx, &sockets, shooter, &payload, 0);

        assert!(allow_relay);
        let victim_hull = ctx.peers.get(target).unwrap().ship.hull_hp;
        assert!((victim_hull - 100.0).abs() > 1e-3, "expected the 150 max_damage hit to clear shields and break into hull");
        assert_eq!(ctx.peers.get(shooter).unwrap().ship.phaser_charge[0], 0.0);
    }

    #[test]
    fn beam_fire_with_spoofed_shooter_id_is_rejected() {
        let mut ctx = test_ctx();
        let sockets = Sockets::bind(0, None).unwrap();
        let shooter = ctx.peers.add(addr(1), 0).unwrap();
        spawn_ship(&mut ctx, shooter, 10, crate::math::Vec3::ZERO);
        if let Some(p) = ctx.peers.get_mut(shooter) {
            p.ship.phaser_charge[0] = 100.0;
        }

        let payload = build_beam_fire(999, 0, (0.0, 1.0, 0.0), None);
        let allow_relay = handle_beam_fire(&mut ctx, &sockets, shooter, &payload, 0);

        assert!(!allow_relay);
        assert_eq!(ctx.peers.get(shooter).unwrap().fire_violations, 1);
    }

    #[test]
    fn beam_fire_without_charge_is_rejected() {
        let mut ctx = test_ctx();
        let sockets = Sockets::bind(0, None).unwrap();
        let shooter = ctx.peers.add(addr(1), 0).unwrap();
        spawn_ship(&mut ctx, shooter, 10, crate::math::Vec3::ZERO);

        let payload = build_beam_fire(10, 0, (0.0, 1.0, 0.0), None);
        let allow_relay = handle_beam_fire(&mut ctx, &sockets, shooter, &payload, 0);

        assert!(!allow_relay);
    }

    #[test]
    fn repeated_invariant_violations_boot_the_peer() {
        let mut ctx = test_ctx();
        let sockets = Sockets::bind(0, None).unwrap();
        let shooter = ctx.peers.add(addr(1), 0).unwrap();
        spawn_ship(&mut ctx, shooter, 10, crate::math::Vec3::ZERO);

        let payload = build_beam_fire(999, 0, (0.0, 1.0, 0.0), None);
        for _ in 0..MAX_FIRE_VIOLATIONS {
            handle_beam_fire(&mut ctx, &sockets, shooter, &payload, 0);
        }

        assert!(ctx.peers.get(shooter).is_none(), "peer should have been torn down after crossing the violation threshold");
    }

    #[test]
    fn torpedo_fire_spawns_a_tracked_torpedo() {
        let mut ctx = test_ctx();
        let sockets = Sockets::bind(0, None).unwrap();
        let shooter = ctx.peers.add(addr(1), 0).unwrap();
        spawn_ship(&mut ctx, shooter, 10, crate::math::Vec3::ZERO);

        let payload = build_torpedo_fire(10, 0, (0.0, 1.0, 0.0));
        let allow_relay = handle_torpedo_fire(&mut ctx, &sockets, shooter, &payload, 0);

        assert!(allow_relay);
        assert_eq!(ctx.torpedoes.count(), 1);
        assert!(ctx.peers.get(shooter).unwrap().ship.torpedo_cooldown[0] > 0.0);
    }

    #[test]
    fn torpedo_fire_rejects_tube_still_on_cooldown() {
        let mut ctx = test_ctx();
        let sockets = Sockets::bind(0, None).unwrap();
        let shooter = ctx.peers.add(addr(1), 0).unwrap();
        spawn_ship(&mut ctx, shooter, 10, crate::math::Vec3::ZERO);
        if let Some(p) = ctx.peers.get_mut(shooter) {
            p.ship.torpedo_cooldown[0] = 2.0;
        }

        let payload = build_torpedo_fire(10, 0, (0.0, 1.0, 0.0));
        let allow_relay = handle_torpedo_fire(&mut ctx, &sockets, shooter, &payload, 0);

        assert!(!allow_relay);
        assert_eq!(ctx.torpedoes.count(), 0);
    }

    #[test]
    fn collision_effect_damages_both_participants_with_no_self_credit() {
        let mut ctx = test_ctx();
        let sockets = Sockets::bind(0, None).unwrap();
        let a = ctx.peers.add(addr(1), 0).unwrap();
        let b = ctx.peers.add(addr(2), 0).unwrap();
        spawn_ship(&mut ctx, a, 10, crate::math::Vec3::ZERO);
        spawn_ship(&mut ctx, b, 20, crate::math::Vec3::new(5.0, 0.0, 0.0));

        // Sender (a) reports itself as the target; the dedup rule only
        // applies when the sender reports itself as the source.
        let payload = build_collision_effect(20, 10, (0.0, 0.0, 50.0));
        let allow_relay = handle_collision_effect(&mut ctx, &sockets, a, &payload, 0);

        assert!(allow_relay);
        assert!(ctx.peers.get(a).unwrap().ship.hull_hp < 100.0);
        assert!(ctx.peers.get(b).unwrap().ship.hull_hp < 100.0);
    }

    #[test]
    fn collision_effect_dedups_when_sender_is_source_and_target_is_live() {
        let mut ctx = test_ctx();
        let sockets = Sockets::bind(0, None).unwrap();
        let a = ctx.peers.add(addr(1), 0).unwrap();
        let b = ctx.peers.add(addr(2), 0).unwrap();
        spawn_ship(&mut ctx, a, 10, crate::math::Vec3::ZERO);
        spawn_ship(&mut ctx, b, 20, crate::math::Vec3::new(5.0, 0.0, 0.0));

        let payload = build_collision_effect(10, 20, (0.0, 0.0, 50.0));
        let allow_relay = handle_collision_effect(&mut ctx, &sockets, a, &payload, 0);

        assert!(allow_relay);
        assert_eq!(ctx.peers.get(a).unwrap().ship.hull_hp, 100.0, "sender-as-source report should be skipped, the target self-reports instead");
        assert_eq!(ctx.peers.get(b).unwrap().ship.hull_hp, 100.0);
    }

    #[test]
    fn collision_effect_rejects_implausibly_distant_report() {
        let mut ctx = test_ctx();
        let sockets = Sockets::bind(0, None).unwrap();
        let a = ctx.peers.add(addr(1), 0).unwrap();
        let b = ctx.peers.add(addr(2), 0).unwrap();
        spawn_ship(&mut ctx, a, 10, crate::math::Vec3::ZERO);
        spawn_ship(&mut ctx, b, 20, crate::math::Vec3::new(5000.0, 0.0, 0.0));

        // Sender reports itself as the target so the dedup rule above
        // doesn't short-circuit this case.
        let payload = build_collision_effect(20, 10, (0.0, 0.0, 50.0));
        let allow_relay = handle_collision_effect(&mut ctx, &sockets, a, &payload, 0);

        assert!(!allow_relay);
        assert_eq!(ctx.peers.get(a).unwrap().ship.hull_hp, 100.0);
    }
}
