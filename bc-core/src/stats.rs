//! Session statistics: connection counters, per-opcode histograms, and a
//! bounded player connection history. Grounded on
//! `bc_session_stats_t` in `original_source/include/openbc/server_state.h`.

pub const MAX_PLAYER_HISTORY: usize = 32;

/// One player's connection span. `disconnect_time_ms` stays `None` while
/// still connected, mirroring the source's `0 = still connected` sentinel.
pub struct PlayerRecord {
    pub name: String,
    pub connect_time_ms: u32,
    pub disconnect_time_ms: Option<u32>,
}

pub struct SessionStats {
    pub start_time_ms: u32,
    pub total_connections: u32,
    pub peak_players: u32,
    pub boots_full: u32,
    pub boots_checksum: u32,
    pub disconnects: u32,
    pub timeouts: u32,
    pub gamespy_queries: u32,
    pub reliable_retransmits: u32,
    /// Indexed by opcode byte, mirrors `opcodes_recv[256]`.
    pub opcodes_recv: [u32; 256],
    /// Incremented for unhandled or wrong-state-for-opcode messages.
    pub opcodes_rejected: [u32; 256],
    /// Bounded ring of the most recent [`MAX_PLAYER_HISTORY`] connections;
    /// a `Vec` plays the role of the source's fixed `players[32]` +
    /// `player_count`, dropping the oldest entry instead of refusing new
    /// ones once full.
    pub players: Vec<PlayerRecord>,
}

impl SessionStats {
    pub fn new(start_time_ms: u32) -> Self {
        SessionStats {
            start_time_ms,
            total_connections: 0,
            peak_players: 0,
            boots_full: 0,
            boots_checksum: 0,
            disconnects: 0,
            timeouts: 0,
            gamespy_queries: 0,
            reliable_retransmits: 0,
            opcodes_recv: [0; 256],
            opcodes_rejected: [0; 256],
            players: Vec::new(),
        }
    }

    pub fn record_recv(&mut self, opcode: u8) {
        self.opcodes_recv[opcode as usize] += 1;
    }

    pub fn record_rejected(&mut self, opcode: u8) {
        self.opcodes_rejected[opcode as usize] += 1;
    }

    /// Records a new connection, updating the connection/peak counters and
    /// pushing a history entry (evicting the oldest once full).
    pub fn record_connect(&mut self, name: &str, now_ms: u32, active_players: u32) {
        self.total_connections += 1;
        if active_players > self.peak_players {
            self.peak_players = active_players;
        }
        if self.players.len() >= MAX_PLAYER_HISTORY {
            self.players.remove(0);
        }
        self.players.push(PlayerRecord {
            name: name.to_string(),
            connect_time_ms: now_ms,
            disconnect_time_ms: None,
        });
    }

    /// Stamps the most recent still-connected record matching
    /// `connect_time_ms` as disconnected at `now_ms`.
    pub fn record_disconnect(&mut self, connect_time_ms: u32, now_ms: u32) {
        self.disconnects += 1;
        if let Some(rec) = self
            .players
            .iter_mut()
            .find(|p| p.disconnect_time_ms.is_none() && p.connect_time_ms == connect_time_ms)
        {
            rec.disconnect_time_ms = Some(now_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_recv_and_rejected_per_opcode() {
        let mut stats = SessionStats::new(0);
        stats.record_recv(0x1C);
        stats.record_recv(0x1C);
        stats.record_rejected(0x05);
        assert_eq!(stats.opcodes_recv[0x1C], 2);
        assert_eq!(stats.opcodes_rejected[0x05], 1);
    }

    #[test]
    fn tracks_peak_players() {
        let mut stats = SessionStats::new(0);
        stats.record_connect("a", 100, 1);
        stats.record_connect("b", 200, 2);
        stats.record_connect("c", 300, 1);
        assert_eq!(stats.peak_players, 2);
        assert_eq!(stats.total_connections, 3);
    }

    #[test]
    fn history_evicts_oldest_past_capacity() {
        let mut stats = SessionStats::new(0);
        for i in 0..(MAX_PLAYER_HISTORY + 5) {
            stats.record_connect(&format!("p{}", i), i as u32, 1);
        }
        assert_eq!(stats.players.len(), MAX_PLAYER_HISTORY);
        assert_eq!(stats.players[0].name, "p5");
    }

    #[test]
    fn disconnect_stamps_matching_record() {
        let mut stats = SessionStats::new(0);
        stats.record_connect("a", 100, 1);
        stats.record_disconnect(100, 5000);
        assert_eq!(stats.players[0].disconnect_time_ms, Some(5000));
        assert_eq!(stats.disconnects, 1);
    }
}
