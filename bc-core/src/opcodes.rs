//! Wire protocol opcode constants, transcribed from the three opcode
//! layers: transport framing, the game-layer jump table, and the Python
//! message layer that rides on top of it.

pub const TRANSPORT_KEEPALIVE: u8 = 0x00;
pub const TRANSPORT_ACK: u8 = 0x01;
pub const TRANSPORT_CONNECT: u8 = 0x03;
pub const TRANSPORT_CONNECT_DATA: u8 = 0x04;
pub const TRANSPORT_CONNECT_ACK: u8 = 0x05;
pub const TRANSPORT_DISCONNECT: u8 = 0x06;
pub const TRANSPORT_RELIABLE: u8 = 0x32;

pub const DEFAULT_PORT: u16 = 0x5655;
pub const GAMESPY_PORT: u16 = 0x5656;

/// A game-layer opcode (the payload byte inside a transport message) or a
/// Python message opcode layered on top of it. `Unknown` preserves any byte
/// that doesn't match a known entry instead of failing to parse -- the
/// dispatcher logs and drops these rather than refusing the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameOp {
    Settings,
    GameInit,
    ObjCreate,
    ObjCreateTeam,
    BootPlayer,
    PythonEvent,
    StartFiring,
    StopFiring,
    StopFiringAt,
    SubsysStatus,
    AddRepairList,
    ClientEvent,
    PythonEvent2,
    StartCloak,
    StopCloak,
    StartWarp,
    RepairPriority,
    SetPhaserLevel,
    HostMsg,
    DestroyObj,
    CollisionEffect,
    UiSettings,
    DeletePlayerUi,
    DeletePlayerAnim,
    TorpedoFire,
    BeamFire,
    TorpTypeChange,
    StateUpdate,
    ObjNotFound,
    RequestObj,
    EnterSet,
    ChecksumReq,
    ChecksumResp,
    VersionMismatch,
    SysChecksumFail,
    FileTransfer,
    FileTransferAck,
    /// `0x28`: present in the jump table but never meaningfully handled by
    /// the original server beyond acknowledging well-formedness.
    Unknown28,
    Explosion,
    NewPlayerInGame,
    Chat,
    TeamChat,
    MissionInit,
    ScoreChange,
    Score,
    EndGame,
    Restart,
    ScoreInit,
    TeamScore,
    TeamMessage,
    Unknown(u8),
}

impl GameOp {
    pub fn from_byte(b: u8) -> GameOp {
        match b {
            0x00 => GameOp::Settings,
            0x01 => GameOp::GameInit,
            0x02 => GameOp::ObjCreate,
            0x03 => GameOp::ObjCreateTeam,
            0x04 => GameOp::BootPlayer,
            0x06 => GameOp::PythonEvent,
            0x07 => GameOp::StartFiring,
            0x08 => GameOp::StopFiring,
            0x09 => GameOp::StopFiringAt,
            0x0A => GameOp::SubsysStatus,
            0x0B => GameOp::AddRepairList,
            0x0C => GameOp::ClientEvent,
            0x0D => GameOp::PythonEvent2,
            0x0E => GameOp::StartCloak,
            0x0F => GameOp::StopCloak,
            0x10 => GameOp::StartWarp,
            0x11 => GameOp::RepairPriority,
            0x12 => GameOp::SetPhaserLevel,
            0x13 => GameOp::HostMsg,
            0x14 => GameOp::DestroyObj,
            0x15 => GameOp::CollisionEffect,
            0x16 => GameOp::UiSettings,
            0x17 => GameOp::DeletePlayerUi,
            0x18 => GameOp::DeletePlayerAnim,
            0x19 => GameOp::TorpedoFire,
            0x1A => GameOp::BeamFire,
            0x1B => GameOp::TorpTypeChange,
            0x1C => GameOp::StateUpdate,
            0x1D => GameOp::ObjNotFound,
            0x1E => GameOp::RequestObj,
            0x1F => GameOp::EnterSet,
            0x20 => GameOp::ChecksumReq,
            0x21 => GameOp::ChecksumResp,
            0x22 => GameOp::VersionMismatch,
            0x23 => GameOp::SysChecksumFail,
            0x25 => GameOp::FileTransfer,
            0x27 => GameOp::FileTransferAck,
            0x28 => GameOp::Unknown28,
            0x29 => GameOp::Explosion,
            0x2A => GameOp::NewPlayerInGame,
            0x2C => GameOp::Chat,
            0x2D => GameOp::TeamChat,
            0x35 => GameOp::MissionInit,
            0x36 => GameOp::ScoreChange,
            0x37 => GameOp::Score,
            0x38 => GameOp::EndGame,
            0x39 => GameOp::Restart,
            0x3F => GameOp::ScoreInit,
            0x40 => GameOp::TeamScore,
            0x41 => GameOp::TeamMessage,
            other => GameOp::Unknown(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            GameOp::Settings => 0x00,
            GameOp::GameInit => 0x01,
            GameOp::ObjCreate => 0x02,
            GameOp::ObjCreateTeam => 0x03,
            GameOp::BootPlayer => 0x04,
            GameOp::PythonEvent => 0x06,
            GameOp::StartFiring => 0x07,
            GameOp::StopFiring => 0x08,
            GameOp::StopFiringAt => 0x09,
            GameOp::SubsysStatus => 0x0A,
            GameOp::AddRepairList => 0x0B,
            GameOp::ClientEvent => 0x0C,
            GameOp::PythonEvent2 => 0x0D,
            GameOp::StartCloak => 0x0E,
            GameOp::StopCloak => 0x0F,
            GameOp::StartWarp => 0x10,
            GameOp::RepairPriority => 0x11,
            GameOp::SetPhaserLevel => 0x12,
            GameOp::HostMsg => 0x13,
            GameOp::DestroyObj => 0x14,
            GameOp::CollisionEffect => 0x15,
            GameOp::UiSettings => 0x16,
            GameOp::DeletePlayerUi => 0x17,
            GameOp::DeletePlayerAnim => 0x18,
            GameOp::TorpedoFire => 0x19,
            GameOp::BeamFire => 0x1A,
            GameOp::TorpTypeChange => 0x1B,
            GameOp::StateUpdate => 0x1C,
            GameOp::ObjNotFound => 0x1D,
            GameOp::RequestObj => 0x1E,
            GameOp::EnterSet => 0x1F,
            GameOp::ChecksumReq => 0x20,
            GameOp::ChecksumResp => 0x21,
            GameOp::VersionMismatch => 0x22,
            GameOp::SysChecksumFail => 0x23,
            GameOp::FileTransfer => 0x25,
            GameOp::FileTransferAck => 0x27,
            GameOp::Unknown28 => 0x28,
            GameOp::Explosion => 0x29,
            GameOp::NewPlayerInGame => 0x2A,
            GameOp::Chat => 0x2C,
            GameOp::TeamChat => 0x2D,
            GameOp::MissionInit => 0x35,
            GameOp::ScoreChange => 0x36,
            GameOp::Score => 0x37,
            GameOp::EndGame => 0x38,
            GameOp::Restart => 0x39,
            GameOp::ScoreInit => 0x3F,
            GameOp::TeamScore => 0x40,
            GameOp::TeamMessage => 0x41,
            GameOp::Unknown(b) => b,
        }
    }
}

pub mod dirty {
    pub const POSITION_ABS: u8 = 0x01;
    pub const POSITION_DELTA: u8 = 0x02;
    pub const ORIENT_FWD: u8 = 0x04;
    pub const ORIENT_UP: u8 = 0x08;
    pub const SPEED: u8 = 0x10;
    pub const SUBSYSTEM_STATES: u8 = 0x20;
    pub const CLOAK_STATE: u8 = 0x40;
    pub const WEAPON_STATES: u8 = 0x80;
}

pub mod subsys {
    pub const REACTOR: usize = 0x00;
    pub const REPAIR: usize = 0x01;
    pub const CLOAK: usize = 0x02;
    pub const POWERED: usize = 0x03;
    pub const LIFE_SUPPORT: usize = 0x04;
    pub const SHIELDS: usize = 0x05;
    pub const TORPEDO_1: usize = 0x06;
    pub const TORPEDO_6: usize = 0x0B;
    pub const PHASER_1: usize = 0x0C;
    pub const PHASER_8: usize = 0x13;
    pub const IMPULSE_1: usize = 0x14;
    pub const IMPULSE_4: usize = 0x17;
    pub const WARP_DRIVE: usize = 0x18;
    pub const PHASER_CTRL: usize = 0x19;
    pub const PULSE_WEAPON: usize = 0x1A;
    pub const SENSORS: usize = 0x1B;
    pub const REACTOR_2: usize = 0x1C;
    pub const TRACTOR_1: usize = 0x1D;
    pub const TRACTOR_4: usize = 0x20;
    pub const MAX: usize = 0x21;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_known_opcodes() {
        for b in [0x00u8, 0x03, 0x12, 0x1C, 0x28, 0x2A, 0x37, 0x41] {
            assert_eq!(GameOp::from_byte(b).to_byte(), b);
        }
    }

    #[test]
    fn unrecognized_byte_is_preserved() {
        let op = GameOp::from_byte(0x50);
        assert_eq!(op, GameOp::Unknown(0x50));
        assert_eq!(op.to_byte(), 0x50);
    }

    #[test]
    fn reserved_gap_byte_is_unknown() {
        assert_eq!(GameOp::from_byte(0x05), GameOp::Unknown(0x05));
    }
}
