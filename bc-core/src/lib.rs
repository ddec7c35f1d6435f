//! Core protocol, simulation, and discovery logic for the dedicated
//! server. The binary crate (`bc-server`) is a thin CLI shell around the
//! types and functions exposed here.

pub mod cipher;
pub mod clock;
pub mod codec;
pub mod combat;
pub mod context;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod handshake;
pub mod master;
pub mod math;
pub mod messages;
pub mod movement;
pub mod object_id;
pub mod opcodes;
pub mod peer;
pub mod registry;
pub mod server;
pub mod ship;
pub mod stats;
pub mod tick;
pub mod torpedo;
pub mod transport;
