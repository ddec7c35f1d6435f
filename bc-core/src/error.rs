use std::io;

use thiserror::Error;

/// Failures that can stop the server before the event loop ever starts.
///
/// Per-datagram failures never reach this type -- codec and transport
/// parsing report success with a `bool`/`Option` instead, since there is
/// nothing for a caller to do with a malformed packet except discard it.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to bind game socket on port {port}: {source}")]
    BindGameSocket { port: u16, source: io::Error },

    #[error("failed to bind discovery socket on port {port}: {source}")]
    BindDiscoverySocket { port: u16, source: io::Error },

    #[error("failed to set socket to non-blocking mode: {0}")]
    NonBlocking(io::Error),

    #[error("failed to load ship/projectile registry from {path}: {reason}")]
    RegistryLoad { path: String, reason: String },

    #[error("failed to load checksum manifest from {path}: {reason}")]
    ManifestLoad { path: String, reason: String },

    #[error("invalid CLI configuration: {0}")]
    Config(String),
}
