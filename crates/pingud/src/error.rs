//! Error types for pingud
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-11: Error Handling - Structured error types with contextual information
//! - AU-3: Content of Audit Records - Errors carry interface/host context

use thiserror::Error;

/// Errors that can occur in pingud
///
/// Only startup can fail with these; once the reactor runs, errors are
/// logged and the daemon keeps going in a degraded state.
#[derive(Debug, Error)]
pub enum PinguError {
    /// Configuration could not be read or is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Raw ICMP socket could not be created for an interface
    #[error("Failed to open ICMP socket for interface '{iface}': {source}")]
    Socket {
        /// Interface name ("" for the unnamed interface)
        iface: String,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// Netlink socket error
    #[error("Netlink error: {0}")]
    Netlink(String),

    /// Host action command could not be started
    #[error("Failed to run action '{command}': {source}")]
    ActionExec {
        /// Command line handed to the shell
        command: String,
        /// Underlying spawn error
        #[source]
        source: std::io::Error,
    },

    /// Another instance owns the pidfile
    #[error("Appears to be running already (pid {0})")]
    AlreadyRunning(i32),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for pingud operations
pub type Result<T> = std::result::Result<T, PinguError>;
