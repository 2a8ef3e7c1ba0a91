//! Core types shared by the engine components

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Index of an interface in the [`InterfaceRegistry`](crate::iface::InterfaceRegistry)
pub type IfaceId = usize;

/// Index of a host in the [`Monitor`](crate::monitor::Monitor) host table
pub type HostId = usize;

/// Reachability verdict of a monitored host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostState {
    /// No verdict yet; only ever the initial state
    #[default]
    Unknown,
    /// Enough consecutive replies
    Up,
    /// Enough consecutive timeouts
    Down,
}

impl HostState {
    /// Convert state to its admin/status representation
    pub fn as_str(&self) -> &'static str {
        match self {
            HostState::Unknown => "unknown",
            HostState::Up => "up",
            HostState::Down => "down",
        }
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a single probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Matching echo reply, with its round-trip time
    Success { rtt: Duration },
    /// Timeout, send failure, or unusable interface
    Failure,
}

/// A verdict change emitted by the host state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Verdict before the outcome
    pub from: HostState,
    /// Verdict after the outcome
    pub to: HostState,
}

/// Activation state of an interface's route table, as seen by the admin channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableState {
    /// `lookup <table>` rule installed
    Active,
    /// Rule absent
    Inactive,
}

impl TableState {
    /// Build from a boolean activation flag
    pub fn from_active(active: bool) -> Self {
        if active { Self::Active } else { Self::Inactive }
    }

    /// Convert to its admin/status representation
    pub fn as_str(&self) -> &'static str {
        match self {
            TableState::Active => "active",
            TableState::Inactive => "inactive",
        }
    }
}
