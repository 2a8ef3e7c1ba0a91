//! Point-in-time view of the engine for the admin channel

use crate::types::{HostState, TableState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::Ipv4Addr;

/// State of one monitored host
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostSnapshot {
    pub label: String,
    pub address: Ipv4Addr,
    /// Interface name ("" for the unnamed interface)
    pub interface: String,
    pub state: HostState,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    /// Round-trip time of the last reply in milliseconds
    pub last_rtt_ms: Option<f64>,
    pub probes_sent: u64,
    pub replies: u64,
    /// Time of the last verdict change
    pub last_change: Option<DateTime<Utc>>,
}

/// State of one interface and its routing table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InterfaceSnapshot {
    pub name: String,
    pub index: Option<u32>,
    pub has_link: bool,
    pub has_binding: bool,
    pub usable: bool,
    pub address: Option<Ipv4Addr>,
    pub route_table: u32,
    pub rule_priority: u32,
    pub health_gated: bool,
    /// Activation the engine wants
    pub desired: TableState,
    /// Activation last acknowledged by the kernel
    pub applied: Option<TableState>,
    /// Kernel state matches the desired state
    pub in_sync: bool,
}

/// Engine state served by the `status` command
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    pub hosts: Vec<HostSnapshot>,
    pub interfaces: Vec<InterfaceSnapshot>,
}
