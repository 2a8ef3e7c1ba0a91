//! Link-health monitor and policy-route failover daemon
//!
//! pingud probes destinations through specific network interfaces with ICMP
//! echo, derives an up/down verdict per destination and keeps a
//! `lookup <table>` policy rule installed only for interfaces whose upstream
//! path works. Traffic steered by those tables moves away from a failed uplink
//! as soon as its hosts are declared down or its link disappears.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//!
//! | Control | Description | Implementation |
//! |---------|-------------|----------------|
//! | AC-3 | Access Enforcement | Raw sockets and rule changes need CAP_NET_RAW/CAP_NET_ADMIN |
//! | AU-3 | Content of Audit Records | Structured logging with host and interface context |
//! | AU-12 | Audit Record Generation | Verdict, link and table changes logged |
//! | CM-6 | Configuration Settings | TOML configuration with validation |
//! | CP-8 | Telecommunications Services | Failover between uplinks |
//! | SC-7 | Boundary Protection | Per-device probing and policy routing |
//! | SI-4 | System Monitoring | Continuous reachability probing |
//! | SI-11 | Error Handling | Structured error types |
//!
//! # Architecture
//!
//! ```text
//!  kernel link/addr events        raw ICMP sockets (one per interface)
//!            |                                  |
//!            v                                  v
//!   +------------------+   usable?   +-------------------+
//!   | InterfaceRegistry|------------>|  probe path       |
//!   +------------------+             |  (Monitor + icmp) |
//!            ^                       +-------------------+
//!            |                                  | outcomes
//!            |                                  v
//!   +------------------+  verdicts   +-------------------+
//!   | RouteController  |<------------|  Host state       |
//!   +------------------+             |  machines         |
//!            |                       +-------------------+
//!            v
//!   RTM_NEWRULE / RTM_DELRULE
//! ```

pub mod action;
pub mod adm;
pub mod config;
pub mod daemon;
pub mod error;
pub mod host;
pub mod icmp;
pub mod iface;
pub mod monitor;
pub mod netlink;
pub mod pidfile;
pub mod route;
pub mod snapshot;
pub mod socket;
pub mod timer;
pub mod types;

pub use config::PinguConfig;
pub use error::{PinguError, Result};
pub use monitor::Monitor;
pub use route::{RouteKernel, RuleOp, RuleRequest};
pub use socket::{ProbeSocket, SocketFactory};
pub use types::{HostState, ProbeOutcome, TableState};
