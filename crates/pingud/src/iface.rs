//! Interface registry
//!
//! One [`Interface`] per device referenced by the configuration. Each owns
//! the raw ICMP socket shared by every host probed through it, the link and
//! binding flags that decide whether it is usable, and the routing table it
//! steers traffic into.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - CM-8: System Component Inventory - Track monitored interfaces
//! - SC-7: Boundary Protection - Per-device socket binding

use crate::config::{InterfaceConfig, PinguConfig};
use crate::error::{PinguError, Result};
use crate::socket::{ProbeSocket, SocketFactory};
use crate::types::{HostId, IfaceId};
use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;
use tracing::{debug, info, trace, warn};

/// First table id handed out to interfaces without an explicit table
pub const FIRST_AUTO_TABLE: u32 = 10;

/// A monitored network interface
pub struct Interface {
    /// Device name; empty means no device restriction
    pub name: String,
    /// Kernel interface index, learned from link notifications
    pub index: Option<u32>,
    /// Kernel reports the link up and running
    pub has_link: bool,
    /// Socket is restricted to this device
    pub has_binding: bool,
    /// Current IPv4 address
    pub primary_address: Option<Ipv4Addr>,
    /// Routing table steered by this interface's health
    pub route_table: u32,
    /// Priority of the `lookup <table>` policy rule
    pub rule_priority: u32,
    /// Table follows host verdicts (true) or only link state (false)
    pub health_gated: bool,
    /// Hosts probed through this interface
    pub hosts: Vec<HostId>,
    socket: Box<dyn ProbeSocket>,
}

impl fmt::Debug for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interface")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("has_link", &self.has_link)
            .field("has_binding", &self.has_binding)
            .field("primary_address", &self.primary_address)
            .field("route_table", &self.route_table)
            .field("hosts", &self.hosts.len())
            .finish()
    }
}

impl Interface {
    /// Eligible to carry probes and routed traffic
    pub fn usable(&self) -> bool {
        self.name.is_empty() || (self.has_link && self.has_binding)
    }

    /// Name for logs and status output
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() { "-" } else { &self.name }
    }

    /// Socket shared by all hosts of this interface
    pub fn socket(&self) -> &dyn ProbeSocket {
        self.socket.as_ref()
    }
}

/// Owned collection of all monitored interfaces
pub struct InterfaceRegistry {
    interfaces: Vec<Interface>,
    next_auto_table: u32,
    claimed_tables: HashSet<u32>,
    rule_priority_base: u32,
}

impl InterfaceRegistry {
    /// Create an empty registry
    pub fn new(rule_priority_base: u32) -> Self {
        Self {
            interfaces: Vec::new(),
            next_auto_table: FIRST_AUTO_TABLE,
            claimed_tables: HashSet::new(),
            rule_priority_base,
        }
    }

    /// Create the declared interfaces, then every host's interface
    ///
    /// Returns the interface of each host, in host order. Explicit tables are
    /// claimed up front so auto-assignment never hands them out.
    pub fn resolve(
        &mut self,
        config: &PinguConfig,
        factory: &mut dyn SocketFactory,
    ) -> Result<Vec<IfaceId>> {
        for table in config.interfaces.iter().filter_map(|i| i.route_table) {
            self.claimed_tables.insert(table);
        }

        for iface in &config.interfaces {
            self.get_or_create(&iface.name, Some(iface), factory)?;
        }

        config
            .hosts
            .iter()
            .map(|host| {
                self.get_or_create(&host.interface, config.interface(&host.interface), factory)
            })
            .collect()
    }

    /// Return the interface called `name`, creating it on first use
    pub fn get_or_create(
        &mut self,
        name: &str,
        settings: Option<&InterfaceConfig>,
        factory: &mut dyn SocketFactory,
    ) -> Result<IfaceId> {
        if let Some(id) = self.lookup_by_name(name) {
            return Ok(id);
        }

        let socket = factory.open().map_err(|e| PinguError::Socket {
            iface: name.to_string(),
            source: e,
        })?;

        let route_table = match settings.and_then(|s| s.route_table) {
            Some(table) => {
                self.claimed_tables.insert(table);
                table
            }
            None => self.allocate_table(),
        };
        let rule_priority = match settings.and_then(|s| s.rule_priority) {
            Some(priority) => priority,
            None => self.rule_priority_base.checked_add(route_table).ok_or_else(|| {
                PinguError::Config(format!(
                    "interface '{}': rule priority {} + table {} out of range",
                    name, self.rule_priority_base, route_table
                ))
            })?,
        };
        let health_gated = settings.map(|s| s.health_gated).unwrap_or(true);

        let id = self.interfaces.len();
        self.interfaces.push(Interface {
            name: name.to_string(),
            index: None,
            has_link: false,
            has_binding: false,
            primary_address: None,
            route_table,
            rule_priority,
            health_gated,
            hosts: Vec::new(),
            socket,
        });

        // The device may not exist yet; link-up retries the bind
        self.bind_to_device(id, false);

        info!(
            iface = %self.interfaces[id].display_name(),
            table = route_table,
            priority = rule_priority,
            "Created interface"
        );
        Ok(id)
    }

    fn allocate_table(&mut self) -> u32 {
        while self.claimed_tables.contains(&self.next_auto_table) {
            self.next_auto_table += 1;
        }
        let table = self.next_auto_table;
        self.next_auto_table += 1;
        self.claimed_tables.insert(table);
        table
    }

    /// Restrict the interface socket to its device
    ///
    /// Returns the resulting binding state. The unnamed interface is never
    /// bound and is left untouched.
    pub fn bind_to_device(&mut self, id: IfaceId, log_on_error: bool) -> bool {
        let iface = &mut self.interfaces[id];
        if iface.name.is_empty() {
            return iface.has_binding;
        }

        match iface.socket.bind_device(&iface.name) {
            Ok(()) => {
                debug!(iface = %iface.name, "Bound ICMP socket to device");
                iface.has_binding = true;
            }
            Err(e) => {
                if log_on_error {
                    warn!(iface = %iface.name, error = %e, "Failed to bind ICMP socket to device");
                }
                iface.has_binding = false;
            }
        }
        iface.has_binding
    }

    /// Find an interface by device name
    pub fn lookup_by_name(&self, name: &str) -> Option<IfaceId> {
        self.interfaces.iter().position(|i| i.name == name)
    }

    /// Find an interface by kernel index
    pub fn lookup_by_kernel_index(&self, index: u32) -> Option<IfaceId> {
        self.interfaces.iter().position(|i| i.index == Some(index))
    }

    /// Record the kernel index of an interface
    pub fn set_index(&mut self, id: IfaceId, index: u32) {
        let iface = &mut self.interfaces[id];
        if iface.index != Some(index) {
            debug!(iface = %iface.display_name(), index, "Learned kernel index");
            iface.index = Some(index);
        }
    }

    /// Replace the interface address
    ///
    /// Empty `bytes` means the address was removed. Usability is not affected
    /// either way; it depends only on link and binding.
    pub fn set_address(&mut self, id: IfaceId, family: u8, bytes: &[u8]) {
        let iface = &mut self.interfaces[id];
        if bytes.is_empty() {
            iface.primary_address = None;
            debug!(iface = %iface.display_name(), "Address removed");
            return;
        }

        if i32::from(family) != libc::AF_INET {
            debug!(iface = %iface.display_name(), family, "Ignoring non-IPv4 address");
            return;
        }

        match <[u8; 4]>::try_from(bytes) {
            Ok(octets) => {
                let addr = Ipv4Addr::from(octets);
                iface.primary_address = Some(addr);
                debug!(iface = %iface.display_name(), address = %addr, "New address");
            }
            Err(_) => {
                warn!(
                    iface = %iface.display_name(),
                    len = bytes.len(),
                    "Malformed IPv4 address in notification"
                );
            }
        }
    }

    /// Forget the interface address if it is the one being removed
    pub fn remove_address(&mut self, id: IfaceId, family: u8, bytes: &[u8]) {
        let iface = &mut self.interfaces[id];
        if i32::from(family) != libc::AF_INET {
            return;
        }
        let matches = <[u8; 4]>::try_from(bytes)
            .map(Ipv4Addr::from)
            .is_ok_and(|addr| iface.primary_address == Some(addr));
        if matches {
            iface.primary_address = None;
            debug!(iface = %iface.display_name(), "Address removed");
        } else {
            trace!(iface = %iface.display_name(), "Ignoring removal of untracked address");
        }
    }

    /// Attach a host to the interface it is probed through
    pub fn attach_host(&mut self, id: IfaceId, host: HostId) {
        self.interfaces[id].hosts.push(host);
    }

    /// Interface by id
    pub fn get(&self, id: IfaceId) -> &Interface {
        &self.interfaces[id]
    }

    /// Mutable interface by id
    pub fn get_mut(&mut self, id: IfaceId) -> &mut Interface {
        &mut self.interfaces[id]
    }

    /// All interfaces with their ids
    pub fn iter(&self) -> impl Iterator<Item = (IfaceId, &Interface)> {
        self.interfaces.iter().enumerate()
    }

    /// Number of interfaces
    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    /// True when no interface exists
    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }
}
