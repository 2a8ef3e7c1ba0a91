//! Probe engine
//!
//! [`Monitor`] owns every piece of engine state: the interface registry, the
//! hosts, the route controller and the timer queue. It performs no waiting of
//! its own. The reactor calls in when a socket is readable, when a kernel
//! message arrives or when [`Monitor::next_deadline`] has passed, and each
//! call runs to completion.
//!
//! Data flows one way: link/address events update the registry, probe
//! outcomes update hosts, and host verdicts plus interface usability decide
//! which routing tables are active.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-4: System Monitoring - Continuous reachability probing
//! - CP-8: Telecommunications Services - Route failover on uplink loss
//! - AU-12: Audit Record Generation - Verdict changes are logged

use crate::action::HostAction;
use crate::config::PinguConfig;
use crate::error::Result;
use crate::host::Host;
use crate::icmp;
use crate::iface::InterfaceRegistry;
use crate::netlink::KernelEvent;
use crate::route::{RouteController, RouteKernel};
use crate::snapshot::{HostSnapshot, InterfaceSnapshot, Snapshot};
use crate::socket::SocketFactory;
use crate::timer::{TimerKey, TimerQueue};
use crate::types::{HostId, HostState, IfaceId, ProbeOutcome, TableState};
use std::io;
use std::os::fd::RawFd;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Datagrams read from one socket before yielding back to the reactor
pub const MAX_DATAGRAMS_PER_READ: usize = 64;

/// Receive buffer size; replies carry a short fixed payload
const RECV_BUFFER_SIZE: usize = 2048;

/// The link-health and route-failover engine
pub struct Monitor {
    registry: InterfaceRegistry,
    hosts: Vec<Host>,
    routes: RouteController,
    timers: TimerQueue,
    kernel: Box<dyn RouteKernel>,
    actions: Vec<HostAction>,
    /// Tables are left alone until [`Monitor::start`] asserts them
    started: bool,
}

impl Monitor {
    /// Build the engine from a validated configuration
    ///
    /// Opens one socket per interface through `factory`; failing to open one
    /// is fatal.
    pub fn new(
        config: &PinguConfig,
        factory: &mut dyn SocketFactory,
        kernel: Box<dyn RouteKernel>,
    ) -> Result<Self> {
        Self::with_ident_base(config, factory, kernel, std::process::id() as u16)
    }

    /// Like [`Monitor::new`], with host echo identifiers counted from `ident_base`
    pub fn with_ident_base(
        config: &PinguConfig,
        factory: &mut dyn SocketFactory,
        kernel: Box<dyn RouteKernel>,
        ident_base: u16,
    ) -> Result<Self> {
        let mut registry = InterfaceRegistry::new(config.daemon.rule_priority_base);
        let host_ifaces = registry.resolve(config, factory)?;

        let mut hosts = Vec::with_capacity(config.hosts.len());
        for (id, (host_config, iface)) in config.hosts.iter().zip(host_ifaces).enumerate() {
            let ident = ident_base.wrapping_add(id as u16);
            let host = Host::new(host_config, &config.probe, iface, ident);
            debug!(
                host = %host.address,
                label = %host.label,
                iface = %registry.get(iface).display_name(),
                ident,
                "Monitoring host"
            );
            registry.attach_host(iface, id);
            hosts.push(host);
        }

        let mut routes = RouteController::new(config.route.retry_policy());
        for (id, iface) in registry.iter() {
            routes.register(id, iface.route_table, iface.rule_priority);
        }

        Ok(Self {
            registry,
            hosts,
            routes,
            timers: TimerQueue::new(),
            kernel,
            actions: Vec::new(),
            started: false,
        })
    }

    /// Schedule the first probe of every host and assert the initial table state
    ///
    /// Tables start from a forced request so a rule left behind by an earlier
    /// run is cleaned up.
    pub fn start(&mut self, now: Instant) {
        self.started = true;
        for id in 0..self.hosts.len() {
            self.timers.arm(TimerKey::Probe(id), now);
        }
        for id in 0..self.registry.len() {
            self.reconcile(id, true, now);
        }
        info!(
            hosts = self.hosts.len(),
            interfaces = self.registry.len(),
            "Monitor started"
        );
    }

    pub fn registry(&self) -> &InterfaceRegistry {
        &self.registry
    }

    pub fn routes(&self) -> &RouteController {
        &self.routes
    }

    pub fn timers(&self) -> &TimerQueue {
        &self.timers
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn host(&self, id: HostId) -> &Host {
        &self.hosts[id]
    }

    /// Sockets the reactor should watch for readability
    pub fn socket_fds(&self) -> Vec<(IfaceId, RawFd)> {
        self.registry
            .iter()
            .filter_map(|(id, iface)| iface.socket().raw_fd().map(|fd| (id, fd)))
            .collect()
    }

    /// Earliest pending timer
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Fire every timer due at `now`
    pub fn on_timer(&mut self, now: Instant) {
        for key in self.timers.pop_expired(now) {
            match key {
                TimerKey::Probe(host) => self.send_probe(host, now),
                TimerKey::Timeout(host) => self.on_probe_timeout(host, now),
                TimerKey::RouteRetry(iface) => {
                    self.routes
                        .on_retry_timer(iface, self.kernel.as_mut(), &mut self.timers, now)
                }
            }
        }
    }

    /// Send one echo request to `host`
    ///
    /// Hosts on an unusable interface are not probed; the attempt counts as a
    /// failure without touching the socket.
    pub fn send_probe(&mut self, host: HostId, now: Instant) {
        let iface_id = self.hosts[host].iface;
        let iface = self.registry.get(iface_id);
        let h = &mut self.hosts[host];

        if h.outstanding().is_some() {
            trace!(host = %h.address, "Probe still outstanding, not sending another");
            return;
        }

        if !iface.usable() {
            debug!(
                host = %h.address,
                iface = %iface.display_name(),
                "Interface not usable, skipping probe"
            );
            h.skip_probe(now);
            self.handle_outcome(host, ProbeOutcome::Failure, now);
            return;
        }

        let seq = h.begin_probe(now);
        let packet = icmp::build_echo_request(h.ident, seq);
        match iface.socket().send_to(&packet, h.address) {
            Ok(_) => {
                trace!(host = %h.address, ident = h.ident, seq, "Sent echo request");
                let deadline = now + h.settings.timeout;
                self.timers.arm(TimerKey::Timeout(host), deadline);
            }
            Err(e) => {
                warn!(
                    host = %h.address,
                    iface = %iface.display_name(),
                    error = %e,
                    "Failed to send echo request"
                );
                h.abort_probe();
                self.handle_outcome(host, ProbeOutcome::Failure, now);
            }
        }
    }

    fn on_probe_timeout(&mut self, host: HostId, now: Instant) {
        let h = &mut self.hosts[host];
        if !h.take_timeout() {
            return;
        }
        debug!(host = %h.address, label = %h.label, "Probe timed out");
        self.handle_outcome(host, ProbeOutcome::Failure, now);
    }

    /// Read pending datagrams from an interface socket
    ///
    /// Returns true when the socket was drained (`WouldBlock`), false when
    /// the per-call limit was hit and data may remain.
    pub fn on_socket_readable(&mut self, iface: IfaceId, now: Instant) -> bool {
        let mut buf = [0u8; RECV_BUFFER_SIZE];

        for _ in 0..MAX_DATAGRAMS_PER_READ {
            let (len, source) = match self.registry.get(iface).socket().recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(
                        iface = %self.registry.get(iface).display_name(),
                        error = %e,
                        "Failed to read ICMP socket"
                    );
                    return true;
                }
            };

            let Some(reply) = icmp::parse_echo_reply(&buf[..len], source) else {
                trace!(source = %source, len, "Dropping non echo reply datagram");
                continue;
            };

            let matched = self.registry.get(iface).hosts.iter().copied().find(|&id| {
                let h = &self.hosts[id];
                h.ident == reply.ident && h.address == reply.source
            });
            let Some(host) = matched else {
                trace!(source = %reply.source, ident = reply.ident, "Dropping foreign echo reply");
                continue;
            };

            match self.hosts[host].take_reply(reply.seq, now) {
                Some(rtt) => {
                    self.timers.cancel(TimerKey::Timeout(host));
                    trace!(
                        host = %reply.source,
                        seq = reply.seq,
                        rtt_us = rtt.as_micros() as u64,
                        "Echo reply"
                    );
                    self.handle_outcome(host, ProbeOutcome::Success { rtt }, now);
                }
                None => {
                    trace!(host = %reply.source, seq = reply.seq, "Dropping stale echo reply");
                }
            }
        }

        false
    }

    fn handle_outcome(&mut self, host: HostId, outcome: ProbeOutcome, now: Instant) {
        let transition = self.hosts[host].record_outcome(outcome);

        if let Some(t) = transition {
            let h = &self.hosts[host];
            let iface_name = self.registry.get(h.iface).name.clone();
            info!(
                host = %h.address,
                label = %h.label,
                iface = %self.registry.get(h.iface).display_name(),
                from = %t.from,
                to = %t.to,
                "Host state changed"
            );

            if let Some(command) = h.action_for(t.to) {
                self.actions.push(HostAction {
                    command: command.to_string(),
                    label: h.label.clone(),
                    address: h.address,
                    state: t.to,
                    iface: iface_name,
                });
            }

            self.on_host_verdict_changed(host, now);
        }

        let next = self.hosts[host].next_probe_at(now);
        self.timers.arm(TimerKey::Probe(host), next);
    }

    /// Re-evaluate the table of the host's interface after a verdict change
    pub fn on_host_verdict_changed(&mut self, host: HostId, now: Instant) {
        let iface = self.hosts[host].iface;
        self.reconcile(iface, false, now);
    }

    /// Whether the table of `iface` should be active
    pub fn desired_active(&self, iface: IfaceId) -> bool {
        let i = self.registry.get(iface);
        i.usable() && (!i.health_gated || self.any_host_up(iface))
    }

    fn any_host_up(&self, iface: IfaceId) -> bool {
        self.registry
            .get(iface)
            .hosts
            .iter()
            .any(|&h| self.hosts[h].state() == HostState::Up)
    }

    fn reconcile(&mut self, iface: IfaceId, force: bool, now: Instant) {
        if !self.started {
            return;
        }
        let desired = self.desired_active(iface);
        self.routes.reconcile(
            iface,
            desired,
            force,
            self.kernel.as_mut(),
            &mut self.timers,
            now,
        );
    }

    /// Dispatch a decoded kernel message
    pub fn on_kernel_event(&mut self, event: KernelEvent, now: Instant) {
        match event {
            KernelEvent::Link {
                index,
                name,
                has_link,
            } => self.on_link_change(index, name.as_deref(), has_link, now),
            KernelEvent::Address {
                index,
                family,
                bytes,
                removed: false,
            } => self.on_address_change(index, family, &bytes),
            KernelEvent::Address {
                index,
                family,
                bytes,
                removed: true,
            } => self.on_address_removed(index, family, &bytes),
            KernelEvent::Ack { seq, errno } => {
                self.routes.on_ack(seq, errno, &mut self.timers, now);
            }
            KernelEvent::Overrun => self.on_kernel_overrun(now),
        }
    }

    /// Re-assert every table after kernel messages were lost
    ///
    /// Acknowledgments of in-flight requests may be gone; a forced request
    /// per table starts a new generation and drops the orphaned ones.
    pub fn on_kernel_overrun(&mut self, now: Instant) {
        if !self.started {
            return;
        }
        warn!(
            pending = self.routes.pending_requests(),
            "Kernel messages lost, re-asserting route tables"
        );
        for id in 0..self.registry.len() {
            self.reconcile(id, true, now);
        }
    }

    /// Apply a link notification
    pub fn on_link_change(&mut self, index: u32, name: Option<&str>, has_link: bool, now: Instant) {
        let by_name = name
            .filter(|n| !n.is_empty())
            .and_then(|n| self.registry.lookup_by_name(n));
        let id = match by_name {
            Some(id) => {
                self.registry.set_index(id, index);
                id
            }
            None => match self.registry.lookup_by_kernel_index(index) {
                Some(id) => id,
                None => {
                    trace!(index, name, "Ignoring link event for unmonitored interface");
                    return;
                }
            },
        };

        let iface = self.registry.get_mut(id);
        let was_usable = iface.usable();
        let had_link = iface.has_link;
        iface.has_link = has_link;

        if had_link != has_link {
            info!(iface = %iface.display_name(), index, has_link, "Link state changed");
        }
        // The device may have been re-created under a new index, or an
        // earlier bind failed; every link-up notification binds again
        if has_link {
            self.registry.bind_to_device(id, true);
        }

        let usable = self.registry.get(id).usable();
        if usable && !was_usable {
            info!(iface = %self.registry.get(id).display_name(), "Interface usable");
            let force = self.any_host_up(id);
            self.reconcile(id, force, now);
        } else if !usable && was_usable {
            info!(iface = %self.registry.get(id).display_name(), "Interface no longer usable");
            self.reconcile(id, false, now);
        }
    }

    /// Apply an address notification
    pub fn on_address_change(&mut self, index: u32, family: u8, bytes: &[u8]) {
        match self.registry.lookup_by_kernel_index(index) {
            Some(id) => self.registry.set_address(id, family, bytes),
            None => trace!(index, "Ignoring address event for unmonitored interface"),
        }
    }

    /// Apply an address removal; only the tracked address is cleared
    pub fn on_address_removed(&mut self, index: u32, family: u8, bytes: &[u8]) {
        match self.registry.lookup_by_kernel_index(index) {
            Some(id) => self.registry.remove_address(id, family, bytes),
            None => trace!(index, "Ignoring address event for unmonitored interface"),
        }
    }

    /// Host actions produced since the last call
    pub fn take_actions(&mut self) -> Vec<HostAction> {
        std::mem::take(&mut self.actions)
    }

    /// Stop probing and deactivate every table requested active
    ///
    /// Returns the number of deactivation requests sent.
    pub fn shutdown(&mut self, now: Instant) -> usize {
        for id in 0..self.hosts.len() {
            self.timers.cancel(TimerKey::Probe(id));
            self.timers.cancel(TimerKey::Timeout(id));
        }
        let sent = self
            .routes
            .shutdown(self.kernel.as_mut(), &mut self.timers, now);
        for id in 0..self.registry.len() {
            self.timers.cancel(TimerKey::RouteRetry(id));
        }
        info!(deactivated = sent, "Monitor stopped");
        sent
    }

    /// Current state for the admin channel
    pub fn snapshot(&self) -> Snapshot {
        let hosts = self
            .hosts
            .iter()
            .map(|h| HostSnapshot {
                label: h.label.clone(),
                address: h.address,
                interface: self.registry.get(h.iface).name.clone(),
                state: h.state(),
                consecutive_successes: h.consecutive_successes(),
                consecutive_failures: h.consecutive_failures(),
                last_rtt_ms: h.last_rtt().map(|d| d.as_secs_f64() * 1000.0),
                probes_sent: h.probes_sent(),
                replies: h.replies(),
                last_change: h.last_change(),
            })
            .collect();

        let interfaces = self
            .registry
            .iter()
            .map(|(id, i)| {
                let desired = TableState::from_active(self.desired_active(id));
                let applied = self.routes.applied(id).map(TableState::from_active);
                InterfaceSnapshot {
                    name: i.name.clone(),
                    index: i.index,
                    has_link: i.has_link,
                    has_binding: i.has_binding,
                    usable: i.usable(),
                    address: i.primary_address,
                    route_table: i.route_table,
                    rule_priority: i.rule_priority,
                    health_gated: i.health_gated,
                    desired,
                    applied,
                    in_sync: applied == Some(desired),
                }
            })
            .collect();

        Snapshot { hosts, interfaces }
    }
}
