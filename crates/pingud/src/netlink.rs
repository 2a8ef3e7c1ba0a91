//! Netlink socket handling for link, address and rule events
//!
//! A single `NETLINK_ROUTE` socket subscribes to link and IPv4 address
//! notifications, runs the initial link/address dumps and carries the
//! `RTM_NEWRULE`/`RTM_DELRULE` requests issued by the route controller. The
//! kernel's acknowledgments of those requests come back on the same socket.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SC-7: Boundary Protection - Kernel interface for routing policy
//! - SI-4: System Monitoring - Monitor link and address changes
//! - AU-12: Audit Record Generation - Log kernel request failures

/// A decoded kernel message relevant to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelEvent {
    /// Link added or changed (`has_link` false on removal)
    Link {
        index: u32,
        name: Option<String>,
        has_link: bool,
    },
    /// Address added, or removed when `removed` is set
    Address {
        index: u32,
        family: u8,
        bytes: Vec<u8>,
        removed: bool,
    },
    /// Acknowledgment of a request; `errno` is 0 on success
    Ack { seq: u32, errno: i32 },
    /// The receive buffer overran; notifications and acknowledgments may
    /// have been lost
    Overrun,
}

/// Sequence numbers at or above this value belong to dump requests
pub const DUMP_SEQ_BASE: u32 = 0x8000_0000;

#[cfg(target_os = "linux")]
mod linux {
    use super::{DUMP_SEQ_BASE, KernelEvent};
    use crate::error::{PinguError, Result};
    use crate::route::{RouteKernel, RuleOp, RuleRequest};
    use netlink_packet_core::{
        NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP, NLM_F_EXCL, NLM_F_REQUEST, NetlinkHeader,
        NetlinkMessage, NetlinkPayload,
    };
    use netlink_packet_route::address::{AddressAttribute, AddressMessage};
    use netlink_packet_route::link::{LinkAttribute, LinkFlags, LinkMessage};
    use netlink_packet_route::rule::{RuleAction, RuleAttribute, RuleMessage};
    use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
    use netlink_sys::{Socket, SocketAddr, protocols::NETLINK_ROUTE};
    use std::io;
    use std::net::IpAddr;
    use std::os::fd::{AsRawFd, RawFd};
    use std::sync::Arc;
    use tracing::{debug, instrument, trace, warn};

    /// Multicast group for link notifications
    const RTMGRP_LINK: u32 = 0x1;

    /// Multicast group for IPv4 address notifications
    const RTMGRP_IPV4_IFADDR: u32 = 0x10;

    /// Socket receive buffer size (256KB)
    /// NIST: SC-5 - Adequate buffering for link flaps
    const SOCKET_RECV_BUFFER_SIZE: usize = 256 * 1024;

    /// Receive buffer capacity
    const RECV_BUFFER_CAPACITY: usize = 65536;

    /// Initial dumps, run one at a time on the socket
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum DumpStage {
        Links,
        Addresses,
        Done,
    }

    /// Serialize a route netlink message
    fn serialize(header: NetlinkHeader, payload: RouteNetlinkMessage) -> Vec<u8> {
        let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(payload));
        packet.finalize();
        let mut buf = vec![0u8; packet.buffer_len()];
        packet.serialize(&mut buf);
        buf
    }

    /// Build the `RTM_NEWRULE`/`RTM_DELRULE` message for a request
    pub fn rule_message(request: &RuleRequest) -> Vec<u8> {
        let mut rule = RuleMessage::default();
        rule.header.family = AddressFamily::Inet;
        rule.header.action = RuleAction::ToTable;
        if request.table < 256 {
            rule.header.table = request.table as u8;
        }
        rule.attributes.push(RuleAttribute::Table(request.table));
        rule.attributes.push(RuleAttribute::Priority(request.priority));

        let mut header = NetlinkHeader::default();
        header.sequence_number = request.seq;
        let payload = match request.op {
            RuleOp::Add => {
                header.flags = NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL;
                RouteNetlinkMessage::NewRule(rule)
            }
            RuleOp::Delete => {
                header.flags = NLM_F_REQUEST | NLM_F_ACK;
                RouteNetlinkMessage::DelRule(rule)
            }
        };
        serialize(header, payload)
    }

    /// Decode every message in a receive buffer
    ///
    /// Acknowledgments of dump requests are returned as `Ack` events too;
    /// callers filter them by sequence number.
    pub fn parse_buffer(buf: &[u8]) -> Vec<KernelEvent> {
        let mut events = Vec::new();
        let mut offset = 0;

        while offset < buf.len() {
            let msg = match NetlinkMessage::<RouteNetlinkMessage>::deserialize(&buf[offset..]) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(error = %e, offset, "Failed to parse netlink message");
                    break;
                }
            };

            let length = msg.header.length as usize;
            if length == 0 {
                break;
            }
            // Align to 4 bytes (netlink alignment requirement)
            offset += (length + 3) & !3;

            if let Some(event) = parse_message(msg) {
                events.push(event);
            }
        }

        events
    }

    fn parse_message(msg: NetlinkMessage<RouteNetlinkMessage>) -> Option<KernelEvent> {
        let seq = msg.header.sequence_number;
        match msg.payload {
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewLink(link)) => {
                Some(link_event(&link, true))
            }
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelLink(link)) => {
                Some(link_event(&link, false))
            }
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewAddress(addr)) => {
                address_event(&addr, true)
            }
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelAddress(addr)) => {
                address_event(&addr, false)
            }
            NetlinkPayload::Error(err) => Some(KernelEvent::Ack {
                seq,
                errno: err.code.map(|c| -c.get()).unwrap_or(0),
            }),
            NetlinkPayload::Done(_) => Some(KernelEvent::Ack { seq, errno: 0 }),
            _ => {
                trace!(seq, "Ignoring netlink message");
                None
            }
        }
    }

    fn link_event(link: &LinkMessage, present: bool) -> KernelEvent {
        let name = link.attributes.iter().find_map(|attr| match attr {
            LinkAttribute::IfName(name) => Some(name.clone()),
            _ => None,
        });
        let has_link = present
            && link.header.flags.contains(LinkFlags::Up)
            && link.header.flags.contains(LinkFlags::Running);

        KernelEvent::Link {
            index: link.header.index,
            name,
            has_link,
        }
    }

    fn address_event(addr: &AddressMessage, present: bool) -> Option<KernelEvent> {
        // IFA_LOCAL is the interface's own address; IFA_ADDRESS is the peer on p2p links
        let local = addr.attributes.iter().find_map(|attr| match attr {
            AddressAttribute::Local(ip) => Some(*ip),
            _ => None,
        });
        let address = local.or_else(|| {
            addr.attributes.iter().find_map(|attr| match attr {
                AddressAttribute::Address(ip) => Some(*ip),
                _ => None,
            })
        });

        let (family, bytes) = match address {
            Some(IpAddr::V4(v4)) => (libc::AF_INET as u8, v4.octets().to_vec()),
            Some(IpAddr::V6(v6)) => (libc::AF_INET6 as u8, v6.octets().to_vec()),
            None => {
                trace!(index = addr.header.index, "Address message without address");
                return None;
            }
        };

        Some(KernelEvent::Address {
            index: addr.header.index,
            family,
            bytes,
            removed: !present,
        })
    }

    fn send_message(socket: &Socket, buf: &[u8]) -> io::Result<()> {
        let kernel = SocketAddr::new(0, 0);
        socket.send_to(buf, &kernel, 0)?;
        Ok(())
    }

    /// Netlink socket for kernel notifications and acknowledgments
    ///
    /// # NIST Controls
    /// - SC-7: Boundary Protection - Kernel netlink interface
    /// - SI-4: System Monitoring - Event-driven monitoring
    pub struct NetlinkChannel {
        socket: Arc<Socket>,
        buffer: Vec<u8>,
        dump_stage: DumpStage,
        dump_seq: u32,
    }

    impl NetlinkChannel {
        /// Create and bind the socket to the link and IPv4 address groups
        ///
        /// # NIST Controls
        /// - AC-3: Access Enforcement - Rule changes require CAP_NET_ADMIN
        #[instrument]
        pub fn new() -> Result<Self> {
            let mut socket = Socket::new(NETLINK_ROUTE)
                .map_err(|e| PinguError::Netlink(format!("Failed to create socket: {}", e)))?;

            let addr = SocketAddr::new(0, RTMGRP_LINK | RTMGRP_IPV4_IFADDR);
            socket
                .bind(&addr)
                .map_err(|e| PinguError::Netlink(format!("Failed to bind socket: {}", e)))?;
            socket
                .set_non_blocking(true)
                .map_err(|e| PinguError::Netlink(format!("Failed to set non-blocking: {}", e)))?;

            debug!("Netlink socket bound to RTMGRP_LINK | RTMGRP_IPV4_IFADDR");

            let channel = Self {
                socket: Arc::new(socket),
                buffer: Vec::with_capacity(RECV_BUFFER_CAPACITY),
                dump_stage: DumpStage::Done,
                dump_seq: DUMP_SEQ_BASE,
            };
            channel.tune_socket();
            Ok(channel)
        }

        fn tune_socket(&self) {
            let fd = self.socket.as_raw_fd();
            let size = SOCKET_RECV_BUFFER_SIZE as libc::c_int;
            // SAFETY: fd is a valid socket and size outlives the call
            let ret = unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_RCVBUF,
                    &size as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if ret < 0 {
                warn!("Failed to set SO_RCVBUF, using default buffer size");
            } else {
                debug!(size = SOCKET_RECV_BUFFER_SIZE, "Set socket receive buffer");
            }
        }

        /// Get the raw file descriptor for async polling
        pub fn as_raw_fd(&self) -> RawFd {
            self.socket.as_raw_fd()
        }

        /// Route request transport sharing this socket
        pub fn route_kernel(&self) -> NetlinkRouteKernel {
            NetlinkRouteKernel {
                socket: Arc::clone(&self.socket),
            }
        }

        /// True once the initial link and address dumps have been answered
        pub fn dump_complete(&self) -> bool {
            self.dump_stage == DumpStage::Done
        }

        /// Start the link dump; the address dump follows when it completes
        #[instrument(skip(self))]
        pub fn request_dump(&mut self) -> Result<()> {
            self.send_dump(DumpStage::Links)
        }

        fn next_dump_seq(&mut self) -> u32 {
            self.dump_seq = self.dump_seq.wrapping_add(1).max(DUMP_SEQ_BASE);
            self.dump_seq
        }

        fn send_dump(&mut self, stage: DumpStage) -> Result<()> {
            let mut header = NetlinkHeader::default();
            header.flags = NLM_F_REQUEST | NLM_F_DUMP;
            let seq = self.next_dump_seq();
            header.sequence_number = seq;

            let payload = match stage {
                DumpStage::Links => RouteNetlinkMessage::GetLink(LinkMessage::default()),
                DumpStage::Addresses => {
                    let mut addr = AddressMessage::default();
                    addr.header.family = AddressFamily::Inet;
                    RouteNetlinkMessage::GetAddress(addr)
                }
                DumpStage::Done => return Ok(()),
            };

            send_message(&self.socket, &serialize(header, payload))
                .map_err(|e| PinguError::Netlink(format!("Failed to send dump request: {}", e)))?;
            self.dump_stage = stage;
            debug!(stage = ?stage, seq, "Requested netlink dump");
            Ok(())
        }

        /// Receive one buffer of events without blocking
        ///
        /// Returns Ok(None) when no data is available.
        #[instrument(skip(self), level = "trace")]
        pub fn try_recv(&mut self) -> Result<Option<Vec<KernelEvent>>> {
            self.buffer.clear();
            match self.socket.recv(&mut self.buffer, libc::MSG_DONTWAIT) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                    // Notifications were dropped; start over from a fresh dump
                    warn!("Netlink receive buffer overrun, requesting new dump");
                    self.request_dump()?;
                    return Ok(Some(vec![KernelEvent::Overrun]));
                }
                Err(e) => {
                    return Err(PinguError::Netlink(format!("Failed to receive: {}", e)));
                }
            }

            let mut events = parse_buffer(&self.buffer);
            let mut dump_finished = false;
            events.retain(|event| match event {
                KernelEvent::Ack { seq, errno } if *seq >= DUMP_SEQ_BASE => {
                    if *seq == self.dump_seq {
                        if *errno != 0 {
                            warn!(seq, errno, "Netlink dump failed");
                        }
                        dump_finished = true;
                    }
                    false
                }
                _ => true,
            });

            if dump_finished {
                match self.dump_stage {
                    DumpStage::Links => self.send_dump(DumpStage::Addresses)?,
                    DumpStage::Addresses => {
                        debug!("Initial netlink dump complete");
                        self.dump_stage = DumpStage::Done;
                    }
                    DumpStage::Done => {}
                }
            }

            trace!(count = events.len(), "Received netlink events");
            Ok(Some(events))
        }
    }

    /// [`RouteKernel`] sending rule requests over the shared netlink socket
    pub struct NetlinkRouteKernel {
        socket: Arc<Socket>,
    }

    impl RouteKernel for NetlinkRouteKernel {
        fn submit(&mut self, request: &RuleRequest) -> io::Result<()> {
            send_message(&self.socket, &rule_message(request))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use pretty_assertions::assert_eq;

        fn message_bytes(header: NetlinkHeader, payload: RouteNetlinkMessage) -> Vec<u8> {
            serialize(header, payload)
        }

        #[test]
        fn test_parse_link_up() {
            let mut link = LinkMessage::default();
            link.header.index = 3;
            link.header.flags = LinkFlags::Up | LinkFlags::Running;
            link.attributes.push(LinkAttribute::IfName("eth0".to_string()));
            let buf = message_bytes(NetlinkHeader::default(), RouteNetlinkMessage::NewLink(link));

            assert_eq!(
                parse_buffer(&buf),
                vec![KernelEvent::Link {
                    index: 3,
                    name: Some("eth0".to_string()),
                    has_link: true
                }]
            );
        }

        #[test]
        fn test_parse_link_admin_up_without_carrier() {
            let mut link = LinkMessage::default();
            link.header.index = 4;
            link.header.flags = LinkFlags::Up;
            let buf = message_bytes(NetlinkHeader::default(), RouteNetlinkMessage::NewLink(link));

            assert_eq!(
                parse_buffer(&buf),
                vec![KernelEvent::Link {
                    index: 4,
                    name: None,
                    has_link: false
                }]
            );
        }

        #[test]
        fn test_parse_dellink() {
            let mut link = LinkMessage::default();
            link.header.index = 3;
            link.header.flags = LinkFlags::Up | LinkFlags::Running;
            let buf = message_bytes(NetlinkHeader::default(), RouteNetlinkMessage::DelLink(link));

            let events = parse_buffer(&buf);
            assert!(matches!(events[0], KernelEvent::Link { has_link: false, .. }));
        }

        #[test]
        fn test_parse_address() {
            let mut addr = AddressMessage::default();
            addr.header.family = AddressFamily::Inet;
            addr.header.index = 3;
            addr.attributes
                .push(AddressAttribute::Local("10.0.0.2".parse().unwrap()));
            let buf =
                message_bytes(NetlinkHeader::default(), RouteNetlinkMessage::NewAddress(addr.clone()));
            assert_eq!(
                parse_buffer(&buf),
                vec![KernelEvent::Address {
                    index: 3,
                    family: libc::AF_INET as u8,
                    bytes: vec![10, 0, 0, 2],
                    removed: false
                }]
            );

            let buf = message_bytes(NetlinkHeader::default(), RouteNetlinkMessage::DelAddress(addr));
            assert_eq!(
                parse_buffer(&buf),
                vec![KernelEvent::Address {
                    index: 3,
                    family: libc::AF_INET as u8,
                    bytes: vec![10, 0, 0, 2],
                    removed: true
                }]
            );
        }

        #[test]
        fn test_parse_multiple_messages() {
            let mut buf = Vec::new();
            for index in [1u32, 2] {
                let mut link = LinkMessage::default();
                link.header.index = index;
                link.attributes.push(LinkAttribute::IfName(format!("eth{}", index)));
                buf.extend(message_bytes(
                    NetlinkHeader::default(),
                    RouteNetlinkMessage::NewLink(link),
                ));
            }
            assert_eq!(parse_buffer(&buf).len(), 2);
        }

        #[test]
        fn test_parse_garbage() {
            assert!(parse_buffer(&[0xde, 0xad]).is_empty());
        }

        #[test]
        fn test_rule_message_add() {
            let request = RuleRequest {
                seq: 7,
                table: 10,
                priority: 1010,
                op: RuleOp::Add,
            };
            let buf = rule_message(&request);
            let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&buf).unwrap();

            assert_eq!(msg.header.sequence_number, 7);
            assert_eq!(
                msg.header.flags,
                NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL
            );
            let NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewRule(rule)) = msg.payload
            else {
                panic!("expected RTM_NEWRULE");
            };
            assert_eq!(rule.header.action, RuleAction::ToTable);
            assert_eq!(rule.header.table, 10);
            assert!(rule.attributes.contains(&RuleAttribute::Table(10)));
            assert!(rule.attributes.contains(&RuleAttribute::Priority(1010)));
        }

        #[test]
        fn test_rule_message_delete_large_table() {
            let request = RuleRequest {
                seq: 8,
                table: 1000,
                priority: 2000,
                op: RuleOp::Delete,
            };
            let buf = rule_message(&request);
            let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&buf).unwrap();

            assert_eq!(msg.header.flags, NLM_F_REQUEST | NLM_F_ACK);
            let NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelRule(rule)) = msg.payload
            else {
                panic!("expected RTM_DELRULE");
            };
            assert_eq!(rule.header.table, 0);
            assert!(rule.attributes.contains(&RuleAttribute::Table(1000)));
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::*;

/// Mock implementation for non-Linux platforms (development only)
#[cfg(not(target_os = "linux"))]
mod mock {
    use super::KernelEvent;
    use crate::error::Result;
    use crate::route::{RouteKernel, RuleRequest};
    use std::io;
    use std::os::fd::RawFd;

    pub struct NetlinkChannel;

    impl NetlinkChannel {
        pub fn new() -> Result<Self> {
            Ok(Self)
        }

        pub fn as_raw_fd(&self) -> RawFd {
            -1
        }

        pub fn route_kernel(&self) -> NetlinkRouteKernel {
            NetlinkRouteKernel
        }

        pub fn request_dump(&mut self) -> Result<()> {
            Ok(())
        }

        pub fn dump_complete(&self) -> bool {
            true
        }

        pub fn try_recv(&mut self) -> Result<Option<Vec<KernelEvent>>> {
            Ok(None)
        }
    }

    pub struct NetlinkRouteKernel;

    impl RouteKernel for NetlinkRouteKernel {
        fn submit(&mut self, _request: &RuleRequest) -> io::Result<()> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "policy rules are only available on Linux",
            ))
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use mock::*;
