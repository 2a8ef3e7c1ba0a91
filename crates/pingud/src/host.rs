//! Host reachability state machine
//!
//! A [`Host`] consumes probe outcomes and turns them into UP/DOWN verdicts
//! once the debounce thresholds are reached. It also decides when the next
//! probe is due: outcomes that contradict the current verdict switch the host
//! into a burst of closely spaced probes so a real change is confirmed fast.
//!
//! The host knows nothing about sockets or routing tables. The monitor feeds
//! it outcomes and acts on the transitions it returns.

use crate::config::{HostConfig, ProbeDefaults, ProbeSettings};
use crate::types::{HostState, IfaceId, ProbeOutcome, Transition};
use chrono::{DateTime, Utc};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

/// An echo request waiting for its reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutstandingProbe {
    pub seq: u16,
    pub sent_at: Instant,
}

/// A monitored destination
#[derive(Debug, Clone)]
pub struct Host {
    /// Target address
    pub address: Ipv4Addr,
    /// Display name
    pub label: String,
    /// Interface the host is probed through
    pub iface: IfaceId,
    /// Echo identifier used for every probe of this host
    pub ident: u16,
    /// Resolved probe parameters
    pub settings: ProbeSettings,
    /// Command run when the host goes up
    pub up_action: Option<String>,
    /// Command run when the host goes down
    pub down_action: Option<String>,

    state: HostState,
    successes: u32,
    failures: u32,
    next_seq: u16,
    outstanding: Option<OutstandingProbe>,
    last_rtt: Option<Duration>,
    probes_sent: u64,
    replies: u64,
    last_attempt: Option<Instant>,
    last_change: Option<DateTime<Utc>>,
    burst_probes: u32,
}

impl Host {
    pub fn new(config: &HostConfig, defaults: &ProbeDefaults, iface: IfaceId, ident: u16) -> Self {
        Self {
            address: config.address,
            label: config.display_label(),
            iface,
            ident,
            settings: config.probe_settings(defaults),
            up_action: config.up_action.clone(),
            down_action: config.down_action.clone(),
            state: HostState::Unknown,
            successes: 0,
            failures: 0,
            next_seq: 0,
            outstanding: None,
            last_rtt: None,
            probes_sent: 0,
            replies: 0,
            last_attempt: None,
            last_change: None,
            burst_probes: 0,
        }
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.successes
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    pub fn probes_sent(&self) -> u64 {
        self.probes_sent
    }

    pub fn replies(&self) -> u64 {
        self.replies
    }

    pub fn last_change(&self) -> Option<DateTime<Utc>> {
        self.last_change
    }

    pub fn outstanding(&self) -> Option<OutstandingProbe> {
        self.outstanding
    }

    /// True while probes are spaced by the burst interval
    pub fn in_burst(&self) -> bool {
        self.burst_probes > 0 && self.burst_probes < self.settings.burst_max_probes
    }

    /// Note a probe attempt that never reached the socket
    pub fn skip_probe(&mut self, now: Instant) {
        self.last_attempt = Some(now);
    }

    /// Allocate the next sequence number and record the probe as outstanding
    pub fn begin_probe(&mut self, now: Instant) -> u16 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.outstanding = Some(OutstandingProbe { seq, sent_at: now });
        self.last_attempt = Some(now);
        self.probes_sent += 1;
        seq
    }

    /// Drop the outstanding probe after a failed send
    pub fn abort_probe(&mut self) {
        self.outstanding = None;
    }

    /// Claim the outstanding probe for a reply with sequence `seq`
    ///
    /// Returns the round-trip time, or `None` when `seq` is not the
    /// outstanding probe (a stale or foreign reply).
    pub fn take_reply(&mut self, seq: u16, now: Instant) -> Option<Duration> {
        let probe = self.outstanding.filter(|p| p.seq == seq)?;
        self.outstanding = None;
        self.replies += 1;
        Some(now.saturating_duration_since(probe.sent_at))
    }

    /// Claim the outstanding probe on timeout; false if it was already answered
    pub fn take_timeout(&mut self) -> bool {
        self.outstanding.take().is_some()
    }

    /// Feed one probe outcome through the state machine
    pub fn record_outcome(&mut self, outcome: ProbeOutcome) -> Option<Transition> {
        let from = self.state;
        match outcome {
            ProbeOutcome::Success { rtt } => {
                self.last_rtt = Some(rtt);
                self.successes = self.successes.saturating_add(1);
                self.failures = 0;
                if self.state != HostState::Up && self.successes >= self.settings.up_threshold {
                    self.state = HostState::Up;
                }
            }
            ProbeOutcome::Failure => {
                self.failures = self.failures.saturating_add(1);
                self.successes = 0;
                if self.state != HostState::Down && self.failures >= self.settings.down_threshold
                {
                    self.state = HostState::Down;
                }
            }
        }

        if self.state != from {
            self.burst_probes = 0;
            self.last_change = Some(Utc::now());
            return Some(Transition {
                from,
                to: self.state,
            });
        }

        let contradicts = match outcome {
            ProbeOutcome::Success { .. } => self.state != HostState::Up,
            ProbeOutcome::Failure => self.state != HostState::Down,
        };
        if contradicts {
            self.burst_probes = self.burst_probes.saturating_add(1);
        } else {
            self.burst_probes = 0;
        }
        None
    }

    /// When the next probe should be sent, given an outcome just processed at `now`
    pub fn next_probe_at(&self, now: Instant) -> Instant {
        if self.in_burst() {
            return now + self.settings.burst_interval;
        }
        match self.last_attempt {
            Some(last) => (last + self.settings.interval).max(now),
            None => now,
        }
    }

    /// Action command for a verdict, if configured
    pub fn action_for(&self, state: HostState) -> Option<&str> {
        match state {
            HostState::Up => self.up_action.as_deref(),
            HostState::Down => self.down_action.as_deref(),
            HostState::Unknown => None,
        }
    }
}
