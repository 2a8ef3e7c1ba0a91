//! Policy-route controller
//!
//! Turns the desired activation state of each interface's routing table into
//! `RTM_NEWRULE`/`RTM_DELRULE` requests and tracks them until the kernel
//! acknowledges them.
//!
//! Requests are keyed by netlink sequence number. Each request also carries
//! the generation of its interface at the time it was issued; only the
//! acknowledgment of the newest generation may change the applied state, so
//! acknowledgments arriving out of order cannot leave a stale state behind.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SC-7: Boundary Protection - Steer traffic away from failed uplinks
//! - CP-8: Telecommunications Services - Failover between providers
//! - SI-11: Error Handling - Transient kernel errors are retried

use crate::netlink::DUMP_SEQ_BASE;
use crate::timer::{TimerKey, TimerQueue};
use crate::types::IfaceId;
use std::collections::HashMap;
use std::io;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Direction of a rule request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOp {
    /// Install `lookup <table>`
    Add,
    /// Remove `lookup <table>`
    Delete,
}

impl RuleOp {
    fn from_active(activate: bool) -> Self {
        if activate { Self::Add } else { Self::Delete }
    }
}

/// One policy rule request handed to the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleRequest {
    pub seq: u32,
    pub table: u32,
    pub priority: u32,
    pub op: RuleOp,
}

/// Transport for rule requests
///
/// The kernel answers asynchronously; acknowledgments come back through
/// [`RouteController::on_ack`].
pub trait RouteKernel {
    fn submit(&mut self, request: &RuleRequest) -> io::Result<()>;
}

/// Retry behaviour for transient kernel errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per request, including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

/// Errors worth retrying
pub fn is_transient(errno: i32) -> bool {
    matches!(
        errno,
        libc::EBUSY | libc::EAGAIN | libc::ENOBUFS | libc::EINTR | libc::ENOMEM
    )
}

#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    iface: IfaceId,
    activate: bool,
    generation: u64,
    attempt: u32,
}

#[derive(Debug, Clone, Copy)]
struct ScheduledRetry {
    activate: bool,
    attempt: u32,
}

/// Controller view of one interface's table
#[derive(Debug, Clone, Default)]
struct TableTracker {
    table: u32,
    priority: u32,
    last_requested: Option<bool>,
    applied: Option<bool>,
    generation: u64,
    retry: Option<ScheduledRetry>,
}

/// Issues and tracks policy rule requests
#[derive(Debug)]
pub struct RouteController {
    tables: Vec<TableTracker>,
    pending: HashMap<u32, PendingRequest>,
    next_seq: u32,
    policy: RetryPolicy,
}

impl RouteController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            tables: Vec::new(),
            pending: HashMap::new(),
            next_seq: 1,
            policy,
        }
    }

    /// Register the table and rule priority of an interface
    pub fn register(&mut self, iface: IfaceId, table: u32, priority: u32) {
        if self.tables.len() <= iface {
            self.tables.resize_with(iface + 1, TableTracker::default);
        }
        let tracker = &mut self.tables[iface];
        tracker.table = table;
        tracker.priority = priority;
    }

    /// Last activation state requested for an interface
    pub fn last_requested(&self, iface: IfaceId) -> Option<bool> {
        self.tables.get(iface).and_then(|t| t.last_requested)
    }

    /// Activation state last acknowledged by the kernel
    pub fn applied(&self, iface: IfaceId) -> Option<bool> {
        self.tables.get(iface).and_then(|t| t.applied)
    }

    /// Number of requests awaiting an acknowledgment
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Request sequence numbers cycle through 1..DUMP_SEQ_BASE
    fn alloc_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq += 1;
        if self.next_seq >= DUMP_SEQ_BASE {
            self.next_seq = 1;
        }
        seq
    }

    /// Bring the table of `iface` towards `desired`
    ///
    /// Nothing is sent when `desired` equals the last requested state, unless
    /// `force` is set.
    pub fn reconcile(
        &mut self,
        iface: IfaceId,
        desired: bool,
        force: bool,
        kernel: &mut dyn RouteKernel,
        timers: &mut TimerQueue,
        now: Instant,
    ) {
        let Some(tracker) = self.tables.get(iface) else {
            warn!(iface, "Route reconcile for unregistered interface");
            return;
        };
        if !force && tracker.last_requested == Some(desired) {
            return;
        }
        self.issue(iface, desired, 1, kernel, timers, now);
    }

    fn issue(
        &mut self,
        iface: IfaceId,
        activate: bool,
        attempt: u32,
        kernel: &mut dyn RouteKernel,
        timers: &mut TimerQueue,
        now: Instant,
    ) {
        let seq = self.alloc_seq();
        let tracker = &mut self.tables[iface];
        tracker.last_requested = Some(activate);
        tracker.generation += 1;
        tracker.retry = None;
        timers.cancel(TimerKey::RouteRetry(iface));

        let request = RuleRequest {
            seq,
            table: tracker.table,
            priority: tracker.priority,
            op: RuleOp::from_active(activate),
        };
        let generation = tracker.generation;

        // Acknowledgments of earlier requests no longer matter, and may never come
        self.pending.retain(|_, p| p.iface != iface);

        match kernel.submit(&request) {
            Ok(()) => {
                debug!(
                    table = request.table,
                    priority = request.priority,
                    seq,
                    op = ?request.op,
                    attempt,
                    "Submitted rule request"
                );
                self.pending.insert(
                    seq,
                    PendingRequest {
                        iface,
                        activate,
                        generation,
                        attempt,
                    },
                );
            }
            Err(e) => {
                warn!(
                    table = request.table,
                    seq,
                    error = %e,
                    "Failed to send rule request"
                );
                self.schedule_retry(iface, activate, attempt, timers, now);
            }
        }
    }

    fn schedule_retry(
        &mut self,
        iface: IfaceId,
        activate: bool,
        attempt: u32,
        timers: &mut TimerQueue,
        now: Instant,
    ) {
        let tracker = &mut self.tables[iface];
        if attempt >= self.policy.max_attempts {
            error!(
                table = tracker.table,
                attempts = attempt,
                "Giving up on rule request"
            );
            return;
        }
        let delay = self.policy.backoff(attempt);
        tracker.retry = Some(ScheduledRetry {
            activate,
            attempt: attempt + 1,
        });
        timers.arm(TimerKey::RouteRetry(iface), now + delay);
        debug!(table = tracker.table, delay_ms = delay.as_millis() as u64, "Scheduled rule retry");
    }

    /// Handle a kernel acknowledgment; `errno` is 0 on success
    ///
    /// Returns true when the applied state of an interface changed.
    pub fn on_ack(&mut self, seq: u32, errno: i32, timers: &mut TimerQueue, now: Instant) -> bool {
        let Some(request) = self.pending.remove(&seq) else {
            trace!(seq, errno, "Ignoring acknowledgment for unknown request");
            return false;
        };
        let tracker = &mut self.tables[request.iface];

        if request.generation != tracker.generation {
            debug!(
                table = tracker.table,
                seq,
                errno,
                "Ignoring acknowledgment for superseded request"
            );
            return false;
        }

        let settled = errno == 0
            || (request.activate && errno == libc::EEXIST)
            || (!request.activate && errno == libc::ENOENT);

        if settled {
            let changed = tracker.applied != Some(request.activate);
            tracker.applied = Some(request.activate);
            if changed {
                info!(
                    table = tracker.table,
                    priority = tracker.priority,
                    active = request.activate,
                    "Route table {}",
                    if request.activate { "activated" } else { "deactivated" }
                );
            }
            return changed;
        }

        if is_transient(errno) {
            warn!(table = tracker.table, seq, errno, "Transient rule request failure");
            self.schedule_retry(request.iface, request.activate, request.attempt, timers, now);
        } else {
            error!(
                table = tracker.table,
                seq,
                errno,
                error = %io::Error::from_raw_os_error(errno),
                "Rule request rejected by kernel"
            );
        }
        false
    }

    /// Reissue the request whose retry timer fired
    pub fn on_retry_timer(
        &mut self,
        iface: IfaceId,
        kernel: &mut dyn RouteKernel,
        timers: &mut TimerQueue,
        now: Instant,
    ) {
        let Some(retry) = self.tables.get_mut(iface).and_then(|t| t.retry.take()) else {
            return;
        };
        self.issue(iface, retry.activate, retry.attempt, kernel, timers, now);
    }

    /// Deactivate every table last requested active
    ///
    /// Returns the number of requests sent.
    pub fn shutdown(&mut self, kernel: &mut dyn RouteKernel, timers: &mut TimerQueue, now: Instant) -> usize {
        let active: Vec<IfaceId> = self
            .tables
            .iter()
            .enumerate()
            .filter(|(_, t)| t.last_requested == Some(true))
            .map(|(id, _)| id)
            .collect();
        for &iface in &active {
            self.issue(iface, false, self.policy.max_attempts, kernel, timers, now);
        }
        active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct RecordingKernel {
        requests: Vec<RuleRequest>,
        fail_sends: usize,
    }

    impl RouteKernel for RecordingKernel {
        fn submit(&mut self, request: &RuleRequest) -> io::Result<()> {
            if self.fail_sends > 0 {
                self.fail_sends -= 1;
                return Err(io::Error::from_raw_os_error(libc::ENOBUFS));
            }
            self.requests.push(*request);
            Ok(())
        }
    }

    fn controller() -> (RouteController, RecordingKernel, TimerQueue) {
        let mut routes = RouteController::new(RetryPolicy::default());
        routes.register(0, 10, 1010);
        (routes, RecordingKernel::default(), TimerQueue::new())
    }

    #[test]
    fn test_reconcile_issues_rule() {
        let (mut routes, mut kernel, mut timers) = controller();
        let now = Instant::now();
        routes.reconcile(0, true, false, &mut kernel, &mut timers, now);

        assert_eq!(
            kernel.requests,
            vec![RuleRequest {
                seq: 1,
                table: 10,
                priority: 1010,
                op: RuleOp::Add
            }]
        );
        assert_eq!(routes.last_requested(0), Some(true));
        assert_eq!(routes.applied(0), None);

        assert!(routes.on_ack(1, 0, &mut timers, now));
        assert_eq!(routes.applied(0), Some(true));
        assert_eq!(routes.pending_requests(), 0);
    }

    #[test]
    fn test_reconcile_skips_unchanged() {
        let (mut routes, mut kernel, mut timers) = controller();
        let now = Instant::now();
        routes.reconcile(0, true, false, &mut kernel, &mut timers, now);
        routes.reconcile(0, true, false, &mut kernel, &mut timers, now);
        assert_eq!(kernel.requests.len(), 1);

        routes.reconcile(0, true, true, &mut kernel, &mut timers, now);
        assert_eq!(kernel.requests.len(), 2);
    }

    #[test]
    fn test_out_of_order_acks_last_write_wins() {
        let (mut routes, mut kernel, mut timers) = controller();
        let now = Instant::now();
        routes.reconcile(0, false, false, &mut kernel, &mut timers, now);
        routes.reconcile(0, true, false, &mut kernel, &mut timers, now);
        let deactivate = kernel.requests[0].seq;
        let activate = kernel.requests[1].seq;

        assert!(routes.on_ack(activate, 0, &mut timers, now));
        assert!(!routes.on_ack(deactivate, 0, &mut timers, now));
        assert_eq!(routes.applied(0), Some(true));
    }

    #[test]
    fn test_exists_and_missing_count_as_applied() {
        let (mut routes, mut kernel, mut timers) = controller();
        let now = Instant::now();
        routes.reconcile(0, true, false, &mut kernel, &mut timers, now);
        routes.on_ack(1, libc::EEXIST, &mut timers, now);
        assert_eq!(routes.applied(0), Some(true));

        routes.reconcile(0, false, false, &mut kernel, &mut timers, now);
        routes.on_ack(2, libc::ENOENT, &mut timers, now);
        assert_eq!(routes.applied(0), Some(false));
    }

    #[test]
    fn test_structural_error_abandoned() {
        let (mut routes, mut kernel, mut timers) = controller();
        let now = Instant::now();
        routes.reconcile(0, true, false, &mut kernel, &mut timers, now);
        assert!(!routes.on_ack(1, libc::EPERM, &mut timers, now));
        assert_eq!(routes.applied(0), None);
        assert!(timers.is_empty());
    }

    #[test]
    fn test_transient_error_retried_with_backoff() {
        let (mut routes, mut kernel, mut timers) = controller();
        let now = Instant::now();
        routes.reconcile(0, true, false, &mut kernel, &mut timers, now);
        routes.on_ack(1, libc::EBUSY, &mut timers, now);

        assert_eq!(
            timers.deadline(TimerKey::RouteRetry(0)),
            Some(now + Duration::from_millis(100))
        );
        routes.on_retry_timer(0, &mut kernel, &mut timers, now);
        assert_eq!(kernel.requests.len(), 2);
        assert_eq!(kernel.requests[1].op, RuleOp::Add);

        routes.on_ack(2, libc::EBUSY, &mut timers, now);
        assert_eq!(
            timers.deadline(TimerKey::RouteRetry(0)),
            Some(now + Duration::from_millis(200))
        );
    }

    #[test]
    fn test_retry_gives_up() {
        let mut routes = RouteController::new(RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        });
        routes.register(0, 10, 1010);
        let mut kernel = RecordingKernel::default();
        let mut timers = TimerQueue::new();
        let now = Instant::now();

        routes.reconcile(0, true, false, &mut kernel, &mut timers, now);
        routes.on_ack(1, libc::EAGAIN, &mut timers, now);
        routes.on_retry_timer(0, &mut kernel, &mut timers, now);
        routes.on_ack(2, libc::EAGAIN, &mut timers, now);
        assert!(timers.is_empty());
        assert_eq!(routes.applied(0), None);
    }

    #[test]
    fn test_local_send_failure_retried() {
        let (mut routes, mut kernel, mut timers) = controller();
        kernel.fail_sends = 1;
        let now = Instant::now();
        routes.reconcile(0, true, false, &mut kernel, &mut timers, now);
        assert!(kernel.requests.is_empty());
        assert!(timers.is_armed(TimerKey::RouteRetry(0)));

        routes.on_retry_timer(0, &mut kernel, &mut timers, now);
        assert_eq!(kernel.requests.len(), 1);
    }

    #[test]
    fn test_new_request_supersedes_retry() {
        let (mut routes, mut kernel, mut timers) = controller();
        let now = Instant::now();
        routes.reconcile(0, true, false, &mut kernel, &mut timers, now);
        routes.on_ack(1, libc::EBUSY, &mut timers, now);
        routes.reconcile(0, false, false, &mut kernel, &mut timers, now);
        assert!(!timers.is_armed(TimerKey::RouteRetry(0)));

        routes.on_retry_timer(0, &mut kernel, &mut timers, now);
        assert_eq!(kernel.requests.len(), 2);
    }

    #[test]
    fn test_new_request_drops_superseded_pending() {
        let (mut routes, mut kernel, mut timers) = controller();
        routes.register(1, 11, 1011);
        let now = Instant::now();
        routes.reconcile(0, true, false, &mut kernel, &mut timers, now);
        routes.reconcile(1, true, false, &mut kernel, &mut timers, now);
        assert_eq!(routes.pending_requests(), 2);

        // The ack of the first request was lost; a forced request replaces it
        routes.reconcile(0, true, true, &mut kernel, &mut timers, now);
        assert_eq!(routes.pending_requests(), 2);
        assert!(!routes.on_ack(1, 0, &mut timers, now));

        let latest = kernel.requests.last().unwrap().seq;
        assert!(routes.on_ack(latest, 0, &mut timers, now));
        assert_eq!(routes.applied(0), Some(true));
        assert_eq!(routes.pending_requests(), 1);
    }

    #[test]
    fn test_seq_stays_below_dump_range() {
        let (mut routes, mut kernel, mut timers) = controller();
        routes.next_seq = DUMP_SEQ_BASE - 1;
        let now = Instant::now();
        routes.reconcile(0, true, false, &mut kernel, &mut timers, now);
        routes.reconcile(0, false, false, &mut kernel, &mut timers, now);

        let seqs: Vec<u32> = kernel.requests.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![DUMP_SEQ_BASE - 1, 1]);
    }

    #[test]
    fn test_unknown_ack_ignored() {
        let (mut routes, _kernel, mut timers) = controller();
        assert!(!routes.on_ack(99, 0, &mut timers, Instant::now()));
    }

    #[test]
    fn test_backoff_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(10), Duration::from_secs(5));
    }

    #[test]
    fn test_shutdown_deactivates_active_tables() {
        let (mut routes, mut kernel, mut timers) = controller();
        routes.register(1, 11, 1011);
        let now = Instant::now();
        routes.reconcile(0, true, false, &mut kernel, &mut timers, now);
        routes.reconcile(1, false, false, &mut kernel, &mut timers, now);

        assert_eq!(routes.shutdown(&mut kernel, &mut timers, now), 1);
        let last = kernel.requests.last().unwrap();
        assert_eq!(last.table, 10);
        assert_eq!(last.op, RuleOp::Delete);
    }
}
