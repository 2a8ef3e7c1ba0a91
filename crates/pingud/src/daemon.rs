//! Event reactor
//!
//! Runs on a single-threaded tokio runtime. Socket readiness, timer expiry,
//! admin requests and the shutdown signal are multiplexed with `select!`;
//! each event is handed to the [`Monitor`] and processed to completion before
//! the next one is looked at.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-4: System Monitoring - Event loop for monitoring
//! - AU-12: Audit Record Generation - Log daemon lifecycle
//! - CP-10: System Recovery - Tables are withdrawn on shutdown

use crate::action;
use crate::adm::{self, AdminRequest, AdminServer};
use crate::config::PinguConfig;
use crate::error::{PinguError, Result};
use crate::monitor::Monitor;
use crate::netlink::NetlinkChannel;
use crate::socket::RawSocketFactory;
use crate::types::IfaceId;
use futures::future::select_all;
use std::future::Future;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::io::Interest;
use tokio::io::unix::{AsyncFd, AsyncFdReadyGuard};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Longest wait for the initial netlink dump before probing starts anyway
const STARTUP_GRACE: Duration = Duration::from_secs(2);

/// Longest wait for deactivation acknowledgments at shutdown
const SHUTDOWN_ACK_WAIT: Duration = Duration::from_millis(500);

/// Netlink buffers read per readiness event
const MAX_NETLINK_READS: usize = 64;

/// Sleep used when no timer is pending
const IDLE_SLEEP: Duration = Duration::from_secs(3600);

/// Admin requests queued towards the reactor
const ADMIN_QUEUE_DEPTH: usize = 16;

/// File descriptor owned elsewhere, registered with the reactor
#[derive(Debug)]
struct FdWatcher(RawFd);

impl AsRawFd for FdWatcher {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

fn watch(fd: RawFd) -> io::Result<AsyncFd<FdWatcher>> {
    AsyncFd::with_interest(FdWatcher(fd), Interest::READABLE)
}

/// Wait until any interface socket is readable
async fn any_readable(
    sockets: &[(IfaceId, AsyncFd<FdWatcher>)],
) -> (IfaceId, io::Result<AsyncFdReadyGuard<'_, FdWatcher>>) {
    if sockets.is_empty() {
        return std::future::pending().await;
    }
    let waits = sockets
        .iter()
        .map(|(id, fd)| Box::pin(async move { (*id, fd.readable().await) }));
    select_all(waits).await.0
}

async fn netlink_readable(
    fd: Option<&AsyncFd<FdWatcher>>,
) -> io::Result<AsyncFdReadyGuard<'_, FdWatcher>> {
    match fd {
        Some(fd) => fd.readable().await,
        None => std::future::pending().await,
    }
}

/// Resolves on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    }
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received SIGINT");
    }
}

/// The engine plus the kernel channel it is driven by
pub struct Reactor {
    monitor: Monitor,
    netlink: NetlinkChannel,
    admin_socket: PathBuf,
}

impl Reactor {
    /// Open the netlink socket and build the engine with real raw sockets
    pub fn new(config: &PinguConfig, admin_socket: PathBuf) -> Result<Self> {
        let netlink = NetlinkChannel::new()?;
        let kernel = Box::new(netlink.route_kernel());
        let mut factory = RawSocketFactory;
        let monitor = Monitor::new(config, &mut factory, kernel)?;
        Ok(Self {
            monitor,
            netlink,
            admin_socket,
        })
    }

    /// Run until `shutdown` resolves, then withdraw every active table
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let sockets = self
            .monitor
            .socket_fds()
            .into_iter()
            .map(|(id, fd)| watch(fd).map(|w| (id, w)))
            .collect::<io::Result<Vec<_>>>()
            .map_err(|e| PinguError::Netlink(format!("Failed to register sockets: {}", e)))?;

        let netlink_fd = match self.netlink.as_raw_fd() {
            fd if fd >= 0 => Some(watch(fd).map_err(|e| {
                PinguError::Netlink(format!("Failed to register netlink socket: {}", e))
            })?),
            _ => None,
        };

        let server = AdminServer::bind(&self.admin_socket)?;
        let (admin_tx, mut admin_rx) = mpsc::channel::<AdminRequest>(ADMIN_QUEUE_DEPTH);
        let admin_task = tokio::spawn(server.serve(admin_tx));

        self.netlink.request_dump()?;
        let startup_deadline = Instant::now() + STARTUP_GRACE;
        let mut started = false;

        tokio::pin!(shutdown);
        info!("Reactor running");

        loop {
            if !started && (self.netlink.dump_complete() || Instant::now() >= startup_deadline) {
                if !self.netlink.dump_complete() {
                    warn!("Initial netlink dump incomplete, starting probes anyway");
                }
                self.monitor.start(Instant::now());
                started = true;
            }

            let deadline = if started {
                self.monitor.next_deadline()
            } else {
                Some(startup_deadline)
            };
            let sleep = match deadline {
                Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)),
                None => tokio::time::sleep(IDLE_SLEEP),
            };

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                _ = sleep => {
                    if started {
                        self.monitor.on_timer(Instant::now());
                    }
                }
                (iface, ready) = any_readable(&sockets) => match ready {
                    Ok(mut guard) => {
                        if self.monitor.on_socket_readable(iface, Instant::now()) {
                            guard.clear_ready();
                        }
                    }
                    Err(e) => warn!(iface, error = %e, "ICMP socket readiness error"),
                },
                ready = netlink_readable(netlink_fd.as_ref()) => match ready {
                    Ok(mut guard) => {
                        if self.drain_netlink() {
                            guard.clear_ready();
                        }
                    }
                    Err(e) => warn!(error = %e, "Netlink socket readiness error"),
                },
                Some(request) = admin_rx.recv() => {
                    debug!(command = %request.command, "Admin request");
                    let reply = adm::dispatch(&self.monitor.snapshot(), &request.command);
                    let _ = request.reply.send(reply);
                }
            }

            for host_action in self.monitor.take_actions() {
                action::spawn(host_action);
            }
        }

        self.monitor.shutdown(Instant::now());
        let acks = tokio::time::timeout(SHUTDOWN_ACK_WAIT, self.wait_for_acks(netlink_fd.as_ref()));
        if acks.await.is_err() {
            warn!(
                pending = self.monitor.routes().pending_requests(),
                "Timed out waiting for rule acknowledgments"
            );
        }

        admin_task.abort();
        let _ = admin_task.await;
        info!("Graceful shutdown complete");
        Ok(())
    }

    /// Process buffered kernel messages; true when the socket was drained
    fn drain_netlink(&mut self) -> bool {
        for _ in 0..MAX_NETLINK_READS {
            match self.netlink.try_recv() {
                Ok(Some(events)) => {
                    let now = Instant::now();
                    for event in events {
                        self.monitor.on_kernel_event(event, now);
                    }
                }
                Ok(None) => return true,
                Err(e) => {
                    warn!(error = %e, "Failed to receive netlink messages");
                    return true;
                }
            }
        }
        false
    }

    async fn wait_for_acks(&mut self, netlink_fd: Option<&AsyncFd<FdWatcher>>) {
        while self.monitor.routes().pending_requests() > 0 {
            match netlink_readable(netlink_fd).await {
                Ok(mut guard) => {
                    if self.drain_netlink() {
                        guard.clear_ready();
                    }
                }
                Err(_) => return,
            }
        }
    }
}

/// Detach from the controlling terminal
///
/// Must run before the tokio runtime is built. The working directory becomes
/// `/`; stdio stays open so log output keeps its destination.
pub fn daemonize() -> Result<()> {
    // SAFETY: the process is still single-threaded here
    if unsafe { libc::daemon(0, 1) } < 0 {
        return Err(PinguError::Io(io::Error::last_os_error()));
    }
    Ok(())
}

/// Build and run the daemon until SIGINT/SIGTERM
pub async fn run(config: &PinguConfig, admin_socket: PathBuf) -> Result<()> {
    let reactor = Reactor::new(config, admin_socket)?;
    reactor.run(shutdown_signal()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, task};

    #[test]
    fn test_no_sockets_never_readable() {
        let sockets: Vec<(IfaceId, AsyncFd<FdWatcher>)> = Vec::new();
        let mut wait = task::spawn(any_readable(&sockets));
        assert_pending!(wait.poll());
    }

    #[test]
    fn test_missing_netlink_never_readable() {
        let mut wait = task::spawn(netlink_readable(None));
        assert_pending!(wait.poll());
    }
}
