//! Administrative channel
//!
//! A Unix stream socket accepting one command line per connection. The
//! connection tasks never touch engine state: they forward the command to
//! the reactor, which answers from a [`Snapshot`].
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - AC-3: Access Enforcement - Socket file permissions gate access
//! - AU-6: Audit Record Review - Operators inspect host and table state

use crate::error::{PinguError, Result};
use crate::snapshot::Snapshot;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Longest accepted command line
const MAX_COMMAND_LEN: u64 = 1024;

const HELP: &str = "\
host-status   one line per monitored host
iface-status  one line per interface and its route table
status        full state as JSON
help          this text";

/// A command waiting for the reactor's answer
#[derive(Debug)]
pub struct AdminRequest {
    pub command: String,
    pub reply: oneshot::Sender<String>,
}

/// Answer one command line from a snapshot
pub fn dispatch(snapshot: &Snapshot, line: &str) -> String {
    let command = line.trim();
    match command {
        "host-status" => host_status(snapshot),
        "iface-status" => iface_status(snapshot),
        "status" => serde_json::to_string_pretty(snapshot)
            .unwrap_or_else(|e| format!("ERROR failed to encode status: {}", e)),
        "help" => HELP.to_string(),
        _ => format!("ERROR unknown command: {}", command),
    }
}

fn display_iface(name: &str) -> &str {
    if name.is_empty() { "-" } else { name }
}

fn host_status(snapshot: &Snapshot) -> String {
    let mut out = String::new();
    for h in &snapshot.hosts {
        let rtt = match h.last_rtt_ms {
            Some(ms) => format!("{:.3}", ms),
            None => "-".to_string(),
        };
        let _ = writeln!(
            out,
            "{} {} {} {} successes={} failures={} rtt={}",
            h.label,
            h.address,
            display_iface(&h.interface),
            h.state,
            h.consecutive_successes,
            h.consecutive_failures,
            rtt
        );
    }
    out
}

fn iface_status(snapshot: &Snapshot) -> String {
    let mut out = String::new();
    for i in &snapshot.interfaces {
        let _ = writeln!(
            out,
            "{} usable={} table={} priority={} desired={} applied={}",
            display_iface(&i.name),
            i.usable,
            i.route_table,
            i.rule_priority,
            i.desired.as_str(),
            i.applied.map(|a| a.as_str()).unwrap_or("unknown")
        );
    }
    out
}

/// Listening admin socket; the socket file is removed on drop
#[derive(Debug)]
pub struct AdminServer {
    listener: UnixListener,
    path: PathBuf,
}

impl AdminServer {
    /// Bind the socket, replacing a stale socket file
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| {
                PinguError::Config(format!(
                    "Failed to remove stale admin socket {}: {}",
                    path.display(),
                    e
                ))
            })?;
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&path)?;
        info!(path = %path.display(), "Admin socket listening");
        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections forever, one task per connection
    pub async fn serve(self, requests: mpsc::Sender<AdminRequest>) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    let requests = requests.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, requests).await {
                            debug!(error = %e, "Admin connection failed");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept admin connection");
                }
            }
        }
    }
}

impl Drop for AdminServer {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "Failed to remove admin socket");
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    requests: mpsc::Sender<AdminRequest>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half.take(MAX_COMMAND_LEN));
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let (reply_tx, reply_rx) = oneshot::channel();
    let request = AdminRequest {
        command: line.trim().to_string(),
        reply: reply_tx,
    };

    let response = if requests.send(request).await.is_err() {
        "ERROR daemon shutting down".to_string()
    } else {
        reply_rx
            .await
            .unwrap_or_else(|_| "ERROR daemon shutting down".to_string())
    };

    write_half.write_all(response.as_bytes()).await?;
    if !response.ends_with('\n') {
        write_half.write_all(b"\n").await?;
    }
    write_half.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{HostSnapshot, InterfaceSnapshot};
    use crate::types::{HostState, TableState};
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;

    fn snapshot() -> Snapshot {
        Snapshot {
            hosts: vec![
                HostSnapshot {
                    label: "isp-a".to_string(),
                    address: Ipv4Addr::new(192, 0, 2, 1),
                    interface: "eth1".to_string(),
                    state: HostState::Up,
                    consecutive_successes: 4,
                    consecutive_failures: 0,
                    last_rtt_ms: Some(1.5),
                    probes_sent: 4,
                    replies: 4,
                    last_change: None,
                },
                HostSnapshot {
                    label: "198.51.100.1".to_string(),
                    address: Ipv4Addr::new(198, 51, 100, 1),
                    interface: String::new(),
                    state: HostState::Unknown,
                    consecutive_successes: 0,
                    consecutive_failures: 1,
                    last_rtt_ms: None,
                    probes_sent: 1,
                    replies: 0,
                    last_change: None,
                },
            ],
            interfaces: vec![InterfaceSnapshot {
                name: "eth1".to_string(),
                index: Some(3),
                has_link: true,
                has_binding: true,
                usable: true,
                address: Some(Ipv4Addr::new(192, 0, 2, 100)),
                route_table: 10,
                rule_priority: 1010,
                health_gated: true,
                desired: TableState::Active,
                applied: None,
                in_sync: false,
            }],
        }
    }

    #[test]
    fn test_host_status() {
        assert_eq!(
            dispatch(&snapshot(), "host-status\n"),
            "isp-a 192.0.2.1 eth1 up successes=4 failures=0 rtt=1.500\n\
             198.51.100.1 198.51.100.1 - unknown successes=0 failures=1 rtt=-\n"
        );
    }

    #[test]
    fn test_iface_status() {
        assert_eq!(
            dispatch(&snapshot(), "iface-status"),
            "eth1 usable=true table=10 priority=1010 desired=active applied=unknown\n"
        );
    }

    #[test]
    fn test_status_json() {
        let json: serde_json::Value =
            serde_json::from_str(&dispatch(&snapshot(), "status")).unwrap();
        assert_eq!(json["hosts"][0]["state"], "up");
        assert_eq!(json["interfaces"][0]["desired"], "active");
        assert_eq!(json["interfaces"][0]["in_sync"], false);
    }

    #[test]
    fn test_unknown_command() {
        assert_eq!(
            dispatch(&snapshot(), "reboot"),
            "ERROR unknown command: reboot"
        );
        assert!(dispatch(&snapshot(), "help").contains("host-status"));
    }

    #[tokio::test]
    async fn test_server_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pingu.ctl");
        let server = AdminServer::bind(&path).unwrap();
        let (tx, mut rx) = mpsc::channel::<AdminRequest>(4);
        let task = tokio::spawn(server.serve(tx));

        let snap = snapshot();
        let reactor = tokio::spawn(async move {
            let request = rx.recv().await.unwrap();
            let _ = request.reply.send(dispatch(&snap, &request.command));
        });

        let mut stream = UnixStream::connect(&path).await.unwrap();
        stream.write_all(b"iface-status\n").await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("eth1 usable=true"));

        reactor.await.unwrap();
        task.abort();
        let _ = task.await;
        assert!(!path.exists());
    }
}
