//! Host action commands
//!
//! A host may name a command to run when it goes up and one for when it
//! goes down. Commands run through `/bin/sh -c` in a spawned task so a slow
//! script never stalls probing. Arguments are quoted with [`shellquote`].
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-10: Information Input Validation - Shell quoting of arguments
//! - AU-12: Audit Record Generation - Command exit status is logged

use crate::error::{PinguError, Result};
use crate::types::HostState;
use once_cell::sync::Lazy;
use regex::Regex;
use std::net::Ipv4Addr;
use std::process::Stdio;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Shell used to run action commands
pub const SHELL: &str = "/bin/sh";

/// Regex for characters that need escaping in shell double-quotes.
/// Matches: $, `, ", \, and newline
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Quote a string for safe use in a shell command line
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// An action command triggered by a verdict change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAction {
    /// Configured command
    pub command: String,
    pub label: String,
    pub address: Ipv4Addr,
    /// New verdict
    pub state: HostState,
    /// Interface name ("" for the unnamed interface)
    pub iface: String,
}

impl HostAction {
    /// Full command line: the command followed by label, state and interface
    pub fn command_line(&self) -> String {
        format!(
            "{} {} {} {}",
            self.command,
            shellquote(&self.label),
            shellquote(self.state.as_str()),
            shellquote(&self.iface)
        )
    }
}

/// Outcome of an action command
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Exit code (-1 when killed by a signal)
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run an action to completion
pub async fn run(action: &HostAction) -> Result<ExecResult> {
    let cmd = action.command_line();
    debug!(command = %cmd, host = %action.address, "Executing host action");

    let output = Command::new(SHELL)
        .arg("-c")
        .arg(&cmd)
        .env("PINGU_HOST", &action.label)
        .env("PINGU_STATE", action.state.as_str())
        .env("PINGU_IFACE", &action.iface)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| PinguError::ActionExec {
            command: cmd.clone(),
            source: e,
        })?;

    Ok(ExecResult {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Run an action in its own task, logging the result
pub fn spawn(action: HostAction) -> JoinHandle<()> {
    tokio::spawn(async move {
        match run(&action).await {
            Ok(result) if result.success() => {
                info!(
                    host = %action.address,
                    state = %action.state,
                    command = %action.command,
                    "Host action completed"
                );
            }
            Ok(result) => {
                warn!(
                    host = %action.address,
                    state = %action.state,
                    command = %action.command,
                    exit_code = result.exit_code,
                    stderr = %result.stderr,
                    "Host action failed"
                );
            }
            Err(e) => {
                error!(host = %action.address, error = %e, "Host action could not be started");
            }
        }
    })
}
