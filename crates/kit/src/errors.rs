//! Failure taxonomy for topology lifecycle operations.
//!
//! Every lifecycle module returns [`Error`] through the crate-local
//! [`Result`] alias. The CLI boundary converts these into
//! `color_eyre::Report` for display.

use std::fmt;

use camino::Utf8PathBuf;
use thiserror::Error;

/// Result alias used throughout the lifecycle modules.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while assembling, operating, or tearing down a topology.
#[derive(Debug, Error)]
pub enum Error {
    /// The base image is unusable, or the overlay destination is occupied
    /// by a file that is not ours to replace.
    #[error("overlay image {path}: {reason}")]
    ImageCreation {
        /// Path of the base image or overlay destination involved.
        path: Utf8PathBuf,
        /// Why creation was refused.
        reason: String,
    },

    /// A virtual interface with the requested name already exists on the
    /// system.
    #[error("interface {name} already exists on this system")]
    NameCollision {
        /// The colliding interface name.
        name: String,
    },

    /// The guest control channel could not be established within the
    /// configured retry budget.
    #[error("guest {host} unreachable after {attempts} connection attempts")]
    GuestUnreachable {
        /// Node the channel belongs to.
        host: String,
        /// Connection attempts made before giving up.
        attempts: u32,
    },

    /// A remote command reached the guest but failed, or exceeded its
    /// execution timeout.
    #[error("command on {host} {}: {command}{}{}", failure_word(.timed_out), exit_display(.exit_code), stderr_display(.stderr))]
    CommandFailed {
        /// Node the command ran on.
        host: String,
        /// The remote command line.
        command: String,
        /// Remote exit code, when the command ran to completion.
        exit_code: Option<i32>,
        /// True when the command was killed for exceeding its timeout.
        timed_out: bool,
        /// Trailing remote stderr.
        stderr: String,
    },

    /// A switch port was given a VLAN role incompatible with the one it
    /// already holds.
    #[error("vlan config on {bridge} port {port}: {reason}")]
    VlanConfig {
        /// Bridge the port belongs to.
        bridge: String,
        /// Port (tap) name.
        port: String,
        /// The conflict.
        reason: String,
    },

    /// A route or sub-interface was declared in an order that cannot be
    /// applied (e.g. a next-hop with no covering sub-interface subnet).
    #[error("router {router}: {reason}")]
    DependencyOrder {
        /// Router the declaration belongs to.
        router: String,
        /// The ordering violation.
        reason: String,
    },

    /// The topology description is structurally invalid.
    #[error("invalid topology: {reason}")]
    TopologyValidation {
        /// What the validator rejected.
        reason: String,
    },

    /// An operation was attempted in a node state that does not allow it.
    #[error("node {node} is {state}, cannot {operation}")]
    InvalidState {
        /// Node name.
        node: String,
        /// Current state of the node.
        state: String,
        /// Operation that was refused.
        operation: String,
    },

    /// Best-effort teardown finished but some nodes reported failures.
    #[error("teardown completed with failures:\n{0}")]
    Teardown(TeardownReport),

    /// An external tool (qemu-img, ip, ovs-vsctl, qemu, ssh) failed at the
    /// process level.
    #[error("subprocess {status}\n{stderr}")]
    Subprocess {
        /// Exit status description.
        status: String,
        /// Trailing stderr of the tool.
        stderr: String,
    },

    /// Host-side I/O failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Output from an external tool or a topology file did not parse.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// A worker thread panicked or shared state was poisoned.
    #[error("internal: {0}")]
    Internal(String),
}

fn failure_word(timed_out: &bool) -> &'static str {
    if *timed_out {
        "timed out"
    } else {
        "failed"
    }
}

fn exit_display(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" (exit code {code})"),
        None => String::new(),
    }
}

fn stderr_display(stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}

/// Per-node failures collected while tearing a topology down.
///
/// Teardown never stops at the first failing node; everything is attempted
/// and the failures are reported together.
#[derive(Debug, Default)]
pub struct TeardownReport {
    failures: Vec<(String, Error)>,
}

impl TeardownReport {
    /// Record a node's teardown failure.
    pub fn push(&mut self, node: impl Into<String>, error: Error) {
        self.failures.push((node.into(), error));
    }

    /// True when every node tore down cleanly.
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of nodes that failed.
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// The recorded failures, in the order teardown encountered them.
    pub fn failures(&self) -> &[(String, Error)] {
        &self.failures
    }

    /// Convert into `Err(Error::Teardown(self))` unless empty.
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Teardown(self))
        }
    }
}

impl fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} node(s) failed teardown", self.failures.len())?;
        for (node, error) in &self.failures {
            write!(f, "\n  {node}: {error}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_report_is_ok() {
        let report = TeardownReport::default();
        assert!(report.is_empty());
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn test_report_aggregates_all_failures() {
        let mut report = TeardownReport::default();
        report.push(
            "h1",
            Error::NameCollision {
                name: "vkaa11t0".into(),
            },
        );
        report.push(
            "sw0",
            Error::Subprocess {
                status: "exit code: 1".into(),
                stderr: "bridge busy".into(),
            },
        );
        assert_eq!(report.len(), 2);
        let err = report.into_result().unwrap_err();
        let text = err.to_string();
        assert!(text.contains("2 node(s) failed teardown"));
        assert!(text.contains("h1"));
        assert!(text.contains("vkaa11t0"));
        assert!(text.contains("sw0"));
        assert!(text.contains("bridge busy"));
    }

    #[test]
    fn test_command_failed_display_distinguishes_timeout() {
        let timed_out = Error::CommandFailed {
            host: "h1".into(),
            command: "ping -c1 10.0.0.11".into(),
            exit_code: None,
            timed_out: true,
            stderr: String::new(),
        };
        assert!(timed_out.to_string().contains("timed out"));

        let failed = Error::CommandFailed {
            host: "h1".into(),
            command: "ping -c1 10.0.0.11".into(),
            exit_code: Some(1),
            timed_out: false,
            stderr: "Network is unreachable".into(),
        };
        let text = failed.to_string();
        assert!(text.contains("failed"));
        assert!(text.contains("exit code 1"));
        assert!(text.contains("Network is unreachable"));
    }
}
