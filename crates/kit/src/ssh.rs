//! Guest control channel over password SSH.
//!
//! Every booted VM exposes sshd through a user-net host-forward on
//! 127.0.0.1, so the channel always dials loopback at a per-host port.
//! Commands against one guest are serialized by an internal session lock;
//! independent guests proceed concurrently. A transport failure or a
//! command timeout marks the channel suspect, and the next use re-probes
//! reachability before running anything.

use std::io::{Read, Seek};
use std::process::{Command, Stdio};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::command_run::last_utf8_content_from_file;
use crate::config::GuestCredentials;
use crate::errors::{Error, Result};

/// ssh exits with this status when the transport itself failed, as opposed
/// to the remote command failing.
const SSH_TRANSPORT_EXIT: i32 = 255;
/// TCP connect budget per attempt.
const CONNECT_TIMEOUT_SECS: u32 = 5;
/// Budget for the readiness no-op and for re-validation probes.
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);
/// Poll interval while waiting on a spawned ssh process.
const CHILD_POLL: Duration = Duration::from_millis(50);

/// Output of one remote command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// What one finished (or killed) ssh invocation amounts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Success,
    RemoteFailure(i32),
    Transport,
    TimedOut,
}

fn classify(timed_out: bool, exit_code: Option<i32>) -> Disposition {
    if timed_out {
        return Disposition::TimedOut;
    }
    match exit_code {
        Some(0) => Disposition::Success,
        Some(SSH_TRANSPORT_EXIT) => Disposition::Transport,
        Some(code) => Disposition::RemoteFailure(code),
        // Killed by a signal locally; the command outcome is unknowable.
        None => Disposition::Transport,
    }
}

/// Full argv for one authenticated invocation, `sshpass` first.
fn build_ssh_argv(
    credentials: &GuestCredentials,
    port: u16,
    connect_timeout_secs: u32,
    command: &str,
) -> Vec<String> {
    vec![
        "sshpass".into(),
        "-p".into(),
        credentials.password.clone(),
        "ssh".into(),
        "-o".into(),
        "StrictHostKeyChecking=no".into(),
        "-o".into(),
        "UserKnownHostsFile=/dev/null".into(),
        "-o".into(),
        "LogLevel=ERROR".into(),
        "-o".into(),
        format!("ConnectTimeout={connect_timeout_secs}"),
        "-p".into(),
        port.to_string(),
        format!("{}@127.0.0.1", credentials.user),
        command.into(),
    ]
}

/// Quote a description-supplied value for interpolation into a remote
/// command line.
pub(crate) fn quoted(value: &str) -> Result<String> {
    shlex::try_quote(value)
        .map(|q| q.into_owned())
        .map_err(|_| Error::TopologyValidation {
            reason: format!("value cannot appear in a guest command: {value:?}"),
        })
}

struct RawOutput {
    exit_code: Option<i32>,
    timed_out: bool,
    stdout: String,
    stderr: String,
}

#[derive(Debug, Default)]
struct SessionState {
    /// Set after a transport failure or timeout; forces a probe before the
    /// next command.
    revalidate: bool,
}

/// Authenticated command channel into one guest.
#[derive(Debug)]
pub struct GuestChannel {
    host: String,
    port: u16,
    credentials: GuestCredentials,
    command_timeout: Duration,
    session: Mutex<SessionState>,
}

impl GuestChannel {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        credentials: GuestCredentials,
        command_timeout: Duration,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            credentials,
            command_timeout,
            session: Mutex::new(SessionState::default()),
        }
    }

    /// Node this channel belongs to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Loopback port the guest's sshd is forwarded to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Account the channel authenticates as.
    pub fn user(&self) -> &str {
        &self.credentials.user
    }

    /// One authenticated no-op connection attempt.
    ///
    /// `Ok(false)` covers every transient failure mode (connection
    /// refused, handshake not up yet); errors are reserved for conditions
    /// that make further attempts pointless, like `sshpass` missing.
    pub fn probe(&self) -> Result<bool> {
        let raw = self.invoke("true", PROBE_TIMEOUT)?;
        Ok(classify(raw.timed_out, raw.exit_code) == Disposition::Success)
    }

    /// Run a remote command, failing on any non-zero remote exit.
    pub fn execute(&self, command: &str) -> Result<CommandOutput> {
        let output = self.execute_unchecked(command)?;
        if output.exit_code == 0 {
            Ok(output)
        } else {
            Err(Error::CommandFailed {
                host: self.host.clone(),
                command: command.into(),
                exit_code: Some(output.exit_code),
                timed_out: false,
                stderr: output.stderr,
            })
        }
    }

    /// Run a remote command, returning its exit code to the caller.
    ///
    /// Only transport failures and timeouts are errors here; callers that
    /// expect non-zero exits (isolation checks, best-effort cleanup
    /// commands) inspect the returned code themselves.
    pub fn execute_unchecked(&self, command: &str) -> Result<CommandOutput> {
        let mut session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if session.revalidate {
            trace!("channel to {} is suspect, re-probing", self.host);
            if !self.probe()? {
                return Err(Error::GuestUnreachable {
                    host: self.host.clone(),
                    attempts: 1,
                });
            }
            session.revalidate = false;
        }

        let raw = self.invoke(command, self.command_timeout)?;
        match classify(raw.timed_out, raw.exit_code) {
            Disposition::Success => Ok(CommandOutput {
                exit_code: 0,
                stdout: raw.stdout,
                stderr: raw.stderr,
            }),
            Disposition::RemoteFailure(code) => Ok(CommandOutput {
                exit_code: code,
                stdout: raw.stdout,
                stderr: raw.stderr,
            }),
            Disposition::Transport => {
                session.revalidate = true;
                Err(Error::GuestUnreachable {
                    host: self.host.clone(),
                    attempts: 1,
                })
            }
            Disposition::TimedOut => {
                session.revalidate = true;
                Err(Error::CommandFailed {
                    host: self.host.clone(),
                    command: command.into(),
                    exit_code: None,
                    timed_out: true,
                    stderr: raw.stderr,
                })
            }
        }
    }

    /// `ip addr add` + link up for `iface`, expressed over the channel.
    pub fn configure_address(&self, iface: &str, cidr: &str) -> Result<()> {
        let iface_q = quoted(iface)?;
        let cidr_q = quoted(cidr)?;
        self.execute(&format!("ip addr add {cidr_q} dev {iface_q}"))?;
        self.execute(&format!("ip link set {iface_q} up"))?;
        Ok(())
    }

    /// Install (or replace) a route over the channel. `dest` may be
    /// `default` or a CIDR.
    pub fn configure_route(&self, dest: &str, via: &str) -> Result<()> {
        let dest_q = quoted(dest)?;
        let via_q = quoted(via)?;
        self.execute(&format!("ip route replace {dest_q} via {via_q}"))?;
        Ok(())
    }

    /// Spawn one ssh invocation and collect its output, killing it if it
    /// outlives `timeout`. Output is staged through unlinked temp files,
    /// so a chatty command cannot deadlock on a full pipe.
    fn invoke(&self, command: &str, timeout: Duration) -> Result<RawOutput> {
        let argv = build_ssh_argv(&self.credentials, self.port, CONNECT_TIMEOUT_SECS, command);
        let mut stdout = tempfile::tempfile()?;
        let stderr = tempfile::tempfile()?;

        trace!("guest {}: {command}", self.host);
        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(stdout.try_clone()?)
            .stderr(stderr.try_clone()?)
            .spawn()?;

        let deadline = Instant::now() + timeout;
        let mut timed_out = false;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break Some(status);
            }
            if Instant::now() >= deadline {
                timed_out = true;
                if let Err(e) = child.kill() {
                    warn!("could not kill timed-out ssh to {}: {e}", self.host);
                }
                let _ = child.wait();
                break None;
            }
            std::thread::sleep(CHILD_POLL);
        };

        let mut out = String::new();
        stdout.seek(std::io::SeekFrom::Start(0))?;
        stdout.read_to_string(&mut out)?;

        Ok(RawOutput {
            exit_code: status.and_then(|s| s.code()),
            timed_out,
            stdout: out,
            stderr: last_utf8_content_from_file(stderr),
        })
    }
}
