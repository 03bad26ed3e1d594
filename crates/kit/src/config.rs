//! Per-run configuration threaded into every component.
//!
//! One [`RunConfig`] is built by the CLI and borrowed (or cheaply cloned)
//! by the assembler and node constructors. There is intentionally no
//! process-global state behind any of this; two runs in one process would
//! not interfere.

use std::fmt;
use std::time::Duration;

use camino::Utf8PathBuf;

/// Credentials for the guest control channel. Always injected per run,
/// never baked into the binary.
#[derive(Clone)]
pub struct GuestCredentials {
    /// Guest account the channel authenticates as.
    pub user: String,
    /// Shared-secret password for that account.
    pub password: String,
}

impl fmt::Debug for GuestCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestCredentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything a single topology run needs to know about its environment.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Read-only qcow2 base image every guest disk overlays. Never written.
    pub base_image: Utf8PathBuf,
    /// Directory receiving overlay images for this run.
    pub work_dir: Utf8PathBuf,
    /// Short tag stamped on every system-visible resource name (taps,
    /// bridges, overlay files, VM process names) so concurrent runs never
    /// collide and crash leftovers stay attributable.
    pub run_prefix: String,
    /// Guest channel credentials.
    pub credentials: GuestCredentials,
    /// Default guest memory in MB for nodes that do not override it.
    pub memory_mb: u32,
    /// Budget for a guest to answer its first authenticated probe.
    pub ready_timeout: Duration,
    /// Pause between readiness probes.
    pub ready_poll: Duration,
    /// Budget for one remote command on the guest channel.
    pub command_timeout: Duration,
}

impl RunConfig {
    /// Generate a fresh run prefix: `vk` plus four hex characters.
    ///
    /// Short enough that derived tap names stay inside the kernel's
    /// 15-byte interface name limit.
    pub fn generate_prefix() -> String {
        let mut nonce = uuid::Uuid::new_v4().simple().to_string();
        nonce.truncate(4);
        format!("vk{nonce}")
    }
}
