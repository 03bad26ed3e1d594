//! Small helpers shared across the lifecycle modules.

use std::time::{Duration, Instant};

use color_eyre::eyre::eyre;
use indicatif::ProgressBar;
use rand::Rng;

use crate::errors::{Error, Result};

/// Outcome of a bounded readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyWait {
    /// The probe succeeded.
    Ready {
        /// Probe attempts made, including the successful one.
        attempts: u32,
    },
    /// The budget elapsed without a successful probe.
    TimedOut {
        /// Probe attempts made.
        attempts: u32,
    },
}

/// Poll `test_fn` until it reports readiness or `timeout` elapses.
///
/// `Ok(false)` means "not ready yet, keep polling". An `Err` from the
/// probe cancels the wait immediately and propagates; probes map
/// transient conditions (connection refused while a guest boots) to
/// `Ok(false)` themselves and reserve errors for fatal ones (the VM
/// process died, the probe tool is missing).
pub fn wait_for_readiness<F>(
    progress: &ProgressBar,
    message: &str,
    mut test_fn: F,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<ReadyWait>
where
    F: FnMut() -> Result<bool>,
{
    let start_time = Instant::now();
    tracing::debug!(
        "polling for readiness (timeout: {}s)",
        timeout.as_secs()
    );

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        progress.set_message(format!(
            "{} (attempt {}, elapsed: {}s)",
            message,
            attempt,
            start_time.elapsed().as_secs()
        ));

        if test_fn()? {
            tracing::debug!("readiness check successful after {attempt} attempts");
            return Ok(ReadyWait::Ready { attempts: attempt });
        }
        tracing::trace!("readiness check attempt {attempt} returned false");

        if start_time.elapsed() >= timeout {
            return Ok(ReadyWait::TimedOut { attempts: attempt });
        }
        std::thread::sleep(poll_interval);
    }
}

const PORT_RANGE_START: u16 = 2200;
const PORT_RANGE_END: u16 = 4000;

/// Find a free TCP port on the loopback interface for a guest SSH forward.
///
/// Random probing first so concurrent runs rarely contend, then a
/// sequential sweep.
pub fn find_free_tcp_port() -> Result<u16> {
    let mut rng = rand::rng();
    for _ in 0..100 {
        let port = rng.random_range(PORT_RANGE_START..PORT_RANGE_END);
        if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return Ok(port);
        }
    }
    for port in PORT_RANGE_START..PORT_RANGE_END {
        if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return Ok(port);
        }
    }
    Err(Error::Internal(format!(
        "no free TCP port between {PORT_RANGE_START} and {PORT_RANGE_END}"
    )))
}

/// Derive a stable guest NIC MAC from the run prefix and a per-run NIC
/// index. The `52:54:00` OUI is the conventional QEMU prefix; the middle
/// bytes carry the run nonce so parallel runs get distinct addresses.
pub fn derive_mac(run_prefix: &str, nic_index: u8) -> String {
    let nonce = run_prefix.strip_prefix("vk").unwrap_or(run_prefix);
    let nonce = u16::from_str_radix(nonce, 16).unwrap_or(0);
    let [hi, lo] = nonce.to_be_bytes();
    format!("52:54:00:{hi:02x}:{lo:02x}:{nic_index:02x}")
}

/// Parse a memory string (like "2G", "1024M", "512") to megabytes.
pub fn parse_memory_to_mb(memory_str: &str) -> color_eyre::Result<u32> {
    let memory_str = memory_str.trim();
    if memory_str.is_empty() {
        return Err(eyre!("memory string cannot be empty"));
    }

    let (number_str, mib_per_unit) = if let Some(num) = memory_str
        .strip_suffix('G')
        .or_else(|| memory_str.strip_suffix('g'))
    {
        (num, 1024.0)
    } else if let Some(num) = memory_str
        .strip_suffix('M')
        .or_else(|| memory_str.strip_suffix('m'))
    {
        (num, 1.0)
    } else {
        (memory_str, 1.0)
    };

    let number: f64 = number_str
        .parse()
        .map_err(|_| eyre!("invalid number in memory specification: {number_str}"))?;
    if number <= 0.0 {
        return Err(eyre!("memory must be positive: {memory_str}"));
    }

    Ok((number * mib_per_unit) as u32)
}
