//! Hypervisor process management for one guest VM.
//!
//! The VM gets a user-net management NIC with an SSH host-forward (how the
//! guest control channel reaches it) plus one e1000 NIC per experiment
//! tap. Process exit status is the sole boot-failure signal; there is no
//! guest agent at this layer.

use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use tracing::{debug, warn};

use crate::command_run::last_utf8_content_from_file;
use crate::errors::{Error, Result};

const QEMU_BIN: &str = "qemu-system-x86_64";
/// Window after spawn during which an exit is reported as a boot failure
/// with the hypervisor's stderr attached.
const BOOT_GRACE: Duration = Duration::from_millis(1500);
const GRACE_POLL: Duration = Duration::from_millis(50);

/// One tap plugged into the VM as an e1000 NIC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapAttachment {
    pub tap_name: String,
    pub mac: String,
}

/// Launch parameters for one VM.
#[derive(Debug, Clone)]
pub struct VmSpec {
    /// Process name tag (run prefix + node name), visible in `ps` so crash
    /// leftovers are attributable.
    pub name: String,
    /// The host's private overlay disk.
    pub overlay: Utf8PathBuf,
    pub memory_mb: u32,
    /// Loopback port forwarded to guest port 22.
    pub ssh_port: u16,
    /// MAC of the management NIC.
    pub mgmt_mac: String,
    /// Experiment NICs, in guest device order.
    pub taps: Vec<TapAttachment>,
}

/// Full qemu argv for a spec. Kept separate from spawning so the argument
/// layout is testable.
fn qemu_args(spec: &VmSpec) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-name".into(),
        spec.name.clone(),
        "-machine".into(),
        "pc,accel=kvm:tcg".into(),
        "-m".into(),
        spec.memory_mb.to_string(),
        "-display".into(),
        "none".into(),
        "-drive".into(),
        format!("file={},format=qcow2", spec.overlay),
        "-netdev".into(),
        format!(
            "user,id=netmgmt,hostfwd=tcp:127.0.0.1:{}-:22",
            spec.ssh_port
        ),
        "-device".into(),
        format!("e1000,netdev=netmgmt,mac={}", spec.mgmt_mac),
    ];
    for (i, tap) in spec.taps.iter().enumerate() {
        args.push("-netdev".into());
        args.push(format!(
            "tap,id=netexp{i},ifname={},script=no,downscript=no",
            tap.tap_name
        ));
        args.push("-device".into());
        args.push(format!("e1000,netdev=netexp{i},mac={}", tap.mac));
    }
    args
}

/// A running hypervisor child process.
#[derive(Debug)]
pub struct VmProcess {
    name: String,
    child: std::process::Child,
    stderr: std::fs::File,
}

/// Spawn qemu for `spec` and watch it briefly for an immediate exit.
///
/// An exit inside the grace window is a fatal boot failure reported with
/// the hypervisor's trailing stderr; it is not retried.
pub fn launch(spec: &VmSpec) -> Result<VmProcess> {
    let args = qemu_args(spec);
    debug!("spawning {QEMU_BIN} for {}", spec.name);

    let stderr = tempfile::tempfile()?;
    let mut child = Command::new(QEMU_BIN)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(stderr.try_clone()?)
        .spawn()?;

    let deadline = Instant::now() + BOOT_GRACE;
    loop {
        if let Some(status) = child.try_wait()? {
            return Err(Error::Subprocess {
                status: format!("{QEMU_BIN} for {} exited during boot: {status}", spec.name),
                stderr: last_utf8_content_from_file(stderr),
            });
        }
        if Instant::now() >= deadline {
            break;
        }
        std::thread::sleep(GRACE_POLL);
    }

    Ok(VmProcess {
        name: spec.name.clone(),
        child,
        stderr,
    })
}

impl VmProcess {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check whether the hypervisor exited on its own. Used by readiness
    /// probes so a dead VM cancels the wait instead of burning the budget.
    pub fn check_alive(&mut self) -> Result<()> {
        match self.child.try_wait()? {
            None => Ok(()),
            Some(status) => Err(Error::Subprocess {
                status: format!("{QEMU_BIN} for {} exited: {status}", self.name),
                stderr: last_utf8_content_from_file(self.stderr.try_clone()?),
            }),
        }
    }

    /// Stop the VM. The guest has nothing to flush (its disk is a
    /// disposable overlay), so this kills the process outright and reaps
    /// it.
    pub fn terminate(&mut self) -> Result<()> {
        match self.child.try_wait()? {
            Some(status) => {
                warn!("hypervisor for {} had already exited: {status}", self.name);
            }
            None => {
                self.child.kill()?;
            }
        }
        self.child.wait()?;
        debug!("hypervisor for {} stopped", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> VmSpec {
        VmSpec {
            name: "vk3fa2-h1".into(),
            overlay: "/tmp/run/vk3fa2-h1.qcow2".into(),
            memory_mb: 512,
            ssh_port: 2211,
            mgmt_mac: "52:54:00:3f:a2:00".into(),
            taps: vec![
                TapAttachment {
                    tap_name: "vk3fa2t0".into(),
                    mac: "52:54:00:3f:a2:01".into(),
                },
                TapAttachment {
                    tap_name: "vk3fa2t1".into(),
                    mac: "52:54:00:3f:a2:02".into(),
                },
            ],
        }
    }

    #[test]
    fn test_qemu_args_core_layout() {
        let args = qemu_args(&spec());
        let joined = args.join(" ");
        assert!(joined.contains("-name vk3fa2-h1"));
        assert!(joined.contains("-m 512"));
        assert!(joined.contains("-display none"));
        assert!(joined.contains("file=/tmp/run/vk3fa2-h1.qcow2,format=qcow2"));
        assert!(joined.contains("user,id=netmgmt,hostfwd=tcp:127.0.0.1:2211-:22"));
        assert!(joined.contains("e1000,netdev=netmgmt,mac=52:54:00:3f:a2:00"));
    }

    #[test]
    fn test_qemu_args_one_nic_per_tap() {
        let args = qemu_args(&spec());
        let joined = args.join(" ");
        assert!(joined.contains("tap,id=netexp0,ifname=vk3fa2t0,script=no,downscript=no"));
        assert!(joined.contains("e1000,netdev=netexp0,mac=52:54:00:3f:a2:01"));
        assert!(joined.contains("tap,id=netexp1,ifname=vk3fa2t1,script=no,downscript=no"));
        assert!(joined.contains("e1000,netdev=netexp1,mac=52:54:00:3f:a2:02"));
    }

    #[test]
    fn test_mgmt_nic_precedes_experiment_nics() {
        // Guest device naming depends on PCI slot order, which follows the
        // argv order: management first, then taps as declared.
        let args = qemu_args(&spec());
        let mgmt = args.iter().position(|a| a.contains("netmgmt")).unwrap();
        let first_tap = args.iter().position(|a| a.contains("netexp0")).unwrap();
        assert!(mgmt < first_tap);
    }
}
