//! Host nodes: one QEMU guest per node, walked through a strict lifecycle.
//!
//! A node moves `Created -> Booting -> Ready -> Running -> TornDown`, with
//! `Failed` reachable from any non-terminal state. Operations check the
//! state first and refuse with [`Error::InvalidState`] rather than letting
//! a half-built node receive traffic. Routers compose this type and layer
//! their own configuration step on top.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use indicatif::MultiProgress;
use indoc::formatdoc;
use tracing::debug;

use crate::config::RunConfig;
use crate::errors::{Error, Result};
use crate::overlay::{OverlayImage, OverlayStore};
use crate::progress;
use crate::qemu::{self, TapAttachment, VmProcess, VmSpec};
use crate::ssh::{CommandOutput, GuestChannel};
use crate::switch::{PortRole, SwitchNode};
use crate::tap::{TapAllocator, TapDevice};
use crate::utils::{self, ReadyWait};

/// Lifecycle states of a guest-backed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Created,
    Booting,
    Ready,
    Running,
    TornDown,
    Failed,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = match self {
            NodeState::Created => "created",
            NodeState::Booting => "booting",
            NodeState::Ready => "ready",
            NodeState::Running => "running",
            NodeState::TornDown => "torn-down",
            NodeState::Failed => "failed",
        };
        f.write_str(word)
    }
}

/// One NIC the node wants: the switch it plugs into, the port role on
/// that switch, and the guest-side device name the node will configure.
pub struct LinkRequest {
    pub switch: Arc<Mutex<SwitchNode>>,
    pub role: PortRole,
    pub guest_iface: String,
}

/// A host node and every resource it has acquired so far.
///
/// Resources are registered on `self` the moment they exist, so a failure
/// partway through `start` leaves nothing orphaned: the node flips to
/// `Failed` and `teardown` releases exactly what was acquired.
pub struct HostNode {
    name: String,
    memory_mb: u32,
    /// First per-run NIC index for MAC derivation; the management NIC
    /// takes it, experiment NICs follow.
    nic_base: u8,
    links: Vec<LinkRequest>,
    state: NodeState,
    overlay: Option<OverlayImage>,
    taps: Vec<TapDevice>,
    vm: Option<VmProcess>,
    channel: Option<GuestChannel>,
    ssh_port: Option<u16>,
}

impl HostNode {
    pub fn new(
        name: impl Into<String>,
        memory_mb: u32,
        nic_base: u8,
        links: Vec<LinkRequest>,
    ) -> Self {
        Self {
            name: name.into(),
            memory_mb,
            nic_base,
            links,
            state: NodeState::Created,
            overlay: None,
            taps: Vec::new(),
            vm: None,
            channel: None,
            ssh_port: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Loopback port forwarded to the guest's sshd, once booted.
    pub fn ssh_port(&self) -> Option<u16> {
        self.ssh_port
    }

    fn require(&self, expected: NodeState, operation: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::InvalidState {
                node: self.name.clone(),
                state: self.state.to_string(),
                operation: operation.into(),
            })
        }
    }

    /// Acquire the node's resources and launch its guest:
    /// overlay image, one tap per link attached to its switch, a free
    /// loopback SSH port, then the hypervisor process and its channel.
    pub fn start(
        &mut self,
        cfg: &RunConfig,
        store: &OverlayStore,
        allocator: &Mutex<TapAllocator>,
    ) -> Result<()> {
        self.require(NodeState::Created, "start")?;
        match self.acquire_and_launch(cfg, store, allocator) {
            Ok(()) => {
                self.state = NodeState::Booting;
                Ok(())
            }
            Err(e) => {
                self.state = NodeState::Failed;
                Err(e)
            }
        }
    }

    fn acquire_and_launch(
        &mut self,
        cfg: &RunConfig,
        store: &OverlayStore,
        allocator: &Mutex<TapAllocator>,
    ) -> Result<()> {
        let overlay = store.create(&format!("{}-{}", cfg.run_prefix, self.name))?;
        let overlay_path = overlay.path().to_owned();
        self.overlay = Some(overlay);

        for link in &self.links {
            let tap = allocator
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .allocate(&self.name)?;
            let attached = {
                let mut switch = link.switch.lock().unwrap_or_else(PoisonError::into_inner);
                match &link.role {
                    PortRole::Plain => switch.add_port(tap.name()),
                    PortRole::Access(vlan) => switch.add_access_port(tap.name(), *vlan),
                    PortRole::Trunk(vlans) => switch.add_trunk_port(tap.name(), vlans),
                }
            };
            // The tap exists on the system either way; register it before
            // checking the attach so teardown releases it.
            self.taps.push(tap);
            attached?;
        }

        let ssh_port = utils::find_free_tcp_port()?;
        let taps = self
            .taps
            .iter()
            .enumerate()
            .map(|(i, tap)| TapAttachment {
                tap_name: tap.name().into(),
                mac: utils::derive_mac(&cfg.run_prefix, self.nic_base + 1 + i as u8),
            })
            .collect();
        let spec = VmSpec {
            name: format!("{}-{}", cfg.run_prefix, self.name),
            overlay: overlay_path,
            memory_mb: self.memory_mb,
            ssh_port,
            mgmt_mac: utils::derive_mac(&cfg.run_prefix, self.nic_base),
            taps,
        };
        self.vm = Some(qemu::launch(&spec)?);
        self.channel = Some(GuestChannel::new(
            &self.name,
            ssh_port,
            cfg.credentials.clone(),
            cfg.command_timeout,
        ));
        self.ssh_port = Some(ssh_port);
        Ok(())
    }

    /// Block until the guest answers an authenticated probe, or fail.
    ///
    /// The probe also watches the hypervisor process: a guest that dies
    /// mid-boot cancels the wait immediately instead of consuming the
    /// whole readiness budget.
    pub fn await_ready(&mut self, multi: &MultiProgress, cfg: &RunConfig) -> Result<()> {
        self.require(NodeState::Booting, "wait for readiness")?;
        let name = self.name.clone();
        let bar = progress::readiness_bar(multi, &name);

        let vm = self.vm.as_mut();
        let channel = self.channel.as_ref();
        let (Some(vm), Some(channel)) = (vm, channel) else {
            progress::finish(&bar, format!("{name}: no hypervisor handle"));
            return Err(Error::Internal(format!(
                "{name} is booting without a hypervisor handle"
            )));
        };
        let outcome = utils::wait_for_readiness(
            &bar,
            &format!("{name}: waiting for ssh"),
            || {
                vm.check_alive()?;
                channel.probe()
            },
            cfg.ready_timeout,
            cfg.ready_poll,
        );

        match outcome {
            Ok(ReadyWait::Ready { attempts }) => {
                progress::finish(&bar, format!("{name}: ssh ready ({attempts} probes)"));
                self.state = NodeState::Ready;
                Ok(())
            }
            Ok(ReadyWait::TimedOut { attempts }) => {
                progress::finish(&bar, format!("{name}: unreachable"));
                self.state = NodeState::Failed;
                Err(Error::GuestUnreachable {
                    host: name,
                    attempts,
                })
            }
            Err(e) => {
                progress::finish(&bar, format!("{name}: boot failed"));
                self.state = NodeState::Failed;
                Err(e)
            }
        }
    }

    /// Apply the host's network identity: NICs up, the address on the
    /// first NIC, an optional default route, name resolution for peers.
    pub fn configure(
        &mut self,
        address: &str,
        gateway: Option<&str>,
        hosts_block: &str,
    ) -> Result<()> {
        let ifaces: Vec<String> = self.links.iter().map(|l| l.guest_iface.clone()).collect();
        let script = render_setup_script(&self.name, &ifaces, address, gateway, hosts_block);
        self.apply_setup(&script)
    }

    /// Run a prepared setup script over the channel and mark the node
    /// Running. Shared with routers, which render a different script.
    pub(crate) fn apply_setup(&mut self, script: &str) -> Result<()> {
        self.require(NodeState::Ready, "configure")?;
        let applied = self.channel_ref()?.execute(script);
        match applied {
            Ok(_) => {
                self.state = NodeState::Running;
                Ok(())
            }
            Err(e) => {
                self.state = NodeState::Failed;
                Err(e)
            }
        }
    }

    /// Channel access for router configuration, before the node is
    /// Running.
    pub(crate) fn channel_for_setup(&self) -> Result<&GuestChannel> {
        self.require(NodeState::Ready, "configure")?;
        self.channel_ref()
    }

    pub(crate) fn mark_running(&mut self) -> Result<()> {
        self.require(NodeState::Ready, "configure")?;
        self.state = NodeState::Running;
        Ok(())
    }

    pub(crate) fn mark_failed(&mut self) {
        self.state = NodeState::Failed;
    }

    /// Run a command on the guest, failing on non-zero exit.
    pub fn execute(&self, command: &str) -> Result<CommandOutput> {
        self.require(NodeState::Running, "run a command")?;
        self.channel_ref()?.execute(command)
    }

    /// Borrow the channel of a Running node, for callers that interpret
    /// exit codes themselves.
    pub fn channel(&self) -> Result<&GuestChannel> {
        self.require(NodeState::Running, "use the guest channel")?;
        self.channel_ref()
    }

    fn channel_ref(&self) -> Result<&GuestChannel> {
        self.channel
            .as_ref()
            .ok_or_else(|| Error::Internal(format!("{} has no guest channel", self.name)))
    }

    /// Release everything the node acquired, in reverse order of
    /// acquisition: hypervisor first, then taps, then the overlay.
    ///
    /// Best-effort: every step runs regardless of earlier failures, and
    /// the failures come back labelled for the caller's report. Valid
    /// from any state; a second call is a no-op.
    pub fn teardown(
        &mut self,
        store: &OverlayStore,
        allocator: &Mutex<TapAllocator>,
    ) -> Vec<(String, Error)> {
        if self.state == NodeState::TornDown {
            debug!("{} already torn down", self.name);
            return Vec::new();
        }
        let mut failures = Vec::new();

        if let Some(mut vm) = self.vm.take() {
            if let Err(e) = vm.terminate() {
                failures.push((format!("{}/hypervisor", self.name), e));
            }
        }
        self.channel = None;

        {
            let mut allocator = allocator.lock().unwrap_or_else(PoisonError::into_inner);
            for tap in self.taps.drain(..) {
                if let Err(e) = allocator.release(&tap) {
                    failures.push((format!("{}/{}", self.name, tap.name()), e));
                }
            }
        }

        if let Some(overlay) = self.overlay.take() {
            if let Err(e) = store.destroy(&overlay) {
                failures.push((format!("{}/overlay", self.name), e));
            }
        }

        self.state = NodeState::TornDown;
        failures
    }
}

/// Raise an experiment NIC, drop whatever addresses the base image left
/// on it, and turn off the offloads that corrupt checksums on emulated
/// e1000 devices.
pub(crate) fn prep_iface(iface: &str) -> String {
    formatdoc! {"
        ip link set {iface} up
        ip addr flush dev {iface} || true
        ethtool -K {iface} gro off gso off tso off ufo off || true
    "}
}

/// Stale firewall rules in the base image would make reachability
/// results meaningless.
pub(crate) const PERMISSIVE_FIREWALL: &str = "if command -v iptables >/dev/null; then
    iptables -F
    iptables -P INPUT ACCEPT
    iptables -P FORWARD ACCEPT
    iptables -P OUTPUT ACCEPT
fi
";

/// Render the one-shot setup script a host runs over its channel.
///
/// Interface names, addresses, and node names all passed description
/// validation, so they are shell-safe without quoting.
pub(crate) fn render_setup_script(
    name: &str,
    ifaces: &[String],
    address: &str,
    gateway: Option<&str>,
    hosts_block: &str,
) -> String {
    let mut script = formatdoc! {"
        set -eu
        hostname {name}
    "};
    for iface in ifaces {
        script.push_str(&prep_iface(iface));
    }
    if let Some(first) = ifaces.first() {
        script.push_str(&format!("ip addr replace {address} dev {first}\n"));
    }
    if let Some(gateway) = gateway {
        script.push_str(&format!("ip route replace default via {gateway}\n"));
    }
    script.push_str(PERMISSIVE_FIREWALL);
    if !hosts_block.is_empty() {
        script.push_str(&formatdoc! {"
            cat >>/etc/hosts <<'VMLAB'
            {hosts_block}
            VMLAB
        "});
    }
    script
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_host() -> HostNode {
        HostNode::new("h1", 512, 0, Vec::new())
    }

    #[test]
    fn test_state_display_words() {
        assert_eq!(NodeState::Created.to_string(), "created");
        assert_eq!(NodeState::TornDown.to_string(), "torn-down");
    }

    #[test]
    fn test_execute_refused_before_running() {
        let host = bare_host();
        let err = host.execute("true").unwrap_err();
        assert!(err.to_string().contains("h1 is created"));
        assert!(err.to_string().contains("cannot run a command"));
    }

    #[test]
    fn test_configure_refused_before_ready() {
        let mut host = bare_host();
        assert!(matches!(
            host.configure("10.0.0.10/24", None, "").unwrap_err(),
            Error::InvalidState { .. }
        ));
    }

    #[test]
    fn test_teardown_before_start_is_clean_and_idempotent() {
        let mut host = bare_host();
        let store = OverlayStore::new("/nonexistent/base.qcow2", "/nonexistent/run");
        let allocator = Mutex::new(TapAllocator::new("vk0000"));
        assert!(host.teardown(&store, &allocator).is_empty());
        assert_eq!(host.state(), NodeState::TornDown);
        assert!(host.teardown(&store, &allocator).is_empty());
    }

    #[test]
    fn test_setup_script_layout() {
        let script = render_setup_script(
            "h1",
            &["ens4".into(), "ens5".into()],
            "10.0.0.10/24",
            Some("10.0.0.1"),
            "10.0.0.11 h2",
        );
        assert!(script.starts_with("set -eu\n"));
        assert!(script.contains("hostname h1\n"));
        assert!(script.contains("ip link set ens4 up\n"));
        assert!(script.contains("ip link set ens5 up\n"));
        assert!(script.contains("ip addr replace 10.0.0.10/24 dev ens4\n"));
        assert!(script.contains("ip route replace default via 10.0.0.1\n"));
        assert!(script.contains("10.0.0.11 h2\nVMLAB\n"));
    }

    #[test]
    fn test_setup_script_preps_every_nic() {
        let script =
            render_setup_script("h1", &["ens4".into(), "ens5".into()], "10.0.0.10/24", None, "");
        for iface in ["ens4", "ens5"] {
            assert!(script.contains(&format!("ip addr flush dev {iface} || true\n")));
            assert!(script
                .contains(&format!("ethtool -K {iface} gro off gso off tso off ufo off || true\n")));
        }
        // The flush happens before the address lands.
        let flush = script.find("ip addr flush dev ens4").unwrap();
        let addr = script.find("ip addr replace").unwrap();
        assert!(flush < addr);
        assert!(script.contains("iptables -P FORWARD ACCEPT\n"));
    }

    #[test]
    fn test_setup_script_without_gateway_or_peers() {
        let script = render_setup_script("h1", &["ens4".into()], "10.0.0.10/24", None, "");
        assert!(!script.contains("default via"));
        assert!(!script.contains("/etc/hosts"));
    }
}
