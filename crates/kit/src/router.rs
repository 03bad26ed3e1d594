//! Router nodes: guests that forward between segments.
//!
//! A router is a [`HostNode`] whose configuration step goes further:
//! enable forwarding, address each NIC, break trunk NICs out into VLAN
//! sub-interfaces, then install static routes most-specific-first so a
//! route never lands before the sub-interface or covering route it
//! depends on.

use std::sync::Mutex;

use indicatif::MultiProgress;
use indoc::formatdoc;

use crate::config::RunConfig;
use crate::errors::{Error, Result};
use crate::host::{HostNode, LinkRequest, NodeState};
use crate::overlay::OverlayStore;
use crate::ssh::{CommandOutput, GuestChannel};
use crate::tap::TapAllocator;
use crate::topology::RouteSpec;

/// One router NIC: the guest-side device and its address, when the NIC
/// is routed rather than a bare trunk.
pub struct RouterNic {
    pub iface: String,
    pub address: Option<String>,
}

/// One VLAN sub-interface to carve out of a trunk NIC.
pub struct SubInterfacePlan {
    pub parent_iface: String,
    pub vlan: u16,
    pub address: String,
}

pub struct RouterNode {
    inner: HostNode,
    /// Parallel to the inner node's links.
    nics: Vec<RouterNic>,
    subinterfaces: Vec<SubInterfacePlan>,
    routes: Vec<RouteSpec>,
}

/// Guest-side name of a VLAN sub-interface.
pub(crate) fn vlan_iface(parent: &str, vlan: u16) -> String {
    format!("{parent}.{vlan}")
}

/// Routes in application order: longest destination prefix first, the
/// default route last, declaration order breaking ties. Applying in this
/// order means a covering route or sub-interface subnet is always in
/// place before anything that relies on it.
pub(crate) fn order_routes(routes: &[RouteSpec]) -> Vec<&RouteSpec> {
    let mut ordered: Vec<&RouteSpec> = routes.iter().collect();
    ordered.sort_by_key(|r| std::cmp::Reverse(route_prefix_len(r)));
    ordered
}

fn route_prefix_len(route: &RouteSpec) -> i16 {
    if route.dest == "default" {
        return -1;
    }
    crate::topology::parse_cidr(&route.dest)
        .map(|(_, prefix)| i16::from(prefix))
        .unwrap_or(-1)
}

/// The part of router setup that is one shell script: identity,
/// forwarding, prepping the trunk and routed NICs, peer name resolution.
/// Addresses, sub-interfaces, and routes follow as separate commands.
pub(crate) fn render_router_base_script(
    name: &str,
    ifaces: &[String],
    hosts_block: &str,
) -> String {
    let mut script = formatdoc! {"
        set -eu
        hostname {name}
        sysctl -wq net.ipv4.ip_forward=1
    "};
    for iface in ifaces {
        script.push_str(&crate::host::prep_iface(iface));
    }
    script.push_str(crate::host::PERMISSIVE_FIREWALL);
    if !hosts_block.is_empty() {
        script.push_str(&formatdoc! {"
            cat >>/etc/hosts <<'VMLAB'
            {hosts_block}
            VMLAB
        "});
    }
    script
}

impl RouterNode {
    pub fn new(
        name: impl Into<String>,
        memory_mb: u32,
        nic_base: u8,
        links: Vec<LinkRequest>,
        nics: Vec<RouterNic>,
        subinterfaces: Vec<SubInterfacePlan>,
        routes: Vec<RouteSpec>,
    ) -> Self {
        Self {
            inner: HostNode::new(name, memory_mb, nic_base, links),
            nics,
            subinterfaces,
            routes,
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn state(&self) -> NodeState {
        self.inner.state()
    }

    pub fn ssh_port(&self) -> Option<u16> {
        self.inner.ssh_port()
    }

    pub fn start(
        &mut self,
        cfg: &RunConfig,
        store: &OverlayStore,
        allocator: &Mutex<TapAllocator>,
    ) -> Result<()> {
        self.inner.start(cfg, store, allocator)
    }

    pub fn await_ready(&mut self, multi: &MultiProgress, cfg: &RunConfig) -> Result<()> {
        self.inner.await_ready(multi, cfg)
    }

    /// Configure forwarding, addresses, sub-interfaces, and routes, then
    /// mark the node Running.
    pub fn configure(&mut self, hosts_block: &str) -> Result<()> {
        match self.apply(hosts_block) {
            Ok(()) => self.inner.mark_running(),
            Err(e) => {
                self.inner.mark_failed();
                Err(e)
            }
        }
    }

    fn apply(&self, hosts_block: &str) -> Result<()> {
        let channel = self.inner.channel_for_setup()?;
        let ifaces: Vec<String> = self.nics.iter().map(|n| n.iface.clone()).collect();
        channel.execute(&render_router_base_script(
            self.inner.name(),
            &ifaces,
            hosts_block,
        ))?;

        for nic in &self.nics {
            if let Some(address) = &nic.address {
                channel.configure_address(&nic.iface, address)?;
            }
        }

        for subif in &self.subinterfaces {
            let parent = &subif.parent_iface;
            let vlan = subif.vlan;
            let iface = vlan_iface(parent, vlan);
            channel.execute(&format!(
                "ip link add link {parent} name {iface} type vlan id {vlan}"
            ))?;
            channel.configure_address(&iface, &subif.address)?;
        }

        for route in order_routes(&self.routes) {
            channel.configure_route(&route.dest, &route.via)?;
        }
        Ok(())
    }

    pub fn execute(&self, command: &str) -> Result<CommandOutput> {
        self.inner.execute(command)
    }

    pub fn channel(&self) -> Result<&GuestChannel> {
        self.inner.channel()
    }

    pub fn teardown(
        &mut self,
        store: &OverlayStore,
        allocator: &Mutex<TapAllocator>,
    ) -> Vec<(String, Error)> {
        self.inner.teardown(store, allocator)
    }
}
