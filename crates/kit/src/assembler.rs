//! Topology assembly, operation, and teardown.
//!
//! Assembly is dependency-ordered: switches first, then every guest in a
//! parallel boot wave, then a parallel configure wave once all guests
//! answer their channels. Any failure rolls the whole topology back
//! before the error reaches the caller, so a failed `assemble` leaves no
//! bridge, tap, process, or overlay behind.
//!
//! Teardown is the mirror image, reverse-ordered and best-effort: every
//! node is attempted regardless of earlier failures, and the failures
//! come back aggregated in one [`TeardownReport`].

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};

use indicatif::MultiProgress;
use tracing::{debug, info, warn};

use crate::checks::{self, CheckResult};
use crate::config::RunConfig;
use crate::errors::{Error, Result, TeardownReport};
use crate::host::{HostNode, LinkRequest, NodeState};
use crate::overlay::OverlayStore;
use crate::progress;
use crate::router::{RouterNic, RouterNode, SubInterfacePlan};
use crate::ssh::GuestChannel;
use crate::switch::{PortRole, SwitchNode};
use crate::tap::TapAllocator;
use crate::topology::{
    default_guest_iface, RouterSpec, SubInterfaceSpec, TopologyDescription,
};

/// A guest-backed node of either kind, uniform where the lifecycle is
/// uniform. Configuration differs per kind and is dispatched explicitly.
enum NodeHandle {
    Host(HostNode),
    Router(RouterNode),
}

impl NodeHandle {
    fn name(&self) -> &str {
        match self {
            NodeHandle::Host(h) => h.name(),
            NodeHandle::Router(r) => r.name(),
        }
    }

    fn state(&self) -> NodeState {
        match self {
            NodeHandle::Host(h) => h.state(),
            NodeHandle::Router(r) => r.state(),
        }
    }

    fn ssh_port(&self) -> Option<u16> {
        match self {
            NodeHandle::Host(h) => h.ssh_port(),
            NodeHandle::Router(r) => r.ssh_port(),
        }
    }

    fn start(
        &mut self,
        cfg: &RunConfig,
        store: &OverlayStore,
        allocator: &Mutex<TapAllocator>,
    ) -> Result<()> {
        match self {
            NodeHandle::Host(h) => h.start(cfg, store, allocator),
            NodeHandle::Router(r) => r.start(cfg, store, allocator),
        }
    }

    fn await_ready(&mut self, multi: &MultiProgress, cfg: &RunConfig) -> Result<()> {
        match self {
            NodeHandle::Host(h) => h.await_ready(multi, cfg),
            NodeHandle::Router(r) => r.await_ready(multi, cfg),
        }
    }

    fn channel(&self) -> Result<&GuestChannel> {
        match self {
            NodeHandle::Host(h) => h.channel(),
            NodeHandle::Router(r) => r.channel(),
        }
    }

    fn teardown(
        &mut self,
        store: &OverlayStore,
        allocator: &Mutex<TapAllocator>,
    ) -> Vec<(String, Error)> {
        match self {
            NodeHandle::Host(h) => h.teardown(store, allocator),
            NodeHandle::Router(r) => r.teardown(store, allocator),
        }
    }
}

/// One row of status for display.
pub struct NodeSummary {
    pub name: String,
    pub state: NodeState,
    pub ssh_port: Option<u16>,
}

/// A live (or partially built) topology and every resource it owns.
pub struct Topology {
    description: TopologyDescription,
    config: RunConfig,
    store: OverlayStore,
    allocator: Mutex<TapAllocator>,
    switches: Vec<Arc<Mutex<SwitchNode>>>,
    nodes: Vec<NodeHandle>,
    torn_down: bool,
}

/// Validate a description and bring it up completely.
///
/// Returns the running topology, or an error after rolling back whatever
/// had been built by the time of the failure.
pub fn assemble(description: TopologyDescription, config: RunConfig) -> Result<Topology> {
    description.validate()?;
    let store = OverlayStore::new(config.base_image.clone(), config.work_dir.clone());
    store.verify_base()?;
    std::fs::create_dir_all(&config.work_dir)?;
    let allocator = Mutex::new(TapAllocator::new(&config.run_prefix));

    let mut topology = Topology {
        description,
        config,
        store,
        allocator,
        switches: Vec::new(),
        nodes: Vec::new(),
        torn_down: false,
    };
    if let Err(e) = topology.bring_up() {
        warn!("assembly of {} failed, rolling back: {e}", topology.description.name);
        if let Err(report) = topology.teardown() {
            warn!("rollback finished with failures: {report}");
        }
        return Err(e);
    }
    Ok(topology)
}

impl Topology {
    fn bring_up(&mut self) -> Result<()> {
        info!(
            "assembling {} as run {}",
            self.description.name, self.config.run_prefix
        );
        self.create_switches()?;
        self.nodes = plan_nodes(&self.description, &self.switches, self.config.memory_mb)?;
        self.boot_wave()?;
        self.configure_wave()?;
        info!("topology {} is running", self.description.name);
        Ok(())
    }

    fn create_switches(&mut self) -> Result<()> {
        for spec in &self.description.switches {
            let switch = SwitchNode::create(&self.config.run_prefix, &spec.name)?;
            debug!("switch {} up as bridge {}", spec.name, switch.bridge());
            self.switches.push(Arc::new(Mutex::new(switch)));
        }
        Ok(())
    }

    /// Boot every guest in parallel and wait for all channels.
    fn boot_wave(&mut self) -> Result<()> {
        let cfg = &self.config;
        let store = &self.store;
        let allocator = &self.allocator;
        let multi = progress::run_progress();

        let results: Vec<(String, Result<()>)> = std::thread::scope(|scope| {
            let workers: Vec<_> = self
                .nodes
                .iter_mut()
                .map(|node| {
                    let multi = &multi;
                    scope.spawn(move || {
                        let name = node.name().to_owned();
                        let outcome = node
                            .start(cfg, store, allocator)
                            .and_then(|()| node.await_ready(multi, cfg));
                        (name, outcome)
                    })
                })
                .collect();
            workers
                .into_iter()
                .map(|worker| {
                    worker.join().unwrap_or_else(|_| {
                        (
                            "boot worker".to_owned(),
                            Err(Error::Internal("boot worker panicked".into())),
                        )
                    })
                })
                .collect()
        });
        first_failure(results, "boot")
    }

    /// Configure every Running-to-be guest in parallel.
    fn configure_wave(&mut self) -> Result<()> {
        let hosts_block = render_hosts_block(&self.description.address_map());
        let description = &self.description;

        let results: Vec<(String, Result<()>)> = std::thread::scope(|scope| {
            let workers: Vec<_> = self
                .nodes
                .iter_mut()
                .map(|node| {
                    let hosts_block = hosts_block.as_str();
                    scope.spawn(move || {
                        let name = node.name().to_owned();
                        (name, configure_node(node, description, hosts_block))
                    })
                })
                .collect();
            workers
                .into_iter()
                .map(|worker| {
                    worker.join().unwrap_or_else(|_| {
                        (
                            "configure worker".to_owned(),
                            Err(Error::Internal("configure worker panicked".into())),
                        )
                    })
                })
                .collect()
        });
        first_failure(results, "configure")
    }

    /// Run the description's connectivity checks over the live channels.
    pub fn run_checks(&self) -> Result<Vec<CheckResult>> {
        checks::run_checks(&self.description, |name| {
            let node = self
                .nodes
                .iter()
                .find(|n| n.name() == name)
                .ok_or_else(|| Error::Internal(format!("check names unknown node {name}")))?;
            node.channel()
        })
    }

    /// Run a command on a named node's guest.
    pub fn execute_on(&self, node: &str, command: &str) -> Result<crate::ssh::CommandOutput> {
        let handle = self
            .nodes
            .iter()
            .find(|n| n.name() == node)
            .ok_or_else(|| Error::TopologyValidation {
                reason: format!("no node named {node}"),
            })?;
        handle.channel()?.execute_unchecked(command)
    }

    pub fn description(&self) -> &TopologyDescription {
        &self.description
    }

    pub fn run_prefix(&self) -> &str {
        &self.config.run_prefix
    }

    pub fn guest_user(&self) -> &str {
        &self.config.credentials.user
    }

    /// Per-node status rows, in description order.
    pub fn node_summaries(&self) -> Vec<NodeSummary> {
        self.nodes
            .iter()
            .map(|node| NodeSummary {
                name: node.name().to_owned(),
                state: node.state(),
                ssh_port: node.ssh_port(),
            })
            .collect()
    }

    /// Release everything, nodes in reverse order first, then switches.
    ///
    /// Best-effort throughout; failures are aggregated into one
    /// [`TeardownReport`] rather than stopping the sweep. Idempotent.
    pub fn teardown(&mut self) -> Result<()> {
        if self.torn_down {
            debug!("topology {} already torn down", self.description.name);
            return Ok(());
        }
        info!("tearing down run {}", self.config.run_prefix);
        let mut report = TeardownReport::default();

        for node in self.nodes.iter_mut().rev() {
            for (label, error) in node.teardown(&self.store, &self.allocator) {
                report.push(label, error);
            }
        }
        for switch in self.switches.iter().rev() {
            let mut switch = switch.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = switch.teardown() {
                report.push(switch.name().to_owned(), e);
            }
        }
        // The run directory only vanishes once nothing is left in it.
        let _ = std::fs::remove_dir(&self.config.work_dir);

        self.torn_down = true;
        report.into_result()
    }
}

fn configure_node(
    node: &mut NodeHandle,
    description: &TopologyDescription,
    hosts_block: &str,
) -> Result<()> {
    match node {
        NodeHandle::Host(host) => {
            let spec = description
                .hosts
                .iter()
                .find(|h| h.name == host.name())
                .ok_or_else(|| {
                    Error::Internal(format!("no description for host {}", host.name()))
                })?;
            host.configure(&spec.address, spec.gateway.as_deref(), hosts_block)
        }
        NodeHandle::Router(router) => router.configure(hosts_block),
    }
}

/// Turn descriptions into node handles wired to their switches.
///
/// Each node takes a contiguous block of per-run NIC indexes for MAC
/// derivation: one for the management NIC, one per link.
fn plan_nodes(
    description: &TopologyDescription,
    switches: &[Arc<Mutex<SwitchNode>>],
    default_memory_mb: u32,
) -> Result<Vec<NodeHandle>> {
    let switch_by_name: BTreeMap<&str, &Arc<Mutex<SwitchNode>>> = description
        .switches
        .iter()
        .map(|s| s.name.as_str())
        .zip(switches.iter())
        .collect();
    let resolve = |name: &str| -> Result<Arc<Mutex<SwitchNode>>> {
        switch_by_name
            .get(name)
            .map(|arc| Arc::clone(arc))
            .ok_or_else(|| Error::Internal(format!("switch {name} was not created")))
    };

    let mut nodes = Vec::new();
    let mut nic_cursor: u16 = 0;
    let mut claim_nic_block = |links: usize| -> Result<u8> {
        let base = u8::try_from(nic_cursor).map_err(|_| Error::TopologyValidation {
            reason: "topology needs more than 255 NICs".into(),
        })?;
        nic_cursor += 1 + links as u16;
        Ok(base)
    };

    for host in &description.hosts {
        let mut links = Vec::with_capacity(host.links.len());
        for (i, link) in host.links.iter().enumerate() {
            let role = match link.vlan {
                Some(vlan) => PortRole::Access(vlan),
                None => PortRole::Plain,
            };
            links.push(LinkRequest {
                switch: resolve(&link.switch)?,
                role,
                guest_iface: link
                    .guest_iface
                    .clone()
                    .unwrap_or_else(|| default_guest_iface(i)),
            });
        }
        let base = claim_nic_block(host.links.len())?;
        let memory = host.memory_mb.unwrap_or(default_memory_mb);
        nodes.push(NodeHandle::Host(HostNode::new(
            host.name.as_str(),
            memory,
            base,
            links,
        )));
    }

    for router in &description.routers {
        let mut links = Vec::with_capacity(router.links.len());
        let mut nics = Vec::with_capacity(router.links.len());
        let mut ifaces = Vec::with_capacity(router.links.len());
        for (i, link) in router.links.iter().enumerate() {
            let role = if link.vlans.is_empty() {
                PortRole::Plain
            } else {
                PortRole::Trunk(link.vlans.clone())
            };
            let iface = link
                .guest_iface
                .clone()
                .unwrap_or_else(|| default_guest_iface(i));
            links.push(LinkRequest {
                switch: resolve(&link.switch)?,
                role,
                guest_iface: iface.clone(),
            });
            nics.push(RouterNic {
                iface: iface.clone(),
                address: link.address.clone(),
            });
            ifaces.push(iface);
        }
        let subinterfaces = router
            .subinterfaces
            .iter()
            .map(|subif| {
                Ok(SubInterfacePlan {
                    parent_iface: subif_parent_iface(router, subif, &ifaces)?,
                    vlan: subif.vlan,
                    address: subif.address.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let base = claim_nic_block(router.links.len())?;
        let memory = router.memory_mb.unwrap_or(default_memory_mb);
        nodes.push(NodeHandle::Router(RouterNode::new(
            router.name.as_str(),
            memory,
            base,
            links,
            nics,
            subinterfaces,
            router.routes.clone(),
        )));
    }
    Ok(nodes)
}

/// Guest-side NIC a sub-interface hangs off: the link named by its
/// `switch`, or the router's first link when unset.
fn subif_parent_iface(
    router: &RouterSpec,
    subif: &SubInterfaceSpec,
    ifaces: &[String],
) -> Result<String> {
    let wanted = subif
        .switch
        .as_deref()
        .or_else(|| router.links.first().map(|l| l.switch.as_str()));
    router
        .links
        .iter()
        .position(|l| Some(l.switch.as_str()) == wanted)
        .and_then(|i| ifaces.get(i))
        .cloned()
        .ok_or_else(|| Error::DependencyOrder {
            router: router.name.clone(),
            reason: format!(
                "sub-interface for VLAN {} names a switch the router has no link to",
                subif.vlan
            ),
        })
}

/// `/etc/hosts` lines for every addressed node, sorted by name.
fn render_hosts_block(addresses: &BTreeMap<String, Ipv4Addr>) -> String {
    addresses
        .iter()
        .map(|(name, ip)| format!("{ip} {name}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn first_failure(results: Vec<(String, Result<()>)>, phase: &str) -> Result<()> {
    let mut first = None;
    for (name, result) in results {
        if let Err(e) = result {
            warn!("{phase} failed for {name}: {e}");
            if first.is_none() {
                first = Some(e);
            }
        }
    }
    match first {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::RouterLink;

    #[test]
    fn test_render_hosts_block_is_sorted_lines() {
        let mut map = BTreeMap::new();
        map.insert("h2".to_owned(), Ipv4Addr::new(10, 0, 0, 11));
        map.insert("h1".to_owned(), Ipv4Addr::new(10, 0, 0, 10));
        assert_eq!(render_hosts_block(&map), "10.0.0.10 h1\n10.0.0.11 h2");
        assert_eq!(render_hosts_block(&BTreeMap::new()), "");
    }

    fn two_link_router() -> RouterSpec {
        RouterSpec {
            name: "r0".into(),
            memory_mb: None,
            links: vec![
                RouterLink {
                    switch: "sw0".into(),
                    vlans: vec![100],
                    address: None,
                    guest_iface: None,
                },
                RouterLink {
                    switch: "sw1".into(),
                    vlans: vec![200],
                    address: None,
                    guest_iface: None,
                },
            ],
            subinterfaces: vec![],
            routes: vec![],
        }
    }

    #[test]
    fn test_subif_parent_defaults_to_first_link() {
        let router = two_link_router();
        let ifaces = vec!["ens4".to_owned(), "ens5".to_owned()];
        let subif = SubInterfaceSpec {
            vlan: 100,
            address: "10.0.100.1/24".into(),
            switch: None,
        };
        assert_eq!(subif_parent_iface(&router, &subif, &ifaces).unwrap(), "ens4");
    }

    #[test]
    fn test_subif_parent_follows_named_switch() {
        let router = two_link_router();
        let ifaces = vec!["ens4".to_owned(), "ens5".to_owned()];
        let subif = SubInterfaceSpec {
            vlan: 200,
            address: "10.0.200.1/24".into(),
            switch: Some("sw1".into()),
        };
        assert_eq!(subif_parent_iface(&router, &subif, &ifaces).unwrap(), "ens5");
        let missing = SubInterfaceSpec {
            vlan: 300,
            address: "10.0.30.1/24".into(),
            switch: Some("sw9".into()),
        };
        assert!(subif_parent_iface(&router, &missing, &ifaces).is_err());
    }

    #[test]
    fn test_first_failure_keeps_the_first_error() {
        let results = vec![
            ("h1".to_owned(), Ok(())),
            (
                "h2".to_owned(),
                Err(Error::Internal("first".into())),
            ),
            (
                "h3".to_owned(),
                Err(Error::Internal("second".into())),
            ),
        ];
        let err = first_failure(results, "boot").unwrap_err();
        assert!(err.to_string().contains("first"));
        assert!(first_failure(vec![("h1".to_owned(), Ok(()))], "boot").is_ok());
    }
}
