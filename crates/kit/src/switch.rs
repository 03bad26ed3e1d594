//! VLAN-aware wrapper over an Open vSwitch bridge.
//!
//! Packet forwarding belongs to OVS. This component translates topology
//! intent (access port on VLAN 100, trunk carrying 100 and 200) into
//! `ovs-vsctl` calls, refuses contradictory roles, and reverses the
//! configuration on teardown: ports first, then the bridge.

use std::collections::BTreeMap;
use std::process::Command;

use tracing::{debug, warn};

use crate::command_run::CommandRun;
use crate::errors::{Error, Result};

/// VLAN role a port holds on a bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortRole {
    /// Untagged member of exactly one VLAN.
    Access(u16),
    /// Tagged member of one or more VLANs.
    Trunk(Vec<u16>),
    /// No VLAN intent.
    Plain,
}

impl PortRole {
    fn describe(&self) -> String {
        match self {
            PortRole::Access(vlan) => format!("access vlan {vlan}"),
            PortRole::Trunk(vlans) => format!("trunk {vlans:?}"),
            PortRole::Plain => "plain".into(),
        }
    }
}

/// In-process ledger of VLAN intent per port. Role conflicts are decided
/// here, before anything touches OVS.
#[derive(Debug, Default)]
struct VlanTable {
    ports: BTreeMap<String, PortRole>,
}

/// What `admit` decided about a requested role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    /// New port; apply the configuration.
    New,
    /// Identical to the role already held; nothing to do.
    AlreadyHeld,
}

impl VlanTable {
    fn admit(&mut self, bridge: &str, port: &str, role: &PortRole) -> Result<Admission> {
        if let PortRole::Trunk(vlans) = role {
            if vlans.is_empty() {
                return Err(Error::VlanConfig {
                    bridge: bridge.into(),
                    port: port.into(),
                    reason: "trunk role needs at least one VLAN".into(),
                });
            }
        }
        match self.ports.get(port) {
            None => {
                self.ports.insert(port.into(), role.clone());
                Ok(Admission::New)
            }
            Some(held) if held == role => Ok(Admission::AlreadyHeld),
            Some(held) => Err(Error::VlanConfig {
                bridge: bridge.into(),
                port: port.into(),
                reason: format!(
                    "port already holds role {}, refusing {}",
                    held.describe(),
                    role.describe()
                ),
            }),
        }
    }

    fn forget(&mut self, port: &str) {
        self.ports.remove(port);
    }
}

/// One OVS bridge plus the VLAN intent applied to its ports.
#[derive(Debug)]
pub struct SwitchNode {
    name: String,
    bridge: String,
    table: VlanTable,
    port_order: Vec<String>,
}

impl SwitchNode {
    /// Create the bridge (`<run prefix>-<name>`) and bring its device up.
    pub fn create(run_prefix: &str, name: &str) -> Result<Self> {
        let bridge = format!("{run_prefix}-{name}");
        Command::new("ovs-vsctl")
            .args(["--may-exist", "add-br", &bridge])
            .run()?;
        Command::new("ip").args(["link", "set", &bridge, "up"]).run()?;
        debug!("created bridge {bridge} for switch {name}");
        Ok(Self {
            name: name.to_owned(),
            bridge,
            table: VlanTable::default(),
            port_order: Vec::new(),
        })
    }

    /// Topology-level name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// System bridge name.
    pub fn bridge(&self) -> &str {
        &self.bridge
    }

    /// Attach a tap with no VLAN intent.
    pub fn add_port(&mut self, tap: &str) -> Result<()> {
        self.admit_and_attach(tap, PortRole::Plain)
    }

    /// Attach a tap as an untagged member of exactly one VLAN.
    pub fn add_access_port(&mut self, tap: &str, vlan: u16) -> Result<()> {
        self.admit_and_attach(tap, PortRole::Access(vlan))
    }

    /// Attach a tap as a tagged trunk carrying `vlans`.
    pub fn add_trunk_port(&mut self, tap: &str, vlans: &[u16]) -> Result<()> {
        self.admit_and_attach(tap, PortRole::Trunk(vlans.to_vec()))
    }

    fn admit_and_attach(&mut self, tap: &str, role: PortRole) -> Result<()> {
        if self.table.admit(&self.bridge, tap, &role)? == Admission::AlreadyHeld {
            debug!("port {tap} already holds {} on {}", role.describe(), self.bridge);
            return Ok(());
        }
        if let Err(e) = self.attach(tap, &role) {
            self.table.forget(tap);
            return Err(e);
        }
        self.port_order.push(tap.to_owned());
        debug!("attached {tap} to {} as {}", self.bridge, role.describe());
        Ok(())
    }

    fn attach(&self, tap: &str, role: &PortRole) -> Result<()> {
        Command::new("ovs-vsctl")
            .args(["add-port", &self.bridge, tap])
            .run()?;
        match role {
            PortRole::Plain => Ok(()),
            PortRole::Access(vlan) => Command::new("ovs-vsctl")
                .args(["set", "port", tap, &format!("tag={vlan}")])
                .run(),
            PortRole::Trunk(vlans) => {
                let list = vlans
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                Command::new("ovs-vsctl")
                    .args(["set", "port", tap, &format!("trunks={list}")])
                    .run()
            }
        }
    }

    /// Remove every port, then the bridge itself. Failures on individual
    /// ports do not stop the rest; everything is attempted and reported
    /// together.
    pub fn teardown(&mut self) -> Result<()> {
        let mut failures: Vec<String> = Vec::new();
        for tap in self.port_order.drain(..).rev() {
            self.table.forget(&tap);
            if let Err(e) = Command::new("ovs-vsctl")
                .args(["--if-exists", "del-port", &self.bridge, &tap])
                .run()
            {
                warn!("could not remove port {tap} from {}: {e}", self.bridge);
                failures.push(format!("port {tap}: {e}"));
            }
        }
        if let Err(e) = Command::new("ovs-vsctl")
            .args(["--if-exists", "del-br", &self.bridge])
            .run()
        {
            failures.push(format!("bridge {}: {e}", self.bridge));
        } else {
            debug!("removed bridge {}", self.bridge);
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Subprocess {
                status: format!("switch {} teardown incomplete", self.name),
                stderr: failures.join("\n"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> VlanTable {
        VlanTable::default()
    }

    #[test]
    fn test_new_roles_are_admitted() {
        let mut t = table();
        assert_eq!(
            t.admit("br0", "t0", &PortRole::Access(100)).unwrap(),
            Admission::New
        );
        assert_eq!(
            t.admit("br0", "t1", &PortRole::Trunk(vec![100, 200])).unwrap(),
            Admission::New
        );
        assert_eq!(t.admit("br0", "t2", &PortRole::Plain).unwrap(), Admission::New);
    }

    #[test]
    fn test_identical_role_is_idempotent() {
        let mut t = table();
        t.admit("br0", "t0", &PortRole::Access(100)).unwrap();
        assert_eq!(
            t.admit("br0", "t0", &PortRole::Access(100)).unwrap(),
            Admission::AlreadyHeld
        );
    }

    #[test]
    fn test_access_port_refuses_trunk_role() {
        let mut t = table();
        t.admit("br0", "t0", &PortRole::Access(100)).unwrap();
        let err = t
            .admit("br0", "t0", &PortRole::Trunk(vec![100, 200]))
            .unwrap_err();
        match err {
            Error::VlanConfig { port, reason, .. } => {
                assert_eq!(port, "t0");
                assert!(reason.contains("access vlan 100"));
                assert!(reason.contains("trunk"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_access_port_refuses_other_vlan() {
        let mut t = table();
        t.admit("br0", "t0", &PortRole::Access(100)).unwrap();
        assert!(t.admit("br0", "t0", &PortRole::Access(200)).is_err());
    }

    #[test]
    fn test_trunk_refuses_access_role() {
        let mut t = table();
        t.admit("br0", "t1", &PortRole::Trunk(vec![100])).unwrap();
        assert!(t.admit("br0", "t1", &PortRole::Access(100)).is_err());
    }

    #[test]
    fn test_empty_trunk_is_rejected() {
        let mut t = table();
        let err = t.admit("br0", "t1", &PortRole::Trunk(vec![])).unwrap_err();
        match err {
            Error::VlanConfig { reason, .. } => {
                assert!(reason.contains("at least one VLAN"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
