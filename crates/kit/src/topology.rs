//! Topology descriptions and their validation.
//!
//! A description enumerates switches, hosts, routers, the links between
//! them, address/VLAN assignments, static routes, and the connectivity
//! checks the topology promises. Descriptions arrive either as JSON files
//! or from the built-in preset catalog; either way [`TopologyDescription::validate`]
//! is the gate everything passes before a single resource is created.
//!
//! Guest-side NIC names default to `ens4`, `ens5`, ... in link order (the
//! management NIC boots as `ens3`); descriptions may override per link
//! with `guest_iface` when the base image names devices differently.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Expected outcome of one connectivity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckExpectation {
    /// A single ping must succeed.
    Reachable,
    /// A single ping must fail (isolated segments).
    Isolated,
}

/// One declared connectivity check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckSpec {
    /// Node whose channel issues the ping.
    pub from: String,
    /// Target: a node name or a literal IPv4 address.
    pub to: String,
    pub expect: CheckExpectation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchSpec {
    pub name: String,
}

/// Host attachment to a switch, optionally as an access VLAN member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostLink {
    pub switch: String,
    #[serde(default)]
    pub vlan: Option<u16>,
    /// Guest-side NIC name; defaults to `ens4` + link index.
    #[serde(default)]
    pub guest_iface: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSpec {
    pub name: String,
    /// CIDR assigned to the first experiment NIC.
    pub address: String,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub memory_mb: Option<u32>,
    pub links: Vec<HostLink>,
}

/// Router attachment to a switch. An empty `vlans` set with an `address`
/// is a plain routed NIC; a non-empty set makes the NIC a trunk whose
/// VLANs are broken out by sub-interfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterLink {
    pub switch: String,
    #[serde(default)]
    pub vlans: Vec<u16>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub guest_iface: Option<String>,
}

/// VLAN sub-interface on a router's trunk NIC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubInterfaceSpec {
    pub vlan: u16,
    pub address: String,
    /// Which trunk link carries this VLAN; defaults to the first link.
    #[serde(default)]
    pub switch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSpec {
    /// `default` or a destination CIDR.
    pub dest: String,
    /// Next-hop address.
    pub via: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSpec {
    pub name: String,
    #[serde(default)]
    pub memory_mb: Option<u32>,
    pub links: Vec<RouterLink>,
    #[serde(default)]
    pub subinterfaces: Vec<SubInterfaceSpec>,
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
}

/// A full topology description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyDescription {
    pub name: String,
    #[serde(default)]
    pub switches: Vec<SwitchSpec>,
    #[serde(default)]
    pub hosts: Vec<HostSpec>,
    #[serde(default)]
    pub routers: Vec<RouterSpec>,
    #[serde(default)]
    pub checks: Vec<CheckSpec>,
}

/// Default guest NIC name for the experiment link at `index`.
pub fn default_guest_iface(index: usize) -> String {
    format!("ens{}", 4 + index)
}

impl TopologyDescription {
    /// Parse a description from a JSON file.
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let topo: Self = serde_json::from_str(&data)?;
        Ok(topo)
    }

    /// Structural validation. Everything here runs before any resource is
    /// created; a failure leaves the system untouched.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return validation("topology name is empty");
        }

        let mut names: BTreeSet<&str> = BTreeSet::new();
        for name in self
            .switches
            .iter()
            .map(|s| s.name.as_str())
            .chain(self.hosts.iter().map(|h| h.name.as_str()))
            .chain(self.routers.iter().map(|r| r.name.as_str()))
        {
            validate_node_name(name)?;
            if !names.insert(name) {
                return validation(format!("duplicate node name {name}"));
            }
        }

        let switch_names: BTreeSet<&str> =
            self.switches.iter().map(|s| s.name.as_str()).collect();

        let mut addresses: BTreeMap<Ipv4Addr, String> = BTreeMap::new();
        let mut claim_address = |cidr: &str, owner: &str| -> Result<()> {
            let (ip, _) = parse_cidr(cidr)?;
            if let Some(holder) = addresses.insert(ip, owner.to_owned()) {
                return validation(format!(
                    "address {ip} assigned to both {holder} and {owner}"
                ));
            }
            Ok(())
        };

        for host in &self.hosts {
            if host.links.is_empty() {
                return validation(format!("host {} has no links", host.name));
            }
            for link in &host.links {
                if !switch_names.contains(link.switch.as_str()) {
                    return validation(format!(
                        "host {} links to undefined switch {}",
                        host.name, link.switch
                    ));
                }
                if let Some(vlan) = link.vlan {
                    validate_vlan_id(vlan)?;
                }
                if let Some(iface) = &link.guest_iface {
                    validate_iface_name(iface)?;
                }
            }
            claim_address(&host.address, &host.name)?;
            if let Some(gw) = &host.gateway {
                parse_ipv4(gw)?;
            }
        }

        for router in &self.routers {
            if router.links.is_empty() {
                return validation(format!("router {} has no links", router.name));
            }
            let mut trunk_vlans_by_switch: BTreeMap<&str, BTreeSet<u16>> = BTreeMap::new();
            for link in &router.links {
                if !switch_names.contains(link.switch.as_str()) {
                    return validation(format!(
                        "router {} links to undefined switch {}",
                        router.name, link.switch
                    ));
                }
                let mut seen = BTreeSet::new();
                for vlan in &link.vlans {
                    validate_vlan_id(*vlan)?;
                    if !seen.insert(*vlan) {
                        return validation(format!(
                            "router {} trunk to {} lists VLAN {vlan} twice",
                            router.name, link.switch
                        ));
                    }
                }
                trunk_vlans_by_switch
                    .entry(link.switch.as_str())
                    .or_default()
                    .extend(link.vlans.iter().copied());
                if let Some(addr) = &link.address {
                    claim_address(addr, &router.name)?;
                }
                if let Some(iface) = &link.guest_iface {
                    validate_iface_name(iface)?;
                }
            }

            let mut subif_vlans = BTreeSet::new();
            for subif in &router.subinterfaces {
                validate_vlan_id(subif.vlan)?;
                if !subif_vlans.insert(subif.vlan) {
                    return validation(format!(
                        "router {} declares sub-interface for VLAN {} twice",
                        router.name, subif.vlan
                    ));
                }
                let parent_switch = subif
                    .switch
                    .as_deref()
                    .or_else(|| router.links.first().map(|l| l.switch.as_str()));
                let carried = parent_switch
                    .and_then(|s| trunk_vlans_by_switch.get(s))
                    .is_some_and(|vlans| vlans.contains(&subif.vlan));
                if !carried {
                    return validation(format!(
                        "router {} sub-interface VLAN {} is not carried by its trunk link",
                        router.name, subif.vlan
                    ));
                }
                claim_address(&subif.address, &router.name)?;
            }

            let local_subnets = router_local_subnets(router)?;
            for route in &router.routes {
                if route.dest != "default" {
                    parse_cidr(&route.dest)?;
                }
                let via = parse_ipv4(&route.via)?;
                let covered = local_subnets
                    .iter()
                    .any(|(net, prefix)| subnet_contains(*net, *prefix, via));
                if !covered {
                    return Err(Error::DependencyOrder {
                        router: router.name.clone(),
                        reason: format!(
                            "route to {} via {} has no configured sub-interface or \
                             link subnet covering the next hop",
                            route.dest, route.via
                        ),
                    });
                }
            }
        }

        for check in &self.checks {
            if !self.has_channel_node(&check.from) {
                return validation(format!(
                    "check references {} which is not a host or router",
                    check.from
                ));
            }
            if self.node_address(&check.to).is_none() && parse_ipv4(&check.to).is_err() {
                return validation(format!(
                    "check target {} is neither a known node nor an address",
                    check.to
                ));
            }
        }

        Ok(())
    }

    /// True when `name` is a node with a guest channel (host or router).
    pub fn has_channel_node(&self, name: &str) -> bool {
        self.hosts.iter().any(|h| h.name == name)
            || self.routers.iter().any(|r| r.name == name)
    }

    /// Primary IPv4 address of a named node, if it has one: a host's
    /// address, or a router's first link/sub-interface address.
    pub fn node_address(&self, name: &str) -> Option<Ipv4Addr> {
        if let Some(host) = self.hosts.iter().find(|h| h.name == name) {
            return parse_cidr(&host.address).ok().map(|(ip, _)| ip);
        }
        let router = self.routers.iter().find(|r| r.name == name)?;
        router
            .links
            .iter()
            .filter_map(|l| l.address.as_deref())
            .chain(router.subinterfaces.iter().map(|s| s.address.as_str()))
            .next()
            .and_then(|cidr| parse_cidr(cidr).ok())
            .map(|(ip, _)| ip)
    }

    /// Name → address map used to distribute `/etc/hosts` entries.
    pub fn address_map(&self) -> BTreeMap<String, Ipv4Addr> {
        let mut map = BTreeMap::new();
        for host in &self.hosts {
            if let Ok((ip, _)) = parse_cidr(&host.address) {
                map.insert(host.name.clone(), ip);
            }
        }
        for router in &self.routers {
            if let Some(ip) = self.node_address(&router.name) {
                map.insert(router.name.clone(), ip);
            }
        }
        map
    }
}

/// All subnets a router is directly connected to: link addresses plus
/// sub-interface addresses, as (network, prefix) pairs.
pub(crate) fn router_local_subnets(router: &RouterSpec) -> Result<Vec<(Ipv4Addr, u8)>> {
    let mut subnets = Vec::new();
    for addr in router
        .links
        .iter()
        .filter_map(|l| l.address.as_deref())
        .chain(router.subinterfaces.iter().map(|s| s.address.as_str()))
    {
        let (ip, prefix) = parse_cidr(addr)?;
        subnets.push((cidr_network(ip, prefix), prefix));
    }
    Ok(subnets)
}

fn validation<T>(reason: impl Into<String>) -> Result<T> {
    Err(Error::TopologyValidation {
        reason: reason.into(),
    })
}

/// Node names become parts of bridge, tap, and VM names, so they must be
/// short and plain: 1-8 chars of `[a-z0-9-]`, starting alphanumeric.
fn validate_node_name(name: &str) -> Result<()> {
    let ok_len = (1..=8).contains(&name.len());
    let ok_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let ok_start = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    if ok_len && ok_chars && ok_start {
        Ok(())
    } else {
        validation(format!(
            "node name {name:?} must be 1-8 chars of [a-z0-9-], starting alphanumeric"
        ))
    }
}

fn validate_iface_name(name: &str) -> Result<()> {
    let ok_len = (1..=15).contains(&name.len());
    let ok_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    if ok_len && ok_chars {
        Ok(())
    } else {
        validation(format!("guest interface name {name:?} is not usable"))
    }
}

fn validate_vlan_id(vlan: u16) -> Result<()> {
    if (1..=4094).contains(&vlan) {
        Ok(())
    } else {
        validation(format!("VLAN id {vlan} outside 1-4094"))
    }
}

/// Parse `a.b.c.d/len`.
pub(crate) fn parse_cidr(s: &str) -> Result<(Ipv4Addr, u8)> {
    let (addr, prefix) = s
        .split_once('/')
        .ok_or_else(|| Error::TopologyValidation {
            reason: format!("{s:?} is not in CIDR a.b.c.d/len form"),
        })?;
    let ip = parse_ipv4(addr)?;
    let prefix: u8 = prefix.parse().map_err(|_| Error::TopologyValidation {
        reason: format!("bad prefix length in {s:?}"),
    })?;
    if prefix > 32 {
        return validation(format!("prefix length {prefix} exceeds 32 in {s:?}"));
    }
    Ok((ip, prefix))
}

pub(crate) fn parse_ipv4(s: &str) -> Result<Ipv4Addr> {
    s.parse().map_err(|_| Error::TopologyValidation {
        reason: format!("{s:?} is not an IPv4 address"),
    })
}

/// Network address of `ip` under a prefix length.
pub(crate) fn cidr_network(ip: Ipv4Addr, prefix: u8) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) & prefix_mask(prefix))
}

/// True when `ip` falls inside `network/prefix`.
pub(crate) fn subnet_contains(network: Ipv4Addr, prefix: u8, ip: Ipv4Addr) -> bool {
    (u32::from(ip) & prefix_mask(prefix)) == u32::from(network)
}

fn prefix_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix.min(32)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_host_lan() -> TopologyDescription {
        TopologyDescription {
            name: "lan".into(),
            switches: vec![SwitchSpec { name: "sw0".into() }],
            hosts: vec![
                HostSpec {
                    name: "h1".into(),
                    address: "10.0.0.10/24".into(),
                    gateway: None,
                    memory_mb: None,
                    links: vec![HostLink {
                        switch: "sw0".into(),
                        vlan: None,
                        guest_iface: None,
                    }],
                },
                HostSpec {
                    name: "h2".into(),
                    address: "10.0.0.11/24".into(),
                    gateway: None,
                    memory_mb: None,
                    links: vec![HostLink {
                        switch: "sw0".into(),
                        vlan: None,
                        guest_iface: None,
                    }],
                },
            ],
            routers: vec![],
            checks: vec![CheckSpec {
                from: "h1".into(),
                to: "h2".into(),
                expect: CheckExpectation::Reachable,
            }],
        }
    }

    #[test]
    fn test_valid_description_passes() {
        two_host_lan().validate().unwrap();
    }

    #[test]
    fn test_undefined_switch_is_rejected() {
        let mut topo = two_host_lan();
        topo.hosts[0].links[0].switch = "nosuch".into();
        let err = topo.validate().unwrap_err();
        assert!(err.to_string().contains("undefined switch"));
    }

    #[test]
    fn test_duplicate_node_name_is_rejected() {
        let mut topo = two_host_lan();
        topo.hosts[1].name = "h1".into();
        assert!(topo.validate().is_err());
    }

    #[test]
    fn test_duplicate_address_is_rejected() {
        let mut topo = two_host_lan();
        topo.hosts[1].address = "10.0.0.10/24".into();
        let err = topo.validate().unwrap_err();
        assert!(err.to_string().contains("assigned to both"));
    }

    #[test]
    fn test_long_node_name_is_rejected() {
        let mut topo = two_host_lan();
        topo.hosts[0].name = "host-number-one".into();
        assert!(topo.validate().is_err());
    }

    #[test]
    fn test_bad_cidr_is_rejected() {
        let mut topo = two_host_lan();
        topo.hosts[0].address = "10.0.0.10".into();
        assert!(topo.validate().is_err());
        topo.hosts[0].address = "10.0.0.10/33".into();
        assert!(topo.validate().is_err());
    }

    #[test]
    fn test_check_against_unknown_target_is_rejected() {
        let mut topo = two_host_lan();
        topo.checks[0].to = "h9".into();
        assert!(topo.validate().is_err());
        // A literal address is always an acceptable target.
        topo.checks[0].to = "10.0.0.11".into();
        topo.validate().unwrap();
    }

    fn vlan_router() -> RouterSpec {
        RouterSpec {
            name: "r0".into(),
            memory_mb: None,
            links: vec![RouterLink {
                switch: "sw0".into(),
                vlans: vec![100, 200],
                address: None,
                guest_iface: None,
            }],
            subinterfaces: vec![
                SubInterfaceSpec {
                    vlan: 100,
                    address: "10.0.100.1/24".into(),
                    switch: None,
                },
                SubInterfaceSpec {
                    vlan: 200,
                    address: "10.0.200.1/24".into(),
                    switch: None,
                },
            ],
            routes: vec![],
        }
    }

    #[test]
    fn test_router_subif_must_ride_its_trunk() {
        let mut topo = two_host_lan();
        let mut router = vlan_router();
        router.subinterfaces.push(SubInterfaceSpec {
            vlan: 300,
            address: "10.0.30.1/24".into(),
            switch: None,
        });
        topo.routers.push(router);
        let err = topo.validate().unwrap_err();
        assert!(err.to_string().contains("not carried by its trunk"));
    }

    #[test]
    fn test_route_next_hop_must_be_covered() {
        let mut topo = two_host_lan();
        let mut router = vlan_router();
        router.routes.push(RouteSpec {
            dest: "192.168.0.0/16".into(),
            via: "172.16.0.1".into(),
        });
        topo.routers.push(router);
        match topo.validate().unwrap_err() {
            Error::DependencyOrder { router, reason } => {
                assert_eq!(router, "r0");
                assert!(reason.contains("next hop"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_route_next_hop_on_subif_subnet_is_accepted() {
        let mut topo = two_host_lan();
        let mut router = vlan_router();
        router.routes.push(RouteSpec {
            dest: "192.168.0.0/16".into(),
            via: "10.0.200.2".into(),
        });
        topo.routers.push(router);
        topo.validate().unwrap();
    }

    #[test]
    fn test_cidr_helpers() {
        let (ip, prefix) = parse_cidr("10.0.100.1/24").unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 0, 100, 1));
        assert_eq!(prefix, 24);
        assert_eq!(cidr_network(ip, prefix), Ipv4Addr::new(10, 0, 100, 0));
        assert!(subnet_contains(
            Ipv4Addr::new(10, 0, 100, 0),
            24,
            Ipv4Addr::new(10, 0, 100, 77)
        ));
        assert!(!subnet_contains(
            Ipv4Addr::new(10, 0, 100, 0),
            24,
            Ipv4Addr::new(10, 0, 200, 1)
        ));
        assert!(subnet_contains(Ipv4Addr::new(0, 0, 0, 0), 0, Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[test]
    fn test_default_guest_iface_names() {
        assert_eq!(default_guest_iface(0), "ens4");
        assert_eq!(default_guest_iface(1), "ens5");
    }
}
