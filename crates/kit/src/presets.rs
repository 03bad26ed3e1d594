//! Built-in topology catalog.
//!
//! Each preset is a complete description exercising one networking shape,
//! from a flat LAN up to chained routers with static routes. `vmlab run
//! <name>` resolves here before falling back to `--file`.

use crate::topology::{
    CheckExpectation, CheckSpec, HostLink, HostSpec, RouteSpec, RouterLink, RouterSpec,
    SubInterfaceSpec, SwitchSpec, TopologyDescription,
};

/// A named builder for one catalog entry.
pub struct Preset {
    pub name: &'static str,
    pub summary: &'static str,
    build: fn() -> TopologyDescription,
}

impl Preset {
    pub fn description(&self) -> TopologyDescription {
        (self.build)()
    }
}

/// All built-in topologies, in listing order.
pub fn catalog() -> &'static [Preset] {
    &[
        Preset {
            name: "basic-lan",
            summary: "two hosts on one switch",
            build: basic_lan,
        },
        Preset {
            name: "routed-subnets",
            summary: "two subnets joined by a router",
            build: routed_subnets,
        },
        Preset {
            name: "vlan-isolation",
            summary: "access VLANs separating hosts on a shared switch",
            build: vlan_isolation,
        },
        Preset {
            name: "vlan-routed",
            summary: "router-on-a-stick joining two VLANs over a trunk",
            build: vlan_routed,
        },
        Preset {
            name: "chained-routers",
            summary: "two routers with static routes across a transit net",
            build: chained_routers,
        },
    ]
}

/// Look a preset up by name.
pub fn find(name: &str) -> Option<TopologyDescription> {
    catalog()
        .iter()
        .find(|p| p.name == name)
        .map(|p| p.description())
}

fn switch(name: &str) -> SwitchSpec {
    SwitchSpec { name: name.into() }
}

fn plain_link(switch: &str) -> HostLink {
    HostLink {
        switch: switch.into(),
        vlan: None,
        guest_iface: None,
    }
}

fn access_link(switch: &str, vlan: u16) -> HostLink {
    HostLink {
        switch: switch.into(),
        vlan: Some(vlan),
        guest_iface: None,
    }
}

fn host(name: &str, address: &str, gateway: Option<&str>, links: Vec<HostLink>) -> HostSpec {
    HostSpec {
        name: name.into(),
        address: address.into(),
        gateway: gateway.map(Into::into),
        memory_mb: None,
        links,
    }
}

fn routed_nic(switch: &str, address: &str) -> RouterLink {
    RouterLink {
        switch: switch.into(),
        vlans: Vec::new(),
        address: Some(address.into()),
        guest_iface: None,
    }
}

fn check(from: &str, to: &str, expect: CheckExpectation) -> CheckSpec {
    CheckSpec {
        from: from.into(),
        to: to.into(),
        expect,
    }
}

fn basic_lan() -> TopologyDescription {
    TopologyDescription {
        name: "basic-lan".into(),
        switches: vec![switch("sw0")],
        hosts: vec![
            host("h1", "10.0.0.10/24", None, vec![plain_link("sw0")]),
            host("h2", "10.0.0.11/24", None, vec![plain_link("sw0")]),
        ],
        routers: vec![],
        checks: vec![
            check("h1", "h2", CheckExpectation::Reachable),
            check("h2", "h1", CheckExpectation::Reachable),
        ],
    }
}

fn routed_subnets() -> TopologyDescription {
    TopologyDescription {
        name: "routed-subnets".into(),
        switches: vec![switch("net-a"), switch("net-b")],
        hosts: vec![
            host("h1", "10.0.1.10/24", Some("10.0.1.1"), vec![plain_link("net-a")]),
            host("h2", "10.0.2.10/24", Some("10.0.2.1"), vec![plain_link("net-b")]),
        ],
        routers: vec![RouterSpec {
            name: "r0".into(),
            memory_mb: None,
            links: vec![
                routed_nic("net-a", "10.0.1.1/24"),
                routed_nic("net-b", "10.0.2.1/24"),
            ],
            subinterfaces: vec![],
            routes: vec![],
        }],
        checks: vec![
            check("h1", "h2", CheckExpectation::Reachable),
            check("h2", "h1", CheckExpectation::Reachable),
        ],
    }
}

fn vlan_isolation() -> TopologyDescription {
    TopologyDescription {
        name: "vlan-isolation".into(),
        switches: vec![switch("sw0")],
        hosts: vec![
            host("h1", "10.0.100.10/24", None, vec![access_link("sw0", 100)]),
            host("h2", "10.0.100.11/24", None, vec![access_link("sw0", 100)]),
            host("h3", "10.0.200.10/24", None, vec![access_link("sw0", 200)]),
        ],
        routers: vec![],
        checks: vec![
            check("h1", "h2", CheckExpectation::Reachable),
            check("h1", "10.0.200.10", CheckExpectation::Isolated),
        ],
    }
}

fn vlan_routed() -> TopologyDescription {
    TopologyDescription {
        name: "vlan-routed".into(),
        switches: vec![switch("sw0")],
        hosts: vec![
            host(
                "h1",
                "10.0.100.10/24",
                Some("10.0.100.1"),
                vec![access_link("sw0", 100)],
            ),
            host(
                "h2",
                "10.0.200.10/24",
                Some("10.0.200.1"),
                vec![access_link("sw0", 200)],
            ),
        ],
        routers: vec![RouterSpec {
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
        }],
        checks: vec![
            check("h1", "h2", CheckExpectation::Reachable),
            check("h2", "h1", CheckExpectation::Reachable),
        ],
    }
}

fn chained_routers() -> TopologyDescription {
    TopologyDescription {
        name: "chained-routers".into(),
        switches: vec![switch("net-a"), switch("transit"), switch("net-b")],
        hosts: vec![
            host("h1", "10.0.1.10/24", Some("10.0.1.1"), vec![plain_link("net-a")]),
            host("h2", "10.0.2.10/24", Some("10.0.2.2"), vec![plain_link("net-b")]),
        ],
        routers: vec![
            RouterSpec {
                name: "r1".into(),
                memory_mb: None,
                links: vec![
                    routed_nic("net-a", "10.0.1.1/24"),
                    routed_nic("transit", "10.0.0.1/30"),
                ],
                subinterfaces: vec![],
                routes: vec![RouteSpec {
                    dest: "10.0.2.0/24".into(),
                    via: "10.0.0.2".into(),
                }],
            },
            RouterSpec {
                name: "r2".into(),
                memory_mb: None,
                links: vec![
                    routed_nic("transit", "10.0.0.2/30"),
                    routed_nic("net-b", "10.0.2.2/24"),
                ],
                subinterfaces: vec![],
                routes: vec![RouteSpec {
                    dest: "10.0.1.0/24".into(),
                    via: "10.0.0.1".into(),
                }],
            },
        ],
        checks: vec![
            check("h1", "h2", CheckExpectation::Reachable),
            check("h2", "h1", CheckExpectation::Reachable),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_preset_validates() {
        for preset in catalog() {
            let topo = preset.description();
            topo.validate()
                .unwrap_or_else(|e| panic!("{} failed validation: {e}", preset.name));
        }
    }

    #[test]
    fn test_preset_names_are_unique() {
        let mut names: Vec<_> = catalog().iter().map(|p| p.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), catalog().len());
    }

    #[test]
    fn test_find_resolves_known_and_rejects_unknown() {
        assert!(find("basic-lan").is_some());
        assert!(find("no-such-topology").is_none());
    }

    #[test]
    fn test_chained_routers_route_through_transit() {
        let topo = find("chained-routers").unwrap();
        let r1 = &topo.routers[0];
        assert_eq!(r1.routes[0].dest, "10.0.2.0/24");
        assert_eq!(r1.routes[0].via, "10.0.0.2");
    }
}
