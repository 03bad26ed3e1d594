//! Connectivity checks declared by a topology.
//!
//! Each check pings once from a node's channel and compares the outcome
//! against the declared expectation. A failed ping is a legitimate result
//! (isolation checks expect it); only a broken channel is an error, so an
//! unreachable guest can never masquerade as confirmed isolation.

use std::net::Ipv4Addr;

use tracing::debug;

use crate::errors::{Error, Result};
use crate::ssh::GuestChannel;
use crate::topology::{parse_ipv4, CheckExpectation, TopologyDescription};

/// Outcome of one declared check.
#[derive(Debug)]
pub struct CheckResult {
    pub from: String,
    pub to: String,
    pub target: Ipv4Addr,
    pub expect: CheckExpectation,
    pub passed: bool,
}

/// One ping, bounded so an isolated target fails fast.
pub(crate) fn ping_command(target: Ipv4Addr) -> String {
    format!("ping -c 1 -W 2 {target}")
}

fn judge(expect: CheckExpectation, exit_code: i32) -> bool {
    match expect {
        CheckExpectation::Reachable => exit_code == 0,
        CheckExpectation::Isolated => exit_code != 0,
    }
}

/// Resolve a check target: node names through the description, anything
/// else as a literal address.
fn resolve_target(topo: &TopologyDescription, to: &str) -> Result<Ipv4Addr> {
    if let Some(addr) = topo.node_address(to) {
        return Ok(addr);
    }
    parse_ipv4(to).map_err(|_| Error::TopologyValidation {
        reason: format!("check target {to} is neither a known node nor an address"),
    })
}

/// Run every declared check, in declaration order.
///
/// `channel_of` maps a node name to its Running guest channel; the
/// assembler provides it. Transport failures abort the run.
pub fn run_checks<'a, F>(
    topo: &TopologyDescription,
    channel_of: F,
) -> Result<Vec<CheckResult>>
where
    F: Fn(&str) -> Result<&'a GuestChannel>,
{
    let mut results = Vec::with_capacity(topo.checks.len());
    for check in &topo.checks {
        let target = resolve_target(topo, &check.to)?;
        let channel = channel_of(&check.from)?;
        let output = channel.execute_unchecked(&ping_command(target))?;
        let passed = judge(check.expect, output.exit_code);
        debug!(
            "check {} -> {} ({target}): exit {}, {}",
            check.from,
            check.to,
            output.exit_code,
            if passed { "pass" } else { "fail" }
        );
        results.push(CheckResult {
            from: check.from.clone(),
            to: check.to.clone(),
            target,
            expect: check.expect,
            passed,
        });
    }
    Ok(results)
}

pub fn all_passed(results: &[CheckResult]) -> bool {
    results.iter().all(|r| r.passed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_command_is_bounded() {
        assert_eq!(
            ping_command(Ipv4Addr::new(10, 0, 0, 11)),
            "ping -c 1 -W 2 10.0.0.11"
        );
    }

    #[test]
    fn test_judge_matrix() {
        assert!(judge(CheckExpectation::Reachable, 0));
        assert!(!judge(CheckExpectation::Reachable, 1));
        assert!(judge(CheckExpectation::Isolated, 1));
        assert!(judge(CheckExpectation::Isolated, 2));
        assert!(!judge(CheckExpectation::Isolated, 0));
    }

    #[test]
    fn test_resolve_target_names_and_literals() {
        let topo = crate::presets::find("basic-lan").unwrap();
        assert_eq!(
            resolve_target(&topo, "h2").unwrap(),
            Ipv4Addr::new(10, 0, 0, 11)
        );
        assert_eq!(
            resolve_target(&topo, "192.0.2.7").unwrap(),
            Ipv4Addr::new(192, 0, 2, 7)
        );
        assert!(resolve_target(&topo, "h9").is_err());
    }
}
