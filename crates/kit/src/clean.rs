//! Removal of leftovers from crashed or kept runs.
//!
//! Every resource a run creates carries its run prefix, so a sweep only
//! needs that prefix: it kills the matching hypervisor processes and then
//! deletes the taps, bridges, and overlay files named after the run.
//! Best-effort throughout; what cannot be removed is reported, not fatal.

use std::process::Command;
use std::time::Duration;

use camino::Utf8Path;
use serde::Deserialize;
use tracing::{debug, info};

use crate::command_run::CommandRun;
use crate::errors::{Error, Result};

/// One entry of `ip -json link show`.
#[derive(Debug, Deserialize)]
struct LinkEntry {
    ifname: String,
}

/// What a sweep removed, and what it could not.
#[derive(Debug, Default)]
pub struct CleanSummary {
    pub processes_killed: bool,
    pub taps_removed: u32,
    pub bridges_removed: u32,
    pub overlays_removed: u32,
    pub failures: Vec<String>,
}

impl CleanSummary {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A sweep accepts only a full run prefix. Anything looser (an empty
/// string, a bare `vk`) would match resources from every run on the
/// machine.
fn validate_prefix(prefix: &str) -> Result<()> {
    let rest = prefix.strip_prefix("vk");
    let ok = matches!(rest, Some(r) if r.len() == 4 && r.chars().all(|c| c.is_ascii_hexdigit()));
    if ok {
        Ok(())
    } else {
        Err(Error::TopologyValidation {
            reason: format!("{prefix:?} is not a run prefix (vk followed by four hex chars)"),
        })
    }
}

fn matching_taps<'a>(links: &'a [LinkEntry], prefix: &str) -> Vec<&'a str> {
    let tap_prefix = format!("{prefix}t");
    links
        .iter()
        .map(|l| l.ifname.as_str())
        .filter(|name| name.starts_with(&tap_prefix))
        .collect()
}

fn matching_bridges<'a>(list_br_output: &'a str, prefix: &str) -> Vec<&'a str> {
    let bridge_prefix = format!("{prefix}-");
    list_br_output
        .lines()
        .map(str::trim)
        .filter(|name| name.starts_with(&bridge_prefix))
        .collect()
}

/// Remove everything a run left behind: processes, then taps, then
/// bridges, then overlay files under `run_dir`.
pub fn clean_run(prefix: &str, run_dir: &Utf8Path) -> Result<CleanSummary> {
    validate_prefix(prefix)?;
    info!("sweeping leftovers of run {prefix}");
    let mut summary = CleanSummary::default();

    // Hypervisors go first so taps and bridges are no longer held open.
    let pattern = format!("-name {prefix}-");
    match Command::new("pkill").args(["-9", "-f", "--", &pattern]).run_check() {
        Ok(matched) => {
            summary.processes_killed = matched;
            if matched {
                // Give the kernel a moment to reap them and release taps.
                std::thread::sleep(Duration::from_millis(300));
            } else {
                debug!("no hypervisor processes matched {pattern:?}");
            }
        }
        Err(e) => summary.failures.push(format!("pkill: {e}")),
    }

    let links: Vec<LinkEntry> = Command::new("ip")
        .args(["-json", "link", "show"])
        .run_and_parse_json()?;
    for tap in matching_taps(&links, prefix) {
        match Command::new("ip")
            .args(["tuntap", "del", "dev", tap, "mode", "tap"])
            .run()
        {
            Ok(()) => summary.taps_removed += 1,
            Err(e) => summary.failures.push(format!("tap {tap}: {e}")),
        }
    }

    let bridges = Command::new("ovs-vsctl").arg("list-br").run_get_string()?;
    for bridge in matching_bridges(&bridges, prefix) {
        match Command::new("ovs-vsctl")
            .args(["--if-exists", "del-br", bridge])
            .run()
        {
            Ok(()) => summary.bridges_removed += 1,
            Err(e) => summary.failures.push(format!("bridge {bridge}: {e}")),
        }
    }

    if run_dir.as_std_path().is_dir() {
        let overlay_prefix = format!("{prefix}-");
        for entry in run_dir.read_dir_utf8()? {
            let entry = entry?;
            let name = entry.file_name();
            if name.starts_with(&overlay_prefix) && name.ends_with(".qcow2") {
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => summary.overlays_removed += 1,
                    Err(e) => summary.failures.push(format!("overlay {name}: {e}")),
                }
            }
        }
        // Only goes away once empty.
        let _ = std::fs::remove_dir(run_dir);
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_prefix_accepts_run_shape_only() {
        validate_prefix("vk3fa2").unwrap();
        assert!(validate_prefix("").is_err());
        assert!(validate_prefix("vk").is_err());
        assert!(validate_prefix("vk3fa").is_err());
        assert!(validate_prefix("vk3fa2b").is_err());
        assert!(validate_prefix("xx3fa2").is_err());
        assert!(validate_prefix("vk3fgz").is_err());
    }

    #[test]
    fn test_matching_taps_filters_by_run() {
        let links: Vec<LinkEntry> = serde_json::from_str(
            r#"[
                {"ifindex": 1, "ifname": "lo"},
                {"ifindex": 7, "ifname": "vk3fa2t0"},
                {"ifindex": 8, "ifname": "vk3fa2t1"},
                {"ifindex": 9, "ifname": "vkbeeft0"}
            ]"#,
        )
        .unwrap();
        assert_eq!(matching_taps(&links, "vk3fa2"), ["vk3fa2t0", "vk3fa2t1"]);
    }

    #[test]
    fn test_matching_bridges_filters_by_run() {
        let output = "vk3fa2-sw0\nvkbeef-sw0\nbr-int\n";
        assert_eq!(matching_bridges(output, "vk3fa2"), ["vk3fa2-sw0"]);
    }
}
