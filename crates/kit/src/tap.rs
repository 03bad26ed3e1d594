//! Tap interface allocation with run-scoped naming.
//!
//! One allocator serves an entire run, shared behind a mutex so name
//! assignment stays serialized across node-creation threads. Names follow
//! `<run prefix>t<seq>` ("vk3fa2t0", "vk3fa2t1", ...), which keeps them
//! unique per run, attributable after a crash, and inside the kernel's
//! 15-byte interface name limit.

use std::collections::BTreeMap;
use std::process::Command;

use tracing::{debug, warn};

use crate::command_run::CommandRun;
use crate::errors::{Error, Result};

/// A tap created by the allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapDevice {
    name: String,
    owner: String,
}

impl TapDevice {
    /// System interface name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Node the tap was allocated for.
    pub fn owner(&self) -> &str {
        &self.owner
    }
}

/// Creates and destroys tap devices for one run.
#[derive(Debug)]
pub struct TapAllocator {
    prefix: String,
    next_seq: u32,
    live: BTreeMap<String, String>,
}

impl TapAllocator {
    pub fn new(run_prefix: &str) -> Self {
        Self {
            prefix: run_prefix.to_owned(),
            next_seq: 0,
            live: BTreeMap::new(),
        }
    }

    fn next_name(&mut self) -> String {
        let name = tap_name(&self.prefix, self.next_seq);
        self.next_seq += 1;
        name
    }

    /// Drop a name from the ledger, reporting whether it was present.
    fn forget(&mut self, name: &str) -> bool {
        self.live.remove(name).is_some()
    }

    /// Create the next uniquely named tap and bring it up.
    ///
    /// Fails with [`Error::NameCollision`] if an interface with the chosen
    /// name already exists on the system (another process, or debris from
    /// a crashed run with the same prefix).
    pub fn allocate(&mut self, owner: &str) -> Result<TapDevice> {
        let name = self.next_name();
        if link_exists(&name)? {
            return Err(Error::NameCollision { name });
        }
        Command::new("ip")
            .args(["tuntap", "add", "dev", &name, "mode", "tap"])
            .run()?;
        if let Err(e) = Command::new("ip").args(["link", "set", &name, "up"]).run() {
            // Unwind the half-made device before reporting.
            if let Err(del) = Command::new("ip")
                .args(["tuntap", "del", "dev", &name, "mode", "tap"])
                .run()
            {
                warn!("could not remove half-created tap {name}: {del}");
            }
            return Err(e);
        }
        debug!("allocated tap {name} for {owner}");
        self.live.insert(name.clone(), owner.to_owned());
        Ok(TapDevice {
            name,
            owner: owner.to_owned(),
        })
    }

    /// Destroy a tap. Safe to call for a device that never finished setup
    /// or is already gone; both cases are logged, not errors.
    pub fn release(&mut self, tap: &TapDevice) -> Result<()> {
        if !self.forget(tap.name()) {
            warn!("tap {} released twice", tap.name());
        }
        if !link_exists(tap.name())? {
            warn!("tap {} already absent at release", tap.name());
            return Ok(());
        }
        Command::new("ip")
            .args(["tuntap", "del", "dev", tap.name(), "mode", "tap"])
            .run()?;
        debug!("released tap {}", tap.name());
        Ok(())
    }

    /// Number of taps currently registered as live.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

fn tap_name(prefix: &str, seq: u32) -> String {
    format!("{prefix}t{seq}")
}

fn link_exists(name: &str) -> Result<bool> {
    Command::new("ip").args(["link", "show", name]).run_check()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tap_names_are_sequential() {
        let mut alloc = TapAllocator::new("vk3fa2");
        assert_eq!(alloc.next_name(), "vk3fa2t0");
        assert_eq!(alloc.next_name(), "vk3fa2t1");
        assert_eq!(alloc.next_name(), "vk3fa2t2");
    }

    #[test]
    fn test_tap_names_fit_ifnamsiz() {
        // 6-char prefix plus "t" plus up to 8 digits stays within the
        // kernel's 15-byte limit for any plausible allocation count.
        let name = tap_name("vk3fa2", 99_999_999);
        assert!(name.len() <= 15, "{name} exceeds IFNAMSIZ");
    }

    #[test]
    fn test_forget_reports_double_release() {
        let mut alloc = TapAllocator::new("vk3fa2");
        alloc.live.insert("vk3fa2t0".into(), "h1".into());
        assert!(alloc.forget("vk3fa2t0"));
        assert!(!alloc.forget("vk3fa2t0"));
        assert_eq!(alloc.live_count(), 0);
    }
}
