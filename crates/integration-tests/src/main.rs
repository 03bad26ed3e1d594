//! End-to-end tests for vmlab.
//!
//! These drive the real binary against real qemu, Open vSwitch, and
//! sshpass, so they need root and a prepared guest image. When the
//! environment cannot support that, the whole suite skips cleanly so CI
//! lanes without virtualization stay green.

use std::process::Output;

use color_eyre::eyre::{eyre, Result};
use libtest_mimic::{Arguments, Trial};

pub(crate) use integration_tests::{integration_test, INTEGRATION_TESTS};

mod tests {
    pub mod basic_lan;
    pub mod failures;
    pub mod lifecycle;
    pub mod routing;
    pub mod vlan;
}

/// Tools every scenario needs on PATH.
const REQUIRED_TOOLS: &[&str] = &[
    "qemu-system-x86_64",
    "qemu-img",
    "ovs-vsctl",
    "ip",
    "sshpass",
];

/// Path to the vmlab binary, from VMLAB_PATH or PATH.
pub(crate) fn vmlab_command() -> Result<String> {
    if let Ok(path) = std::env::var("VMLAB_PATH") {
        return Ok(path);
    }
    // Force the user to pick explicitly when running from the project dir
    if let Some(path) = ["target/debug/vmlab", "target/release/vmlab"]
        .into_iter()
        .find(|p| camino::Utf8Path::new(p).exists())
    {
        return Err(eyre!(
            "Detected {path} - set VMLAB_PATH={path} to run using this binary"
        ));
    }
    Ok("vmlab".to_owned())
}

/// The guest image under test. Required; there is no useful default
/// because the image must carry sshd, a known root password, and iproute2.
pub(crate) fn test_base_image() -> Option<String> {
    std::env::var("VMLAB_TEST_BASE_IMAGE").ok()
}

/// Password matching the test image's control account.
pub(crate) fn guest_password() -> String {
    std::env::var("VMLAB_GUEST_PASSWORD").unwrap_or_else(|_| "vmlab".to_owned())
}

fn have_tool(tool: &str) -> bool {
    std::process::Command::new("which")
        .arg(tool)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn running_as_root() -> bool {
    std::process::Command::new("id")
        .arg("-u")
        .output()
        .map(|o| String::from_utf8_lossy(&o.stdout).trim() == "0")
        .unwrap_or(false)
}

/// Captured output from a command with decoded stdout/stderr strings.
pub(crate) struct CapturedOutput {
    pub output: Output,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn new(output: Output) -> Self {
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        Self {
            output,
            stdout,
            stderr,
        }
    }

    /// Assert that the command succeeded, printing debug info on failure.
    pub fn assert_success(&self, context: &str) {
        assert!(
            self.output.status.success(),
            "{} failed: {}",
            context,
            self.stderr
        );
    }

    pub fn success(&self) -> bool {
        self.output.status.success()
    }
}

/// Run a command, capturing output.
pub(crate) fn run_command(program: &str, args: &[&str]) -> std::io::Result<CapturedOutput> {
    let output = std::process::Command::new(program).args(args).output()?;
    Ok(CapturedOutput::new(output))
}

/// Run the vmlab command, capturing output. The guest password rides on
/// the environment so it never appears in process listings.
pub(crate) fn run_vmlab(args: &[&str]) -> std::io::Result<CapturedOutput> {
    let vmlab = vmlab_command().expect("Failed to get vmlab command");
    let output = std::process::Command::new(&vmlab)
        .args(args)
        .env("VMLAB_GUEST_PASSWORD", guest_password())
        .output()?;
    Ok(CapturedOutput::new(output))
}

/// Common arguments for a run against the test image.
pub(crate) fn base_image_args() -> Result<Vec<String>> {
    let image = test_base_image()
        .ok_or_else(|| eyre!("VMLAB_TEST_BASE_IMAGE is not set"))?;
    Ok(vec!["--base-image".to_owned(), image])
}

fn environment_gap() -> Option<String> {
    if std::env::consts::OS != "linux" {
        return Some(format!(
            "only supported on Linux (current OS: {})",
            std::env::consts::OS
        ));
    }
    if !running_as_root() {
        return Some("tap and bridge management needs root".to_owned());
    }
    let missing: Vec<&str> = REQUIRED_TOOLS
        .iter()
        .copied()
        .filter(|tool| !have_tool(tool))
        .collect();
    if !missing.is_empty() {
        return Some(format!("missing tools: {}", missing.join(", ")));
    }
    if test_base_image().is_none() {
        return Some("VMLAB_TEST_BASE_IMAGE is not set".to_owned());
    }
    None
}

fn main() {
    if let Some(gap) = environment_gap() {
        eprintln!("Skipping all integration tests: {gap}");
        std::process::exit(0);
    }

    let args = Arguments::from_args();

    let tests: Vec<Trial> = INTEGRATION_TESTS
        .iter()
        .map(|test| {
            let name = test.name;
            let f = test.f;
            Trial::test(name, move || f().map_err(|e| format!("{:?}", e).into()))
        })
        .collect();

    libtest_mimic::run(&args, tests).exit();
}
