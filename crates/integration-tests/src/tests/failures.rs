//! Failure paths: bad inputs must be rejected before any resource is
//! created, and error output must say what was wrong.

use color_eyre::eyre::Result;
use xshell::Shell;

use crate::{integration_test, run_vmlab};

fn test_unknown_topology_name_is_rejected() -> Result<()> {
    let out = run_vmlab(&["run", "definitely-not-a-topology", "--base-image", "/dev/null"])?;
    assert!(!out.success(), "expected failure, got: {}", out.stdout);
    assert!(
        out.stderr.contains("no built-in topology"),
        "unexpected error output: {}",
        out.stderr
    );
    Ok(())
}
integration_test!(test_unknown_topology_name_is_rejected);

fn test_missing_base_image_fails_before_boot() -> Result<()> {
    let out = run_vmlab(&[
        "run",
        "basic-lan",
        "--base-image",
        "/nonexistent/vmlab-missing.qcow2",
    ])?;
    assert!(!out.success(), "expected failure, got: {}", out.stdout);
    assert!(
        out.stderr.contains("base image not found"),
        "unexpected error output: {}",
        out.stderr
    );
    Ok(())
}
integration_test!(test_missing_base_image_fails_before_boot);

fn test_duplicate_address_is_rejected_by_validation() -> Result<()> {
    let sh = Shell::new()?;
    let dir = sh.create_temp_dir()?;
    let path = dir.path().join("dup.json");
    std::fs::write(
        &path,
        r#"{
            "name": "dup",
            "switches": [{"name": "sw0"}],
            "hosts": [
                {"name": "h1", "address": "192.168.60.10/24", "links": [{"switch": "sw0"}]},
                {"name": "h2", "address": "192.168.60.10/24", "links": [{"switch": "sw0"}]}
            ]
        }"#,
    )?;
    let path = path.to_string_lossy().into_owned();

    let out = run_vmlab(&["run", "--file", &path, "--base-image", "/dev/null"])?;
    assert!(!out.success(), "expected failure, got: {}", out.stdout);
    assert!(
        out.stderr.contains("assigned to both"),
        "unexpected error output: {}",
        out.stderr
    );
    Ok(())
}
integration_test!(test_duplicate_address_is_rejected_by_validation);
