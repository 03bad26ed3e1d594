//! VLAN separation on a shared switch, with and without a router joining
//! the segments.

use color_eyre::eyre::Result;

use crate::{base_image_args, integration_test, run_vmlab};

fn run_preset(name: &str) -> Result<crate::CapturedOutput> {
    let mut args = vec!["run".to_owned(), name.to_owned()];
    args.extend(base_image_args()?);
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    Ok(run_vmlab(&args)?)
}

fn test_vlan_isolation() -> Result<()> {
    println!("Running test: vmlab run vlan-isolation");

    let out = run_preset("vlan-isolation")?;
    out.assert_success("vmlab run vlan-isolation");
    // The catalog entry declares one reachable pair and one isolated pair;
    // both rows must pass.
    assert!(
        out.stdout.contains("isolated"),
        "isolation check missing from output: {}",
        out.stdout
    );
    assert!(
        !out.stdout.contains("FAIL"),
        "unexpected failing check: {}",
        out.stdout
    );
    Ok(())
}
integration_test!(test_vlan_isolation);

fn test_vlan_routed() -> Result<()> {
    println!("Running test: vmlab run vlan-routed");

    let out = run_preset("vlan-routed")?;
    out.assert_success("vmlab run vlan-routed");
    assert!(
        !out.stdout.contains("FAIL"),
        "unexpected failing check: {}",
        out.stdout
    );
    Ok(())
}
integration_test!(test_vlan_routed);
