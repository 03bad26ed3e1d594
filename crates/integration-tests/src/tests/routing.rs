//! Routed topologies: a single router between subnets, then a pair of
//! routers with static routes over a transit segment.

use color_eyre::eyre::Result;

use crate::{base_image_args, integration_test, run_vmlab};

fn run_preset(name: &str) -> Result<crate::CapturedOutput> {
    let mut args = vec!["run".to_owned(), name.to_owned()];
    args.extend(base_image_args()?);
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    Ok(run_vmlab(&args)?)
}

fn test_routed_subnets() -> Result<()> {
    println!("Running test: vmlab run routed-subnets");

    let out = run_preset("routed-subnets")?;
    out.assert_success("vmlab run routed-subnets");
    assert!(
        !out.stdout.contains("FAIL"),
        "unexpected failing check: {}",
        out.stdout
    );
    Ok(())
}
integration_test!(test_routed_subnets);

fn test_chained_routers() -> Result<()> {
    println!("Running test: vmlab run chained-routers");

    let out = run_preset("chained-routers")?;
    out.assert_success("vmlab run chained-routers");
    assert!(
        !out.stdout.contains("FAIL"),
        "unexpected failing check: {}",
        out.stdout
    );
    Ok(())
}
integration_test!(test_chained_routers);
