//! Keeping a topology alive past the run, then sweeping it by prefix.

use color_eyre::eyre::{eyre, Result};

use crate::{base_image_args, integration_test, run_command, run_vmlab};

/// Pull the run prefix out of the keep instructions
/// (`... vmlab clean --prefix vkXXXX`).
fn extract_prefix(stdout: &str) -> Result<String> {
    let marker = "--prefix ";
    let idx = stdout
        .rfind(marker)
        .ok_or_else(|| eyre!("no run prefix in output: {stdout}"))?;
    let prefix: String = stdout[idx + marker.len()..].chars().take(6).collect();
    if prefix.len() == 6 && prefix.starts_with("vk") {
        Ok(prefix)
    } else {
        Err(eyre!("malformed run prefix in output: {stdout}"))
    }
}

fn list_bridges() -> Result<String> {
    let out = run_command("ovs-vsctl", &["list-br"])?;
    out.assert_success("ovs-vsctl list-br");
    Ok(out.stdout)
}

fn test_keep_then_clean() -> Result<()> {
    println!("Running test: vmlab run --keep followed by vmlab clean");

    let mut args = vec![
        "run".to_owned(),
        "basic-lan".to_owned(),
        "--keep".to_owned(),
        "--skip-checks".to_owned(),
    ];
    args.extend(base_image_args()?);
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    let out = run_vmlab(&args)?;
    out.assert_success("vmlab run --keep");
    let prefix = extract_prefix(&out.stdout)?;
    println!("kept run {prefix}");
    assert!(
        out.stdout.contains("ssh -p"),
        "keep output has no connection details: {}",
        out.stdout
    );
    assert!(
        list_bridges()?.contains(&format!("{prefix}-sw0")),
        "kept bridge is missing"
    );

    let clean = run_vmlab(&["clean", "--prefix", &prefix])?;
    clean.assert_success("vmlab clean");
    assert!(
        !list_bridges()?.contains(&prefix),
        "bridge survived the sweep"
    );
    let links = run_command("ip", &["-json", "link", "show"])?;
    assert!(
        !links.stdout.contains(&format!("{prefix}t")),
        "tap survived the sweep"
    );
    Ok(())
}
integration_test!(test_keep_then_clean);

fn test_clean_rejects_loose_prefix() -> Result<()> {
    let out = run_vmlab(&["clean", "--prefix", "vk"])?;
    assert!(!out.success(), "expected failure, got: {}", out.stdout);
    assert!(
        out.stderr.contains("not a run prefix"),
        "unexpected error output: {}",
        out.stderr
    );
    Ok(())
}
integration_test!(test_clean_rejects_loose_prefix);
