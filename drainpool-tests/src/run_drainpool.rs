// SPDX-License-Identifier: MIT

use std::path::Path;
use std::process::{Command, Output};

use serde::Serialize;

/// One entry of a `--manifest` file.
#[derive(Debug, Serialize)]
pub struct ManifestEntry {
    pub url: String,
    pub target: Option<String>,
    pub overwrite: bool,
}

pub fn write_manifest(path: &Path, entries: &[ManifestEntry]) -> anyhow::Result<()> {
    std::fs::write(path, serde_json::to_string_pretty(entries)?)?;
    Ok(())
}

/// Runs the drainpool binary through cargo and waits for it to exit.
pub fn run_drainpool(args: &[&str]) -> anyhow::Result<Output> {
    println!("Executing drainpool located via cargo run");
    let output = Command::new("cargo")
        .args(["run", "--quiet", "-p", "drainpool", "--"])
        .args(args)
        .output()?;
    Ok(output)
}
