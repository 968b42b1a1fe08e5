use std::path::Path;

use crate::manifest::Manifest;

pub fn run(manifest: &Path) -> anyhow::Result<()> {
    let base = manifest.parent().unwrap_or_else(|| Path::new("."));
    let records =
        Manifest::load(manifest)?.into_records(base, |name| std::env::var(name).ok())?;

    println!("manifest ok: {}", manifest.display());
    println!(
        "  agent    {} ({}, {} processor)",
        records.agent.name, records.agent.docker_image, records.agent.log_processor
    );
    println!(
        "  project  {} ({})",
        records.project.name,
        records.project.repository_url().unwrap_or("no repository")
    );
    for mount in &records.task.volume_mounts {
        println!("  volume   {}", mount.bind());
    }
    Ok(())
}
