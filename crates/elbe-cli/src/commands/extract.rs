use super::{describe, json_pretty, load_descriptor, EXIT_SUCCESS};
use elbe_core::{BuildOptions, Engine};
use elbe_runtime::HostSystem;
use std::path::{Path, PathBuf};

pub fn run(
    descriptor: &Path,
    source: PathBuf,
    target: PathBuf,
    clean_target: bool,
    json: bool,
) -> Result<u8, String> {
    let config = load_descriptor(descriptor)?;
    let host = HostSystem::new();
    let engine = Engine::new(config, &host);
    let options = BuildOptions {
        source,
        builddir: target.clone(),
        target,
        clean_target,
    };
    let report = engine.extract_only(&options).map_err(|e| describe(&e))?;

    if json {
        let payload = serde_json::json!({
            "mode": report.mode.map(|m| m.to_string()),
            "packages": report.packages,
            "copied": report.copied,
            "skipped": report.skipped,
            "files": report.files,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        if !report.packages.is_empty() {
            println!("packages: {}", report.packages.join(" "));
        }
        println!(
            "copied {} entries into {} ({} files)",
            report.copied.len(),
            options.target.display(),
            report.files
        );
        for missing in &report.skipped {
            println!("  missing from source: {missing}");
        }
    }
    Ok(EXIT_SUCCESS)
}
