use super::{
    colorize_status, describe, json_pretty, load_descriptor, spin_fail, spin_ok, spinner,
    EXIT_SUCCESS,
};
use elbe_core::{BuildOptions, Engine};
use elbe_runtime::HostSystem;
use std::path::{Path, PathBuf};

pub fn run(
    descriptor: &Path,
    source: PathBuf,
    target: PathBuf,
    builddir: PathBuf,
    clean_target: bool,
    json: bool,
) -> Result<u8, String> {
    let config = load_descriptor(descriptor)?;
    let host = HostSystem::new();
    let engine = Engine::new(config, &host);
    let options = BuildOptions {
        source,
        target,
        builddir,
        clean_target,
    };

    let pb = if json {
        None
    } else {
        Some(spinner("building target..."))
    };
    let result = match engine.build(&options) {
        Ok(r) => {
            if let Some(ref pb) = pb {
                spin_ok(pb, "target built");
            }
            r
        }
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "build failed");
            }
            return Err(describe(&e));
        }
    };

    if json {
        let payload = serde_json::json!({
            "project": engine.config().project.name,
            "mode": result.extract.mode.map(|m| m.to_string()),
            "packages": result.extract.packages,
            "copied": result.extract.copied.len(),
            "files": result.extract.files,
            "skipped": result.extract.skipped,
            "artifacts": result.packaging.artifacts,
            "failures": result.packaging.failures,
            "licenses": result.licenses.as_ref().map(|r| r.entries.len()),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "copied {} entries into {}",
            result.extract.copied.len(),
            options.target.display()
        );
        for artifact in &result.packaging.artifacts {
            println!(
                "  {} {} ({})",
                colorize_status("built"),
                options.builddir.join(&artifact.name).display(),
                artifact.kind
            );
        }
        for failure in &result.packaging.failures {
            println!(
                "  {} {} {}: {}",
                colorize_status("failed"),
                failure.kind,
                failure.name,
                failure.reason
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
