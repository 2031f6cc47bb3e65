use super::{json_pretty, EXIT_SUCCESS};
use elbe_core::collect_licenses;
use elbe_fs::ScopedFs;
use std::path::Path;

pub fn run(
    target: &Path,
    text: Option<&Path>,
    manifest: Option<&Path>,
    json: bool,
) -> Result<u8, String> {
    let report = collect_licenses(&ScopedFs::new(target)).map_err(|e| e.to_string())?;

    if let Some(path) = manifest {
        let content = report.to_json().map_err(|e| e.to_string())?;
        std::fs::write(path, content)
            .map_err(|e| format!("failed to write {}: {e}", path.display()))?;
    }
    match text {
        Some(path) => std::fs::write(path, report.render_text())
            .map_err(|e| format!("failed to write {}: {e}", path.display()))?,
        None if json => println!("{}", json_pretty(&report)?),
        None => print!("{}", report.render_text()),
    }

    if report.unreadable() > 0 {
        eprintln!(
            "warning: {} of {} license files could not be read",
            report.unreadable(),
            report.entries.len()
        );
    }
    Ok(EXIT_SUCCESS)
}
