use crate::CoreError;
use elbe_fs::layout::DOC_DIR;
use elbe_fs::{FsError, ScopedFs};
use serde::Serialize;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{debug, error};

const SEPARATOR: &str =
    "================================================================================";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LicenseEntry {
    pub package: String,
    pub text: String,
    /// False when `text` is a placeholder for an unreadable copyright file.
    pub readable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LicenseReport {
    pub entries: Vec<LicenseEntry>,
}

impl LicenseReport {
    /// Flat report: package name, a rule, the license text, a blank line.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&entry.package);
            out.push_str(":\n");
            out.push_str(SEPARATOR);
            out.push('\n');
            out.push_str(&entry.text);
            out.push_str("\n\n");
        }
        out
    }

    pub fn to_json(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn unreadable(&self) -> usize {
        self.entries.iter().filter(|e| !e.readable).count()
    }
}

/// UTF-8 when valid, ISO-8859-1 otherwise. Latin-1 maps every byte to the code point
/// of the same value, so the fallback never fails.
fn decode(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_owned(),
        Err(_) => bytes.iter().map(|&b| char::from(b)).collect(),
    }
}

/// Read `usr/share/doc/*/copyright` for every non-symlinked package doc directory.
pub fn collect_licenses(fs: &ScopedFs) -> Result<LicenseReport, CoreError> {
    let dirs = match fs.list_dir(DOC_DIR, true) {
        Ok(dirs) => dirs,
        Err(FsError::Io(e)) if e.kind() == ErrorKind::NotFound => {
            debug!("no {DOC_DIR} in {}", fs.root().display());
            return Ok(LicenseReport::default());
        }
        Err(e) => return Err(e.into()),
    };

    let mut report = LicenseReport::default();
    for dir in dirs {
        if !fs.is_dir(&dir)? {
            continue;
        }
        let package = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let copyright = dir.join("copyright");
        let (text, readable) = match fs.read(&copyright) {
            Ok(bytes) => (decode(&bytes), true),
            Err(e) => {
                let reason = match &e {
                    FsError::Io(io) => io.to_string(),
                    other => other.to_string(),
                };
                error!(
                    "error while processing license file {}: {reason}",
                    copyright.display()
                );
                (
                    format!(
                        "Error while processing license file {}: '{reason}'",
                        Path::new("/").join(&copyright).display()
                    ),
                    false,
                )
            }
        };
        report.entries.push(LicenseEntry {
            package,
            text,
            readable,
        });
    }
    Ok(report)
}
