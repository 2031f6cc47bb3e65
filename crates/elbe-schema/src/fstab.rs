use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// One configured mount of the target system.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FstabEntry {
    /// Device or source spec, e.g. `LABEL=rfs` or `/dev/mmcblk0p2`.
    pub source: String,
    pub mountpoint: String,
    pub fs_type: String,
    #[serde(default = "default_options")]
    pub options: String,
    #[serde(default)]
    pub dump: u8,
    #[serde(default)]
    pub pass: u8,
    /// The partition is part of the disk layout but must not be mounted at boot.
    #[serde(default)]
    pub no_fstab: bool,
}

fn default_options() -> String {
    "defaults".to_owned()
}

impl FstabEntry {
    pub fn line(&self) -> String {
        format!(
            "{} {} {} {} {} {}",
            self.source, self.mountpoint, self.fs_type, self.options, self.dump, self.pass
        )
    }
}

/// Render entries in input order, dropping the ones flagged `no_fstab`.
pub fn render_fstab(entries: &[FstabEntry]) -> String {
    let mut out = String::new();
    for entry in entries.iter().filter(|e| !e.no_fstab) {
        let _ = writeln!(out, "{}", entry.line());
    }
    out
}
