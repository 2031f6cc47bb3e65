//! Lookups in the kernel mount table.

use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const MOUNT_TABLE: &str = "/proc/mounts";

/// Mount points of a `/proc/mounts`-formatted table, octal escapes decoded.
pub fn parse_mount_points(table: &str) -> Vec<PathBuf> {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(unescape)
        .collect()
}

/// The kernel writes space, tab, newline and backslash as `\ooo`.
fn unescape(field: &str) -> PathBuf {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            let code = bytes
                .get(i + 1..i + 4)
                .and_then(|digits| std::str::from_utf8(digits).ok())
                .and_then(|digits| u8::from_str_radix(digits, 8).ok());
            if let Some(byte) = code {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    PathBuf::from(OsString::from_vec(out))
}

/// Current mount points of this host; empty if the table cannot be read.
pub fn mount_points() -> Vec<PathBuf> {
    match std::fs::read_to_string(MOUNT_TABLE) {
        Ok(table) => parse_mount_points(&table),
        Err(e) => {
            debug!("cannot read {MOUNT_TABLE}: {e}");
            Vec::new()
        }
    }
}

/// Entries of `table` strictly below `root`, deepest first.
pub fn mounts_below(table: &[PathBuf], root: &Path) -> Vec<PathBuf> {
    let mut below: Vec<PathBuf> = table
        .iter()
        .filter(|m| m.starts_with(root) && m.as_path() != root)
        .cloned()
        .collect();
    below.sort_by(|a, b| b.cmp(a));
    below.dedup();
    below
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Active mounts under `root` on this host, deepest first.
pub fn active_mounts_under(root: &Path) -> Vec<PathBuf> {
    mounts_below(&mount_points(), &canonical(root))
}

/// Whether `path` is currently a mount point.
pub fn is_mount_point(path: &Path) -> bool {
    let path = canonical(path);
    mount_points().iter().any(|m| *m == path)
}
