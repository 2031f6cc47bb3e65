use std::fmt;
use std::process::Command;

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

const BUILD_TOOLS: [(&str, &str, &str); 8] = [
    ("cp", "copying the target tree", "part of coreutils"),
    ("tar", "tar archives and tar packers", "apt install tar"),
    ("cpio", "cpio archives", "apt install cpio"),
    ("mksquashfs", "squashfs images", "apt install squashfs-tools"),
    ("dpkg", "package selections and architecture detection", "apt install dpkg"),
    ("mount", "mounting pseudo filesystems in the sandbox", "part of util-linux"),
    ("umount", "releasing sandbox mounts", "part of util-linux"),
    ("chroot", "running tools inside the target", "part of coreutils"),
];

fn command_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Safe wrapper around `libc::geteuid()`.
#[allow(unsafe_code)]
fn effective_uid() -> u32 {
    // SAFETY: geteuid() takes no arguments, has no side effects, and cannot fail.
    unsafe { libc::geteuid() }
}

/// Check the host tools a build needs.
/// Returns a list of missing items. Empty list means all prerequisites are met.
pub fn check_build_prereqs() -> Vec<MissingPrereq> {
    let mut missing: Vec<MissingPrereq> = BUILD_TOOLS
        .iter()
        .filter(|(name, _, _)| !command_exists(name))
        .map(|&(name, purpose, install_hint)| MissingPrereq {
            name,
            purpose,
            install_hint,
        })
        .collect();

    if effective_uid() != 0 {
        missing.push(MissingPrereq {
            name: "root privileges",
            purpose: "mounting and chroot inside the target",
            install_hint: "run the build as root, e.g. via sudo",
        });
    }

    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nThe rootfs builder shells out to these tools while assembling a target.");
    msg
}
