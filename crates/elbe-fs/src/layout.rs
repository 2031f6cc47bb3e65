//! Well-known paths inside a target tree, relative to its root.

pub const FSTAB: &str = "etc/fstab";
pub const ELBE_VERSION: &str = "etc/elbe_version";
pub const UPDATED_VERSION: &str = "etc/updated_version";
/// Read-only copy of the build descriptor the target was produced from.
pub const DESCRIPTOR_COPY: &str = "etc/elbe_base.toml";

pub const RESOLV_CONF: &str = "etc/resolv.conf";
pub const APT_CONF: &str = "etc/apt/apt.conf";
pub const POLICY_RC_D: &str = "usr/sbin/policy-rc.d";
pub const POLICY_RC_D_SCRIPT: &str = "#!/bin/sh\nexit 101\n";
pub const PKG_SELECTIONS: &str = "var/cache/elbe/pkg-selections";

pub const DPKG_STATUS: &str = "var/lib/dpkg/status";
pub const DPKG_INFO_DIR: &str = "var/lib/dpkg/info";
pub const DOC_DIR: &str = "usr/share/doc";

/// Mount points that must exist in every target, mounted or not.
pub const PSEUDO_FS_DIRS: [&str; 3] = ["dev", "proc", "sys"];

pub fn interpreter_path(interpreter: &str) -> String {
    format!("usr/bin/{interpreter}")
}

/// Where an original file is parked while the sandbox substitutes its own.
pub fn saved_original(rel: &str) -> String {
    format!("{rel}.orig")
}
