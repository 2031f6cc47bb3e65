use crate::CoreError;
use elbe_fs::layout::PKG_SELECTIONS;
use elbe_fs::ScopedFs;
use elbe_runtime::{ChrootSandbox, HostOps, SandboxConfig, ToolCommand};
use elbe_schema::ProjectConfig;
use std::path::Path;
use tracing::{debug, info, warn};

/// `dpkg --set-selections` input marking every package for installation.
pub fn selection_file(packages: &[String]) -> String {
    packages
        .iter()
        .map(|name| format!("{name}  install\n"))
        .collect()
}

/// Debian architecture of the build host.
pub fn detect_host_arch(host: &dyn HostOps) -> Result<String, CoreError> {
    let out = host.run_checked(&ToolCommand::new("dpkg").arg("--print-architecture"))?;
    Ok(out.stdout.trim().to_owned())
}

/// The interpreter to inject, if the target cannot run natively on this host.
fn cross_interpreter(
    config: &ProjectConfig,
    host: &dyn HostOps,
) -> Result<Option<String>, CoreError> {
    let host_arch = detect_host_arch(host)?;
    if host_arch == config.project.arch {
        debug!("native build for {host_arch}, no interpreter needed");
        return Ok(None);
    }
    if config.project.interpreter.is_none() {
        warn!(
            "cross build ({host_arch} host, {} target) without a configured interpreter",
            config.project.arch
        );
    }
    Ok(config.project.interpreter.clone())
}

const DPKG: &str = "/usr/bin/dpkg";

/// Purge every installed package not listed in `target.packages`.
///
/// The listing is written into the target, handed to dpkg inside the sandbox, and
/// removed again whatever the outcome.
pub(crate) fn apply(
    target: &ScopedFs,
    config: &ProjectConfig,
    host: &dyn HostOps,
) -> Result<(), CoreError> {
    let interpreter = cross_interpreter(config, host)?;

    if let Some(parent) = Path::new(PKG_SELECTIONS).parent() {
        target.mkdir_all(parent)?;
    }
    target.write_file(
        PKG_SELECTIONS,
        0o644,
        selection_file(&config.target.packages),
    )?;

    let result = run_dpkg(target, config, interpreter, host);
    if let Err(e) = target.remove_file(PKG_SELECTIONS) {
        warn!("could not remove {PKG_SELECTIONS}: {e}");
    }
    result
}

fn run_dpkg(
    target: &ScopedFs,
    config: &ProjectConfig,
    interpreter: Option<String>,
    host: &dyn HostOps,
) -> Result<(), CoreError> {
    let sandbox_config = SandboxConfig::from_section(&config.sandbox, interpreter);
    let mut sandbox = ChrootSandbox::open(target.clone(), sandbox_config, host)?;
    sandbox.mount()?;
    info!(
        "applying package selections ({} packages)",
        config.target.packages.len()
    );
    sandbox.run(&[DPKG, "--clear-selections"], None)?;
    sandbox.run(&[DPKG, "--set-selections"], Some(PKG_SELECTIONS))?;
    sandbox.run(&[DPKG, "--purge", "-a"], None)?;
    sandbox.close()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use elbe_runtime::MockHost;
    use elbe_schema::parse_project_str;

    fn config(arch: &str) -> ProjectConfig {
        parse_project_str(&format!(
            r#"
[project]
name = "demo"
version = "1.0"
arch = "{arch}"

[target]
setsel = true
packages = ["busybox", "base-files"]

[sandbox]
resolv_conf = "/nonexistent/resolv.conf"
apt_conf = "/nonexistent/apt.conf"
"#
        ))
        .unwrap()
    }

    #[test]
    fn selection_lines_use_two_spaces() {
        let file = selection_file(&["a".to_owned(), "b".to_owned()]);
        assert_eq!(file, "a  install\nb  install\n");
    }

    #[test]
    fn dpkg_runs_clear_set_purge_inside_the_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = ScopedFs::new(dir.path());
        let host = MockHost::new();
        host.respond("dpkg", "amd64\n");
        apply(&target, &config("amd64"), &host).unwrap();

        let root = dir.path().display().to_string();
        let lines = host.command_lines();
        assert_eq!(lines[0], "dpkg --print-architecture");
        assert_eq!(lines[1], format!("chroot {root} /usr/bin/dpkg --clear-selections"));
        assert_eq!(
            lines[2],
            format!(
                "chroot {root} /usr/bin/dpkg --set-selections < {root}/var/cache/elbe/pkg-selections"
            )
        );
        assert_eq!(lines[3], format!("chroot {root} /usr/bin/dpkg --purge -a"));
        assert!(!target.exists(PKG_SELECTIONS).unwrap());
        assert!(host.mounted().is_empty());
    }

    #[test]
    fn failed_purge_still_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let target = ScopedFs::new(dir.path());
        let host = MockHost::new();
        host.respond("dpkg", "amd64\n");
        host.fail_program("chroot");
        let err = apply(&target, &config("amd64"), &host).unwrap_err();
        assert!(matches!(err, CoreError::Runtime(_)));
        assert!(!target.exists(PKG_SELECTIONS).unwrap());
        assert!(!target.exists("usr/sbin/policy-rc.d").unwrap());
        assert!(host.mounted().is_empty());
    }

    #[test]
    fn cross_build_without_interpreter_only_warns() {
        let host = MockHost::new();
        host.respond("dpkg", "amd64\n");
        let interp = cross_interpreter(&config("armhf"), &host).unwrap();
        assert_eq!(interp, None);
    }

    #[test]
    fn native_build_skips_the_interpreter() {
        let host = MockHost::new();
        host.respond("dpkg", "armhf\n");
        let mut cfg = config("armhf");
        cfg.project.interpreter = Some("qemu-arm-static".to_owned());
        assert_eq!(cross_interpreter(&cfg, &host).unwrap(), None);
        host.respond("dpkg", "amd64\n");
        assert_eq!(
            cross_interpreter(&cfg, &host).unwrap().as_deref(),
            Some("qemu-arm-static")
        );
    }

    #[test]
    fn sandbox_is_released_before_returning() {
        let dir = tempfile::tempdir().unwrap();
        let target = ScopedFs::new(dir.path());
        let host = MockHost::new();
        host.respond("dpkg", "amd64\n");
        apply(&target, &config("amd64"), &host).unwrap();
        let released: Vec<_> = host
            .unmounted()
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            released,
            ["dev/pts", "dev", "sys", "proc"]
                .map(std::path::PathBuf::from)
                .to_vec()
        );
    }
}
