//! Sandbox teardown guarantees, driven through the public API.

use elbe_fs::layout::{APT_CONF, POLICY_RC_D, RESOLV_CONF};
use elbe_fs::ScopedFs;
use elbe_fs::FsError;
use elbe_runtime::{
    check_build_prereqs, release_stale_mounts, ChrootSandbox, HostOps, HostSystem, MockHost,
    MountSpec, RuntimeError, SandboxConfig, SandboxState,
};
use std::io::ErrorKind;
use std::path::Path;

fn host_files(dir: &Path) -> SandboxConfig {
    std::fs::write(dir.join("resolv.conf"), "nameserver 192.0.2.53\n").unwrap();
    std::fs::write(dir.join("apt.conf"), "APT::Get::Assume-Yes \"true\";\n").unwrap();
    std::fs::write(dir.join("qemu-aarch64-static"), "emulator").unwrap();
    SandboxConfig {
        interpreter: Some("qemu-aarch64-static".to_owned()),
        interpreter_dirs: vec![dir.to_path_buf()],
        resolv_conf: dir.join("resolv.conf"),
        apt_conf: dir.join("apt.conf"),
    }
}

fn assert_no_sandbox_residue(fs: &ScopedFs) {
    assert!(!fs.exists("usr/bin/qemu-aarch64-static").unwrap());
    assert!(!fs.exists(RESOLV_CONF).unwrap());
    assert!(!fs.exists(APT_CONF).unwrap());
    assert!(!fs.exists(POLICY_RC_D).unwrap());
    assert!(!fs.exists("etc/resolv.conf.orig").unwrap());
}

#[test]
fn teardown_after_mount_failure_removes_injected_files() {
    let target = tempfile::tempdir().unwrap();
    let host_dir = tempfile::tempdir().unwrap();
    let fs = ScopedFs::new(target.path());
    let host = MockHost::new();
    host.fail_mount("sys");

    let mut sandbox = ChrootSandbox::open(fs.clone(), host_files(host_dir.path()), &host).unwrap();
    assert!(fs.exists(POLICY_RC_D).unwrap());
    let err = sandbox.mount().unwrap_err();
    assert!(matches!(err, RuntimeError::Mount { .. }));
    assert_eq!(sandbox.state(), SandboxState::Unmounted);
    drop(sandbox);

    assert!(host.mounted().is_empty());
    assert_eq!(host.unmounted(), vec![target.path().join("proc")]);
    assert_no_sandbox_residue(&fs);
}

#[test]
fn teardown_after_failed_command_inside_sandbox() {
    let target = tempfile::tempdir().unwrap();
    let host_dir = tempfile::tempdir().unwrap();
    let fs = ScopedFs::new(target.path());
    let host = MockHost::new();
    host.fail_program("chroot");

    let result = (|| -> Result<(), RuntimeError> {
        let mut sandbox = ChrootSandbox::open(fs.clone(), host_files(host_dir.path()), &host)?;
        sandbox.mount()?;
        sandbox.run(&["dpkg", "--purge", "-a"], None)?;
        sandbox.close()
    })();

    assert!(matches!(result, Err(RuntimeError::ExternalTool { .. })));
    assert!(host.mounted().is_empty());
    assert_no_sandbox_residue(&fs);
}

#[test]
#[ignore = "requires root, mount(8) and a target tree with a working /bin/sh"]
fn real_chroot_round_trip() {
    let target = std::env::var("ELBE_TEST_TARGET").expect("ELBE_TEST_TARGET must name a rootfs");
    let host = HostSystem::new();
    let fs = ScopedFs::new(&target);
    let config = SandboxConfig {
        interpreter: None,
        ..SandboxConfig::default()
    };
    let mut sandbox = ChrootSandbox::open(fs.clone(), config, &host).unwrap();
    sandbox.mount().unwrap();
    assert!(host.is_mount_point(&fs.resolve("proc").unwrap()));
    let out = sandbox.run(&["/bin/sh", "-c", "echo $LC_ALL"], None).unwrap();
    assert_eq!(out.stdout.trim(), "C");
    sandbox.enter_sandbox().unwrap();
    sandbox.leave_sandbox().unwrap();
    sandbox.close().unwrap();
    assert!(!host.is_mount_point(&fs.resolve("proc").unwrap()));
}

fn privileged() -> bool {
    check_build_prereqs()
        .iter()
        .all(|missing| missing.name != "root privileges")
}

#[test]
fn relative_root_is_resolved_before_the_directory_change() {
    // As root this would really chroot the whole test process; the ignored
    // round trip below covers that case.
    if privileged() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("rootfs")).unwrap();
    let before = std::env::current_dir().unwrap();
    std::env::set_current_dir(dir.path()).unwrap();

    let err = HostSystem::new()
        .change_root(Path::new("rootfs"))
        .unwrap_err();
    let cwd = std::env::current_dir().unwrap();
    std::env::set_current_dir(before).unwrap();

    // The chroot itself is refused; `rootfs/rootfs` is never looked up.
    match err {
        RuntimeError::Chroot { source, .. } => {
            assert_eq!(source.kind(), ErrorKind::PermissionDenied);
        }
        other => panic!("expected a chroot error, got {other:?}"),
    }
    assert_eq!(cwd, std::fs::canonicalize(dir.path()).unwrap());
}

#[test]
#[ignore = "requires root"]
fn relative_root_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("rootfs")).unwrap();
    let before = std::env::current_dir().unwrap();
    std::env::set_current_dir(dir.path()).unwrap();

    let host = HostSystem::new();
    let saved = host.change_root(Path::new("rootfs")).unwrap();
    host.restore_root(saved).unwrap();
    let cwd = std::env::current_dir().unwrap();
    std::env::set_current_dir(before).unwrap();
    assert_eq!(cwd, std::fs::canonicalize(dir.path()).unwrap());
}

#[test]
#[ignore = "requires root and mount(8)"]
fn target_with_a_leftover_bind_mount_is_not_wiped() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("target");
    let outside = dir.path().join("host-dev");
    std::fs::create_dir_all(target.join("dev")).unwrap();
    std::fs::create_dir_all(&outside).unwrap();
    std::fs::write(outside.join("node"), "device").unwrap();

    let host = HostSystem::new();
    let outside_str = outside.to_string_lossy().into_owned();
    let spec = MountSpec {
        source: Box::leak(outside_str.into_boxed_str()),
        target: "dev",
        fs_type: None,
    };
    host.mount(&spec, &target.join("dev")).unwrap();
    assert!(host.is_mount_point(&target.join("dev")));

    assert!(matches!(
        ScopedFs::create(&target, true),
        Err(FsError::ActiveMounts { .. })
    ));
    assert!(outside.join("node").exists());

    assert_eq!(release_stale_mounts(&target, &host), 1);
    ScopedFs::create(&target, true).unwrap();
    assert!(outside.join("node").exists());
}
