use crate::CoreError;
use elbe_fs::layout::PSEUDO_FS_DIRS;
use elbe_fs::{DpkgDatabase, ScopedFs};
use elbe_runtime::{HostOps, ToolCommand};
use elbe_schema::{PackageCache, SelectionMode};
use filetime::FileTime;
use std::collections::BTreeSet;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tracing::{debug, info};

/// What an extraction copied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractReport {
    pub mode: Option<SelectionMode>,
    /// Packages whose manifests were consulted, closure included.
    pub packages: Vec<String>,
    /// Relative paths copied, in copy order. Top-level entries for `Full`.
    pub copied: Vec<String>,
    /// Manifest entries absent from the source.
    pub skipped: Vec<String>,
    /// Non-directory entries in the finished target.
    pub files: usize,
}

/// Listed packages plus their hard-dependency closure, sorted and deduplicated.
pub fn expand_closure(
    packages: &[String],
    cache: &dyn PackageCache,
) -> Result<Vec<String>, CoreError> {
    let mut all: BTreeSet<String> = BTreeSet::new();
    for name in packages {
        for dep in cache.dependencies_of(name)? {
            all.insert(dep.name);
        }
        all.insert(name.clone());
    }
    Ok(all.into_iter().collect())
}

/// Union of the manifest entries of `packages`, sorted and deduplicated.
pub fn manifest_paths(db: &DpkgDatabase, packages: &[String], arch: &str) -> Vec<String> {
    let mut paths: BTreeSet<String> = BTreeSet::new();
    for name in packages {
        paths.extend(db.manifest_paths(name, arch));
    }
    paths.into_iter().collect()
}

/// Copies the selected part of an installed source tree into a target.
pub struct FileSelector<'a> {
    source: &'a ScopedFs,
    arch: &'a str,
    host: &'a dyn HostOps,
}

impl<'a> FileSelector<'a> {
    pub fn new(source: &'a ScopedFs, arch: &'a str, host: &'a dyn HostOps) -> Self {
        Self { source, arch, host }
    }

    /// Packages whose manifests decide the selection. Empty for `Full`.
    pub fn packages(
        &self,
        mode: SelectionMode,
        packages: &[String],
        cache: Option<&dyn PackageCache>,
    ) -> Result<Vec<String>, CoreError> {
        match mode {
            SelectionMode::Full => Ok(Vec::new()),
            SelectionMode::Tighten => {
                let unique: BTreeSet<&String> = packages.iter().collect();
                Ok(unique.into_iter().cloned().collect())
            }
            SelectionMode::Diet => {
                let cache = cache.ok_or(CoreError::NoPackageCache)?;
                expand_closure(packages, cache)
            }
        }
    }

    /// Relative paths to copy: the top-level listing for `Full`, the sorted manifest
    /// union otherwise.
    pub fn select(
        &self,
        mode: SelectionMode,
        packages: &[String],
        cache: Option<&dyn PackageCache>,
    ) -> Result<Vec<String>, CoreError> {
        if mode == SelectionMode::Full {
            return Ok(self
                .source
                .list_dir("", false)?
                .into_iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect());
        }
        let names = self.packages(mode, packages, cache)?;
        let db = DpkgDatabase::new(self.source.clone());
        Ok(manifest_paths(&db, &names, self.arch))
    }

    /// Populate `target` from the source. Always leaves `dev`, `proc` and `sys` behind.
    pub fn extract(
        &self,
        target: &ScopedFs,
        mode: SelectionMode,
        packages: &[String],
        cache: Option<&dyn PackageCache>,
    ) -> Result<ExtractReport, CoreError> {
        info!(
            "extracting {} into {} ({mode})",
            self.source.root().display(),
            target.root().display()
        );
        let mut report = ExtractReport {
            mode: Some(mode),
            packages: self.packages(mode, packages, cache)?,
            ..ExtractReport::default()
        };

        if mode == SelectionMode::Full {
            for entry in self.select(mode, packages, cache)? {
                self.copy_entry(&entry, &target.resolve("")?)?;
                report.copied.push(entry);
            }
        } else {
            let db = DpkgDatabase::new(self.source.clone());
            let paths = manifest_paths(&db, &report.packages, self.arch);
            self.copy_filelist(target, &paths, &mut report)?;
        }

        for dir in PSEUDO_FS_DIRS {
            target.ensure_dir(dir)?;
        }
        for entry in target.walk_files() {
            entry?;
            report.files += 1;
        }
        info!(
            "copied {} entries ({} files in target), skipped {} missing",
            report.copied.len(),
            report.files,
            report.skipped.len()
        );
        Ok(report)
    }

    /// `cp -a --reflink=auto <source>/<rel> <dest>`: attributes kept, CoW where supported.
    fn copy_entry(&self, rel: &str, dest: &Path) -> Result<(), CoreError> {
        let src = self.source.resolve(rel)?;
        let cmd = ToolCommand::new("cp")
            .args(["-a", "--reflink=auto"])
            .arg(src.to_string_lossy())
            .arg(dest.to_string_lossy());
        self.host.run_checked(&cmd)?;
        Ok(())
    }

    fn copy_filelist(
        &self,
        target: &ScopedFs,
        paths: &[String],
        report: &mut ExtractReport,
    ) -> Result<(), CoreError> {
        let mut dirs = Vec::new();
        for rel in paths {
            if !self.source.exists(rel)? {
                debug!("{rel} listed in a manifest but absent from the source");
                report.skipped.push(rel.clone());
                continue;
            }
            if self.source.is_dir(rel)? {
                target.ensure_dir(rel)?;
                let meta = self.source.stat(rel)?;
                target.chown(rel, meta.uid(), meta.gid())?;
                dirs.push(rel);
            } else {
                if let Some(parent) = Path::new(rel).parent() {
                    target.ensure_dir(parent)?;
                }
                self.copy_entry(rel, &target.resolve(rel)?)?;
            }
            report.copied.push(rel.clone());
        }

        // Copying children bumps directory mtimes; restore them once everything is in.
        for rel in dirs {
            let meta = self.source.stat(rel)?;
            target.chmod(rel, meta.mode() & 0o7777)?;
            filetime::set_file_times(
                target.resolve(rel)?,
                FileTime::from_last_access_time(&meta),
                FileTime::from_last_modification_time(&meta),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use elbe_runtime::MockHost;
    use elbe_schema::{CacheError, PackageManifest};
    use std::collections::BTreeMap;

    /// Package -> direct hard dependencies; `dependencies_of` walks them transitively.
    struct GraphCache(BTreeMap<&'static str, Vec<&'static str>>);

    impl PackageCache for GraphCache {
        fn installed_packages(&self) -> Result<Vec<PackageManifest>, CacheError> {
            Ok(self.0.keys().map(|n| PackageManifest::new(*n, "1.0")).collect())
        }

        fn dependencies_of(&self, name: &str) -> Result<Vec<PackageManifest>, CacheError> {
            if !self.0.contains_key(name) {
                return Err(CacheError::NotInstalled(name.to_owned()));
            }
            let mut seen = BTreeSet::new();
            let mut stack = vec![name];
            while let Some(next) = stack.pop() {
                for dep in self.0.get(next).into_iter().flatten() {
                    if *dep != name && seen.insert(*dep) {
                        stack.push(*dep);
                    }
                }
            }
            Ok(seen.into_iter().map(|n| PackageManifest::new(n, "1.0")).collect())
        }
    }

    fn graph() -> GraphCache {
        GraphCache(BTreeMap::from([
            ("app", vec!["libfoo", "libc6"]),
            ("libfoo", vec!["libc6"]),
            ("libc6", vec![]),
            ("tool", vec!["libc6"]),
        ]))
    }

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| (*s).to_owned()).collect()
    }

    fn source_tree() -> (tempfile::TempDir, ScopedFs) {
        let dir = tempfile::tempdir().unwrap();
        let fs = ScopedFs::new(dir.path());
        fs.mkdir_all("var/lib/dpkg/info").unwrap();
        fs.mkdir_all("usr/bin").unwrap();
        fs.mkdir_all("lib").unwrap();
        fs.write_file("usr/bin/app", 0o755, "app").unwrap();
        fs.write_file("lib/libfoo.so", 0o644, "foo").unwrap();
        fs.write_file("lib/libc.so.6", 0o644, "libc").unwrap();
        fs.write_file(
            "var/lib/dpkg/info/app.list",
            0o644,
            "/.\n/usr\n/usr/bin\n/usr/bin/app\n",
        )
        .unwrap();
        fs.write_file("var/lib/dpkg/info/libfoo:armhf.list", 0o644, "/lib\n/lib/libfoo.so\n")
            .unwrap();
        fs.write_file("var/lib/dpkg/info/libc6:armhf.list", 0o644, "/lib\n/lib/libc.so.6\n")
            .unwrap();
        fs.write_file(
            "var/lib/dpkg/info/libc6:armhf.conffiles",
            0o644,
            "/etc/ld.so.conf\n",
        )
        .unwrap();
        (dir, fs)
    }

    #[test]
    fn closure_includes_requested_packages() {
        let closure = expand_closure(&names(&["app"]), &graph()).unwrap();
        assert_eq!(closure, names(&["app", "libc6", "libfoo"]));
    }

    #[test]
    fn closure_expansion_is_idempotent() {
        let cache = graph();
        let once = expand_closure(&names(&["app", "tool"]), &cache).unwrap();
        let twice = expand_closure(&once, &cache).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn closure_propagates_unknown_packages() {
        assert!(matches!(
            expand_closure(&names(&["ghost"]), &graph()),
            Err(CoreError::Cache(CacheError::NotInstalled(_)))
        ));
    }

    #[test]
    fn tighten_selects_only_listed_manifests() {
        let (_dir, src) = source_tree();
        let host = MockHost::new();
        let selector = FileSelector::new(&src, "armhf", &host);
        let paths = selector
            .select(SelectionMode::Tighten, &names(&["app"]), None)
            .unwrap();
        assert_eq!(paths, vec!["/.", "/usr", "/usr/bin", "/usr/bin/app"]);
    }

    #[test]
    fn diet_selects_closure_manifests_sorted_and_deduplicated() {
        let (_dir, src) = source_tree();
        let host = MockHost::new();
        let selector = FileSelector::new(&src, "armhf", &host);
        let cache = graph();
        let paths = selector
            .select(SelectionMode::Diet, &names(&["app"]), Some(&cache))
            .unwrap();
        assert_eq!(
            paths,
            vec![
                "/.",
                "/etc/ld.so.conf",
                "/lib",
                "/lib/libc.so.6",
                "/lib/libfoo.so",
                "/usr",
                "/usr/bin",
                "/usr/bin/app",
            ]
        );
    }

    #[test]
    fn diet_without_cache_is_rejected() {
        let (_dir, src) = source_tree();
        let host = MockHost::new();
        let selector = FileSelector::new(&src, "armhf", &host);
        assert!(matches!(
            selector.select(SelectionMode::Diet, &names(&["app"]), None),
            Err(CoreError::NoPackageCache)
        ));
    }

    #[test]
    fn full_mode_copies_top_level_entries() {
        let (_dir, src) = source_tree();
        let target_dir = tempfile::tempdir().unwrap();
        let target = ScopedFs::new(target_dir.path());
        let host = MockHost::new();
        let report = FileSelector::new(&src, "armhf", &host)
            .extract(&target, SelectionMode::Full, &[], None)
            .unwrap();
        assert_eq!(report.copied, vec!["lib", "usr", "var"]);
        let lines = host.command_lines();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("cp -a --reflink=auto "));
        assert!(lines[0].ends_with(&target_dir.path().display().to_string()));
        for dir in PSEUDO_FS_DIRS {
            assert!(target.is_dir(dir).unwrap());
        }
    }

    #[test]
    fn missing_manifest_entries_are_skipped() {
        let (_dir, src) = source_tree();
        let target_dir = tempfile::tempdir().unwrap();
        let target = ScopedFs::new(target_dir.path());
        let host = MockHost::new();
        let report = FileSelector::new(&src, "armhf", &host)
            .extract(&target, SelectionMode::Tighten, &names(&["libc6"]), None)
            .unwrap();
        assert_eq!(report.skipped, vec!["/etc/ld.so.conf"]);
        assert_eq!(report.copied, vec!["/lib", "/lib/libc.so.6"]);
        assert!(target.is_dir("lib").unwrap());
    }

    #[test]
    fn failed_copy_is_fatal() {
        let (_dir, src) = source_tree();
        let target_dir = tempfile::tempdir().unwrap();
        let target = ScopedFs::new(target_dir.path());
        let host = MockHost::new();
        host.fail_program("cp");
        let result = FileSelector::new(&src, "armhf", &host).extract(
            &target,
            SelectionMode::Tighten,
            &names(&["app"]),
            None,
        );
        assert!(matches!(result, Err(CoreError::Runtime(_))));
    }
}
