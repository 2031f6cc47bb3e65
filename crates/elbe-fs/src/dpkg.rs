use crate::layout::{DPKG_INFO_DIR, DPKG_STATUS};
use crate::{FsError, ScopedFs};
use elbe_schema::{CacheError, PackageCache, PackageManifest};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::debug;

/// Reader for the per-package file lists under `var/lib/dpkg/info`.
#[derive(Debug, Clone)]
pub struct DpkgDatabase {
    fs: ScopedFs,
}

impl DpkgDatabase {
    pub fn new(fs: ScopedFs) -> Self {
        Self { fs }
    }

    pub fn fs(&self) -> &ScopedFs {
        &self.fs
    }

    /// Lines of one info file, or nothing when it is missing or unreadable.
    ///
    /// Manifests routinely reference packages whose info files are absent
    /// (e.g. `Architecture: all` packages have no arch-qualified list).
    fn info_lines(&self, file_name: &str) -> Vec<String> {
        let rel = format!("{DPKG_INFO_DIR}/{file_name}");
        match self.fs.read_lines(&rel) {
            Ok(lines) => lines,
            Err(FsError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                debug!("skipping unreadable manifest {rel}: {e}");
                Vec::new()
            }
        }
    }

    /// Files owned by `name`: the `name:arch` list first, then the plain one.
    pub fn files(&self, name: &str, arch: &str) -> Vec<String> {
        let mut files = self.info_lines(&format!("{name}:{arch}.list"));
        files.extend(self.info_lines(&format!("{name}.list")));
        files
    }

    /// Configuration files of `name`, arch-qualified list first.
    pub fn conffiles(&self, name: &str, arch: &str) -> Vec<String> {
        let mut files = self.info_lines(&format!("{name}:{arch}.conffiles"));
        files.extend(self.info_lines(&format!("{name}.conffiles")));
        files
    }

    /// Every path recorded for `name`: owned files followed by configuration files.
    pub fn manifest_paths(&self, name: &str, arch: &str) -> Vec<String> {
        let mut paths = self.files(name, arch);
        paths.extend(self.conffiles(name, arch));
        paths
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StatusEntry {
    name: String,
    version: String,
    architecture: String,
    /// `Depends` and `Pre-Depends`: each inner list is one group of alternatives.
    depends: Vec<Vec<String>>,
    provides: Vec<String>,
}

/// Package cache backed by the dpkg database of an installed tree.
pub struct DpkgCache {
    db: DpkgDatabase,
    arch: String,
    installed: BTreeMap<String, StatusEntry>,
    providers: BTreeMap<String, Vec<String>>,
}

impl DpkgCache {
    pub fn load(fs: ScopedFs, arch: &str) -> Result<Self, CacheError> {
        let db = DpkgDatabase::new(fs);
        let status = db.fs().read_to_string(DPKG_STATUS).map_err(|e| match e {
            FsError::Io(io) => CacheError::Io(io),
            other => CacheError::Io(std::io::Error::other(other.to_string())),
        })?;
        let entries = parse_status(&status)?;

        let mut installed = BTreeMap::new();
        let mut providers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for entry in entries {
            for virtual_name in &entry.provides {
                providers
                    .entry(virtual_name.clone())
                    .or_default()
                    .push(entry.name.clone());
            }
            installed.insert(entry.name.clone(), entry);
        }
        debug!("loaded {} installed packages from dpkg status", installed.len());

        Ok(Self {
            db,
            arch: arch.to_owned(),
            installed,
            providers,
        })
    }

    pub fn is_installed(&self, name: &str) -> bool {
        self.installed.contains_key(name)
    }

    fn manifest(&self, entry: &StatusEntry) -> PackageManifest {
        PackageManifest {
            name: entry.name.clone(),
            version: entry.version.clone(),
            architecture: entry.architecture.clone(),
            files: self.db.files(&entry.name, &self.arch),
            conffiles: self.db.conffiles(&entry.name, &self.arch),
        }
    }

    /// First alternative satisfied by an installed package, directly or via `Provides`.
    fn satisfy(&self, alternatives: &[String]) -> Option<&str> {
        alternatives.iter().find_map(|alt| {
            if let Some(entry) = self.installed.get(alt) {
                return Some(entry.name.as_str());
            }
            self.providers
                .get(alt)
                .and_then(|names| names.first())
                .map(String::as_str)
        })
    }
}

impl PackageCache for DpkgCache {
    fn installed_packages(&self) -> Result<Vec<PackageManifest>, CacheError> {
        Ok(self.installed.values().map(|e| self.manifest(e)).collect())
    }

    fn dependencies_of(&self, name: &str) -> Result<Vec<PackageManifest>, CacheError> {
        let root = self
            .installed
            .get(name)
            .ok_or_else(|| CacheError::NotInstalled(name.to_owned()))?;

        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let mut queue: VecDeque<&StatusEntry> = VecDeque::from([root]);
        while let Some(entry) = queue.pop_front() {
            for group in &entry.depends {
                let Some(dep) = self.satisfy(group) else {
                    debug!("{}: unsatisfied dependency '{}'", entry.name, group.join(" | "));
                    continue;
                };
                if dep != name && seen.insert(dep) {
                    if let Some(next) = self.installed.get(dep) {
                        queue.push_back(next);
                    }
                }
            }
        }

        Ok(seen
            .into_iter()
            .filter_map(|dep| self.installed.get(dep))
            .map(|e| self.manifest(e))
            .collect())
    }
}

/// Parse a relation field such as `libc6 (>= 2.36), dash | bash:any`.
///
/// Version constraints and architecture qualifiers are dropped.
fn parse_relations(field: &str) -> Vec<Vec<String>> {
    field
        .split(',')
        .map(|group| {
            group
                .split('|')
                .filter_map(|alt| {
                    let name = alt.split_whitespace().next()?;
                    let name = name.split(':').next().unwrap_or(name);
                    let name = name.split('(').next().unwrap_or(name);
                    (!name.is_empty()).then(|| name.to_owned())
                })
                .collect::<Vec<_>>()
        })
        .filter(|alts| !alts.is_empty())
        .collect()
}

/// Parse a dpkg status file, keeping only `install ok installed` stanzas.
fn parse_status(content: &str) -> Result<Vec<StatusEntry>, CacheError> {
    let mut entries = Vec::new();
    let mut fields: BTreeMap<String, String> = BTreeMap::new();
    let mut last_key: Option<String> = None;
    let mut stanza_start = 1;

    let mut finish = |fields: &mut BTreeMap<String, String>, line: usize| {
        if fields.is_empty() {
            return Ok(());
        }
        let taken = std::mem::take(fields);
        let Some(name) = taken.get("Package").cloned() else {
            return Err(CacheError::Malformed {
                line,
                reason: "stanza without Package field".to_owned(),
            });
        };
        if taken.get("Status").map(String::as_str) != Some("install ok installed") {
            return Ok(());
        }
        let mut depends = Vec::new();
        for key in ["Pre-Depends", "Depends"] {
            if let Some(value) = taken.get(key) {
                depends.extend(parse_relations(value));
            }
        }
        let provides = taken
            .get("Provides")
            .map(|v| parse_relations(v).into_iter().flatten().collect())
            .unwrap_or_default();
        entries.push(StatusEntry {
            name,
            version: taken.get("Version").cloned().unwrap_or_default(),
            architecture: taken.get("Architecture").cloned().unwrap_or_default(),
            depends,
            provides,
        });
        Ok(())
    };

    for (idx, line) in content.lines().enumerate() {
        let lineno = idx + 1;
        if line.trim().is_empty() {
            finish(&mut fields, stanza_start)?;
            last_key = None;
            stanza_start = lineno + 1;
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            let Some(key) = &last_key else {
                return Err(CacheError::Malformed {
                    line: lineno,
                    reason: "continuation line without a field".to_owned(),
                });
            };
            if let Some(value) = fields.get_mut(key) {
                value.push('\n');
                value.push_str(line.trim());
            }
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            return Err(CacheError::Malformed {
                line: lineno,
                reason: format!("expected 'Field: value', got '{line}'"),
            });
        };
        fields.insert(key.to_owned(), value.trim().to_owned());
        last_key = Some(key.to_owned());
    }
    finish(&mut fields, stanza_start)?;

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &str = "\
Package: busybox
Status: install ok installed
Architecture: armhf
Version: 1:1.36.1-6
Depends: libc6 (>= 2.36)
Description: tiny utilities
 long description line

Package: libc6
Status: install ok installed
Architecture: armhf
Version: 2.36-9
Depends: libgcc-s1

Package: libgcc-s1
Status: install ok installed
Architecture: armhf
Version: 12.2.0-14
Pre-Depends: libc6

Package: dropbear
Status: install ok installed
Architecture: armhf
Version: 2022.83-1
Depends: dropbear-bin, ssh-keygen-provider | openssh-client
Recommends: xauth

Package: dropbear-bin
Status: install ok installed
Architecture: armhf
Version: 2022.83-1
Depends: libc6:any, zlib1g

Package: tinykeys
Status: install ok installed
Architecture: armhf
Version: 1.0
Provides: ssh-keygen-provider

Package: zlib1g
Status: deinstall ok config-files
Architecture: armhf
Version: 1:1.2.13
";

    fn fixture() -> (tempfile::TempDir, DpkgCache) {
        let dir = tempfile::tempdir().unwrap();
        let fs = ScopedFs::new(dir.path());
        fs.mkdir_all(DPKG_INFO_DIR).unwrap();
        fs.write_file(DPKG_STATUS, 0o644, STATUS).unwrap();
        fs.write_file(
            "var/lib/dpkg/info/busybox.list",
            0o644,
            "/.\n/bin\n/bin/busybox\n",
        )
        .unwrap();
        fs.write_file(
            "var/lib/dpkg/info/libc6:armhf.list",
            0o644,
            "/lib\n/lib/libc.so.6\n",
        )
        .unwrap();
        fs.write_file(
            "var/lib/dpkg/info/libc6:armhf.conffiles",
            0o644,
            "/etc/ld.so.conf.d/arm.conf\n",
        )
        .unwrap();
        let cache = DpkgCache::load(fs, "armhf").unwrap();
        (dir, cache)
    }

    fn names(manifests: &[PackageManifest]) -> Vec<&str> {
        manifests.iter().map(|m| m.name.as_str()).collect()
    }

    #[test]
    fn only_installed_stanzas_are_listed() {
        let (_dir, cache) = fixture();
        let installed = cache.installed_packages().unwrap();
        assert!(names(&installed).contains(&"busybox"));
        assert!(!names(&installed).contains(&"zlib1g"));
        assert!(!cache.is_installed("zlib1g"));
    }

    #[test]
    fn manifests_merge_plain_and_arch_qualified_lists() {
        let (_dir, cache) = fixture();
        let installed = cache.installed_packages().unwrap();
        let libc = installed.iter().find(|m| m.name == "libc6").unwrap();
        assert_eq!(libc.files, vec!["/lib", "/lib/libc.so.6"]);
        assert_eq!(libc.conffiles, vec!["/etc/ld.so.conf.d/arm.conf"]);
        assert_eq!(libc.version, "2.36-9");
        assert_eq!(libc.architecture, "armhf");
    }

    #[test]
    fn closure_is_transitive_and_excludes_self() {
        let (_dir, cache) = fixture();
        let deps = cache.dependencies_of("busybox").unwrap();
        assert_eq!(names(&deps), vec!["libc6", "libgcc-s1"]);
    }

    #[test]
    fn closure_follows_provides_and_skips_recommends() {
        let (_dir, cache) = fixture();
        let deps = cache.dependencies_of("dropbear").unwrap();
        let deps = names(&deps);
        assert!(deps.contains(&"dropbear-bin"));
        assert!(deps.contains(&"tinykeys"));
        assert!(deps.contains(&"libc6"));
        assert!(!deps.contains(&"xauth"));
        assert!(!deps.contains(&"zlib1g"));
    }

    #[test]
    fn cyclic_dependencies_terminate() {
        let (_dir, cache) = fixture();
        let deps = cache.dependencies_of("libc6").unwrap();
        assert_eq!(names(&deps), vec!["libgcc-s1"]);
    }

    #[test]
    fn unknown_package_is_an_error() {
        let (_dir, cache) = fixture();
        assert!(matches!(
            cache.dependencies_of("nonexistent"),
            Err(CacheError::NotInstalled(_))
        ));
    }

    #[test]
    fn missing_info_files_yield_empty_manifest() {
        let (_dir, cache) = fixture();
        assert!(cache.db.manifest_paths("tinykeys", "armhf").is_empty());
    }

    #[test]
    fn parse_relations_strips_versions_and_qualifiers() {
        let rel = parse_relations("libc6 (>= 2.36), dash | bash:any, perl:any (>= 5)");
        assert_eq!(
            rel,
            vec![
                vec!["libc6".to_owned()],
                vec!["dash".to_owned(), "bash".to_owned()],
                vec!["perl".to_owned()],
            ]
        );
    }

    #[test]
    fn malformed_status_is_rejected() {
        assert!(matches!(
            parse_status("Package busybox\n"),
            Err(CacheError::Malformed { line: 1, .. })
        ));
        assert!(matches!(
            parse_status(" dangling\n"),
            Err(CacheError::Malformed { .. })
        ));
    }
}
