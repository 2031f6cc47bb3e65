use crate::mounts::active_mounts_under;
use crate::walk::WalkFiles;
use crate::FsError;
use soft_canonicalize::soft_canonicalize;
use std::fs::{self, File, Metadata, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

/// Capability-scoped view over a directory tree.
///
/// The view borrows the tree: dropping it never touches the directory. Relative paths
/// may carry a leading `/`, which is interpreted against the view's root.
///
/// Symlinks already inside the tree are honored only while they stay inside it: an
/// intermediate directory that resolves elsewhere is a [`FsError::PathEscape`], and
/// writes never follow a final symlink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedFs {
    root: PathBuf,
}

impl ScopedFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Open a view, creating the root. With `clean`, previous content is removed first.
    ///
    /// Cleaning is refused while anything is mounted below the root: a bind-mounted
    /// `/dev` left by a crashed build would otherwise be emptied on the host.
    pub fn create(root: impl Into<PathBuf>, clean: bool) -> Result<Self, FsError> {
        let view = Self::new(root);
        if clean && view.root.exists() {
            if view.is_host_root() {
                return Err(FsError::CleanHostRoot);
            }
            let mounts = active_mounts_under(&view.root);
            if !mounts.is_empty() {
                return Err(FsError::ActiveMounts {
                    root: view.root.clone(),
                    mounts,
                });
            }
            fs::remove_dir_all(&view.root)?;
        }
        fs::create_dir_all(&view.root)?;
        Ok(view)
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The live host root disables every mount and chroot side effect.
    #[inline]
    pub fn is_host_root(&self) -> bool {
        self.root == Path::new("/")
    }

    /// Map `rel` to an absolute path under the root.
    ///
    /// `..` components are applied lexically to the already-resolved prefix; popping
    /// past the root is a [`FsError::PathEscape`]. The directory holding the final
    /// entry is then canonicalized through any symlinks and must still lie under the
    /// root. The final entry itself is not followed, so `stat`, `remove_file` and
    /// friends act on a symlink rather than on what it points to.
    pub fn resolve(&self, rel: impl AsRef<Path>) -> Result<PathBuf, FsError> {
        let rel = rel.as_ref();
        let resolved = self.resolve_lexically(rel)?;
        if let Some(parent) = resolved.parent().filter(|_| resolved != self.root) {
            self.ensure_contained(parent, rel)?;
        }
        Ok(resolved)
    }

    /// Like [`ScopedFs::resolve`], but a final symlink must also point inside the root.
    fn resolve_followed(&self, rel: &Path) -> Result<PathBuf, FsError> {
        let resolved = self.resolve(rel)?;
        self.ensure_contained(&resolved, rel)?;
        Ok(resolved)
    }

    fn ensure_contained(&self, path: &Path, rel: &Path) -> Result<(), FsError> {
        if self.is_host_root() {
            return Ok(());
        }
        let root = soft_canonicalize(&self.root)?;
        if soft_canonicalize(path)?.starts_with(&root) {
            Ok(())
        } else {
            Err(FsError::PathEscape {
                root: self.root.clone(),
                path: rel.to_string_lossy().into_owned(),
            })
        }
    }

    fn resolve_lexically(&self, rel: &Path) -> Result<PathBuf, FsError> {
        let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
        for component in rel.components() {
            match component {
                Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
                Component::ParentDir => {
                    if parts.pop().is_none() {
                        return Err(FsError::PathEscape {
                            root: self.root.clone(),
                            path: rel.to_string_lossy().into_owned(),
                        });
                    }
                }
                Component::Normal(part) => parts.push(part),
            }
        }
        let mut resolved = self.root.clone();
        resolved.extend(parts);
        Ok(resolved)
    }

    pub fn exists(&self, rel: impl AsRef<Path>) -> Result<bool, FsError> {
        Ok(fs::symlink_metadata(self.resolve(rel)?).is_ok())
    }

    /// True for real directories only; a symlink to a directory is not one.
    pub fn is_dir(&self, rel: impl AsRef<Path>) -> Result<bool, FsError> {
        Ok(fs::symlink_metadata(self.resolve(rel)?).is_ok_and(|m| m.is_dir()))
    }

    pub fn is_symlink(&self, rel: impl AsRef<Path>) -> Result<bool, FsError> {
        Ok(fs::symlink_metadata(self.resolve(rel)?).is_ok_and(|m| m.file_type().is_symlink()))
    }

    /// Metadata of the entry itself, without following a final symlink.
    pub fn stat(&self, rel: impl AsRef<Path>) -> Result<Metadata, FsError> {
        Ok(fs::symlink_metadata(self.resolve(rel)?)?)
    }

    pub fn mkdir(&self, rel: impl AsRef<Path>) -> Result<(), FsError> {
        fs::create_dir(self.resolve(rel)?)?;
        Ok(())
    }

    pub fn mkdir_all(&self, rel: impl AsRef<Path>) -> Result<(), FsError> {
        fs::create_dir_all(self.resolve(rel)?)?;
        Ok(())
    }

    /// Idempotent directory creation: anything already occupying the path is accepted.
    pub fn ensure_dir(&self, rel: impl AsRef<Path>) -> Result<(), FsError> {
        match fs::create_dir_all(self.resolve(rel)?) {
            Err(e) if e.kind() != ErrorKind::AlreadyExists => Err(e.into()),
            _ => Ok(()),
        }
    }

    pub fn open(&self, rel: impl AsRef<Path>) -> Result<File, FsError> {
        Ok(File::open(self.resolve_followed(rel.as_ref())?)?)
    }

    pub fn read_to_string(&self, rel: impl AsRef<Path>) -> Result<String, FsError> {
        Ok(fs::read_to_string(self.resolve_followed(rel.as_ref())?)?)
    }

    pub fn read(&self, rel: impl AsRef<Path>) -> Result<Vec<u8>, FsError> {
        Ok(fs::read(self.resolve_followed(rel.as_ref())?)?)
    }

    /// Non-empty lines of a text file, trailing whitespace removed.
    pub fn read_lines(&self, rel: impl AsRef<Path>) -> Result<Vec<String>, FsError> {
        let content = self.read_to_string(rel)?;
        Ok(content
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect())
    }

    /// Create or truncate `rel` with `contents`, then apply `mode`.
    ///
    /// A symlink occupying `rel` is an error, never a redirection.
    pub fn write_file(
        &self,
        rel: impl AsRef<Path>,
        mode: u32,
        contents: impl AsRef<[u8]>,
    ) -> Result<(), FsError> {
        let mut file = create_no_follow(&self.resolve(rel)?, mode)?;
        file.write_all(contents.as_ref())?;
        file.sync_all()?;
        file.set_permissions(fs::Permissions::from_mode(mode))?;
        Ok(())
    }

    /// Symlinks carry no mode of their own, so a final symlink is left alone.
    pub fn chmod(&self, rel: impl AsRef<Path>, mode: u32) -> Result<(), FsError> {
        let path = self.resolve(rel)?;
        if fs::symlink_metadata(&path)?.file_type().is_symlink() {
            return Ok(());
        }
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
        Ok(())
    }

    /// Change ownership of the entry itself; a final symlink is not followed.
    pub fn chown(&self, rel: impl AsRef<Path>, uid: u32, gid: u32) -> Result<(), FsError> {
        std::os::unix::fs::lchown(self.resolve(rel)?, Some(uid), Some(gid))?;
        Ok(())
    }

    /// Create `rel` as a symlink pointing at `target`. The target is stored verbatim.
    pub fn symlink(&self, target: impl AsRef<Path>, rel: impl AsRef<Path>) -> Result<(), FsError> {
        std::os::unix::fs::symlink(target, self.resolve(rel)?)?;
        Ok(())
    }

    /// Sorted entries of a directory, as paths relative to the root.
    pub fn list_dir(
        &self,
        rel: impl AsRef<Path>,
        skip_links: bool,
    ) -> Result<Vec<PathBuf>, FsError> {
        let rel = rel.as_ref();
        let dir = self.resolve(rel)?;
        let base = dir.strip_prefix(&self.root).unwrap_or(rel).to_path_buf();
        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if skip_links && entry.file_type()?.is_symlink() {
                continue;
            }
            entries.push(base.join(entry.file_name()));
        }
        entries.sort();
        Ok(entries)
    }

    /// Lazy depth-first walk over every non-directory entry; see [`WalkFiles`].
    pub fn walk_files(&self) -> WalkFiles {
        WalkFiles::new(&self.root)
    }

    /// Remove a file or symlink. Returns whether something was removed.
    pub fn remove_file(&self, rel: impl AsRef<Path>) -> Result<bool, FsError> {
        match fs::remove_file(self.resolve(rel)?) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn rename(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<(), FsError> {
        fs::rename(self.resolve(from)?, self.resolve(to)?)?;
        Ok(())
    }

    /// Copy a regular file from outside the view into it, keeping its permission bits.
    /// Like [`ScopedFs::write_file`], a symlink at `rel` is not followed.
    pub fn copy_from_host(&self, host: &Path, rel: impl AsRef<Path>) -> Result<(), FsError> {
        let dest = self.resolve(rel)?;
        let mut source = File::open(host)?;
        let meta = source.metadata()?;
        if !meta.is_file() {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("{} is not a regular file", host.display()),
            )
            .into());
        }
        let mode = meta.permissions().mode() & 0o7777;
        let mut file = create_no_follow(&dest, mode)?;
        io::copy(&mut source, &mut file)?;
        file.set_permissions(fs::Permissions::from_mode(mode))?;
        Ok(())
    }
}

fn create_no_follow(path: &Path, mode: u32) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .custom_flags(libc::O_NOFOLLOW)
        .open(path)
}
