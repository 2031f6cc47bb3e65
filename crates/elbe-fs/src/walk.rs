use crate::FsError;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Lazy depth-first walk over the non-directory entries of a tree.
///
/// Yields `(relative, absolute)` pairs in file-name order. Symlinks are reported as
/// entries and never followed. Restart a walk by asking the view for a new one.
pub struct WalkFiles {
    root: PathBuf,
    inner: walkdir::IntoIter,
}

impl WalkFiles {
    pub(crate) fn new(root: &Path) -> Self {
        let inner = WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();
        Self {
            root: root.to_path_buf(),
            inner,
        }
    }
}

impl Iterator for WalkFiles {
    type Item = Result<(PathBuf, PathBuf), FsError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e.into())),
            };
            if entry.file_type().is_dir() {
                continue;
            }
            let abs = entry.into_path();
            let rel = abs.strip_prefix(&self.root).unwrap_or(&abs).to_path_buf();
            return Some(Ok((rel, abs)));
        }
    }
}
