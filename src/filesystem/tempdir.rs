use std::{
    ffi::OsString,
    os::unix::ffi::OsStringExt,
    path::{Path, PathBuf},
};

use crate::{error::Error, Result};

/// Request-private scratch directory.
///
/// Created with `mkdtemp` under the worker temp root; removed on drop unless
/// [`TempDir::keep`] was called.
pub struct TempDir {
    path: PathBuf,
    keep: bool,
}

impl TempDir {
    pub async fn new(parent: impl AsRef<Path>) -> Result<Self> {
        let parent = parent.as_ref();
        super::make_dirs(parent).await?;
        let template = parent.join("worker-XXXXXX");
        let mut buf = template.into_os_string().into_vec();
        buf.push(0);
        let ptr = unsafe { libc::mkdtemp(buf.as_mut_ptr().cast()) };
        if ptr.is_null() {
            return Err(Error::io("mkdtemp", parent)(std::io::Error::last_os_error()));
        }
        buf.pop();
        Ok(Self {
            path: PathBuf::from(OsString::from_vec(buf)),
            keep: false,
        })
    }

    /// Leave the directory behind on drop.
    pub fn keep(&mut self) {
        self.keep = true;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(err) = remove_tree_blocking(&self.path) {
            log::warn!("leaking temp dir {:?}: {}", self.path, err);
        }
    }
}

/// Depth-first removal that stays on the starting filesystem.
pub(super) fn remove_tree_blocking(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::MetadataExt;
    let dev = std::fs::symlink_metadata(path)?.dev();
    remove_tree_below(path, dev)?;
    std::fs::remove_dir(path)
}

fn remove_tree_below(path: &Path, dev: u64) -> std::io::Result<()> {
    use std::os::unix::fs::MetadataExt;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() && meta.dev() == dev {
            remove_tree_below(&entry.path(), dev)?;
            std::fs::remove_dir(entry.path())?;
        } else if meta.is_dir() {
            // a foreign mount: do not descend, let rmdir report it
            std::fs::remove_dir(entry.path())?;
        } else {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn unique_paths() {
        let a = TempDir::new(std::env::temp_dir()).await.unwrap();
        let b = TempDir::new(std::env::temp_dir()).await.unwrap();
        assert_ne!(a.path(), b.path());
        assert!(a.path().starts_with(std::env::temp_dir()));
    }

    #[tokio::test]
    async fn removes_nested_content() {
        let path;
        {
            let tmp = TempDir::new(std::env::temp_dir()).await.unwrap();
            path = tmp.path().to_path_buf();
            std::fs::create_dir_all(path.join("a/b/c")).unwrap();
            std::fs::write(path.join("a/b/c/file"), b"x").unwrap();
        }
        assert!(std::fs::metadata(&path).is_err());
    }
}
