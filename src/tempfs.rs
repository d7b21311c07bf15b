//! Per-request staging area: one root directory under the system temp area,
//! with one named subdirectory per `i<N>`/`o<N>` parameter. The root is
//! created lazily on first use and removed recursively on `Drop`, so every
//! return path out of the request handler — success, protocol error, or
//! client disconnect — cleans up without a manually-written `finally`.

use std::io;
use std::path::{Path, PathBuf};

/// Owns the lifetime of one request's scratch directory tree.
pub struct TempFs {
    root: Option<PathBuf>,
}

impl TempFs {
    pub fn new() -> TempFs {
        TempFs { root: None }
    }

    fn ensure_root(&mut self) -> io::Result<&Path> {
        if self.root.is_none() {
            let dir = tempfile::Builder::new()
                .prefix("proxy_")
                .tempdir_in(std::env::temp_dir())?
                .into_path();
            self.root = Some(dir);
        }
        Ok(self.root.as_deref().unwrap())
    }

    /// Create (lazily creating the root first) a fresh subdirectory named
    /// with `prefix`, returning its path.
    pub fn mkdir(&mut self, prefix: &str) -> io::Result<PathBuf> {
        self.ensure_root()?;
        let root = self.root.as_ref().unwrap();
        let dir = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(root)?
            .into_path();
        Ok(dir)
    }

    /// The request root, if one has been created yet.
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }
}

impl Default for TempFs {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TempFs {
    fn drop(&mut self) {
        if let Some(root) = &self.root {
            let _ = std::fs::remove_dir_all(root);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_created_lazily() {
        let fs = TempFs::new();
        assert!(fs.root().is_none());
    }

    #[test]
    fn mkdir_creates_root_and_subdir() {
        let mut fs = TempFs::new();
        let d1 = fs.mkdir("in0_").unwrap();
        assert!(d1.exists());
        assert!(fs.root().is_some());
        let root = fs.root().unwrap().to_path_buf();
        assert!(d1.starts_with(&root));
    }

    #[test]
    fn drop_removes_root_recursively() {
        let root_path;
        {
            let mut fs = TempFs::new();
            let d1 = fs.mkdir("in0_").unwrap();
            std::fs::write(d1.join("f.txt"), b"data").unwrap();
            root_path = fs.root().unwrap().to_path_buf();
            assert!(root_path.exists());
        }
        assert!(!root_path.exists());
    }

    #[test]
    fn two_instances_get_distinct_roots() {
        let mut a = TempFs::new();
        let mut b = TempFs::new();
        a.mkdir("x_").unwrap();
        b.mkdir("x_").unwrap();
        assert_ne!(a.root(), b.root());
    }
}
