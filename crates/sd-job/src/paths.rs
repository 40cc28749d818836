//! Relocatable paths for job records.
//!
//! Paths below the output root are stored as `${VAR}/relative/path`, so the
//! whole output tree can move without invalidating existing job records.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub struct OutputRoot {
    root: PathBuf,
    env_var: String,
}

impl OutputRoot {
    pub fn new(root: impl Into<PathBuf>, env_var: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            env_var: env_var.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn env_var(&self) -> &str {
        &self.env_var
    }

    fn prefix(&self) -> String {
        format!("${{{}}}", self.env_var)
    }

    /// Rewrite `path` relative to the symbolic root when it lies below it.
    pub fn to_portable(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(rest) if rest.as_os_str().is_empty() => self.prefix(),
            Ok(rest) => format!("{}/{}", self.prefix(), rest.display()),
            Err(_) => path.display().to_string(),
        }
    }

    /// Inverse of [`OutputRoot::to_portable`]. The environment variable wins
    /// over the configured root when it is set.
    pub fn resolve(&self, portable: &str) -> PathBuf {
        let prefix = self.prefix();
        let Some(rest) = portable.strip_prefix(&prefix) else {
            return PathBuf::from(portable);
        };
        let base = std::env::var_os(&self.env_var)
            .map(PathBuf::from)
            .unwrap_or_else(|| self.root.clone());
        let rest = rest.trim_start_matches('/');
        if rest.is_empty() { base } else { base.join(rest) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_below_root_are_symbolic() {
        let root = OutputRoot::new("/data/spindb", "SD_TEST_UNSET_ROOT");
        let portable = root.to_portable(Path::new("/data/spindb/model_N/run_00"));
        assert_eq!(portable, "${SD_TEST_UNSET_ROOT}/model_N/run_00");
        assert_eq!(
            root.resolve(&portable),
            PathBuf::from("/data/spindb/model_N/run_00")
        );
    }

    #[test]
    fn foreign_paths_are_kept_verbatim() {
        let root = OutputRoot::new("/data/spindb", "SD_TEST_UNSET_ROOT");
        let portable = root.to_portable(Path::new("/tmp/other/file.json"));
        assert_eq!(portable, "/tmp/other/file.json");
        assert_eq!(root.resolve(&portable), PathBuf::from("/tmp/other/file.json"));
    }
}
