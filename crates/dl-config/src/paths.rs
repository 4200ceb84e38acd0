use std::path::{Path, PathBuf};

/// Holds a configurable base directory for machine-wide daemon files.
///
/// Use `ConfigPaths::new()` for production (resolves `~/.devloop`),
/// or `ConfigPaths::with_base()` for testing with an isolated directory.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    base: PathBuf,
}

impl ConfigPaths {
    /// Create paths rooted at `~/.devloop`. Returns an error if the home
    /// directory cannot be determined.
    pub fn new() -> anyhow::Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;
        Ok(Self {
            base: home.join(".devloop"),
        })
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_dir(&self) -> &Path {
        &self.base
    }

    pub fn config_path(&self) -> PathBuf {
        self.base.join("config.toml")
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.base.join("bin")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.base.join("logs")
    }

    pub fn ensure_config_dir(&self) -> anyhow::Result<PathBuf> {
        if !self.base.exists() {
            std::fs::create_dir_all(&self.base)?;
        }
        Ok(self.base.clone())
    }
}

/// Per-workspace state directory (`<workspace>/.devloop`).
///
/// Everything that belongs to one project lives here: the session registry,
/// the backing runtime record and data directory, agent metadata,
/// conversation logs and the published server info.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePaths {
    root: PathBuf,
}

impl WorkspacePaths {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            root: workspace.into(),
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(".devloop")
    }

    pub fn sessions_path(&self) -> PathBuf {
        self.state_dir().join("sessions.json")
    }

    pub fn runtime_record_path(&self) -> PathBuf {
        self.state_dir().join("runtime.json")
    }

    pub fn runtime_data_dir(&self) -> PathBuf {
        self.state_dir().join("runtime")
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.state_dir().join("agents")
    }

    pub fn conversations_dir(&self) -> PathBuf {
        self.state_dir().join("conversations")
    }

    pub fn server_info_path(&self) -> PathBuf {
        self.state_dir().join("server.json")
    }

    pub fn ensure_state_dir(&self) -> anyhow::Result<PathBuf> {
        let dir = self.state_dir();
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_dir_returns_base_path() {
        let paths = ConfigPaths::with_base(PathBuf::from("/tmp/test-dl"));
        assert_eq!(paths.config_dir(), Path::new("/tmp/test-dl"));
    }

    #[test]
    fn config_path_accessors() {
        let base = PathBuf::from("/base");
        let paths = ConfigPaths::with_base(base.clone());
        assert_eq!(paths.config_path(), base.join("config.toml"));
        assert_eq!(paths.bin_dir(), base.join("bin"));
        assert_eq!(paths.log_dir(), base.join("logs"));
    }

    #[test]
    fn workspace_path_accessors() {
        let paths = WorkspacePaths::new("/work/app");
        let state = PathBuf::from("/work/app/.devloop");
        assert_eq!(paths.state_dir(), state);
        assert_eq!(paths.sessions_path(), state.join("sessions.json"));
        assert_eq!(paths.runtime_record_path(), state.join("runtime.json"));
        assert_eq!(paths.runtime_data_dir(), state.join("runtime"));
        assert_eq!(paths.agents_dir(), state.join("agents"));
        assert_eq!(paths.conversations_dir(), state.join("conversations"));
        assert_eq!(paths.server_info_path(), state.join("server.json"));
    }

    #[test]
    fn ensure_config_dir_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("nested").join("config");
        let paths = ConfigPaths::with_base(base.clone());

        assert!(!base.exists());
        let result = paths.ensure_config_dir().unwrap();
        assert_eq!(result, base);
        assert!(base.exists());
        paths.ensure_config_dir().unwrap();
    }

    #[test]
    fn ensure_state_dir_creates_hidden_directory() {
        let dir = tempfile::tempdir().unwrap();
        let paths = WorkspacePaths::new(dir.path());
        let state = paths.ensure_state_dir().unwrap();
        assert!(state.ends_with(".devloop"));
        assert!(state.is_dir());
    }
}
