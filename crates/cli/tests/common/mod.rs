use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Throwaway config, cache, history and project directories for one test
pub struct Sandbox {
    root: TempDir,
}

impl Sandbox {
    pub fn new() -> Self {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("project")).unwrap();
        std::fs::write(root.path().join("config.json"), "{}").unwrap();
        Self { root }
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    pub fn project(&self) -> PathBuf {
        self.path().join("project")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.path().join("cache")
    }

    pub fn history(&self) -> PathBuf {
        self.path().join("history.jsonl")
    }

    /// `kiln` plus global flags pointing into the sandbox, then `rest`
    pub fn argv(&self, rest: &[&str]) -> Vec<String> {
        let mut argv = vec![
            "kiln".to_string(),
            "--quiet".to_string(),
            "--config".to_string(),
            self.path().join("config.json").display().to_string(),
            "--cache-dir".to_string(),
            self.cache_dir().display().to_string(),
            "--history".to_string(),
            self.history().display().to_string(),
        ];
        argv.extend(rest.iter().map(|s| s.to_string()));
        argv
    }
}
