//! Config file discovery and the project state directory.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;

/// Project-relative directory for server work dirs and run artifacts.
pub const STATE_DIR: &str = ".crashwatch";

const PROJECT_CONFIG: &str = "crashwatch.toml";
const LOCAL_CONFIG: &str = "crashwatch.local.toml";

/// Config file locations for one project directory.
#[derive(Debug, Clone)]
pub struct Paths {
    project_dir: PathBuf,
}

impl Paths {
    pub fn new(project_dir: impl AsRef<Path>) -> Self {
        Self {
            project_dir: project_dir.as_ref().to_path_buf(),
        }
    }

    /// `config.toml` in the platform config dir (`~/.config/crashwatch/`
    /// on Linux), when a home directory is known.
    pub fn user_config_file() -> Option<PathBuf> {
        ProjectDirs::from("dev", "Crashwatch", "crashwatch")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Git-tracked project config.
    pub fn project_config_file(&self) -> PathBuf {
        self.project_dir.join(PROJECT_CONFIG)
    }

    /// Untracked local overrides.
    pub fn local_config_file(&self) -> PathBuf {
        self.project_dir.join(LOCAL_CONFIG)
    }

    /// Config files that exist, lowest precedence first.
    pub fn existing_config_files(&self, include_user: bool) -> Vec<PathBuf> {
        let user = include_user.then(Self::user_config_file).flatten();
        user.into_iter()
            .chain([self.project_config_file(), self.local_config_file()])
            .filter(|path| path.is_file())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_user_config_file_names_the_app() {
        // Platform dependent; only check the app name shows up.
        if let Some(path) = Paths::user_config_file() {
            assert!(path.to_string_lossy().contains("crashwatch"));
            assert!(path.ends_with("config.toml"));
        }
    }

    #[test]
    fn test_existing_files_in_precedence_order() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let paths = Paths::new(temp_dir.path());
        assert!(paths.existing_config_files(false).is_empty());

        fs::write(temp_dir.path().join(LOCAL_CONFIG), "").unwrap();
        fs::write(temp_dir.path().join(PROJECT_CONFIG), "").unwrap();

        assert_eq!(
            paths.existing_config_files(false),
            vec![
                temp_dir.path().join("crashwatch.toml"),
                temp_dir.path().join("crashwatch.local.toml"),
            ]
        );
    }
}
