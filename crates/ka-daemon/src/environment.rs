use std::path::{Path, PathBuf};

/// Explicit path to the environment file, overriding `.env` discovery.
pub const ENV_FILE_VAR: &str = "KA_ENV_FILE";

/// Where process settings were loaded from, reported once logging is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvSource {
    /// Loaded from the given file.
    File(PathBuf),
    /// No file found; process environment only.
    ProcessOnly,
    /// A file was named but could not be read or parsed.
    Failed { path: Option<PathBuf>, reason: String },
}

impl EnvSource {
    pub fn describe(&self) -> String {
        match self {
            EnvSource::File(path) => format!("loaded environment from {}", path.display()),
            EnvSource::ProcessOnly => "no .env file, using process environment".to_string(),
            EnvSource::Failed { path: Some(p), reason } => {
                format!("failed to load {}: {reason}", p.display())
            }
            EnvSource::Failed { path: None, reason } => format!("failed to load .env: {reason}"),
        }
    }
}

/// Load `KA_ENV_FILE` if set, else the nearest `.env`.
///
/// Variables already present in the process environment are never
/// overwritten. Runs before logging is initialised, so the outcome is
/// returned rather than logged.
pub fn load_env() -> EnvSource {
    match std::env::var_os(ENV_FILE_VAR) {
        Some(path) => load_file(Path::new(&path)),
        None => match dotenv::dotenv() {
            Ok(path) => EnvSource::File(path),
            Err(e) if e.not_found() => EnvSource::ProcessOnly,
            Err(e) => EnvSource::Failed {
                path: None,
                reason: e.to_string(),
            },
        },
    }
}

/// Load one named environment file.
pub fn load_file(path: &Path) -> EnvSource {
    match dotenv::from_path(path) {
        Ok(()) => EnvSource::File(path.to_path_buf()),
        Err(e) => EnvSource::Failed {
            path: Some(path.to_path_buf()),
            reason: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_named_file_without_overriding() {
        let dir = std::env::temp_dir().join(format!("ka-env-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("test.env");
        std::fs::write(
            &path,
            "KA_ENV_TEST_FRESH=from-file\nKA_ENV_TEST_KEPT=from-file\n",
        )
        .unwrap();
        std::env::set_var("KA_ENV_TEST_KEPT", "from-process");

        let source = load_file(&path);

        assert_eq!(source, EnvSource::File(path.clone()));
        assert_eq!(std::env::var("KA_ENV_TEST_FRESH").unwrap(), "from-file");
        assert_eq!(std::env::var("KA_ENV_TEST_KEPT").unwrap(), "from-process");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_named_file_is_reported() {
        let source = load_file(Path::new("/definitely/not/here.env"));
        match &source {
            EnvSource::Failed { path: Some(p), .. } => {
                assert_eq!(p, Path::new("/definitely/not/here.env"))
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(source.describe().starts_with("failed to load"));
    }
}
