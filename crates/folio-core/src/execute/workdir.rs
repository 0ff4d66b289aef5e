//! Working directory of an execution.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::config::ExecutionConfig;
use crate::error::{Error, Result};

/// Directory a kernel runs in; temporary directories are removed on drop.
#[derive(Debug)]
pub(crate) enum WorkDir {
    /// The directory containing the source.
    Local(PathBuf),
    /// A temporary directory.
    Temp(TempDir),
}

impl WorkDir {
    /// Pick the working directory for a source.
    ///
    /// A path-less source requires `execution_in_temp`.
    pub fn for_source(config: &ExecutionConfig, path: Option<&Path>) -> Result<Self> {
        if config.in_temp {
            let dir = tempfile::Builder::new().prefix("folio-exec-").tempdir()?;
            return Ok(WorkDir::Temp(dir));
        }
        let path = path.ok_or_else(|| {
            Error::Configuration(
                "Input source must exist as file, if execution_in_temp=false".to_string(),
            )
        })?;
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        Ok(WorkDir::Local(
            parent.canonicalize().unwrap_or_else(|_| parent.to_path_buf()),
        ))
    }

    pub fn path(&self) -> &Path {
        match self {
            WorkDir::Local(path) => path,
            WorkDir::Temp(dir) => dir.path(),
        }
    }

    /// `local` or `temporary`, for log messages.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkDir::Local(_) => "local",
            WorkDir::Temp(_) => "temporary",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_dir_removed_on_drop() {
        let config = ExecutionConfig {
            in_temp: true,
            ..ExecutionConfig::default()
        };
        let workdir = WorkDir::for_source(&config, None).unwrap();
        let path = workdir.path().to_path_buf();
        assert!(path.exists());
        assert_eq!(workdir.kind(), "temporary");

        drop(workdir);
        assert!(!path.exists());
    }

    #[test]
    fn test_local_requires_path() {
        let config = ExecutionConfig::default();
        assert!(matches!(
            WorkDir::for_source(&config, None),
            Err(Error::Configuration(_))
        ));

        let temp = TempDir::new().unwrap();
        let source = temp.path().join("nb.ipynb");
        let workdir = WorkDir::for_source(&config, Some(&source)).unwrap();
        assert_eq!(workdir.path(), temp.path().canonicalize().unwrap());
        assert_eq!(workdir.kind(), "local");
    }
}
