//! Resolution of the runner runtime and script paths.

use std::env;
use std::path::{Path, PathBuf};

use crate::{Result, SidecarError};

/// Where runner scripts live and which interpreter runs them.
#[derive(Debug, Clone)]
pub struct ScriptLocator {
    runtime: PathBuf,
    scripts_dir: PathBuf,
}

impl ScriptLocator {
    pub fn new(runtime: impl Into<PathBuf>, scripts_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime: runtime.into(),
            scripts_dir: scripts_dir.into(),
        }
    }

    pub fn runtime(&self) -> &Path {
        &self.runtime
    }

    pub fn scripts_dir(&self) -> &Path {
        &self.scripts_dir
    }

    /// Resolve the runtime executable.
    ///
    /// A bare name such as `python3` is searched on `PATH`; anything with a
    /// directory component must point at an existing file.
    pub fn resolve_runtime(&self) -> Result<PathBuf> {
        let has_dir = self
            .runtime
            .parent()
            .is_some_and(|p| !p.as_os_str().is_empty());

        if has_dir {
            return if self.runtime.is_file() {
                Ok(self.runtime.clone())
            } else {
                Err(SidecarError::config(format!(
                    "runtime not found at {}",
                    self.runtime.display()
                )))
            };
        }

        search_path(&self.runtime).ok_or_else(|| {
            SidecarError::config(format!(
                "runtime {} not found on PATH",
                self.runtime.display()
            ))
        })
    }

    pub fn resolve_script(&self, name: &str) -> Result<PathBuf> {
        let path = self.scripts_dir.join(name);
        if path.is_file() {
            Ok(path)
        } else {
            Err(SidecarError::config(format!(
                "script not found at {}",
                path.display()
            )))
        }
    }
}

fn search_path(name: &Path) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths).find_map(|dir| {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
        #[cfg(windows)]
        {
            let exe = candidate.with_extension("exe");
            if exe.is_file() {
                return Some(exe);
            }
        }
        None
    })
}
