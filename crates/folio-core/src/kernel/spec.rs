//! Kernel specification discovery.
//!
//! Kernel specs are `kernel.json` files in a directory named after the kernel,
//! found under the following roots, in order:
//! 1. each entry of `FOLIO_KERNEL_PATH`
//! 2. `<entry>/kernels` for each entry of `JUPYTER_PATH`
//! 3. the user data directory (`~/.local/share/jupyter/kernels` on Linux)
//! 4. `/usr/local/share/jupyter/kernels`
//! 5. `/usr/share/jupyter/kernels`

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Placeholder in `argv` replaced with the connection file path.
pub const CONNECTION_FILE_PLACEHOLDER: &str = "{connection_file}";

/// Placeholder in `argv` replaced with the spec's directory.
pub const RESOURCE_DIR_PLACEHOLDER: &str = "{resource_dir}";

/// A kernel specification.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct KernelSpec {
    /// Kernel name (directory name, lowercased).
    #[serde(skip)]
    pub name: String,

    /// Directory containing `kernel.json`.
    #[serde(skip)]
    pub resource_dir: PathBuf,

    /// Command line used to start the kernel.
    pub argv: Vec<String>,

    pub display_name: String,

    #[serde(default)]
    pub language: Option<String>,

    /// Extra environment for the kernel process.
    #[serde(default)]
    pub env: FxHashMap<String, String>,

    /// `signal` (default) or `message`.
    #[serde(default)]
    pub interrupt_mode: Option<String>,
}

impl KernelSpec {
    /// Load the spec in `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join("kernel.json");
        let content = fs::read_to_string(&path)
            .map_err(|e| Error::KernelSpec(format!("{}: {}", path.display(), e)))?;
        let mut spec: KernelSpec = serde_json::from_str(&content)
            .map_err(|e| Error::KernelSpec(format!("{}: {}", path.display(), e)))?;
        if spec.argv.is_empty() {
            return Err(Error::KernelSpec(format!("{}: empty argv", path.display())));
        }
        spec.name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        spec.resource_dir = dir.to_path_buf();
        Ok(spec)
    }

    /// Whether interrupts are delivered as signals.
    pub fn interrupts_by_signal(&self) -> bool {
        self.interrupt_mode.as_deref() != Some("message")
    }

    /// Command starting the kernel with the given connection file.
    ///
    /// `argv[0]` is resolved on `PATH` unless it is a path.
    pub fn command(&self, connection_file: &Path) -> Result<Command> {
        let connection = connection_file.to_string_lossy();
        let resource_dir = self.resource_dir.to_string_lossy();
        let args: Vec<String> = self
            .argv
            .iter()
            .map(|arg| {
                arg.replace(CONNECTION_FILE_PLACEHOLDER, &connection)
                    .replace(RESOURCE_DIR_PLACEHOLDER, &resource_dir)
            })
            .collect();

        let program = Path::new(&args[0]);
        let program = if program.components().count() > 1 {
            program.to_path_buf()
        } else {
            which::which(program).map_err(|e| {
                Error::KernelSpec(format!(
                    "kernel {:?}: cannot find executable {:?}: {}",
                    self.name, args[0], e
                ))
            })?
        };

        let mut command = Command::new(program);
        command.args(&args[1..]).envs(&self.env);
        Ok(command)
    }
}

/// Directories searched for kernel specs.
pub fn kernel_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(value) = env::var_os("FOLIO_KERNEL_PATH") {
        paths.extend(env::split_paths(&value));
    }
    if let Some(value) = env::var_os("JUPYTER_PATH") {
        paths.extend(env::split_paths(&value).map(|p| p.join("kernels")));
    }
    if let Some(data) = dirs::data_dir() {
        paths.push(data.join("jupyter").join("kernels"));
    }
    paths.push(PathBuf::from("/usr/local/share/jupyter/kernels"));
    paths.push(PathBuf::from("/usr/share/jupyter/kernels"));
    paths
}

/// Find a kernel spec by name in the default search paths.
pub fn find_kernel_spec(name: &str) -> Result<KernelSpec> {
    find_kernel_spec_in(name, &kernel_search_paths())
}

/// Find a kernel spec by name; the first root containing it wins.
pub fn find_kernel_spec_in(name: &str, roots: &[PathBuf]) -> Result<KernelSpec> {
    let wanted = name.to_lowercase();
    for root in roots {
        let Ok(entries) = fs::read_dir(root) else {
            continue;
        };
        for entry in entries.flatten() {
            let dir = entry.path();
            let matches = dir
                .file_name()
                .is_some_and(|n| n.to_string_lossy().to_lowercase() == wanted);
            if matches && dir.join("kernel.json").is_file() {
                return KernelSpec::load(&dir);
            }
        }
    }
    Err(Error::KernelSpec(format!("no such kernel named {name:?}")))
}

/// All valid kernel specs under `roots`, shadowed names removed.
pub fn list_kernel_specs(roots: &[PathBuf]) -> Vec<KernelSpec> {
    let mut specs: Vec<KernelSpec> = Vec::new();
    for root in roots {
        let Ok(entries) = fs::read_dir(root) else {
            continue;
        };
        let mut found: Vec<KernelSpec> = entries
            .flatten()
            .filter(|e| e.path().join("kernel.json").is_file())
            .filter_map(|e| match KernelSpec::load(&e.path()) {
                Ok(spec) => Some(spec),
                Err(err) => {
                    tracing::warn!("Skipping invalid kernel spec: {}", err);
                    None
                }
            })
            .filter(|spec| !specs.iter().any(|s| s.name == spec.name))
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        specs.extend(found);
    }
    specs
}
