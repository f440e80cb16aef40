use std::{path::Path, sync::Arc};

use anyhow::Result;

use crate::utils::{bins::ensure_executable, process::ProcessRunner};

#[cfg(test)]
pub mod fake;
pub mod lvm;

pub use lvm::{LvmCli, LvmPort};

/// Builds the executor that talks to the host's `lvm` binary.
///
/// In containerized mode the binary lives on the host and is reached through
/// nsenter, so it cannot be checked from here.
pub fn host_lvm(lvm_path: &str, containerized: bool) -> Result<Arc<dyn LvmPort>> {
    if !containerized {
        ensure_executable(Path::new(lvm_path))?;
    }
    let runner = Arc::new(ProcessRunner::new(containerized));
    Ok(Arc::new(LvmCli::new(runner, lvm_path)))
}
