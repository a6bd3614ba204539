//! Kernel module dependency generation.

use std::collections::BTreeSet;
use std::path::Path;

use tracing::{debug, error, info};
use walkdir::WalkDir;

use super::context::{BuildContext, TransactionEnv};
use crate::error::{Result, RootfsError};
use crate::process::Cmd;

/// Module trees searched inside the target root.
const MODULE_DIRS: &[&str] = &["lib/modules", "usr/lib/modules"];

/// Module file suffixes, plain and compressed.
const MODULE_SUFFIXES: &[&str] = &[".ko", ".ko.xz", ".ko.gz", ".ko.zst"];

fn is_module(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy())
        .is_some_and(|n| MODULE_SUFFIXES.iter().any(|s| n.ends_with(s)))
}

/// Kernel versions under the target root that ship at least one module.
pub fn find_kernel_versions(target_rootfs: &Path) -> BTreeSet<String> {
    let mut versions = BTreeSet::new();
    for base in MODULE_DIRS {
        let base = target_rootfs.join(base);
        if !base.is_dir() {
            continue;
        }
        for entry in WalkDir::new(&base).min_depth(2).into_iter().flatten() {
            if !entry.file_type().is_file() || !is_module(entry.path()) {
                continue;
            }
            let version = entry
                .path()
                .strip_prefix(&base)
                .ok()
                .and_then(|rel| rel.components().next())
                .map(|c| c.as_os_str().to_string_lossy().into_owned());
            if let Some(version) = version {
                versions.insert(version);
            }
        }
    }
    versions
}

/// Runs `depmod` for every kernel version installed in the target root.
pub struct KernelModuleDepResolver<'a> {
    ctx: &'a BuildContext,
    env: &'a TransactionEnv,
}

impl<'a> KernelModuleDepResolver<'a> {
    pub fn new(ctx: &'a BuildContext, env: &'a TransactionEnv) -> Self {
        Self { ctx, env }
    }

    /// Generate `modules.dep` and friends. No modules is not an error.
    pub fn generate(&self) -> Result<Vec<String>> {
        let versions = find_kernel_versions(&self.ctx.target_rootfs);
        if versions.is_empty() {
            info!("no kernel modules found, skipping depmod");
            return Ok(Vec::new());
        }

        for version in &versions {
            info!(kernel = %version, "generating module dependencies");
            let cmd = Cmd::new(&self.ctx.toolchain.depmod)
                .arg("-a")
                .arg("-b")
                .arg_path(&self.ctx.target_rootfs)
                .arg(version)
                .envs(self.env.plain());
            let result = cmd.run()?;
            let output = result.combined();
            self.ctx.append_log(&cmd.display(), &output)?;

            if !result.success() {
                error!(kernel = %version, code = result.code(), "depmod failed");
                return Err(RootfsError::KernelModuleDep {
                    version: version.clone(),
                    output,
                });
            }
            debug!(kernel = %version, "depmod completed");
        }
        Ok(versions.into_iter().collect())
    }
}
