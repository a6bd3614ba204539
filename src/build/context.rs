//! Build context shared by every step of one rootfs assembly.
//!
//! Holds the paths of a single run and the environment its child processes
//! get. Nothing here touches the process environment: a [`TransactionEnv`]
//! is created when `create()` starts, lent to each operation, and dropped on
//! every exit path.

use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::config::{FakerootConfig, Toolchain};
use crate::error::Result;

/// Name of the persisted package-manager log inside the temp dir.
pub const LOG_FILE: &str = "log.do_rootfs";

/// Paths of one assembly run.
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Working directory (logs, intercepts, index, manifest)
    pub workdir: PathBuf,
    /// Root filesystem being assembled
    pub target_rootfs: PathBuf,
    /// Package manager log directory
    pub temp_dir: PathBuf,
    /// Per-rootfs copy of the intercept hooks
    pub intercepts_dir: PathBuf,
    pub toolchain: Toolchain,
}

impl BuildContext {
    pub fn new(workdir: &Path, target_rootfs: &Path, toolchain: Toolchain) -> Self {
        Self {
            workdir: workdir.to_path_buf(),
            target_rootfs: target_rootfs.to_path_buf(),
            temp_dir: workdir.join("temp"),
            intercepts_dir: intercepts_dir_for(workdir, target_rootfs),
            toolchain,
        }
    }

    /// Persisted log of every package-manager call in this run.
    pub fn log_path(&self) -> PathBuf {
        self.temp_dir.join(LOG_FILE)
    }

    /// Append captured output to the run log.
    pub fn append_log(&self, command: &str, output: &str) -> Result<()> {
        fs::create_dir_all(&self.temp_dir)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;
        writeln!(file, "+ {command}")?;
        file.write_all(output.as_bytes())?;
        if !output.ends_with('\n') {
            writeln!(file)?;
        }
        Ok(())
    }

    /// Path inside the target root.
    pub fn rootfs_path(&self, rel: &str) -> PathBuf {
        self.target_rootfs.join(rel)
    }

    /// Output file name prefix, taken from the target root's directory
    /// name so roots sharing a workdir keep separate outputs.
    fn output_stem(&self) -> String {
        self.target_rootfs
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "rootfs".to_string())
    }

    /// Installed-package index, `<workdir>/<root name>.packages.json`.
    pub fn index_path(&self) -> PathBuf {
        self.workdir
            .join(format!("{}.packages.json", self.output_stem()))
    }

    /// Manifest, `<workdir>/<root name>.manifest`.
    pub fn manifest_path(&self) -> PathBuf {
        self.workdir.join(format!("{}.manifest", self.output_stem()))
    }
}

/// Intercept directory for a target root, unique per root path.
pub fn intercepts_dir_for(workdir: &Path, target_rootfs: &Path) -> PathBuf {
    let digest = Sha256::digest(target_rootfs.as_os_str().as_encoded_bytes());
    workdir.join(format!("intercept_scripts-{}", hex::encode(digest)))
}

/// Environment handed to child processes of one run.
#[derive(Debug, Clone, Default)]
pub struct TransactionEnv {
    base: Vec<(String, OsString)>,
    native_root: Option<PathBuf>,
    target_rootfs: PathBuf,
    intercepts_dir: PathBuf,
    library_path: Option<PathBuf>,
}

impl TransactionEnv {
    pub fn new(
        ctx: &BuildContext,
        native_root: Option<&Path>,
        fakeroot: Option<&FakerootConfig>,
        library_path: Option<&Path>,
    ) -> Self {
        let mut base = Vec::new();
        if let Some(fr) = fakeroot {
            base.push(("PSEUDO_PREFIX".into(), fr.prefix.clone().into()));
            base.push(("PSEUDO_LOCALSTATEDIR".into(), fr.localstatedir.clone().into()));
            base.push(("PSEUDO_NOSYMLINKEXP".into(), "1".into()));
            base.push(("PSEUDO_PASSWD".into(), fr.passwd_dir.clone().into()));
            base.push(("LD_PRELOAD".into(), fr.preload.clone().into()));
            base.push(("LC_ALL".into(), "en_US.UTF-8".into()));
        }
        Self {
            base,
            native_root: native_root.map(Path::to_path_buf),
            target_rootfs: ctx.target_rootfs.clone(),
            intercepts_dir: ctx.intercepts_dir.clone(),
            library_path: library_path.map(Path::to_path_buf),
        }
    }

    /// Variables for package-manager transactions.
    pub fn transaction(&self) -> Vec<(String, OsString)> {
        let root: OsString = self.target_rootfs.clone().into();
        let mut vars = self.base.clone();
        for key in ["D", "OFFLINE_ROOT", "IPKG_OFFLINE_ROOT", "OPKG_OFFLINE_ROOT"] {
            vars.push((key.into(), root.clone()));
        }
        vars.push(("INTERCEPT_DIR".into(), self.intercepts_dir.clone().into()));
        if let Some(ref native) = self.native_root {
            vars.push(("NATIVE_ROOT".into(), native.clone().into()));
        }
        vars.push(("RPM_NO_CHROOT_FOR_SCRIPTS".into(), "1".into()));
        vars.push(("RPM_ETCCONFIGDIR".into(), root));
        vars
    }

    /// Variables for intercept hooks.
    pub fn intercept(&self) -> Vec<(String, OsString)> {
        let mut vars = self.base.clone();
        vars.push(("D".into(), self.target_rootfs.clone().into()));
        if let Some(ref native) = self.native_root {
            vars.push(("STAGING_DIR_NATIVE".into(), native.clone().into()));
        }
        vars.push(("libdir_native".into(), "/usr/lib".into()));
        vars
    }

    /// Variables for pre/post rootfs scripts.
    pub fn script(&self) -> Vec<(String, OsString)> {
        let mut vars = self.base.clone();
        vars.push(("IMAGE_ROOTFS".into(), self.target_rootfs.clone().into()));
        vars.push(("libexecdir".into(), "/usr/libexec".into()));
        if let Some(ref lib) = self.library_path {
            vars.push(("LD_LIBRARY_PATH".into(), lib.clone().into()));
        }
        vars
    }

    /// Base variables only (fakeroot), for tools like depmod.
    pub fn plain(&self) -> Vec<(String, OsString)> {
        self.base.clone()
    }
}
