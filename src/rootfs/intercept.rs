//! Postinstall intercepts and first-boot deferral.
//!
//! Intercept hooks are copied into a per-rootfs directory before the first
//! transaction. Package scriptlets register themselves in a hook by adding
//! their names to its `##PKGS:` marker line; the sweep after installation
//! runs every hook once. A hook (or scriptlet) that cannot run at build time
//! has its packages postponed: their scriptlet bodies are saved under
//! `etc/rpm-postinsts` and their status drops to `unpacked`.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info};

use crate::build::context::{BuildContext, TransactionEnv};
use crate::error::{Outcome, PostinstallFailure, Result, RootfsError};
use crate::process::Cmd;

use super::dnf::{CommandBuilder, RpmOp};
use super::status::{PackageStatus, StatusDb};

/// First-boot script directory, relative to the target root.
pub const FIRST_BOOT_DIR: &str = "etc/rpm-postinsts";

/// Output of a hook that could not run in the build sandbox at all.
pub const UNSUPPORTED_ENV_SIGNATURE: &str = "qemuwrapper: qemu usermode is not supported";

/// Marker line listing the packages registered with a hook.
pub const PKGS_MARKER: &str = "##PKGS:";

/// Lowest number a first-boot script can get is one above this.
const MIN_SCRIPT_NUMBER: u32 = 99;

/// Helper hook used by scriptlets to register; never run directly.
const REGISTRATION_HOOK: &str = "postinst_intercept";

/// Hooks with this prefix always run on first boot.
const DELAY_PREFIX: &str = "delay_to_first_boot";

/// Result of running one hook that did not abort the build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    Succeeded,
    Postponed { packages: Vec<String> },
    Skipped,
}

/// Copy the intercept hooks into `ctx.intercepts_dir`, replacing any
/// previous copy. A missing source leaves an empty directory.
pub fn prepare_intercepts(ctx: &BuildContext, source: Option<&Path>) -> Result<Vec<PathBuf>> {
    debug!(root = %ctx.target_rootfs.display(), dir = %ctx.intercepts_dir.display(), "initializing intercept dir");
    if ctx.intercepts_dir.exists() {
        fs::remove_dir_all(&ctx.intercepts_dir)?;
    }
    fs::create_dir_all(&ctx.intercepts_dir)?;

    let mut copied = Vec::new();
    let Some(source) = source.filter(|s| s.is_dir()) else {
        debug!("no intercept hooks to collect");
        return Ok(copied);
    };

    for entry in fs::read_dir(source)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let dest = ctx.intercepts_dir.join(entry.file_name());
        // fs::copy keeps the permission bits
        fs::copy(entry.path(), &dest)?;
        copied.push(dest);
    }
    copied.sort();
    debug!(hooks = ?copied, "collected intercepts");
    Ok(copied)
}

/// Packages listed on a hook's `##PKGS:` line (first one wins).
pub fn registered_in(content: &str) -> Vec<String> {
    content
        .lines()
        .find_map(|l| l.strip_prefix(PKGS_MARKER))
        .map(|rest| rest.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Next first-boot script number: one above the highest existing numeric
/// prefix, and at least 100.
pub fn next_script_number(dir: &Path) -> Result<u32> {
    let mut highest = MIN_SCRIPT_NUMBER;
    if dir.exists() {
        for entry in fs::read_dir(dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(n) = name.split('-').next().and_then(|p| p.parse::<u32>().ok()) {
                highest = highest.max(n);
            }
        }
    }
    highest.checked_add(1).ok_or_else(|| {
        RootfsError::config(format!(
            "no first-boot script number left after {highest} in {}",
            dir.display()
        ))
    })
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Handles scriptlet failures and runs the intercept sweep for one root.
pub struct PostinstallInterceptor<'a> {
    ctx: &'a BuildContext,
    env: &'a TransactionEnv,
    commands: CommandBuilder<'a>,
}

impl<'a> PostinstallInterceptor<'a> {
    pub fn new(ctx: &'a BuildContext, env: &'a TransactionEnv) -> Self {
        Self {
            ctx,
            env,
            commands: CommandBuilder::new(ctx, env, false),
        }
    }

    fn hooks(&self) -> Result<Vec<PathBuf>> {
        if !self.ctx.intercepts_dir.exists() {
            return Ok(Vec::new());
        }
        let mut hooks: Vec<PathBuf> = fs::read_dir(&self.ctx.intercepts_dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        hooks.sort();
        Ok(hooks)
    }

    /// Package name to the hook that registered it.
    pub fn registered_packages(&self) -> Result<BTreeMap<String, PathBuf>> {
        let mut map = BTreeMap::new();
        for hook in self.hooks()? {
            let content = fs::read_to_string(&hook)?;
            for pkg in registered_in(&content) {
                map.entry(pkg).or_insert_with(|| hook.clone());
            }
        }
        Ok(map)
    }

    /// Decide what a set of failed scriptlets means for the build.
    pub fn classify(&self, failed: &[String]) -> Result<PostinstallFailure> {
        let registered = self.registered_packages()?;
        let unclaimed: Vec<String> = failed
            .iter()
            .filter(|p| !registered.contains_key(*p))
            .cloned()
            .collect();
        Ok(if unclaimed.is_empty() {
            PostinstallFailure::Deferred {
                packages: failed.to_vec(),
            }
        } else {
            PostinstallFailure::Fatal {
                packages: unclaimed,
                log: self.ctx.temp_dir.clone(),
            }
        })
    }

    /// Defer failed scriptlets whose packages an intercept claims. Any
    /// unclaimed failure aborts before a single script is saved.
    pub fn handle_scriptlet_failures(&self, failed: &[String]) -> Result<Vec<String>> {
        match self.classify(failed)? {
            PostinstallFailure::Deferred { packages } => {
                self.postpone(&packages)?;
                Ok(packages)
            }
            fatal @ PostinstallFailure::Fatal { .. } => {
                error!(%fatal, "postinstall failure");
                Err(fatal.into())
            }
        }
    }

    /// Save each package's scriptlet for first boot and mark it unpacked.
    /// Packages already unpacked keep their existing first-boot script.
    pub fn postpone(&self, packages: &[String]) -> Result<()> {
        let db = StatusDb::new(&self.ctx.target_rootfs);
        let mut fresh = Vec::new();
        for pkg in packages {
            if db.status(pkg)? == Some(PackageStatus::Unpacked) {
                debug!(package = %pkg, "already postponed");
                continue;
            }
            fresh.push(pkg.clone());
        }
        if fresh.is_empty() {
            return Ok(());
        }
        info!(packages = ?fresh, "postponing postinstalls to first boot");
        for pkg in &fresh {
            self.save_postinst(pkg)?;
        }
        db.mark(&fresh, PackageStatus::Unpacked)
    }

    /// Copy a package's original %post body into the first-boot directory.
    pub fn save_postinst(&self, package: &str) -> Result<PathBuf> {
        debug!(%package, "saving postinstall script");
        let cmd = self.commands.rpm(&RpmOp::QueryPostin(package.to_string()))?;
        let body = cmd.run_checked()?.stdout;

        let dir = self.ctx.target_rootfs.join(FIRST_BOOT_DIR);
        fs::create_dir_all(&dir)?;
        let num = next_script_number(&dir)?;
        let path = dir.join(format!("{num}-{package}"));

        let script = if body.starts_with("#!") {
            body
        } else {
            format!("#!/bin/sh\n{body}")
        };
        fs::write(&path, script)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    fn postpone_hook(&self, hook: &Path) -> Result<Vec<String>> {
        let packages = registered_in(&fs::read_to_string(hook)?);
        if !packages.is_empty() {
            debug!(
                ?packages,
                "postinstalls will be postponed for first boot"
            );
            self.postpone(&packages)?;
        }
        Ok(packages)
    }

    /// Run one hook.
    pub fn run_hook(&self, hook: &Path) -> Result<HookOutcome> {
        let name = hook
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if name == REGISTRATION_HOOK || !is_executable(hook) {
            return Ok(HookOutcome::Skipped);
        }
        if name.starts_with(DELAY_PREFIX) {
            let packages = self.postpone_hook(hook)?;
            return Ok(HookOutcome::Postponed { packages });
        }

        debug!(hook = %name, "executing intercept");
        let cmd = Cmd::new(hook).envs(self.env.intercept());
        let result = cmd.run()?;
        let output = result.combined();
        self.ctx.append_log(&cmd.display(), &output)?;

        if result.success() {
            return Ok(HookOutcome::Succeeded);
        }
        if output.contains(UNSUPPORTED_ENV_SIGNATURE) {
            debug!(
                hook = %name,
                log = %self.ctx.log_path().display(),
                "intercept could not run without qemu usermode support"
            );
            let packages = self.postpone_hook(hook)?;
            return Ok(HookOutcome::Postponed { packages });
        }

        error!(hook = %name, log = %self.ctx.log_path().display(), "intercept failed");
        Err(RootfsError::Intercept {
            script: name,
            log: self.ctx.log_path(),
        })
    }

    /// Run every hook once, in name order.
    pub fn run_intercepts(&self) -> Result<Outcome> {
        debug!("running intercept scripts");
        let mut outcome = Outcome::default();
        for hook in self.hooks()? {
            if let HookOutcome::Postponed { packages } = self.run_hook(&hook)? {
                outcome.merge(Outcome {
                    deferred: packages,
                    warnings: Vec::new(),
                });
            }
        }
        Ok(outcome)
    }
}
