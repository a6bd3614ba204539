//! Rootfs assembly through package transactions.
//!
//! [`RootfsAssembler::create`] drives one target root from nothing to a
//! populated tree:
//!
//! 1. validate the configuration (nothing is written before this passes)
//! 2. write package-manager configuration for the machine
//! 3. collect the postinstall intercept hooks
//! 4. pre-scripts
//! 5. register feeds and refresh metadata
//! 6. install the requested packages
//! 7. snapshot the installed packages (index + manifest)
//! 8. complementary packages, attempt-only
//! 9. intercept sweep
//! 10. post-scripts
//! 11. kernel module dependencies
//!
//! Any fatal error stops the pipeline where it is. The target root is left
//! as it was at that point.

pub mod complementary;
pub mod configure;
pub mod dnf;
pub mod feeds;
pub mod intercept;
pub mod scripts;
pub mod status;

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::build::context::{BuildContext, TransactionEnv};
use crate::build::modules::KernelModuleDepResolver;
use crate::config::{Config, FakerootConfig, RootfsConfig, Toolchain};
use crate::error::{Outcome, Result, RootfsError};
use crate::package::{self, PackageMap};

pub use complementary::{ComplementaryPlan, MetadataIndex, PkgdataUtil};
pub use dnf::{InstallRequest, TransactionExecutor};
pub use intercept::{PostinstallInterceptor, FIRST_BOOT_DIR};
pub use scripts::ScriptRunner;
pub use status::{PackageStatus, StatusDb};

/// Builds one target root.
pub struct RootfsAssembler {
    config: RootfsConfig,
    ctx: BuildContext,
    native_root: Option<PathBuf>,
    fakeroot: Option<FakerootConfig>,
    index: Option<Box<dyn MetadataIndex>>,
    installed: PackageMap,
    deferred: Vec<String>,
    intercepts_ready: bool,
}

impl RootfsAssembler {
    /// Assembler using the host's toolchain, native sysroot and fakeroot
    /// settings.
    pub fn new(config: RootfsConfig, host: &Config) -> Self {
        let fakeroot = host.fakeroot_for(&config.workdir, &config.target_rootfs);
        let mut assembler = Self::with_toolchain(config, host.toolchain.clone());
        assembler.native_root = host.native_sysroot.clone();
        assembler.fakeroot = fakeroot;
        assembler
    }

    /// Assembler with explicit tools and no privilege emulation.
    pub fn with_toolchain(config: RootfsConfig, toolchain: Toolchain) -> Self {
        let ctx = BuildContext::new(&config.workdir, &config.target_rootfs, toolchain);
        Self {
            config,
            ctx,
            native_root: None,
            fakeroot: None,
            index: None,
            installed: PackageMap::new(),
            deferred: Vec::new(),
            intercepts_ready: false,
        }
    }

    /// Use `index` for complementary lookups instead of `oe-pkgdata-util`.
    pub fn with_metadata_index(mut self, index: Box<dyn MetadataIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn config(&self) -> &RootfsConfig {
        &self.config
    }

    pub fn context(&self) -> &BuildContext {
        &self.ctx
    }

    pub fn target_rootfs(&self) -> &Path {
        &self.ctx.target_rootfs
    }

    pub fn intercepts_dir(&self) -> &Path {
        &self.ctx.intercepts_dir
    }

    /// Installed packages as of the last successful `create()`.
    pub fn installed(&self) -> &PackageMap {
        &self.installed
    }

    /// Packages whose postinstall was moved to first boot.
    pub fn deferred(&self) -> &[String] {
        &self.deferred
    }

    /// Installed packages as recorded in the persisted index.
    pub fn list_installed_packages(&self) -> Result<PackageMap> {
        package::read_index(&self.ctx.index_path())
    }

    /// Run the full pipeline.
    pub fn create(&mut self) -> Result<Outcome> {
        self.config.validate()?;

        let globs = self.config.glob_patterns();
        let pkgdata;
        let index: Option<&dyn MetadataIndex> = match (&self.index, &self.config.pkgdata_dir) {
            (Some(index), _) => Some(index.as_ref()),
            (None, Some(dir)) => {
                pkgdata = PkgdataUtil::new(&self.ctx.toolchain.pkgdata_util, dir);
                Some(&pkgdata)
            }
            (None, None) => None,
        };
        if !globs.is_empty() && index.is_none() {
            return Err(RootfsError::config(
                "complementary globs given but no pkgdata directory configured",
            ));
        }

        info!(
            root = %self.ctx.target_rootfs.display(),
            machine = %self.config.machine.name,
            "creating rootfs"
        );

        let ctx = &self.ctx;
        let config = &self.config;
        fs::create_dir_all(&ctx.workdir)?;
        fs::create_dir_all(&ctx.target_rootfs)?;

        // lives for this call only; nothing leaks into the next run
        let env = TransactionEnv::new(
            ctx,
            self.native_root.as_deref(),
            self.fakeroot.as_ref(),
            config.script_library_path.as_deref(),
        );

        configure::configure(&ctx.target_rootfs, &config.machine)?;

        if !self.intercepts_ready {
            intercept::prepare_intercepts(ctx, config.intercepts_source.as_deref())?;
            self.intercepts_ready = true;
        }

        let scripts = ScriptRunner::new(ctx, &env);
        scripts.run_all("pre", &config.pre_scripts)?;

        feeds::register_feeds(
            &ctx.target_rootfs,
            &config.feeds,
            config.feed_gpg_key.as_deref(),
        )?;

        let gpgcheck = config.feeds.iter().any(|f| !f.trusted);
        let executor = TransactionExecutor::new(ctx, &env, gpgcheck);
        let interceptor = PostinstallInterceptor::new(ctx, &env);
        executor.update()?;

        let mut outcome = Outcome::default();
        let request = InstallRequest {
            exclude: config.exclude.clone(),
            recommendations: config.recommendations,
            ..InstallRequest::new(config.packages.iter().cloned())
        };
        outcome.merge(executor.install(&request, &interceptor)?);

        let mut installed = executor.query()?;
        write_outputs(ctx, &installed)?;

        if let Some(index) = index.filter(|_| !globs.is_empty()) {
            let plan = complementary::resolve(index, &installed, &globs)?;
            if !plan.to_install.is_empty() {
                let request = InstallRequest {
                    exclude: config.exclude.clone(),
                    recommendations: config.recommendations,
                    ..InstallRequest::new(plan.to_install).attempt_only()
                };
                outcome.merge(executor.install(&request, &interceptor)?);
                installed = executor.query()?;
                write_outputs(ctx, &installed)?;
            }
        }

        outcome.merge(interceptor.run_intercepts()?);
        scripts.run_all("post", &config.post_scripts)?;
        KernelModuleDepResolver::new(ctx, &env).generate()?;

        info!(
            installed = installed.len(),
            deferred = outcome.deferred.len(),
            warnings = outcome.warnings.len(),
            "rootfs created"
        );
        self.installed = installed;
        self.deferred = outcome.deferred.clone();
        Ok(outcome)
    }
}

fn write_outputs(ctx: &BuildContext, installed: &PackageMap) -> Result<()> {
    package::write_index(&ctx.index_path(), installed)?;
    package::write_manifest(&ctx.manifest_path(), installed)?;
    debug!(
        index = %ctx.index_path().display(),
        manifest = %ctx.manifest_path().display(),
        "wrote package index"
    );
    Ok(())
}
