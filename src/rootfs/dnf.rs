//! dnf/rpm invocation for one target root.
//!
//! Commands are built from typed operations ([`DnfOp`], [`RpmOp`]) so every
//! argument set is checked before anything is spawned. [`TransactionExecutor`]
//! runs them, persists their output, and parses the result.

use tracing::{debug, info, warn};

use crate::build::context::{BuildContext, TransactionEnv};
use crate::config::RecommendationPolicy;
use crate::error::{Outcome, Result, RootfsError, Warning};
use crate::package::{parse_query_output, PackageMap, QUERY_FORMAT};
use crate::process::{Cmd, CommandResult};

use super::intercept::PostinstallInterceptor;
use super::status::StatusDb;

/// Line prefix dnf prints when a package's %post scriptlet fails.
pub const POSTIN_FAILURE_MARKER: &str = "Error in POSTIN scriptlet in rpm package";

/// Line prefix dnf prints for a package no feed provides.
pub const NO_MATCH_MARKER: &str = "No match for argument:";

/// Install request. `attempt_only` skips unresolvable packages instead of
/// failing the transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallRequest {
    pub packages: Vec<String>,
    pub exclude: Vec<String>,
    pub recommendations: RecommendationPolicy,
    pub attempt_only: bool,
}

impl InstallRequest {
    pub fn new<I, S>(packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            packages: packages.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn attempt_only(mut self) -> Self {
        self.attempt_only = true;
        self
    }
}

/// dnf operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnfOp {
    MakeCache,
    Install(InstallRequest),
    Remove(Vec<String>),
    Upgrade,
    Autoremove,
    QueryInstalled,
}

/// Low-level rpm operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpmOp {
    /// Erase without dependency checks.
    EraseNoDeps(Vec<String>),
    /// Print a package's %post scriptlet body.
    QueryPostin(String),
}

fn check_names(what: &str, names: &[String]) -> Result<()> {
    if names.is_empty() {
        return Err(RootfsError::config(format!("{what}: empty package list")));
    }
    if let Some(bad) = names
        .iter()
        .find(|n| n.is_empty() || n.starts_with('-') || n.contains(char::is_whitespace))
    {
        return Err(RootfsError::config(format!(
            "{what}: invalid package name '{bad}'"
        )));
    }
    Ok(())
}

/// Builds validated dnf and rpm command lines for one target root.
pub struct CommandBuilder<'a> {
    ctx: &'a BuildContext,
    env: &'a TransactionEnv,
    gpgcheck: bool,
}

impl<'a> CommandBuilder<'a> {
    pub fn new(ctx: &'a BuildContext, env: &'a TransactionEnv, gpgcheck: bool) -> Self {
        Self { ctx, env, gpgcheck }
    }

    fn standard_dnf_args(&self) -> Vec<String> {
        let root = self.ctx.target_rootfs.display();
        vec![
            "-v".into(),
            "--rpmverbosity=info".into(),
            "-y".into(),
            "-c".into(),
            format!("{root}/etc/dnf/dnf.conf"),
            format!("--setopt=reposdir={root}/etc/yum.repos.d"),
            format!("--installroot={root}"),
            format!("--setopt=logdir={}", self.ctx.temp_dir.display()),
        ]
    }

    pub fn dnf(&self, op: &DnfOp) -> Result<Cmd> {
        let mut args = self.standard_dnf_args();
        match op {
            DnfOp::MakeCache => args.extend(["makecache".into(), "--refresh".into()]),
            DnfOp::Install(req) => {
                check_names("install", &req.packages)?;
                if req.attempt_only {
                    args.push("--skip-broken".into());
                }
                if !req.exclude.is_empty() {
                    check_names("exclude", &req.exclude)?;
                    args.push("-x".into());
                    args.push(req.exclude.join(","));
                }
                if req.recommendations == RecommendationPolicy::Strict {
                    args.push("--setopt=install_weak_deps=False".into());
                }
                if self.gpgcheck {
                    args.push("--setopt=gpgcheck=True".into());
                } else {
                    args.push("--nogpgcheck".into());
                }
                args.push("install".into());
                args.extend(req.packages.iter().cloned());
            }
            DnfOp::Remove(pkgs) => {
                check_names("remove", pkgs)?;
                args.push("remove".into());
                args.extend(pkgs.iter().cloned());
            }
            DnfOp::Upgrade => args.push("upgrade".into()),
            DnfOp::Autoremove => args.push("autoremove".into()),
            DnfOp::QueryInstalled => args.extend([
                "repoquery".into(),
                "--installed".into(),
                "--queryformat".into(),
                QUERY_FORMAT.into(),
            ]),
        }
        Ok(Cmd::new(&self.ctx.toolchain.dnf)
            .args(args)
            .envs(self.env.transaction()))
    }

    pub fn rpm(&self, op: &RpmOp) -> Result<Cmd> {
        let root = format!("--root={}", self.ctx.target_rootfs.display());
        let args: Vec<String> = match op {
            RpmOp::EraseNoDeps(pkgs) => {
                check_names("rpm erase", pkgs)?;
                ["-e", "-v", "--nodeps"]
                    .into_iter()
                    .map(String::from)
                    .chain(std::iter::once(root))
                    .chain(pkgs.iter().cloned())
                    .collect()
            }
            RpmOp::QueryPostin(pkg) => {
                check_names("rpm query", std::slice::from_ref(pkg))?;
                vec![
                    "-q".into(),
                    root,
                    "--queryformat".into(),
                    "%{postin}".into(),
                    pkg.clone(),
                ]
            }
        };
        Ok(Cmd::new(&self.ctx.toolchain.rpm)
            .args(args)
            .envs(self.env.transaction()))
    }
}

/// Packages whose %post scriptlet failed, in first-seen order.
pub fn failed_scriptlets(output: &str) -> Vec<String> {
    let mut failed: Vec<String> = Vec::new();
    for line in output.lines() {
        if line.starts_with(POSTIN_FAILURE_MARKER) {
            if let Some(pkg) = line.split_whitespace().last() {
                if !failed.iter().any(|p| p == pkg) {
                    failed.push(pkg.to_string());
                }
            }
        }
    }
    failed
}

/// Packages dnf could not find in any feed.
pub fn unresolved_packages(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|l| l.trim().strip_prefix(NO_MATCH_MARKER))
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Error lines that are not %post scriptlet failures.
pub fn unexplained_errors(output: &str) -> Vec<&str> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("Error") && !l.starts_with(POSTIN_FAILURE_MARKER))
        .collect()
}

/// Runs package-manager operations against one target root.
pub struct TransactionExecutor<'a> {
    ctx: &'a BuildContext,
    builder: CommandBuilder<'a>,
}

impl<'a> TransactionExecutor<'a> {
    pub fn new(ctx: &'a BuildContext, env: &'a TransactionEnv, gpgcheck: bool) -> Self {
        Self {
            ctx,
            builder: CommandBuilder::new(ctx, env, gpgcheck),
        }
    }

    pub fn commands(&self) -> &CommandBuilder<'a> {
        &self.builder
    }

    fn invoke(&self, cmd: &Cmd) -> Result<CommandResult> {
        let result = cmd.run()?;
        self.ctx.append_log(&cmd.display(), &result.combined())?;
        Ok(result)
    }

    fn invoke_checked(&self, cmd: &Cmd) -> Result<CommandResult> {
        let result = self.invoke(cmd)?;
        if !result.success() {
            return Err(RootfsError::Transaction {
                command: cmd.display(),
                code: result.code(),
                output: result.combined(),
            });
        }
        Ok(result)
    }

    /// Refresh feed metadata.
    pub fn update(&self) -> Result<()> {
        info!("refreshing package feed metadata");
        self.invoke_checked(&self.builder.dnf(&DnfOp::MakeCache)?)?;
        Ok(())
    }

    pub fn upgrade(&self) -> Result<()> {
        self.invoke_checked(&self.builder.dnf(&DnfOp::Upgrade)?)?;
        Ok(())
    }

    pub fn autoremove(&self) -> Result<()> {
        self.invoke_checked(&self.builder.dnf(&DnfOp::Autoremove)?)?;
        Ok(())
    }

    /// Install packages.
    ///
    /// Scriptlet failures are handed to `interceptor`: they are deferred when
    /// an intercept claims the package and fatal otherwise, whatever
    /// `attempt_only` says.
    pub fn install(
        &self,
        request: &InstallRequest,
        interceptor: &PostinstallInterceptor<'_>,
    ) -> Result<Outcome> {
        let mut outcome = Outcome::default();
        if request.packages.is_empty() {
            return Ok(outcome);
        }
        info!(
            count = request.packages.len(),
            attempt_only = request.attempt_only,
            "installing packages"
        );
        debug!(packages = ?request.packages, exclude = ?request.exclude);

        let cmd = self.builder.dnf(&DnfOp::Install(request.clone()))?;
        let result = self.invoke(&cmd)?;
        let output = result.combined();
        let unresolved = unresolved_packages(&output);
        let failed = failed_scriptlets(&output);

        // a non-zero exit is only accepted when scriptlet failures are the
        // sole errors reported; they are classified below
        let tolerated = !failed.is_empty() && unexplained_errors(&output).is_empty();
        if !result.success() && !tolerated {
            return Err(RootfsError::Transaction {
                command: cmd.display(),
                code: result.code(),
                output,
            });
        }
        if request.attempt_only {
            for package in unresolved {
                warn!(%package, "package not available, skipped");
                outcome.warnings.push(Warning::Unresolved { package });
            }
        }

        let installed = self.query()?;
        StatusDb::new(&self.ctx.target_rootfs).sync(&installed)?;

        if !failed.is_empty() {
            outcome.deferred = interceptor.handle_scriptlet_failures(&failed)?;
        }
        Ok(outcome)
    }

    /// Remove packages, with dependency resolution or forced via rpm.
    pub fn remove(&self, packages: &[String], with_dependencies: bool) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        info!(?packages, with_dependencies, "removing packages");
        let cmd = if with_dependencies {
            self.builder.dnf(&DnfOp::Remove(packages.to_vec()))?
        } else {
            self.builder.rpm(&RpmOp::EraseNoDeps(packages.to_vec()))?
        };
        self.invoke_checked(&cmd)?;

        let installed = self.query()?;
        StatusDb::new(&self.ctx.target_rootfs).sync(&installed)?;
        Ok(())
    }

    /// Installed packages keyed by name. Empty when nothing was installed yet.
    pub fn query(&self) -> Result<PackageMap> {
        if !self.ctx.target_rootfs.join("var/lib/rpm").exists() {
            debug!("no rpm database in target root yet");
            return Ok(PackageMap::new());
        }
        let cmd = self.builder.dnf(&DnfOp::QueryInstalled)?;
        let result = cmd.run()?;
        if !result.success() {
            return Err(RootfsError::Transaction {
                command: cmd.display(),
                code: result.code(),
                output: result.combined(),
            });
        }
        Ok(parse_query_output(&result.stdout))
    }
}
