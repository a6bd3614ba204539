//! Complementary package resolution (`*-dev`, `*-dbg`, `*-src`, ...).
//!
//! Candidates come from a package-metadata index keyed by what is already
//! installed. Anything an installed package already provides is dropped, the
//! rest is installed attempt-only: a candidate no feed carries is skipped.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::error::{Result, RootfsError};
use crate::package::{format_arch_list, provided_capabilities, PackageMap};
use crate::process::Cmd;

/// Source of complementary package names.
pub trait MetadataIndex {
    /// Names matching `globs` that belong with the installed packages.
    fn glob(&self, installed: &PackageMap, globs: &[String]) -> Result<BTreeSet<String>>;
}

/// `oe-pkgdata-util glob` over a pkgdata directory.
pub struct PkgdataUtil {
    pub program: PathBuf,
    pub pkgdata_dir: PathBuf,
}

impl PkgdataUtil {
    pub fn new(program: impl Into<PathBuf>, pkgdata_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            pkgdata_dir: pkgdata_dir.into(),
        }
    }
}

impl MetadataIndex for PkgdataUtil {
    fn glob(&self, installed: &PackageMap, globs: &[String]) -> Result<BTreeSet<String>> {
        // the tool only reads the installed list from a file
        let mut list = tempfile::Builder::new()
            .prefix("installed-pkgs")
            .tempfile()?;
        list.write_all(format_arch_list(installed).as_bytes())?;
        list.flush()?;

        let cmd = Cmd::new(&self.program)
            .arg("-p")
            .arg_path(&self.pkgdata_dir)
            .arg("glob")
            .arg_path(list.path())
            .arg(globs.join(" "));
        let result = cmd.run()?;
        if !result.success() {
            return Err(RootfsError::Transaction {
                command: cmd.display(),
                code: result.code(),
                output: result.combined(),
            });
        }
        Ok(result
            .stdout
            .split_whitespace()
            .map(str::to_string)
            .collect())
    }
}

/// What to install and what is already covered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComplementaryPlan {
    pub to_install: Vec<String>,
    pub to_skip: Vec<String>,
}

/// Split `matched` into packages to install and packages an installed
/// package already provides. Both lists come out sorted.
pub fn plan(installed: &PackageMap, matched: &BTreeSet<String>) -> ComplementaryPlan {
    let provided = provided_capabilities(installed);
    ComplementaryPlan {
        to_install: matched.difference(&provided).cloned().collect(),
        to_skip: matched.intersection(&provided).cloned().collect(),
    }
}

/// Compute the complementary install list for `globs`.
pub fn resolve(
    index: &dyn MetadataIndex,
    installed: &PackageMap,
    globs: &[String],
) -> Result<ComplementaryPlan> {
    if globs.is_empty() {
        return Ok(ComplementaryPlan::default());
    }
    let matched = index.glob(installed, globs)?;
    let plan = plan(installed, &matched);
    info!(
        install = plan.to_install.len(),
        skipped = plan.to_skip.len(),
        "resolved complementary packages"
    );
    debug!(
        install = %plan.to_install.join(" "),
        skipped = %plan.to_skip.join(" "),
        "complementary packages (skipped already provided packages)"
    );
    Ok(plan)
}
