//! Error taxonomy for rootfs assembly.
//!
//! Fatal conditions are `Err(RootfsError)` and abort the whole pipeline.
//! Recoverable conditions never travel through `Err`: they are collected in
//! an [`Outcome`] so a caller cannot mistake one for the other.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RootfsError>;

#[derive(Error, Debug)]
pub enum RootfsError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("'{command}' failed (exit code {code}):\n{output}")]
    Transaction {
        command: String,
        code: i32,
        output: String,
    },

    #[error(transparent)]
    Postinstall(#[from] PostinstallFailure),

    #[error("The postinstall intercept hook '{script}' failed, details in {}", .log.display())]
    Intercept { script: String, log: PathBuf },

    #[error("Executing '{script}' failed (exit code {code}). Output:\n{output}")]
    Script {
        script: String,
        code: i32,
        output: String,
    },

    #[error("depmod failed for kernel {version}:\n{output}")]
    KernelModuleDep { version: String, output: String },

    #[error("Failed to execute '{program}'. Is it installed?")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RootfsError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

/// Classification of a failed package postinstall scriptlet.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PostinstallFailure {
    /// Scriptlets postponed to first boot. The build continues.
    #[error("Postinstall scriptlets of {packages:?} deferred to first boot")]
    Deferred { packages: Vec<String> },

    /// No intercept claims these packages. The build aborts.
    #[error(
        "Postinstall scriptlets of {packages:?} have failed. If the intention is to defer them \
         to first boot, then please place them into pkg_postinst_ontarget_${{PN}} (). \
         Details of the failure are in {}.", .log.display()
    )]
    Fatal { packages: Vec<String>, log: PathBuf },
}

/// Non-fatal condition worth surfacing to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    /// A package requested with attempt-only semantics could not be resolved.
    Unresolved { package: String },
}

/// Report of a step that completed without a fatal error.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Packages whose postinstall now runs on first boot.
    pub deferred: Vec<String>,
    pub warnings: Vec<Warning>,
}

impl Outcome {
    pub fn is_clean(&self) -> bool {
        self.deferred.is_empty() && self.warnings.is_empty()
    }

    pub fn merge(&mut self, other: Outcome) {
        for pkg in other.deferred {
            if !self.deferred.contains(&pkg) {
                self.deferred.push(pkg);
            }
        }
        self.warnings.extend(other.warnings);
    }
}
