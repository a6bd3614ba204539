//! Target machines and their package architectures.

use crate::error::{Result, RootfsError};

/// Architectures every package manager already treats as universally compatible.
pub const WILDCARD_ARCHS: &[&str] = &["any", "all", "noarch"];

/// Placeholder appended when only one real architecture is left, so the
/// resolver's scoring can't match its own built-in policies.
pub const PLACEHOLDER_ARCH: &str = "bogusarch";

/// Known machines and their feed architectures, least specific first.
const KNOWN_MACHINES: &[(&str, &str)] = &[
    (
        "intel-x86-64",
        "all any noarch x86_64 core2-64 corei7-64 intel_x86_64",
    ),
    (
        "bcm-2xxx-rpi4",
        "all any noarch aarch64 cortexa72 bcm_2xxx_rpi4",
    ),
    ("qemux86-64", "all any noarch x86_64 core2-64 qemux86_64"),
    ("qemuarm64", "all any noarch aarch64 armv8a qemuarm64"),
];

/// A build target: its name and the package architectures it accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine {
    pub name: String,
    /// Feed architectures in the package manager's raw order
    /// (least specific first).
    pub archs: Vec<String>,
}

impl Machine {
    pub fn new<I, S>(name: impl Into<String>, archs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            archs: archs.into_iter().map(Into::into).collect(),
        }
    }

    /// Look up one of the built-in machine definitions.
    pub fn known(name: &str) -> Result<Self> {
        KNOWN_MACHINES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(n, archs)| Machine::new(*n, archs.split_whitespace()))
            .ok_or_else(|| RootfsError::config(format!("unknown machine '{name}'")))
    }

    /// Machine name as an rpm architecture token.
    pub fn primary_arch(&self) -> String {
        self.name.replace('-', "_")
    }

    /// Real architectures, most preferred first, with wildcards stripped and
    /// the placeholder appended when fewer than two remain.
    pub fn preference_list(&self) -> Vec<String> {
        let mut archs: Vec<String> = self
            .archs
            .iter()
            .rev()
            .filter(|a| !WILDCARD_ARCHS.contains(&a.as_str()))
            .cloned()
            .collect();
        if archs.len() <= 1 {
            archs.push(PLACEHOLDER_ARCH.to_string());
        }
        archs
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(RootfsError::config("machine name is empty"));
        }
        if self.archs.is_empty() {
            return Err(RootfsError::config(format!(
                "machine '{}' has no package architectures",
                self.name
            )));
        }
        Ok(())
    }
}
