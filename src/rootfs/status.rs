//! Package status database kept inside the target root.
//!
//! dpkg-style stanzas, one per installed package:
//!
//! ```text
//! Package: busybox
//! Architecture: core2_64
//! Version: 1.35.0
//! Status: install ok installed
//! ```
//!
//! A package whose postinstall was postponed is downgraded to `unpacked`
//! until its first-boot script has run.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;
use crate::package::PackageMap;

/// Location of the database, relative to the target root.
pub const STATUS_FILE: &str = "var/lib/genrootfs/status";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageStatus {
    Installed,
    Unpacked,
}

impl PackageStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Installed => "installed",
            Self::Unpacked => "unpacked",
        }
    }
}

pub struct StatusDb {
    path: PathBuf,
}

impl StatusDb {
    pub fn new(target_rootfs: &Path) -> Self {
        Self {
            path: target_rootfs.join(STATUS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<String> {
        if !self.path.exists() {
            return Ok(String::new());
        }
        Ok(fs::read_to_string(&self.path)?)
    }

    fn write(&self, content: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Add stanzas for packages not yet recorded and drop stanzas for
    /// packages no longer installed. Existing statuses are kept.
    pub fn sync(&self, installed: &PackageMap) -> Result<()> {
        let content = self.read()?;
        let mut out = String::new();
        let mut known = Vec::new();

        for stanza in content.split("\n\n").filter(|s| !s.trim().is_empty()) {
            let Some(name) = stanza_package(stanza) else {
                continue;
            };
            if installed.contains_key(name) {
                known.push(name.to_string());
                out.push_str(stanza.trim_end());
                out.push_str("\n\n");
            }
        }

        for (name, record) in installed {
            if known.iter().any(|k| k == name) {
                continue;
            }
            out.push_str(&format!(
                "Package: {}\nArchitecture: {}\nVersion: {}\nStatus: install ok {}\n\n",
                name,
                record.arch,
                record.version,
                PackageStatus::Installed.as_str()
            ));
        }

        self.write(&out)
    }

    /// Rewrite the status word of `packages`.
    pub fn mark(&self, packages: &[String], status: PackageStatus) -> Result<()> {
        let content = self.read()?;
        let mut out = String::with_capacity(content.len());

        for stanza in content.split("\n\n").filter(|s| !s.trim().is_empty()) {
            let hit = stanza_package(stanza).is_some_and(|n| packages.iter().any(|p| p == n));
            for line in stanza.lines() {
                match line.strip_prefix("Status: ") {
                    Some(words) if hit => {
                        let mut words: Vec<&str> = words.split_whitespace().collect();
                        if let Some(last) = words.last_mut() {
                            if *last == "installed" || *last == "unpacked" {
                                *last = status.as_str();
                            }
                        }
                        out.push_str(&format!("Status: {}\n", words.join(" ")));
                    }
                    _ => {
                        out.push_str(line);
                        out.push('\n');
                    }
                }
            }
            out.push('\n');
        }

        debug!(?packages, status = status.as_str(), "marked packages");
        self.write(&out)
    }

    /// Current status of one package.
    pub fn status(&self, package: &str) -> Result<Option<PackageStatus>> {
        let content = self.read()?;
        for stanza in content.split("\n\n") {
            if stanza_package(stanza) != Some(package) {
                continue;
            }
            let status = stanza
                .lines()
                .find_map(|l| l.strip_prefix("Status: "))
                .and_then(|s| s.split_whitespace().last());
            return Ok(match status {
                Some("installed") => Some(PackageStatus::Installed),
                Some("unpacked") => Some(PackageStatus::Unpacked),
                _ => None,
            });
        }
        Ok(None)
    }
}

fn stanza_package(stanza: &str) -> Option<&str> {
    stanza
        .lines()
        .find_map(|l| l.strip_prefix("Package: "))
        .map(str::trim)
}
