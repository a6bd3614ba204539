//! Package-manager configuration rooted at the target filesystem.
//!
//! dnf and rpm read their architecture policy from files under the install
//! root, so everything here is plain file writes. Re-running overwrites.

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::error::Result;
use crate::machine::Machine;

/// Write dnf and rpm configuration for `machine` under `target_rootfs`.
pub fn configure(target_rootfs: &Path, machine: &Machine) -> Result<()> {
    debug!(root = %target_rootfs.display(), machine = %machine.name, "writing package manager configs");
    configure_dnf(target_rootfs, machine)?;
    configure_rpm(target_rootfs, machine)?;
    Ok(())
}

fn configure_dnf(target_rootfs: &Path, machine: &Machine) -> Result<()> {
    let vars = target_rootfs.join("etc/dnf/vars");
    fs::create_dir_all(&vars)?;

    // libsolv handles the wildcards internally
    fs::write(vars.join("arch"), machine.preference_list().join(":"))?;
    fs::write(vars.join("releasever"), "")?;
    fs::write(target_rootfs.join("etc/dnf/dnf.conf"), "")?;
    Ok(())
}

fn configure_rpm(target_rootfs: &Path, machine: &Machine) -> Result<()> {
    let primary = machine.primary_arch();
    let platform_dir = target_rootfs.join("etc/rpm");
    fs::create_dir_all(&platform_dir)?;

    fs::write(platform_dir.join("platform"), format!("{primary}-pc-linux\n"))?;

    let compat = if machine.archs.is_empty() {
        primary.clone()
    } else {
        machine.archs.join(" ")
    };
    fs::write(
        target_rootfs.join("etc/rpmrc"),
        format!("arch_compat: {primary}: {compat}\nbuildarch_compat: {primary}: noarch\n"),
    )?;

    let mut macros = String::from("%_transaction_color 7\n%_var /var\n");
    if machine.name == "intel-x86-64" {
        macros.push_str("%_prefer_color 7\n");
    }
    fs::write(platform_dir.join("macros"), macros)?;
    Ok(())
}
