//! Installed-package records and the artifacts derived from them.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Query format handed to `dnf repoquery`; [`parse_query_output`] reads it back.
pub const QUERY_FORMAT: &str = "Package: %{name} %{arch} %{version} %{name}-%{version}-%{release}.%{arch}.rpm\nDependencies:\n%{requires}\nRecommendations:\n%{recommends}\nProvides:\n%{provides}\nDependenciesEndHere:\n";

/// Suffix marking a recommendation inside a dependency list.
pub const REC_SUFFIX: &str = " [REC]";

/// One installed package as reported by the package manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub arch: String,
    #[serde(rename = "ver")]
    pub version: String,
    pub filename: String,
    #[serde(default)]
    pub deps: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recommends: Vec<String>,
    #[serde(default, rename = "provs", skip_serializing_if = "Vec::is_empty")]
    pub provides: Vec<String>,
}

/// Installed packages keyed by name.
pub type PackageMap = BTreeMap<String, PackageRecord>;

#[derive(Clone, Copy)]
enum Section {
    Initial,
    Dependencies,
    Recommendations,
    Provides,
}

/// Parse `dnf repoquery` output produced with [`QUERY_FORMAT`].
///
/// Recommendations are recorded twice: in `recommends`, and in `deps` with a
/// `[REC]` suffix, which is how downstream consumers expect them.
pub fn parse_query_output(output: &str) -> PackageMap {
    let mut packages = PackageMap::new();
    let mut current: Option<(String, PackageRecord)> = None;
    let mut section = Section::Initial;

    for line in output.lines() {
        if let Some(rest) = line.strip_prefix("Package:") {
            if let Some((name, record)) = current.take() {
                packages.insert(name, record);
            }
            let fields: Vec<&str> = rest.split_whitespace().collect();
            if fields.len() < 4 {
                section = Section::Initial;
                continue;
            }
            current = Some((
                fields[0].to_string(),
                PackageRecord {
                    arch: fields[1].to_string(),
                    version: fields[2].to_string(),
                    filename: fields[3].to_string(),
                    ..Default::default()
                },
            ));
            section = Section::Initial;
        } else if line.starts_with("Dependencies:") {
            section = Section::Dependencies;
        } else if line.starts_with("Recommendations:") {
            section = Section::Recommendations;
        } else if line.starts_with("Provides:") {
            section = Section::Provides;
        } else if line.starts_with("DependenciesEndHere:") {
            if let Some((name, record)) = current.take() {
                packages.insert(name, record);
            }
            section = Section::Initial;
        } else if !line.trim().is_empty() {
            let Some((_, record)) = current.as_mut() else {
                continue;
            };
            let line = line.trim().to_string();
            match section {
                Section::Dependencies => record.deps.push(line),
                Section::Recommendations => {
                    record.deps.push(format!("{line}{REC_SUFFIX}"));
                    record.recommends.push(line);
                }
                Section::Provides => record.provides.push(line),
                Section::Initial => {}
            }
        }
    }

    if let Some((name, record)) = current.take() {
        packages.insert(name, record);
    }
    packages
}

/// Every capability declared by any installed package, version
/// constraints dropped (`foo-dbg = 1.0-r0` counts as `foo-dbg`).
pub fn provided_capabilities(packages: &PackageMap) -> BTreeSet<String> {
    packages
        .values()
        .flat_map(|r| r.provides.iter())
        .filter_map(|p| p.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// `name arch` lines, sorted by name, newline terminated.
pub fn format_arch_list(packages: &PackageMap) -> String {
    format_lines(packages, |name, r| format!("{} {}", name, r.arch))
}

/// Manifest body: `name arch version` lines sorted by name.
pub fn format_manifest(packages: &PackageMap) -> String {
    format_lines(packages, |name, r| {
        format!("{} {} {}", name, r.arch, r.version)
    })
}

fn format_lines(packages: &PackageMap, f: impl Fn(&str, &PackageRecord) -> String) -> String {
    let mut out = String::new();
    for (name, record) in packages {
        out.push_str(&f(name, record));
        out.push('\n');
    }
    out
}

/// Write the installed-package index as JSON.
pub fn write_index(path: &Path, packages: &PackageMap) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(packages)?;
    fs::write(path, json)?;
    Ok(())
}

/// Read an installed-package index written by [`write_index`].
pub fn read_index(path: &Path) -> Result<PackageMap> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Write the manifest next to the index.
pub fn write_manifest(path: &Path, packages: &PackageMap) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format_manifest(packages))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
Package: busybox core2_64 1.35.0 busybox-1.35.0-r0.core2_64.rpm
Dependencies:
libc.so.6()(64bit)
update-alternatives-opkg
Recommendations:
busybox-syslog
Provides:
busybox-dbg = 1.35.0-r0
/bin/sh
DependenciesEndHere:
Package: base-files intel_x86_64 3.0.14 base-files-3.0.14-r89.intel_x86_64.rpm
Dependencies:
Recommendations:
Provides:
DependenciesEndHere:
";

    #[test]
    fn test_parse_query_output() {
        let pkgs = parse_query_output(SAMPLE);
        assert_eq!(pkgs.len(), 2);

        let bb = &pkgs["busybox"];
        assert_eq!(bb.arch, "core2_64");
        assert_eq!(bb.version, "1.35.0");
        assert_eq!(bb.filename, "busybox-1.35.0-r0.core2_64.rpm");
        assert_eq!(
            bb.deps,
            vec![
                "libc.so.6()(64bit)",
                "update-alternatives-opkg",
                "busybox-syslog [REC]"
            ]
        );
        assert_eq!(bb.recommends, vec!["busybox-syslog"]);
        assert_eq!(bb.provides, vec!["busybox-dbg = 1.35.0-r0", "/bin/sh"]);

        assert!(pkgs["base-files"].deps.is_empty());
    }

    #[test]
    fn test_parse_empty_output() {
        assert!(parse_query_output("").is_empty());
    }

    #[test]
    fn test_parse_ignores_truncated_header() {
        let pkgs = parse_query_output("Package: broken\nDependencies:\nfoo\nDependenciesEndHere:\n");
        assert!(pkgs.is_empty());
    }

    #[test]
    fn test_provided_capabilities() {
        let pkgs = parse_query_output(SAMPLE);
        let provided = provided_capabilities(&pkgs);
        assert!(provided.contains("busybox-dbg"));
        assert!(provided.contains("/bin/sh"));
    }

    #[test]
    fn test_manifest_sorted() {
        let pkgs = parse_query_output(SAMPLE);
        assert_eq!(
            format_manifest(&pkgs),
            "base-files intel_x86_64 3.0.14\nbusybox core2_64 1.35.0\n"
        );
        assert_eq!(
            format_arch_list(&pkgs),
            "base-files intel_x86_64\nbusybox core2_64\n"
        );
    }

    #[test]
    fn test_index_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("packages.json");
        let pkgs = parse_query_output(SAMPLE);

        write_index(&path, &pkgs).unwrap();
        let loaded = read_index(&path).unwrap();

        assert_eq!(
            loaded.keys().collect::<Vec<_>>(),
            pkgs.keys().collect::<Vec<_>>()
        );
        for (name, record) in &pkgs {
            let other = &loaded[name];
            assert_eq!(other.arch, record.arch);
            assert_eq!(other.version, record.version);
            assert_eq!(other.filename, record.filename);
            assert_eq!(other.deps, record.deps);
        }
    }
}
