//! Shared test utilities for genrootfs tests.
//!
//! `TestEnv` lays out a temporary workspace with fake `dnf`, `rpm`, `depmod`
//! and `oe-pkgdata-util` executables. The fakes are backed by a feed catalog
//! on disk: `feed/<name>` holds the package's query record, and side files
//! next to it describe its scriptlet behaviour.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use genrootfs::{Machine, PackageFeed, RootfsAssembler, RootfsConfig, Toolchain};
use tempfile::TempDir;

const FAKE_DNF: &str = r#"#!/bin/bash
FEED='@FEED@'
echo "$*" >> '@LOGS@/dnf.log'
root=""
skip=0
cmd=""
pkgs=()
while [ $# -gt 0 ]; do
    case "$1" in
        --installroot=*) root="${1#--installroot=}" ;;
        --skip-broken) skip=1 ;;
        -c|-x|--queryformat) shift ;;
        -*) ;;
        *)
            if [ -z "$cmd" ]; then cmd="$1"; else pkgs+=("$1"); fi
            ;;
    esac
    shift
done
db="$root/var/lib/rpm/installed"

case "$cmd" in
    makecache)
        echo "Metadata cache created."
        ;;
    install)
        missing=0
        for p in "${pkgs[@]}"; do
            if [ ! -f "$FEED/$p" ]; then
                echo "No match for argument: $p"
                missing=1
            fi
        done
        if [ "$missing" = 1 ] && [ "$skip" = 0 ]; then
            echo "Error: Unable to find a match" >&2
            exit 1
        fi
        for p in "${pkgs[@]}"; do
            if [ -f "$FEED/$p.conflict" ]; then
                echo "Error: Transaction test error:" >&2
                echo "  file /usr/bin/$p conflicts with file from package $(cat "$FEED/$p.conflict")" >&2
                exit 1
            fi
        done
        mkdir -p "$db"
        for p in "${pkgs[@]}"; do
            [ -f "$FEED/$p" ] || continue
            cp "$FEED/$p" "$db/$p"
            if [ -d "$FEED/$p.files" ]; then
                cp -r "$FEED/$p.files/." "$root/"
            fi
            echo "Installing: $p"
            if [ -f "$FEED/$p.intercept" ]; then
                sed -i "s/^##PKGS:.*/& $p/" "$INTERCEPT_DIR/$(cat "$FEED/$p.intercept")"
            fi
            if [ -f "$FEED/$p.postin-fail" ]; then
                echo "Error in POSTIN scriptlet in rpm package $p"
            fi
        done
        echo "Complete!"
        ;;
    remove)
        for p in "${pkgs[@]}"; do
            rm -f "$db/$p"
        done
        ;;
    repoquery)
        for f in "$db"/*; do
            if [ -f "$f" ]; then cat "$f"; fi
        done
        ;;
    upgrade|autoremove)
        echo "Nothing to do."
        ;;
    *)
        echo "unknown command: $cmd" >&2
        exit 2
        ;;
esac
exit 0
"#;

const FAKE_RPM: &str = r#"#!/bin/bash
FEED='@FEED@'
echo "$*" >> '@LOGS@/rpm.log'
root=""
mode=""
pkgs=()
while [ $# -gt 0 ]; do
    case "$1" in
        --root=*) root="${1#--root=}" ;;
        -q) mode=query ;;
        -e) mode=erase ;;
        --queryformat) shift ;;
        -*) ;;
        *) pkgs+=("$1") ;;
    esac
    shift
done
db="$root/var/lib/rpm/installed"

case "$mode" in
    query)
        for p in "${pkgs[@]}"; do
            if [ ! -f "$db/$p" ]; then
                echo "package $p is not installed"
                exit 1
            fi
            if [ -f "$FEED/$p.postin" ]; then cat "$FEED/$p.postin"; fi
        done
        ;;
    erase)
        for p in "${pkgs[@]}"; do
            rm -f "$db/$p"
        done
        ;;
esac
exit 0
"#;

const FAKE_DEPMOD: &str = r#"#!/bin/bash
echo "$*" >> '@LOGS@/depmod.log'
if [ -f '@LOGS@/depmod.fail' ]; then
    echo "depmod: FATAL: could not load modules.builtin" >&2
    exit 1
fi
exit 0
"#;

const FAKE_PKGDATA_UTIL: &str = r#"#!/bin/bash
set -f
echo "$*" >> '@LOGS@/pkgdata.log'
if [ "$1" != "-p" ] || [ "$3" != "glob" ]; then
    echo "usage: oe-pkgdata-util -p <dir> glob <list> <globs>" >&2
    exit 2
fi
while read -r name arch; do
    for g in $5; do
        echo "${g//\*/$name}"
    done
done < "$4"
"#;

/// A package in the fake feed.
#[derive(Debug, Clone)]
pub struct FeedPackage {
    pub name: String,
    pub version: String,
    pub arch: String,
    pub deps: Vec<String>,
    pub provides: Vec<String>,
    pub postin: Option<String>,
    pub postin_fails: bool,
    pub intercept: Option<String>,
    pub conflicts_with: Option<String>,
    pub files: Vec<(String, String)>,
}

impl FeedPackage {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: "1.0".to_string(),
            arch: "core2_64".to_string(),
            deps: Vec::new(),
            provides: Vec::new(),
            postin: None,
            postin_fails: false,
            intercept: None,
            conflicts_with: None,
            files: Vec::new(),
        }
    }

    pub fn depends(mut self, dep: &str) -> Self {
        self.deps.push(dep.to_string());
        self
    }

    pub fn provides(mut self, capability: &str) -> Self {
        self.provides.push(capability.to_string());
        self
    }

    pub fn postin(mut self, body: &str) -> Self {
        self.postin = Some(body.to_string());
        self
    }

    /// The %post scriptlet fails during the transaction.
    pub fn failing_postin(mut self) -> Self {
        self.postin_fails = true;
        self
    }

    /// The scriptlet registers the package with an intercept hook.
    pub fn registers_with(mut self, hook: &str) -> Self {
        self.intercept = Some(hook.to_string());
        self
    }

    /// The transaction test fails on a file clash with `other`.
    pub fn conflicts_with(mut self, other: &str) -> Self {
        self.conflicts_with = Some(other.to_string());
        self
    }

    /// A file the package installs, relative to the target root.
    pub fn file(mut self, path: &str, content: &str) -> Self {
        self.files.push((path.to_string(), content.to_string()));
        self
    }

    /// Record in the query format the library asks dnf for.
    fn record(&self) -> String {
        let mut provides = vec![format!("{} = {}-r0", self.name, self.version)];
        provides.extend(self.provides.iter().cloned());
        format!(
            "Package: {name} {arch} {ver} {name}-{ver}-r0.{arch}.rpm\n\
             Dependencies:\n{deps}\
             Recommendations:\n\
             Provides:\n{provs}\
             DependenciesEndHere:\n",
            name = self.name,
            arch = self.arch,
            ver = self.version,
            deps = lines(&self.deps),
            provs = lines(&provides),
        )
    }
}

fn lines(items: &[String]) -> String {
    items.iter().map(|i| format!("{i}\n")).collect()
}

/// Test environment with a fake toolchain and feed.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    pub base_dir: PathBuf,
    /// Fake executables and their invocation logs
    pub tools: PathBuf,
    pub feed: PathBuf,
    /// Intercept hook source directory
    pub hooks: PathBuf,
    pub pkgdata: PathBuf,
    pub workdir: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        init_tracing();

        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let env = Self {
            tools: base.join("tools"),
            feed: base.join("feed"),
            hooks: base.join("hooks"),
            pkgdata: base.join("pkgdata"),
            workdir: base.join("work"),
            base_dir: base,
            _temp_dir: temp_dir,
        };
        for dir in [&env.tools, &env.feed, &env.hooks, &env.pkgdata] {
            fs::create_dir_all(dir).expect("Failed to create test dir");
        }

        for (name, template) in [
            ("dnf", FAKE_DNF),
            ("rpm", FAKE_RPM),
            ("depmod", FAKE_DEPMOD),
            ("oe-pkgdata-util", FAKE_PKGDATA_UTIL),
        ] {
            let script = template
                .replace("@FEED@", &env.feed.to_string_lossy())
                .replace("@LOGS@", &env.tools.to_string_lossy());
            create_executable(&env.tools.join(name), &script);
        }
        env
    }

    pub fn toolchain(&self) -> Toolchain {
        Toolchain::in_dir(&self.tools)
    }

    /// Put a package into the fake feed.
    pub fn add_package(&self, pkg: FeedPackage) {
        let base = self.feed.join(&pkg.name);
        fs::write(&base, pkg.record()).expect("Failed to write feed record");
        let side = |ext: &str| self.feed.join(format!("{}.{ext}", pkg.name));

        if let Some(ref body) = pkg.postin {
            fs::write(side("postin"), body).expect("Failed to write postin");
        }
        if pkg.postin_fails {
            fs::write(side("postin-fail"), "").expect("Failed to write postin-fail");
        }
        if let Some(ref hook) = pkg.intercept {
            fs::write(side("intercept"), hook).expect("Failed to write intercept");
        }
        if let Some(ref other) = pkg.conflicts_with {
            fs::write(side("conflict"), other).expect("Failed to write conflict");
        }
        for (path, content) in &pkg.files {
            let dest = side("files").join(path);
            fs::create_dir_all(dest.parent().expect("file path has a parent"))
                .expect("Failed to create payload dir");
            fs::write(dest, content).expect("Failed to write payload file");
        }
    }

    pub fn add_packages(&self, names: &[&str]) {
        for name in names {
            self.add_package(FeedPackage::new(name));
        }
    }

    /// Add an executable intercept hook with an empty `##PKGS:` line.
    pub fn add_hook(&self, name: &str, body: &str) {
        create_executable(
            &self.hooks.join(name),
            &format!("#!/bin/sh\n##PKGS:\n{body}\n"),
        );
    }

    /// Configuration for a run against `workdir/rootfs` on qemux86-64.
    pub fn rootfs_config(&self, packages: &[&str]) -> RootfsConfig {
        RootfsConfig::new(&self.workdir, Machine::known("qemux86-64").expect("known machine"))
            .with_feeds([PackageFeed::trusted(self.feed.to_string_lossy())])
            .with_packages(packages.iter().copied())
            .with_intercepts_source(&self.hooks)
            .with_pkgdata_dir(&self.pkgdata)
    }

    pub fn assembler(&self, config: RootfsConfig) -> RootfsAssembler {
        RootfsAssembler::with_toolchain(config, self.toolchain())
    }

    /// Lines a fake tool logged, one per invocation.
    pub fn tool_log(&self, tool: &str) -> Vec<String> {
        fs::read_to_string(self.tools.join(format!("{tool}.log")))
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// dnf install invocations, as logged argument strings.
    pub fn dnf_installs(&self) -> Vec<String> {
        self.tool_log("dnf")
            .into_iter()
            .filter(|l| l.contains(" install "))
            .collect()
    }
}

/// Create an executable script.
pub fn create_executable(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create parent dir for script");
    }
    fs::write(path, content).expect("Failed to write script");
    let mut perms = fs::metadata(path).expect("Failed to get metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("Failed to set permissions");
}

/// Route library logs through the test harness. Filter with RUST_LOG.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Assert that a file contains expected content.
pub fn assert_file_contains(path: &Path, expected: &str) {
    let content = fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("Failed to read file {}: {e}", path.display()));
    assert!(
        content.contains(expected),
        "File {} does not contain expected content.\nExpected to find: {}\nActual content: {}",
        path.display(),
        expected,
        content
    );
}

/// Assert that a file exists.
pub fn assert_file_exists(path: &Path) {
    assert!(path.exists(), "Expected file to exist: {}", path.display());
}

/// Assert that a path does not exist.
pub fn assert_not_exists(path: &Path) {
    assert!(!path.exists(), "Expected no file at: {}", path.display());
}
