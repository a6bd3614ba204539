//! Configuration for genrootfs.
//!
//! Two layers:
//! - [`Config`]: host-level settings read from a `.env` file and the process
//!   environment (environment wins). Locates the native sysroot and the
//!   external tools.
//! - [`RootfsConfig`]: everything one rootfs assembly needs, built
//!   explicitly by the caller and validated before anything touches disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Result, RootfsError};
use crate::machine::Machine;

/// Host configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Native sysroot providing dnf, rpm, pseudo and the intercept hooks
    pub native_sysroot: Option<PathBuf>,
    /// Default working directory for assemblies
    pub workdir: PathBuf,
    /// Resolved external executables
    pub toolchain: Toolchain,
    /// Whether child processes run under pseudo
    pub fakeroot: bool,
}

impl Config {
    /// Load configuration from `base_dir/.env` and the environment.
    pub fn load(base_dir: &Path) -> Result<Self> {
        let mut env_vars = HashMap::new();

        let env_path = base_dir.join(".env");
        if env_path.exists() {
            let iter = dotenvy::from_path_iter(&env_path).map_err(|e| {
                RootfsError::config(format!("cannot read {}: {e}", env_path.display()))
            })?;
            for item in iter {
                let (key, value) = item.map_err(|e| {
                    RootfsError::config(format!("malformed {}: {e}", env_path.display()))
                })?;
                env_vars.insert(key, value);
            }
        }

        // Environment variables override .env file
        env_vars.extend(std::env::vars());

        Ok(Self::from_vars(base_dir, &env_vars))
    }

    fn from_vars(base_dir: &Path, vars: &HashMap<String, String>) -> Self {
        let native_sysroot = vars.get("OECORE_NATIVE_SYSROOT").map(PathBuf::from);

        let workdir = vars
            .get("GENROOTFS_WORKDIR")
            .map(|s| {
                let path = PathBuf::from(s);
                if path.is_absolute() {
                    path
                } else {
                    base_dir.join(path)
                }
            })
            .unwrap_or_else(|| base_dir.join("workdir"));

        let fakeroot = vars
            .get("GENROOTFS_FAKEROOT")
            .map(|v| v != "0")
            .unwrap_or(native_sysroot.is_some());

        let toolchain = Toolchain::resolve(native_sysroot.as_deref(), vars);
        debug!(?toolchain, "resolved toolchain");

        Self {
            native_sysroot,
            workdir,
            toolchain,
            fakeroot,
        }
    }

    /// Privilege-emulation settings for one target root, when enabled.
    pub fn fakeroot_for(&self, workdir: &Path, target_rootfs: &Path) -> Option<FakerootConfig> {
        if !self.fakeroot {
            return None;
        }
        let sysroot = self.native_sysroot.as_ref()?;
        Some(FakerootConfig {
            prefix: sysroot.join("usr"),
            localstatedir: workdir.join("pseudo"),
            preload: sysroot.join("usr/lib/pseudo/lib64/libpseudo.so"),
            passwd_dir: target_rootfs.to_path_buf(),
        })
    }

    /// Default location of the postinstall intercept hooks.
    pub fn intercepts_source(&self) -> Option<PathBuf> {
        self.native_sysroot
            .as_ref()
            .map(|s| s.join("usr/share/poky/scripts/postinst-intercepts"))
    }

    /// Default pkgdata directory for a machine.
    pub fn pkgdata_dir(&self, machine: &Machine) -> Option<PathBuf> {
        self.native_sysroot
            .as_ref()
            .map(|s| s.join("usr/share/pkgdata").join(&machine.name))
    }
}

/// Paths of the external executables driven during assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    pub dnf: PathBuf,
    pub rpm: PathBuf,
    pub depmod: PathBuf,
    pub pkgdata_util: PathBuf,
}

impl Toolchain {
    /// Explicit override, then the native sysroot, then `PATH`.
    fn resolve(sysroot: Option<&Path>, vars: &HashMap<String, String>) -> Self {
        let find = |key: &str, name: &str, sysroot_rel: &str| -> PathBuf {
            if let Some(path) = vars.get(key) {
                return PathBuf::from(path);
            }
            if let Some(candidate) = sysroot.map(|s| s.join(sysroot_rel)) {
                if candidate.exists() {
                    return candidate;
                }
            }
            which::which(name).unwrap_or_else(|_| PathBuf::from(name))
        };

        Self {
            dnf: find("GENROOTFS_DNF", "dnf", "usr/bin/dnf"),
            rpm: find("GENROOTFS_RPM", "rpm", "usr/bin/rpm"),
            depmod: find("GENROOTFS_DEPMOD", "depmod", "usr/sbin/depmod"),
            pkgdata_util: find(
                "GENROOTFS_PKGDATA_UTIL",
                "oe-pkgdata-util",
                "usr/share/poky/scripts/oe-pkgdata-util",
            ),
        }
    }

    /// All tools inside one directory, named after themselves.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            dnf: dir.join("dnf"),
            rpm: dir.join("rpm"),
            depmod: dir.join("depmod"),
            pkgdata_util: dir.join("oe-pkgdata-util"),
        }
    }
}

/// pseudo (fakeroot) settings rendered into child environments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakerootConfig {
    pub prefix: PathBuf,
    pub localstatedir: PathBuf,
    pub preload: PathBuf,
    pub passwd_dir: PathBuf,
}

/// A package feed location.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PackageFeed {
    pub uri: String,
    /// Trusted feeds skip signature verification.
    pub trusted: bool,
}

impl PackageFeed {
    pub fn trusted(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            trusted: true,
        }
    }

    pub fn signed(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            trusted: false,
        }
    }
}

/// How weak dependencies are treated during install.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecommendationPolicy {
    /// Only hard dependencies are pulled in.
    Strict,
    #[default]
    BestEffort,
}

/// Everything one rootfs assembly needs.
#[derive(Debug, Clone)]
pub struct RootfsConfig {
    pub workdir: PathBuf,
    pub target_rootfs: PathBuf,
    pub machine: Machine,
    pub feeds: Vec<PackageFeed>,
    pub packages: Vec<String>,
    pub exclude: Vec<String>,
    pub recommendations: RecommendationPolicy,
    /// Whitespace-separated globs such as `*-dev *-dbg`.
    pub complementary_globs: Option<String>,
    pub pre_scripts: Vec<String>,
    pub post_scripts: Vec<String>,
    pub intercepts_source: Option<PathBuf>,
    pub pkgdata_dir: Option<PathBuf>,
    /// Key file name under `/etc/pki/packagefeed-gpg` for signed feeds.
    pub feed_gpg_key: Option<String>,
    /// Extra library path handed to pre/post scripts.
    pub script_library_path: Option<PathBuf>,
}

impl RootfsConfig {
    /// Configuration rooted at `workdir`, target root at `workdir/rootfs`.
    pub fn new(workdir: impl AsRef<Path>, machine: Machine) -> Self {
        let workdir = workdir.as_ref().to_path_buf();
        Self {
            target_rootfs: workdir.join("rootfs"),
            workdir,
            machine,
            feeds: Vec::new(),
            packages: Vec::new(),
            exclude: Vec::new(),
            recommendations: RecommendationPolicy::default(),
            complementary_globs: None,
            pre_scripts: Vec::new(),
            post_scripts: Vec::new(),
            intercepts_source: None,
            pkgdata_dir: None,
            feed_gpg_key: None,
            script_library_path: None,
        }
    }

    /// Fill defaults that come from the host configuration.
    pub fn with_host_defaults(mut self, config: &Config) -> Self {
        if self.intercepts_source.is_none() {
            self.intercepts_source = config.intercepts_source();
        }
        if self.pkgdata_dir.is_none() {
            self.pkgdata_dir = config.pkgdata_dir(&self.machine);
        }
        if self.script_library_path.is_none() {
            self.script_library_path = config.native_sysroot.as_ref().map(|s| s.join("usr/lib"));
        }
        self
    }

    pub fn with_target_rootfs(mut self, path: impl AsRef<Path>) -> Self {
        self.target_rootfs = path.as_ref().to_path_buf();
        self
    }

    pub fn with_feeds(mut self, feeds: impl IntoIterator<Item = PackageFeed>) -> Self {
        self.feeds.extend(feeds);
        self
    }

    pub fn with_packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.packages.extend(packages.into_iter().map(Into::into));
        self
    }

    pub fn with_exclude<I, S>(mut self, exclude: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude.extend(exclude.into_iter().map(Into::into));
        self
    }

    pub fn with_recommendations(mut self, policy: RecommendationPolicy) -> Self {
        self.recommendations = policy;
        self
    }

    pub fn with_complementary(mut self, globs: impl Into<String>) -> Self {
        self.complementary_globs = Some(globs.into());
        self
    }

    pub fn with_pre_script(mut self, script: impl Into<String>) -> Self {
        self.pre_scripts.push(script.into());
        self
    }

    pub fn with_post_script(mut self, script: impl Into<String>) -> Self {
        self.post_scripts.push(script.into());
        self
    }

    pub fn with_intercepts_source(mut self, dir: impl AsRef<Path>) -> Self {
        self.intercepts_source = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_pkgdata_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.pkgdata_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_feed_gpg_key(mut self, key: impl Into<String>) -> Self {
        self.feed_gpg_key = Some(key.into());
        self
    }

    /// Glob patterns split out of `complementary_globs`.
    pub fn glob_patterns(&self) -> Vec<String> {
        self.complementary_globs
            .as_deref()
            .map(|g| g.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Reject anything that would fail halfway through a transaction.
    pub fn validate(&self) -> Result<()> {
        self.machine.validate()?;
        if self.feeds.is_empty() {
            return Err(RootfsError::config("no package feeds configured"));
        }
        if self.feeds.iter().any(|f| f.uri.trim().is_empty()) {
            return Err(RootfsError::config("package feed with empty URI"));
        }
        if self.packages.is_empty() {
            return Err(RootfsError::config("no packages requested"));
        }
        if !self.target_rootfs.is_absolute() || !self.workdir.is_absolute() {
            return Err(RootfsError::config(format!(
                "target root {} and workdir {} must be absolute",
                self.target_rootfs.display(),
                self.workdir.display()
            )));
        }
        if self.target_rootfs == Path::new("/") {
            return Err(RootfsError::config("refusing to use / as target root"));
        }
        if self.feeds.iter().any(|f| !f.trusted) && self.feed_gpg_key.is_none() {
            return Err(RootfsError::config(
                "signed feeds require a feed GPG key name",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn valid() -> RootfsConfig {
        RootfsConfig::new("/work", Machine::new("m", ["noarch", "x86_64"]))
            .with_feeds([PackageFeed::trusted("http://feed/rpm")])
            .with_packages(["base-files"])
    }

    #[test]
    fn test_from_vars_defaults() {
        let cfg = Config::from_vars(Path::new("/base"), &vars(&[]));
        assert_eq!(cfg.workdir, PathBuf::from("/base/workdir"));
        assert!(cfg.native_sysroot.is_none());
        assert!(!cfg.fakeroot);
        assert!(cfg.fakeroot_for(Path::new("/w"), Path::new("/w/rootfs")).is_none());
    }

    #[test]
    fn test_from_vars_overrides() {
        let cfg = Config::from_vars(
            Path::new("/base"),
            &vars(&[
                ("OECORE_NATIVE_SYSROOT", "/sdk/sysroots/x86_64"),
                ("GENROOTFS_WORKDIR", "out"),
                ("GENROOTFS_DNF", "/opt/dnf"),
            ]),
        );
        assert_eq!(cfg.workdir, PathBuf::from("/base/out"));
        assert_eq!(cfg.toolchain.dnf, PathBuf::from("/opt/dnf"));
        assert!(cfg.fakeroot);

        let fr = cfg
            .fakeroot_for(Path::new("/w"), Path::new("/w/rootfs"))
            .unwrap();
        assert_eq!(fr.prefix, PathBuf::from("/sdk/sysroots/x86_64/usr"));
        assert_eq!(fr.localstatedir, PathBuf::from("/w/pseudo"));
        assert_eq!(fr.passwd_dir, PathBuf::from("/w/rootfs"));
    }

    #[test]
    fn test_load_reads_dotenv() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(".env"),
            "# comment\nGENROOTFS_PKGDATA_UTIL=\"/opt/pkgdata\"\n",
        )
        .unwrap();
        let cfg = Config::load(dir.path()).unwrap();
        if std::env::var("GENROOTFS_PKGDATA_UTIL").is_err() {
            assert_eq!(cfg.toolchain.pkgdata_util, PathBuf::from("/opt/pkgdata"));
        }
    }

    #[test]
    fn test_valid_config() {
        valid().validate().unwrap();
        assert_eq!(valid().target_rootfs, PathBuf::from("/work/rootfs"));
    }

    #[test]
    fn test_empty_feeds_rejected() {
        let mut cfg = valid();
        cfg.feeds.clear();
        assert!(matches!(cfg.validate(), Err(RootfsError::Configuration(_))));
    }

    #[test]
    fn test_empty_packages_rejected() {
        let mut cfg = valid();
        cfg.packages.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_signed_feed_needs_key() {
        let cfg = valid().with_feeds([PackageFeed::signed("http://signed/rpm")]);
        assert!(cfg.validate().is_err());
        cfg.with_feed_gpg_key("rpm-key").validate().unwrap();
    }

    #[test]
    fn test_relative_root_rejected() {
        let cfg = valid().with_target_rootfs("rootfs");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_glob_patterns() {
        let cfg = valid().with_complementary("*-dev  *-dbg\n*-src");
        assert_eq!(cfg.glob_patterns(), vec!["*-dev", "*-dbg", "*-src"]);
        assert!(valid().glob_patterns().is_empty());
    }
}
