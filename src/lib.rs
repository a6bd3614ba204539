//! genrootfs: assemble an embedded Linux root filesystem from package feeds.
//!
//! The entry point is [`RootfsAssembler`]: give it a validated
//! [`RootfsConfig`] and call `create()`. Host-level settings (native
//! sysroot, tool locations, fakeroot) come from [`Config::load`].
//!
//! ```no_run
//! use genrootfs::{Config, Machine, PackageFeed, RootfsAssembler, RootfsConfig};
//! # fn main() -> genrootfs::Result<()> {
//! let host = Config::load(std::path::Path::new("."))?;
//! let config = RootfsConfig::new("/build/work", Machine::known("intel-x86-64")?)
//!     .with_host_defaults(&host)
//!     .with_feeds([PackageFeed::trusted("http://feeds.example.com/rpm")])
//!     .with_packages(["packagegroup-core-boot", "openssh"])
//!     .with_complementary("*-dbg");
//!
//! let mut assembler = RootfsAssembler::new(config, &host);
//! let outcome = assembler.create()?;
//! for pkg in &outcome.deferred {
//!     println!("{pkg}: postinstall runs on first boot");
//! }
//! # Ok(())
//! # }
//! ```

pub mod build;
pub mod config;
pub mod error;
pub mod machine;
pub mod package;
pub mod process;
pub mod rootfs;

pub use config::{Config, PackageFeed, RecommendationPolicy, RootfsConfig, Toolchain};
pub use error::{Outcome, PostinstallFailure, Result, RootfsError, Warning};
pub use machine::Machine;
pub use package::{PackageMap, PackageRecord};
pub use rootfs::RootfsAssembler;
