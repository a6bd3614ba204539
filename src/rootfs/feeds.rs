//! Package feed registration.
//!
//! Each feed becomes one `.repo` file under `etc/yum.repos.d`, named from
//! the feed's URI path, so registering the same list twice rewrites the same
//! files with the same bytes.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::PackageFeed;
use crate::error::{Result, RootfsError};

/// Directory holding the repository definitions, relative to the root.
pub const REPOS_DIR: &str = "etc/yum.repos.d";

/// Where signed-feed keys live inside the target.
pub const FEED_KEY_DIR: &str = "/etc/pki/packagefeed-gpg";

/// Drop duplicate URIs, keeping the first occurrence and its trust flag.
pub fn dedup_feeds(feeds: &[PackageFeed]) -> Vec<PackageFeed> {
    let mut seen = HashSet::new();
    feeds
        .iter()
        .filter(|f| seen.insert(f.uri.trim().to_string()))
        .cloned()
        .collect()
}

/// Path component of a feed URI. Bare paths are their own path.
fn uri_path(uri: &str) -> &str {
    match uri.split_once("://") {
        Some((_, rest)) => {
            let rest = rest.split(['?', '#']).next().unwrap_or(rest);
            rest.find('/').map(|i| &rest[i..]).unwrap_or("")
        }
        None => uri,
    }
}

/// Stable repository identifier derived from the URI path.
pub fn repo_id(uri: &str) -> String {
    format!("oe-remote-repo{}", uri_path(uri).split('/').collect::<Vec<_>>().join("-"))
}

fn repo_name(uri: &str) -> String {
    format!("OE Remote Repo:{}", uri_path(uri).split('/').collect::<Vec<_>>().join(" "))
}

fn base_url(uri: &str) -> String {
    if uri.contains("://") {
        uri.to_string()
    } else {
        format!("file://{uri}")
    }
}

/// Render one repository definition.
pub fn render_repo(feed: &PackageFeed, gpg_key: Option<&str>) -> Result<String> {
    let uri = feed.uri.trim();
    let gpg_opts = if feed.trusted {
        "gpgcheck=0\n".to_string()
    } else {
        let key = gpg_key.ok_or_else(|| {
            RootfsError::config(format!("signed feed {uri} has no GPG key configured"))
        })?;
        format!("repo_gpgcheck=1\ngpgkey=file://{FEED_KEY_DIR}/{key}\n")
    };
    Ok(format!(
        "[{}]\nname={}\nbaseurl={}\n{}",
        repo_id(uri),
        repo_name(uri),
        base_url(uri),
        gpg_opts
    ))
}

/// Write repository definitions for `feeds` under `target_rootfs`.
///
/// Returns the written files in feed order.
pub fn register_feeds(
    target_rootfs: &Path,
    feeds: &[PackageFeed],
    gpg_key: Option<&str>,
) -> Result<Vec<PathBuf>> {
    if feeds.is_empty() {
        return Err(RootfsError::config("no package feeds configured"));
    }

    let repos_dir = target_rootfs.join(REPOS_DIR);
    fs::create_dir_all(&repos_dir)?;

    let mut written = Vec::new();
    for feed in dedup_feeds(feeds) {
        let path = repos_dir.join(format!("{}.repo", repo_id(feed.uri.trim())));
        fs::write(&path, render_repo(&feed, gpg_key)?)?;
        debug!(uri = %feed.uri, repo = %path.display(), trusted = feed.trusted, "registered feed");
        written.push(path);
    }
    info!(count = written.len(), "registered package feeds");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_id_from_uri_path() {
        assert_eq!(
            repo_id("http://feed.example.com/rpm/core2_64"),
            "oe-remote-repo-rpm-core2_64"
        );
        assert_eq!(repo_id("/srv/feed/noarch"), "oe-remote-repo-srv-feed-noarch");
        assert_eq!(repo_id("https://host"), "oe-remote-repo");
    }

    #[test]
    fn test_render_trusted_repo() {
        let repo = render_repo(&PackageFeed::trusted("http://h/rpm/all"), None).unwrap();
        assert_eq!(
            repo,
            "[oe-remote-repo-rpm-all]\nname=OE Remote Repo: rpm all\nbaseurl=http://h/rpm/all\ngpgcheck=0\n"
        );
    }

    #[test]
    fn test_render_signed_repo() {
        let repo = render_repo(&PackageFeed::signed("/srv/rpm"), Some("RPM-GPG-KEY")).unwrap();
        assert!(repo.contains("baseurl=file:///srv/rpm\n"));
        assert!(repo.contains("repo_gpgcheck=1\n"));
        assert!(repo.contains("gpgkey=file:///etc/pki/packagefeed-gpg/RPM-GPG-KEY\n"));
        assert!(render_repo(&PackageFeed::signed("/srv/rpm"), None).is_err());
    }

    #[test]
    fn test_dedup_keeps_first() {
        let feeds = vec![
            PackageFeed::trusted("http://a/rpm"),
            PackageFeed::signed("http://a/rpm"),
            PackageFeed::trusted("http://b/rpm2"),
        ];
        let deduped = dedup_feeds(&feeds);
        assert_eq!(deduped.len(), 2);
        assert!(deduped[0].trusted);
    }

    #[test]
    fn test_register_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let feeds = vec![
            PackageFeed::trusted("http://a/rpm/x86_64"),
            PackageFeed::trusted("http://a/rpm/noarch"),
            PackageFeed::trusted("http://a/rpm/x86_64"),
        ];

        let first = register_feeds(dir.path(), &feeds, None).unwrap();
        let snapshot: Vec<Vec<u8>> = first.iter().map(|p| fs::read(p).unwrap()).collect();

        let second = register_feeds(dir.path(), &feeds, None).unwrap();
        assert_eq!(first, second);
        let again: Vec<Vec<u8>> = second.iter().map(|p| fs::read(p).unwrap()).collect();
        assert_eq!(snapshot, again);

        let count = fs::read_dir(dir.path().join(REPOS_DIR)).unwrap().count();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_register_empty_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = register_feeds(dir.path(), &[], None).unwrap_err();
        assert!(matches!(err, RootfsError::Configuration(_)));
        assert!(!dir.path().join(REPOS_DIR).exists());
    }
}
