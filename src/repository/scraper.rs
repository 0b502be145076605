// src/repository/scraper.rs

//! Directory listing discovery
//!
//! Used when a repository publishes no metafile. Every configured
//! directory is fetched as an HTML listing; `.opsi` links become package
//! records, sibling `.opsi.md5` and `.opsi.zsync` links are attached in a
//! second pass.

use super::client::HttpSession;
use super::metadata::PackageRecord;
use crate::config::RepositoryDescriptor;
use crate::error::{Error, Result};
use crate::hash::extract_md5_token;
use crate::version::ProductVersion;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tracing::{debug, error, info, warn};
use url::Url;

static HREF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<a\s[^>]*?href\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#).unwrap()
});

/// Extract the `href` targets of all anchors in an HTML document
pub fn parse_directory_listing(html: &str) -> Vec<String> {
    HREF_RE
        .captures_iter(html)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3)))
        .map(|m| m.as_str().replace("&amp;", "&"))
        .filter(|href| !href.is_empty())
        .collect()
}

/// Split `productId_productVersion-packageVersion.opsi`
///
/// The product id is lowercased.
pub fn parse_package_filename(name: &str) -> Result<(String, ProductVersion)> {
    let stem = name.strip_suffix(".opsi").unwrap_or(name);
    let (product_id, version) = stem
        .rsplit_once('_')
        .ok_or_else(|| Error::ParseError(format!("Bad package filename '{name}'")))?;
    if product_id.is_empty() {
        return Err(Error::ParseError(format!("Bad package filename '{name}': empty product id")));
    }
    let version = ProductVersion::parse(version)
        .map_err(|e| Error::ParseError(format!("Bad package filename '{name}': {e}")))?;
    Ok((product_id.to_lowercase(), version))
}

/// Rewrite an absolute href relative to the listing URL
fn relative_link(link: &str, listing_url: &str) -> String {
    if !link.starts_with('/') {
        return link.to_string();
    }
    let path = format!("/{}", listing_url.splitn(4, '/').last().unwrap_or(""));
    let relative = link
        .strip_prefix(path.as_str())
        .unwrap_or(link)
        .trim_start_matches('/')
        .to_string();
    info!("Absolute link: '{}', relative link: '{}'", link, relative);
    relative
}

fn join_url(base: &str, link: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), link.trim_start_matches('/'))
}

/// Discovers packages by scraping directory listings
pub struct LinkScraper<'a> {
    session: &'a HttpSession,
    repo: &'a Arc<RepositoryDescriptor>,
}

impl<'a> LinkScraper<'a> {
    pub fn new(session: &'a HttpSession, repo: &'a Arc<RepositoryDescriptor>) -> Self {
        Self { session, repo }
    }

    /// Scan all configured directories
    ///
    /// A failing directory does not stop the others; its error is
    /// returned next to the packages found elsewhere.
    pub fn scan(&self) -> (Vec<PackageRecord>, Vec<Error>) {
        let mut packages = Vec::new();
        let mut errors = Vec::new();

        for url in self.repo.download_urls() {
            let url = Url::parse(&url).map(String::from).unwrap_or(url);
            match self.scan_directory(&url) {
                Ok(found) => packages.extend(found),
                Err(e) => {
                    debug!("Failed to scan {}: {}", url, e);
                    errors.push(e);
                }
            }
        }

        if !errors.is_empty() {
            let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
            warn!(
                "Problems processing repository {}: {}",
                self.repo.name,
                messages.join("; ")
            );
        }

        (packages, errors)
    }

    /// Scan a single directory listing
    pub fn scan_directory(&self, url: &str) -> Result<Vec<PackageRecord>> {
        let content = self.session.fetch_text(url)?;
        debug!("content: '{}'", content);
        let links = parse_directory_listing(&content);

        let mut packages: Vec<PackageRecord> = Vec::new();
        for link in links.iter().filter(|l| l.ends_with(".opsi")) {
            let link = relative_link(link, url);
            if !self.repo.accepts(&link) {
                continue;
            }

            let filename = link.rsplit('/').next().unwrap_or(&link).to_string();
            match parse_package_filename(&filename) {
                Ok((product_id, version)) => {
                    let package_url = join_url(url, &link);
                    info!("Found opsi package: {}", package_url);
                    packages.push(PackageRecord {
                        product_id,
                        version,
                        package_url,
                        filename,
                        md5sum: None,
                        zsync_url: None,
                        repository: Arc::clone(self.repo),
                    });
                }
                Err(e) => error!("Failed to process link '{}': {}", link, e),
            }
        }

        for link in &links {
            let is_md5 = link.ends_with(".opsi.md5");
            let is_zsync = link.ends_with(".opsi.zsync");
            if !is_md5 && !is_zsync {
                continue;
            }

            let link = link.rsplit('/').next().unwrap_or(link);
            let filename = if is_md5 {
                &link[..link.len() - ".md5".len()]
            } else {
                &link[..link.len() - ".zsync".len()]
            };
            let Some(package) = packages.iter_mut().find(|p| p.filename == filename) else {
                continue;
            };

            let sidecar_url = join_url(url, link);
            if is_md5 {
                match self.session.fetch_text(&sidecar_url) {
                    Ok(text) => {
                        if let Some(md5) = extract_md5_token(&text) {
                            debug!("Got md5sum for package {}: {}", filename, md5);
                            package.md5sum = Some(md5);
                        }
                    }
                    Err(e) => error!("Failed to process link '{}': {}", link, e),
                }
            } else {
                debug!("Found zsync file for package '{}': {}", filename, sidecar_url);
                package.zsync_url = Some(sidecar_url);
            }
        }

        Ok(packages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_directory_listing() {
        let html = r#"<html><body>
            <a href="../">../</a>
            <A HREF="hwaudit_4.2.0.0-1.opsi">hwaudit_4.2.0.0-1.opsi</A>
            <a class="x" href='hwaudit_4.2.0.0-1.opsi.md5'>md5</a>
            <a href=swaudit_1.0-2.opsi>swaudit</a>
            <a name="anchor">no href</a>
        </body></html>"#;
        assert_eq!(
            parse_directory_listing(html),
            vec![
                "../",
                "hwaudit_4.2.0.0-1.opsi",
                "hwaudit_4.2.0.0-1.opsi.md5",
                "swaudit_1.0-2.opsi",
            ]
        );
    }

    #[test]
    fn test_parse_package_filename() {
        let (id, version) = parse_package_filename("HWaudit_4.2.0.0-1.opsi").unwrap();
        assert_eq!(id, "hwaudit");
        assert_eq!(version.product_version, "4.2.0.0");
        assert_eq!(version.package_version, "1");

        let (id, version) = parse_package_filename("win10-x64_2023-05-3.opsi").unwrap();
        assert_eq!(id, "win10-x64");
        assert_eq!(version.product_version, "2023-05");

        let (id, _) = parse_package_filename("opsi_script_4.12.4.29-1.opsi").unwrap();
        assert_eq!(id, "opsi_script");

        assert!(parse_package_filename("broken.opsi").is_err());
        assert!(parse_package_filename("noversion_1.opsi").is_err());
        assert!(parse_package_filename("_1.0-1.opsi").is_err());
    }

    #[test]
    fn test_relative_link() {
        assert_eq!(
            relative_link("/repo/stable/a_1-1.opsi", "http://host/repo/stable/"),
            "a_1-1.opsi"
        );
        assert_eq!(relative_link("a_1-1.opsi", "http://host/repo/"), "a_1-1.opsi");
    }
}
