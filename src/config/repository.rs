// src/config/repository.rs

//! Repository descriptors read from `*.repo` files
//!
//! Each repository file is an INI document with one or more
//! `[repository_<name>]` sections:
//!
//! ```ini
//! [repository_uib_linux]
//! description = opsi Linux Support
//! active = true
//! baseUrl = https://opsipackages.43.opsi.org
//! dirs = stable/linux/localboot/, stable/linux/netboot/
//! autoInstall = false
//! autoUpdate = true
//! autoSetup = false
//! ```

use crate::error::{Error, Result};
use ini::{Ini, ParseOption, Properties};
use regex::Regex;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Section prefix marking a repository definition
const SECTION_PREFIX: &str = "repository_";

/// Extension of repository definition files
const REPO_FILE_EXTENSION: &str = "repo";

/// Authentication material for a repository
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
    /// PEM client certificate file
    pub cert_file: Option<PathBuf>,
    /// PEM private key file matching `cert_file`
    pub key_file: Option<PathBuf>,
}

impl Credentials {
    /// Client certificate and key, if both are configured and present on disk
    pub fn client_identity(&self) -> Option<(&Path, &Path)> {
        match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) if cert.exists() && key.exists() => Some((cert, key)),
            _ => None,
        }
    }
}

/// A configured package source
#[derive(Debug, Clone)]
pub struct RepositoryDescriptor {
    pub name: String,
    pub description: String,
    pub active: bool,
    pub base_url: String,
    pub dirs: Vec<String>,
    pub credentials: Credentials,
    pub proxy: Option<String>,
    pub verify_cert: bool,
    pub auto_install: bool,
    pub auto_update: bool,
    pub auto_setup: bool,
    pub auto_setup_excludes: Vec<Regex>,
    pub includes: Vec<Regex>,
    pub excludes: Vec<Regex>,
    /// Set when the repository is a peer depot; such repositories need a
    /// transfer slot and are processed after external ones
    pub opsi_depot_id: Option<String>,
    pub only_download: bool,
    pub inherit_product_properties: bool,
}

impl RepositoryDescriptor {
    /// Create a repository with default policy flags
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            active: false,
            base_url: normalize_base_url(&base_url.into()),
            dirs: vec!["/".to_string()],
            credentials: Credentials::default(),
            proxy: None,
            verify_cert: false,
            auto_install: false,
            auto_update: true,
            auto_setup: false,
            auto_setup_excludes: Vec::new(),
            includes: Vec::new(),
            excludes: Vec::new(),
            opsi_depot_id: None,
            only_download: false,
            inherit_product_properties: false,
        }
    }

    /// Build a repository from an INI section's properties
    pub fn from_properties(name: &str, props: &Properties) -> Result<Self> {
        let mut repo = Self::new(name, "");
        let context = |key: &str| format!("repository '{name}', key '{key}'");

        if let Some(v) = lookup(props, "description") {
            repo.description = v.to_string();
        }
        if let Some(v) = lookup(props, "active") {
            repo.active = parse_bool(v).ok_or_else(|| invalid(&context("active"), v))?;
        }
        match lookup(props, "baseUrl") {
            Some(v) if !v.is_empty() => repo.base_url = normalize_base_url(v),
            _ => {
                return Err(Error::ConfigError(format!(
                    "Repository '{name}' has no baseUrl"
                )));
            }
        }
        if let Some(v) = lookup(props, "dirs") {
            let dirs = split_list(v);
            if !dirs.is_empty() {
                repo.dirs = dirs;
            }
        }
        for (key, flag) in [
            ("autoInstall", &mut repo.auto_install),
            ("autoUpdate", &mut repo.auto_update),
            ("autoSetup", &mut repo.auto_setup),
            ("verifyCert", &mut repo.verify_cert),
            ("onlyDownload", &mut repo.only_download),
            ("inheritProductProperties", &mut repo.inherit_product_properties),
        ] {
            if let Some(v) = lookup(props, key) {
                *flag = parse_bool(v).ok_or_else(|| invalid(&context(key), v))?;
            }
        }

        repo.auto_setup_excludes = compile_patterns(lookup(props, "autoSetupExcludes"))?;
        repo.includes = compile_patterns(lookup(props, "includeProductIds"))?;
        repo.excludes = compile_patterns(lookup(props, "excludeProductIds"))?;

        repo.credentials = Credentials {
            username: non_empty(lookup(props, "username")),
            password: non_empty(lookup(props, "password")),
            cert_file: non_empty(lookup(props, "authcertfile")).map(PathBuf::from),
            key_file: non_empty(lookup(props, "authkeyfile")).map(PathBuf::from),
        };
        repo.proxy = non_empty(lookup(props, "proxy"));
        repo.opsi_depot_id = non_empty(lookup(props, "opsiDepotId"));

        Ok(repo)
    }

    /// URLs of the configured directories, each ending with `/`
    ///
    /// A directory of `""`, `"/"` or `"."` denotes the base URL itself.
    pub fn download_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = Vec::new();
        for dir in &self.dirs {
            let mut url = if matches!(dir.as_str(), "" | "/" | ".") {
                self.base_url.clone()
            } else {
                format!("{}/{}", self.base_url, dir)
            };
            if !url.ends_with('/') {
                url.push('/');
            }
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
        urls
    }

    /// Apply include then exclude patterns to a package link
    pub fn accepts(&self, link: &str) -> bool {
        if !self.includes.is_empty() && !self.includes.iter().any(|re| re.is_match(link)) {
            info!(
                "Package '{}' is not included. Please check your includeProductIds-entry in configurationfile.",
                link
            );
            return false;
        }
        if self.excludes.iter().any(|re| re.is_match(link)) {
            info!("Package '{}' excluded by regular expression", link);
            return false;
        }
        true
    }

    /// Case-insensitive name comparison used by `--repo`
    pub fn matches_name(&self, name: &str) -> bool {
        self.name.trim().eq_ignore_ascii_case(name.trim())
    }

    pub fn is_depot(&self) -> bool {
        self.opsi_depot_id.is_some()
    }
}

/// Strip trailing slashes and rewrite `webdav` schemes to `http`
fn normalize_base_url(url: &str) -> String {
    let url = url.trim();
    let url = match url.strip_prefix("webdav") {
        Some(rest) => format!("http{rest}"),
        None => url.to_string(),
    };
    url.trim_end_matches('/').to_string()
}

fn lookup<'a>(props: &'a Properties, key: &str) -> Option<&'a str> {
    props
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.trim())
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

fn invalid(context: &str, value: &str) -> Error {
    Error::ConfigError(format!("Invalid value '{value}' for {context}"))
}

/// Parse an INI boolean (`true/false`, `yes/no`, `on/off`, `1/0`)
pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" | "" => Some(false),
        _ => None,
    }
}

/// Split a comma separated list, dropping empty entries
pub(crate) fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn compile_patterns(value: Option<&str>) -> Result<Vec<Regex>> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    split_list(value)
        .iter()
        .map(|pattern| Regex::new(pattern).map_err(Error::from))
        .collect()
}

/// Parse options shared by all INI readers
///
/// Quote and escape processing are disabled so regular expressions such
/// as `^win\d+` survive unchanged.
pub(crate) fn ini_parse_option() -> ParseOption {
    ParseOption {
        enabled_quote: false,
        enabled_escape: false,
        ..Default::default()
    }
}

/// Load all repository definitions from a file
pub fn load_repository_file(path: &Path) -> Result<Vec<RepositoryDescriptor>> {
    let ini = Ini::load_from_file_opt(path, ini_parse_option())
        .map_err(|e| Error::ConfigError(format!("Failed to read {}: {e}", path.display())))?;

    let mut repositories = Vec::new();
    for (section, props) in ini.iter() {
        let Some(name) = section.and_then(|s| s.strip_prefix(SECTION_PREFIX)) else {
            continue;
        };
        match RepositoryDescriptor::from_properties(name, props) {
            Ok(repo) => {
                debug!("Found repository '{}' in {}", repo.name, path.display());
                repositories.push(repo);
            }
            Err(e) => error!("Skipping repository '{}' in {}: {}", name, path.display(), e),
        }
    }
    Ok(repositories)
}

/// Load every `*.repo` file of a directory, in file name order
///
/// Repository names are unique case-insensitively; later duplicates are
/// ignored with a warning.
pub fn load_repository_dir(dir: &Path) -> Result<Vec<RepositoryDescriptor>> {
    let entries = fs::read_dir(dir).map_err(|e| {
        Error::ConfigError(format!(
            "Failed to read repository directory {}: {e}",
            dir.display()
        ))
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path.extension().and_then(|e| e.to_str()) == Some(REPO_FILE_EXTENSION)
        })
        .collect();
    files.sort();

    let mut seen = HashSet::new();
    let mut repositories = Vec::new();
    for file in files {
        for repo in load_repository_file(&file)? {
            if !seen.insert(repo.name.to_lowercase()) {
                warn!(
                    "Repository '{}' in {} is already defined, ignoring",
                    repo.name,
                    file.display()
                );
                continue;
            }
            repositories.push(repo);
        }
    }

    Ok(sort_repository_list(repositories))
}

/// Order repositories so that peer depots come last
///
/// Depot repositories may have to wait for a transfer slot, external
/// repositories never do.
pub fn sort_repository_list(repositories: Vec<RepositoryDescriptor>) -> Vec<RepositoryDescriptor> {
    let (depots, external): (Vec<_>, Vec<_>) =
        repositories.into_iter().partition(|repo| repo.is_depot());
    external.into_iter().chain(depots).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const REPO_FILE: &str = r"; comment line
[repository_uib_linux]
description = opsi Linux Support
active = true
baseUrl = webdavs://download.example.org/
dirs = stable/linux/localboot/, stable/linux/netboot/
autoInstall = false
autoUpdate = true
autoSetup = yes
autoSetupExcludes = ^win\d+
includeProductIds =
excludeProductIds = ^test-.*, legacy
proxy =

[repository_depot]
active = false
baseUrl = https://depot2.example.org:4447/repository
opsiDepotId = depot2.example.org
inheritProductProperties = true
";

    fn load(content: &str) -> Vec<RepositoryDescriptor> {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("uib.repo"), content).unwrap();
        load_repository_dir(dir.path()).unwrap()
    }

    #[test]
    fn test_load_repository_file() {
        let repos = load(REPO_FILE);
        assert_eq!(repos.len(), 2);

        let repo = &repos[0];
        assert_eq!(repo.name, "uib_linux");
        assert!(repo.active);
        assert_eq!(repo.base_url, "https://download.example.org");
        assert_eq!(repo.dirs, vec!["stable/linux/localboot/", "stable/linux/netboot/"]);
        assert!(!repo.auto_install);
        assert!(repo.auto_update);
        assert!(repo.auto_setup);
        assert!(repo.auto_setup_excludes[0].is_match("win10"));
        assert!(repo.includes.is_empty());
        assert_eq!(repo.excludes.len(), 2);
        assert!(repo.proxy.is_none());

        let depot = &repos[1];
        assert_eq!(depot.opsi_depot_id.as_deref(), Some("depot2.example.org"));
        assert!(depot.inherit_product_properties);
    }

    #[test]
    fn test_invalid_boolean_skips_repository() {
        let repos = load("[repository_a]\nbaseUrl = http://a\nactive = maybe\n");
        assert!(repos.is_empty());
    }

    #[test]
    fn test_duplicate_names_are_ignored() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.repo"), "[repository_Main]\nbaseUrl = http://a\n").unwrap();
        fs::write(dir.path().join("b.repo"), "[repository_main]\nbaseUrl = http://b\n").unwrap();
        fs::write(dir.path().join("c.txt"), "[repository_other]\nbaseUrl = http://c\n").unwrap();

        let repos = load_repository_dir(dir.path()).unwrap();
        assert_eq!(repos.len(), 1);
        assert_eq!(repos[0].base_url, "http://a");
    }

    #[test]
    fn test_download_urls() {
        let mut repo = RepositoryDescriptor::new("r", "http://repo.example.org/");
        repo.dirs = vec![".".into(), "/".into(), "a/b".into(), "c/".into()];
        assert_eq!(
            repo.download_urls(),
            vec![
                "http://repo.example.org/",
                "http://repo.example.org/a/b/",
                "http://repo.example.org/c/",
            ]
        );
    }

    #[test]
    fn test_accepts_includes_then_excludes() {
        let mut repo = RepositoryDescriptor::new("r", "http://repo");
        assert!(repo.accepts("hwaudit_4.2.0.0-1.opsi"));

        repo.includes = vec![Regex::new("^hw").unwrap(), Regex::new("^sw").unwrap()];
        repo.excludes = vec![Regex::new("swaudit").unwrap()];
        assert!(repo.accepts("hwaudit_4.2.0.0-1.opsi"));
        assert!(!repo.accepts("swaudit_4.2.0.0-1.opsi"));
        assert!(!repo.accepts("javavm_1.0-1.opsi"));
    }

    #[test]
    fn test_sort_repository_list_puts_depots_last() {
        let mut depot = RepositoryDescriptor::new("depot", "https://depot");
        depot.opsi_depot_id = Some("depot.example.org".into());
        let external = RepositoryDescriptor::new("external", "https://ext");

        let sorted = sort_repository_list(vec![depot, external]);
        assert_eq!(sorted[0].name, "external");
        assert_eq!(sorted[1].name, "depot");
    }

    #[test]
    fn test_matches_name_case_insensitive() {
        let repo = RepositoryDescriptor::new("UIB_Linux", "http://a");
        assert!(repo.matches_name(" uib_linux "));
        assert!(!repo.matches_name("uib"));
    }
}
