// src/config/mod.rs

//! Updater configuration
//!
//! The main configuration file (`/etc/opsi/opsi-package-updater.conf`) is
//! an INI document. Values missing from the file keep their defaults:
//!
//! ```ini
//! [general]
//! packageDir = /var/lib/opsi/repository
//! repositoryConfigDir = /etc/opsi/package-updater.repos.d/
//! useZsync = true
//! ignoreErrors = false
//!
//! [notification]
//! active = false
//! smtphost = localhost
//! receivers = admin@example.org
//!
//! [installation]
//! windowStart = 22:00
//! windowEnd = 06:00
//! exceptProductIds = firefox, thunderbird
//!
//! [wol]
//! active = false
//!
//! [backend]
//! url = https://localhost:4447/rpc
//! depotId = depot.example.org
//! ```

mod patch;
mod repository;

pub use patch::{patch_repo_file, patch_repo_files, KNOWN_REPO_FILES};
pub use repository::{
    load_repository_dir, load_repository_file, sort_repository_list, Credentials,
    RepositoryDescriptor,
};

use crate::error::{Error, Result};
use crate::policy::InstallationWindow;
use ini::{Ini, Properties};
use repository::{ini_parse_option, parse_bool, split_list};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Default location of the main configuration file
pub const DEFAULT_CONFIG_FILE: &str = "/etc/opsi/opsi-package-updater.conf";

/// Default package cache directory
pub const DEFAULT_PACKAGE_DIR: &str = "/var/lib/opsi/repository";

/// Default directory holding `*.repo` files
pub const DEFAULT_REPOSITORY_CONFIG_DIR: &str = "/etc/opsi/package-updater.repos.d";

/// User agent sent with every repository request
pub const DEFAULT_USER_AGENT: &str = concat!("opsi-package-updater/", env!("CARGO_PKG_VERSION"));

/// Default opsi service endpoint
pub const DEFAULT_BACKEND_URL: &str = "https://localhost:4447/rpc";

/// Default HTTP timeout for repository requests
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// E-mail notification settings
#[derive(Debug, Clone)]
pub struct NotificationConfig {
    pub active: bool,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_user: Option<String>,
    pub smtp_password: Option<String>,
    pub use_starttls: bool,
    pub subject: String,
    pub sender: String,
    pub receivers: Vec<String>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            active: false,
            smtp_host: "localhost".to_string(),
            smtp_port: 25,
            smtp_user: None,
            smtp_password: None,
            use_starttls: false,
            subject: "opsi-package-updater".to_string(),
            sender: "opsi-package-updater@localhost".to_string(),
            receivers: Vec::new(),
        }
    }
}

/// Wake-on-LAN settings applied after auto setup
#[derive(Debug, Clone, Default)]
pub struct WolConfig {
    pub active: bool,
    pub exclude_product_ids: Vec<String>,
    pub shutdown_wanted: bool,
    /// Pause between powering on two clients
    pub start_gap: Duration,
}

/// Connection to the opsi service
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Id of the depot this updater runs on
    pub depot_id: Option<String>,
    pub verify_cert: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_BACKEND_URL.to_string(),
            username: None,
            password: None,
            depot_id: None,
            verify_cert: false,
        }
    }
}

/// Options taken from the command line rather than the config file
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Restrict processing to these product ids
    pub process_product_ids: Vec<String>,
    pub force_checksum_calculation: bool,
    pub force_download: bool,
    /// `install` mode: install every available product
    pub install_all_available: bool,
    /// Only use the repository with this name
    pub repository_name: Option<String>,
    /// Use the named repository even if it is inactive
    pub force_repository_activation: bool,
    pub disable_zsync: bool,
}

/// Complete updater configuration
#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    pub config_file: PathBuf,
    pub package_dir: PathBuf,
    pub repository_config_dir: PathBuf,
    pub proxy: Option<String>,
    pub temp_dir: Option<PathBuf>,
    pub use_zsync: bool,
    pub ignore_errors: bool,
    pub timeout: Duration,
    pub user_agent: String,
    pub notification: NotificationConfig,
    pub installation_window: Option<InstallationWindow>,
    pub wol: WolConfig,
    pub backend: BackendConfig,
    pub repositories: Vec<RepositoryDescriptor>,
    pub options: RunOptions,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            config_file: PathBuf::from(DEFAULT_CONFIG_FILE),
            package_dir: PathBuf::from(DEFAULT_PACKAGE_DIR),
            repository_config_dir: PathBuf::from(DEFAULT_REPOSITORY_CONFIG_DIR),
            proxy: None,
            temp_dir: None,
            use_zsync: true,
            ignore_errors: false,
            timeout: DEFAULT_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            notification: NotificationConfig::default(),
            installation_window: None,
            wol: WolConfig::default(),
            backend: BackendConfig::default(),
            repositories: Vec::new(),
            options: RunOptions::default(),
        }
    }
}

impl UpdaterConfig {
    /// Load the main configuration and all repository files it points to
    ///
    /// Known legacy uib repository files are patched in place first.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::load_main(path)?;
        if config.repository_config_dir.is_dir() {
            patch_repo_files(&config.repository_config_dir)?;
        }
        config.repositories = load_repository_dir(&config.repository_config_dir)?;
        debug!(
            "Loaded {} repositories from {}",
            config.repositories.len(),
            config.repository_config_dir.display()
        );
        Ok(config)
    }

    /// Load only the main configuration file
    pub fn load_main(path: &Path) -> Result<Self> {
        let ini = Ini::load_from_file_opt(path, ini_parse_option())
            .map_err(|e| Error::ConfigError(format!("Failed to read {}: {e}", path.display())))?;
        let mut config = parse_ini(&ini)?;
        config.config_file = path.to_path_buf();
        Ok(config)
    }

    /// Apply command line options to the loaded configuration
    pub fn apply_options(&mut self, options: RunOptions) {
        if options.disable_zsync {
            self.use_zsync = false;
        }

        for repo in &mut self.repositories {
            if options.install_all_available {
                repo.auto_install = true;
                repo.auto_update = true;
                repo.auto_setup = false;
            }
            if options.force_repository_activation
                && options
                    .repository_name
                    .as_deref()
                    .is_some_and(|name| repo.matches_name(name))
            {
                warn!("ATTENTION: Using an inactive repository!");
                repo.active = true;
            }
        }

        self.options = options;
    }
}

fn get<'a>(section: &'a Properties, key: &str) -> Option<&'a str> {
    section
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.trim())
}

fn get_bool(section: &Properties, name: &str, key: &str) -> Result<Option<bool>> {
    match get(section, key) {
        Some(v) => parse_bool(v).map(Some).ok_or_else(|| {
            Error::ConfigError(format!("Invalid boolean '{v}' for [{name}] {key}"))
        }),
        None => Ok(None),
    }
}

fn get_string(section: &Properties, key: &str) -> Option<String> {
    get(section, key).filter(|v| !v.is_empty()).map(str::to_string)
}

fn get_number<T: std::str::FromStr>(section: &Properties, name: &str, key: &str) -> Result<Option<T>> {
    match get(section, key).filter(|v| !v.is_empty()) {
        Some(v) => v.parse::<T>().map(Some).map_err(|_| {
            Error::ConfigError(format!("Invalid number '{v}' for [{name}] {key}"))
        }),
        None => Ok(None),
    }
}

/// Map an `Ini` document onto `UpdaterConfig`, starting from defaults
fn parse_ini(ini: &Ini) -> Result<UpdaterConfig> {
    let mut config = UpdaterConfig::default();

    // [general] section
    if let Some(section) = ini.section(Some("general")) {
        if let Some(v) = get_string(section, "packageDir") {
            config.package_dir = PathBuf::from(v);
        }
        if let Some(v) = get_string(section, "repositoryConfigDir") {
            config.repository_config_dir = PathBuf::from(v);
        }
        config.proxy = get_string(section, "proxy");
        config.temp_dir = get_string(section, "tempdir").map(PathBuf::from);
        if let Some(v) = get_bool(section, "general", "useZsync")? {
            config.use_zsync = v;
        }
        if let Some(v) = get_bool(section, "general", "ignoreErrors")? {
            config.ignore_errors = v;
        }
        if let Some(v) = get_number::<u64>(section, "general", "timeout")? {
            config.timeout = Duration::from_secs(v);
        }
        if let Some(v) = get_string(section, "userAgent") {
            config.user_agent = v;
        }
    }

    // [notification] section
    if let Some(section) = ini.section(Some("notification")) {
        let n = &mut config.notification;
        if let Some(v) = get_bool(section, "notification", "active")? {
            n.active = v;
        }
        if let Some(v) = get_string(section, "smtphost") {
            n.smtp_host = v;
        }
        if let Some(v) = get_number::<u16>(section, "notification", "smtpport")? {
            n.smtp_port = v;
        }
        n.smtp_user = get_string(section, "smtpuser");
        n.smtp_password = get(section, "smtppassword").map(str::to_string);
        if let Some(v) = get_bool(section, "notification", "use_starttls")? {
            n.use_starttls = v;
        }
        if let Some(v) = get_string(section, "subject") {
            n.subject = v;
        }
        if let Some(v) = get_string(section, "sender") {
            n.sender = v;
        }
        if let Some(v) = get(section, "receivers") {
            n.receivers = split_list(v);
        }
    }

    // [installation] section
    if let Some(section) = ini.section(Some("installation")) {
        let start = get_string(section, "windowStart");
        let end = get_string(section, "windowEnd");
        let exceptions = get(section, "exceptProductIds")
            .map(split_list)
            .unwrap_or_default();
        if let (Some(start), Some(end)) = (start, end) {
            config.installation_window = Some(InstallationWindow::parse(&start, &end, exceptions)?);
        }
    }

    // [wol] section
    if let Some(section) = ini.section(Some("wol")) {
        if let Some(v) = get_bool(section, "wol", "active")? {
            config.wol.active = v;
        }
        if let Some(v) = get(section, "excludeProductIds") {
            config.wol.exclude_product_ids = split_list(v);
        }
        if let Some(v) = get_bool(section, "wol", "shutdownWanted")? {
            config.wol.shutdown_wanted = v;
        }
        if let Some(v) = get_number::<u64>(section, "wol", "startGap")? {
            config.wol.start_gap = Duration::from_secs(v);
        }
    }

    // [backend] section
    if let Some(section) = ini.section(Some("backend")) {
        if let Some(v) = get_string(section, "url") {
            config.backend.url = v;
        }
        config.backend.username = get_string(section, "username");
        config.backend.password = get_string(section, "password");
        config.backend.depot_id = get_string(section, "depotId");
        if let Some(v) = get_bool(section, "backend", "verifyCert")? {
            config.backend.verify_cert = v;
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;
    use std::fs;
    use tempfile::tempdir;

    fn write_config(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join("opsi-package-updater.conf");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_defaults_when_sections_missing() {
        let dir = tempdir().unwrap();
        let path = write_config(dir.path(), "; empty\n");
        let config = UpdaterConfig::load_main(&path).unwrap();

        assert_eq!(config.package_dir, PathBuf::from(DEFAULT_PACKAGE_DIR));
        assert!(config.use_zsync);
        assert!(!config.ignore_errors);
        assert!(config.installation_window.is_none());
        assert!(!config.notification.active);
        assert_eq!(config.backend.url, DEFAULT_BACKEND_URL);
    }

    #[test]
    fn test_load_full_config() {
        let dir = tempdir().unwrap();
        let repo_dir = dir.path().join("repos.d");
        fs::create_dir(&repo_dir).unwrap();
        fs::write(
            repo_dir.join("main.repo"),
            "[repository_main]\nactive = true\nbaseUrl = http://repo.example.org\n",
        )
        .unwrap();

        let path = write_config(
            dir.path(),
            &format!(
                "[general]\npackageDir = /srv/packages\nrepositoryConfigDir = {}\n\
                 useZsync = false\nignoreErrors = true\ntimeout = 10\n\n\
                 [notification]\nactive = true\nsmtpport = 587\nuse_starttls = true\n\
                 receivers = a@example.org, b@example.org\n\n\
                 [installation]\nwindowStart = 22:00\nwindowEnd = 06:00\nexceptProductIds = firefox\n\n\
                 [wol]\nactive = true\nstartGap = 5\n\n\
                 [backend]\ndepotId = depot.example.org\n",
                repo_dir.display()
            ),
        );

        let config = UpdaterConfig::load(&path).unwrap();
        assert_eq!(config.package_dir, PathBuf::from("/srv/packages"));
        assert!(!config.use_zsync);
        assert!(config.ignore_errors);
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert_eq!(config.notification.smtp_port, 587);
        assert!(config.notification.use_starttls);
        assert_eq!(config.notification.receivers.len(), 2);
        assert!(config.wol.active);
        assert_eq!(config.wol.start_gap, Duration::from_secs(5));
        assert_eq!(config.backend.depot_id.as_deref(), Some("depot.example.org"));
        assert_eq!(config.repositories.len(), 1);

        let window = config.installation_window.unwrap();
        assert!(window.contains(NaiveTime::from_hms_opt(23, 0, 0).unwrap()));
        assert!(window.allows("firefox", NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
    }

    #[test]
    fn test_invalid_boolean_is_reported() {
        let dir = tempdir().unwrap();
        let path = write_config(dir.path(), "[general]\nuseZsync = perhaps\n");
        let err = UpdaterConfig::load_main(&path).unwrap_err();
        assert!(err.to_string().contains("useZsync"));
    }

    #[test]
    fn test_apply_install_mode_options() {
        let mut config = UpdaterConfig::default();
        let mut inactive = RepositoryDescriptor::new("Testing", "http://testing");
        inactive.auto_setup = true;
        config.repositories = vec![inactive];

        config.apply_options(RunOptions {
            install_all_available: true,
            repository_name: Some("testing".into()),
            force_repository_activation: true,
            disable_zsync: true,
            ..Default::default()
        });

        let repo = &config.repositories[0];
        assert!(repo.active);
        assert!(repo.auto_install);
        assert!(repo.auto_update);
        assert!(!repo.auto_setup);
        assert!(!config.use_zsync);
    }
}
