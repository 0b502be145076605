// src/updater.rs

//! Updater run
//!
//! [`PackageUpdater`] ties discovery, version policy, transfer and the
//! depot service together:
//!
//! - `get_packages` discovers the newest package of every product on the
//!   active repositories and brings the ones that need installing (or all
//!   of them in download mode) into the package directory
//! - `process_updates` installs those packages in dependency order,
//!   honouring the installation window, then requests `setup` on clients
//!   that have the product installed and wakes them if configured
//! - `download_packages` only fills the package directory
//!
//! Errors that are not fatal to the run are collected in
//! [`PackageUpdater::errors`]; the binary turns a non-empty list into a
//! distinct exit code.

use crate::backend::{Backend, InstalledProduct, ProductInfo, PropertyDefaults};
use crate::config::{RepositoryDescriptor, UpdaterConfig};
use crate::error::{Error, Result};
use crate::inspect::{OpsiPackageInspector, PackageInspector};
use crate::notify::Notifier;
use crate::policy::{
    filter_products, is_download_needed, is_install_needed, only_newest_packages,
    repair_dependency_order,
};
use crate::repository::{HttpSession, PackageRecord, RepositoryScanner, SessionSettings};
use crate::transfer::{find_local_package, scan_local_packages, LocalPackage, TransferEngine};
use crate::version::ProductVersion;
use chrono::{Local, NaiveTime};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

/// Products belonging to opsi extension modules never get auto setup
const MODULE_PRODUCT_PREFIXES: &[&str] = &[
    "opsi-local-image-",
    "opsi-uefi-",
    "opsi-vhd-",
    "opsi-wim-",
    "windows10-upgrade",
    "opsi-auto-update",
    "windomain",
];

/// Product switched to `setup` before waking a client when configured
const SHUTDOWN_PRODUCT: &str = "shutdownwanted";

const SETUP_ACTION: &str = "setup";

/// An installed product with a newer version on a repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    pub product_id: String,
    pub new_version: ProductVersion,
    pub old_version: ProductVersion,
    pub repository: String,
}

type Clock = Box<dyn Fn() -> NaiveTime + Send + Sync>;

/// Runs install, update and download passes for one depot
pub struct PackageUpdater {
    config: UpdaterConfig,
    depot_id: String,
    backend: Arc<dyn Backend>,
    repositories: Vec<Arc<RepositoryDescriptor>>,
    scanner: RepositoryScanner,
    transfer: TransferEngine,
    inspector: Box<dyn PackageInspector>,
    clock: Clock,
    errors: Vec<Error>,
}

impl PackageUpdater {
    /// Create an updater for the depot named in `[backend] depotId`, or
    /// for this host when none is configured
    pub fn new(config: UpdaterConfig, backend: Arc<dyn Backend>) -> Result<Self> {
        let depot_id = resolve_depot_id(&config)?;
        debug!("Running for depot '{}'", depot_id);

        let settings = SessionSettings {
            user_agent: config.user_agent.clone(),
            timeout: config.timeout,
            proxy: config.proxy.clone(),
        };
        let repositories = config.repositories.iter().cloned().map(Arc::new).collect();
        let transfer = TransferEngine::new(&config.package_dir, config.use_zsync);

        Ok(Self {
            depot_id,
            backend,
            repositories,
            scanner: RepositoryScanner::new(settings),
            transfer,
            inspector: Box::new(OpsiPackageInspector),
            clock: Box::new(|| Local::now().time()),
            errors: Vec::new(),
            config,
        })
    }

    pub fn with_transfer(mut self, transfer: TransferEngine) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn with_inspector(mut self, inspector: impl PackageInspector + 'static) -> Self {
        self.inspector = Box::new(inspector);
        self
    }

    /// Override the time of day used for the installation window
    pub fn with_clock(mut self, clock: impl Fn() -> NaiveTime + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    pub fn depot_id(&self) -> &str {
        &self.depot_id
    }

    /// Errors recorded during the run that did not abort it
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// Configured repositories, restricted to `--repo` when given
    pub fn repositories(&self) -> Vec<Arc<RepositoryDescriptor>> {
        let name = self.config.options.repository_name.as_deref();
        self.repositories
            .iter()
            .filter(|repo| name.is_none_or(|name| repo.matches_name(name)))
            .cloned()
            .collect()
    }

    pub fn active_repositories(&self) -> Vec<Arc<RepositoryDescriptor>> {
        self.repositories()
            .into_iter()
            .filter(|repo| repo.active)
            .collect()
    }

    pub fn installed_products(&self) -> Result<Vec<InstalledProduct>> {
        info!("Getting installed products");
        let products = self.backend.installed_products(&self.depot_id)?;
        for product in &products {
            info!("Found installed product '{}_{}'", product.product_id, product.version());
        }
        Ok(products)
    }

    /// Packages of one repository sorted by product id
    pub fn repository_packages(&mut self, repo: &Arc<RepositoryDescriptor>) -> Vec<PackageRecord> {
        let discovery = self.scanner.scan(repo);
        self.errors.extend(discovery.errors);
        let mut packages = discovery.packages;
        packages.sort_by(|a, b| a.product_id.cmp(&b.product_id));
        packages
    }

    /// Newest available packages of all active repositories, grouped by
    /// repository in configuration order
    fn new_packages_per_repository(
        &mut self,
    ) -> Result<Vec<(Arc<RepositoryDescriptor>, Vec<PackageRecord>)>> {
        let repos = self.active_repositories();
        let discovery = self.scanner.scan_all(&repos);
        self.errors.extend(discovery.errors);

        let packages = filter_products(
            only_newest_packages(discovery.packages),
            &self.config.options.process_product_ids,
        )?;

        let mut grouped: Vec<(Arc<RepositoryDescriptor>, Vec<PackageRecord>)> = Vec::new();
        for package in packages {
            match grouped
                .iter_mut()
                .find(|(repo, _)| Arc::ptr_eq(repo, &package.repository))
            {
                Some((_, list)) => list.push(package),
                None => grouped.push((Arc::clone(&package.repository), vec![package])),
            }
        }
        Ok(grouped)
    }

    /// Products with a newer version on an active repository
    pub fn updatable_packages(&mut self) -> Result<Vec<Update>> {
        if self.active_repositories().is_empty() {
            return Err(Error::NoActiveRepository);
        }

        let installed = self.installed_products()?;
        let mut updates = Vec::new();
        for (_, packages) in self.new_packages_per_repository()? {
            for available in packages {
                let Some(product) = installed.iter().find(|p| p.product_id == available.product_id) else {
                    continue;
                };
                debug!(
                    "Available product version is '{}', installed product version is '{}'",
                    available.version,
                    product.version()
                );
                if available.version > product.version() {
                    updates.push(Update {
                        product_id: available.product_id.clone(),
                        new_version: available.version.clone(),
                        old_version: product.version(),
                        repository: available.repository.name.clone(),
                    });
                }
            }
        }
        updates.sort_by(|a, b| a.product_id.cmp(&b.product_id));
        Ok(updates)
    }

    /// Bring every package that should be installed into the package
    /// directory; with `all_packages` every available package
    ///
    /// Returns the packages now present in their advertised version.
    pub fn get_packages(&mut self, notifier: &mut Notifier, all_packages: bool) -> Result<Vec<PackageRecord>> {
        let installed = self.installed_products()?;
        fs::create_dir_all(&self.config.package_dir).map_err(|e| {
            Error::IoError(format!(
                "Failed to create package directory {}: {e}",
                self.config.package_dir.display()
            ))
        })?;
        let local = scan_local_packages(
            &self.config.package_dir,
            self.config.options.force_checksum_calculation,
        )?;

        let per_repository = self.new_packages_per_repository()?;
        let mut new_packages = Vec::new();
        if per_repository.iter().all(|(_, packages)| packages.is_empty()) {
            warn!("No downloadable packages found");
            return Ok(new_packages);
        }

        for (repo, packages) in per_repository {
            debug!("Processing downloadable packages on repository {}", repo.name);
            let session = HttpSession::for_repository(&repo, self.scanner.settings())?;
            for available in packages {
                match self.get_package(&session, &available, &installed, &local, all_packages, notifier) {
                    Ok(true) => new_packages.push(available),
                    Ok(false) => {}
                    Err(e) if self.config.ignore_errors => {
                        error!("Ignoring Error for package {}: {}", available.product_id, e);
                        notifier.append_line(format!(
                            "Ignoring Error for package {}: {}",
                            available.product_id, e
                        ));
                        self.errors.push(e);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(new_packages)
    }

    /// Returns whether the package belongs to the run's new packages
    fn get_package(
        &self,
        session: &HttpSession,
        available: &PackageRecord,
        installed: &[InstalledProduct],
        local: &[LocalPackage],
        all_packages: bool,
        notifier: &mut Notifier,
    ) -> Result<bool> {
        info!("Testing if download/installation of package '{}' is needed", available.filename);
        let product = installed.iter().find(|p| p.product_id == available.product_id);
        if !all_packages && !is_install_needed(available, product) {
            return Ok(false);
        }

        let local = find_local_package(local, &available.product_id);
        if is_download_needed(local, available, self.config.options.force_download)? {
            let outcome = self.transfer.fetch(session, available, local)?;
            for note in outcome.notes {
                notifier.append_line(note);
            }
        } else {
            self.transfer.cleanup(available)?;
        }
        Ok(true)
    }

    /// Download and install new packages (`install` / `update` modes)
    pub fn process_updates(&mut self) -> Result<()> {
        if self.active_repositories().is_empty() {
            warn!("No repositories configured, nothing to do");
            return Ok(());
        }

        let mut notifier = Notifier::from_config(&self.config.notification);
        let result = self.run_updates(&mut notifier);
        self.finish(&mut notifier, result)
    }

    /// Only download new packages (`download` mode)
    pub fn download_packages(&mut self) -> Result<()> {
        if self.active_repositories().is_empty() {
            warn!("No repositories configured, nothing to do");
            return Ok(());
        }

        let mut notifier = Notifier::from_config(&self.config.notification);
        let result = self.get_packages(&mut notifier, true).map(|packages| {
            if packages.is_empty() {
                info!("No new packages downloaded");
            }
        });
        self.finish(&mut notifier, result)
    }

    fn finish(&mut self, notifier: &mut Notifier, result: Result<()>) -> Result<()> {
        if let Err(e) = &result {
            notifier.append_line(format!("Error occurred: {e}"));
            notifier.set_failed();
        }
        if notifier.has_message() {
            if let Err(e) = notifier.notify() {
                error!("{}", e);
                self.errors.push(e);
            }
        }
        result
    }

    fn run_updates(&mut self, notifier: &mut Notifier) -> Result<()> {
        let new_packages = self.get_packages(notifier, false)?;
        if new_packages.is_empty() {
            info!("No new packages available");
            return Ok(());
        }

        let mut ids: Vec<&str> = new_packages.iter().map(|p| p.product_id.as_str()).collect();
        ids.sort_unstable();
        info!("New packages available: {}", ids.join(", "));

        let ordered = self.install_sequence(&new_packages);
        let mut installed: Vec<(&PackageRecord, ProductInfo)> = Vec::new();
        for package in ordered {
            let path = self.config.package_dir.join(&package.filename);
            if package.repository.only_download {
                debug!(
                    "Download only is set for repository, not installing package '{}'",
                    path.display()
                );
                continue;
            }

            match self.install(package, &path) {
                Ok(product) => {
                    let message = format!("Package '{}' successfully installed", path.display());
                    info!("{}", message);
                    notifier.append_line(message);
                    installed.push((package, product));
                }
                Err(e) if self.config.ignore_errors => {
                    error!("Ignoring error for package {}: {}", package.product_id, e);
                    notifier.append_line(format!("Ignoring error for package {}: {}", package.product_id, e));
                    self.errors.push(e);
                }
                Err(e) => return Err(e),
            }
        }

        if installed.is_empty() {
            info!("No new packages installed");
            return Ok(());
        }

        debug!("Marking product cache outdated for depot {}", self.depot_id);
        self.backend.mark_product_cache_outdated(&self.depot_id)?;

        let shutdown_available = self.config.wol.active
            && self.config.wol.shutdown_wanted
            && self.shutdown_product_available();

        let mut wake_clients: BTreeSet<String> = BTreeSet::new();
        for (package, product) in &installed {
            if !product.has_setup_script || !auto_setup_allowed(package, product) {
                continue;
            }

            let clients = self.backend.clients_for_depot(&self.depot_id)?;
            if clients.is_empty() {
                continue;
            }
            let mut targets = self
                .backend
                .clients_with_product_installed(&package.product_id, &clients)?;
            if targets.is_empty() {
                continue;
            }
            targets.sort();

            let wake = self.config.wol.active
                && !self.config.wol.exclude_product_ids.contains(&package.product_id);
            for client in &targets {
                self.backend
                    .set_product_action_request(&package.product_id, client, SETUP_ACTION)?;
                if wake {
                    wake_clients.insert(client.clone());
                }
            }
            notifier.append_line(format!(
                "Product {} set to 'setup' on clients: {}",
                package.product_id,
                targets.join(", ")
            ));
        }

        if !wake_clients.is_empty() {
            self.power_on(&wake_clients, shutdown_available, notifier);
        }
        Ok(())
    }

    /// Packages allowed by the installation window, dependencies first
    fn install_sequence<'a>(&self, new_packages: &'a [PackageRecord]) -> Vec<&'a PackageRecord> {
        let now = (self.clock)();
        let sequence: Vec<String> = match &self.config.installation_window {
            None => {
                info!("Installation time window is not defined, installing products and setting actions");
                new_packages.iter().map(|p| p.product_id.clone()).collect()
            }
            Some(window) if window.contains(now) => {
                info!("Running inside installation time window {}, installing products and setting actions", window);
                new_packages.iter().map(|p| p.product_id.clone()).collect()
            }
            Some(window) => {
                info!(
                    "Running outside installation time window {}, not installing products except product ids {}",
                    window,
                    window.exceptions.iter().cloned().collect::<Vec<_>>().join(", ")
                );
                new_packages
                    .iter()
                    .filter(|p| window.allows(&p.product_id, now))
                    .map(|p| p.product_id.clone())
                    .collect()
            }
        };

        let package_dir = &self.config.package_dir;
        let sequence = repair_dependency_order(&sequence, |product_id| {
            let Some(package) = new_packages.iter().find(|p| p.product_id == product_id) else {
                return Vec::new();
            };
            let path = package_dir.join(&package.filename);
            self.inspector.dependencies(&path).unwrap_or_else(|e| {
                debug!("Not ordering dependencies of '{}': {}", path.display(), e);
                Vec::new()
            })
        });

        sequence
            .iter()
            .filter(|id| {
                let allowed = self
                    .config
                    .installation_window
                    .as_ref()
                    .is_none_or(|window| window.allows(id, now));
                if !allowed {
                    info!("Not installing dependency '{}' outside of the installation time window", id);
                }
                allowed
            })
            .filter_map(|id| new_packages.iter().find(|p| p.product_id == **id))
            .collect()
    }

    fn install(&self, package: &PackageRecord, path: &Path) -> Result<ProductInfo> {
        let defaults = self.property_defaults(package);
        info!("Installing package '{}'", path.display());
        self.backend
            .install_package(path, &defaults, self.config.temp_dir.as_deref())?;

        self.backend
            .product_info(&self.depot_id, &package.product_id)?
            .ok_or_else(|| {
                Error::NotFoundError(format!(
                    "Product '{}' not found on depot '{}' after installation",
                    package.product_id, self.depot_id
                ))
            })
    }

    /// Property defaults of the peer depot when inheriting, else of this
    /// depot; failures fall back to the package's own defaults
    fn property_defaults(&self, package: &PackageRecord) -> PropertyDefaults {
        let repo = &package.repository;
        let object_id = match (&repo.opsi_depot_id, repo.inherit_product_properties) {
            (Some(peer), true) => {
                info!("Trying to get product property defaults from repository");
                peer.as_str()
            }
            _ => self.depot_id.as_str(),
        };

        match self.backend.product_property_defaults(&package.product_id, object_id) {
            Ok(defaults) => {
                info!("Using product property defaults: {:?}", defaults.0);
                defaults
            }
            Err(e) => {
                warn!("Failed to get product property defaults: {}", e);
                PropertyDefaults::default()
            }
        }
    }

    fn shutdown_product_available(&self) -> bool {
        match self.backend.product_info(&self.depot_id, SHUTDOWN_PRODUCT) {
            Ok(Some(_)) => {
                info!("Found '{}' product on depot '{}'", SHUTDOWN_PRODUCT, self.depot_id);
                true
            }
            Ok(None) => {
                error!("Product '{}' not available on depot '{}'", SHUTDOWN_PRODUCT, self.depot_id);
                false
            }
            Err(e) => {
                error!("Failed to look up product '{}': {}", SHUTDOWN_PRODUCT, e);
                false
            }
        }
    }

    fn power_on(&self, clients: &BTreeSet<String>, shutdown_wanted: bool, notifier: &mut Notifier) {
        let names: Vec<&str> = clients.iter().map(String::as_str).collect();
        info!("Powering on clients {}", names.join(", "));
        notifier.append_line(format!("Powering on clients: {}", names.join(", ")));

        for client in clients {
            info!("Powering on client '{}'", client);
            let result = (|| -> Result<()> {
                if shutdown_wanted {
                    info!("Setting {} to 'setup' for client '{}'", SHUTDOWN_PRODUCT, client);
                    self.backend
                        .set_product_action_request(SHUTDOWN_PRODUCT, client, SETUP_ACTION)?;
                }
                self.backend.power_on_hosts(std::slice::from_ref(client))
            })();
            match result {
                Ok(()) => thread::sleep(self.config.wol.start_gap),
                Err(e) => error!("Failed to power on client '{}': {}", client, e),
            }
        }
    }
}

/// Whether `setup` may be requested for an installed package
fn auto_setup_allowed(package: &PackageRecord, product: &ProductInfo) -> bool {
    let repo = &package.repository;
    let product_id = &package.product_id;

    if !repo.auto_setup {
        info!(
            "Not setting action 'setup' for product '{}' because auto setup is not set for repository '{}'",
            product_id, repo.name
        );
        return false;
    }
    if product.is_netboot() {
        info!(
            "Not setting action 'setup' for product '{}' because auto setup is not allowed for netboot products",
            product_id
        );
        return false;
    }
    if MODULE_PRODUCT_PREFIXES.iter().any(|prefix| product_id.starts_with(prefix)) {
        info!(
            "Not setting action 'setup' for product '{}' because auto setup is not allowed for opsi module products",
            product_id
        );
        return false;
    }
    if repo.auto_setup_excludes.iter().any(|re| re.is_match(product_id)) {
        info!(
            "Not setting action 'setup' for product '{}' because it's excluded by regular expression",
            product_id
        );
        return false;
    }

    info!(
        "Setting action 'setup' for product '{}' because auto setup is set for repository '{}'",
        product_id, repo.name
    );
    true
}

/// `[backend] depotId`, else the host name of this machine
fn resolve_depot_id(config: &UpdaterConfig) -> Result<String> {
    if let Some(depot_id) = config.backend.depot_id.as_deref().filter(|id| !id.is_empty()) {
        return Ok(depot_id.to_lowercase());
    }
    let hostname = fs::read_to_string("/etc/hostname").unwrap_or_default();
    let hostname = hostname.trim();
    if hostname.is_empty() {
        return Err(Error::ConfigError(
            "No depot id configured and host name unknown, set [backend] depotId".into(),
        ));
    }
    Ok(hostname.to_lowercase())
}
