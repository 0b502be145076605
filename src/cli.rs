// src/cli.rs
//! CLI definitions for opsi-package-updater
//!
//! This module contains all command-line interface definitions using clap.
//! The actual command implementations are in the `commands` module.
//! `build.rs` renders the man page from an equivalent builder definition.

use clap::{ArgAction, Args, Parser, Subcommand};
use opsi_package_updater::config::{RunOptions, DEFAULT_CONFIG_FILE};
use std::path::PathBuf;

/// Console log level used without `-v` or `--log-level` (warnings)
pub const DEFAULT_LOG_LEVEL: u8 = 4;

#[derive(Parser)]
#[command(name = "opsi-package-updater")]
#[command(version)]
#[command(about = "Updater for local opsi products", long_about = None)]
#[command(after_help = "Modes have their own options that can be viewed with MODE -h.")]
pub struct Cli {
    /// Location of config file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Increase verbosity on console (can be used multiple times)
    #[arg(short, long, action = ArgAction::Count, conflicts_with = "log_level")]
    pub verbose: u8,

    /// Set the desired loglevel for the console (0-9)
    #[arg(short = 'l', long, value_parser = clap::value_parser!(u8).range(0..=9))]
    pub log_level: Option<u8>,

    /// Force the calculation of a checksum for every file
    #[arg(long)]
    pub force_checksum_calculation: bool,

    /// Limit the actions to the given repository
    #[arg(long, value_name = "NAME")]
    pub repo: Option<String>,

    /// Force the activation of an otherwise disabled repository (requires --repo)
    #[arg(long, requires = "repo")]
    pub use_inactive_repository: bool,

    /// Do not use zsync to fetch packages
    #[arg(long)]
    pub no_zsync: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Install all (or a given list of) downloadable packages from configured repositories (ignores excludes)
    Install {
        /// Limit installation to these product ids
        #[arg(value_name = "PRODUCT_ID")]
        product_ids: Vec<String>,
    },

    /// Update already installed packages from repositories
    Update {
        /// Limit updates to these product ids
        #[arg(value_name = "PRODUCT_ID")]
        product_ids: Vec<String>,
    },

    /// Download packages from repositories without installing them
    Download {
        /// Limit downloads to these product ids
        #[arg(value_name = "PRODUCT_ID")]
        product_ids: Vec<String>,

        /// Force the download of a product, even though it might already be present
        #[arg(long)]
        force: bool,
    },

    /// Listing information
    List(ListArgs),
}

/// What `list` shows; at most one may be given
#[derive(Args, Debug, Default)]
#[group(multiple = false)]
pub struct ListArgs {
    /// Lists all repositories
    #[arg(long)]
    pub repos: bool,

    /// Lists all active repositories
    #[arg(long)]
    pub active_repos: bool,

    /// Lists the repositories and the packages they provide
    #[arg(long, visible_alias = "products")]
    pub packages: bool,

    /// Lists the repositories with their provided packages and information about the local installation status
    #[arg(long, visible_alias = "products-and-installationstatus")]
    pub packages_and_installationstatus: bool,

    /// Lists packages where local and remote version are different
    #[arg(long, visible_alias = "product-differences")]
    pub package_differences: bool,

    /// Lists packages that have updates in the remote repositories
    #[arg(long, visible_alias = "updatable-products")]
    pub updatable_packages: bool,

    /// Search for a package with the given name
    #[arg(long, visible_alias = "search-product", value_name = "TEXT")]
    pub search_package: Option<String>,
}

impl Commands {
    pub fn mode(&self) -> &'static str {
        match self {
            Self::Install { .. } => "install",
            Self::Update { .. } => "update",
            Self::Download { .. } => "download",
            Self::List(_) => "list",
        }
    }
}

impl Cli {
    /// opsi console log level (0 none .. 9 secret)
    ///
    /// `list` never shows less than warnings.
    pub fn console_level(&self) -> u8 {
        let level = self
            .log_level
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.saturating_add(self.verbose).min(9));
        match self.command {
            Commands::List(_) => level.max(DEFAULT_LOG_LEVEL),
            _ => level,
        }
    }

    /// Options handed to the configuration
    pub fn run_options(&self) -> RunOptions {
        let (product_ids, force_download) = match &self.command {
            Commands::Install { product_ids } | Commands::Update { product_ids } => {
                (product_ids.clone(), false)
            }
            Commands::Download { product_ids, force } => (product_ids.clone(), *force),
            Commands::List(_) => (Vec::new(), false),
        };

        let mut process_product_ids = product_ids;
        process_product_ids.sort();
        process_product_ids.dedup();

        RunOptions {
            process_product_ids,
            force_checksum_calculation: self.force_checksum_calculation,
            force_download,
            install_all_available: matches!(self.command, Commands::Install { .. }),
            repository_name: self.repo.clone(),
            force_repository_activation: self.use_inactive_repository,
            disable_zsync: self.no_zsync,
        }
    }
}
