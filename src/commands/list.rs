// src/commands/list.rs
//! Listing commands

use crate::cli::ListArgs;
use anyhow::Result;
use opsi_package_updater::{
    Error, InstalledProduct, PackageRecord, PackageUpdater, RepositoryDescriptor, Update,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Dispatch `list` to the selected listing
pub fn cmd_list(updater: &mut PackageUpdater, args: &ListArgs) -> Result<()> {
    if args.active_repos {
        info!("Active repositories:");
        for line in repository_lines(updater.active_repositories(), false) {
            println!("{line}");
        }
    } else if args.repos {
        info!("All repositories:");
        for line in repository_lines(updater.repositories(), true) {
            println!("{line}");
        }
    } else if args.packages {
        list_packages(updater, false, None)?;
    } else if args.packages_and_installationstatus {
        list_packages(updater, true, None)?;
    } else if args.updatable_packages {
        list_updatable(updater)?;
    } else if args.package_differences {
        list_differences(updater)?;
    } else if let Some(search) = &args.search_package {
        list_packages(updater, false, Some(search))?;
    } else {
        warn!("Nothing to list, see 'list --help'");
    }
    Ok(())
}

/// One line per repository, sorted by name
fn repository_lines(mut repos: Vec<Arc<RepositoryDescriptor>>, with_status: bool) -> Vec<String> {
    repos.sort_by_key(|repo| repo.name.to_lowercase());
    repos
        .iter()
        .map(|repo| {
            let mut line = if with_status {
                let status = if repo.active { "active" } else { "inactive" };
                format!("{} ({}): {}", repo.name, status, repo.base_url)
            } else {
                format!("{}: {}", repo.name, repo.base_url)
            };
            if !repo.description.is_empty() {
                line.push_str(&format!(" - {}", repo.description));
            }
            line
        })
        .collect()
}

fn installed_by_id(installed: Vec<InstalledProduct>) -> HashMap<String, InstalledProduct> {
    installed
        .into_iter()
        .map(|product| (product.product_id.clone(), product))
        .collect()
}

/// `\t<id> (Version <v>[, <installation status>])`
fn package_line(package: &PackageRecord, installed: Option<&HashMap<String, InstalledProduct>>) -> String {
    let Some(installed) = installed else {
        return format!("\t{} (Version {})", package.product_id, package.version);
    };
    match installed.get(&package.product_id) {
        None => format!("\t{} (Version {}, not installed)", package.product_id, package.version),
        Some(product) if product.version() == package.version => {
            format!("\t{} (Version {}, installed)", package.product_id, package.version)
        }
        Some(product) => format!(
            "\t{} (Version {}, installed {})",
            package.product_id,
            package.version,
            product.version()
        ),
    }
}

fn list_packages(updater: &mut PackageUpdater, with_status: bool, search: Option<&str>) -> Result<()> {
    let installed = if with_status {
        Some(installed_by_id(updater.installed_products()?))
    } else {
        None
    };
    let search = search.map(|s| s.trim().to_lowercase());

    for repo in updater.active_repositories() {
        println!("Packages in {}:", repo.name);
        let mut packages = updater.repository_packages(&repo);
        if let Some(search) = &search {
            debug!("Filtering for product IDs matching {}...", search);
            packages.retain(|p| p.product_id.contains(search.as_str()));
        }
        for package in &packages {
            println!("{}", package_line(package, installed.as_ref()));
        }
    }
    Ok(())
}

fn list_differences(updater: &mut PackageUpdater) -> Result<()> {
    let installed = installed_by_id(updater.installed_products()?);

    for repo in updater.active_repositories() {
        let mut header_shown = false;
        for package in updater.repository_packages(&repo) {
            let Some(product) = installed.get(&package.product_id) else {
                continue;
            };
            if product.version() == package.version {
                continue;
            }
            if !header_shown {
                println!("Packages in {}:", repo.name);
                header_shown = true;
            }
            println!("{}", package_line(&package, Some(&installed)));
        }
    }
    Ok(())
}

fn update_line(update: &Update) -> String {
    format!(
        "{}: {} in {} (updatable from: {})",
        update.product_id, update.new_version, update.repository, update.old_version
    )
}

fn list_updatable(updater: &mut PackageUpdater) -> Result<()> {
    let updates = match updater.updatable_packages() {
        Ok(updates) => updates,
        Err(Error::NoActiveRepository) => {
            warn!("No repositories configured, nothing to do");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    if updates.is_empty() {
        println!("No updates found.");
    }
    for update in &updates {
        println!("{}", update_line(update));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsi_package_updater::ProductVersion;

    fn repo(name: &str, active: bool, description: &str) -> Arc<RepositoryDescriptor> {
        let mut repo = RepositoryDescriptor::new(name, format!("https://{name}.example.org/repo"));
        repo.active = active;
        repo.description = description.to_string();
        Arc::new(repo)
    }

    #[test]
    fn test_repository_lines() {
        let repos = vec![repo("uib_windows", true, "Windows products"), repo("Experimental", false, "")];
        assert_eq!(
            repository_lines(repos.clone(), true),
            vec![
                "Experimental (inactive): https://Experimental.example.org/repo".to_string(),
                "uib_windows (active): https://uib_windows.example.org/repo - Windows products".to_string(),
            ]
        );
        assert_eq!(
            repository_lines(repos, false)[1],
            "uib_windows: https://uib_windows.example.org/repo - Windows products"
        );
    }

    #[test]
    fn test_package_line_with_status() {
        let r = repo("uib", true, "");
        let package = PackageRecord {
            product_id: "hwaudit".into(),
            version: ProductVersion::parse("4.2.0.0-1").unwrap(),
            package_url: format!("{}/hwaudit_4.2.0.0-1.opsi", r.base_url),
            filename: "hwaudit_4.2.0.0-1.opsi".into(),
            md5sum: None,
            zsync_url: None,
            repository: r,
        };
        assert_eq!(package_line(&package, None), "\thwaudit (Version 4.2.0.0-1)");

        let mut installed = HashMap::new();
        assert_eq!(
            package_line(&package, Some(&installed)),
            "\thwaudit (Version 4.2.0.0-1, not installed)"
        );

        installed.insert(
            "hwaudit".to_string(),
            InstalledProduct {
                product_id: "hwaudit".into(),
                product_version: "4.1.0.0".into(),
                package_version: "3".into(),
                depot_id: "depot.example.org".into(),
            },
        );
        assert_eq!(
            package_line(&package, Some(&installed)),
            "\thwaudit (Version 4.2.0.0-1, installed 4.1.0.0-3)"
        );
    }

    #[test]
    fn test_update_line() {
        let update = Update {
            product_id: "swaudit".into(),
            new_version: ProductVersion::parse("4.3-1").unwrap(),
            old_version: ProductVersion::parse("4.2-5").unwrap(),
            repository: "uib_windows".into(),
        };
        assert_eq!(update_line(&update), "swaudit: 4.3-1 in uib_windows (updatable from: 4.2-5)");
    }
}
