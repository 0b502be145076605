// build.rs

use clap::{Arg, ArgAction, ArgGroup, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

/// Common argument: product ids to limit a mode to
fn product_ids_arg(help: &'static str) -> Arg {
    Arg::new("product_ids")
        .value_name("PRODUCT_ID")
        .num_args(0..)
        .help(help)
}

fn flag(name: &'static str, help: &'static str) -> Arg {
    Arg::new(name).long(name).action(ArgAction::SetTrue).help(help)
}

fn build_cli() -> Command {
    Command::new("opsi-package-updater")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Updater for local opsi products")
        .after_help("Modes have their own options that can be viewed with MODE -h.")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("CONFIG")
                .default_value("/etc/opsi/opsi-package-updater.conf")
                .help("Location of config file"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .conflicts_with("log_level")
                .help("Increase verbosity on console (can be used multiple times)"),
        )
        .arg(
            Arg::new("log_level")
                .short('l')
                .long("log-level")
                .value_parser(clap::value_parser!(u8).range(0..=9))
                .help("Set the desired loglevel for the console (0-9)"),
        )
        .arg(flag(
            "force-checksum-calculation",
            "Force the calculation of a checksum for every file",
        ))
        .arg(
            Arg::new("repo")
                .long("repo")
                .value_name("NAME")
                .help("Limit the actions to the given repository"),
        )
        .arg(
            flag(
                "use-inactive-repository",
                "Force the activation of an otherwise disabled repository (requires --repo)",
            )
            .requires("repo"),
        )
        .arg(flag("no-zsync", "Do not use zsync to fetch packages"))
        .subcommand(
            Command::new("install")
                .about("Install all (or a given list of) downloadable packages from configured repositories (ignores excludes)")
                .arg(product_ids_arg("Limit installation to these product ids")),
        )
        .subcommand(
            Command::new("update")
                .about("Update already installed packages from repositories")
                .arg(product_ids_arg("Limit updates to these product ids")),
        )
        .subcommand(
            Command::new("download")
                .about("Download packages from repositories without installing them")
                .arg(product_ids_arg("Limit downloads to these product ids"))
                .arg(flag(
                    "force",
                    "Force the download of a product, even though it might already be present",
                )),
        )
        .subcommand(
            Command::new("list")
                .about("Listing information")
                .arg(flag("repos", "Lists all repositories"))
                .arg(flag("active-repos", "Lists all active repositories"))
                .arg(
                    flag("packages", "Lists the repositories and the packages they provide")
                        .visible_alias("products"),
                )
                .arg(
                    flag(
                        "packages-and-installationstatus",
                        "Lists the repositories with their provided packages and information about the local installation status",
                    )
                    .visible_alias("products-and-installationstatus"),
                )
                .arg(
                    flag(
                        "package-differences",
                        "Lists packages where local and remote version are different",
                    )
                    .visible_alias("product-differences"),
                )
                .arg(
                    flag(
                        "updatable-packages",
                        "Lists packages that have updates in the remote repositories",
                    )
                    .visible_alias("updatable-products"),
                )
                .arg(
                    Arg::new("search-package")
                        .long("search-package")
                        .visible_alias("search-product")
                        .value_name("TEXT")
                        .help("Search for a package with the given name"),
                )
                .group(
                    ArgGroup::new("listing")
                        .args([
                            "repos",
                            "active-repos",
                            "packages",
                            "packages-and-installationstatus",
                            "package-differences",
                            "updatable-packages",
                            "search-package",
                        ])
                        .multiple(false),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Create man directory - use CARGO_MANIFEST_DIR which is always set by cargo
    let manifest_dir = match env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(e) => {
            println!("cargo:warning=CARGO_MANIFEST_DIR not set: {}", e);
            return;
        }
    };
    let man_dir = manifest_dir.join("man");

    if let Err(e) = fs::create_dir_all(&man_dir) {
        println!("cargo:warning=Failed to create man directory: {}", e);
        return;
    }

    let man = Man::new(build_cli());
    let mut buffer = Vec::new();

    if let Err(e) = man.render(&mut buffer) {
        println!("cargo:warning=Failed to render man page: {}", e);
        return;
    }

    let man_path = man_dir.join("opsi-package-updater.1");
    if let Err(e) = fs::write(&man_path, buffer) {
        println!("cargo:warning=Failed to write man page: {}", e);
    }
}
