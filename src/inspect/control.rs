// src/inspect/control.rs

//! Package control data
//!
//! Two formats exist: the line based `control` file
//!
//! ```text
//! [Package]
//! version: 1
//! depends: opsi-script (>= 4.12), hwaudit
//!
//! [Product]
//! id: swaudit
//! version: 4.2.0.0
//! ```
//!
//! and `control.toml` with the same sections. Only the fields needed for
//! install ordering are read.

use crate::error::{Error, Result};
use serde::Deserialize;

/// Product identity and package dependencies
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageControl {
    pub product_id: String,
    pub product_version: String,
    pub package_version: String,
    /// Product ids this package requires on the depot
    pub dependencies: Vec<String>,
}

/// Product id part of a dependency like `opsi-script (>= 4.12)`
fn dependency_name(spec: &str) -> Option<String> {
    let end = spec
        .find(|c: char| c == '(' || c == '<' || c == '>' || c == '=' || c.is_whitespace())
        .unwrap_or(spec.len());
    let name = spec[..end].trim();
    (!name.is_empty()).then(|| name.to_lowercase())
}

/// Parse the line based `control` format
pub fn parse_control(text: &str) -> Result<PackageControl> {
    let mut control = PackageControl::default();
    let mut section = String::new();
    let mut last_key: Option<String> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with(';') || trimmed.starts_with('#') {
            continue;
        }
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            section = trimmed[1..trimmed.len() - 1].trim().to_lowercase();
            last_key = None;
            continue;
        }

        // Continuation lines only matter for multi-line descriptions
        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        if line.starts_with(char::is_whitespace) && last_key.is_some() {
            continue;
        }
        let key = key.trim().to_lowercase();
        let value = value.trim();

        match (section.as_str(), key.as_str()) {
            ("package", "version") => control.package_version = value.to_string(),
            ("package", "depends") => {
                control
                    .dependencies
                    .extend(value.split(',').filter_map(dependency_name));
            }
            ("product", "id") => control.product_id = value.to_lowercase(),
            ("product", "version") => control.product_version = value.to_string(),
            _ => {}
        }
        last_key = Some(key);
    }

    if control.product_id.is_empty() {
        return Err(Error::ParseError("control file without product id".into()));
    }
    Ok(control)
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TomlDependency {
    Name(String),
    Table { package: String },
}

#[derive(Debug, Default, Deserialize)]
struct TomlPackage {
    #[serde(default)]
    version: Option<toml::Value>,
    #[serde(default)]
    depends: Vec<TomlDependency>,
}

#[derive(Debug, Deserialize)]
struct TomlProduct {
    id: String,
    #[serde(default)]
    version: Option<toml::Value>,
}

#[derive(Debug, Deserialize)]
struct TomlControl {
    #[serde(rename = "Package", default)]
    package: TomlPackage,
    #[serde(rename = "Product")]
    product: TomlProduct,
}

fn toml_version(value: Option<toml::Value>) -> String {
    match value {
        Some(toml::Value::String(s)) => s,
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

/// Parse `control.toml`
pub fn parse_control_toml(text: &str) -> Result<PackageControl> {
    let parsed: TomlControl =
        toml::from_str(text).map_err(|e| Error::ParseError(format!("Invalid control.toml: {e}")))?;

    let dependencies = parsed
        .package
        .depends
        .into_iter()
        .filter_map(|dep| match dep {
            TomlDependency::Name(spec) => dependency_name(&spec),
            TomlDependency::Table { package } => dependency_name(&package),
        })
        .collect();

    Ok(PackageControl {
        product_id: parsed.product.id.to_lowercase(),
        product_version: toml_version(parsed.product.version),
        package_version: toml_version(parsed.package.version),
        dependencies,
    })
}
