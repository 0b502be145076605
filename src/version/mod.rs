// src/version/mod.rs

//! Version handling for opsi products
//!
//! An opsi package version is the composite `productVersion-packageVersion`,
//! e.g. `4.2.0.0-1`. Both halves are compared component-wise: numeric runs
//! numerically, alphabetic runs lexically, and a missing component sorts
//! lower than any present one (`1.0 < 1.0.1`, `1.0 < 1.0a`).

use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::fmt;

/// A single comparable piece of a version string
#[derive(Debug, Clone, PartialEq, Eq)]
enum Component<'a> {
    Numeric(&'a str),
    Alpha(&'a str),
}

impl Component<'_> {
    fn compare(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Numeric(a), Self::Numeric(b)) => compare_numeric(a, b),
            (Self::Alpha(a), Self::Alpha(b)) => a.cmp(b),
            // Letters mark pre-releases and similar, they sort below numbers
            (Self::Alpha(_), Self::Numeric(_)) => Ordering::Less,
            (Self::Numeric(_), Self::Alpha(_)) => Ordering::Greater,
        }
    }
}

/// Compare two digit runs without overflowing on very long numbers
fn compare_numeric(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// Split a version half into digit and letter runs, dropping separators
fn components(s: &str) -> Vec<Component<'_>> {
    let mut result = Vec::new();
    let bytes = s.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let start = i;
        if bytes[i].is_ascii_digit() {
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            result.push(Component::Numeric(&s[start..i]));
        } else if bytes[i].is_ascii_alphabetic() {
            while i < bytes.len() && bytes[i].is_ascii_alphabetic() {
                i += 1;
            }
            result.push(Component::Alpha(&s[start..i]));
        } else {
            i += 1;
        }
    }

    result
}

/// Compare two version halves component by component
pub fn compare_version_part(a: &str, b: &str) -> Ordering {
    let left = components(a);
    let right = components(b);

    for (l, r) in left.iter().zip(right.iter()) {
        match l.compare(r) {
            Ordering::Equal => {}
            ord => return ord,
        }
    }

    left.len().cmp(&right.len())
}

/// A parsed `productVersion-packageVersion` pair
#[derive(Debug, Clone)]
pub struct ProductVersion {
    pub product_version: String,
    pub package_version: String,
}

impl ProductVersion {
    pub fn new(product_version: impl Into<String>, package_version: impl Into<String>) -> Self {
        Self {
            product_version: product_version.into(),
            package_version: package_version.into(),
        }
    }

    /// Parse a composite version, splitting on the last `-`
    ///
    /// Examples:
    /// - "4.2.0.0-1" → product "4.2.0.0", package "1"
    /// - "2023-05-3" → product "2023-05", package "3"
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let (product, package) = s
            .rsplit_once('-')
            .ok_or_else(|| Error::ParseError(format!("Version '{s}' has no package version")))?;

        if product.is_empty() || package.is_empty() {
            return Err(Error::ParseError(format!(
                "Empty version component in '{s}'"
            )));
        }

        Ok(Self::new(product, package))
    }

    /// Compare two versions
    pub fn compare(&self, other: &ProductVersion) -> Ordering {
        compare_version_part(&self.product_version, &other.product_version)
            .then_with(|| compare_version_part(&self.package_version, &other.package_version))
    }
}

impl fmt::Display for ProductVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.product_version, self.package_version)
    }
}

impl PartialEq for ProductVersion {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Eq for ProductVersion {}

impl Ord for ProductVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl PartialOrd for ProductVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::str::FromStr for ProductVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> ProductVersion {
        ProductVersion::parse(s).unwrap()
    }

    #[test]
    fn test_parse_simple() {
        let version = v("4.2.0.0-1");
        assert_eq!(version.product_version, "4.2.0.0");
        assert_eq!(version.package_version, "1");
        assert_eq!(version.to_string(), "4.2.0.0-1");
    }

    #[test]
    fn test_parse_splits_on_last_dash() {
        let version = v("2023-05-3");
        assert_eq!(version.product_version, "2023-05");
        assert_eq!(version.package_version, "3");
    }

    #[test]
    fn test_parse_rejects_incomplete() {
        assert!(ProductVersion::parse("4.2.0.0").is_err());
        assert!(ProductVersion::parse("-1").is_err());
        assert!(ProductVersion::parse("4.2-").is_err());
    }

    #[test]
    fn test_compare_product_versions() {
        assert!(v("4.2.0.0-1") > v("4.1.0.0-1"));
        assert!(v("4.10.0-1") > v("4.9.0-1"));
        assert!(v("1.0-1") < v("1.0.1-1"));
        assert!(v("1.0-10") > v("1.0-9"));
    }

    #[test]
    fn test_compare_package_version_only_when_product_equal() {
        assert!(v("2.0-1") > v("1.9-99"));
        assert!(v("2.0-2") > v("2.0-1"));
    }

    #[test]
    fn test_compare_alphanumeric() {
        assert!(v("1.0a-1") > v("1.0-1"));
        assert!(v("1.0b-1") > v("1.0a-1"));
        assert!(v("1.0.beta-1") < v("1.0.1-1"));
    }

    #[test]
    fn test_leading_zeros_are_equal() {
        assert_eq!(v("1.01-1"), v("1.1-1"));
        assert_eq!(v("1.0-1").cmp(&v("1.00-1")), Ordering::Equal);
    }

    #[test]
    fn test_componentwise_greater_is_greater() {
        let pairs = [
            ("4.2.0.0-2", "4.1.0.0-1"),
            ("10.0-5", "9.9-4"),
            ("1.2.3-4", "1.2.2-3"),
        ];
        for (a, b) in pairs {
            assert!(v(a) > v(b), "{a} should be newer than {b}");
            assert!(v(b) < v(a));
        }
    }
}
