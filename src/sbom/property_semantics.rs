//! Semantic merging of SBOM component properties.
//!
//! When the same package is reported by several input packages (e.g. a dev
//! dependency of one workspace and a runtime dependency of another), the
//! duplicate components are merged into one and their properties have to be
//! combined *semantically*, not just unioned:
//!
//! - `cachi2:missing_hash:in_file` values accumulate (set union)
//! - `cdx:npm:package:development` survives only if the package is a dev
//!   dependency from every path that reaches it (intersection); same for
//!   `bundled` and `cachi2:pip:package:build-dependency`
//! - `cachi2:pip:package:binary` / `cachi2:bundler:package:binary` survive if
//!   any occurrence was binary (union)

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A name/value property attached to an SBOM component.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub value: String,
}

impl Property {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// The property cachi2 stamps on every component it reports.
pub fn found_by_cachi2() -> Property {
    Property::new("cachi2:found_by", "cachi2")
}

/// The semantic meaning of the property set of a single component.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertySet {
    pub found_by: Option<String>,
    pub missing_hash_in_file: BTreeSet<String>,
    pub npm_bundled: bool,
    pub npm_development: bool,
    pub pip_package_binary: bool,
    pub pip_build_dependency: bool,
    pub bundler_package_binary: bool,
}

impl PropertySet {
    /// Convert a list of component properties to a `PropertySet`.
    pub fn from_properties(props: &[Property]) -> Self {
        let mut set = Self::default();
        for prop in props {
            match prop.name.as_str() {
                "cachi2:found_by" => set.found_by = Some(prop.value.clone()),
                "cachi2:missing_hash:in_file" => {
                    set.missing_hash_in_file.insert(prop.value.clone());
                }
                "cdx:npm:package:bundled" => set.npm_bundled = true,
                "cdx:npm:package:development" => set.npm_development = true,
                "cachi2:pip:package:binary" => set.pip_package_binary = true,
                "cachi2:pip:package:build-dependency" => set.pip_build_dependency = true,
                "cachi2:bundler:package:binary" => set.bundler_package_binary = true,
                other => {
                    // Unknown properties are dropped on merge; resolvers only
                    // emit names from this vocabulary.
                    tracing::debug!("dropping unrecognized SBOM property: {other}");
                }
            }
        }
        set
    }

    /// Convert back to a sorted list of properties.
    pub fn to_properties(&self) -> Vec<Property> {
        let mut props = Vec::new();
        if let Some(ref found_by) = self.found_by {
            props.push(Property::new("cachi2:found_by", found_by.clone()));
        }
        for file in &self.missing_hash_in_file {
            props.push(Property::new("cachi2:missing_hash:in_file", file.clone()));
        }
        if self.npm_bundled {
            props.push(Property::new("cdx:npm:package:bundled", "true"));
        }
        if self.npm_development {
            props.push(Property::new("cdx:npm:package:development", "true"));
        }
        if self.pip_package_binary {
            props.push(Property::new("cachi2:pip:package:binary", "true"));
        }
        if self.pip_build_dependency {
            props.push(Property::new("cachi2:pip:package:build-dependency", "true"));
        }
        if self.bundler_package_binary {
            props.push(Property::new("cachi2:bundler:package:binary", "true"));
        }
        props.sort();
        props
    }

    /// Combine two property sets.
    pub fn merge(self, other: Self) -> Self {
        Self {
            found_by: self.found_by.or(other.found_by),
            missing_hash_in_file: &self.missing_hash_in_file | &other.missing_hash_in_file,
            npm_bundled: self.npm_bundled && other.npm_bundled,
            npm_development: self.npm_development && other.npm_development,
            pip_package_binary: self.pip_package_binary || other.pip_package_binary,
            pip_build_dependency: self.pip_build_dependency && other.pip_build_dependency,
            bundler_package_binary: self.bundler_package_binary || other.bundler_package_binary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dev_flag_is_intersected() {
        let dev = PropertySet::from_properties(&[Property::new(
            "cdx:npm:package:development",
            "true",
        )]);
        let runtime = PropertySet::default();
        let merged = dev.clone().merge(runtime);
        assert!(!merged.npm_development);

        let merged_both = dev.clone().merge(dev);
        assert!(merged_both.npm_development);
    }

    #[test]
    fn test_missing_hash_files_are_unioned() {
        let a = PropertySet::from_properties(&[Property::new(
            "cachi2:missing_hash:in_file",
            "requirements.txt",
        )]);
        let b = PropertySet::from_properties(&[Property::new(
            "cachi2:missing_hash:in_file",
            "requirements-build.txt",
        )]);
        let merged = a.merge(b);
        assert_eq!(merged.missing_hash_in_file.len(), 2);
    }

    #[test]
    fn test_binary_flag_is_unioned() {
        let binary = PropertySet::from_properties(&[Property::new(
            "cachi2:pip:package:binary",
            "true",
        )]);
        let source = PropertySet::default();
        assert!(binary.merge(source).pip_package_binary);
    }

    #[test]
    fn test_round_trip_is_sorted() {
        let props = vec![
            Property::new("cdx:npm:package:development", "true"),
            Property::new("cachi2:found_by", "cachi2"),
        ];
        let round_tripped = PropertySet::from_properties(&props).to_properties();
        assert_eq!(
            round_tripped,
            vec![
                Property::new("cachi2:found_by", "cachi2"),
                Property::new("cdx:npm:package:development", "true"),
            ]
        );
    }
}
