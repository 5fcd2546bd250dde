//! The software bill of materials model.
//!
//! Every resolver reports its packages as [`Component`]s; the dispatcher
//! collects them into one [`Sbom`]. Components are deduplicated under the
//! `(purl, name, version)` key with their property sets merged semantically
//! (see [`property_semantics`]), and the final component list is sorted so
//! two runs over the same input produce byte-identical documents.
//!
//! Output formats: CycloneDX 1.4 JSON (the default, `bom.json`) and SPDX 2.3
//! JSON (see [`spdx`]).

pub mod property_semantics;
pub mod spdx;

pub use property_semantics::{Property, PropertySet, found_by_cachi2};

use serde::{Deserialize, Serialize};

/// The CycloneDX component type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ComponentType {
    #[default]
    Library,
    File,
    Container,
}

/// An external reference inside an SBOM component.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExternalReference {
    pub url: String,
    #[serde(rename = "type")]
    pub reference_type: String,
}

impl ExternalReference {
    /// A `distribution` reference, the only kind cachi2 emits.
    pub fn distribution(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reference_type: "distribution".to_string(),
        }
    }
}

/// A software component such as a dependency or a package.
///
/// Compliant to the CycloneDX specification:
/// <https://cyclonedx.org/docs/1.4/json/#components>
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub purl: String,
    #[serde(rename = "type")]
    pub component_type: ComponentType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<Property>,
    #[serde(
        rename = "externalReferences",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub external_references: Vec<ExternalReference>,
}

impl Component {
    /// A library component with the `cachi2:found_by` property attached.
    pub fn library(
        name: impl Into<String>,
        version: Option<String>,
        purl: impl ToString,
    ) -> Self {
        Self {
            name: name.into(),
            version,
            purl: purl.to_string(),
            component_type: ComponentType::Library,
            properties: vec![found_by_cachi2()],
            external_references: Vec::new(),
        }
    }

    pub fn with_properties(mut self, extra: Vec<Property>) -> Self {
        self.properties.extend(extra);
        self.properties.sort();
        self.properties.dedup();
        self
    }

    pub fn with_external_reference(mut self, reference: ExternalReference) -> Self {
        self.external_references.push(reference);
        self
    }

    /// The deduplication/sort key.
    fn key(&self) -> (&str, &str, &str) {
        (
            self.purl.as_str(),
            self.name.as_str(),
            self.version.as_deref().unwrap_or(""),
        )
    }
}

/// A tool entry in the SBOM metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tool {
    pub vendor: String,
    pub name: String,
}

/// The `metadata` field of the SBOM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub tools: Vec<Tool>,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            tools: vec![Tool {
                vendor: "red hat".to_string(),
                name: "cachi2".to_string(),
            }],
        }
    }
}

/// Software bill of materials in the CycloneDX format.
///
/// See full specification at: <https://cyclonedx.org/docs/1.4/json>
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sbom {
    #[serde(rename = "bomFormat")]
    pub bom_format: String,
    #[serde(rename = "specVersion")]
    pub spec_version: String,
    pub version: u32,
    pub metadata: Metadata,
    pub components: Vec<Component>,
}

impl Default for Sbom {
    fn default() -> Self {
        Self {
            bom_format: "CycloneDX".to_string(),
            spec_version: "1.4".to_string(),
            version: 1,
            metadata: Metadata::default(),
            components: Vec::new(),
        }
    }
}

impl Sbom {
    /// Build an SBOM from components, merging duplicates and sorting.
    pub fn from_components(components: Vec<Component>) -> Self {
        Self {
            components: merge_component_properties(components),
            ..Self::default()
        }
    }

    /// Union this SBOM with another one.
    pub fn merge(self, other: Self) -> Self {
        let mut components = self.components;
        components.extend(other.components);
        Self::from_components(components)
    }

    /// Serialize to CycloneDX 1.4 JSON.
    pub fn to_cyclonedx_json(&self) -> anyhow::Result<String> {
        let mut rendered = serde_json::to_string_pretty(self)?;
        rendered.push('\n');
        Ok(rendered)
    }

    /// Serialize to SPDX 2.3 JSON.
    pub fn to_spdx_json(&self) -> anyhow::Result<String> {
        let document = spdx::SpdxDocument::from_sbom(self);
        let mut rendered = serde_json::to_string_pretty(&document)?;
        rendered.push('\n');
        Ok(rendered)
    }
}

/// Sort and de-duplicate components while merging their properties.
pub fn merge_component_properties(mut components: Vec<Component>) -> Vec<Component> {
    components.sort_by(|a, b| a.key().cmp(&b.key()));

    let mut merged: Vec<Component> = Vec::with_capacity(components.len());
    for component in components {
        match merged.last_mut() {
            Some(last) if last.key() == component.key() => {
                let combined = PropertySet::from_properties(&last.properties)
                    .merge(PropertySet::from_properties(&component.properties));
                last.properties = combined.to_properties();
                for reference in component.external_references {
                    if !last.external_references.contains(&reference) {
                        last.external_references.push(reference);
                    }
                }
                last.external_references.sort();
            }
            _ => merged.push(component),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn component(purl: &str, name: &str, version: &str) -> Component {
        Component::library(name, Some(version.to_string()), purl)
    }

    #[test]
    fn test_components_are_sorted_by_purl() {
        let sbom = Sbom::from_components(vec![
            component("pkg:npm/zzz@1.0.0", "zzz", "1.0.0"),
            component("pkg:npm/aaa@1.0.0", "aaa", "1.0.0"),
        ]);
        let names: Vec<_> = sbom.components.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["aaa", "zzz"]);
    }

    #[test]
    fn test_duplicates_are_merged() {
        let dev = component("pkg:npm/foo@1.0.0", "foo", "1.0.0").with_properties(vec![
            Property::new("cdx:npm:package:development", "true"),
        ]);
        let runtime = component("pkg:npm/foo@1.0.0", "foo", "1.0.0");

        let sbom = Sbom::from_components(vec![dev, runtime]);
        assert_eq!(sbom.components.len(), 1);
        // dev-ness does not survive merging with a runtime occurrence
        assert!(
            !sbom.components[0]
                .properties
                .iter()
                .any(|p| p.name == "cdx:npm:package:development")
        );
        // the found_by property does
        assert!(
            sbom.components[0]
                .properties
                .iter()
                .any(|p| p.name == "cachi2:found_by" && p.value == "cachi2")
        );
    }

    #[test]
    fn test_merge_is_commutative() {
        let a = Sbom::from_components(vec![
            component("pkg:pypi/aiohttp@3.8.4", "aiohttp", "3.8.4"),
        ]);
        let b = Sbom::from_components(vec![
            component("pkg:golang/github.com/go-logr/logr@v1.2.3", "logr", "v1.2.3"),
        ]);
        assert_eq!(a.clone().merge(b.clone()), b.merge(a));
    }

    #[test]
    fn test_cyclonedx_shape() {
        let sbom = Sbom::from_components(vec![component("pkg:pypi/requests@2.31.0", "requests", "2.31.0")]);
        let json: serde_json::Value =
            serde_json::from_str(&sbom.to_cyclonedx_json().unwrap()).unwrap();
        assert_eq!(json["bomFormat"], "CycloneDX");
        assert_eq!(json["specVersion"], "1.4");
        assert_eq!(json["metadata"]["tools"][0]["name"], "cachi2");
        assert_eq!(json["components"][0]["purl"], "pkg:pypi/requests@2.31.0");
        assert_eq!(json["components"][0]["type"], "library");
    }

    #[test]
    fn test_external_references_survive_merge() {
        let reference = ExternalReference::distribution("https://example.org/foo.tar.gz");
        let with_ref = component("pkg:generic/foo", "foo", "")
            .with_external_reference(reference.clone());
        let without_ref = component("pkg:generic/foo", "foo", "");
        let sbom = Sbom::from_components(vec![without_ref, with_ref]);
        assert_eq!(sbom.components[0].external_references, vec![reference]);
    }

    #[test]
    fn test_deterministic_serialization() {
        let build = || {
            Sbom::from_components(vec![
                component("pkg:npm/b@2", "b", "2"),
                component("pkg:npm/a@1", "a", "1"),
            ])
        };
        assert_eq!(
            build().to_cyclonedx_json().unwrap(),
            build().to_cyclonedx_json().unwrap()
        );
    }
}
