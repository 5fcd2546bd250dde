//! SPDX 2.3 JSON rendering of the SBOM.
//!
//! The CycloneDX model is the in-memory source of truth; this module converts
//! it on demand. Each component becomes one SPDX package carrying its purl as
//! a `PACKAGE-MANAGER/purl` external reference. Fields SPDX requires but we
//! have no data for are filled with `NOASSERTION`.

use super::{Component, Sbom};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const NOASSERTION: &str = "NOASSERTION";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpdxCreationInfo {
    pub created: String,
    pub creators: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpdxExternalRef {
    #[serde(rename = "referenceCategory")]
    pub reference_category: String,
    #[serde(rename = "referenceType")]
    pub reference_type: String,
    #[serde(rename = "referenceLocator")]
    pub reference_locator: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpdxAnnotation {
    pub annotator: String,
    #[serde(rename = "annotationDate")]
    pub annotation_date: String,
    #[serde(rename = "annotationType")]
    pub annotation_type: String,
    pub comment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpdxPackage {
    #[serde(rename = "SPDXID")]
    pub spdxid: String,
    pub name: String,
    #[serde(rename = "versionInfo", skip_serializing_if = "Option::is_none")]
    pub version_info: Option<String>,
    #[serde(rename = "downloadLocation")]
    pub download_location: String,
    #[serde(rename = "licenseConcluded")]
    pub license_concluded: String,
    #[serde(rename = "copyrightText")]
    pub copyright_text: String,
    #[serde(rename = "externalRefs", skip_serializing_if = "Vec::is_empty")]
    pub external_refs: Vec<SpdxExternalRef>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<SpdxAnnotation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpdxRelationship {
    #[serde(rename = "spdxElementId")]
    pub spdx_element_id: String,
    #[serde(rename = "relationshipType")]
    pub relationship_type: String,
    #[serde(rename = "relatedSpdxElement")]
    pub related_spdx_element: String,
}

/// An SPDX 2.3 document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpdxDocument {
    #[serde(rename = "spdxVersion")]
    pub spdx_version: String,
    #[serde(rename = "dataLicense")]
    pub data_license: String,
    #[serde(rename = "SPDXID")]
    pub spdxid: String,
    pub name: String,
    #[serde(rename = "documentNamespace")]
    pub document_namespace: String,
    #[serde(rename = "creationInfo")]
    pub creation_info: SpdxCreationInfo,
    pub packages: Vec<SpdxPackage>,
    pub relationships: Vec<SpdxRelationship>,
}

impl SpdxDocument {
    pub fn from_sbom(sbom: &Sbom) -> Self {
        let packages: Vec<SpdxPackage> = sbom.components.iter().map(spdx_package).collect();

        let mut relationships = Vec::with_capacity(packages.len());
        for package in &packages {
            relationships.push(SpdxRelationship {
                spdx_element_id: "SPDXRef-DOCUMENT".to_string(),
                relationship_type: "DESCRIBES".to_string(),
                related_spdx_element: package.spdxid.clone(),
            });
        }

        Self {
            spdx_version: "SPDX-2.3".to_string(),
            data_license: "CC0-1.0".to_string(),
            spdxid: "SPDXRef-DOCUMENT".to_string(),
            name: "cachi2".to_string(),
            document_namespace: "https://cachi2.dev/spdxdocs/cachi2".to_string(),
            creation_info: SpdxCreationInfo {
                // A fixed epoch keeps the document reproducible; the request
                // already records when it ran.
                created: chrono::DateTime::<chrono::Utc>::UNIX_EPOCH
                    .format("%Y-%m-%dT%H:%M:%SZ")
                    .to_string(),
                creators: vec![
                    "Organization: red hat".to_string(),
                    "Tool: cachi2".to_string(),
                ],
            },
            packages,
            relationships,
        }
    }
}

fn spdx_package(component: &Component) -> SpdxPackage {
    let mut external_refs = vec![SpdxExternalRef {
        reference_category: "PACKAGE-MANAGER".to_string(),
        reference_type: "purl".to_string(),
        reference_locator: component.purl.clone(),
    }];
    for reference in &component.external_references {
        external_refs.push(SpdxExternalRef {
            reference_category: "OTHER".to_string(),
            reference_type: reference.reference_type.clone(),
            reference_locator: reference.url.clone(),
        });
    }

    let annotations = component
        .properties
        .iter()
        .map(|prop| SpdxAnnotation {
            annotator: "Tool: cachi2".to_string(),
            annotation_date: chrono::DateTime::<chrono::Utc>::UNIX_EPOCH
                .format("%Y-%m-%dT%H:%M:%SZ")
                .to_string(),
            annotation_type: "OTHER".to_string(),
            comment: format!("{}:{}", prop.name, prop.value),
        })
        .collect();

    SpdxPackage {
        spdxid: spdx_id(component),
        name: component.name.clone(),
        version_info: component.version.clone(),
        download_location: NOASSERTION.to_string(),
        license_concluded: NOASSERTION.to_string(),
        copyright_text: NOASSERTION.to_string(),
        external_refs,
        annotations,
    }
}

/// SPDX IDs only allow letters, digits, `.` and `-`; disambiguate with a
/// digest of the purl.
fn spdx_id(component: &Component) -> String {
    let sanitized: String = component
        .name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '-' })
        .collect();
    let digest = hex::encode(&Sha256::digest(component.purl.as_bytes())[..8]);
    format!("SPDXRef-Package-{sanitized}-{digest}")
}
