//! Package URL (purl) construction and parsing.
//!
//! SBOM components identify packages by purl, e.g.
//! `pkg:golang/github.com/go-logr/logr@v1.2.3` or
//! `pkg:pypi/requests@2.31.0?checksum=sha256:abc123`.
//!
//! Rendering is canonical: qualifiers are sorted by key, segments are
//! percent-encoded, empty parts are omitted. Parsing a canonical purl and
//! re-rendering it yields the identical string.

use crate::core::Cachi2Error;
use std::collections::BTreeMap;
use std::fmt;

/// A parsed or under-construction package URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Purl {
    ptype: String,
    namespace: Option<String>,
    name: String,
    version: Option<String>,
    qualifiers: BTreeMap<String, String>,
    subpath: Option<String>,
}

impl Purl {
    pub fn new(ptype: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            ptype: ptype.into().to_lowercase(),
            namespace: None,
            name: name.into(),
            version: None,
            qualifiers: BTreeMap::new(),
            subpath: None,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        if !namespace.is_empty() {
            self.namespace = Some(namespace);
        }
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_qualifier(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.is_empty() {
            self.qualifiers.insert(key.into().to_lowercase(), value);
        }
        self
    }

    pub fn with_subpath(mut self, subpath: impl Into<String>) -> Self {
        let subpath = subpath.into();
        let trimmed = subpath.trim_matches('/');
        if !trimmed.is_empty() && trimmed != "." {
            self.subpath = Some(trimmed.to_string());
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Parse a purl string. Accepts canonical encoding; percent-escapes are
    /// decoded into the structured fields.
    pub fn parse(purl: &str) -> Result<Self, Cachi2Error> {
        let invalid = |why: &str| Cachi2Error::InvalidInput(format!("invalid purl {purl:?}: {why}"));

        let rest = purl.strip_prefix("pkg:").ok_or_else(|| invalid("missing pkg: scheme"))?;

        let (rest, subpath) = match rest.split_once('#') {
            Some((r, s)) => (r, Some(percent_decode(s))),
            None => (rest, None),
        };
        let (rest, qualifiers_str) = match rest.split_once('?') {
            Some((r, q)) => (r, Some(q)),
            None => (rest, None),
        };
        let (rest, version) = match rest.rsplit_once('@') {
            Some((r, v)) => (r, Some(percent_decode(v))),
            None => (rest, None),
        };

        let (ptype, path) = rest.split_once('/').ok_or_else(|| invalid("missing name"))?;
        let (namespace, name) = match path.rsplit_once('/') {
            Some((ns, n)) => (Some(percent_decode(ns)), percent_decode(n)),
            None => (None, percent_decode(path)),
        };
        if name.is_empty() {
            return Err(invalid("empty name"));
        }

        let mut qualifiers = BTreeMap::new();
        if let Some(qualifiers_str) = qualifiers_str {
            for pair in qualifiers_str.split('&') {
                let (key, value) = pair.split_once('=').ok_or_else(|| invalid("bad qualifier"))?;
                qualifiers.insert(key.to_lowercase(), percent_decode(value));
            }
        }

        Ok(Self {
            ptype: ptype.to_lowercase(),
            namespace,
            name,
            version,
            qualifiers,
            subpath,
        })
    }
}

impl fmt::Display for Purl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pkg:{}/", self.ptype)?;
        if let Some(ref namespace) = self.namespace {
            for segment in namespace.split('/').filter(|s| !s.is_empty()) {
                write!(f, "{}/", encode_segment(segment))?;
            }
        }
        write!(f, "{}", encode_segment(&self.name))?;
        if let Some(ref version) = self.version {
            write!(f, "@{}", encode_segment(version))?;
        }
        if !self.qualifiers.is_empty() {
            let mut separator = '?';
            for (key, value) in &self.qualifiers {
                write!(f, "{separator}{key}={}", encode_qualifier_value(value))?;
                separator = '&';
            }
        }
        if let Some(ref subpath) = self.subpath {
            write!(f, "#")?;
            let mut first = true;
            for segment in subpath.split('/').filter(|s| !s.is_empty()) {
                if !first {
                    write!(f, "/")?;
                }
                write!(f, "{}", encode_segment(segment))?;
                first = false;
            }
        }
        Ok(())
    }
}

fn is_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~')
}

fn encode_with(input: &str, is_safe: impl Fn(u8) -> bool) -> String {
    let mut out = String::with_capacity(input.len());
    for &byte in input.as_bytes() {
        if is_safe(byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Encode one path/name/version segment. Everything but unreserved characters
/// is escaped.
fn encode_segment(segment: &str) -> String {
    encode_with(segment, is_unreserved)
}

/// Encode a qualifier value. `:` and `/` stay readable (matching the
/// canonical output of the reference packageurl implementations), everything
/// else outside the unreserved set is escaped.
fn encode_qualifier_value(value: &str) -> String {
    encode_with(value, |b| is_unreserved(b) || b == b':' || b == b'/')
}

pub(crate) fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hi = (bytes[i + 1] as char).to_digit(16);
            let lo = (bytes[i + 2] as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_purl() {
        let purl = Purl::new("pypi", "requests").with_version("2.31.0");
        assert_eq!(purl.to_string(), "pkg:pypi/requests@2.31.0");
    }

    #[test]
    fn test_namespace_segments() {
        let purl = Purl::new("golang", "v2")
            .with_namespace("github.com/release-engineering/retrodep")
            .with_version("v2.1.0");
        assert_eq!(
            purl.to_string(),
            "pkg:golang/github.com/release-engineering/retrodep/v2@v2.1.0"
        );
    }

    #[test]
    fn test_qualifiers_are_sorted() {
        let purl = Purl::new("generic", "artifact")
            .with_qualifier("download_url", "https://example.org/a.tar.gz")
            .with_qualifier("checksum", "sha256:abc123");
        assert_eq!(
            purl.to_string(),
            "pkg:generic/artifact?checksum=sha256:abc123&download_url=https://example.org/a.tar.gz"
        );
    }

    #[test]
    fn test_vcs_url_encoding() {
        let purl = Purl::new("npm", "left-pad").with_qualifier(
            "vcs_url",
            "git+https://github.com/left-pad/left-pad@8e83fdbb6dff",
        );
        assert_eq!(
            purl.to_string(),
            "pkg:npm/left-pad?vcs_url=git%2Bhttps://github.com/left-pad/left-pad%408e83fdbb6dff"
        );
    }

    #[test]
    fn test_scoped_npm_name() {
        let purl = Purl::new("npm", "core")
            .with_namespace("@babel")
            .with_version("7.0.0");
        assert_eq!(purl.to_string(), "pkg:npm/%40babel/core@7.0.0");
    }

    #[test]
    fn test_subpath() {
        let purl = Purl::new("gem", "inner")
            .with_version("1.0.0")
            .with_qualifier("vcs_url", "git+https://example.org/repo@abc")
            .with_subpath("/gems/inner/");
        assert!(purl.to_string().ends_with("#gems/inner"));
    }

    #[test]
    fn test_empty_qualifier_values_are_dropped() {
        let purl = Purl::new("pypi", "foo").with_qualifier("checksum", "");
        assert_eq!(purl.to_string(), "pkg:pypi/foo");
    }

    #[test]
    fn test_parse_round_trip_is_identity() {
        let cases = [
            "pkg:golang/github.com/release-engineering/retrodep/v2@v2.1.0",
            "pkg:npm/%40babel/core@7.0.0",
            "pkg:pypi/requests@2.31.0?checksum=sha256:abc123&download_url=https://example.org/r.tar.gz",
            "pkg:npm/left-pad?vcs_url=git%2Bhttps://github.com/left-pad/left-pad%408e83fdbb6dff",
            "pkg:gem/inner@1.0.0?vcs_url=git%2Bhttps://example.org/repo%40abc#gems/inner",
            "pkg:generic/file.tar.gz?checksum=md5:11111111111111111111111111111111",
        ];
        for case in cases {
            let parsed = Purl::parse(case).unwrap();
            assert_eq!(parsed.to_string(), case, "round trip failed for {case}");
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Purl::parse("not-a-purl").is_err());
        assert!(Purl::parse("pkg:").is_err());
        assert!(Purl::parse("pkg:pypi").is_err());
    }
}
