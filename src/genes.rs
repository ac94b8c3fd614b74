//! Gene and gene-set identifiers.
//!
//! A [`GeneSetIdentifier`] names a tag (`org/geneset/tag`) and is mutable over
//! time: the same tag may point at different content tomorrow. Resolution pins a
//! tag to another identifier that never moves. A [`GeneIdentifier`] addresses a
//! single gene inside a gene set (`gene:org/geneset/tag:name`), and
//! [`UniqueGeneIdentifier`] adds the gene type and architecture so that it is
//! the durable identity of a piece of content.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Tag used when a gene set reference omits one.
pub const DEFAULT_TAG: &str = "latest";

/// Name of the gene holding a gene set's catlet configuration.
pub const CATLET_GENE_NAME: &str = "catlet";

const GENE_PREFIX: &str = "gene:";
const MAX_PART_LENGTH: usize = 50;

/// A string could not be parsed as an identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid identifier '{value}': {reason}")]
pub struct IdentifierError {
    pub value: String,
    pub reason: String,
}

impl IdentifierError {
    fn new(value: &str, reason: impl Into<String>) -> Self {
        Self {
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

fn normalize_part(value: &str, part: &str, allow_dot: bool) -> Result<String, String> {
    let lowered = value.trim().to_ascii_lowercase();
    if lowered.is_empty() {
        return Err(format!("{part} is empty"));
    }
    if lowered.len() > MAX_PART_LENGTH {
        return Err(format!("{part} exceeds {MAX_PART_LENGTH} characters"));
    }
    let valid_char = |c: char| {
        c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || (allow_dot && c == '.')
    };
    if let Some(bad) = lowered.chars().find(|c| !valid_char(*c)) {
        return Err(format!("{part} contains invalid character '{bad}'"));
    }
    if lowered.starts_with(['-', '.']) || lowered.ends_with(['-', '.']) {
        return Err(format!("{part} must start and end with a letter or digit"));
    }
    Ok(lowered)
}

macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

/// Reference to a tagged gene set, e.g. `acme/base/1.0`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GeneSetIdentifier {
    organization: String,
    geneset: String,
    tag: String,
}

impl GeneSetIdentifier {
    pub fn new(organization: &str, geneset: &str, tag: &str) -> Result<Self, IdentifierError> {
        let full = format!("{organization}/{geneset}/{tag}");
        let err = |reason: String| IdentifierError::new(&full, reason);
        Ok(Self {
            organization: normalize_part(organization, "organization", false).map_err(err)?,
            geneset: normalize_part(geneset, "gene set name", true).map_err(err)?,
            tag: normalize_part(tag, "tag", true).map_err(err)?,
        })
    }

    pub fn organization(&self) -> &str {
        &self.organization
    }

    pub fn geneset(&self) -> &str {
        &self.geneset
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Same gene set, different tag.
    pub fn with_tag(&self, tag: &str) -> Result<Self, IdentifierError> {
        Self::new(&self.organization, &self.geneset, tag)
    }
}

impl FromStr for GeneSetIdentifier {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        match parts.as_slice() {
            [org, set] => Self::new(org, set, DEFAULT_TAG),
            [org, set, tag] => Self::new(org, set, tag),
            _ => Err(IdentifierError::new(
                s,
                "expected 'organization/geneset[/tag]'",
            )),
        }
    }
}

impl fmt::Display for GeneSetIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.organization, self.geneset, self.tag)
    }
}

string_serde!(GeneSetIdentifier);

/// Name of a gene within a gene set, e.g. `sda` or `catlet`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GeneName(String);

impl GeneName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for GeneName {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        normalize_part(s, "gene name", false)
            .map(GeneName)
            .map_err(|reason| IdentifierError::new(s, reason))
    }
}

impl fmt::Display for GeneName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

string_serde!(GeneName);

/// A gene inside a gene set: `gene:acme/base/1.0:sda`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GeneIdentifier {
    gene_set: GeneSetIdentifier,
    name: GeneName,
}

impl GeneIdentifier {
    pub fn new(gene_set: GeneSetIdentifier, name: GeneName) -> Self {
        Self { gene_set, name }
    }

    pub fn gene_set(&self) -> &GeneSetIdentifier {
        &self.gene_set
    }

    pub fn name(&self) -> &GeneName {
        &self.name
    }

    /// Same gene, addressed through another gene set (used when pinning tags).
    pub fn with_gene_set(&self, gene_set: GeneSetIdentifier) -> Self {
        Self {
            gene_set,
            name: self.name.clone(),
        }
    }
}

impl FromStr for GeneIdentifier {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let body = trimmed
            .strip_prefix(GENE_PREFIX)
            .ok_or_else(|| IdentifierError::new(s, "missing 'gene:' prefix"))?;
        let (set, name) = body
            .rsplit_once(':')
            .ok_or_else(|| IdentifierError::new(s, "expected 'gene:<geneset>:<name>'"))?;
        let gene_set = set
            .parse()
            .map_err(|e: IdentifierError| IdentifierError::new(s, e.reason))?;
        let name = name
            .parse()
            .map_err(|e: IdentifierError| IdentifierError::new(s, e.reason))?;
        Ok(Self { gene_set, name })
    }
}

impl fmt::Display for GeneIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}:{}", GENE_PREFIX, self.gene_set, self.name)
    }
}

string_serde!(GeneIdentifier);

/// Kind of content a gene carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeneType {
    Catlet,
    Volume,
    Fodder,
}

impl fmt::Display for GeneType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeneType::Catlet => f.write_str("catlet"),
            GeneType::Volume => f.write_str("volume"),
            GeneType::Fodder => f.write_str("fodder"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Architecture {
    #[default]
    #[serde(rename = "any")]
    Any,
    #[serde(rename = "hyperv/amd64")]
    HyperVAmd64,
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::Any => f.write_str("any"),
            Architecture::HyperVAmd64 => f.write_str("hyperv/amd64"),
        }
    }
}

/// Durable, content-stable identity of a gene.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UniqueGeneIdentifier {
    pub gene_type: GeneType,
    pub id: GeneIdentifier,
    #[serde(default)]
    pub architecture: Architecture,
}

impl UniqueGeneIdentifier {
    pub fn new(gene_type: GeneType, id: GeneIdentifier, architecture: Architecture) -> Self {
        Self {
            gene_type,
            id,
            architecture,
        }
    }

    /// The catlet configuration gene of a gene set.
    pub fn catlet(gene_set: GeneSetIdentifier, architecture: Architecture) -> Self {
        let name = GeneName(CATLET_GENE_NAME.to_string());
        Self::new(GeneType::Catlet, GeneIdentifier::new(gene_set, name), architecture)
    }
}

impl fmt::Display for UniqueGeneIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}[{}]", self.gene_type, self.id, self.architecture)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gene_set_default_tag() {
        let id: GeneSetIdentifier = "acme/base".parse().unwrap();
        assert_eq!(id.tag(), DEFAULT_TAG);
        assert_eq!(id.to_string(), "acme/base/latest");
    }

    #[test]
    fn test_gene_set_is_lowercased() {
        let id: GeneSetIdentifier = "ACME/Base/1.0".parse().unwrap();
        assert_eq!(id.to_string(), "acme/base/1.0");
    }

    #[test]
    fn test_gene_set_rejects_garbage() {
        assert!("acme".parse::<GeneSetIdentifier>().is_err());
        assert!("acme/base/1.0/extra".parse::<GeneSetIdentifier>().is_err());
        assert!("acme/ba se/1.0".parse::<GeneSetIdentifier>().is_err());
        assert!("acme//1.0".parse::<GeneSetIdentifier>().is_err());
        assert!("ac.me/base/1.0".parse::<GeneSetIdentifier>().is_err());
        assert!("acme/base/-1".parse::<GeneSetIdentifier>().is_err());
    }

    #[test]
    fn test_gene_identifier_parse() {
        let id: GeneIdentifier = "gene:acme/base/1.0:sda".parse().unwrap();
        assert_eq!(id.gene_set().to_string(), "acme/base/1.0");
        assert_eq!(id.name().as_str(), "sda");
        assert_eq!(id.to_string(), "gene:acme/base/1.0:sda");
    }

    #[test]
    fn test_gene_identifier_without_tag() {
        let id: GeneIdentifier = "gene:acme/base:init".parse().unwrap();
        assert_eq!(id.to_string(), "gene:acme/base/latest:init");
    }

    #[test]
    fn test_gene_identifier_requires_prefix() {
        let err = "acme/base/1.0:sda".parse::<GeneIdentifier>().unwrap_err();
        assert!(err.reason.contains("gene:"));
        assert!("gene:acme/base/1.0".parse::<GeneIdentifier>().is_err());
        assert!("gene:acme/base/1.0:s.da".parse::<GeneIdentifier>().is_err());
    }

    #[test]
    fn test_with_gene_set_keeps_name() {
        let id: GeneIdentifier = "gene:acme/base/latest:sda".parse().unwrap();
        let pinned = id.with_gene_set("acme/base/1.0".parse().unwrap());
        assert_eq!(pinned.to_string(), "gene:acme/base/1.0:sda");
    }

    #[test]
    fn test_serde_as_strings() {
        let gene = UniqueGeneIdentifier::catlet("acme/base/1.0".parse().unwrap(), Architecture::Any);
        let json = serde_json::to_value(&gene).unwrap();
        assert_eq!(json["gene_type"], "catlet");
        assert_eq!(json["id"], "gene:acme/base/1.0:catlet");
        assert_eq!(json["architecture"], "any");

        let decoded: UniqueGeneIdentifier = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, gene);
    }

    #[test]
    fn test_serde_rejects_invalid_string() {
        let result: Result<GeneSetIdentifier, _> = serde_json::from_str("\"nope\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_unique_gene_display() {
        let id: GeneIdentifier = "gene:acme/base/1.0:sda".parse().unwrap();
        let gene = UniqueGeneIdentifier::new(GeneType::Volume, id, Architecture::HyperVAmd64);
        assert_eq!(gene.to_string(), "volume::gene:acme/base/1.0:sda[hyperv/amd64]");
    }
}
