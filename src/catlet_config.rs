use serde::{Deserialize, Serialize};

use crate::genes::{GeneIdentifier, GeneName, GeneSetIdentifier, IdentifierError};

/// Catlet configuration document.
///
/// Configs are values: breeding and pinning produce new configs, the input is
/// never modified in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatletConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub drives: Vec<DriveConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<NetworkConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fodder: Vec<FodderConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<VariableConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
}

/// Memory sizes in MiB.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<u64>,
}

/// How an entry in a child config treats the inherited entry with the same key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mutation {
    #[default]
    Merge,
    Overwrite,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveType {
    Vhd,
    SharedVhd,
    Dvd,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriveConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Size in GiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub drive_type: Option<DriveType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation: Option<Mutation>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation: Option<Mutation>,
}

/// A configuration fragment applied inside the guest (cloud-init style).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FodderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub fodder_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove: Option<bool>,
}

impl FodderConfig {
    /// Identity used when merging fragments: `(source, name)`.
    pub fn key(&self) -> FodderKey {
        FodderKey {
            source: self.source.clone(),
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FodderKey {
    pub source: Option<String>,
    pub name: Option<String>,
}

impl std::fmt::Display for FodderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.source, &self.name) {
            (Some(source), Some(name)) => write!(f, "{source}#{name}"),
            (Some(source), None) => f.write_str(source),
            (None, Some(name)) => f.write_str(name),
            (None, None) => f.write_str("<unnamed>"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    String,
    Number,
    Boolean,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub variable_type: Option<VariableType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

impl CatletConfig {
    /// Parse a config document from JSON bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Parsed parent reference, `None` when the config has no parent.
    pub fn parent_id(&self) -> Result<Option<GeneSetIdentifier>, IdentifierError> {
        match self.parent.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => raw.parse().map(Some),
        }
    }

    /// Every gene referenced by fodder and drive sources, in declaration order.
    pub fn gene_references(&self) -> Vec<&str> {
        self.fodder
            .iter()
            .filter_map(|f| f.source.as_deref())
            .chain(self.drives.iter().filter_map(|d| d.source.as_deref()))
            .collect()
    }

    /// Drive names double as gene names: an inherited drive without a source
    /// becomes the parent's volume gene `gene:<parent>:<drive>`.
    pub fn validate_drive_names(&self) -> Result<(), String> {
        for drive in &self.drives {
            if drive.name.trim().is_empty() {
                return Err("drive name must not be empty".to_string());
            }
            drive
                .name
                .parse::<GeneName>()
                .map_err(|e| format!("invalid drive name '{}': {}", drive.name, e.reason))?;
        }
        Ok(())
    }

    /// Validate the config before it is used to start a workflow.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("catlet name must not be empty".to_string());
        }
        if let Some(count) = self.cpu.as_ref().and_then(|c| c.count) {
            if count == 0 {
                return Err("cpu count must be at least 1".to_string());
            }
        }
        if let Some(memory) = &self.memory {
            if let (Some(min), Some(max)) = (memory.minimum, memory.maximum) {
                if min > max {
                    return Err("memory minimum exceeds maximum".to_string());
                }
            }
            if let (Some(startup), Some(max)) = (memory.startup, memory.maximum) {
                if startup > max {
                    return Err("memory startup exceeds maximum".to_string());
                }
            }
        }
        self.validate_drive_names()?;
        for source in self.gene_references() {
            source
                .parse::<GeneIdentifier>()
                .map_err(|e| format!("invalid gene reference: {e}"))?;
        }
        self.parent_id().map_err(|e| format!("invalid parent: {e}"))?;
        Ok(())
    }
}
