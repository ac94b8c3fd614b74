//! Configuration breeding.
//!
//! `breed` merges a parent config into a child config. Scalars of the child
//! win field by field. Collections are merged by key: parent entries come first
//! in parent order, a child entry with the same key replaces the inherited entry
//! in place, and new child entries follow in child order. Only `Vec`s are used
//! so the result never depends on hash iteration order.

use std::collections::BTreeSet;

use crate::catlet_config::{
    CatletConfig, CpuConfig, DriveConfig, FodderConfig, MemoryConfig, Mutation, NetworkConfig,
    VariableConfig,
};
use crate::error::{BreedingError, ResolutionError, SpecificationError};
use crate::genes::{GeneSetIdentifier, CATLET_GENE_NAME};
use crate::resolution::{parse_gene_reference, parse_parent, ParentChain, ResolvedGeneSets};

fn ensure_unique(collection: &str, keys: impl Iterator<Item = String>) -> Result<(), BreedingError> {
    let mut seen = BTreeSet::new();
    let mut duplicates = BTreeSet::new();
    for key in keys {
        if !seen.insert(key.clone()) {
            duplicates.insert(key);
        }
    }
    if duplicates.is_empty() {
        return Ok(());
    }
    Err(BreedingError {
        collection: collection.to_string(),
        keys: duplicates.into_iter().collect(),
        reason: "key declared more than once in one config".to_string(),
    })
}

fn ensure_unique_keys(config: &CatletConfig) -> Result<(), BreedingError> {
    ensure_unique("drives", config.drives.iter().map(|d| d.name.clone()))?;
    ensure_unique("networks", config.networks.iter().map(|n| n.name.clone()))?;
    ensure_unique("fodder", config.fodder.iter().map(|f| f.key().to_string()))?;
    ensure_unique("variables", config.variables.iter().map(|v| v.name.clone()))
}

fn parent_volume(parent_id: &GeneSetIdentifier, drive: &str) -> String {
    format!("gene:{parent_id}:{drive}")
}

fn merge_cpu(parent: Option<&CpuConfig>, child: Option<&CpuConfig>) -> Option<CpuConfig> {
    match (parent, child) {
        (None, None) => None,
        (p, c) => Some(CpuConfig {
            count: c.and_then(|c| c.count).or(p.and_then(|p| p.count)),
        }),
    }
}

fn merge_memory(parent: Option<&MemoryConfig>, child: Option<&MemoryConfig>) -> Option<MemoryConfig> {
    match (parent, child) {
        (None, None) => None,
        (p, c) => Some(MemoryConfig {
            startup: c.and_then(|c| c.startup).or(p.and_then(|p| p.startup)),
            minimum: c.and_then(|c| c.minimum).or(p.and_then(|p| p.minimum)),
            maximum: c.and_then(|c| c.maximum).or(p.and_then(|p| p.maximum)),
        }),
    }
}

fn merge_drive(parent: &DriveConfig, child: &DriveConfig) -> DriveConfig {
    DriveConfig {
        name: parent.name.clone(),
        source: child.source.clone().or_else(|| parent.source.clone()),
        size: child.size.or(parent.size),
        drive_type: child.drive_type.or(parent.drive_type),
        mutation: None,
    }
}

fn merge_network(parent: &NetworkConfig, child: &NetworkConfig) -> NetworkConfig {
    NetworkConfig {
        name: parent.name.clone(),
        adapter_name: child.adapter_name.clone().or_else(|| parent.adapter_name.clone()),
        mutation: None,
    }
}

/// Shared merge for keyed collections with a per-entry [`Mutation`].
fn merge_keyed<T: Clone>(
    inherited: Vec<T>,
    child: &[T],
    key: impl Fn(&T) -> &str,
    mutation: impl Fn(&T) -> Mutation,
    merge: impl Fn(&T, &T) -> T,
    finish: impl Fn(T) -> T,
) -> Vec<T> {
    let mut merged = inherited;
    for entry in child {
        let existing = merged.iter().position(|m| key(m) == key(entry));
        match (existing, mutation(entry)) {
            (Some(i), Mutation::Remove) => {
                merged.remove(i);
            }
            (Some(i), Mutation::Overwrite) => merged[i] = finish(entry.clone()),
            (Some(i), Mutation::Merge) => merged[i] = merge(&merged[i], entry),
            (None, Mutation::Remove) => {}
            (None, _) => merged.push(finish(entry.clone())),
        }
    }
    merged
}

fn breed_fodder(parent: &[FodderConfig], child: &[FodderConfig]) -> Vec<FodderConfig> {
    let mut merged: Vec<FodderConfig> = parent
        .iter()
        .filter(|f| f.remove != Some(true))
        .cloned()
        .collect();
    for fragment in child {
        let key = fragment.key();
        let existing = merged.iter().position(|m| m.key() == key);
        match (existing, fragment.remove == Some(true)) {
            (Some(i), true) => {
                merged.remove(i);
            }
            (Some(i), false) => merged[i] = fragment.clone(),
            (None, true) => {}
            (None, false) => merged.push(fragment.clone()),
        }
    }
    merged
}

fn breed_variables(
    parent: &[VariableConfig],
    child: &[VariableConfig],
) -> Result<Vec<VariableConfig>, BreedingError> {
    let mut merged = parent.to_vec();
    for variable in child {
        match merged.iter().position(|m| m.name == variable.name) {
            Some(i) => {
                let inherited = &merged[i];
                if let (Some(a), Some(b)) = (inherited.variable_type, variable.variable_type) {
                    if a != b {
                        return Err(BreedingError {
                            collection: "variables".to_string(),
                            keys: vec![variable.name.clone()],
                            reason: format!("type changed from {a:?} to {b:?}"),
                        });
                    }
                }
                merged[i] = VariableConfig {
                    name: inherited.name.clone(),
                    value: variable.value.clone().or_else(|| inherited.value.clone()),
                    variable_type: variable.variable_type.or(inherited.variable_type),
                    secret: variable.secret.or(inherited.secret),
                    required: variable.required.or(inherited.required),
                };
            }
            None => merged.push(variable.clone()),
        }
    }
    Ok(merged)
}

/// Merge `parent` (the config of gene set `parent_id`) into `child`.
pub fn breed(
    parent: &CatletConfig,
    parent_id: &GeneSetIdentifier,
    child: &CatletConfig,
) -> Result<CatletConfig, BreedingError> {
    ensure_unique_keys(parent)?;
    ensure_unique_keys(child)?;

    let inherited_drives: Vec<DriveConfig> = parent
        .drives
        .iter()
        .map(|d| DriveConfig {
            source: d
                .source
                .clone()
                .or_else(|| Some(parent_volume(parent_id, &d.name))),
            mutation: None,
            ..d.clone()
        })
        .collect();
    let drives = merge_keyed(
        inherited_drives,
        &child.drives,
        |d| d.name.as_str(),
        |d| d.mutation.unwrap_or_default(),
        merge_drive,
        |d| DriveConfig { mutation: None, ..d },
    );

    let inherited_networks: Vec<NetworkConfig> = parent
        .networks
        .iter()
        .map(|n| NetworkConfig {
            mutation: None,
            ..n.clone()
        })
        .collect();
    let networks = merge_keyed(
        inherited_networks,
        &child.networks,
        |n| n.name.as_str(),
        |n| n.mutation.unwrap_or_default(),
        merge_network,
        |n| NetworkConfig { mutation: None, ..n },
    );

    Ok(CatletConfig {
        name: if child.name.trim().is_empty() {
            parent.name.clone()
        } else {
            child.name.clone()
        },
        parent: Some(parent_id.to_string()),
        project: child.project.clone().or_else(|| parent.project.clone()),
        cpu: merge_cpu(parent.cpu.as_ref(), child.cpu.as_ref()),
        memory: merge_memory(parent.memory.as_ref(), child.memory.as_ref()),
        drives,
        networks,
        fodder: breed_fodder(&parent.fodder, &child.fodder),
        variables: breed_variables(&parent.variables, &child.variables)?,
    })
}

fn pin_source(source: &str, gene_sets: &ResolvedGeneSets) -> Result<String, ResolutionError> {
    let gene = parse_gene_reference(source)?;
    match gene_sets.get(gene.gene_set()) {
        Some(resolved) => Ok(gene.with_gene_set(resolved.clone()).to_string()),
        None => Err(ResolutionError::GeneResolutionFailed {
            gene_set: gene.gene_set().to_string(),
            reason: "gene set was not resolved in this run".to_string(),
        }),
    }
}

/// Rewrite every gene reference (and the parent) to its pinned identifier.
pub fn pin_gene_sets(
    config: &CatletConfig,
    gene_sets: &ResolvedGeneSets,
) -> Result<CatletConfig, ResolutionError> {
    let parent = match parse_parent(config)? {
        None => None,
        Some(parent) => Some(
            gene_sets
                .get(&parent)
                .ok_or_else(|| ResolutionError::GeneResolutionFailed {
                    gene_set: parent.to_string(),
                    reason: "gene set was not resolved in this run".to_string(),
                })?
                .to_string(),
        ),
    };

    let mut drives = Vec::with_capacity(config.drives.len());
    for drive in &config.drives {
        let source = match drive.source.as_deref() {
            Some(source) => Some(pin_source(source, gene_sets)?),
            None => None,
        };
        drives.push(DriveConfig {
            source,
            ..drive.clone()
        });
    }

    let mut fodder = Vec::with_capacity(config.fodder.len());
    for fragment in &config.fodder {
        let source = match fragment.source.as_deref() {
            Some(source) => Some(pin_source(source, gene_sets)?),
            None => None,
        };
        fodder.push(FodderConfig {
            source,
            ..fragment.clone()
        });
    }

    Ok(CatletConfig {
        parent,
        drives,
        fodder,
        ..config.clone()
    })
}

/// An ancestor's drives without a source are that ancestor's own volumes.
fn claim_own_volumes(config: CatletConfig, own_id: &GeneSetIdentifier) -> CatletConfig {
    let drives = config
        .drives
        .iter()
        .map(|d| DriveConfig {
            source: d.source.clone().or_else(|| Some(parent_volume(own_id, &d.name))),
            ..d.clone()
        })
        .collect();
    CatletConfig { drives, ..config }
}

/// Apply a parentless config's own mutation markers: removals drop their
/// entries and no marker survives into the effective config.
fn settle_mutations(config: &CatletConfig) -> Result<CatletConfig, BreedingError> {
    ensure_unique_keys(config)?;
    let drives = merge_keyed(
        Vec::new(),
        &config.drives,
        |d| d.name.as_str(),
        |d| d.mutation.unwrap_or_default(),
        merge_drive,
        |d| DriveConfig { mutation: None, ..d },
    );
    let networks = merge_keyed(
        Vec::new(),
        &config.networks,
        |n| n.name.as_str(),
        |n| n.mutation.unwrap_or_default(),
        merge_network,
        |n| NetworkConfig { mutation: None, ..n },
    );
    Ok(CatletConfig {
        drives,
        networks,
        fodder: breed_fodder(&[], &config.fodder),
        ..config.clone()
    })
}

/// Breed `leaf` with its whole ancestry, root first.
///
/// `chain` must come from a successful resolution run, so it is acyclic and
/// holds every ancestor config.
pub fn breed_chain(leaf: &CatletConfig, chain: &ParentChain) -> Result<CatletConfig, SpecificationError> {
    let leaf = pin_gene_sets(leaf, &chain.gene_sets)?;

    let mut lineage = Vec::with_capacity(chain.ancestors.len());
    for ancestor in &chain.ancestors {
        let config = chain.configs.get(&ancestor.resolved).ok_or_else(|| {
            ResolutionError::AncestorGeneUnavailable {
                ancestor: ancestor.resolved.to_string(),
                reason: format!("{CATLET_GENE_NAME} gene missing from resolved configs"),
            }
        })?;
        let pinned = pin_gene_sets(config, &chain.gene_sets)?;
        lineage.push((&ancestor.resolved, claim_own_volumes(pinned, &ancestor.resolved)));
    }

    let Some((root_id, root)) = lineage.pop() else {
        return Ok(settle_mutations(&leaf)?);
    };
    let mut bred = root;
    let mut parent_id = root_id;
    while let Some((id, config)) = lineage.pop() {
        bred = breed(&bred, parent_id, &config)?;
        parent_id = id;
    }
    Ok(breed(&bred, parent_id, &leaf)?)
}
