//! Gene set and ancestor resolution.
//!
//! A resolution run turns every mutable tag a config (and its ancestors)
//! references into a pinned identifier, and fetches each ancestor's config.
//! Each distinct tag is resolved at most once per run: once a tag is in the
//! resolved map it is never asked for again, so all fragments referencing it
//! see the same pinned identifier even if the tag moves mid-run.
//!
//! Ancestor traversal is a loop over an append-only visited sequence; a cycle is
//! detected purely from that sequence before anything is fetched for the
//! repeated ancestor.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::catlet_config::CatletConfig;
use crate::error::ResolutionError;
use crate::genepool::GenePool;
use crate::genes::{Architecture, GeneIdentifier, GeneSetIdentifier, UniqueGeneIdentifier};

/// Referenced gene set → pinned gene set.
pub type ResolvedGeneSets = BTreeMap<GeneSetIdentifier, GeneSetIdentifier>;

/// Pinned ancestor → that ancestor's own config.
pub type ResolvedConfigs = BTreeMap<GeneSetIdentifier, CatletConfig>;

/// One traversed parent reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AncestorInfo {
    pub requested: GeneSetIdentifier,
    pub resolved: GeneSetIdentifier,
}

/// Result of walking a parent chain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParentChain {
    pub gene_sets: ResolvedGeneSets,
    pub configs: ResolvedConfigs,
    /// Path from the catlet towards the root, in discovery order.
    pub ancestors: Vec<AncestorInfo>,
}

/// Render a chain as `a -> b -> c` using the requested identifiers.
pub fn format_chain(chain: &[AncestorInfo]) -> String {
    chain
        .iter()
        .map(|a| a.requested.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Extend `visited` with `next`, failing if `next` resolves to an ancestor that
/// was already visited. The returned chain includes `next`.
pub fn check_ancestry(
    visited: &[AncestorInfo],
    next: AncestorInfo,
) -> Result<Vec<AncestorInfo>, ResolutionError> {
    let is_cycle = visited.iter().any(|a| a.resolved == next.resolved);
    let mut chain = visited.to_vec();
    chain.push(next);
    if is_cycle {
        return Err(ResolutionError::CyclicAncestryDetected { chain });
    }
    Ok(chain)
}

pub(crate) fn parse_gene_reference(source: &str) -> Result<GeneIdentifier, ResolutionError> {
    source
        .parse()
        .map_err(|e: crate::genes::IdentifierError| ResolutionError::InvalidGeneReference {
            reference: source.to_string(),
            reason: e.reason,
        })
}

pub(crate) fn parse_parent(config: &CatletConfig) -> Result<Option<GeneSetIdentifier>, ResolutionError> {
    config
        .parent_id()
        .map_err(|e| ResolutionError::InvalidGeneReference {
            reference: e.value,
            reason: e.reason,
        })
}

async fn resolve_one(
    pool: &dyn GenePool,
    id: &GeneSetIdentifier,
    resolved: &mut ResolvedGeneSets,
) -> Result<GeneSetIdentifier, ResolutionError> {
    if let Some(pinned) = resolved.get(id) {
        return Ok(pinned.clone());
    }
    let failed = |reason: String| ResolutionError::GeneResolutionFailed {
        gene_set: id.to_string(),
        reason,
    };
    let pinned = pool
        .resolve_gene_set(id)
        .await
        .map_err(|e| failed(e.to_string()))?
        .ok_or_else(|| failed("gene set not found".to_string()))?;
    debug!(gene_set = %id, pinned = %pinned, "resolved gene set");
    resolved.insert(id.clone(), pinned.clone());
    Ok(pinned)
}

/// Resolve every gene set referenced by `config`'s fodder and drive sources
/// that is not in `already_resolved` yet.
pub async fn resolve_gene_sets(
    config: &CatletConfig,
    already_resolved: ResolvedGeneSets,
    pool: &dyn GenePool,
) -> Result<ResolvedGeneSets, ResolutionError> {
    let mut seen = BTreeSet::new();
    let mut referenced = Vec::new();
    for source in config.gene_references() {
        let gene_set = parse_gene_reference(source)?.gene_set().clone();
        if seen.insert(gene_set.clone()) {
            referenced.push(gene_set);
        }
    }

    let mut resolved = already_resolved;
    for gene_set in &referenced {
        resolve_one(pool, gene_set, &mut resolved).await?;
    }
    Ok(resolved)
}

async fn read_ancestor_config(
    pool: &dyn GenePool,
    ancestor: &GeneSetIdentifier,
) -> Result<CatletConfig, ResolutionError> {
    let unavailable = |reason: String| ResolutionError::AncestorGeneUnavailable {
        ancestor: ancestor.to_string(),
        reason,
    };
    let gene = UniqueGeneIdentifier::catlet(ancestor.clone(), Architecture::Any);
    let content = pool
        .read_gene_content(&gene)
        .await
        .map_err(|e| unavailable(e.to_string()))?
        .ok_or_else(|| unavailable("catlet gene not found".to_string()))?;
    let config = CatletConfig::from_slice(&content)
        .map_err(|e| unavailable(format!("invalid catlet config: {e}")))?;
    config
        .validate_drive_names()
        .map_err(|e| unavailable(format!("invalid catlet config: {e}")))?;
    Ok(config)
}

/// Walk the ancestors starting at `parent`.
///
/// Ancestors already present in `resolved_configs` are not fetched again; the
/// walk still passes through them so the returned chain is the complete path.
pub async fn resolve_parent_chain(
    parent: Option<&GeneSetIdentifier>,
    resolved_gene_sets: ResolvedGeneSets,
    resolved_configs: ResolvedConfigs,
    visited: Vec<AncestorInfo>,
    pool: &dyn GenePool,
) -> Result<ParentChain, ResolutionError> {
    let mut gene_sets = resolved_gene_sets;
    let mut configs = resolved_configs;
    let mut visited = visited;
    let mut next = parent.cloned();

    while let Some(requested) = next.take() {
        let resolved = resolve_one(pool, &requested, &mut gene_sets).await?;
        visited = check_ancestry(
            &visited,
            AncestorInfo {
                requested,
                resolved: resolved.clone(),
            },
        )?;

        let parent_of_ancestor = match configs.get(&resolved) {
            Some(config) => parse_parent(config)?,
            None => {
                let config = read_ancestor_config(pool, &resolved).await?;
                gene_sets = resolve_gene_sets(&config, gene_sets, pool).await?;
                let parent = parse_parent(&config)?;
                debug!(ancestor = %resolved, parent = ?parent.as_ref().map(|p| p.to_string()), "fetched ancestor config");
                configs.insert(resolved, config);
                parent
            }
        };
        next = parent_of_ancestor;
    }

    Ok(ParentChain {
        gene_sets,
        configs,
        ancestors: visited,
    })
}

/// Resolve a catlet config: its own gene sets, then its whole parent chain.
pub async fn resolve_config(
    config: &CatletConfig,
    pool: &dyn GenePool,
) -> Result<ParentChain, ResolutionError> {
    let gene_sets = resolve_gene_sets(config, ResolvedGeneSets::new(), pool).await?;
    let parent = parse_parent(config)?;
    resolve_parent_chain(
        parent.as_ref(),
        gene_sets,
        ResolvedConfigs::new(),
        Vec::new(),
        pool,
    )
    .await
}
