use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::info;

use crate::breeding::breed_chain;
use crate::catlet_config::CatletConfig;
use crate::error::{ResolutionError, SpecificationError};
use crate::genepool::GenePool;
use crate::genes::{Architecture, GeneType, UniqueGeneIdentifier};
use crate::resolution::{
    format_chain, parse_gene_reference, resolve_config, AncestorInfo, ResolvedGeneSets,
};

/// Fully resolved and bred catlet configuration plus everything needed to
/// materialize it on an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedSpecification {
    /// Effective config; carries no mutable tags.
    pub config: CatletConfig,
    pub gene_sets: ResolvedGeneSets,
    pub ancestors: Vec<AncestorInfo>,
    /// Genes the agent must hold locally, in first-use order.
    pub genes: Vec<UniqueGeneIdentifier>,
    pub architecture: Architecture,
}

/// Genes referenced by a bred config and its ancestors.
pub fn required_genes(
    config: &CatletConfig,
    ancestors: &[AncestorInfo],
    architecture: Architecture,
) -> Result<Vec<UniqueGeneIdentifier>, ResolutionError> {
    let mut seen = BTreeSet::new();
    let mut genes = Vec::new();
    let mut push = |gene: UniqueGeneIdentifier| {
        if seen.insert(gene.clone()) {
            genes.push(gene);
        }
    };

    for ancestor in ancestors {
        push(UniqueGeneIdentifier::catlet(ancestor.resolved.clone(), architecture));
    }
    for drive in &config.drives {
        if let Some(source) = drive.source.as_deref() {
            let id = parse_gene_reference(source)?;
            push(UniqueGeneIdentifier::new(GeneType::Volume, id, architecture));
        }
    }
    for fragment in &config.fodder {
        if let Some(source) = fragment.source.as_deref() {
            let id = parse_gene_reference(source)?;
            push(UniqueGeneIdentifier::new(GeneType::Fodder, id, architecture));
        }
    }
    Ok(genes)
}

/// Resolve `config` against the gene pool and breed it with its ancestry.
pub async fn resolve_specification(
    config: &CatletConfig,
    architecture: Architecture,
    pool: &dyn GenePool,
) -> Result<ResolvedSpecification, SpecificationError> {
    let chain = resolve_config(config, pool).await?;
    let bred = breed_chain(config, &chain)?;
    let genes = required_genes(&bred, &chain.ancestors, architecture)?;

    info!(
        catlet = %bred.name,
        ancestry = %format_chain(&chain.ancestors),
        genes = genes.len(),
        "resolved catlet specification"
    );

    Ok(ResolvedSpecification {
        config: bred,
        gene_sets: chain.gene_sets,
        ancestors: chain.ancestors,
        genes,
        architecture,
    })
}
