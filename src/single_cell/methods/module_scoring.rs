use rand::prelude::IndexedRandom;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::time::Instant;

use crate::config::PipelineConfig;
use crate::core::base::sparse_math::row_sums;
use crate::core::data::count_matrix::*;
use crate::error::{Result, ScError, StageWarning};

const STAGE: &str = "module_score";

////////////
// Params //
////////////

/// Parameters of the module scores
///
/// ### Fields
///
/// * `n_bins` - Number of expression bins.
/// * `n_ctrl` - Number of control genes drawn per set gene.
/// * `seed` - Seed for the control gene sampling.
#[derive(Clone, Debug, PartialEq)]
pub struct ModuleScoreParams {
    pub n_bins: usize,
    pub n_ctrl: usize,
    pub seed: u64,
}

impl Default for ModuleScoreParams {
    fn default() -> Self {
        (&PipelineConfig::default()).into()
    }
}

impl From<&PipelineConfig> for ModuleScoreParams {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            n_bins: config.module_score_bins,
            n_ctrl: config.module_score_control_size,
            seed: config.random_seed,
        }
    }
}

////////////////
// Structures //
////////////////

/// A named set of genes
///
/// ### Fields
///
/// * `name` - Name of the gene set.
/// * `genes` - Gene identifiers. Genes absent from the matrix are ignored.
#[derive(Clone, Debug, PartialEq)]
pub struct GeneSet {
    pub name: String,
    pub genes: Vec<String>,
}

impl GeneSet {
    /// Generate a new gene set
    pub fn new(name: &str, genes: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            genes: genes.iter().map(|g| g.to_string()).collect(),
        }
    }
}

/// Module scores of all gene sets
///
/// ### Fields
///
/// * `obs_ids` - The observation identifiers.
/// * `set_names` - The gene set names, in input order.
/// * `scores` - One vector per gene set with one score per observation.
/// * `warnings` - Empty or partially missing gene sets.
#[derive(Clone, Debug, PartialEq)]
pub struct ModuleScoreTable {
    pub obs_ids: Vec<String>,
    pub set_names: Vec<String>,
    pub scores: Vec<Vec<f64>>,
    pub warnings: Vec<StageWarning>,
}

impl ModuleScoreTable {
    /// Scores of a gene set by name
    pub fn get(&self, set: &str) -> Option<&[f64]> {
        self.set_names
            .iter()
            .position(|s| s == set)
            .map(|i| self.scores[i].as_slice())
    }

    /// All scores of one observation, in gene set order
    pub fn observation(&self, obs_idx: usize) -> Vec<f64> {
        self.scores.iter().map(|s| s[obs_idx]).collect()
    }
}

/////////////
// Helpers //
/////////////

/// Structure holding gene binning information
///
/// ### Fields
///
/// * `gene_to_bin` - Bin of every gene (by gene index)
/// * `bins` - Bin to gene lookup
struct GeneBins {
    gene_to_bin: Vec<usize>,
    bins: Vec<Vec<usize>>,
}

/// Create expression bins for genes
///
/// Bins genes into equal-sized groups based on average expression, ties
/// broken by gene index.
///
/// ### Params
///
/// * `avg_exp` - Average expression of every gene
/// * `nbin` - Number of bins to create
///
/// ### Returns
///
/// `GeneBins` structure with gene->bin mapping and bin->genes lookup
fn create_expression_bins(avg_exp: &[f64], nbin: usize) -> GeneBins {
    let mut sorted_genes: Vec<usize> = (0..avg_exp.len()).collect();
    sorted_genes.sort_by(|&a, &b| avg_exp[a].total_cmp(&avg_exp[b]).then(a.cmp(&b)));

    let total_genes = sorted_genes.len();
    let genes_per_bin = total_genes.div_ceil(nbin).max(1);

    let mut gene_to_bin = vec![0; total_genes];
    let mut bins: Vec<Vec<usize>> = vec![Vec::new(); nbin];

    for (i, &gene_idx) in sorted_genes.iter().enumerate() {
        let bin_id = (i / genes_per_bin).min(nbin - 1);
        gene_to_bin[gene_idx] = bin_id;
        bins[bin_id].push(gene_idx);
    }

    GeneBins { gene_to_bin, bins }
}

/// Sample control genes for a gene set
///
/// For each gene in the set, samples `ctrl` genes from the same expression
/// bin without replacement.
///
/// ### Params
///
/// * `gene_set` - Slice of gene indices in the set
/// * `gene_bins` - Gene binning structure
/// * `ctrl` - Number of control genes per feature
/// * `rng` - Random number generator
///
/// ### Returns
///
/// Sorted, unique control gene indices
fn sample_control_genes(gene_set: &[usize], gene_bins: &GeneBins, ctrl: usize, rng: &mut StdRng) -> Vec<usize> {
    let mut controls = Vec::new();

    for &gene_idx in gene_set {
        let bin_genes = &gene_bins.bins[gene_bins.gene_to_bin[gene_idx]];
        controls.extend(bin_genes.choose_multiple(rng, ctrl.min(bin_genes.len())).copied());
    }

    controls.sort_unstable();
    controls.dedup();
    controls
}

/// Mean expression of a gene subset in one observation
///
/// `genes` must be sorted; the column indices are sorted by construction.
fn subset_mean(col_idx: &[usize], col_vals: &[f64], genes: &[usize]) -> f64 {
    if genes.is_empty() {
        return 0.0;
    }
    let sum: f64 = genes
        .iter()
        .filter_map(|g| col_idx.binary_search(g).ok().map(|pos| col_vals[pos]))
        .sum();
    sum / genes.len() as f64
}

/// Resolve gene ids to sorted, unique indices
///
/// ### Returns
///
/// Tuple of `(indices, number of ids not found)`
fn resolve_genes(set: &GeneSet, lookup: &FxHashMap<&str, usize>) -> (Vec<usize>, usize) {
    let mut missing = 0;
    let mut idx: Vec<usize> = Vec::with_capacity(set.genes.len());
    for g in &set.genes {
        match lookup.get(g.as_str()) {
            Some(&i) => idx.push(i),
            None => missing += 1,
        }
    }
    idx.sort_unstable();
    idx.dedup();
    (idx, missing)
}

///////////////
// Functions //
///////////////

/// Calculate the module scores
///
/// Score of an observation is the mean expression of the set genes minus the
/// mean expression of control genes sampled from the same average-expression
/// bins. A single generator seeded with `seed` draws the controls of all
/// sets in input order.
///
/// ### Params
///
/// * `mat` - The log-normalised gene x observation matrix.
/// * `gene_sets` - The gene sets.
/// * `params` - The `ModuleScoreParams`.
///
/// ### Returns
///
/// The `ModuleScoreTable`. Sets without any gene in the matrix are scored 0
/// and reported as a warning.
pub fn calculate_module_scores(
    mat: &NormalisedMatrix,
    gene_sets: &[GeneSet],
    params: &ModuleScoreParams,
) -> Result<ModuleScoreTable> {
    if params.n_bins == 0 {
        return Err(ScError::config("module_score_bins", "must be > 0"));
    }
    if params.n_ctrl == 0 {
        return Err(ScError::config("module_score_control_size", "must be > 0"));
    }
    let mut names: Vec<&str> = gene_sets.iter().map(|s| s.name.as_str()).collect();
    names.sort_unstable();
    if let Some(w) = names.windows(2).find(|w| w[0] == w[1]) {
        return Err(ScError::input(
            STAGE,
            format!("gene set `{}` is given more than once", w[0]),
        ));
    }

    let start = Instant::now();

    let n_obs = mat.n_obs();
    let avg_exp: Vec<f64> = row_sums(mat)
        .into_iter()
        .map(|s| if n_obs > 0 { s / n_obs as f64 } else { 0.0 })
        .collect();
    let gene_bins = create_expression_bins(&avg_exp, params.n_bins);
    let lookup = mat.gene_index_map();

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut warnings = Vec::new();
    let mut resolved: Vec<(Vec<usize>, Vec<usize>)> = Vec::with_capacity(gene_sets.len());

    for set in gene_sets {
        let (genes, missing) = resolve_genes(set, &lookup);
        if genes.is_empty() {
            warnings.push(StageWarning::EmptyGeneSet {
                set: set.name.clone(),
            });
            resolved.push((genes, Vec::new()));
            continue;
        }
        if missing > 0 {
            warnings.push(StageWarning::MissingGenes {
                set: set.name.clone(),
                missing,
            });
        }
        let controls = sample_control_genes(&genes, &gene_bins, params.n_ctrl, &mut rng);
        resolved.push((genes, controls));
    }
    warnings.iter().for_each(|w| w.log());

    let per_obs: Vec<Vec<f64>> = (0..n_obs)
        .into_par_iter()
        .map(|j| {
            let (idx, vals) = mat.column(j);
            resolved
                .iter()
                .map(|(genes, controls)| {
                    if genes.is_empty() {
                        0.0
                    } else {
                        subset_mean(idx, vals, genes) - subset_mean(idx, vals, controls)
                    }
                })
                .collect()
        })
        .collect();

    // Transpose: cells x modules -> modules x cells
    let mut scores: Vec<Vec<f64>> = vec![Vec::with_capacity(n_obs); gene_sets.len()];
    for obs_scores in per_obs {
        for (module_idx, score) in obs_scores.into_iter().enumerate() {
            scores[module_idx].push(score);
        }
    }

    log::info!(
        "Calculated {} module scores for {} observations in {:.2?}",
        gene_sets.len(),
        n_obs,
        start.elapsed()
    );

    Ok(ModuleScoreTable {
        obs_ids: mat.obs_ids().to_vec(),
        set_names: gene_sets.iter().map(|s| s.name.clone()).collect(),
        scores,
        warnings,
    })
}

///////////
// Tests //
///////////
