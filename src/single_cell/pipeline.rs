use std::time::Instant;

use crate::config::PipelineConfig;
use crate::core::base::sparse_math::{log1p, normalise_total, scale_genes};
use crate::core::data::count_matrix::*;
use crate::core::data::metadata::ObservationMetadata;
use crate::core::data::spatial_coordinates::SpatialCoordinates;
use crate::core::graph::leiden::LeidenParams;
use crate::error::{Result, StageWarning};
use crate::single_cell::clustering::{cluster_observations, ClusterAssignment};
use crate::single_cell::dge::{find_markers, MarkerParams, MarkerTable};
use crate::single_cell::dim_reduction::{run_pca, PcaParams, ReducedEmbedding};
use crate::single_cell::hvg::{get_hvg_vst, FeatureStatistics, HvgParams};
use crate::single_cell::methods::module_scoring::{
    calculate_module_scores, GeneSet, ModuleScoreParams, ModuleScoreTable,
};
use crate::single_cell::methods::spatial::{
    spatially_variable_genes, SpatialParams, SpatialVariableGene,
};
use crate::single_cell::methods::umap::{run_umap, UmapEmbedding, UmapParams};
use crate::single_cell::processing::{run_qc, QcParams, QcReport};
use crate::single_cell::sc_knn_snn::{build_snn_graph, NeighbourGraph, SnnParams};

/// Prefix of the module score columns in the observation metadata
pub const MODULE_SCORE_PREFIX: &str = "module_";

/// Everything the pipeline produces
///
/// ### Fields
///
/// * `counts` - The QC filtered counts.
/// * `normalised` - Log-normalised counts of the filtered observations.
/// * `qc` - The `QcReport` on the input observations.
/// * `features` - Variable feature statistics.
/// * `pca` - The PCA embedding on the variable features.
/// * `graph` - Shared nearest neighbour graph.
/// * `clusters` - Leiden clusters.
/// * `umap` - 2D layout.
/// * `markers` - Marker genes per cluster.
/// * `module_scores` - Gene set scores if gene sets were provided.
/// * `spatial` - Spatial ranking of all genes if coordinates were provided.
/// * `metadata` - Per observation annotations collected along the way.
/// * `warnings` - Non-fatal warnings of all stages, in stage order.
#[derive(Clone, Debug)]
pub struct PipelineResult {
    pub counts: CountMatrix,
    pub normalised: NormalisedMatrix,
    pub qc: QcReport,
    pub features: FeatureStatistics,
    pub pca: ReducedEmbedding,
    pub graph: NeighbourGraph,
    pub clusters: ClusterAssignment,
    pub umap: UmapEmbedding,
    pub markers: MarkerTable,
    pub module_scores: Option<ModuleScoreTable>,
    pub spatial: Option<Vec<SpatialVariableGene>>,
    pub metadata: ObservationMetadata,
    pub warnings: Vec<StageWarning>,
}

/// Values of the kept observations
fn kept<T: Clone>(values: &[T], mask: &[bool]) -> Vec<T> {
    values
        .iter()
        .zip(mask)
        .filter(|(_, &k)| k)
        .map(|(v, _)| v.clone())
        .collect()
}

/// Keep the output of an optional stage or record why it is missing
fn optional_stage<T>(stage: &'static str, res: Result<T>, warnings: &mut Vec<StageWarning>) -> Option<T> {
    match res {
        Ok(out) => Some(out),
        Err(error) => {
            let warning = StageWarning::StageFailed { stage, error };
            warning.log();
            warnings.push(warning);
            None
        }
    }
}

/// Module scores plus their metadata columns
///
/// The columns are only added if the whole stage succeeds.
fn module_score_stage(
    normalised: &NormalisedMatrix,
    gene_sets: &[GeneSet],
    config: &PipelineConfig,
    metadata: &mut ObservationMetadata,
) -> Result<ModuleScoreTable> {
    let table = calculate_module_scores(normalised, gene_sets, &ModuleScoreParams::from(config))?;
    let mut updated = metadata.clone();
    for (name, scores) in table.set_names.iter().zip(&table.scores) {
        updated.add_numeric_column(&format!("{}{}", MODULE_SCORE_PREFIX, name), scores.clone())?;
    }
    *metadata = updated;
    Ok(table)
}

/// Spatially variable genes plus the spot position columns
fn spatial_stage(
    normalised: &NormalisedMatrix,
    coordinates: &SpatialCoordinates,
    config: &PipelineConfig,
    metadata: &mut ObservationMetadata,
) -> Result<Vec<SpatialVariableGene>> {
    let aligned = coordinates.align_to(normalised.obs_ids())?;
    let genes = spatially_variable_genes(normalised, &aligned, None, &SpatialParams::from(config))?;

    let (rows, cols): (Vec<i64>, Vec<i64>) = aligned.grid().iter().copied().unzip();
    let (xs, ys): (Vec<f64>, Vec<f64>) = aligned.pixel().iter().copied().unzip();
    let mut updated = metadata.clone();
    updated.add_integer_column("grid_row", rows)?;
    updated.add_integer_column("grid_col", cols)?;
    updated.add_numeric_column("pixel_x", xs)?;
    updated.add_numeric_column("pixel_y", ys)?;
    *metadata = updated;
    Ok(genes)
}

/// Run the full analysis on a count matrix
///
/// QC, normalisation, variable features, scaling, PCA, SNN graph, Leiden,
/// UMAP, markers and, if provided, module scores and spatial
/// autocorrelation. Every stage receives its parameters from `config`.
///
/// The core stages up to the markers feed into each other, so an error in
/// any of them ends the run. Module scoring and the spatial ranking only
/// read the core outputs; if one of them fails its output is `None` and a
/// `StageWarning::StageFailed` is recorded instead.
///
/// ### Params
///
/// * `counts` - Raw gene x observation counts.
/// * `config` - The `PipelineConfig`.
/// * `coordinates` - Optional spot coordinates keyed by observation id.
/// * `gene_sets` - Optional gene sets to score.
///
/// ### Returns
///
/// The `PipelineResult`
pub fn run_pipeline(
    counts: &CountMatrix,
    config: &PipelineConfig,
    coordinates: Option<&SpatialCoordinates>,
    gene_sets: Option<&[GeneSet]>,
) -> Result<PipelineResult> {
    config.validate()?;
    let start = Instant::now();
    let mut warnings = Vec::new();

    // qc
    let (filtered, qc) = run_qc(counts, &QcParams::from(config))?;
    let mask = &qc.cells.to_keep;
    let mut metadata = ObservationMetadata::new(filtered.obs_ids().to_vec())?;
    metadata.add_numeric_column("total_counts", kept(&qc.cells.lib_size, mask))?;
    metadata.add_integer_column(
        "n_features",
        kept(&qc.cells.no_genes, mask).into_iter().map(|n| n as i64).collect(),
    )?;
    metadata.add_numeric_column("control_fraction", kept(&qc.cells.control_fraction, mask))?;

    // normalisation and feature selection
    let lib_normalised = normalise_total(&filtered, config.target_sum)?;
    let features = get_hvg_vst(&lib_normalised, &HvgParams::from(config))?;
    let normalised = log1p(&lib_normalised)?;
    drop(lib_normalised);

    let selected = features.selected_indices();
    let selected_ids: Vec<String> = selected
        .iter()
        .map(|&g| features.gene_ids[g].clone())
        .collect();
    let scaled = scale_genes(&normalised, &selected, config.scale_clip)?;

    // embedding, graph, clusters
    let pca = run_pca(
        scaled.as_ref(),
        normalised.obs_ids(),
        &selected_ids,
        &PcaParams::from(config),
    )?;
    drop(scaled);

    let graph = build_snn_graph(
        pca.leading(config.neighbor_dims),
        pca.obs_ids.as_slice(),
        &SnnParams::from(config),
    )?;
    let clusters = cluster_observations(&graph, &LeidenParams::from(config))?;
    warnings.extend(clusters.warnings.iter().cloned());
    metadata.add_integer_column(
        "cluster",
        clusters.labels.iter().map(|&l| l as i64).collect(),
    )?;

    let umap = run_umap(
        pca.leading(config.neighbor_dims),
        pca.obs_ids.as_slice(),
        &UmapParams::from(config),
    )?;
    for d in 0..umap.coordinates.ncols() {
        let column = (0..umap.coordinates.nrows())
            .map(|i| umap.coordinates[(i, d)])
            .collect();
        metadata.add_numeric_column(&format!("umap_{}", d + 1), column)?;
    }

    // annotation
    let markers = find_markers(&normalised, &clusters, &MarkerParams::from(config))?;
    warnings.extend(markers.warnings.iter().cloned());

    let module_scores = gene_sets.and_then(|sets| {
        let res = module_score_stage(&normalised, sets, config, &mut metadata);
        optional_stage("module_scores", res, &mut warnings)
    });
    if let Some(table) = &module_scores {
        warnings.extend(table.warnings.iter().cloned());
    }

    let spatial = coordinates.and_then(|coords| {
        let res = spatial_stage(&normalised, coords, config, &mut metadata);
        optional_stage("spatial", res, &mut warnings)
    });

    log::info!(
        "Pipeline finished on {} observations x {} genes: {} clusters, {} warnings in {:.2?}",
        normalised.n_obs(),
        normalised.n_genes(),
        clusters.n_clusters,
        warnings.len(),
        start.elapsed()
    );

    Ok(PipelineResult {
        counts: filtered,
        normalised,
        qc,
        features,
        pca,
        graph,
        clusters,
        umap,
        markers,
        module_scores,
        spatial,
        metadata,
        warnings,
    })
}

///////////
// Tests //
///////////
