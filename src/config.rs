//! Configuration surface of the engine.
//!
//! A single explicit `PipelineConfig` holds every tunable of the pipeline.
//! Stages take their own parameter structures, which implement
//! `From<&PipelineConfig>`, so that every stage can also be called on its own.

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Result, ScError};

///////////
// Enums //
///////////

/// Which SVD solver to use for the PCA
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PcaSolver {
    /// Full thin SVD of the scaled matrix
    Exact,
    /// Randomised SVD (seeded)
    Randomised,
}

/// Helper function to parse the PCA solver
///
/// ### Params
///
/// * `s` - Name of the solver
///
/// ### Returns
///
/// Option of the `PcaSolver`
pub fn parse_pca_solver(s: &str) -> Option<PcaSolver> {
    match s.to_lowercase().as_str() {
        "exact" => Some(PcaSolver::Exact),
        "randomised" | "randomized" => Some(PcaSolver::Randomised),
        _ => None,
    }
}

/// Deserialise the PCA solver from its (case-insensitive) name
fn deserialize_pca_solver<'de, D>(deserializer: D) -> std::result::Result<PcaSolver, D::Error>
where
    D: Deserializer<'de>,
{
    let name = String::deserialize(deserializer)?;
    parse_pca_solver(&name)
        .ok_or_else(|| serde::de::Error::custom(format!("unknown PCA solver `{}`", name)))
}

/////////////
// Config  //
/////////////

/// Configuration of the full analysis pipeline
///
/// ### Fields
///
/// * `min_features` - Minimum number of detected genes per observation.
/// * `min_total_counts` - Minimum total count per observation.
/// * `min_cells_per_gene` - Genes detected in fewer observations are dropped
///   before normalisation. `0` keeps all genes.
/// * `max_control_fraction` - Maximum fraction of counts from the control
///   gene set (e.g. mitochondrial genes). In `[0, 1]`.
/// * `control_gene_prefix` - Prefix identifying the control genes.
/// * `target_sum` - Library size each observation is scaled to.
/// * `n_variable_features` - Number of highly variable genes to select.
/// * `loess_span` - Span of the LOESS mean-variance trend.
/// * `scale_clip` - Absolute value at which scaled data is clipped.
/// * `n_pca_components` - Number of principal components.
/// * `pca_solver` - SVD solver used for the PCA.
/// * `neighbor_k` - Number of neighbours in the kNN graph.
/// * `neighbor_dims` - Number of leading PCs used for the kNN search. `None`
///   uses all computed components.
/// * `snn_prune` - SNN edges with a Jaccard similarity at or below this are
///   removed unless the pair is a kNN pair. In `[0, 1)`.
/// * `cluster_resolution` - Resolution of the modularity objective.
/// * `cluster_max_iterations` - Iteration cap of the community detection.
/// * `umap_neighbors` - Number of neighbours for the UMAP graph.
/// * `umap_epochs` - Number of UMAP optimisation epochs.
/// * `umap_min_dist` - UMAP minimum distance.
/// * `marker_min_pct` - Minimum detection fraction in either group.
/// * `marker_min_logfc` - Minimum average log2 fold change.
/// * `marker_only_positive` - Only report up-regulated markers.
/// * `module_score_bins` - Number of expression bins for control genes.
/// * `module_score_control_size` - Control genes sampled per set gene.
/// * `spatial_k` - Neighbours per spot in the spatial graph.
/// * `spatial_alpha` - Significance threshold on the adjusted p-value.
/// * `spatial_permutations` - Number of permutations for Moran's I. `0`
///   uses the analytic normal approximation.
/// * `random_seed` - Seed threaded through every randomised step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub min_features: usize,
    pub min_total_counts: f64,
    pub min_cells_per_gene: usize,
    pub max_control_fraction: f64,
    pub control_gene_prefix: String,
    pub target_sum: f64,
    pub n_variable_features: usize,
    pub loess_span: f64,
    pub scale_clip: f64,
    pub n_pca_components: usize,
    #[serde(deserialize_with = "deserialize_pca_solver")]
    pub pca_solver: PcaSolver,
    pub neighbor_k: usize,
    pub neighbor_dims: Option<usize>,
    pub snn_prune: f64,
    pub cluster_resolution: f64,
    pub cluster_max_iterations: usize,
    pub umap_neighbors: usize,
    pub umap_epochs: usize,
    pub umap_min_dist: f64,
    pub marker_min_pct: f64,
    pub marker_min_logfc: f64,
    pub marker_only_positive: bool,
    pub module_score_bins: usize,
    pub module_score_control_size: usize,
    pub spatial_k: usize,
    pub spatial_alpha: f64,
    pub spatial_permutations: usize,
    pub random_seed: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_features: 200,
            min_total_counts: 0.0,
            min_cells_per_gene: 0,
            max_control_fraction: 0.05,
            control_gene_prefix: "MT-".to_string(),
            target_sum: 1e4,
            n_variable_features: 2000,
            loess_span: 0.3,
            scale_clip: 10.0,
            n_pca_components: 50,
            pca_solver: PcaSolver::Exact,
            neighbor_k: 20,
            neighbor_dims: None,
            snn_prune: 0.0,
            cluster_resolution: 0.8,
            cluster_max_iterations: 100,
            umap_neighbors: 15,
            umap_epochs: 200,
            umap_min_dist: 0.1,
            marker_min_pct: 0.25,
            marker_min_logfc: 0.25,
            marker_only_positive: true,
            module_score_bins: 24,
            module_score_control_size: 100,
            spatial_k: 6,
            spatial_alpha: 0.05,
            spatial_permutations: 0,
            random_seed: 42,
        }
    }
}

impl PipelineConfig {
    /// Check that every parameter is within its valid range
    ///
    /// ### Returns
    ///
    /// `Ok(())` or the `ScError::Configuration` naming the offending
    /// parameter.
    pub fn validate(&self) -> Result<()> {
        check_fraction("max_control_fraction", self.max_control_fraction)?;
        check_fraction("marker_min_pct", self.marker_min_pct)?;
        check_fraction("snn_prune", self.snn_prune)?;
        if self.snn_prune >= 1.0 {
            return Err(ScError::config("snn_prune", "must be below 1"));
        }
        check_positive_usize("n_variable_features", self.n_variable_features)?;
        check_positive_usize("n_pca_components", self.n_pca_components)?;
        check_positive_usize("neighbor_k", self.neighbor_k)?;
        check_positive_usize("cluster_max_iterations", self.cluster_max_iterations)?;
        check_positive_usize("umap_epochs", self.umap_epochs)?;
        check_positive_usize("module_score_bins", self.module_score_bins)?;
        check_positive_usize("module_score_control_size", self.module_score_control_size)?;
        check_positive_usize("spatial_k", self.spatial_k)?;

        if self.umap_neighbors < 2 {
            return Err(ScError::config("umap_neighbors", "must be >= 2"));
        }
        if let Some(dims) = self.neighbor_dims {
            check_positive_usize("neighbor_dims", dims)?;
        }
        check_positive_f64("target_sum", self.target_sum)?;
        check_positive_f64("cluster_resolution", self.cluster_resolution)?;
        check_positive_f64("scale_clip", self.scale_clip)?;
        if !(self.loess_span > 0.0 && self.loess_span <= 1.0) {
            return Err(ScError::config("loess_span", "must be in (0, 1]"));
        }
        if !(self.min_total_counts >= 0.0) {
            return Err(ScError::config("min_total_counts", "must be >= 0"));
        }
        if !(self.marker_min_logfc >= 0.0) {
            return Err(ScError::config("marker_min_logfc", "must be >= 0"));
        }
        if !(self.umap_min_dist >= 0.0) {
            return Err(ScError::config("umap_min_dist", "must be >= 0"));
        }
        if !(self.spatial_alpha > 0.0 && self.spatial_alpha < 1.0) {
            return Err(ScError::config("spatial_alpha", "must be in (0, 1)"));
        }

        Ok(())
    }
}

/////////////
// Helpers //
/////////////

fn check_fraction(parameter: &'static str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ScError::config(
            parameter,
            format!("must be in [0, 1], got {}", value),
        ))
    }
}

fn check_positive_usize(parameter: &'static str, value: usize) -> Result<()> {
    if value > 0 {
        Ok(())
    } else {
        Err(ScError::config(parameter, "must be > 0"))
    }
}

fn check_positive_f64(parameter: &'static str, value: f64) -> Result<()> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ScError::config(
            parameter,
            format!("must be a finite value > 0, got {}", value),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_resolution() {
        let config = PipelineConfig {
            cluster_resolution: 0.0,
            ..Default::default()
        };
        match config.validate() {
            Err(ScError::Configuration { parameter, .. }) => {
                assert_eq!(parameter, "cluster_resolution")
            }
            other => panic!("Expected a configuration error, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_fraction_and_k() {
        let config = PipelineConfig {
            max_control_fraction: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PipelineConfig {
            neighbor_k: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"neighbor_k": 10, "pca_solver": "randomised"}"#).unwrap();
        assert_eq!(config.neighbor_k, 10);
        assert_eq!(config.pca_solver, PcaSolver::Randomised);
        assert_eq!(config.n_variable_features, 2000);
    }

    #[test]
    fn test_pca_solver_names() {
        assert_eq!(parse_pca_solver("EXACT"), Some(PcaSolver::Exact));
        assert_eq!(parse_pca_solver("randomized"), Some(PcaSolver::Randomised));
        assert_eq!(parse_pca_solver("lanczos"), None);

        let config: PipelineConfig = serde_json::from_str(r#"{"pca_solver": "Randomized"}"#).unwrap();
        assert_eq!(config.pca_solver, PcaSolver::Randomised);
        assert!(serde_json::from_str::<PipelineConfig>(r#"{"pca_solver": "lanczos"}"#).is_err());

        let round_trip: PipelineConfig =
            serde_json::from_str(&serde_json::to_string(&config).unwrap()).unwrap();
        assert_eq!(round_trip, config);
    }
}
