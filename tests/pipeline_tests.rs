use rustc_hash::FxHashMap;

use scspot::core::base::sparse_math::log_normalise;
use scspot::core::data::synthetic_data::{generate_block_counts, generate_spot_grid, BlockDataConfig};
use scspot::single_cell::dge::top_markers;
use scspot::single_cell::methods::spatial::{spatially_variable_genes, SpatialParams};
use scspot::{run_pipeline, GeneSet, PipelineConfig};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn block_config() -> PipelineConfig {
    PipelineConfig {
        min_features: 5,
        max_control_fraction: 1.0,
        n_variable_features: 30,
        n_pca_components: 10,
        neighbor_k: 10,
        umap_neighbors: 10,
        umap_epochs: 50,
        random_seed: 7,
        ..Default::default()
    }
}

#[test]
fn pipeline_is_deterministic_on_two_blocks() {
    init_logging();
    let data = generate_block_counts(&BlockDataConfig::default(), 42).unwrap();
    assert_eq!(data.counts.n_obs(), 100);
    assert_eq!(data.counts.n_genes(), 50);

    let config = block_config();
    let first = run_pipeline(&data.counts, &config, None, None).unwrap();
    let second = run_pipeline(&data.counts, &config, None, None).unwrap();

    assert_eq!(first.clusters.labels, second.clusters.labels);
    assert!(first.clusters.n_clusters >= 2);

    let top = |res: &scspot::PipelineResult| -> Vec<(usize, String)> {
        top_markers(&res.markers, 1)
            .into_iter()
            .map(|r| (r.cluster, r.gene_id.clone()))
            .collect()
    };
    assert_eq!(top(&first), top(&second));
    assert_eq!(first.umap.coordinates, second.umap.coordinates);
}

#[test]
fn blocks_end_up_in_different_clusters() {
    init_logging();
    let data = generate_block_counts(&BlockDataConfig::default(), 1).unwrap();
    let res = run_pipeline(&data.counts, &block_config(), None, None).unwrap();

    // no cluster mixes cells of both blocks
    let obs_index: FxHashMap<&str, usize> = data
        .counts
        .obs_ids()
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();
    let mut block_of_cluster: FxHashMap<usize, usize> = FxHashMap::default();
    for (id, &label) in res.clusters.obs_ids.iter().zip(&res.clusters.labels) {
        let block = data.labels[obs_index[id.as_str()]];
        let seen = *block_of_cluster.entry(label).or_insert(block);
        assert_eq!(seen, block);
    }
}

#[test]
fn module_score_follows_block_markers() {
    init_logging();
    let data = generate_block_counts(&BlockDataConfig::default(), 5).unwrap();
    let markers: Vec<&str> = data.marker_genes[0]
        .iter()
        .map(|&g| data.counts.gene_ids()[g].as_str())
        .collect();
    let sets = vec![
        GeneSet::new("block_0", &markers),
        GeneSet::new("absent", &["not_a_gene"]),
    ];

    let res = run_pipeline(&data.counts, &block_config(), None, Some(&sets)).unwrap();
    let table = res.module_scores.as_ref().unwrap();
    let scores = table.get("block_0").unwrap();
    assert!(res.metadata.has_column("module_block_0"));
    assert!(table.get("absent").unwrap().iter().all(|&s| s == 0.0));
    assert!(!res.warnings.is_empty());

    let (mut in_block, mut n_in, mut out_block, mut n_out) = (0.0, 0, 0.0, 0);
    for (j, id) in table.obs_ids.iter().enumerate() {
        let idx = data.counts.obs_ids().iter().position(|o| o == id).unwrap();
        if data.labels[idx] == 0 {
            in_block += scores[j];
            n_in += 1;
        } else {
            out_block += scores[j];
            n_out += 1;
        }
    }
    assert!(in_block / n_in as f64 > out_block / n_out as f64 + 0.5);
}

#[test]
fn spatial_gene_detected_across_seeds() {
    init_logging();
    let mut noise_hits = 0;
    for seed in 0..5 {
        let spots = generate_spot_grid(10, 10, 5, seed).unwrap();
        let norm = log_normalise(&spots.counts, 1e4).unwrap();
        let res =
            spatially_variable_genes(&norm, &spots.coordinates, None, &SpatialParams::default()).unwrap();

        let smooth = res.iter().find(|g| g.gene_id == "smooth").unwrap();
        let noise = res.iter().find(|g| g.gene_id == "noise").unwrap();
        assert!(smooth.is_significant);
        assert!(smooth.rank < noise.rank);
        if noise.is_significant {
            noise_hits += 1;
        }
    }
    assert!(noise_hits <= 2);
}

#[test]
fn pipeline_on_spot_grid() {
    init_logging();
    let spots = generate_spot_grid(10, 10, 20, 3).unwrap();
    let config = PipelineConfig {
        min_features: 5,
        n_variable_features: 15,
        n_pca_components: 5,
        neighbor_k: 10,
        umap_neighbors: 10,
        umap_epochs: 30,
        ..Default::default()
    };
    let res = run_pipeline(&spots.counts, &config, Some(&spots.coordinates), None).unwrap();

    let spatial = res.spatial.as_ref().unwrap();
    assert_eq!(spatial.len(), res.normalised.n_genes());
    assert_eq!(spatial[0].rank, 1);
    for col in ["grid_row", "grid_col", "pixel_x", "pixel_y"] {
        assert!(res.metadata.has_column(col));
    }
}
