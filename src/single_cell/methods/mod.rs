//! Specific named methods in the single cell space are implemented here:
//! the UMAP layout, Seurat-style module scores and spatial autocorrelation.

pub mod module_scoring;
pub mod spatial;
pub mod umap;
