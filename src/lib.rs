//! Single cell and spatial transcriptomics analysis engine.
//!
//! Takes an in-memory sparse gene x observation count matrix and produces
//! QC-filtered, normalised, clustered and annotated results, plus spatial
//! autocorrelation rankings for spot-resolved data. Reading and writing
//! files is left to the caller.

pub mod config;
pub mod core;
pub mod error;
pub mod single_cell;

pub use config::{PcaSolver, PipelineConfig};
pub use crate::core::data::count_matrix::{CountMatrix, NormalisedMatrix};
pub use crate::core::data::metadata::ObservationMetadata;
pub use crate::core::data::spatial_coordinates::SpatialCoordinates;
pub use error::{Result, ScError, StageWarning};
pub use single_cell::methods::module_scoring::GeneSet;
pub use single_cell::pipeline::{run_pipeline, PipelineResult};
