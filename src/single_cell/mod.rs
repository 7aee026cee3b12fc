//! Contains the single cell and spatial analysis stages. Each stage takes
//! explicit inputs and returns owned outputs; `pipeline` chains them.

pub mod clustering;
pub mod dge;
pub mod dim_reduction;
pub mod hvg;
pub mod methods;
pub mod pipeline;
pub mod processing;
pub mod sc_knn_snn;
