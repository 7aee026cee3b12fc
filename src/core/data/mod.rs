//! Module containing anything and everything related to data and data
//! structures

pub mod count_matrix;
pub mod metadata;
pub mod sparse_structures;
pub mod spatial_coordinates;
pub mod synthetic_data;
