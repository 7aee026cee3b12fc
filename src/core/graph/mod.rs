//! Anything and everything related to graphs

pub mod knn;
pub mod leiden;
