//! Module containing the numerical workhorses: sparse matrix maths, LOESS,
//! SVD solvers and the statistical tests.

pub mod loess;
pub mod pca_svd;
pub mod sparse_math;
pub mod stats;
