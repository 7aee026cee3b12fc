//! Building blocks shared by the single cell functionality: data
//! structures, sparse and dense maths, statistics and graphs.

pub mod base;
pub mod data;
pub mod graph;
