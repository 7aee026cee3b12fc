//! Error and warning types shared by every stage of the engine.
//!
//! Hard failures (structural problems with the input, invalid parameters)
//! surface as `ScError` and abort only the stage that raised them. Per-item
//! shortfalls and iteration caps are `StageWarning` values that travel with
//! the stage output instead.

use thiserror::Error;

////////////
// Errors //
////////////

/// Errors that abort a single stage
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScError {
    /// Malformed or mismatched input (dimensions, identifiers, infeasible
    /// parameters such as a PCA rank above the matrix rank).
    #[error("[{stage}] invalid input: {message}")]
    Input { stage: &'static str, message: String },

    /// A parameter is outside of its valid range.
    #[error("invalid configuration for `{parameter}`: {message}")]
    Configuration {
        parameter: &'static str,
        message: String,
    },

    /// The stage as a whole has nothing it can work on.
    #[error("[{stage}] insufficient data for {item}: {message}")]
    InsufficientData {
        stage: &'static str,
        item: String,
        message: String,
    },
}

impl ScError {
    /// Shorthand for an `ScError::Input`
    pub fn input(stage: &'static str, message: impl Into<String>) -> Self {
        ScError::Input {
            stage,
            message: message.into(),
        }
    }

    /// Shorthand for an `ScError::Configuration`
    pub fn config(parameter: &'static str, message: impl Into<String>) -> Self {
        ScError::Configuration {
            parameter,
            message: message.into(),
        }
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, ScError>;

//////////////
// Warnings //
//////////////

/// Non-fatal conditions recorded inline with a stage's output
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StageWarning {
    /// Iteration cap reached, the best intermediate result was returned.
    #[error("[{stage}] did not converge within {iterations} iterations")]
    NonConvergence {
        stage: &'static str,
        iterations: usize,
    },

    /// None of the genes of a gene set were found in the matrix.
    #[error("gene set `{set}` has no genes present in the matrix; scores set to 0")]
    EmptyGeneSet { set: String },

    /// Some (but not all) genes of a gene set were missing.
    #[error("gene set `{set}`: {missing} gene(s) not present in the matrix were ignored")]
    MissingGenes { set: String, missing: usize },

    /// A statistical test could not be run for one item.
    #[error("[{stage}] insufficient data for {item}: {message}")]
    InsufficientData {
        stage: &'static str,
        item: String,
        message: String,
    },

    /// An optional stage failed; its output is missing from the result.
    #[error("[{stage}] stage skipped: {error}")]
    StageFailed { stage: &'static str, error: ScError },
}

impl StageWarning {
    /// Emit the warning through the `log` facade
    pub fn log(&self) {
        log::warn!("{}", self);
    }
}
