use crate::types::{AdminLevel, LayerKind};
use thiserror::Error;

/// Why a single (country, level) pair could not be processed this run.
///
/// None of these abort a run: the pipeline logs the reason, leaves the
/// country out of that level's updated set and moves on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("Could not find dataset '{dataset}'")]
    DatasetNotFound { dataset: String },

    #[error("Could not find a '{file_type}' resource matching '{keyword}' in dataset '{dataset}'")]
    ResourceNotFound {
        dataset: String,
        file_type: String,
        keyword: String,
    },

    #[error("Could not download resource '{resource}': {reason}")]
    DownloadFailed { resource: String, reason: String },

    #[error("Could not unzip '{resource}': {reason}")]
    ArchiveCorrupt { resource: String, reason: String },

    #[error("Could not read layer from '{resource}': {reason}")]
    LayerUnreadable { resource: String, reason: String },

    #[error("Resource '{resource}' holds {found}, expected {expected}")]
    LayerKindMismatch {
        resource: String,
        expected: LayerKind,
        found: LayerKind,
    },

    #[error("No boundaries for {country} at adm{level}")]
    NoMatchingCountryLevelRows { country: String, level: AdminLevel },
}
