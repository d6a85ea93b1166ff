//! comicdl: resumable comick.io downloader, outputting EPUB, PDF, or CBZ.

pub mod assemble;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod download;
pub mod imaging;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod selector;
pub mod source;
pub mod state;
pub mod workspace;

#[cfg(test)]
mod testutil;

// Re-exports for the CLI and library consumers.
pub use catalog::{CatalogError, ChapterCatalog, MetadataSource};
pub use pipeline::{Pipeline, PipelineError, PipelineSettings, RunSummary};
pub use source::{ComickSource, ImageFetcher, PoliteClient, PoliteClientBuilder, SourceError};
pub use state::{RequestedParameters, RunState};
