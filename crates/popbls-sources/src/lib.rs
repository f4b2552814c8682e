//! Upstream data sources: the remote file tree, the population API, and the
//! parsers for the two datasets they serve.

use popbls_storage::FetchError;
use thiserror::Error;

mod bls;
mod population;
mod tree;

pub use bls::{parse_bls_table, BlsTable};
pub use population::{
    parse_population_payload, HttpPopulationSource, PopulationPayload, PopulationSource,
    RejectedRow, StaticPopulationSource,
};
pub use tree::{
    parse_directory_listing, HttpDirectoryTree, MemoryRemoteTree, RemoteEntry, RemoteTree,
};

pub const CRATE_NAME: &str = "popbls-sources";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("no remote file at {0}")]
    NotFound(String),
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload has no `data` array")]
    MissingData,
    #[error("missing column `{0}` in header")]
    MissingColumn(String),
    #[error("empty dataset")]
    Empty,
    #[error("{0}")]
    Message(String),
}
