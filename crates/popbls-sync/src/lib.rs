//! Ingestion: remote mirror sync, population snapshot dedup, and the
//! scheduled trigger that runs them.

pub mod mirror;
pub mod pipeline;
pub mod population;

pub use mirror::{MirrorSyncer, MirrorTarget, RemoteFile, SyncReport};
pub use pipeline::{
    build_http, build_store, ensure_mirror_user_agent, run_ingestion_once, IngestionPipeline,
    IngestionSummary,
};
pub use population::{
    compute_hash, population_key, upload_population_json, PopulationFetcher, PopulationUpload,
};

pub const CRATE_NAME: &str = "popbls-sync";
