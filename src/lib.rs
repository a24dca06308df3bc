pub mod cli;
pub mod config;
pub mod extractor;
pub mod index;
pub mod loader;
mod metrics;
pub mod pipeline;
pub mod searcher;
pub mod server;
pub mod store;
pub mod utils;

pub use config::Opts;
pub use extractor::{FeatureExtractor, ImageEmbedding};
pub use searcher::{Match, SearchError, SearchResult, Searcher};
pub use store::{DualIndex, IndexManifest, Space, StoreError};
