//! Semantic image search over one root directory.
//!
//! # Architecture
//!
//! - `location`: per-root storage directory derivation
//! - `index`: in-memory vector index with cosine similarity search
//! - `storage`: `vectors.bin` + `ids.json` persistence
//! - `store`: loaded index snapshot bound to its storage
//! - `scanner`: image discovery and new-file detection
//! - `embeddings`: image/text encoders behind [`EmbeddingProvider`]
//! - `pipeline`: full and incremental builds
//! - `cancel`: cooperative build cancellation
//! - `controller`: single-flight scheduling of builds and searches
//! - `watcher`: filesystem change notifications

pub mod cancel;
pub mod controller;
pub mod embeddings;
pub mod index;
pub mod location;
pub mod pipeline;
pub mod scanner;
pub mod storage;
pub mod store;
pub mod watcher;

pub use cancel::CancelToken;
pub use controller::{
    AutoIndexBlock, ControllerError, ControllerSettings, ControllerStatus, IndexController,
    IndexEvent,
};
pub use embeddings::{ClipEmbedder, EmbeddingError, EmbeddingProvider};
pub use index::{SearchHit, VectorIndex};
pub use location::IndexLocation;
pub use pipeline::{BuildError, BuildKind, BuildOutcome, BuildReport, IndexBuilder, Progress};
pub use store::{IndexStore, LoadState, StoreError};
pub use watcher::{watch, WatchHandle};

/// Default minimum cosine similarity for a search hit
pub const DEFAULT_THRESHOLD: f32 = 0.1;

/// Default number of hits returned by a search
pub const DEFAULT_TOP_K: usize = 30;
