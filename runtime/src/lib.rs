//! Modpack runtime - model artifact packaging engine.
//!
//! This crate turns a directory of model files into an OCI artifact: codecs
//! encode files into layers, the digest cache skips rehashing unchanged
//! files, the builder writes layers through an output strategy into a
//! content store, and the backend drives the artifact lifecycle.

#![allow(clippy::result_large_err)]

pub mod backend;
pub mod build;
pub mod cache;
pub mod codec;
pub mod digest;
pub mod processor;
pub mod reference;
pub mod retry;
pub mod spec;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

/// Owned async byte stream passed between codecs, hooks and stores.
pub type BoxReader = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

// Re-export common types
pub use backend::{
    AttachOptions, Backend, BuildOptions, BuildSpec, ExtractOptions, FetchOptions, TransferOptions,
};
pub use build::{ArtifactBuilder, Builder, Hooks, OutputKind, ProgressObserver, TracingProgress};
pub use cache::{CacheItem, DigestCache};
pub use codec::{Codec, CodecType};
pub use processor::{ProcessOptions, Processor};
pub use reference::ModelReference;
pub use retry::RetryPolicy;
pub use spec::{Descriptor, LayerCategory, Manifest, ModelConfig};
pub use store::{LocalStore, PruneReport, RemoteStore, Storage};

/// Modpack runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
