//! Build pipeline: builder, output strategies, hooks and interceptors.

pub mod builder;
pub mod hooks;
pub mod interceptor;
pub mod output;

pub use builder::{resolve_created_at, ArtifactBuilder, Builder};
pub use hooks::{CountingReader, Hooks, ProgressObserver, TracingProgress};
pub use interceptor::{ChunkCrcInterceptor, Interceptor};
pub use output::{new_output, LocalOutput, OutputKind, OutputStrategy, RemoteOutput};
