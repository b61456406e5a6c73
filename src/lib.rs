#![doc = include_str!("../README.md")]

pub mod cache;
pub mod cancel;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod runtime;
pub mod supervisor;
pub mod worker;

pub use cache::chat::ChatCompletionCache;
pub use cache::{Cache, CacheEntry, CacheKind, CacheOptions, CacheRegistry};
pub use cancel::CancellationToken;
pub use error::{CacheError, JobError};
pub use protocol::{JobDescriptor, ResourceChangeEvent, RunResult};
pub use runtime::{JobContext, JobRunner};
pub use supervisor::{JobHandle, Supervisor};

/// the current app version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
