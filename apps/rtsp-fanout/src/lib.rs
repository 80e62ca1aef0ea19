pub mod branch;
pub mod bridge;
pub mod config;
pub mod graph;
#[cfg(feature = "gst")]
pub mod gst_utils;
pub mod host;
pub mod pipeline;
pub mod recovery;
pub mod session;
pub mod worker;

// Re-export commonly used types
pub use branch::{BranchKind, BranchState};
pub use config::Config;
pub use graph::{MediaGraph, MemoryGraph};
pub use host::{DisplayHandle, HostNotifier, PushProtocol, StatusMessage};
pub use session::Session;

// Common error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FanoutError {
    #[error("Resource setup failed: {0}")]
    ResourceSetupFailed(#[from] graph::GraphError),

    #[error("Transport error on {sink}: {message}")]
    TransportError { sink: String, message: String },

    #[error("Upstream error on {source_name}: {message}")]
    UpstreamError { source_name: String, message: String },

    #[error("Unsupported stream encoding: {0}")]
    UnsupportedStream(String),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] config::ConfigError),

    #[error("Media framework error: {0}")]
    FrameworkError(String),

    #[error("Worker thread error: {0}")]
    WorkerError(String),
}

pub type Result<T> = std::result::Result<T, FanoutError>;
