//! Inference Sidecar
//!
//! Launches a pre-built HuggingFace inference server (text-embeddings-router
//! or text-generation-launcher) as a subprocess inside a GPU container,
//! blocks until its loopback listener accepts connections, then proxies
//! embedding and generation requests to it over local HTTP.

pub mod api;
pub mod config;
pub mod error;
pub mod launcher;
pub mod metrics;
pub mod proxy;
pub mod readiness;

pub use config::{ServerConfig, ServerRole, SidecarConfig};
pub use error::{SidecarError, SidecarResult};
pub use launcher::{Launcher, ServerGuard, ServerHandle, ServerState};
pub use proxy::{EmbedClient, GenerateClient, PromptTemplate};
pub use readiness::ReadinessGate;
