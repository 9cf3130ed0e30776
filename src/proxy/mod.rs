//! Loopback request proxies for the launched server

use crate::error::{SidecarError, SidecarResult};

pub mod embed;
pub mod generate;

pub use embed::EmbedClient;
pub use generate::{GenerateClient, PromptTemplate};

/// Pass through a successful upstream response, or surface the status and
/// body as an UpstreamError. Retrying is the caller's decision.
pub(crate) async fn ensure_success(
    response: reqwest::Response,
    endpoint: &'static str,
) -> SidecarResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    crate::metrics::record_upstream_failure(endpoint);
    let message = response.text().await.unwrap_or_default();
    Err(SidecarError::UpstreamError {
        status: status.as_u16(),
        message,
    })
}
