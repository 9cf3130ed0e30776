//! Embedding request proxy
//!
//! Batches (identifier, text) pairs into fixed-size upstream /embed calls.
//! Identifiers never go over the wire; they are re-attached positionally to
//! the returned vectors.

use crate::config::EmbeddingConfig;
use crate::error::{SidecarError, SidecarResult};
use crate::launcher::ServerHandle;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Client for the embedding server's loopback HTTP endpoint
pub struct EmbedClient {
    http: reqwest::Client,
    base_url: String,
    batch_size: usize,
    max_in_flight: usize,
}

impl EmbedClient {
    pub fn new(port: u16, config: &EmbeddingConfig) -> SidecarResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base_url: format!("http://127.0.0.1:{}", port),
            batch_size: config.batch_size.max(1),
            max_in_flight: config.max_in_flight.max(1),
        })
    }

    /// Embed a sequence of (identifier, text) pairs.
    ///
    /// Splits the input into ceil(N / batch_size) upstream calls. Batches
    /// run concurrently and complete in no particular order; the returned
    /// map covers every input identifier exactly once. A non-success
    /// upstream status fails the whole call; retry policy belongs to the
    /// caller.
    pub async fn embed(
        &self,
        handle: &ServerHandle,
        pairs: &[(u64, String)],
    ) -> SidecarResult<HashMap<u64, Vec<f32>>> {
        handle.ensure_ready().await?;

        if pairs.is_empty() {
            return Ok(HashMap::new());
        }

        let url = format!("{}/embed", self.base_url);
        let batches: Vec<&[(u64, String)]> = pairs.chunks(self.batch_size).collect();
        crate::metrics::record_embed_batches(batches.len());

        let batch_futures: Vec<_> = batches
            .into_iter()
            .map(|batch| self.embed_batch(&url, batch))
            .collect();
        let mut results = stream::iter(batch_futures).buffer_unordered(self.max_in_flight);

        let mut out = HashMap::with_capacity(pairs.len());
        while let Some(mapped) = results.next().await {
            for (id, vector) in mapped? {
                out.insert(id, vector);
            }
        }

        Ok(out)
    }

    async fn embed_batch(
        &self,
        url: &str,
        batch: &[(u64, String)],
    ) -> SidecarResult<Vec<(u64, Vec<f32>)>> {
        let inputs: Vec<&str> = batch.iter().map(|(_, text)| text.as_str()).collect();

        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({ "inputs": inputs }))
            .send()
            .await?;
        let response = super::ensure_success(response, "embed").await?;
        let status = response.status();

        // Response is positionally aligned with the request array
        let vectors: Vec<Vec<f32>> = response.json().await?;
        if vectors.len() != batch.len() {
            return Err(SidecarError::UpstreamError {
                status: status.as_u16(),
                message: format!(
                    "expected {} embeddings, got {}",
                    batch.len(),
                    vectors.len()
                ),
            });
        }

        Ok(batch.iter().map(|(id, _)| *id).zip(vectors).collect())
    }
}
