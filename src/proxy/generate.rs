//! Generation request proxy
//!
//! Wraps a question in the model's instruction template and forwards it to
//! the generation server, either blocking for the full completion or
//! streaming decoded token fragments as server-sent events. Special/control
//! tokens are filtered before fragments reach the consumer, and dropping a
//! streaming consumer drops the upstream connection with it.

use crate::config::GenerationConfig;
use crate::error::{SidecarError, SidecarResult};
use crate::launcher::ServerHandle;
use async_stream::try_stream;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// LLaMA-2 chat instruction wrapper
const INSTRUCT_TEMPLATE: &str = "<s>[INST] <<SYS>>\n{system}\n<</SYS>>\n\n{user} [/INST] ";

/// Fixed instruction template with a configurable system prompt
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    system: String,
}

impl PromptTemplate {
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            system: system.into(),
        }
    }

    pub fn render(&self, user: &str) -> String {
        INSTRUCT_TEMPLATE
            .replace("{system}", &self.system)
            .replace("{user}", user)
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    inputs: &'a str,
    parameters: GenerateParameters,
}

#[derive(Serialize)]
struct GenerateParameters {
    max_new_tokens: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    generated_text: String,
}

#[derive(Deserialize)]
struct StreamEvent {
    token: StreamToken,
}

#[derive(Deserialize)]
struct StreamToken {
    text: String,
    special: bool,
}

/// Client for the generation server's loopback HTTP endpoints
pub struct GenerateClient {
    http: reqwest::Client,
    base_url: String,
    template: PromptTemplate,
    default_max_new_tokens: u32,
    request_timeout: Duration,
}

impl GenerateClient {
    pub fn new(port: u16, config: &GenerationConfig) -> SidecarResult<Self> {
        // No client-wide timeout: it would also bound streaming responses.
        // The blocking path sets a per-request deadline instead.
        let http = reqwest::Client::builder().build()?;

        Ok(Self {
            http,
            base_url: format!("http://127.0.0.1:{}", port),
            template: PromptTemplate::new(config.system_prompt.clone()),
            default_max_new_tokens: config.max_new_tokens,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }

    /// Blocking generation: returns the full completion text
    pub async fn generate(
        &self,
        handle: &ServerHandle,
        question: &str,
        max_new_tokens: Option<u32>,
    ) -> SidecarResult<String> {
        handle.ensure_ready().await?;
        crate::metrics::record_generate_request(false);

        let prompt = self.template.render(question);
        let response = self
            .http
            .post(format!("{}/generate", self.base_url))
            .timeout(self.request_timeout)
            .json(&GenerateRequest {
                inputs: &prompt,
                parameters: GenerateParameters {
                    max_new_tokens: max_new_tokens.unwrap_or(self.default_max_new_tokens),
                },
            })
            .send()
            .await?;
        let response = super::ensure_success(response, "generate").await?;

        let body: GenerateResponse = response.json().await?;
        Ok(body.generated_text)
    }

    /// Streaming generation: lazily yields decoded token fragments.
    ///
    /// The stream ends when the upstream closes its side. Dropping it
    /// mid-flight drops the underlying response, which closes the loopback
    /// connection rather than leaving it to run to completion.
    pub fn generate_stream(
        &self,
        handle: Arc<ServerHandle>,
        question: &str,
        max_new_tokens: Option<u32>,
    ) -> impl Stream<Item = SidecarResult<String>> + Send + 'static + use<> {
        let http = self.http.clone();
        let url = format!("{}/generate_stream", self.base_url);
        let prompt = self.template.render(question);
        let max_new_tokens = max_new_tokens.unwrap_or(self.default_max_new_tokens);

        try_stream! {
            handle.ensure_ready().await?;
            crate::metrics::record_generate_request(true);

            let mut call = CallGuard::new();

            let response = http
                .post(&url)
                .json(&GenerateRequest {
                    inputs: &prompt,
                    parameters: GenerateParameters { max_new_tokens },
                })
                .send()
                .await
                .map_err(|e| {
                    call.fail();
                    SidecarError::from(e)
                })?;

            let response = super::ensure_success(response, "generate_stream")
                .await
                .map_err(|e| {
                    call.fail();
                    e
                })?;

            call.streaming();

            let mut frames = SseFrames::new();
            let mut bytes = response.bytes_stream();

            while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|e| {
                    call.fail();
                    SidecarError::StreamInterrupted {
                        reason: e.to_string(),
                    }
                })?;

                for payload in frames.push(&chunk) {
                    let event: StreamEvent =
                        serde_json::from_str(&payload).map_err(|e| {
                            call.fail();
                            SidecarError::StreamInterrupted {
                                reason: format!("malformed stream event: {}", e),
                            }
                        })?;

                    if !event.token.special {
                        yield event.token.text;
                    }
                }
            }

            call.complete();
        }
    }
}

// ============================================================================
// Call state tracking
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallState {
    Pending,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

/// Tracks one streaming call through
/// Pending -> Streaming -> {Completed | Failed | Cancelled}.
/// Dropping the guard while Streaming means the consumer walked away.
struct CallGuard {
    state: CallState,
}

impl CallGuard {
    fn new() -> Self {
        Self {
            state: CallState::Pending,
        }
    }

    fn streaming(&mut self) {
        self.state = CallState::Streaming;
    }

    fn complete(&mut self) {
        self.state = CallState::Completed;
    }

    fn fail(&mut self) {
        self.state = CallState::Failed;
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if self.state == CallState::Streaming {
            self.state = CallState::Cancelled;
            crate::metrics::record_stream_cancelled();
            tracing::debug!("generation stream dropped by consumer mid-flight");
        }
    }
}

// ============================================================================
// Server-sent-event framing
// ============================================================================

/// Incremental parser for server-sent-event frames.
/// Buffers raw bytes so multi-byte characters split across network chunks
/// survive intact; decoding happens per complete frame.
struct SseFrames {
    buffer: Vec<u8>,
}

impl SseFrames {
    fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed a chunk, returning the data payloads of any frames it completes
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut payloads = Vec::new();
        while let Some((end, delim)) = find_delimiter(&self.buffer) {
            let frame: Vec<u8> = self.buffer.drain(..end + delim).collect();
            let frame = String::from_utf8_lossy(&frame[..end]);

            for line in frame.lines() {
                if let Some(data) = line.strip_prefix("data:") {
                    payloads.push(data.trim_start().to_string());
                }
            }
        }

        payloads
    }
}

/// Find the next frame delimiter, returning (frame end, delimiter length)
fn find_delimiter(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i + 1 < buf.len() {
        if buf[i] == b'\n' && buf[i + 1] == b'\n' {
            return Some((i, 2));
        }
        if buf[i] == b'\r' && i + 3 < buf.len() && &buf[i + 1..i + 4] == b"\n\r\n" {
            return Some((i, 4));
        }
        i += 1;
    }
    None
}
