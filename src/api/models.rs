//! API request and response models

use crate::launcher::ServerState;
use serde::{Deserialize, Serialize};

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ServerState,
    pub model_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Container load snapshot
#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub backlog: usize,
    pub num_total_runners: usize,
}

/// One (identifier, text) pair for POST /embed
#[derive(Debug, Serialize, Deserialize)]
pub struct EmbedItem {
    pub id: u64,
    pub text: String,
}

/// Request for POST /generate
#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateTextRequest {
    pub prompt: String,

    #[serde(default)]
    pub max_new_tokens: Option<u32>,
}

/// Response for POST /generate
#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateTextResponse {
    pub generated_text: String,
}
