use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::config::RetrievalConfig;
use crate::retrieval::Embedder;

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// OpenAI兼容的 `/embeddings` 接口
pub struct OpenAiEmbedder {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl OpenAiEmbedder {
    /// `fallback_api_key` 在检索配置未提供API KEY时使用
    pub fn from_config(config: &RetrievalConfig, fallback_api_key: &str) -> Self {
        let api_key = if config.embedding_api_key.is_empty() {
            fallback_api_key.to_string()
        } else {
            config.embedding_api_key.clone()
        };
        Self {
            http: reqwest::Client::new(),
            base_url: config.embedding_base_url.trim_end_matches('/').to_string(),
            model: config.embedding_model.clone(),
            api_key,
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let response = self
            .http
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": self.model, "input": text }))
            .send()
            .await?
            .error_for_status()?;

        let body: EmbeddingResponse = response.json().await?;
        body.data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| anyhow!("向量接口没有返回结果"))
    }
}
