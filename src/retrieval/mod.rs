//! 向量检索 - 从持久化的向量文件构建的内存索引

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::errors::ToolError;
use crate::types::RetrievalResult;

pub mod embedder;

pub use embedder::OpenAiEmbedder;

/// 向量文件中的一条记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
}

/// 一个向量集合，启动时加载一次，之后只读
#[derive(Debug, Clone)]
pub struct Collection {
    name: String,
    dimension: usize,
    records: Vec<EmbeddingRecord>,
}

impl Collection {
    pub fn from_records(name: impl Into<String>, records: Vec<EmbeddingRecord>) -> Result<Self> {
        let name = name.into();
        let dimension = records.first().map(|r| r.embedding.len()).unwrap_or(0);
        if records.is_empty() || dimension == 0 {
            bail!("向量集合 {} 为空", name);
        }
        if let Some(bad) = records.iter().find(|r| r.embedding.len() != dimension) {
            bail!(
                "向量集合 {} 中 {} 的维度为 {}，期望 {}",
                name,
                bad.id,
                bad.embedding.len(),
                dimension
            );
        }
        Ok(Self {
            name,
            dimension,
            records,
        })
    }

    /// 从JSON文件加载，文件内容为 `[{id, text, embedding}, ...]`
    pub fn load_json(name: impl Into<String>, path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read embeddings file: {:?}", path))?;
        let records: Vec<EmbeddingRecord> =
            serde_json::from_str(&content).context("Failed to parse embeddings file")?;
        let collection = Self::from_records(name, records)?;
        info!(
            collection = %collection.name,
            records = collection.len(),
            dimension = collection.dimension,
            "📚 向量集合加载完成"
        );
        Ok(collection)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 按余弦距离（1 - 余弦相似度）升序返回最近的 `n_results` 条记录
    pub fn nearest(&self, query: &str, embedding: &[f32], n_results: usize) -> Result<RetrievalResult> {
        if embedding.len() != self.dimension {
            bail!(
                "查询向量维度为 {}，集合 {} 的维度为 {}",
                embedding.len(),
                self.name,
                self.dimension
            );
        }

        let mut scored: Vec<(f32, &EmbeddingRecord)> = self
            .records
            .iter()
            .map(|record| (cosine_distance(embedding, &record.embedding), record))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
        scored.truncate(n_results);

        Ok(RetrievalResult {
            query: query.to_string(),
            documents: scored.iter().map(|(_, r)| r.text.clone()).collect(),
            ids: scored.iter().map(|(_, r)| r.id.clone()).collect(),
            distances: scored.iter().map(|(d, _)| *d).collect(),
        })
    }
}

/// 余弦距离，零向量视为最远
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 2.0;
    }
    1.0 - dot / (norm_a * norm_b)
}

/// 显式构建并注入的向量集合注册表
#[derive(Debug, Clone, Default)]
pub struct CollectionRegistry {
    collections: BTreeMap<String, Arc<Collection>>,
    default_collection: Option<String>,
}

impl CollectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册集合，第一个注册的集合成为默认集合
    pub fn register(&mut self, collection: Collection) {
        let name = collection.name().to_string();
        if self.default_collection.is_none() {
            self.default_collection = Some(name.clone());
        }
        self.collections.insert(name, Arc::new(collection));
    }

    /// 按名称获取集合，未指定名称时返回默认集合
    pub fn get(&self, name: Option<&str>) -> Option<Arc<Collection>> {
        let name = name.or(self.default_collection.as_deref())?;
        self.collections.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.collections.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}

/// 文本向量化服务
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// 向量检索服务：把查询向量化后在集合中检索
#[derive(Clone)]
pub struct RetrievalService {
    registry: Arc<CollectionRegistry>,
    embedder: Arc<dyn Embedder>,
}

impl RetrievalService {
    pub fn new(registry: Arc<CollectionRegistry>, embedder: Arc<dyn Embedder>) -> Self {
        Self { registry, embedder }
    }

    pub fn registry(&self) -> &CollectionRegistry {
        &self.registry
    }

    /// 检索与查询最接近的文档，阻塞的相似度计算放在独立线程中执行
    pub async fn query(
        &self,
        collection: Option<&str>,
        query: &str,
        n_results: usize,
    ) -> Result<RetrievalResult, ToolError> {
        let handle = self.registry.get(collection).ok_or_else(|| {
            ToolError::Retrieval(format!(
                "向量集合不存在: {}",
                collection.unwrap_or("<default>")
            ))
        })?;

        let embedding = self
            .embedder
            .embed(query)
            .await
            .map_err(|e| ToolError::Retrieval(format!("查询向量化失败: {}", e)))?;
        debug!(collection = handle.name(), n_results, "🔎 向量检索");

        let query_owned = query.to_string();
        tokio::task::spawn_blocking(move || handle.nearest(&query_owned, &embedding, n_results))
            .await
            .map_err(|e| ToolError::Retrieval(e.to_string()))?
            .map_err(|e| ToolError::Retrieval(e.to_string()))
    }
}
