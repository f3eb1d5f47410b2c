use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::KnowledgeItem;

pub mod refiner;

pub use refiner::{
    KnowledgeRefiner, LlmRefiner, OverlapRefiner, RefinementOutcome, group_overlapping,
    refine_knowledge,
};

/// 知识库元数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeMetadata {
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    /// 每次内容变化都会递增
    pub revision: u64,
    /// 最近一次完成精炼时的版本号
    pub last_refined_revision: Option<u64>,
}

impl Default for KnowledgeMetadata {
    fn default() -> Self {
        Self::new()
    }
}

impl KnowledgeMetadata {
    pub fn new() -> Self {
        Self {
            created_at: Utc::now(),
            last_updated: Utc::now(),
            revision: 0,
            last_refined_revision: None,
        }
    }
}

/// 知识库
///
/// 只追加：精炼不会修改或删除原始知识点，而是追加引用原始知识点的新知识点，
/// 并把原始知识点标记为已被取代
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeStore {
    items: Vec<KnowledgeItem>,
    superseded: BTreeSet<String>,
    metadata: KnowledgeMetadata,
}

impl Default for KnowledgeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KnowledgeStore {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            superseded: BTreeSet::new(),
            metadata: KnowledgeMetadata::new(),
        }
    }

    /// 追加知识点，返回真正新增的部分（相同标识的知识点只保留一份）
    pub fn append<I>(&mut self, items: I) -> Vec<KnowledgeItem>
    where
        I: IntoIterator<Item = KnowledgeItem>,
    {
        let mut added = Vec::new();
        for item in items {
            if self.contains(&item.id) {
                continue;
            }
            self.items.push(item.clone());
            added.push(item);
        }

        if !added.is_empty() {
            self.touch();
        }
        added
    }

    /// 应用一批精炼结果，返回真正新增的精炼知识点
    pub fn apply_refinement(&mut self, refined: Vec<KnowledgeItem>) -> Vec<KnowledgeItem> {
        let mut added = Vec::new();
        for item in refined {
            if self.contains(&item.id) {
                continue;
            }
            let members_valid = !item.refined_from.is_empty()
                && item
                    .refined_from
                    .iter()
                    .all(|id| self.contains(id) && !self.is_superseded(id));
            if !members_valid {
                warn!(id = %item.id, "精炼知识点引用了不存在或已被取代的知识点，忽略");
                continue;
            }

            self.superseded.extend(item.refined_from.iter().cloned());
            self.items.push(item.clone());
            added.push(item);
        }

        if !added.is_empty() {
            self.touch();
        }
        added
    }

    /// 记录当前版本已完成精炼
    pub fn mark_refined(&mut self) {
        self.metadata.last_refined_revision = Some(self.metadata.revision);
    }

    /// 当前版本是否已经精炼过
    pub fn is_refined_at_current_revision(&self) -> bool {
        self.metadata.last_refined_revision == Some(self.metadata.revision)
    }

    /// 全部知识点（含已被取代的），按加入顺序
    pub fn all_items(&self) -> &[KnowledgeItem] {
        &self.items
    }

    /// 未被取代的知识点
    pub fn active_items(&self) -> Vec<&KnowledgeItem> {
        self.items
            .iter()
            .filter(|item| !self.superseded.contains(&item.id))
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<&KnowledgeItem> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.iter().any(|item| item.id == id)
    }

    pub fn is_superseded(&self, id: &str) -> bool {
        self.superseded.contains(id)
    }

    /// 引用了指定来源的知识点
    pub fn items_with_source(&self, source: &str) -> Vec<&KnowledgeItem> {
        self.items
            .iter()
            .filter(|item| item.sources.contains(source))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn revision(&self) -> u64 {
        self.metadata.revision
    }

    pub fn metadata(&self) -> &KnowledgeMetadata {
        &self.metadata
    }

    fn touch(&mut self) {
        self.metadata.revision += 1;
        self.metadata.last_updated = Utc::now();
    }
}
