use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use md5::{Digest, Md5};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::errors::ResearchError;
use crate::knowledge::KnowledgeStore;

/// 参考时间的标准输入格式
pub const RESEARCH_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// 解析调研参考时间
///
/// 支持 `YYYY-MM-DD HH:MM:SS`、`YYYY-MM-DD` 以及 RFC 3339，不带时区的输入按UTC处理
pub fn parse_research_datetime(input: &str) -> Result<DateTime<Utc>, ResearchError> {
    let input = input.trim();
    if let Ok(naive) = NaiveDateTime::parse_from_str(input, RESEARCH_DATETIME_FORMAT) {
        return Ok(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d")
        && let Some(naive) = date.and_hms_opt(23, 59, 59)
    {
        return Ok(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(input)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| {
            ResearchError::InvalidInput(format!(
                "无法解析参考时间 `{}`，期望格式为 YYYY-MM-DD HH:MM:SS",
                input
            ))
        })
}

/// 每一步可选择的能力
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ActionChoice {
    /// 规划查询并批量搜索
    Search,
    /// 批量阅读尚未阅读的搜索结果并提炼知识
    Read,
    /// 编写并执行代码
    Code,
    /// 结束调研，生成报告
    End,
}

impl std::fmt::Display for ActionChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionChoice::Search => write!(f, "search"),
            ActionChoice::Read => write!(f, "read"),
            ActionChoice::Code => write!(f, "code"),
            ActionChoice::End => write!(f, "end"),
        }
    }
}

impl std::str::FromStr for ActionChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "search" | "search_agent" => Ok(ActionChoice::Search),
            "read" | "read_agent" => Ok(ActionChoice::Read),
            "code" | "coding" | "coding_agent" => Ok(ActionChoice::Code),
            "end" | "end_agent" | "report" => Ok(ActionChoice::End),
            _ => Err(format!("Unknown action: {}", s)),
        }
    }
}

/// 网页
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub title: String,
    pub url: String,
    /// 正文内容，只有经过批量阅读后才会被填充
    #[serde(default)]
    pub markdown: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub modified_time: Option<DateTime<Utc>>,
}

impl Page {
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            markdown: String::new(),
            description: String::new(),
            modified_time: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_markdown(mut self, markdown: impl Into<String>) -> Self {
        self.markdown = markdown.into();
        self
    }

    pub fn with_modified_time(mut self, modified_time: DateTime<Utc>) -> Self {
        self.modified_time = Some(modified_time);
        self
    }

    /// 页面的修改时间是否严格晚于参考时间
    pub fn is_published_after(&self, reference: &DateTime<Utc>) -> bool {
        matches!(self.modified_time, Some(modified) if modified > *reference)
    }
}

/// 一次已执行的搜索查询
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub query_string: String,
    pub sub_goal: String,
    pub search_result_pages: Vec<Page>,
}

impl SearchQuery {
    pub fn new(query_string: impl Into<String>, sub_goal: impl Into<String>) -> Self {
        Self {
            query_string: query_string.into(),
            sub_goal: sub_goal.into(),
            search_result_pages: Vec::new(),
        }
    }

    pub fn append_results(&mut self, pages: impl IntoIterator<Item = Page>) {
        self.search_result_pages.extend(pages);
    }
}

/// 知识点：一条带有可追溯来源的事实
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeItem {
    /// 由内容和来源计算出的稳定标识
    pub id: String,
    pub content: String,
    pub sources: BTreeSet<String>,
    /// 精炼得到的知识点会记录被合并的原始知识点
    #[serde(default)]
    pub refined_from: Vec<String>,
}

impl KnowledgeItem {
    pub fn new<I, S>(content: impl Into<String>, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let content = content.into();
        let sources: BTreeSet<String> = sources.into_iter().map(Into::into).collect();

        let mut hasher = Md5::new();
        hasher.update(content.trim().as_bytes());
        for source in &sources {
            hasher.update(b"\n");
            hasher.update(source.as_bytes());
        }

        Self {
            id: format!("{:x}", hasher.finalize()),
            content,
            sources,
            refined_from: Vec::new(),
        }
    }

    /// 由一组重叠的知识点合并出精炼知识点，原始知识点保持不变
    pub fn refined(content: impl Into<String>, members: &[&KnowledgeItem]) -> Self {
        let mut refined_from: Vec<String> = members.iter().map(|m| m.id.clone()).collect();
        refined_from.sort();
        refined_from.dedup();

        let sources: BTreeSet<String> = members
            .iter()
            .flat_map(|m| m.sources.iter().cloned())
            .collect();

        let mut hasher = Md5::new();
        hasher.update(b"refined");
        for id in &refined_from {
            hasher.update(b"\n");
            hasher.update(id.as_bytes());
        }

        Self {
            id: format!("{:x}", hasher.finalize()),
            content: content.into(),
            sources,
            refined_from,
        }
    }

    pub fn is_refined(&self) -> bool {
        !self.refined_from.is_empty()
    }
}

/// 调研状态快照中的查询摘要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySummary {
    pub query_string: String,
    pub sub_goal: String,
    pub result_count: usize,
}

/// 调研状态快照，足以在不回放内部状态的情况下了解进度
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchSnapshot {
    pub goal: String,
    pub research_datetime: DateTime<Utc>,
    pub step: usize,
    pub searched_queries: Vec<QuerySummary>,
    /// 当前有效（未被精炼取代）的知识点
    pub knowledge: Vec<KnowledgeItem>,
    /// 包含已被取代知识点在内的总数
    pub total_knowledge_items: usize,
}

/// 调研状态，由控制器独占
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchState {
    pub goal: String,
    pub research_datetime: DateTime<Utc>,
    pub searched_queries: Vec<SearchQuery>,
    pub knowledge: KnowledgeStore,
    /// 已经尝试阅读过的页面
    pub read_urls: BTreeSet<String>,
    /// 因晚于参考时间而被排除的页面
    pub excluded_urls: BTreeSet<String>,
    /// 已成功完成的步骤序列
    pub trajectory: Vec<ActionChoice>,
    pub step: usize,
}

impl ResearchState {
    pub fn new(goal: impl Into<String>, research_datetime: DateTime<Utc>) -> Self {
        Self {
            goal: goal.into(),
            research_datetime,
            searched_queries: Vec::new(),
            knowledge: KnowledgeStore::new(),
            read_urls: BTreeSet::new(),
            excluded_urls: BTreeSet::new(),
            trajectory: Vec::new(),
            step: 0,
        }
    }

    /// 所有搜索结果中既没有读过也没有被排除的页面，按url去重并保持发现顺序
    pub fn unread_pages(&self) -> Vec<Page> {
        let mut seen = HashSet::new();
        self.searched_queries
            .iter()
            .flat_map(|q| q.search_result_pages.iter())
            .filter(|page| {
                !self.read_urls.contains(&page.url) && !self.excluded_urls.contains(&page.url)
            })
            .filter(|page| seen.insert(page.url.clone()))
            .cloned()
            .collect()
    }

    pub fn has_unread_pages(&self) -> bool {
        !self.unread_pages().is_empty()
    }

    pub fn last_action(&self) -> Option<ActionChoice> {
        self.trajectory.last().copied()
    }

    /// 已经搜索过的查询语句
    pub fn searched_query_strings(&self) -> Vec<String> {
        self.searched_queries
            .iter()
            .map(|q| q.query_string.clone())
            .collect()
    }

    pub fn snapshot(&self) -> ResearchSnapshot {
        ResearchSnapshot {
            goal: self.goal.clone(),
            research_datetime: self.research_datetime,
            step: self.step,
            searched_queries: self
                .searched_queries
                .iter()
                .map(|q| QuerySummary {
                    query_string: q.query_string.clone(),
                    sub_goal: q.sub_goal.clone(),
                    result_count: q.search_result_pages.len(),
                })
                .collect(),
            knowledge: self.knowledge.active_items().into_iter().cloned().collect(),
            total_knowledge_items: self.knowledge.len(),
        }
    }
}
