use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::research::{ActionChoice, KnowledgeItem, Page, ResearchSnapshot, SearchQuery};
use crate::types::tool::{CodeResult, RetrievalResult};

/// 调研过程事件
///
/// 事件一旦产生便不可变，按照产生顺序投递给观察者
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchEvent {
    /// 产生时间（Unix秒）
    pub timestamp: f64,
    pub event: EventKind,
}

impl ResearchEvent {
    pub fn now(event: EventKind) -> Self {
        Self {
            timestamp: Utc::now().timestamp_millis() as f64 / 1000.0,
            event,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        self.event.name()
    }
}

/// 事件种类
///
/// 反序列化时无法识别的种类会落入 `Unknown`，观察者应当容忍它
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    BatchSearchStart {
        batch_id: u64,
        sub_goal: String,
        query_strings: Vec<String>,
    },
    BatchSearchComplete {
        batch_id: u64,
        sub_goal: String,
        results: Vec<SearchQuery>,
    },
    BatchReadStart {
        batch_id: u64,
        pages: Vec<Page>,
    },
    BatchReadComplete {
        batch_id: u64,
        pages: Vec<Page>,
    },
    /// 页面发布时间晚于参考时间，不允许阅读
    PageNotAllowedToRead {
        page: Page,
        research_datetime: DateTime<Utc>,
    },
    NewKnowledge {
        new_items: Vec<KnowledgeItem>,
    },
    RefinedKnowledge {
        original_items: Vec<KnowledgeItem>,
        refined_items: Vec<KnowledgeItem>,
    },
    Reasoning {
        action: String,
        reasoning: String,
    },
    AgentSelection {
        step: usize,
        agent_selection: ActionChoice,
        /// 选择器的原始选择被控制器改写时记录原始值
        overridden_from: Option<ActionChoice>,
    },
    Retrieval {
        query: String,
        retrieval_result: RetrievalResult,
    },
    CodeExecution {
        code_result: CodeResult,
    },
    ResearchState {
        snapshot: ResearchSnapshot,
    },
    GenerateEssayStart {
        goal: String,
    },
    GenerateEssayComplete {
        essay: String,
    },
    Error {
        error: String,
        traceback: String,
        fatal: bool,
    },
    #[serde(other)]
    Unknown,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::BatchSearchStart { .. } => "batch_search_start",
            EventKind::BatchSearchComplete { .. } => "batch_search_complete",
            EventKind::BatchReadStart { .. } => "batch_read_start",
            EventKind::BatchReadComplete { .. } => "batch_read_complete",
            EventKind::PageNotAllowedToRead { .. } => "page_not_allowed_to_read",
            EventKind::NewKnowledge { .. } => "new_knowledge",
            EventKind::RefinedKnowledge { .. } => "refined_knowledge",
            EventKind::Reasoning { .. } => "reasoning",
            EventKind::AgentSelection { .. } => "agent_selection",
            EventKind::Retrieval { .. } => "retrieval",
            EventKind::CodeExecution { .. } => "code_execution",
            EventKind::ResearchState { .. } => "research_state",
            EventKind::GenerateEssayStart { .. } => "generate_essay_start",
            EventKind::GenerateEssayComplete { .. } => "generate_essay_complete",
            EventKind::Error { .. } => "error",
            EventKind::Unknown => "unknown",
        }
    }
}
