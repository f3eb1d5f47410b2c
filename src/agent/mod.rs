//! 调研智能体 - 动作选择、查询与阅读规划、最终报告撰写

use crate::errors::ResearchError;
use crate::types::ResearchState;
use crate::utils::html::truncate_chars;

pub mod planner;
pub mod report;
pub mod selector;

pub use planner::{CodePlan, KnowledgeDraft, LlmPlanner, ResearchPlanner, SearchPlan};
pub use report::ReportGenerator;
pub use selector::{AgentSelector, HeuristicSelector, LlmSelector, ScriptedSelector};

/// 步数预算
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepBudget {
    pub min_steps: usize,
    pub max_steps: usize,
}

impl StepBudget {
    pub fn new(min_steps: usize, max_steps: usize) -> Result<Self, ResearchError> {
        if min_steps > max_steps {
            return Err(ResearchError::InvalidInput(format!(
                "最少步数({})不能大于最多步数({})",
                min_steps, max_steps
            )));
        }
        Ok(Self {
            min_steps,
            max_steps,
        })
    }

    /// 当前步数是否已经允许结束
    pub fn can_end(&self, step: usize) -> bool {
        step >= self.min_steps
    }

    pub fn is_exhausted(&self, step: usize) -> bool {
        step >= self.max_steps
    }
}

/// 单个知识点在提示词中的最大长度
const MAX_KNOWLEDGE_CHARS: usize = 600;

/// 把调研状态整理为提示词中的上下文
pub(crate) fn describe_state(state: &ResearchState) -> String {
    let mut text = format!(
        "# Research goal\n{}\n\n# Research datetime\n{}\n\n# Progress\nstep {}, {} queries searched, {} unread pages, {} knowledge items\n",
        state.goal,
        state.research_datetime.format("%Y-%m-%d %H:%M:%S"),
        state.step,
        state.searched_queries.len(),
        state.unread_pages().len(),
        state.knowledge.active_items().len(),
    );

    if !state.searched_queries.is_empty() {
        text.push_str("\n# Searched queries\n");
        for query in &state.searched_queries {
            text.push_str(&format!(
                "- {} (sub-goal: {}, {} results)\n",
                query.query_string,
                query.sub_goal,
                query.search_result_pages.len()
            ));
        }
    }

    let knowledge = state.knowledge.active_items();
    if !knowledge.is_empty() {
        text.push_str("\n# Knowledge\n");
        for (i, item) in knowledge.iter().enumerate() {
            text.push_str(&format!(
                "{}. {}\n",
                i + 1,
                truncate_chars(&item.content, MAX_KNOWLEDGE_CHARS)
            ));
        }
    }
    text
}
