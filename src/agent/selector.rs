//! 动作选择策略

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::agent::{StepBudget, describe_state};
use crate::i18n::TargetLanguage;
use crate::llm::{ChatTurn, ModelHandle, TextGenerator, generate_json};
use crate::progress::ProgressSink;
use crate::types::{ActionChoice, EventKind, ResearchState};

/// 决定下一步调用哪个能力
///
/// 控制器会在选择结果违反步数预算时改写它，选择器本身不必关心预算的强制约束
#[async_trait]
pub trait AgentSelector: Send {
    async fn select(
        &mut self,
        state: &ResearchState,
        budget: &StepBudget,
        sink: &ProgressSink,
    ) -> Result<ActionChoice>;
}

/// 按预设序列选择，序列耗尽后一直返回兜底动作
#[derive(Debug, Clone)]
pub struct ScriptedSelector {
    script: VecDeque<ActionChoice>,
    fallback: ActionChoice,
}

impl ScriptedSelector {
    pub fn new(script: impl IntoIterator<Item = ActionChoice>) -> Self {
        Self {
            script: script.into_iter().collect(),
            fallback: ActionChoice::End,
        }
    }

    pub fn with_fallback(mut self, fallback: ActionChoice) -> Self {
        self.fallback = fallback;
        self
    }

    /// 始终返回同一个动作
    pub fn always(choice: ActionChoice) -> Self {
        Self::new([]).with_fallback(choice)
    }
}

#[async_trait]
impl AgentSelector for ScriptedSelector {
    async fn select(
        &mut self,
        _state: &ResearchState,
        _budget: &StepBudget,
        _sink: &ProgressSink,
    ) -> Result<ActionChoice> {
        Ok(self.script.pop_front().unwrap_or(self.fallback))
    }
}

/// 固定的启发式规则：先搜索，再阅读，达到最少步数且已有知识后结束
#[derive(Debug, Clone, Default)]
pub struct HeuristicSelector;

impl HeuristicSelector {
    fn decide(state: &ResearchState, budget: &StepBudget) -> (ActionChoice, &'static str) {
        if state.searched_queries.is_empty() {
            return (ActionChoice::Search, "no query has been searched yet");
        }
        if state.last_action() == Some(ActionChoice::Search) && state.has_unread_pages() {
            return (ActionChoice::Read, "the latest search returned unread pages");
        }
        if budget.can_end(state.step) && !state.knowledge.is_empty() {
            return (
                ActionChoice::End,
                "the step budget allows ending and knowledge has been collected",
            );
        }
        if state.has_unread_pages() {
            return (ActionChoice::Read, "there are still unread pages");
        }
        (ActionChoice::Search, "more sources are needed")
    }
}

#[async_trait]
impl AgentSelector for HeuristicSelector {
    async fn select(
        &mut self,
        state: &ResearchState,
        budget: &StepBudget,
        sink: &ProgressSink,
    ) -> Result<ActionChoice> {
        let (choice, reasoning) = Self::decide(state, budget);
        sink.emit(EventKind::Reasoning {
            action: choice.to_string(),
            reasoning: reasoning.to_string(),
        });
        Ok(choice)
    }
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct SelectionDecision {
    /// 做出选择的理由
    reasoning: String,
    /// 下一步动作
    action: ActionChoice,
}

/// 由大模型推理下一步动作，推理过程作为Reasoning事件发出
pub struct LlmSelector {
    llm: Arc<dyn TextGenerator>,
    model: ModelHandle,
    language: TargetLanguage,
    code_enabled: bool,
    /// 最近几次决策，作为对话历史提供给模型
    history: VecDeque<ChatTurn>,
}

/// 保留的历史对话轮数（一问一答算两轮）
const MAX_HISTORY_TURNS: usize = 6;

impl LlmSelector {
    pub fn new(
        llm: Arc<dyn TextGenerator>,
        model: ModelHandle,
        language: TargetLanguage,
        code_enabled: bool,
    ) -> Self {
        Self {
            llm,
            model,
            language,
            code_enabled,
            history: VecDeque::new(),
        }
    }

    fn remember(&mut self, step: usize, decision: &SelectionDecision) {
        self.history
            .push_back(ChatTurn::user(format!("Step {}: choose the next action.", step + 1)));
        self.history.push_back(ChatTurn::assistant(format!(
            "{}: {}",
            decision.action, decision.reasoning
        )));
        while self.history.len() > MAX_HISTORY_TURNS {
            self.history.pop_front();
        }
    }

    fn build_prompt(&self, state: &ResearchState, budget: &StepBudget) -> String {
        let mut prompt = String::from(
            "You are the planner of an autonomous research agent. Decide the next action.\n\n\
             Available actions:\n\
             - search: plan a sub-goal and run several web search queries\n\
             - read: read the unread search result pages and extract knowledge\n",
        );
        if self.code_enabled {
            prompt.push_str("- code: write and run code to compute or verify numbers\n");
        }
        prompt.push_str("- end: stop researching and write the final report\n\n");
        prompt.push_str(&describe_state(state));
        prompt.push_str(&format!(
            "\n# Step budget\nminimum {} steps, maximum {} steps, {} steps done.\n",
            budget.min_steps, budget.max_steps, state.step
        ));
        prompt.push_str(
            "\nChoose `end` only when the knowledge is sufficient to answer the goal. \
             Choose `read` only when unread pages exist.\n",
        );
        prompt.push_str(self.language.prompt_instruction());
        prompt
    }
}

#[async_trait]
impl AgentSelector for LlmSelector {
    async fn select(
        &mut self,
        state: &ResearchState,
        budget: &StepBudget,
        sink: &ProgressSink,
    ) -> Result<ActionChoice> {
        let prompt = self.build_prompt(state, budget);
        let context: Vec<ChatTurn> = self.history.iter().cloned().collect();
        let decision: SelectionDecision =
            generate_json(self.llm.as_ref(), &self.model, &prompt, &context).await?;
        debug!(step = state.step, action = %decision.action, "模型选择了下一步动作");
        self.remember(state.step, &decision);

        sink.emit(EventKind::Reasoning {
            action: decision.action.to_string(),
            reasoning: decision.reasoning,
        });
        Ok(decision.action)
    }
}
