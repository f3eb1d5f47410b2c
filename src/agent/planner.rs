//! 调研规划 - 把调研状态转换为具体的工具调用参数

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::agent::describe_state;
use crate::i18n::TargetLanguage;
use crate::llm::{ModelHandle, TextGenerator, generate_json};
use crate::types::{Page, ResearchState, RetrievalResult};
use crate::utils::threads::do_parallel_with_limit;
use crate::utils::token_estimator::TokenEstimator;

/// 一次搜索的规划
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SearchPlan {
    /// 本次搜索服务的子目标
    pub sub_goal: String,
    /// 3到5个互不重复的搜索查询
    pub query_strings: Vec<String>,
}

/// 从页面中提炼出的知识点草稿
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct KnowledgeDraft {
    pub content: String,
    /// 支撑该知识点的页面url
    pub source_urls: Vec<String>,
}

/// 一次编码任务的规划
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CodePlan {
    /// 代码要完成的计算或验证任务
    pub task: String,
    /// 检索接口文档用的简短关键词，不需要时为空
    #[serde(default)]
    pub retrieval_query: Option<String>,
}

/// 调研规划器
#[async_trait]
pub trait ResearchPlanner: Send + Sync {
    /// 规划下一组搜索查询
    async fn plan_search(&self, state: &ResearchState) -> Result<SearchPlan>;

    /// 从候选页面中挑选最值得阅读的页面
    async fn select_pages(
        &self,
        state: &ResearchState,
        candidates: &[Page],
        max_pages: usize,
    ) -> Result<Vec<Page>>;

    /// 从已阅读的页面中提炼知识点
    async fn extract_knowledge(
        &self,
        state: &ResearchState,
        pages: &[Page],
    ) -> Result<Vec<KnowledgeDraft>>;

    /// 规划编码任务
    async fn plan_code(&self, state: &ResearchState) -> Result<CodePlan>;

    /// 编写代码，`docs` 为检索到的接口文档
    async fn write_code(
        &self,
        state: &ResearchState,
        plan: &CodePlan,
        docs: Option<&RetrievalResult>,
    ) -> Result<String>;
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct PageSelection {
    /// 选中页面的编号（从1开始）
    indices: Vec<usize>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct PageKnowledge {
    /// 页面中与调研目标相关的事实，每条独立成句，保留数字和日期
    facts: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct CodeDraft {
    /// 完整可运行的代码，最后一行以JSON打印结果
    code: String,
}

/// 基于大模型的规划器
pub struct LlmPlanner {
    llm: Arc<dyn TextGenerator>,
    model: ModelHandle,
    language: TargetLanguage,
    token_estimator: TokenEstimator,
    max_tokens_per_page: usize,
    max_parallels: usize,
}

impl LlmPlanner {
    pub fn new(llm: Arc<dyn TextGenerator>, language: TargetLanguage) -> Self {
        Self {
            llm,
            model: ModelHandle::Efficient,
            language,
            token_estimator: TokenEstimator::new(),
            max_tokens_per_page: 6000,
            max_parallels: 3,
        }
    }

    pub fn with_model(mut self, model: ModelHandle) -> Self {
        self.model = model;
        self
    }

    pub fn with_page_budget(mut self, max_tokens_per_page: usize) -> Self {
        self.max_tokens_per_page = max_tokens_per_page;
        self
    }

    pub fn with_max_parallels(mut self, max_parallels: usize) -> Self {
        self.max_parallels = max_parallels;
        self
    }

    async fn extract_page(&self, state: &ResearchState, page: &Page) -> Result<KnowledgeDraft> {
        let content = self
            .token_estimator
            .truncate_to_tokens(&page.markdown, self.max_tokens_per_page);
        let prompt = format!(
            "Extract the facts relevant to the research goal from the page below.\n\n\
             # Research goal\n{}\n\n\
             # Page\nTitle: {}\nURL: {}\n\n{}\n\n\
             Only keep facts stated on the page. Return an empty list when nothing is relevant.\n{}",
            state.goal,
            page.title,
            page.url,
            content,
            self.language.prompt_instruction()
        );
        let knowledge: PageKnowledge =
            generate_json(self.llm.as_ref(), &self.model, &prompt, &[]).await?;
        let facts: Vec<String> = knowledge
            .facts
            .into_iter()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect();
        Ok(KnowledgeDraft {
            content: facts.join("\n"),
            source_urls: vec![page.url.clone()],
        })
    }
}

#[async_trait]
impl ResearchPlanner for LlmPlanner {
    async fn plan_search(&self, state: &ResearchState) -> Result<SearchPlan> {
        let prompt = format!(
            "{}\n\
             Plan the next search. Pick ONE sub-goal that the collected knowledge does not cover yet, \
             and write 3 to 5 web search queries for it. Do not repeat searched queries.\n{}",
            describe_state(state),
            self.language.prompt_instruction()
        );
        let plan: SearchPlan = generate_json(self.llm.as_ref(), &self.model, &prompt, &[]).await?;
        if plan.query_strings.iter().all(|q| q.trim().is_empty()) {
            return Err(anyhow!("模型没有给出任何搜索查询"));
        }
        debug!(sub_goal = %plan.sub_goal, queries = plan.query_strings.len(), "搜索规划完成");
        Ok(plan)
    }

    async fn select_pages(
        &self,
        state: &ResearchState,
        candidates: &[Page],
        max_pages: usize,
    ) -> Result<Vec<Page>> {
        if candidates.len() <= max_pages {
            return Ok(candidates.to_vec());
        }

        let mut prompt = format!(
            "# Research goal\n{}\n\nSelect at most {} pages that are most likely to contain facts for the goal.\n\n",
            state.goal, max_pages
        );
        for (i, page) in candidates.iter().enumerate() {
            prompt.push_str(&format!(
                "{}. {} ({})\n   {}\n",
                i + 1,
                page.title,
                page.url,
                page.description
            ));
        }
        let selection: PageSelection =
            generate_json(self.llm.as_ref(), &self.model, &prompt, &[]).await?;

        let mut seen = HashSet::new();
        let selected: Vec<Page> = selection
            .indices
            .into_iter()
            .filter(|i| *i >= 1 && *i <= candidates.len() && seen.insert(*i))
            .take(max_pages)
            .map(|i| candidates[i - 1].clone())
            .collect();

        if selected.is_empty() {
            warn!("模型没有选中有效的页面，按搜索顺序阅读");
            return Ok(candidates.iter().take(max_pages).cloned().collect());
        }
        Ok(selected)
    }

    async fn extract_knowledge(
        &self,
        state: &ResearchState,
        pages: &[Page],
    ) -> Result<Vec<KnowledgeDraft>> {
        let futures: Vec<_> = pages
            .iter()
            .map(|page| self.extract_page(state, page))
            .collect();
        let outcomes = do_parallel_with_limit(futures, self.max_parallels).await;

        let mut drafts = Vec::new();
        let mut last_error = None;
        for (page, outcome) in pages.iter().zip(outcomes) {
            match outcome {
                Ok(draft) if !draft.content.is_empty() => drafts.push(draft),
                Ok(_) => debug!(url = %page.url, "页面中没有相关的事实"),
                Err(e) => {
                    warn!(url = %page.url, "⚠️ 知识提炼失败: {}", e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if drafts.is_empty() => Err(e.context("所有页面的知识提炼均失败")),
            _ => Ok(drafts),
        }
    }

    async fn plan_code(&self, state: &ResearchState) -> Result<CodePlan> {
        let prompt = format!(
            "{}\n\
             Plan a small program that computes or verifies a number needed for the goal \
             from the knowledge above. If API documentation would help, give a short keyword \
             query for it (no company names or stock codes).\n{}",
            describe_state(state),
            self.language.prompt_instruction()
        );
        generate_json(self.llm.as_ref(), &self.model, &prompt, &[]).await
    }

    async fn write_code(
        &self,
        state: &ResearchState,
        plan: &CodePlan,
        docs: Option<&RetrievalResult>,
    ) -> Result<String> {
        let mut prompt = format!(
            "{}\n# Task\n{}\n",
            describe_state(state),
            plan.task
        );
        if let Some(docs) = docs.filter(|d| !d.is_empty()) {
            prompt.push_str(&format!("\n# Documentation\n{}\n", docs.text_result()));
        }
        prompt.push_str(
            "\nWrite a complete Python program for the task. Print the final result as a single JSON line at the end.\n",
        );
        let draft: CodeDraft =
            generate_json(self.llm.as_ref(), &ModelHandle::Powerful, &prompt, &[]).await?;
        if draft.code.trim().is_empty() {
            return Err(anyhow!("模型返回了空的代码"));
        }
        Ok(draft.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatTurn;
    use chrono::Utc;
    use std::sync::Mutex;

    /// 根据提示词中的关键字返回预设回答
    struct KeywordGenerator {
        answers: Vec<(&'static str, &'static str)>,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TextGenerator for KeywordGenerator {
        async fn generate_text(
            &self,
            _model: &ModelHandle,
            prompt: &str,
            _context: &[ChatTurn],
        ) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.answers
                .iter()
                .find(|(key, _)| prompt.contains(key))
                .map(|(_, answer)| answer.to_string())
                .ok_or_else(|| anyhow!("no canned answer"))
        }
    }

    fn planner(answers: Vec<(&'static str, &'static str)>) -> LlmPlanner {
        LlmPlanner::new(
            Arc::new(KeywordGenerator {
                answers,
                prompts: Mutex::new(Vec::new()),
            }),
            TargetLanguage::English,
        )
    }

    fn candidates(n: usize) -> Vec<Page> {
        (1..=n)
            .map(|i| Page::new(format!("page {}", i), format!("https://p/{}", i)))
            .collect()
    }

    #[tokio::test]
    async fn test_plan_search_parses_plan() {
        let planner = planner(vec![(
            "Plan the next search",
            r#"{"sub_goal": "prices", "query_strings": ["lithium price 2024", "lithium outlook"]}"#,
        )]);
        let state = ResearchState::new("battery market", Utc::now());

        let plan = planner.plan_search(&state).await.unwrap();
        assert_eq!(plan.sub_goal, "prices");
        assert_eq!(plan.query_strings.len(), 2);
    }

    #[tokio::test]
    async fn test_select_pages_skips_llm_when_few_candidates() {
        let planner = planner(vec![]);
        let state = ResearchState::new("goal", Utc::now());

        let selected = planner
            .select_pages(&state, &candidates(2), 5)
            .await
            .unwrap();
        assert_eq!(selected.len(), 2);
    }

    #[tokio::test]
    async fn test_select_pages_filters_invalid_indices() {
        let planner = planner(vec![("Select at most", r#"{"indices": [3, 3, 9, 1]}"#)]);
        let state = ResearchState::new("goal", Utc::now());

        let selected = planner
            .select_pages(&state, &candidates(6), 2)
            .await
            .unwrap();
        let urls: Vec<&str> = selected.iter().map(|p| p.url.as_str()).collect();
        assert_eq!(urls, vec!["https://p/3", "https://p/1"]);
    }

    #[tokio::test]
    async fn test_extract_knowledge_attributes_page_source() {
        let planner = planner(vec![(
            "Extract the facts",
            r#"{"facts": ["Revenue grew 12% in 2023", " "]}"#,
        )]);
        let state = ResearchState::new("goal", Utc::now());
        let pages = vec![Page::new("report", "https://r").with_markdown("Revenue grew 12%")];

        let drafts = planner.extract_knowledge(&state, &pages).await.unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].content, "Revenue grew 12% in 2023");
        assert_eq!(drafts[0].source_urls, vec!["https://r"]);
    }

    #[tokio::test]
    async fn test_extract_knowledge_fails_when_every_page_fails() {
        let planner = planner(vec![]);
        let state = ResearchState::new("goal", Utc::now());
        let pages = vec![Page::new("a", "https://a").with_markdown("text")];

        assert!(planner.extract_knowledge(&state, &pages).await.is_err());
    }

    #[tokio::test]
    async fn test_write_code_includes_documentation() {
        let generator = Arc::new(KeywordGenerator {
            answers: vec![("# Task", r#"{"code": "print(1)"}"#)],
            prompts: Mutex::new(Vec::new()),
        });
        let planner = LlmPlanner::new(generator.clone(), TargetLanguage::English);
        let state = ResearchState::new("goal", Utc::now());
        let plan = CodePlan {
            task: "compute growth".to_string(),
            retrieval_query: Some("growth rate".to_string()),
        };
        let docs = RetrievalResult {
            query: "growth rate".to_string(),
            documents: vec!["def cagr(a, b, n)".to_string()],
            ids: vec!["doc-1".to_string()],
            distances: vec![0.1],
        };

        let code = planner.write_code(&state, &plan, Some(&docs)).await.unwrap();
        assert_eq!(code, "print(1)");
        let prompts = generator.prompts.lock().unwrap();
        assert!(prompts[0].contains("def cagr(a, b, n)"));
    }
}
