//! 调研轨迹控制器
//!
//! 决策 → 执行 → 合并 → 汇报 的循环。调研状态只由控制器持有和修改，
//! 工具只返回数据

use std::collections::HashSet;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::StepBudget;
use crate::errors::ResearchError;
use crate::knowledge::refine_knowledge;
use crate::progress::ProgressSink;
use crate::research::{FinalReport, ResearchContext, ResearchOutcome};
use crate::tools::batch_read::BATCH_READ;
use crate::tools::batch_search::BATCH_SEARCH;
use crate::tools::code_execution::CODE_EXECUTION;
use crate::tools::retrieval::RETRIEVAL;
use crate::tools::{ToolArgs, ToolPayload};
use crate::types::{
    ActionChoice, CodeResult, EventKind, KnowledgeItem, Page, ResearchState, RetrievalResult,
};
use crate::utils::html::truncate_chars;

/// 同一步骤最多尝试的次数，再次失败即终止调研
const MAX_ATTEMPTS_PER_STEP: usize = 2;

/// 代码输出转为知识点时保留的最大长度
const MAX_CODE_KNOWLEDGE_CHARS: usize = 2000;

/// 一个步骤在重试之间保留的中间结果
///
/// 重试复用已经做出的选择和已经成功的工具调用，
/// 因此批处理事件和时间过滤事件在一个步骤内只会产生一次
#[derive(Debug, Default)]
struct StepCache {
    choice: Option<ActionChoice>,
    args: Option<ToolArgs>,
    payload: Option<ToolPayload>,
    code_task: Option<String>,
}

pub struct TrajectoryController {
    context: ResearchContext,
}

impl TrajectoryController {
    pub fn new(context: ResearchContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &ResearchContext {
        &self.context
    }

    /// 执行一次完整的调研
    ///
    /// 只有参数非法和不可恢复的失败会以错误返回，其余失败都以Error事件的形式汇报
    pub async fn run(
        &mut self,
        goal: &str,
        research_datetime: DateTime<Utc>,
        budget: StepBudget,
        sink: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<ResearchOutcome, ResearchError> {
        let goal = goal.trim();
        if goal.is_empty() {
            let err = ResearchError::InvalidInput("调研目标不能为空".to_string());
            report_rejection(sink, &err);
            return Err(err);
        }

        let run_id = Uuid::new_v4();
        info!(
            %run_id,
            min_steps = budget.min_steps,
            max_steps = budget.max_steps,
            "🚀 开始调研: {}",
            goal
        );
        let mut state = ResearchState::new(goal, research_datetime);

        loop {
            if cancel.is_cancelled() {
                warn!(%run_id, step = state.step, "🛑 调研被取消");
                emit_snapshot(&state, sink);
                return Ok(ResearchOutcome::Cancelled(state));
            }

            let mut cache = StepCache::default();
            let mut failures = 0;
            let choice = loop {
                match self.attempt(&mut state, &mut cache, &budget, sink).await {
                    Ok(choice) => break choice,
                    Err(e) => {
                        failures += 1;
                        let fatal = failures >= MAX_ATTEMPTS_PER_STEP;
                        if fatal {
                            emit_snapshot(&state, sink);
                        }
                        report_error(sink, &e, fatal);
                        if fatal {
                            error!(%run_id, step = state.step, "❌ 步骤连续失败，终止调研: {:#}", e);
                            return Err(ResearchError::Fatal {
                                step: state.step,
                                message: format!("{:#}", e),
                            });
                        }
                        warn!(%run_id, step = state.step, "⚠️ 步骤执行失败，重试: {:#}", e);
                    }
                }
            };

            if choice == ActionChoice::End {
                let outcome = self.finish(state, sink).await;
                if outcome.is_ok() {
                    info!(%run_id, "🎉 调研完成");
                }
                return outcome;
            }

            state.step += 1;
            state.trajectory.push(choice);
            info!(%run_id, step = state.step, action = %choice, "✅ 步骤完成");
            self.after_step(&mut state, sink).await;
        }
    }

    /// 尝试一次当前步骤：选择动作（若尚未选择），然后执行并合并结果
    async fn attempt(
        &mut self,
        state: &mut ResearchState,
        cache: &mut StepCache,
        budget: &StepBudget,
        sink: &ProgressSink,
    ) -> Result<ActionChoice> {
        let choice = match cache.choice {
            Some(choice) => choice,
            None => {
                let choice = self.decide(state, budget, sink).await?;
                cache.choice = Some(choice);
                choice
            }
        };

        match choice {
            ActionChoice::Search => self.search(state, cache, sink).await?,
            ActionChoice::Read => self.read(state, cache, sink).await?,
            ActionChoice::Code => self.code(state, cache, sink).await?,
            ActionChoice::End => {}
        }
        Ok(choice)
    }

    /// 选择下一步动作，并按步数预算和当前状态改写不可执行的选择
    async fn decide(
        &mut self,
        state: &ResearchState,
        budget: &StepBudget,
        sink: &ProgressSink,
    ) -> Result<ActionChoice> {
        if budget.is_exhausted(state.step) {
            sink.emit(EventKind::Reasoning {
                action: ActionChoice::End.to_string(),
                reasoning: format!("step budget of {} steps is exhausted", budget.max_steps),
            });
            sink.emit(EventKind::AgentSelection {
                step: state.step,
                agent_selection: ActionChoice::End,
                overridden_from: None,
            });
            return Ok(ActionChoice::End);
        }

        let proposed = self
            .context
            .selector
            .select(state, budget, sink)
            .await
            .context("动作选择失败")?;

        let (choice, overridden_from) = match self.enforce(state, budget, proposed) {
            Some((choice, reasoning)) => {
                debug!(step = state.step, %proposed, %choice, "改写选择器的动作");
                sink.emit(EventKind::Reasoning {
                    action: choice.to_string(),
                    reasoning,
                });
                (choice, Some(proposed))
            }
            None => (proposed, None),
        };

        info!(step = state.step + 1, action = %choice, "🤖 选择下一步动作");
        sink.emit(EventKind::AgentSelection {
            step: state.step,
            agent_selection: choice,
            overridden_from,
        });
        Ok(choice)
    }

    /// 返回需要改写时的新动作及理由
    fn enforce(
        &self,
        state: &ResearchState,
        budget: &StepBudget,
        proposed: ActionChoice,
    ) -> Option<(ActionChoice, String)> {
        match proposed {
            ActionChoice::End if !budget.can_end(state.step) => Some((
                ActionChoice::Search,
                format!(
                    "cannot end before the minimum of {} steps ({} done), searching instead",
                    budget.min_steps, state.step
                ),
            )),
            ActionChoice::Read if !state.has_unread_pages() => Some((
                ActionChoice::Search,
                "there are no unread pages, searching instead".to_string(),
            )),
            ActionChoice::Code if !self.context.executor.has_tool(CODE_EXECUTION) => Some((
                ActionChoice::Search,
                "code execution is not available, searching instead".to_string(),
            )),
            _ => None,
        }
    }

    /// 执行工具调用，成功的结果会被缓存给重试使用
    async fn execute_cached(
        &self,
        code: &str,
        args: &ToolArgs,
        cache: &mut StepCache,
        sink: &ProgressSink,
    ) -> Result<ToolPayload> {
        if let Some(payload) = &cache.payload {
            debug!(tool = code, "复用已成功的工具结果");
            return Ok(payload.clone());
        }

        let result = self.context.executor.execute(code, args, sink).await;
        if !result.success {
            return Err(anyhow!(
                result.error.unwrap_or_else(|| result.message.clone())
            ));
        }
        let payload = result
            .payload
            .ok_or_else(|| anyhow!("工具 {} 没有返回结果", code))?;
        cache.payload = Some(payload.clone());
        Ok(payload)
    }

    async fn search(
        &self,
        state: &mut ResearchState,
        cache: &mut StepCache,
        sink: &ProgressSink,
    ) -> Result<()> {
        let args = match cache.args.clone() {
            Some(args) => args,
            None => {
                let plan = self
                    .context
                    .planner
                    .plan_search(state)
                    .await
                    .context("搜索规划失败")?;

                let searched: HashSet<String> = state.searched_query_strings().into_iter().collect();
                let fresh: Vec<String> = plan
                    .query_strings
                    .iter()
                    .filter(|q| !searched.contains(q.trim()))
                    .cloned()
                    .collect();
                let query_strings = if fresh.is_empty() {
                    warn!("规划的查询都已经搜索过，重新搜索");
                    plan.query_strings
                } else {
                    fresh
                };

                let args = to_args(json!({
                    "sub_goal": plan.sub_goal,
                    "query_strings": query_strings,
                }));
                cache.args = Some(args.clone());
                args
            }
        };

        let ToolPayload::BatchSearch { results, .. } =
            self.execute_cached(BATCH_SEARCH, &args, cache, sink).await?
        else {
            return Err(anyhow!("批量搜索返回了意外的结果"));
        };
        state.searched_queries.extend(results);
        Ok(())
    }

    async fn read(
        &self,
        state: &mut ResearchState,
        cache: &mut StepCache,
        sink: &ProgressSink,
    ) -> Result<()> {
        let args = match cache.args.clone() {
            Some(args) => args,
            None => {
                let pages = self.pick_pages(state).await?;
                let args = to_args(json!({
                    "pages": pages,
                    "research_datetime": state.research_datetime.to_rfc3339(),
                }));
                cache.args = Some(args.clone());
                args
            }
        };

        let ToolPayload::BatchRead {
            pages,
            excluded,
            failed,
            ..
        } = self.execute_cached(BATCH_READ, &args, cache, sink).await?
        else {
            return Err(anyhow!("批量阅读返回了意外的结果"));
        };

        let drafts = if pages.is_empty() {
            Vec::new()
        } else {
            self.context
                .planner
                .extract_knowledge(state, &pages)
                .await
                .context("知识提炼失败")?
        };

        // 知识点只能引用本次真正读到的页面
        let readable: HashSet<&str> = pages.iter().map(|p| p.url.as_str()).collect();
        let items: Vec<KnowledgeItem> = drafts
            .into_iter()
            .filter_map(|draft| {
                let sources: Vec<String> = draft
                    .source_urls
                    .into_iter()
                    .filter(|url| readable.contains(url.as_str()))
                    .collect();
                if sources.is_empty() || draft.content.trim().is_empty() {
                    None
                } else {
                    Some(KnowledgeItem::new(draft.content, sources))
                }
            })
            .collect();

        state
            .read_urls
            .extend(pages.iter().chain(failed.iter()).map(|p| p.url.clone()));
        state
            .excluded_urls
            .extend(excluded.iter().map(|p| p.url.clone()));

        let new_items = state.knowledge.append(items);
        info!(
            read = pages.len(),
            excluded = excluded.len(),
            failed = failed.len(),
            new_knowledge = new_items.len(),
            "📖 阅读结果已合并"
        );
        if !new_items.is_empty() {
            sink.emit(EventKind::NewKnowledge { new_items });
        }
        Ok(())
    }

    /// 挑选本次要阅读的未读页面
    async fn pick_pages(&self, state: &ResearchState) -> Result<Vec<Page>> {
        let unread = state.unread_pages();
        if unread.is_empty() {
            return Err(anyhow!("没有可以阅读的页面"));
        }
        let max_pages = self.context.settings.max_pages_per_read.max(1);

        let chosen = self
            .context
            .planner
            .select_pages(state, &unread, max_pages)
            .await
            .context("页面挑选失败")?;

        // 以状态中的页面为准，忽略规划器返回的未知页面
        let chosen_urls: HashSet<String> = chosen.into_iter().map(|p| p.url).collect();
        let pages: Vec<Page> = unread
            .iter()
            .filter(|p| chosen_urls.contains(&p.url))
            .take(max_pages)
            .cloned()
            .collect();

        if pages.is_empty() {
            Ok(unread.into_iter().take(max_pages).collect())
        } else {
            Ok(pages)
        }
    }

    async fn code(
        &self,
        state: &mut ResearchState,
        cache: &mut StepCache,
        sink: &ProgressSink,
    ) -> Result<()> {
        let args = match cache.args.clone() {
            Some(args) => args,
            None => {
                let plan = self
                    .context
                    .planner
                    .plan_code(state)
                    .await
                    .context("编码规划失败")?;
                let docs = match plan.retrieval_query.as_deref().map(str::trim) {
                    Some(query) if !query.is_empty() => self.lookup_docs(query, sink).await?,
                    _ => None,
                };
                let code = self
                    .context
                    .planner
                    .write_code(state, &plan, docs.as_ref())
                    .await
                    .context("代码编写失败")?;

                cache.code_task = Some(plan.task);
                let args = to_args(json!({ "code": code }));
                cache.args = Some(args.clone());
                args
            }
        };

        let ToolPayload::Code(code_result) =
            self.execute_cached(CODE_EXECUTION, &args, cache, sink).await?
        else {
            return Err(anyhow!("代码执行返回了意外的结果"));
        };

        let task = cache.code_task.as_deref().unwrap_or("code execution");
        match code_knowledge(task, &code_result) {
            Some(content) => {
                let source = format!("code_execution:step-{}", state.step + 1);
                let new_items = state
                    .knowledge
                    .append(vec![KnowledgeItem::new(content, [source])]);
                if !new_items.is_empty() {
                    sink.emit(EventKind::NewKnowledge { new_items });
                }
            }
            None => debug!(exception = ?code_result.exception, "代码没有产生可用的结果"),
        }
        Ok(())
    }

    /// 为编码任务检索接口文档
    ///
    /// 检索词未通过校验时不检索，其余检索失败按步骤失败处理
    async fn lookup_docs(&self, query: &str, sink: &ProgressSink) -> Result<Option<RetrievalResult>> {
        if !self.context.retrieve_docs || !self.context.executor.has_tool(RETRIEVAL) {
            return Ok(None);
        }

        let result = self
            .context
            .executor
            .execute(RETRIEVAL, &to_args(json!({ "retrieval_query": query })), sink)
            .await;
        if result.validation_failed {
            warn!(query, "检索词不合规，跳过文档检索");
            return Ok(None);
        }
        if !result.success {
            return Err(anyhow!(result.error.unwrap_or(result.message)));
        }
        match result.payload {
            Some(ToolPayload::Retrieval(docs)) => Ok(Some(docs)),
            _ => Ok(None),
        }
    }

    async fn after_step(&self, state: &mut ResearchState, sink: &ProgressSink) {
        if self
            .context
            .settings
            .refinement_policy
            .should_refine_after(state.step)
        {
            self.refine(state, sink).await;
        }

        let interval = self.context.settings.snapshot_interval;
        if interval > 0 && state.step % interval == 0 {
            emit_snapshot(state, sink);
        }
    }

    /// 精炼知识库，失败只汇报不终止
    async fn refine(&self, state: &mut ResearchState, sink: &ProgressSink) {
        let outcome = refine_knowledge(
            &mut state.knowledge,
            self.context.refiner.as_ref(),
            &state.goal,
            self.context.settings.similarity_threshold,
        )
        .await;

        match outcome {
            Ok(Some(outcome)) => sink.emit(EventKind::RefinedKnowledge {
                original_items: outcome.original_items,
                refined_items: outcome.refined_items,
            }),
            Ok(None) => debug!(step = state.step, "没有需要精炼的知识"),
            Err(e) => {
                warn!(step = state.step, "⚠️ 知识精炼失败: {:#}", e);
                report_error(sink, &e.context("知识精炼失败"), false);
            }
        }
    }

    /// 结束调研：精炼、发出快照、撰写报告。报告失败不可恢复
    async fn finish(
        &self,
        mut state: ResearchState,
        sink: &ProgressSink,
    ) -> Result<ResearchOutcome, ResearchError> {
        self.refine(&mut state, sink).await;
        emit_snapshot(&state, sink);

        match self.context.report.generate(&state, sink).await {
            Ok(essay) => Ok(ResearchOutcome::Completed(FinalReport { essay, state })),
            Err(e) => {
                let e = e.context("调研报告撰写失败");
                error!(step = state.step, "❌ {:#}", e);
                report_error(sink, &e, true);
                Err(ResearchError::Fatal {
                    step: state.step,
                    message: format!("{:#}", e),
                })
            }
        }
    }
}

fn to_args(value: Value) -> ToolArgs {
    match value {
        Value::Object(map) => map,
        _ => ToolArgs::new(),
    }
}

fn emit_snapshot(state: &ResearchState, sink: &ProgressSink) {
    sink.emit(EventKind::ResearchState {
        snapshot: state.snapshot(),
    });
}

fn report_error(sink: &ProgressSink, error: &anyhow::Error, fatal: bool) {
    sink.emit(EventKind::Error {
        error: format!("{:#}", error),
        traceback: format!("{:?}", error),
        fatal,
    });
}

/// 调研开始前被拒绝的请求同样以致命Error事件汇报
pub(crate) fn report_rejection(sink: &ProgressSink, error: &ResearchError) {
    sink.emit(EventKind::Error {
        error: error.to_string(),
        traceback: format!("{:?}", error),
        fatal: true,
    });
}

/// 把成功的代码执行结果整理为知识点内容
fn code_knowledge(task: &str, result: &CodeResult) -> Option<String> {
    if !result.succeeded() {
        return None;
    }
    if !result.output.is_null() {
        return Some(format!("{}: {}", task, result.output));
    }
    let stdout = result.stdout.trim();
    if stdout.is_empty() {
        return None;
    }
    Some(format!(
        "{}: {}",
        task,
        truncate_chars(stdout, MAX_CODE_KNOWLEDGE_CHARS)
    ))
}
