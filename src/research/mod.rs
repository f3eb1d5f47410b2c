//! 调研运行入口 - 组装调研组件并驱动轨迹控制器

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::agent::{
    AgentSelector, HeuristicSelector, LlmPlanner, LlmSelector, ReportGenerator, ResearchPlanner,
    StepBudget,
};
use crate::config::{Config, ResearchConfig, SelectorKind};
use crate::errors::ResearchError;
use crate::knowledge::{KnowledgeRefiner, LlmRefiner};
use crate::llm::{ModelHandle, TextGenerator};
use crate::progress::ProgressSink;
use crate::retrieval::embedder::OpenAiEmbedder;
use crate::retrieval::{Collection, CollectionRegistry, RetrievalService};
use crate::search::{HttpPageReader, SerpApiSearch};
use crate::tools::{BatchReadTool, BatchSearchTool, CodeExecutionTool, RetrievalTool, ToolExecutor};
use crate::types::{EventKind, ResearchEvent, ResearchState, parse_research_datetime};

pub mod controller;

pub use controller::TrajectoryController;

/// 一次调研所需的全部组件
pub struct ResearchContext {
    pub settings: ResearchConfig,
    pub executor: ToolExecutor,
    pub selector: Box<dyn AgentSelector>,
    pub planner: Arc<dyn ResearchPlanner>,
    pub refiner: Arc<dyn KnowledgeRefiner>,
    pub report: ReportGenerator,
    /// 编写代码前是否先检索接口文档
    pub retrieve_docs: bool,
}

impl ResearchContext {
    pub fn new(
        settings: ResearchConfig,
        executor: ToolExecutor,
        selector: Box<dyn AgentSelector>,
        planner: Arc<dyn ResearchPlanner>,
        refiner: Arc<dyn KnowledgeRefiner>,
        report: ReportGenerator,
    ) -> Self {
        Self {
            settings,
            executor,
            selector,
            planner,
            refiner,
            report,
            retrieve_docs: true,
        }
    }

    /// 按配置组装搜索、阅读、检索、代码执行工具以及基于大模型的智能体
    pub fn from_config(config: &Config, llm: Arc<dyn TextGenerator>) -> Result<Self> {
        let settings = config.research.clone();
        let language = config.target_language;
        let mut executor =
            ToolExecutor::new(settings.tool_timeout_seconds.map(Duration::from_secs));

        let search = SerpApiSearch::from_config(&config.search)?;
        executor.register(Arc::new(BatchSearchTool::new(
            Arc::new(search),
            config.search.max_results,
            settings.max_parallels,
        )))?;

        let reader = HttpPageReader::from_config(&config.reader)?;
        executor.register(Arc::new(BatchReadTool::new(
            Arc::new(reader),
            settings.max_parallels,
        )))?;

        if config.retrieval.enabled
            && let Some(path) = &config.retrieval.embeddings_path
        {
            let collection = Collection::load_json(&config.retrieval.collection_name, path)
                .with_context(|| format!("无法加载向量文件 {}", path.display()))?;
            println!(
                "📚 已加载向量集合 {}（{}条文档）",
                collection.name(),
                collection.len()
            );
            let mut registry = CollectionRegistry::new();
            registry.register(collection);
            let embedder = OpenAiEmbedder::from_config(&config.retrieval, &config.llm.api_key);
            let service = RetrievalService::new(Arc::new(registry), Arc::new(embedder));
            executor.register(Arc::new(RetrievalTool::new(
                service,
                config.retrieval.n_results,
            )))?;
        }

        if config.code.enabled {
            executor.register(Arc::new(CodeExecutionTool::from_config(&config.code)))?;
        }
        debug!(tools = ?executor.codes(), "工具注册完成");

        let selector: Box<dyn AgentSelector> = match settings.selector {
            SelectorKind::Llm => Box::new(LlmSelector::new(
                llm.clone(),
                ModelHandle::Efficient,
                language,
                config.code.enabled,
            )),
            SelectorKind::Heuristic => Box::new(HeuristicSelector),
        };
        let planner = LlmPlanner::new(llm.clone(), language)
            .with_page_budget(config.reader.max_tokens_per_page)
            .with_max_parallels(settings.max_parallels);
        let refiner = LlmRefiner::new(llm.clone(), ModelHandle::Efficient, language);
        let report = ReportGenerator::new(llm, language);

        let mut context = Self::new(
            settings,
            executor,
            selector,
            Arc::new(planner),
            Arc::new(refiner),
            report,
        );
        context.retrieve_docs = config.code.retrieve_docs;
        Ok(context)
    }
}

/// 调研的最终报告
#[derive(Debug, Clone)]
pub struct FinalReport {
    pub essay: String,
    pub state: ResearchState,
}

/// 一次调研运行的结果
#[derive(Debug, Clone)]
pub enum ResearchOutcome {
    Completed(FinalReport),
    /// 被外部取消，返回取消时的调研状态
    Cancelled(ResearchState),
}

impl ResearchOutcome {
    pub fn state(&self) -> &ResearchState {
        match self {
            ResearchOutcome::Completed(report) => &report.state,
            ResearchOutcome::Cancelled(state) => state,
        }
    }

    pub fn into_report(self) -> Option<FinalReport> {
        match self {
            ResearchOutcome::Completed(report) => Some(report),
            ResearchOutcome::Cancelled(_) => None,
        }
    }
}

/// 执行一次调研，事件按产生顺序交给回调
pub async fn run_research<F>(
    context: ResearchContext,
    goal: &str,
    research_datetime: DateTime<Utc>,
    min_steps: usize,
    max_steps: usize,
    progress_callback: F,
) -> Result<FinalReport, ResearchError>
where
    F: FnMut(ResearchEvent) + Send + 'static,
{
    let outcome = run_research_with_cancel(
        context,
        goal,
        research_datetime,
        min_steps,
        max_steps,
        progress_callback,
        CancellationToken::new(),
    )
    .await?;

    match outcome {
        ResearchOutcome::Completed(report) => Ok(report),
        ResearchOutcome::Cancelled(state) => Err(ResearchError::Fatal {
            step: state.step,
            message: "调研被取消".to_string(),
        }),
    }
}

/// 参考时间以文本给出的调研入口，格式同 `parse_research_datetime`
///
/// 无法解析的时间作为致命Error事件交给回调，并返回参数错误
pub async fn run_research_at<F>(
    context: ResearchContext,
    goal: &str,
    research_datetime: &str,
    min_steps: usize,
    max_steps: usize,
    mut progress_callback: F,
) -> Result<FinalReport, ResearchError>
where
    F: FnMut(ResearchEvent) + Send + 'static,
{
    let research_datetime = match parse_research_datetime(research_datetime) {
        Ok(datetime) => datetime,
        Err(e) => {
            progress_callback(ResearchEvent::now(EventKind::Error {
                error: e.to_string(),
                traceback: format!("{:?}", e),
                fatal: true,
            }));
            return Err(e);
        }
    };
    run_research(
        context,
        goal,
        research_datetime,
        min_steps,
        max_steps,
        progress_callback,
    )
    .await
}

/// 执行一次可取消的调研
///
/// 回调在独立任务中消费事件，返回前会等待所有事件投递完毕
pub async fn run_research_with_cancel<F>(
    context: ResearchContext,
    goal: &str,
    research_datetime: DateTime<Utc>,
    min_steps: usize,
    max_steps: usize,
    progress_callback: F,
    cancel: CancellationToken,
) -> Result<ResearchOutcome, ResearchError>
where
    F: FnMut(ResearchEvent) + Send + 'static,
{
    let (sink, stream) = ProgressSink::channel();
    let observer = stream.spawn_observer(progress_callback);

    let outcome = match StepBudget::new(min_steps, max_steps) {
        Ok(budget) => {
            let mut controller = TrajectoryController::new(context);
            controller
                .run(goal, research_datetime, budget, &sink, &cancel)
                .await
        }
        Err(e) => {
            controller::report_rejection(&sink, &e);
            Err(e)
        }
    };

    drop(sink);
    if let Err(e) = observer.await {
        tracing::warn!("⚠️ 事件观察者异常退出: {}", e);
    }
    outcome
}
