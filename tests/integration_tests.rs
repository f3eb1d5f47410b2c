use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use deep_research_rs::agent::{
    AgentSelector, CodePlan, KnowledgeDraft, ReportGenerator, ResearchPlanner, ScriptedSelector,
    SearchPlan, StepBudget,
};
use deep_research_rs::config::{RefinementPolicy, ResearchConfig};
use deep_research_rs::i18n::TargetLanguage;
use deep_research_rs::knowledge::{KnowledgeStore, OverlapRefiner, refine_knowledge};
use deep_research_rs::llm::{ChatTurn, ModelHandle, TextGenerator};
use deep_research_rs::progress::ProgressSink;
use deep_research_rs::retrieval::{
    Collection, CollectionRegistry, Embedder, EmbeddingRecord, RetrievalService,
};
use deep_research_rs::search::{PageReader, SearchBackend};
use deep_research_rs::tools::{
    BatchReadTool, BatchSearchTool, CodeExecutionTool, RetrievalTool, ToolExecutor,
};
use deep_research_rs::types::{
    ActionChoice, EventKind, KnowledgeItem, Page, ResearchEvent, ResearchState, RetrievalResult,
};
use deep_research_rs::{
    ResearchContext, ResearchError, ResearchOutcome, run_research, run_research_at,
    run_research_with_cancel,
};

const POLICIES: [RefinementPolicy; 3] = [
    RefinementPolicy::EveryStep,
    RefinementPolicy::Periodic { every: 2 },
    RefinementPolicy::BeforeEnd,
];

fn reference_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 30, 0, 0, 0).unwrap()
}

fn early() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
}

fn late() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).unwrap()
}

/// 每个查询返回三个页面：已知较早、已知较晚、时间未知
struct StubSearch {
    calls: AtomicUsize,
    failing_calls: usize,
}

impl StubSearch {
    fn reliable() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            failing_calls: 0,
        }
    }

    fn failing(failing_calls: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            failing_calls,
        }
    }
}

#[async_trait]
impl SearchBackend for StubSearch {
    async fn search(&self, query: &str, _max_results: usize) -> Result<Vec<Page>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failing_calls {
            return Err(anyhow!("search backend unavailable"));
        }
        let slug = query.replace(' ', "-");
        Ok(vec![
            Page::new(format!("{} old", query), format!("https://{}/old", slug))
                .with_modified_time(early()),
            Page::new(format!("{} new", query), format!("https://{}/new", slug))
                .with_modified_time(late()),
            Page::new(format!("{} hidden", query), format!("https://{}/hidden", slug)),
        ])
    }
}

/// `/hidden` 页面读取后才暴露出较晚的修改时间
struct StubReader;

#[async_trait]
impl PageReader for StubReader {
    async fn read(&self, page: &Page) -> Result<Page> {
        let modified = if page.url.ends_with("/hidden") {
            late()
        } else {
            page.modified_time.unwrap_or_else(early)
        };
        Ok(page
            .clone()
            .with_markdown(format!("content of {}", page.url))
            .with_modified_time(modified))
    }
}

/// 确定性的规划器：查询随已搜索数量变化，提炼出的知识点引用所有候选页面
struct StubPlanner;

#[async_trait]
impl ResearchPlanner for StubPlanner {
    async fn plan_search(&self, state: &ResearchState) -> Result<SearchPlan> {
        let round = state.searched_queries.len();
        Ok(SearchPlan {
            sub_goal: format!("sub goal {}", round),
            query_strings: vec![format!("query {}", round), format!("query {}", round + 1)],
        })
    }

    async fn select_pages(
        &self,
        _state: &ResearchState,
        candidates: &[Page],
        max_pages: usize,
    ) -> Result<Vec<Page>> {
        Ok(candidates.iter().take(max_pages).cloned().collect())
    }

    async fn extract_knowledge(
        &self,
        state: &ResearchState,
        pages: &[Page],
    ) -> Result<Vec<KnowledgeDraft>> {
        // 故意引用所有候选页面，控制器必须只保留真正读到的来源
        let all_candidates: Vec<String> = state
            .searched_queries
            .iter()
            .flat_map(|q| q.search_result_pages.iter().map(|p| p.url.clone()))
            .collect();
        let mut drafts: Vec<KnowledgeDraft> = pages
            .iter()
            .map(|page| KnowledgeDraft {
                content: format!("fact from {}", page.url),
                source_urls: vec![page.url.clone()],
            })
            .collect();
        drafts.push(KnowledgeDraft {
            content: "summary across every candidate".to_string(),
            source_urls: all_candidates,
        });
        drafts.push(KnowledgeDraft {
            content: "rumour from a late page".to_string(),
            source_urls: vec!["https://query-0/new".to_string()],
        });
        Ok(drafts)
    }

    async fn plan_code(&self, _state: &ResearchState) -> Result<CodePlan> {
        Ok(CodePlan {
            task: "compute growth".to_string(),
            retrieval_query: Some("growth rate".to_string()),
        })
    }

    async fn write_code(
        &self,
        _state: &ResearchState,
        _plan: &CodePlan,
        docs: Option<&RetrievalResult>,
    ) -> Result<String> {
        let documents = docs.map(|d| d.len()).unwrap_or(0);
        Ok(format!("echo '{{\"value\": 42, \"docs\": {}}}'", documents))
    }
}

/// 报告撰写用的模型替身
struct StubWriter {
    fail: bool,
}

#[async_trait]
impl TextGenerator for StubWriter {
    async fn generate_text(
        &self,
        _model: &ModelHandle,
        prompt: &str,
        _context: &[ChatTurn],
    ) -> Result<String> {
        if self.fail {
            return Err(anyhow!("writer offline"));
        }
        let cited = prompt.matches("Sources:").count();
        Ok(format!("# Report\n\nBased on {} knowledge items.", cited))
    }
}

struct AxisEmbedder;

#[async_trait]
impl Embedder for AxisEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Ok(vec![1.0, 0.0])
    }
}

struct Setup {
    policy: RefinementPolicy,
    search: Arc<StubSearch>,
    writer_fails: bool,
    with_code: bool,
}

impl Setup {
    fn new(policy: RefinementPolicy) -> Self {
        Self {
            policy,
            search: Arc::new(StubSearch::reliable()),
            writer_fails: false,
            with_code: false,
        }
    }

    fn build(self, selector: Box<dyn AgentSelector>) -> ResearchContext {
        let settings = ResearchConfig {
            refinement_policy: self.policy,
            max_pages_per_read: 20,
            similarity_threshold: 0.5,
            snapshot_interval: 1,
            ..ResearchConfig::default()
        };

        let mut executor = ToolExecutor::new(None);
        executor
            .register(Arc::new(BatchSearchTool::new(self.search.clone(), 5, 2)))
            .unwrap();
        executor
            .register(Arc::new(BatchReadTool::new(Arc::new(StubReader), 2)))
            .unwrap();
        if self.with_code {
            let records = [
                ("api-near", vec![1.0, 0.05]),
                ("api-exact", vec![1.0, 0.0]),
                ("api-mid", vec![0.6, 0.4]),
                ("api-far", vec![0.0, 1.0]),
            ]
            .into_iter()
            .map(|(id, embedding)| EmbeddingRecord {
                id: id.to_string(),
                text: format!("docs for {}", id),
                embedding,
            })
            .collect();
            let mut registry = CollectionRegistry::new();
            registry.register(Collection::from_records("api", records).unwrap());
            let service = RetrievalService::new(Arc::new(registry), Arc::new(AxisEmbedder));
            executor
                .register(Arc::new(RetrievalTool::new(service, 3)))
                .unwrap();
            executor
                .register(Arc::new(CodeExecutionTool::new(
                    "sh",
                    vec!["-c".to_string()],
                    std::env::temp_dir(),
                )))
                .unwrap();
        }

        let writer = Arc::new(StubWriter {
            fail: self.writer_fails,
        });
        ResearchContext::new(
            settings,
            executor,
            selector,
            Arc::new(StubPlanner),
            Arc::new(OverlapRefiner),
            ReportGenerator::new(writer, TargetLanguage::English),
        )
    }
}

fn recorder() -> (Arc<Mutex<Vec<ResearchEvent>>>, impl FnMut(ResearchEvent) + Send + 'static) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    (events, move |event| sink.lock().unwrap().push(event))
}

fn kinds(events: &[ResearchEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.kind_name()).collect()
}

fn count(events: &[ResearchEvent], kind: &str) -> usize {
    events.iter().filter(|e| e.kind_name() == kind).count()
}

fn selections(events: &[ResearchEvent]) -> Vec<(usize, ActionChoice, Option<ActionChoice>)> {
    events
        .iter()
        .filter_map(|e| match &e.event {
            EventKind::AgentSelection {
                step,
                agent_selection,
                overridden_from,
            } => Some((*step, *agent_selection, *overridden_from)),
            _ => None,
        })
        .collect()
}

/// 每个批次的Start都先于它的Complete，并且先于后一个批次的Start
fn assert_batches_well_ordered(events: &[ResearchEvent]) {
    let mut open: Option<u64> = None;
    for event in events {
        match &event.event {
            EventKind::BatchSearchStart { batch_id, .. } | EventKind::BatchReadStart { batch_id, .. } => {
                assert!(open.is_none(), "batch {} started inside another batch", batch_id);
                open = Some(*batch_id);
            }
            EventKind::BatchSearchComplete { batch_id, .. }
            | EventKind::BatchReadComplete { batch_id, .. } => {
                assert_eq!(open, Some(*batch_id), "complete without matching start");
                open = None;
            }
            _ => {}
        }
    }
    assert!(open.is_none());
}

fn assert_timestamps_monotonic(events: &[ResearchEvent]) {
    assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[tokio::test]
async fn test_scripted_two_searches_then_end() {
    for policy in POLICIES {
        let context = Setup::new(policy).build(Box::new(ScriptedSelector::new([
            ActionChoice::Search,
            ActionChoice::Search,
            ActionChoice::End,
        ])));
        let (events, callback) = recorder();

        let report = run_research(context, "X", reference_time(), 2, 5, callback)
            .await
            .unwrap();

        let events = events.lock().unwrap();
        assert_eq!(report.state.step, 2, "policy {:?}", policy);
        assert_eq!(
            report.state.trajectory,
            vec![ActionChoice::Search, ActionChoice::Search]
        );
        assert_eq!(count(&events, "batch_search_start"), 2);
        assert_eq!(count(&events, "batch_search_complete"), 2);
        assert!(!report.essay.is_empty());

        let kinds = kinds(&events);
        let start = kinds.iter().position(|k| *k == "generate_essay_start").unwrap();
        let complete = kinds
            .iter()
            .position(|k| *k == "generate_essay_complete")
            .unwrap();
        assert!(start < complete);
        assert_eq!(complete, kinds.len() - 1);
        // 结束前至少发出一次状态快照
        assert!(kinds[..start].contains(&"research_state"));
        assert_batches_well_ordered(&events);
        assert_timestamps_monotonic(&events);
    }
}

#[tokio::test]
async fn test_end_before_min_steps_is_overridden() {
    for policy in POLICIES {
        let context =
            Setup::new(policy).build(Box::new(ScriptedSelector::always(ActionChoice::End)));
        let (events, callback) = recorder();

        let report = run_research(context, "X", reference_time(), 3, 6, callback)
            .await
            .unwrap();

        assert_eq!(report.state.step, 3);
        let events = events.lock().unwrap();
        let selections = selections(&events);
        assert_eq!(
            selections,
            vec![
                (0, ActionChoice::Search, Some(ActionChoice::End)),
                (1, ActionChoice::Search, Some(ActionChoice::End)),
                (2, ActionChoice::Search, Some(ActionChoice::End)),
                (3, ActionChoice::End, None),
            ]
        );
        assert!(count(&events, "reasoning") >= 3);
    }
}

#[tokio::test]
async fn test_max_steps_forces_end() {
    for policy in POLICIES {
        let context =
            Setup::new(policy).build(Box::new(ScriptedSelector::always(ActionChoice::Search)));
        let (events, callback) = recorder();

        let report = run_research(context, "X", reference_time(), 1, 4, callback)
            .await
            .unwrap();

        assert_eq!(report.state.step, 4);
        let events = events.lock().unwrap();
        let last = *selections(&events).last().unwrap();
        assert_eq!(last, (4, ActionChoice::End, None));
        assert_eq!(count(&events, "batch_search_start"), 4);
    }
}

#[tokio::test]
async fn test_read_with_nothing_unread_becomes_search() {
    let context = Setup::new(RefinementPolicy::BeforeEnd).build(Box::new(ScriptedSelector::new([
        ActionChoice::Read,
        ActionChoice::End,
    ])));
    let (events, callback) = recorder();

    let report = run_research(context, "X", reference_time(), 1, 3, callback)
        .await
        .unwrap();

    assert_eq!(report.state.trajectory, vec![ActionChoice::Search]);
    let events = events.lock().unwrap();
    assert_eq!(
        selections(&events)[0],
        (0, ActionChoice::Search, Some(ActionChoice::Read))
    );
}

#[tokio::test]
async fn test_pages_after_reference_time_never_become_knowledge() {
    for policy in POLICIES {
        let context = Setup::new(policy).build(Box::new(ScriptedSelector::new([
            ActionChoice::Search,
            ActionChoice::Read,
            ActionChoice::End,
        ])));
        let (events, callback) = recorder();

        let report = run_research(context, "X", reference_time(), 2, 4, callback)
            .await
            .unwrap();
        let events = events.lock().unwrap();

        let late_urls: HashSet<String> = ["query-0", "query-1"]
            .iter()
            .flat_map(|q| [format!("https://{}/new", q), format!("https://{}/hidden", q)])
            .collect();

        // 最终知识库（包括已被取代的知识点）不引用任何较晚的页面
        for item in report.state.knowledge.all_items() {
            for source in &item.sources {
                assert!(!late_urls.contains(source), "{} leaked into knowledge", source);
            }
        }
        assert!(!report.state.knowledge.is_empty());

        // 每个较晚的页面恰好有一个PageNotAllowedToRead事件
        let mut not_allowed: HashMap<String, usize> = HashMap::new();
        for event in events.iter() {
            if let EventKind::PageNotAllowedToRead {
                page,
                research_datetime,
            } = &event.event
            {
                assert_eq!(*research_datetime, reference_time());
                *not_allowed.entry(page.url.clone()).or_default() += 1;
            }
        }
        assert_eq!(not_allowed.len(), late_urls.len());
        assert!(not_allowed.iter().all(|(url, n)| late_urls.contains(url) && *n == 1));
        assert_eq!(report.state.excluded_urls.len(), late_urls.len());
        assert_batches_well_ordered(&events);
    }
}

#[tokio::test]
async fn test_every_step_refinement_is_reported() {
    let context = Setup::new(RefinementPolicy::EveryStep).build(Box::new(ScriptedSelector::new([
        ActionChoice::Search,
        ActionChoice::Read,
        ActionChoice::End,
    ])));
    let (events, callback) = recorder();

    let report = run_research(context, "X", reference_time(), 2, 4, callback)
        .await
        .unwrap();
    let events = events.lock().unwrap();

    // "fact from https://query-0/old" 与 "fact from https://query-1/old" 高度重叠
    let refined: Vec<&ResearchEvent> = events
        .iter()
        .filter(|e| e.kind_name() == "refined_knowledge")
        .collect();
    assert_eq!(refined.len(), 1);
    assert!(
        report
            .state
            .knowledge
            .active_items()
            .iter()
            .any(|item| item.is_refined())
    );
}

#[tokio::test]
async fn test_refinement_is_idempotent() {
    let mut store = KnowledgeStore::new();
    store.append(vec![
        KnowledgeItem::new("Lithium carbonate price fell 20% in 2024", ["https://a"]),
        KnowledgeItem::new("Lithium carbonate price fell 20% in 2024 amid oversupply", ["https://b"]),
        KnowledgeItem::new("Solid state batteries remain in pilot production", ["https://c"]),
    ]);

    let first = refine_knowledge(&mut store, &OverlapRefiner, "battery", 0.5)
        .await
        .unwrap();
    assert!(first.is_some());
    let size = store.len();

    let second = refine_knowledge(&mut store, &OverlapRefiner, "battery", 0.5)
        .await
        .unwrap();
    assert!(second.is_none());
    assert_eq!(store.len(), size);
}

#[tokio::test]
async fn test_second_consecutive_failure_is_fatal() {
    for policy in POLICIES {
        let mut setup = Setup::new(policy);
        setup.search = Arc::new(StubSearch::failing(usize::MAX));
        let context =
            setup.build(Box::new(ScriptedSelector::new([ActionChoice::Search])));
        let (events, callback) = recorder();

        let err = run_research(context, "X", reference_time(), 1, 3, callback)
            .await
            .unwrap_err();

        assert!(matches!(err, ResearchError::Fatal { step: 0, .. }));
        let events = events.lock().unwrap();
        let errors: Vec<bool> = events
            .iter()
            .filter_map(|e| match &e.event {
                EventKind::Error { fatal, .. } => Some(*fatal),
                _ => None,
            })
            .collect();
        assert_eq!(errors, vec![false, true]);
        // 终止前发出最终状态快照，致命错误是最后一个事件
        let kinds = kinds(&events);
        assert_eq!(kinds[kinds.len() - 2..], ["research_state", "error"]);
        assert_eq!(count(&events, "generate_essay_start"), 0);
        assert_batches_well_ordered(&events);
    }
}

#[tokio::test]
async fn test_single_failure_is_retried() {
    let mut setup = Setup::new(RefinementPolicy::BeforeEnd);
    // 第一次批量搜索的两个查询都失败
    setup.search = Arc::new(StubSearch::failing(2));
    let context = setup.build(Box::new(ScriptedSelector::new([
        ActionChoice::Search,
        ActionChoice::End,
    ])));
    let (events, callback) = recorder();

    let report = run_research(context, "X", reference_time(), 1, 3, callback)
        .await
        .unwrap();

    assert_eq!(report.state.step, 1);
    let events = events.lock().unwrap();
    assert_eq!(count(&events, "error"), 1);
    // 重试复用同一个选择
    assert_eq!(selections(&events).len(), 2);
    assert_eq!(count(&events, "batch_search_start"), 2);
    assert_batches_well_ordered(&events);
}

#[tokio::test]
async fn test_report_failure_is_fatal() {
    let mut setup = Setup::new(RefinementPolicy::BeforeEnd);
    setup.writer_fails = true;
    let context = setup.build(Box::new(ScriptedSelector::new([
        ActionChoice::Search,
        ActionChoice::End,
    ])));
    let (events, callback) = recorder();

    let err = run_research(context, "X", reference_time(), 1, 3, callback)
        .await
        .unwrap_err();

    assert!(matches!(err, ResearchError::Fatal { step: 1, .. }));
    let events = events.lock().unwrap();
    let kinds = kinds(&events);
    assert_eq!(kinds[kinds.len() - 2..], ["generate_essay_start", "error"]);
    assert!(matches!(
        events.last().unwrap().event,
        EventKind::Error { fatal: true, .. }
    ));
}

fn fatal_errors(events: &[ResearchEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e.event, EventKind::Error { fatal: true, .. }))
        .count()
}

#[tokio::test]
async fn test_invalid_budget_and_goal_are_rejected() {
    let context = Setup::new(RefinementPolicy::BeforeEnd)
        .build(Box::new(ScriptedSelector::always(ActionChoice::End)));
    let (events, callback) = recorder();
    let err = run_research(context, "X", reference_time(), 5, 2, callback)
        .await
        .unwrap_err();
    assert!(matches!(err, ResearchError::InvalidInput(_)));
    {
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(fatal_errors(&events), 1);
    }

    let context = Setup::new(RefinementPolicy::BeforeEnd)
        .build(Box::new(ScriptedSelector::always(ActionChoice::End)));
    let (events, callback) = recorder();
    let err = run_research(context, "   ", reference_time(), 0, 2, callback)
        .await
        .unwrap_err();
    assert!(matches!(err, ResearchError::InvalidInput(_)));
    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(fatal_errors(&events), 1);

    assert!(StepBudget::new(2, 2).is_ok());
}

#[tokio::test]
async fn test_reference_datetime_given_as_text() {
    let context = Setup::new(RefinementPolicy::BeforeEnd).build(Box::new(ScriptedSelector::new([
        ActionChoice::Search,
        ActionChoice::End,
    ])));
    let report = run_research_at(context, "X", "2024-06-30 00:00:00", 1, 3, |_| {})
        .await
        .unwrap();
    assert_eq!(report.state.research_datetime, reference_time());

    let context = Setup::new(RefinementPolicy::BeforeEnd)
        .build(Box::new(ScriptedSelector::always(ActionChoice::End)));
    let (events, callback) = recorder();
    let err = run_research_at(context, "X", "next tuesday", 1, 3, callback)
        .await
        .unwrap_err();
    assert!(matches!(err, ResearchError::InvalidInput(_)));
    assert_eq!(fatal_errors(&events.lock().unwrap()), 1);
}

/// 每次被询问时取消调研，并选择搜索
struct CancellingSelector {
    token: CancellationToken,
}

#[async_trait]
impl AgentSelector for CancellingSelector {
    async fn select(
        &mut self,
        _state: &ResearchState,
        _budget: &StepBudget,
        _sink: &ProgressSink,
    ) -> Result<ActionChoice> {
        self.token.cancel();
        Ok(ActionChoice::Search)
    }
}

#[tokio::test]
async fn test_cancellation_returns_partial_state_between_steps() {
    let token = CancellationToken::new();
    let context = Setup::new(RefinementPolicy::BeforeEnd).build(Box::new(CancellingSelector {
        token: token.clone(),
    }));
    let (events, callback) = recorder();

    let outcome = run_research_with_cancel(context, "X", reference_time(), 3, 6, callback, token)
        .await
        .unwrap();

    let ResearchOutcome::Cancelled(state) = outcome else {
        panic!("expected a cancelled run");
    };
    // 正在进行的步骤会完成，之后不再开始新的步骤
    assert_eq!(state.step, 1);
    assert_eq!(state.searched_queries.len(), 2);
    let events = events.lock().unwrap();
    assert_eq!(events.last().unwrap().kind_name(), "research_state");
    assert_eq!(count(&events, "generate_essay_start"), 0);
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let token = CancellationToken::new();
    token.cancel();
    let context = Setup::new(RefinementPolicy::BeforeEnd)
        .build(Box::new(ScriptedSelector::always(ActionChoice::Search)));

    let outcome = run_research_with_cancel(context, "X", reference_time(), 1, 3, |_| {}, token)
        .await
        .unwrap();

    assert_eq!(outcome.state().step, 0);
    assert!(outcome.into_report().is_none());
}

#[cfg(unix)]
#[tokio::test]
async fn test_code_step_uses_retrieval_and_records_knowledge() {
    let mut setup = Setup::new(RefinementPolicy::BeforeEnd);
    setup.with_code = true;
    let context = setup.build(Box::new(ScriptedSelector::new([
        ActionChoice::Code,
        ActionChoice::End,
    ])));
    let (events, callback) = recorder();

    let report = run_research(context, "X", reference_time(), 1, 3, callback)
        .await
        .unwrap();
    let events = events.lock().unwrap();

    let retrieval = events
        .iter()
        .find_map(|e| match &e.event {
            EventKind::Retrieval {
                retrieval_result, ..
            } => Some(retrieval_result.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(retrieval.len(), 3);
    assert_eq!(retrieval.ids, vec!["api-exact", "api-near", "api-mid"]);
    assert!(retrieval.distances.windows(2).all(|w| w[0] <= w[1]));

    let code_result = events
        .iter()
        .find_map(|e| match &e.event {
            EventKind::CodeExecution { code_result } => Some(code_result.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(code_result.output["value"], 42);
    assert_eq!(code_result.output["docs"], 3);

    let items = report.state.knowledge.items_with_source("code_execution:step-1");
    assert_eq!(items.len(), 1);
    assert!(items[0].content.starts_with("compute growth:"));
}

#[tokio::test]
async fn test_code_without_interpreter_is_overridden_to_search() {
    let context = Setup::new(RefinementPolicy::BeforeEnd).build(Box::new(ScriptedSelector::new([
        ActionChoice::Code,
        ActionChoice::End,
    ])));
    let (events, callback) = recorder();

    let report = run_research(context, "X", reference_time(), 1, 3, callback)
        .await
        .unwrap();

    assert_eq!(report.state.trajectory, vec![ActionChoice::Search]);
    let events = events.lock().unwrap();
    assert_eq!(
        selections(&events)[0],
        (0, ActionChoice::Search, Some(ActionChoice::Code))
    );
}

#[tokio::test]
async fn test_events_round_trip_through_json() {
    let context = Setup::new(RefinementPolicy::BeforeEnd).build(Box::new(ScriptedSelector::new([
        ActionChoice::Search,
        ActionChoice::Read,
        ActionChoice::End,
    ])));
    let (events, callback) = recorder();

    run_research(context, "X", reference_time(), 2, 4, callback)
        .await
        .unwrap();

    for event in events.lock().unwrap().iter() {
        let json = serde_json::to_string(event).unwrap();
        let parsed: ResearchEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind_name(), event.kind_name());
    }
}
