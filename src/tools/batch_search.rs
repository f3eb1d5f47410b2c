use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::errors::ToolError;
use crate::progress::ProgressSink;
use crate::search::SearchBackend;
use crate::tools::{
    ParameterType, Tool, ToolArgs, ToolOutcome, ToolParameter, ToolPayload, arg_str,
    arg_string_list, arg_usize, next_batch_id, non_empty_list, non_empty_string,
    positive_integer,
};
use crate::types::{EventKind, SearchQuery};
use crate::utils::threads::do_parallel_with_limit;

pub const BATCH_SEARCH: &str = "batch_search";

/// 围绕一个子目标并发执行多个查询
pub struct BatchSearchTool {
    backend: Arc<dyn SearchBackend>,
    max_results: usize,
    max_parallels: usize,
}

impl BatchSearchTool {
    pub fn new(backend: Arc<dyn SearchBackend>, max_results: usize, max_parallels: usize) -> Self {
        Self {
            backend,
            max_results,
            max_parallels,
        }
    }
}

#[async_trait]
impl Tool for BatchSearchTool {
    fn code(&self) -> &'static str {
        BATCH_SEARCH
    }

    fn description(&self) -> &'static str {
        "Run several web search queries for one sub-goal concurrently and return the result pages of each query."
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        vec![
            ToolParameter::required(
                "sub_goal",
                "The sub-goal these queries serve",
                ParameterType::String,
            )
            .with_validator(non_empty_string),
            ToolParameter::required(
                "query_strings",
                "Search queries to run",
                ParameterType::StringList,
            )
            .with_validator(non_empty_list),
            ToolParameter::optional(
                "max_results",
                "Maximum number of results per query",
                ParameterType::Integer,
            )
            .with_validator(positive_integer),
        ]
    }

    async fn execute(
        &self,
        args: &ToolArgs,
        sink: &ProgressSink,
    ) -> Result<ToolOutcome, ToolError> {
        let sub_goal = arg_str(BATCH_SEARCH, args, "sub_goal")?.trim().to_string();
        let mut query_strings: Vec<String> = Vec::new();
        for query in arg_string_list(BATCH_SEARCH, args, "query_strings")? {
            let query = query.trim().to_string();
            if !query.is_empty() && !query_strings.contains(&query) {
                query_strings.push(query);
            }
        }
        if query_strings.is_empty() {
            return Err(ToolError::validation(
                BATCH_SEARCH,
                "query_strings",
                "查询语句不能全部为空",
            ));
        }
        let max_results = arg_usize(args, "max_results").unwrap_or(self.max_results);

        let batch_id = next_batch_id();
        sink.emit(EventKind::BatchSearchStart {
            batch_id,
            sub_goal: sub_goal.clone(),
            query_strings: query_strings.clone(),
        });

        let futures: Vec<_> = query_strings
            .iter()
            .map(|query| {
                let backend = self.backend.clone();
                async move { backend.search(query, max_results).await }
            })
            .collect();
        let outcomes = do_parallel_with_limit(futures, self.max_parallels).await;

        let mut results = Vec::with_capacity(query_strings.len());
        let mut errors = Vec::new();
        for (query, outcome) in query_strings.iter().zip(outcomes) {
            let mut record = SearchQuery::new(query.clone(), sub_goal.clone());
            match outcome {
                Ok(pages) => record.append_results(pages),
                Err(e) => {
                    warn!(batch_id, query = %query, "⚠️ 查询失败: {}", e);
                    errors.push(format!("{}: {}", query, e));
                }
            }
            results.push(record);
        }

        sink.emit(EventKind::BatchSearchComplete {
            batch_id,
            sub_goal: sub_goal.clone(),
            results: results.clone(),
        });

        if errors.len() == query_strings.len() {
            return Err(ToolError::Execution {
                tool: BATCH_SEARCH.to_string(),
                message: format!("所有查询均失败: {}", errors.join("; ")),
            });
        }

        let page_count: usize = results.iter().map(|r| r.search_result_pages.len()).sum();
        info!(batch_id, queries = results.len(), pages = page_count, "✅ 批量搜索完成");
        Ok(ToolOutcome::new(
            ToolPayload::BatchSearch {
                batch_id,
                sub_goal,
                results,
            },
            format!(
                "Searched {} queries and found {} pages",
                query_strings.len(),
                page_count
            ),
        ))
    }
}
