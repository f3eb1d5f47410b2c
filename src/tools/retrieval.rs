use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

use crate::errors::ToolError;
use crate::progress::ProgressSink;
use crate::retrieval::RetrievalService;
use crate::tools::{
    ParameterType, Tool, ToolArgs, ToolOutcome, ToolParameter, ToolPayload, arg_str, arg_usize,
    positive_integer,
};
use crate::types::EventKind;

pub const RETRIEVAL: &str = "retrieval";

/// 检索词最多包含的词数
const MAX_QUERY_WORDS: usize = 12;
const MAX_QUERY_CHARS: usize = 64;

static STOCK_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{6}\b").expect("内置正则表达式非法"));

/// 检索词必须是简短的关键词，不能包含股票代码之类的具体实体
fn keyword_query(value: &Value) -> Result<(), String> {
    let query = value.as_str().unwrap_or_default().trim();
    if query.is_empty() {
        return Err("检索词不能为空".to_string());
    }
    if query.split_whitespace().count() > MAX_QUERY_WORDS
        || query.chars().count() > MAX_QUERY_CHARS
    {
        return Err(format!(
            "检索词应为不超过{}个词的关键词",
            MAX_QUERY_WORDS
        ));
    }
    if STOCK_CODE.is_match(query) {
        return Err("检索词不能包含股票代码等具体实体".to_string());
    }
    Ok(())
}

/// 在向量集合中检索与关键词最接近的文档
pub struct RetrievalTool {
    service: RetrievalService,
    default_n_results: usize,
}

impl RetrievalTool {
    pub fn new(service: RetrievalService, default_n_results: usize) -> Self {
        Self {
            service,
            default_n_results,
        }
    }
}

#[async_trait]
impl Tool for RetrievalTool {
    fn code(&self) -> &'static str {
        RETRIEVAL
    }

    fn description(&self) -> &'static str {
        "Search the document collection with a short keyword query (no stock names or codes) and return the nearest documents."
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        vec![
            ToolParameter::required(
                "retrieval_query",
                "Short keyword query",
                ParameterType::String,
            )
            .with_validator(keyword_query),
            ToolParameter::optional(
                "collection",
                "Collection to search, defaults to the first loaded collection",
                ParameterType::String,
            ),
            ToolParameter::optional(
                "n_results",
                "Number of documents to return",
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
        let query = arg_str(RETRIEVAL, args, "retrieval_query")?.trim().to_string();
        let collection = args.get("collection").and_then(Value::as_str);
        let n_results = arg_usize(args, "n_results").unwrap_or(self.default_n_results);

        let retrieval_result = self.service.query(collection, &query, n_results).await?;

        sink.emit(EventKind::Retrieval {
            query,
            retrieval_result: retrieval_result.clone(),
        });
        Ok(ToolOutcome::new(
            ToolPayload::Retrieval(retrieval_result),
            "Retrieval completed",
        ))
    }
}
