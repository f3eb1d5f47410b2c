use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::errors::ToolError;
use crate::progress::ProgressSink;
use crate::search::PageReader;
use crate::tools::{
    ParameterType, Tool, ToolArgs, ToolOutcome, ToolParameter, ToolPayload, arg_str,
    next_batch_id, non_empty_list,
};
use crate::types::{EventKind, Page, parse_research_datetime};
use crate::utils::threads::do_parallel_with_limit;

pub const BATCH_READ: &str = "batch_read";

/// 并发抓取一批页面的正文，并按参考时间过滤
pub struct BatchReadTool {
    reader: Arc<dyn PageReader>,
    max_parallels: usize,
}

impl BatchReadTool {
    pub fn new(reader: Arc<dyn PageReader>, max_parallels: usize) -> Self {
        Self {
            reader,
            max_parallels,
        }
    }
}

fn valid_datetime(value: &Value) -> Result<(), String> {
    let text = value.as_str().unwrap_or_default();
    parse_research_datetime(text)
        .map(|_| ())
        .map_err(|e| e.to_string())
}

#[async_trait]
impl Tool for BatchReadTool {
    fn code(&self) -> &'static str {
        BATCH_READ
    }

    fn description(&self) -> &'static str {
        "Fetch the full content of several pages concurrently. Pages modified after the research datetime are not allowed to be read."
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        vec![
            ToolParameter::required("pages", "Pages to read", ParameterType::PageList)
                .with_validator(non_empty_list),
            ToolParameter::required(
                "research_datetime",
                "Reference datetime; sources published later are excluded",
                ParameterType::String,
            )
            .with_validator(valid_datetime),
        ]
    }

    async fn execute(
        &self,
        args: &ToolArgs,
        sink: &ProgressSink,
    ) -> Result<ToolOutcome, ToolError> {
        let research_datetime =
            parse_research_datetime(arg_str(BATCH_READ, args, "research_datetime")?).map_err(
                |e| ToolError::validation(BATCH_READ, "research_datetime", e.to_string()),
            )?;
        let requested: Vec<Page> = args
            .get("pages")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| ToolError::validation(BATCH_READ, "pages", e.to_string()))?
            .unwrap_or_default();

        let mut seen = HashSet::new();
        let mut excluded = Vec::new();
        let mut to_fetch = Vec::new();
        for page in requested {
            if !seen.insert(page.url.clone()) {
                continue;
            }
            // 搜索结果中已经带有修改时间的页面不必抓取
            if page.is_published_after(&research_datetime) {
                excluded.push(page);
            } else {
                to_fetch.push(page);
            }
        }

        let batch_id = next_batch_id();
        sink.emit(EventKind::BatchReadStart {
            batch_id,
            pages: to_fetch.clone(),
        });

        let futures: Vec<_> = to_fetch
            .iter()
            .map(|page| {
                let reader = self.reader.clone();
                async move { reader.read(page).await }
            })
            .collect();
        let outcomes = do_parallel_with_limit(futures, self.max_parallels).await;

        let mut pages = Vec::new();
        let mut failed = Vec::new();
        let mut errors = Vec::new();
        for (page, outcome) in to_fetch.into_iter().zip(outcomes) {
            match outcome {
                Ok(enriched) if enriched.is_published_after(&research_datetime) => {
                    excluded.push(enriched);
                }
                Ok(enriched) => pages.push(enriched),
                Err(e) => {
                    warn!(batch_id, url = %page.url, "⚠️ 页面读取失败: {}", e);
                    errors.push(format!("{}: {}", page.url, e));
                    failed.push(page);
                }
            }
        }

        if !failed.is_empty() && pages.is_empty() && excluded.is_empty() {
            sink.emit(EventKind::BatchReadComplete {
                batch_id,
                pages: Vec::new(),
            });
            return Err(ToolError::Execution {
                tool: BATCH_READ.to_string(),
                message: format!("所有页面均读取失败: {}", errors.join("; ")),
            });
        }

        for page in &excluded {
            sink.emit(EventKind::PageNotAllowedToRead {
                page: page.clone(),
                research_datetime,
            });
        }
        sink.emit(EventKind::BatchReadComplete {
            batch_id,
            pages: pages.clone(),
        });

        info!(
            batch_id,
            read = pages.len(),
            excluded = excluded.len(),
            failed = failed.len(),
            "✅ 批量阅读完成"
        );
        let message = format!(
            "Read {} pages, {} not allowed to read, {} failed",
            pages.len(),
            excluded.len(),
            failed.len()
        );
        Ok(ToolOutcome::new(
            ToolPayload::BatchRead {
                batch_id,
                pages,
                excluded,
                failed,
            },
            message,
        ))
    }
}
