//! 网络搜索与网页阅读

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::types::Page;

pub mod reader;
pub mod serpapi;

pub use reader::HttpPageReader;
pub use serpapi::SerpApiSearch;

/// 搜索与阅读过程中的错误
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("SerpAPI key not configured")]
    NoApiKey,

    #[error("Search request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse search results: {0}")]
    ParseError(String),

    #[error("Failed to fetch {url}: HTTP {status}")]
    HttpStatus { url: String, status: u16 },
}

/// 网络搜索后端
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// 执行一次查询，返回按相关度排列的结果页面（不含正文）
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<Page>>;
}

/// 网页阅读器
#[async_trait]
pub trait PageReader: Send + Sync {
    /// 抓取页面正文，返回填充了正文和修改时间的页面
    async fn read(&self, page: &Page) -> Result<Page>;
}
