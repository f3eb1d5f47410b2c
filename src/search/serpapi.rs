//! SerpAPI兼容的网页搜索

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::SearchConfig;
use crate::search::{SearchBackend, SearchError};
use crate::types::Page;
use crate::utils::html::parse_loose_datetime;

#[derive(Debug, Deserialize)]
struct SerpApiResponse {
    #[serde(default)]
    organic_results: Vec<OrganicResult>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrganicResult {
    #[serde(default)]
    title: String,
    link: Option<String>,
    #[serde(default)]
    snippet: String,
    date: Option<String>,
}

/// 通过SerpAPI的JSON接口执行网页搜索
pub struct SerpApiSearch {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    engine: String,
}

impl SerpApiSearch {
    pub fn from_config(config: &SearchConfig) -> Result<Self, SearchError> {
        if config.api_key.is_empty() {
            return Err(SearchError::NoApiKey);
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| SearchError::RequestFailed(e.to_string()))?;

        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            engine: config.engine.clone(),
        })
    }
}

/// 把搜索结果中的日期（如 `Mar 5, 2024`）解析为时间
pub fn parse_result_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    for format in ["%b %d, %Y", "%B %d, %Y", "%d %b %Y", "%Y年%m月%d日"] {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
        }
    }
    parse_loose_datetime(value)
}

fn into_pages(response: SerpApiResponse, max_results: usize) -> Vec<Page> {
    response
        .organic_results
        .into_iter()
        .filter_map(|result| {
            let link = result.link?;
            let mut page = Page::new(result.title, link).with_description(result.snippet);
            if let Some(modified) = result.date.as_deref().and_then(parse_result_date) {
                page = page.with_modified_time(modified);
            }
            Some(page)
        })
        .take(max_results)
        .collect()
}

#[async_trait]
impl SearchBackend for SerpApiSearch {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<Page>> {
        debug!(query, engine = %self.engine, "🔍 SerpAPI search");
        let num = max_results.to_string();
        let response = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("engine", self.engine.as_str()),
                ("q", query),
                ("num", num.as_str()),
                ("api_key", self.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(|e| SearchError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SearchError::HttpStatus {
                url: self.endpoint.clone(),
                status: response.status().as_u16(),
            }
            .into());
        }

        let body: SerpApiResponse = response
            .json()
            .await
            .map_err(|e| SearchError::ParseError(e.to_string()))?;
        if let Some(error) = body.error {
            return Err(SearchError::RequestFailed(error).into());
        }

        let pages = into_pages(body, max_results);
        info!(query, results = pages.len(), "✅ 搜索完成");
        Ok(pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_result_date_formats() {
        let expected = "2024-03-05T00:00:00+00:00";
        assert_eq!(parse_result_date("Mar 5, 2024").unwrap().to_rfc3339(), expected);
        assert_eq!(parse_result_date("2024-03-05").unwrap().to_rfc3339(), expected);
        assert!(parse_result_date("3 days ago").is_none());
    }

    #[test]
    fn test_into_pages_skips_results_without_link() {
        let raw = r#"{
            "organic_results": [
                {"title": "A", "link": "https://a.example", "snippet": "alpha", "date": "Jan 2, 2023"},
                {"title": "No link", "snippet": "skip"},
                {"title": "B", "link": "https://b.example", "snippet": "beta"},
                {"title": "C", "link": "https://c.example", "snippet": "gamma"}
            ]
        }"#;
        let response: SerpApiResponse = serde_json::from_str(raw).unwrap();
        let pages = into_pages(response, 2);

        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].url, "https://a.example");
        assert_eq!(pages[0].description, "alpha");
        assert!(pages[0].modified_time.is_some());
        assert_eq!(pages[1].url, "https://b.example");
        assert!(pages[1].modified_time.is_none());
    }

    #[test]
    fn test_missing_api_key() {
        let config = SearchConfig {
            api_key: String::new(),
            ..SearchConfig::default()
        };
        assert!(matches!(
            SerpApiSearch::from_config(&config),
            Err(SearchError::NoApiKey)
        ));
    }
}
