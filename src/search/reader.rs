//! 基于HTTP的网页阅读器

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_TYPE, LAST_MODIFIED};
use std::time::Duration;
use tracing::debug;

use crate::config::ReaderConfig;
use crate::search::{PageReader, SearchError};
use crate::types::Page;
use crate::utils::html::{
    extract_modified_time, extract_text_from_html, extract_title, truncate_chars,
};

/// 抓取网页并提取正文、标题和修改时间
pub struct HttpPageReader {
    http: reqwest::Client,
    max_content_chars: usize,
}

impl HttpPageReader {
    pub fn from_config(config: &ReaderConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self {
            http,
            max_content_chars: config.max_content_chars,
        })
    }
}

/// 把抓取到的内容合并进页面
///
/// 页面元数据中的时间优先于 `Last-Modified` 响应头，两者都没有时保留搜索结果中的时间
pub fn enrich_page(
    page: &Page,
    body: &str,
    is_html: bool,
    last_modified: Option<DateTime<Utc>>,
    max_content_chars: usize,
) -> Page {
    let mut enriched = page.clone();
    let text = if is_html {
        if enriched.title.trim().is_empty()
            && let Some(title) = extract_title(body)
        {
            enriched.title = title;
        }
        extract_text_from_html(body)
    } else {
        body.trim().to_string()
    };
    enriched.markdown = truncate_chars(&text, max_content_chars);

    let detected = if is_html { extract_modified_time(body) } else { None };
    if let Some(modified) = detected.or(last_modified) {
        enriched.modified_time = Some(modified);
    }
    enriched
}

#[async_trait]
impl PageReader for HttpPageReader {
    async fn read(&self, page: &Page) -> Result<Page> {
        debug!(url = %page.url, "📖 读取网页");
        let response = self.http.get(&page.url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::HttpStatus {
                url: page.url.clone(),
                status: status.as_u16(),
            }
            .into());
        }

        let last_modified = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|dt| dt.with_timezone(&Utc));
        let is_html = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("html"))
            .unwrap_or(true);

        let body = response.text().await?;
        Ok(enrich_page(
            page,
            &body,
            is_html,
            last_modified,
            self.max_content_chars,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_enrich_prefers_meta_time_over_header() {
        let page = Page::new("", "https://example.com/a");
        let html = r#"<html><head><title>Report</title>
            <meta property="article:modified_time" content="2024-02-01T00:00:00Z"></head>
            <body><p>Body text</p></body></html>"#;
        let header_time = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

        let enriched = enrich_page(&page, html, true, Some(header_time), 1000);
        assert_eq!(enriched.title, "Report");
        assert!(enriched.markdown.contains("Body text"));
        assert_eq!(
            enriched.modified_time,
            Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_enrich_keeps_search_time_when_nothing_detected() {
        let search_time = Utc.with_ymd_and_hms(2023, 5, 1, 0, 0, 0).unwrap();
        let page = Page::new("Title", "https://example.com/b").with_modified_time(search_time);

        let enriched = enrich_page(&page, "plain text body", false, None, 5);
        assert_eq!(enriched.title, "Title");
        assert_eq!(enriched.markdown, "plain...");
        assert_eq!(enriched.modified_time, Some(search_time));
    }
}
