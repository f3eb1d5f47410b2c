use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

static SCRIPT_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style|noscript|svg)[^>]*>.*?</(script|style|noscript|svg)>")
        .expect("内置正则表达式非法")
});
static BLOCK_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)</?(p|div|br|li|ul|ol|tr|table|section|article|h[1-6]|pre|blockquote)[^>]*>")
        .expect("内置正则表达式非法")
});
static ANY_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("内置正则表达式非法"));
static BLANK_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n+").expect("内置正则表达式非法"));
static INLINE_SPACES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t\r\f]+").expect("内置正则表达式非法"));
static TITLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("内置正则表达式非法")
});
static META_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<meta\s[^>]*>").expect("内置正则表达式非法"));
static META_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)(property|name|itemprop|content)\s*=\s*["']([^"']*)["']"#)
        .expect("内置正则表达式非法")
});

/// 页面中表示修改/发布时间的元数据，按优先级排列
const TIME_META_KEYS: [&str; 5] = [
    "article:modified_time",
    "og:updated_time",
    "datemodified",
    "article:published_time",
    "datepublished",
];

/// 提取网页中的可读文本
pub fn extract_text_from_html(html: &str) -> String {
    let text = SCRIPT_STYLE.replace_all(html, " ");
    let text = BLOCK_TAG.replace_all(&text, "\n");
    let text = ANY_TAG.replace_all(&text, "");
    let text = decode_entities(&text);
    let text = INLINE_SPACES.replace_all(&text, " ");
    let lines: Vec<&str> = text.lines().map(str::trim).collect();
    BLANK_LINES
        .replace_all(&lines.join("\n"), "\n\n")
        .trim()
        .to_string()
}

/// 提取网页标题
pub fn extract_title(html: &str) -> Option<String> {
    TITLE
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| decode_entities(m.as_str()).trim().to_string())
        .filter(|t| !t.is_empty())
}

/// 从meta标签中提取页面的修改时间，优先使用修改时间，其次是发布时间
pub fn extract_modified_time(html: &str) -> Option<DateTime<Utc>> {
    let mut found: Vec<(usize, DateTime<Utc>)> = Vec::new();

    for tag in META_TAG.find_iter(html) {
        let mut key = None;
        let mut content = None;
        for attr in META_ATTR.captures_iter(tag.as_str()) {
            let value = attr[2].trim().to_string();
            if attr[1].eq_ignore_ascii_case("content") {
                content = Some(value);
            } else {
                key = Some(value.to_lowercase());
            }
        }

        if let (Some(key), Some(content)) = (key, content)
            && let Some(priority) = TIME_META_KEYS.iter().position(|k| *k == key)
            && let Some(time) = parse_loose_datetime(&content)
        {
            found.push((priority, time));
        }
    }

    found.sort_by_key(|(priority, _)| *priority);
    found.into_iter().next().map(|(_, time)| time)
}

/// 尽量宽松地解析网页中出现的时间
pub fn parse_loose_datetime(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt.and_utc());
    }
    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc());
    }
    chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// 按字符数截断文本
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
