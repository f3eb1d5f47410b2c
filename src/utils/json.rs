use anyhow::{Result, anyhow};
use serde::de::DeserializeOwned;

/// 取出回答中第一个 ```json 代码块的内容
fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after_fence = &text[start + 3..];
    let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_fence[body_start..];
    let end = body.find("```")?;
    let candidate = body[..end].trim();
    (!candidate.is_empty()).then_some(candidate)
}

/// 把模型回答解析为指定结构
///
/// 只用于不支持结构化输出的文本模型。优先解析代码块，否则从每个 `{` 或 `[`
/// 起尝试流式反序列化，取第一个能解析为 `T` 的值，前后的解释文字会被忽略
pub fn parse_llm_json<T: DeserializeOwned>(text: &str) -> Result<T> {
    if let Some(block) = fenced_block(text)
        && let Ok(value) = serde_json::from_str(block)
    {
        return Ok(value);
    }

    let mut last_error = None;
    for (start, _) in text.char_indices().filter(|(_, c)| matches!(c, '{' | '[')) {
        let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<T>();
        match stream.next() {
            Some(Ok(value)) => return Ok(value),
            Some(Err(e)) => last_error = Some(e),
            None => {}
        }
    }

    match last_error {
        Some(e) => Err(anyhow!("解析模型返回的JSON失败: {}，原文: {}", e, text)),
        None => Err(anyhow!("模型回答中没有找到JSON: {}", text)),
    }
}
