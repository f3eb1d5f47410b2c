use serde::{Deserialize, Serialize};

/// 向量检索结果，按距离升序排列
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RetrievalResult {
    pub query: String,
    pub documents: Vec<String>,
    pub ids: Vec<String>,
    pub distances: Vec<f32>,
}

impl RetrievalResult {
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// 供提示词使用的文本形式
    pub fn text_result(&self) -> String {
        self.documents
            .iter()
            .zip(self.ids.iter())
            .zip(self.distances.iter())
            .enumerate()
            .map(|(i, ((document, id), distance))| {
                format!(
                    "Result {}:\nDocument: {}\nID: {}\nDistance: {}",
                    i + 1,
                    document,
                    id,
                    distance
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// 代码执行结果
///
/// 被执行代码内部的运行时异常记录在 `exception` 中，不视为工具失败
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CodeResult {
    pub code_str: String,
    pub stdout: String,
    /// 标准输出最后一行若为JSON，则作为结构化输出
    pub output: serde_json::Value,
    pub exception: Option<String>,
    pub exit_code: Option<i32>,
}

impl CodeResult {
    pub fn succeeded(&self) -> bool {
        self.exception.is_none()
    }
}
